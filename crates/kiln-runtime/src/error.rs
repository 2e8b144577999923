//! Error types for the Kiln runtime services.

use std::time::Duration;
use thiserror::Error;

use crate::permission::Permission;

/// Errors raised synchronously by the runtime services.
///
/// Job handler failures are not represented here: they are recorded on the
/// job itself (see [`crate::jobs::JobError`]) and never returned to the
/// submitter.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Plugin attempted an operation it holds no permission for.
    #[error("Permission denied: plugin '{plugin_id}' lacks the '{permission}' permission")]
    PermissionDenied {
        plugin_id: String,
        permission: Permission,
    },

    /// The plugin's circuit breaker is open and job admission was refused.
    #[error(
        "Circuit breaker open for plugin '{plugin_id}': job rejected, recovery will be retried after {}s",
        recovery_timeout.as_secs_f64()
    )]
    CircuitOpen {
        plugin_id: String,
        recovery_timeout: Duration,
    },

    /// A capability required a host service that is not available.
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// No job with the given id is retained.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Command does not match any configured allow-list prefix.
    #[error("Command not allowed for plugin '{plugin_id}': {command}")]
    CommandNotAllowed { plugin_id: String, command: String },

    /// Command exceeded its timeout and was killed.
    #[error("Command timed out after {}s: {command}", timeout.as_secs_f64())]
    CommandTimeout { command: String, timeout: Duration },

    /// Jobs can only be scheduled from inside a tokio runtime.
    #[error("No async runtime available to schedule job '{0}'")]
    NoAsyncRuntime(String),

    /// Generic execution failure.
    #[error("Execution error: {0}")]
    ExecutionError(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML parsing error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("TOML error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_names_permission() {
        let err = RuntimeError::PermissionDenied {
            plugin_id: "lint".to_string(),
            permission: Permission::RunCommands,
        };
        let message = err.to_string();
        assert!(message.contains("'lint'"));
        assert!(message.contains("run_commands"));
    }

    #[test]
    fn test_circuit_open_message_is_actionable() {
        let err = RuntimeError::CircuitOpen {
            plugin_id: "flaky".to_string(),
            recovery_timeout: Duration::from_secs(30),
        };
        let message = err.to_string();
        assert!(message.contains("flaky"));
        assert!(message.contains("30s"));
    }
}
