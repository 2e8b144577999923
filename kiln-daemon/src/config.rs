//! Configuration file loading and management
//!
//! This module handles loading and parsing the daemon configuration from
//! `$XDG_CONFIG_HOME/kiln/config.toml`. If the configuration file doesn't
//! exist, a default configuration is created with documented comments.

use anyhow::{Context, Result};
use kiln_plugin_api::{LogLevel, RunnerPolicy};
use kiln_runtime::{CircuitBreakerConfig, EventBusConfig, JobManagerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub events: EventsConfig,
    pub jobs: JobsConfig,
    pub circuit_breaker: CircuitBreakerSection,
    pub plugins: PluginsConfig,
}

/// Daemon process configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (trace, debug, info, warn, error), used when `RUST_LOG`
    /// is not set.
    /// Default: "info"
    pub log_level: String,
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    /// Events kept in history
    /// Default: 1000
    pub max_history: usize,
}

/// Job manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobsConfig {
    /// Terminal jobs kept in history
    /// Default: 100
    pub max_history: usize,
    /// Maximum concurrently running jobs; unbounded when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    /// Time a cancelled job may keep running before it is stopped
    /// Default: 5000
    pub cancel_grace_ms: u64,
    /// Directory exports are written to when no path is given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_dir: Option<PathBuf>,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerSection {
    /// Consecutive failures that open a plugin's breaker
    /// Default: 5
    pub failure_threshold: u32,
    /// Seconds before an open breaker admits a trial job
    /// Default: 60
    pub recovery_timeout_secs: u64,
}

/// Plugin capability configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PluginsConfig {
    /// Minimum level for plugin log output
    /// Default: "info"
    pub global_floor: String,
    /// Root of per-plugin global config files; XDG config dir when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_dir: Option<PathBuf>,
    /// Active project root, used as the default command working directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_root: Option<PathBuf>,
    /// Allowed command prefixes; any command is allowed when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_allowlist: Option<Vec<String>>,
    /// Default command timeout in seconds
    /// Default: 30
    pub command_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            max_history: EventBusConfig::default().max_history,
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        let defaults = JobManagerConfig::default();
        Self {
            max_history: defaults.max_history,
            max_concurrent: defaults.max_concurrent,
            cancel_grace_ms: defaults.cancel_grace.as_millis() as u64,
            export_dir: None,
        }
    }
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            recovery_timeout_secs: defaults.recovery_timeout.as_secs(),
        }
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            global_floor: "info".to_string(),
            config_dir: None,
            project_root: None,
            command_allowlist: None,
            command_timeout_secs: RunnerPolicy::default().default_timeout.as_secs(),
        }
    }
}

impl Config {
    /// Load configuration from the specified path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default XDG config location
    ///
    /// If the configuration file doesn't exist, creates a default configuration
    /// file with documented comments.
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_file(&config_path)?;
        }

        Self::load(&config_path)
    }

    fn project_dirs() -> Result<directories::ProjectDirs> {
        directories::ProjectDirs::from("", "raibid-labs", "kiln")
            .context("Failed to determine project directories")
    }

    /// Returns `$XDG_CONFIG_HOME/kiln/config.toml`
    pub fn default_config_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    fn create_default_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, Self::default_config_content())
            .with_context(|| format!("Failed to write default config file: {}", path.display()))?;

        tracing::info!("Created default configuration file at: {}", path.display());
        Ok(())
    }

    /// Generate the default configuration file content with comments
    pub fn default_config_content() -> String {
        r#"# Kiln Daemon Configuration

[daemon]
# Log level: trace, debug, info, warn, error
# RUST_LOG takes precedence when set.
log_level = "info"

[events]
# Number of events kept in the bus history
max_history = 1000

[jobs]
# Number of finished jobs kept before the oldest are evicted
max_history = 100

# Maximum number of jobs running at once (unbounded when unset)
# max_concurrent = 8

# Milliseconds a cancelled job may keep running before it is stopped
cancel_grace_ms = 5000

# Directory used for job exports without an explicit path
# export_dir = "/path/to/exports"

[circuit_breaker]
# Consecutive job failures that stop a plugin from submitting jobs
failure_threshold = 5

# Seconds before a blocked plugin may try again with a single trial job
recovery_timeout_secs = 60

[plugins]
# Plugin log output below this level is dropped, whatever the plugin asks for
global_floor = "info"

# Where per-plugin config files live (defaults to this file's directory)
# config_dir = "/path/to/config"

# Project root used as the default working directory for plugin commands
# project_root = "/path/to/project"

# Only commands starting with one of these prefixes may run
# command_allowlist = ["git ", "cargo "]

# Default timeout for plugin commands, in seconds
command_timeout_secs = 30
"#
        .to_string()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !LOG_LEVELS.contains(&self.daemon.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log_level: {}. Must be one of: {}",
                self.daemon.log_level,
                LOG_LEVELS.join(", ")
            );
        }

        if self.events.max_history == 0 {
            anyhow::bail!("events.max_history must be greater than 0");
        }

        if self.jobs.max_history == 0 {
            anyhow::bail!("jobs.max_history must be greater than 0");
        }

        if self.jobs.max_concurrent == Some(0) {
            anyhow::bail!("jobs.max_concurrent must be greater than 0 when set");
        }

        if self.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("circuit_breaker.failure_threshold must be greater than 0");
        }

        if self.circuit_breaker.recovery_timeout_secs == 0 {
            anyhow::bail!("circuit_breaker.recovery_timeout_secs must be greater than 0");
        }

        if LogLevel::parse(&self.plugins.global_floor).is_none() {
            anyhow::bail!(
                "Invalid plugins.global_floor: {}. Must be one of: {}",
                self.plugins.global_floor,
                LOG_LEVELS.join(", ")
            );
        }

        if let Some(allowlist) = &self.plugins.command_allowlist {
            if allowlist.iter().any(|prefix| prefix.trim().is_empty()) {
                anyhow::bail!("plugins.command_allowlist entries must not be empty");
            }
        }

        if self.plugins.command_timeout_secs == 0 {
            anyhow::bail!("plugins.command_timeout_secs must be greater than 0");
        }

        Ok(())
    }

    pub fn event_bus_config(&self) -> EventBusConfig {
        EventBusConfig {
            max_history: self.events.max_history,
        }
    }

    pub fn job_manager_config(&self) -> JobManagerConfig {
        JobManagerConfig {
            max_history: self.jobs.max_history,
            max_concurrent: self.jobs.max_concurrent,
            cancel_grace: Duration::from_millis(self.jobs.cancel_grace_ms),
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            recovery_timeout: Duration::from_secs(self.circuit_breaker.recovery_timeout_secs),
        }
    }

    pub fn runner_policy(&self) -> RunnerPolicy {
        RunnerPolicy {
            allowlist: self.plugins.command_allowlist.clone(),
            default_timeout: Duration::from_secs(self.plugins.command_timeout_secs),
        }
    }

    /// Plugin log floor. Falls back to `info` for unparseable values.
    pub fn plugin_log_floor(&self) -> LogLevel {
        LogLevel::parse(&self.plugins.global_floor).unwrap_or_default()
    }

    /// Root of per-plugin global config files.
    ///
    /// Returns the configured directory or the XDG config directory.
    pub fn plugin_config_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.plugins.config_dir {
            return Ok(dir.clone());
        }
        Ok(Self::project_dirs()?.config_dir().to_path_buf())
    }

    /// Directory for exports without an explicit path.
    ///
    /// Returns the configured directory or `$XDG_DATA_HOME/kiln/exports`.
    pub fn export_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.jobs.export_dir {
            return Ok(dir.clone());
        }
        Ok(Self::project_dirs()?.data_dir().join("exports"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.events.max_history, 1000);
        assert_eq!(config.jobs.max_history, 100);
        assert_eq!(config.jobs.cancel_grace_ms, 5000);
        assert!(config.jobs.max_concurrent.is_none());
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.recovery_timeout_secs, 60);
        assert!(config.plugins.command_allowlist.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_file_content_parses() {
        let config: Config = toml::from_str(&Config::default_config_content()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_valid_config() {
        let config_content = r#"
[daemon]
log_level = "debug"

[jobs]
max_history = 20
max_concurrent = 4
cancel_grace_ms = 250

[circuit_breaker]
failure_threshold = 3
recovery_timeout_secs = 10

[plugins]
global_floor = "warning"
command_allowlist = ["git ", "cargo "]
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(config_content.as_bytes()).unwrap();

        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.events.max_history, 1000);

        let jobs = config.job_manager_config();
        assert_eq!(jobs.max_history, 20);
        assert_eq!(jobs.max_concurrent, Some(4));
        assert_eq!(jobs.cancel_grace, Duration::from_millis(250));

        let breakers = config.circuit_breaker_config();
        assert_eq!(breakers.failure_threshold, 3);
        assert_eq!(breakers.recovery_timeout, Duration::from_secs(10));

        assert_eq!(config.plugin_log_floor(), LogLevel::Warn);
        assert_eq!(
            config.runner_policy().allowlist,
            Some(vec!["git ".to_string(), "cargo ".to_string()])
        );
    }

    #[test]
    fn test_load_empty_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        let config = Config::load(temp_file.path()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.daemon.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_floor() {
        let mut config = Config::default();
        config.plugins.global_floor = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_values() {
        let mut config = Config::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.jobs.max_concurrent = Some(0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.events.max_history = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_allowlist_entry() {
        let mut config = Config::default();
        config.plugins.command_allowlist = Some(vec!["git ".to_string(), "  ".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_custom_dirs() {
        let mut config = Config::default();
        config.plugins.config_dir = Some(PathBuf::from("/etc/kiln"));
        config.jobs.export_dir = Some(PathBuf::from("/tmp/kiln-exports"));
        assert_eq!(config.plugin_config_dir().unwrap(), PathBuf::from("/etc/kiln"));
        assert_eq!(config.export_dir().unwrap(), PathBuf::from("/tmp/kiln-exports"));
    }

    #[test]
    fn test_full_config_roundtrip() {
        let mut config = Config::default();
        config.daemon.log_level = "debug".to_string();
        config.jobs.max_concurrent = Some(2);
        config.plugins.command_allowlist = Some(vec!["make".to_string()]);

        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config, deserialized);
    }
}
