//! Permission-checked command execution.

use kiln_runtime::{Permission, PermissionSet, RuntimeError, RuntimeResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Supplies the active project's root directory, if any.
pub trait ProjectRootResolver: Send + Sync {
    fn project_root(&self) -> Option<PathBuf>;
}

/// A fixed project root (or none).
#[derive(Debug, Clone, Default)]
pub struct StaticProjectRoot {
    root: Option<PathBuf>,
}

impl StaticProjectRoot {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }
}

impl ProjectRootResolver for StaticProjectRoot {
    fn project_root(&self) -> Option<PathBuf> {
        self.root.clone()
    }
}

/// Host-wide command policy shared by every plugin's runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerPolicy {
    /// Allowed command prefixes. `None` allows any command.
    pub allowlist: Option<Vec<String>>,
    /// Timeout used when `run` is not given one.
    pub default_timeout: Duration,
}

impl Default for RunnerPolicy {
    fn default() -> Self {
        Self {
            allowlist: None,
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Shell syntax that sequences, pipes or substitutes commands.
const SHELL_CONTROL: &[&str] = &[";", "&", "|", "`", "$(", "\n", "\r"];

/// `prefix` matches when the command is exactly that prefix or continues
/// after it with whitespace. `"echo"` allows `"echo hi"` but not `"echoevil"`.
fn matches_prefix(command: &str, prefix: &str) -> bool {
    let prefix = prefix.trim();
    if prefix.is_empty() {
        return false;
    }
    match command.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with(char::is_whitespace),
        None => false,
    }
}

/// Runs shell commands on behalf of one plugin.
pub struct SecureRunner {
    plugin_id: String,
    permissions: PermissionSet,
    policy: RunnerPolicy,
    project_root: Arc<dyn ProjectRootResolver>,
}

impl SecureRunner {
    pub fn new(
        plugin_id: impl Into<String>,
        permissions: PermissionSet,
        policy: RunnerPolicy,
        project_root: Arc<dyn ProjectRootResolver>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            permissions,
            policy,
            project_root,
        }
    }

    /// With an allow-list set, a command must start with one of its entries
    /// as whole words and must not chain or substitute further commands.
    fn check_allowlist(&self, command: &str) -> RuntimeResult<()> {
        let Some(allowlist) = &self.policy.allowlist else {
            return Ok(());
        };
        let command = command.trim_start();
        let chained = SHELL_CONTROL.iter().any(|op| command.contains(op));
        if !chained && allowlist.iter().any(|prefix| matches_prefix(command, prefix)) {
            return Ok(());
        }

        warn!(plugin = %self.plugin_id, command = %command, "Command rejected by allow-list");
        Err(RuntimeError::CommandNotAllowed {
            plugin_id: self.plugin_id.clone(),
            command: command.to_string(),
        })
    }

    /// Run `command` through the platform shell.
    ///
    /// Requires `run_commands`. `cwd` defaults to the active project root;
    /// with no project this fails with `ServiceNotFound("project")`. The
    /// child is killed if `timeout` elapses.
    pub async fn run(
        &self,
        command: &str,
        cwd: Option<&Path>,
        timeout: Option<Duration>,
    ) -> RuntimeResult<CommandOutput> {
        self.permissions
            .require(&self.plugin_id, Permission::RunCommands)?;
        self.check_allowlist(command)?;

        let working_dir = match cwd {
            Some(dir) => dir.to_path_buf(),
            None => self
                .project_root
                .project_root()
                .ok_or_else(|| RuntimeError::ServiceNotFound("project".to_string()))?,
        };
        let timeout = timeout.unwrap_or(self.policy.default_timeout);

        debug!(
            plugin = %self.plugin_id,
            command = %command,
            working_dir = %working_dir.display(),
            timeout_ms = timeout.as_millis() as u64,
            "Running plugin command"
        );

        #[cfg(unix)]
        let mut cmd = Command::new("sh");
        #[cfg(unix)]
        cmd.arg("-c");

        #[cfg(windows)]
        let mut cmd = Command::new("cmd.exe");
        #[cfg(windows)]
        cmd.arg("/C");

        cmd.arg(command).current_dir(&working_dir).kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| {
                warn!(plugin = %self.plugin_id, command = %command, "Command timed out");
                RuntimeError::CommandTimeout {
                    command: command.to_string(),
                    timeout,
                }
            })??;

        let output = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        debug!(
            plugin = %self.plugin_id,
            status = ?output.status,
            stderr_len = output.stderr.len(),
            "Plugin command completed"
        );
        Ok(output)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runner(permissions: PermissionSet, policy: RunnerPolicy, root: Option<PathBuf>) -> SecureRunner {
        SecureRunner::new(
            "tool",
            permissions,
            policy,
            Arc::new(StaticProjectRoot::new(root)),
        )
    }

    fn can_run() -> PermissionSet {
        PermissionSet::new().with(Permission::RunCommands)
    }

    #[tokio::test]
    async fn test_requires_run_commands_permission() {
        let runner = runner(PermissionSet::new(), RunnerPolicy::default(), None);
        let err = runner.run("echo hi", None, None).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::PermissionDenied {
                permission: Permission::RunCommands,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_allowlist_prefixes() {
        let policy = RunnerPolicy {
            allowlist: Some(vec!["echo".to_string(), "git status".to_string()]),
            ..Default::default()
        };
        let temp_dir = TempDir::new().unwrap();
        let runner = runner(can_run(), policy, Some(temp_dir.path().to_path_buf()));

        let output = runner.run("echo allowed", None, None).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "allowed");

        let err = runner.run("rm -rf build", None, None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::CommandNotAllowed { .. }));
    }

    #[tokio::test]
    async fn test_allowlist_matches_whole_words_and_rejects_chaining() {
        let policy = RunnerPolicy {
            allowlist: Some(vec!["echo".to_string(), "git status".to_string()]),
            ..Default::default()
        };
        let temp_dir = TempDir::new().unwrap();
        let runner = runner(can_run(), policy, Some(temp_dir.path().to_path_buf()));

        for command in [
            "echoevil",
            "git statusx",
            "echo x; rm -rf ~",
            "echo a && touch pwned",
            "echo a || touch pwned",
            "echo ok | cat",
            "echo `id`",
            "echo $(id)",
            "echo a & touch pwned",
            "echo a\ntouch pwned",
        ] {
            let err = runner.run(command, None, None).await.unwrap_err();
            assert!(
                matches!(err, RuntimeError::CommandNotAllowed { .. }),
                "{command:?} should be rejected"
            );
        }
        assert!(!temp_dir.path().join("pwned").exists());

        let output = runner.run("  echo ok", None, None).await.unwrap();
        assert_eq!(output.stdout.trim(), "ok");
    }

    #[test]
    fn test_matches_prefix() {
        assert!(matches_prefix("echo", "echo"));
        assert!(matches_prefix("echo hi", "echo"));
        assert!(matches_prefix("git status -s", "git "));
        assert!(!matches_prefix("echoevil", "echo"));
        assert!(!matches_prefix("gitk", "git "));
        assert!(!matches_prefix("echo hi", "  "));
    }

    #[tokio::test]
    async fn test_defaults_cwd_to_project_root() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("marker.txt"), "x").unwrap();
        let runner = runner(
            can_run(),
            RunnerPolicy::default(),
            Some(temp_dir.path().to_path_buf()),
        );

        let output = runner.run("ls", None, None).await.unwrap();
        assert!(output.stdout.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_missing_project_without_cwd() {
        let runner = runner(can_run(), RunnerPolicy::default(), None);
        let err = runner.run("echo hi", None, None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ServiceNotFound(service) if service == "project"));

        let temp_dir = TempDir::new().unwrap();
        assert!(runner
            .run("echo hi", Some(temp_dir.path()), None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_timeout_and_exit_status() {
        let temp_dir = TempDir::new().unwrap();
        let runner = runner(
            can_run(),
            RunnerPolicy::default(),
            Some(temp_dir.path().to_path_buf()),
        );

        let err = runner
            .run("sleep 5", None, Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::CommandTimeout { .. }));

        let output = runner.run("echo oops >&2; exit 3", None, None).await.unwrap();
        assert_eq!(output.status, Some(3));
        assert!(!output.success());
        assert_eq!(output.stderr.trim(), "oops");
    }
}
