use async_trait::async_trait;
use keeper_core::{ExecutionError, ResourceId, SecretBytes};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use tracing::{debug, info};
use uuid::Uuid;

/// A validated command, ready for the privileged side.
#[derive(Debug, Clone)]
pub struct ExecutorCommand {
    pub request_id: Uuid,
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Credentials delivered as environment variables. Redacted in `Debug`.
    pub secret_env: Vec<(String, SecretBytes)>,
    /// Resources the request's tokens resolved to, by token name.
    pub resources: BTreeMap<String, ResourceId>,
}

/// What the executor observed when the command finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutorOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// The privileged side of the broker.
///
/// Implementations must stop the spawned work promptly when the returned
/// future is dropped; that is how broker timeouts cancel execution.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run the command. A command that ran and failed is `Ok` with a non-zero
    /// exit code; `Err` means the command could not be run at all.
    async fn execute(&self, command: ExecutorCommand) -> Result<ExecutorOutput, ExecutionError>;
}

/// Runs commands as local child processes.
pub struct ProcessExecutor {
    max_output_bytes: usize,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self {
            max_output_bytes: 1_000_000,
        }
    }
}

impl ProcessExecutor {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(&self, command: ExecutorCommand) -> Result<ExecutorOutput, ExecutionError> {
        info!(
            request_id = %command.request_id,
            program = %command.program,
            args = command.args.len(),
            "Spawning command"
        );

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        for (var, secret) in &command.secret_env {
            let value = std::str::from_utf8(secret.expose()).map_err(|_| {
                ExecutionError::CommandFailed(format!("credential for {var} is not valid UTF-8"))
            })?;
            cmd.env(var, value);
        }

        let output = cmd.output().await.map_err(|e| {
            ExecutionError::CommandFailed(format!("failed to spawn {}: {e}", command.program))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            request_id = %command.request_id,
            exit_code = ?output.status.code(),
            stdout_bytes = output.stdout.len(),
            "Command finished"
        );

        Ok(ExecutorOutput {
            exit_code: output.status.code(),
            stdout: truncate_output(&stdout, self.max_output_bytes),
            stderr: truncate_output(&stderr, self.max_output_bytes / 10),
        })
    }
}

pub(crate) fn truncate_output(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut cut = max_len;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... [truncated, {} total bytes]", &s[..cut], s.len())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn command(program: &str, args: &[&str]) -> ExecutorCommand {
        ExecutorCommand {
            request_id: Uuid::new_v4(),
            program: program.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            env: HashMap::new(),
            working_dir: None,
            secret_env: Vec::new(),
            resources: BTreeMap::new(),
        }
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "ééééé";
        let out = truncate_output(s, 3);
        assert!(out.starts_with('é'));
        assert!(out.contains("truncated"));
        assert_eq!(truncate_output("short", 10), "short");
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut cmd = command("restic", &["backup"]);
        cmd.secret_env
            .push(("RESTIC_PASSWORD".to_string(), SecretBytes::from("p@ss")));
        let rendered = format!("{cmd:?}");
        assert!(rendered.contains("RESTIC_PASSWORD"));
        assert!(!rendered.contains("p@ss"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_echo() {
        let out = ProcessExecutor::default()
            .execute(command("echo", &["hello"]))
            .await
            .unwrap();
        assert!(out.succeeded());
        assert!(out.stdout.contains("hello"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_nonzero_exit_is_ok() {
        let out = ProcessExecutor::default()
            .execute(command("sh", &["-c", "echo locked >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert!(out.stderr.contains("locked"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_secret_env_delivered() {
        let mut cmd = command("sh", &["-c", "test \"$RESTIC_PASSWORD\" = 'p@ss'"]);
        cmd.secret_env
            .push(("RESTIC_PASSWORD".to_string(), SecretBytes::from("p@ss")));
        let out = ProcessExecutor::default().execute(cmd).await.unwrap();
        assert!(out.succeeded());
    }

    #[tokio::test]
    async fn test_missing_program_is_command_failed() {
        let err = ProcessExecutor::default()
            .execute(command("/definitely/not/a/program", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::CommandFailed(_)));
    }
}
