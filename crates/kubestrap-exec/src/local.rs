//! Local command execution using `tokio::process`

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::error::ExecError;
use crate::result::CommandResult;
use crate::traits::RemoteExecutor;

/// Local command executor
///
/// Used for inventory hosts that point at the machine running kubestrap.
/// Children are killed when a deadline drops the pending future.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    /// Create a new local executor
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[instrument(skip(self), level = "debug")]
    async fn execute(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        let child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let result = CommandResult {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        };

        debug!(
            command = %cmd,
            status = result.status,
            duration = ?result.duration,
            "local command completed"
        );

        Ok(result)
    }
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.execute(cmd).await
    }

    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout_duration: Duration,
    ) -> Result<CommandResult, ExecError> {
        match timeout(timeout_duration, self.execute(cmd)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(command = %cmd, timeout = ?timeout_duration, "local command timed out");
                Err(ExecError::Timeout {
                    timeout: timeout_duration,
                })
            }
        }
    }

    fn executor_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ShellCommand;

    #[tokio::test]
    async fn test_run_success() {
        let executor = LocalExecutor::new();
        let result = executor.run("echo hello").await.unwrap();

        assert!(result.success());
        assert_eq!(result.stdout_trimmed(), "hello");
    }

    #[tokio::test]
    async fn test_run_failure_is_not_an_error() {
        let executor = LocalExecutor::new();
        let result = executor.run("exit 42").await.unwrap();

        assert!(!result.success());
        assert_eq!(result.status, 42);
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let executor = LocalExecutor::new();
        let result = executor
            .run_with_timeout("sleep 5", Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(ExecError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_exec_quotes_arguments() {
        let executor = LocalExecutor::new();
        let cmd = ShellCommand::new("printf").arg("%s|").arg("a b").arg("it's");
        let result = executor.exec(&cmd, Duration::from_secs(5)).await.unwrap();

        assert_eq!(result.stdout, "a b|it's|");
    }
}
