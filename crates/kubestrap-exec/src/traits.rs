//! Remote executor trait

use std::time::Duration;

use async_trait::async_trait;

use crate::command::ShellCommand;
use crate::error::ExecError;
use crate::result::CommandResult;

/// A channel for running commands on one host
///
/// Implementations return `Ok` for any command that ran to completion,
/// including non-zero exits; `Err` is reserved for transport failures and timeouts.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a command line without a deadline
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError>;

    /// Run a command line, failing with `ExecError::Timeout` past the deadline
    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError>;

    /// Run a structured command with quoted arguments under a deadline
    async fn exec(
        &self,
        command: &ShellCommand,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        self.run_with_timeout(&command.render(), timeout).await
    }

    /// Whether a session is currently held open
    fn is_connected(&self) -> bool {
        true
    }

    /// Short label for logs ("local", "ssh", "mock")
    fn executor_type(&self) -> &'static str;
}
