//! Error types for kubestrap-exec

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during remote execution
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Failed to connect to remote host
    #[error("connection to {host} failed: {reason}")]
    ConnectionFailed {
        /// Target host
        host: String,
        /// Underlying transport error
        reason: String,
    },

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Command exited non-zero where success was required
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        /// Rendered command line
        command: String,
        /// Exit status code
        status: i32,
        /// Stderr output
        stderr: String,
    },

    /// Command did not finish within its deadline
    #[error("command timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// SSH key error
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// Process spawn error
    #[error("failed to spawn process: {0}")]
    SpawnError(String),

    /// I/O error during execution
    #[error("I/O error: {0}")]
    IoError(String),

    /// Connection not established
    #[error("not connected")]
    NotConnected,
}

impl ExecError {
    /// Transport-level failures that a retrying step may try again
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed { .. } | ExecError::Timeout { .. } | ExecError::IoError(_)
        )
    }
}
