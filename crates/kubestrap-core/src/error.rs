//! Core error types for kubestrap-core

use std::time::Duration;

use kubestrap_exec::ExecError;
use kubestrap_inventory::InventoryError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable classification of a step failure, carried into the run report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownRole,
    Discovery,
    Download,
    GuardCheck,
    Execution,
    Connection,
    Timeout,
    MissingDependency,
    Fact,
    Cancelled,
}

/// Fact cache violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FactError {
    /// No value for `(host, key)`
    #[error("fact {key} not set on {host}")]
    NotFound {
        /// Host the fact was looked up on
        host: String,
        /// Fact key
        key: String,
    },

    /// A second, different value for a write-once fact
    #[error("fact {key} on {host} already set to {existing:?}, refusing {attempted:?}")]
    Conflict {
        /// Host owning the fact
        host: String,
        /// Fact key
        key: String,
        /// Value already stored
        existing: String,
        /// Rejected value
        attempted: String,
    },

    /// A step wrote a key it did not declare as output
    #[error("step {step} wrote undeclared fact {key}")]
    Undeclared {
        /// Offending step
        step: String,
        /// Fact key
        key: String,
    },

    /// Role-level lookup could not pick a representative host
    #[error(transparent)]
    Role(#[from] InventoryError),
}

/// Failure of a single step or handler on a single host
///
/// Never crosses the executor boundary as an `Err`; it is folded into the
/// step result.
#[derive(Error, Debug, Clone)]
pub enum StepError {
    /// Pipeline referenced a role the inventory does not define
    #[error("unknown role: {0}")]
    UnknownRole(String),

    /// Release or version lookup failed
    #[error("discovery from {url} failed: {reason}")]
    Discovery {
        /// Queried URL
        url: String,
        /// What went wrong
        reason: String,
    },

    /// Artifact download failed
    #[error("download of {url} failed: {reason}")]
    Download {
        /// Artifact URL
        url: String,
        /// What went wrong
        reason: String,
    },

    /// The idempotency check itself could not be evaluated
    #[error("guard check failed: {0}")]
    GuardCheck(String),

    /// Remote command exited non-zero
    #[error("`{command}` exited with {status}: {stderr}")]
    Execution {
        /// Rendered command
        command: String,
        /// Exit status
        status: i32,
        /// Trimmed stderr
        stderr: String,
    },

    /// Transport to the host failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Remote operation exceeded its deadline
    #[error("`{command}` timed out after {timeout:?}")]
    Timeout {
        /// Rendered command
        command: String,
        /// Deadline that was exceeded
        timeout: Duration,
    },

    /// A fact produced on another host is absent or empty
    #[error("missing dependency: fact {key} from role {role}")]
    MissingDependency {
        /// Producing role
        role: String,
        /// Fact key
        key: String,
    },

    /// Fact cache violation
    #[error(transparent)]
    Fact(#[from] FactError),

    /// Stopped because another host failed a stage marked fatal
    #[error("cancelled")]
    Cancelled,
}

impl StepError {
    /// Classify for the report
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::UnknownRole(_) => ErrorKind::UnknownRole,
            StepError::Discovery { .. } => ErrorKind::Discovery,
            StepError::Download { .. } => ErrorKind::Download,
            StepError::GuardCheck(_) => ErrorKind::GuardCheck,
            StepError::Execution { .. } => ErrorKind::Execution,
            StepError::Connection(_) => ErrorKind::Connection,
            StepError::Timeout { .. } => ErrorKind::Timeout,
            StepError::MissingDependency { .. } => ErrorKind::MissingDependency,
            StepError::Fact(_) => ErrorKind::Fact,
            StepError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether an opted-in retry may try again
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Execution
                | ErrorKind::Connection
                | ErrorKind::Timeout
                | ErrorKind::Download
                | ErrorKind::Discovery
        )
    }

    /// Map an executor error for `command`
    #[must_use]
    pub fn from_exec(err: ExecError, command: &str) -> Self {
        match err {
            ExecError::Timeout { timeout } => StepError::Timeout {
                command: command.to_string(),
                timeout,
            },
            ExecError::CommandFailed {
                command,
                status,
                stderr,
            } => StepError::Execution {
                command,
                status,
                stderr,
            },
            other => StepError::Connection(other.to_string()),
        }
    }
}

/// Errors that abort a run before any step executes
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// Stage or dependency references an undefined role
    #[error("stage {stage} references unknown role {role}")]
    UnknownRole {
        /// Stage name
        stage: String,
        /// Role name
        role: String,
    },

    /// A step notifies a handler nobody registered
    #[error("step {step} notifies unregistered handler {handler}")]
    UnknownHandler {
        /// Step name
        step: String,
        /// Handler name
        handler: String,
    },

    /// Stage names must be unique
    #[error("duplicate stage name: {0}")]
    DuplicateStage(String),

    /// Inventory lookup failed
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    /// Actor communication error
    #[error("actor communication error: {0}")]
    ActorError(String),
}
