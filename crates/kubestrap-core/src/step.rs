//! Step model
//!
//! A step is a stateless definition: a guard that inspects the host, an
//! action that runs only when the guard is unsatisfied, and an optional
//! publish phase that derives facts whether or not the action ran.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use kubestrap_exec::{CommandResult, FetchResponse, HttpFetcher, RemoteExecutor, ShellCommand};
use kubestrap_inventory::{Host, Inventory};
use tracing::debug;

use crate::config::RetryPolicy;
use crate::error::{FactError, StepError};
use crate::facts::FactCache;

/// Result of a guard check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// Desired state already holds
    Satisfied,
    /// Action needed, with the reason shown in the report
    Pending(String),
}

impl Guard {
    /// Pending with a reason
    pub fn pending(reason: impl Into<String>) -> Self {
        Guard::Pending(reason.into())
    }

    /// `Satisfied` when `holds`, otherwise pending with `reason`
    pub fn from_bool(holds: bool, reason: impl Into<String>) -> Self {
        if holds {
            Guard::Satisfied
        } else {
            Guard::pending(reason)
        }
    }
}

/// A fact another role must have produced before this step may run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactRequirement {
    /// Producing role; its representative host is consulted
    pub role: String,
    /// Fact key
    pub key: String,
}

/// Declarations and execution knobs of a step
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    /// Fact keys this step may write
    pub outputs: Vec<String>,
    /// Handlers queued when the action runs
    pub notify: Vec<String>,
    /// Cross-host facts that must be present and non-empty
    pub requires: Vec<FactRequirement>,
    /// A failure is recorded but does not fail the stage
    pub tolerate_failure: bool,
    /// Retry the action on retryable errors
    pub retry: Option<RetryPolicy>,
    /// Per-command deadline, overrides the run default
    pub timeout: Option<Duration>,
    /// Skip re-checking the guard after the action
    pub unverified: bool,
}

impl StepOptions {
    #[must_use]
    pub fn output(mut self, key: impl Into<String>) -> Self {
        self.outputs.push(key.into());
        self
    }

    #[must_use]
    pub fn notify(mut self, handler: impl Into<String>) -> Self {
        self.notify.push(handler.into());
        self
    }

    #[must_use]
    pub fn requires(mut self, role: impl Into<String>, key: impl Into<String>) -> Self {
        self.requires.push(FactRequirement {
            role: role.into(),
            key: key.into(),
        });
        self
    }

    #[must_use]
    pub fn tolerate_failure(mut self) -> Self {
        self.tolerate_failure = true;
        self
    }

    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn unverified(mut self) -> Self {
        self.unverified = true;
        self
    }
}

/// One idempotent unit of provisioning work
///
/// A step that only gathers facts returns [`Guard::Satisfied`] and does its
/// work in `publish`. It reports
/// [`StepOutcome::Skipped`](crate::StepOutcome::Skipped), counted as `ok`,
/// even though `publish` ran.
#[async_trait]
pub trait Step: Send + Sync {
    /// Name, unique within its stage
    fn name(&self) -> &str;

    /// Declarations; defaults to none
    fn options(&self) -> StepOptions {
        StepOptions::default()
    }

    /// Inspect the host without mutating it
    async fn guard(&self, ctx: &mut StepContext<'_>) -> Result<Guard, StepError>;

    /// Bring the host to the desired state
    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError>;

    /// Derive output facts; runs after `apply` and when the guard was satisfied
    async fn publish(&self, _ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        Ok(())
    }
}

/// Everything a step may touch while running on one host
pub struct StepContext<'a> {
    step: &'a str,
    host: &'a Host,
    inventory: &'a Inventory,
    facts: &'a FactCache,
    executor: &'a dyn RemoteExecutor,
    fetcher: &'a dyn HttpFetcher,
    outputs: &'a [String],
    timeout: Duration,
    dry_run: bool,
    written: BTreeMap<String, String>,
}

impl<'a> StepContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        step: &'a str,
        host: &'a Host,
        inventory: &'a Inventory,
        facts: &'a FactCache,
        executor: &'a dyn RemoteExecutor,
        fetcher: &'a dyn HttpFetcher,
        outputs: &'a [String],
        timeout: Duration,
        dry_run: bool,
    ) -> Self {
        Self {
            step,
            host,
            inventory,
            facts,
            executor,
            fetcher,
            outputs,
            timeout,
            dry_run,
            written: BTreeMap::new(),
        }
    }

    /// Host this step runs on
    #[must_use]
    pub fn host(&self) -> &Host {
        self.host
    }

    /// The whole inventory
    #[must_use]
    pub fn inventory(&self) -> &Inventory {
        self.inventory
    }

    /// Whether this is a dry run
    #[must_use]
    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Command deadline in effect
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// A command prefixed with `sudo` when the host user is not root
    #[must_use]
    pub fn command(&self, program: impl Into<String>) -> ShellCommand {
        ShellCommand::new(program).sudo(self.host.needs_sudo())
    }

    /// A privileged `sh -c` script
    #[must_use]
    pub fn script(&self, script: impl Into<String>) -> ShellCommand {
        ShellCommand::script(script).sudo(self.host.needs_sudo())
    }

    /// Run a command; a non-zero exit is returned, not raised
    ///
    /// # Errors
    /// `Timeout` past the deadline, `Connection` on transport failure
    pub async fn exec(&self, command: &ShellCommand) -> Result<CommandResult, StepError> {
        let line = command.render();
        debug!(host = %self.host.name, step = self.step, command = %line, "exec");
        self.executor
            .exec(command, self.timeout)
            .await
            .map_err(|e| StepError::from_exec(e, &line))
    }

    /// Run a command that must exit 0
    ///
    /// # Errors
    /// `Execution` on non-zero exit, plus everything [`StepContext::exec`] returns
    pub async fn run(&self, command: &ShellCommand) -> Result<CommandResult, StepError> {
        let line = command.render();
        self.exec(command)
            .await?
            .ensure_success(&line)
            .map_err(|e| StepError::from_exec(e, &line))
    }

    /// Run a check command: exit 0 means true, exit 1 means false
    ///
    /// # Errors
    /// `GuardCheck` for any other exit or transport failure, `Timeout` past the deadline
    pub async fn probe(&self, command: &ShellCommand) -> Result<bool, StepError> {
        let result = match self.exec(command).await {
            Ok(result) => result,
            Err(StepError::Timeout { command, timeout }) => {
                return Err(StepError::Timeout { command, timeout });
            }
            Err(e) => return Err(StepError::GuardCheck(e.to_string())),
        };
        match result.status {
            0 => Ok(true),
            1 => Ok(false),
            status => Err(StepError::GuardCheck(format!(
                "`{command}` exited with {status}: {}",
                result.stderr.trim()
            ))),
        }
    }

    /// HTTP GET through the run's fetcher
    ///
    /// # Errors
    /// `Connection` when the request cannot be made; status codes are returned as-is
    pub async fn fetch(&self, url: &str) -> Result<FetchResponse, StepError> {
        self.fetcher
            .fetch(url)
            .await
            .map_err(|e| StepError::Connection(e.to_string()))
    }

    /// Own fact
    ///
    /// # Errors
    /// `Fact(NotFound)` if unset
    pub fn fact(&self, key: &str) -> Result<String, StepError> {
        Ok(self.facts.get(&self.host.name, key)?)
    }

    /// Fact of the representative host of `role`
    ///
    /// # Errors
    /// `UnknownRole` for roles the inventory does not define, `MissingDependency`
    /// if the role has no hosts or the fact is unset
    pub fn role_fact(&self, role: &str, key: &str) -> Result<String, StepError> {
        if !self.inventory.knows_role(role) {
            return Err(StepError::UnknownRole(role.to_string()));
        }
        self.facts
            .get_from_role(self.inventory, role, key)
            .map_err(|_| StepError::MissingDependency {
                role: role.to_string(),
                key: key.to_string(),
            })
    }

    /// Write one of this step's declared output facts
    ///
    /// # Errors
    /// `Fact(Undeclared)` for keys not in the step's outputs, `Fact(Conflict)` on rewrite
    pub fn set_fact(&mut self, key: &str, value: impl Into<String>) -> Result<(), StepError> {
        if !self.outputs.iter().any(|k| k == key) {
            return Err(FactError::Undeclared {
                step: self.step.to_string(),
                key: key.to_string(),
            }
            .into());
        }
        let value = value.into();
        self.facts.put(&self.host.name, key, value.clone())?;
        self.written.insert(key.to_string(), value);
        Ok(())
    }

    pub(crate) fn take_written(&mut self) -> BTreeMap<String, String> {
        std::mem::take(&mut self.written)
    }
}
