//! Run report: every step outcome per stage and host

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kameo_macros::Reply;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, StepError};

/// What a step did on one host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Guard was unsatisfied and the action ran
    Applied,
    /// Guard was already satisfied, nothing mutated
    Skipped,
    /// Dry run: guard unsatisfied, action not run
    WouldApply,
    /// Guard, action, publish or dependency check failed
    Failed,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepOutcome::Applied => "changed",
            StepOutcome::Skipped => "ok",
            StepOutcome::WouldApply => "would change",
            StepOutcome::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of one step on one host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub host: String,
    pub step: String,
    pub outcome: StepOutcome,
    /// Facts written by this step
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub facts: BTreeMap<String, String>,
    /// Handlers this step queued
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggered: Vec<String>,
    /// Diagnostic text: guard reason, error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Failure did not fail the stage
    #[serde(default)]
    pub tolerated: bool,
    pub attempts: u32,
    pub duration: Duration,
}

impl StepResult {
    pub(crate) fn new(host: &str, step: &str, outcome: StepOutcome) -> Self {
        Self {
            host: host.to_string(),
            step: step.to_string(),
            outcome,
            facts: BTreeMap::new(),
            triggered: Vec::new(),
            message: None,
            error_kind: None,
            tolerated: false,
            attempts: 0,
            duration: Duration::ZERO,
        }
    }

    pub(crate) fn failed(host: &str, step: &str, error: &StepError) -> Self {
        Self {
            message: Some(error.to_string()),
            error_kind: Some(error.kind()),
            ..Self::new(host, step, StepOutcome::Failed)
        }
    }

    /// Failed and not tolerated
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.outcome == StepOutcome::Failed && !self.tolerated
    }
}

/// Result of one flushed handler on one host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerResult {
    pub host: String,
    pub handler: String,
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Terminal state of a host within one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Succeeded,
    Failed,
    /// Stopped before finishing because another host failed a fatal stage
    Cancelled,
}

/// Everything one host did during one stage
#[derive(Debug, Clone, Serialize, Deserialize, Reply)]
pub struct HostStageReport {
    pub host: String,
    pub status: HostStatus,
    pub steps: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub handlers: Vec<HandlerResult>,
    /// Host-level failure outside any step (unreachable, actor died)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HostStageReport {
    pub(crate) fn unreachable(host: &str, error: impl Into<String>) -> Self {
        Self {
            host: host.to_string(),
            status: HostStatus::Failed,
            steps: Vec::new(),
            handlers: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Step result by step name
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step == name)
    }
}

/// Terminal state of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    /// Role resolved to no (remaining) hosts
    NoHosts,
    /// An earlier stage failed under fail-fast
    NotRun,
}

/// Outcome of one stage across its hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub role: String,
    pub status: StageStatus,
    pub hosts: Vec<HostStageReport>,
    /// Hosts of the role left out because they failed an earlier stage
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<String>,
}

impl StageReport {
    pub(crate) fn empty(name: &str, role: &str, status: StageStatus) -> Self {
        Self {
            name: name.to_string(),
            role: role.to_string(),
            status,
            hosts: Vec::new(),
            excluded: Vec::new(),
        }
    }

    /// Report of one host
    #[must_use]
    pub fn host(&self, name: &str) -> Option<&HostStageReport> {
        self.hosts.iter().find(|h| h.host == name)
    }

    /// Names of hosts that failed this stage
    pub fn failed_hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts
            .iter()
            .filter(|h| h.status != HostStatus::Succeeded)
            .map(|h| h.host.as_str())
    }
}

/// Overall pipeline outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failed,
}

/// Per-host step counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSummary {
    pub applied: usize,
    pub skipped: usize,
    pub would_apply: usize,
    pub failed: usize,
}

/// Final report of a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize, Reply)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub dry_run: bool,
    pub stages: Vec<StageReport>,
    /// Fact cache at the end of the run, host → key → value
    pub facts: BTreeMap<String, BTreeMap<String, String>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    /// Whether every stage succeeded or had nothing to do
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Success
    }

    /// Stage by name
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// The first stage that failed, the one the CLI surfaces
    #[must_use]
    pub fn first_failure(&self) -> Option<&StageReport> {
        self.stages
            .iter()
            .find(|s| s.status == StageStatus::Failed)
    }

    /// All step results in execution order
    pub fn step_results(&self) -> impl Iterator<Item = &StepResult> {
        self.stages
            .iter()
            .flat_map(|s| s.hosts.iter())
            .flat_map(|h| h.steps.iter())
    }

    /// Step counts per host
    #[must_use]
    pub fn summary(&self) -> BTreeMap<String, HostSummary> {
        let mut out: BTreeMap<String, HostSummary> = BTreeMap::new();
        for result in self.step_results() {
            let entry = out.entry(result.host.clone()).or_default();
            match result.outcome {
                StepOutcome::Applied => entry.applied += 1,
                StepOutcome::Skipped => entry.skipped += 1,
                StepOutcome::WouldApply => entry.would_apply += 1,
                StepOutcome::Failed => entry.failed += 1,
            }
        }
        out
    }
}
