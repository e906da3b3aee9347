//! Progress events broadcast while a pipeline runs

use serde::{Deserialize, Serialize};

use crate::report::{HostStatus, RunOutcome, StageStatus, StepOutcome};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    StageStarted {
        stage: String,
        hosts: Vec<String>,
    },
    StepFinished {
        stage: String,
        host: String,
        step: String,
        outcome: StepOutcome,
        message: Option<String>,
    },
    HandlerFinished {
        stage: String,
        host: String,
        handler: String,
        outcome: StepOutcome,
    },
    HostFinished {
        stage: String,
        host: String,
        status: HostStatus,
    },
    StageFinished {
        stage: String,
        status: StageStatus,
    },
    RunFinished {
        outcome: RunOutcome,
    },
}
