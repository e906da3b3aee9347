//! kubestrap-core: Actor framework and provisioning engine
//!
//! Implements the `OrchestratorActor` and `HostActor` using kameo framework.
//! Contains the step model, fact cache, handlers, stages and the run report.

pub mod actor;
pub mod config;
pub mod error;
pub mod event;
pub mod facts;
pub mod handler;
pub mod message;
pub mod report;
pub mod stage;
pub mod step;

#[cfg(test)]
pub(crate) mod test_support;

pub use actor::host::{HostActor, HostActorArgs};
pub use actor::orchestrator::{
    ExecutorFactory, OrchestratorActor, OrchestratorActorArgs, run_pipeline,
};
pub use config::{FailurePolicy, RetryPolicy, RunConfig};
pub use error::{CoreError, ErrorKind, FactError, StepError};
pub use event::RunEvent;
pub use facts::FactCache;
pub use handler::{Handler, HandlerRegistry};
pub use message::{RunPipeline, RunStage};
pub use report::{
    HandlerResult, HostStageReport, HostStatus, HostSummary, RunOutcome, RunReport, StageReport,
    StageStatus, StepOutcome, StepResult,
};
pub use stage::{Pipeline, Stage};
pub use step::{FactRequirement, Guard, Step, StepContext, StepOptions};
