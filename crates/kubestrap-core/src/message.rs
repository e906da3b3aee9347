//! Message types for actor communication
//!
//! Message handlers are implemented in their respective actor modules.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::handler::HandlerRegistry;
use crate::stage::{Pipeline, Stage};

// ============================================================================
// HostActor Messages
// ============================================================================

/// Run every step of `stage` on the actor's host, then flush its handlers
#[derive(Debug)]
pub struct RunStage {
    /// Stage to run
    pub stage: Arc<Stage>,
    /// Handler definitions and trigger queues of the pipeline
    pub handlers: Arc<HandlerRegistry>,
    /// Set by any host of a fatal stage that failed; checked before each step
    pub cancel: Arc<AtomicBool>,
}

// ============================================================================
// OrchestratorActor Messages
// ============================================================================

/// Apply a pipeline to the inventory and report every outcome
#[derive(Debug)]
pub struct RunPipeline {
    /// Stages in execution order
    pub pipeline: Pipeline,
}
