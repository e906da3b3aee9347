//! In-memory steps, handlers and transports for unit tests

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kubestrap_exec::{
    CommandResult, ExecError, FetchError, FetchResponse, HttpFetcher, RemoteExecutor,
};

use crate::error::StepError;
use crate::handler::Handler;
use crate::step::{Guard, Step, StepContext, StepOptions};

/// Executor that answers every command with exit 0
#[derive(Default)]
pub struct MockExecutor;

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn run(&self, _cmd: &str) -> Result<CommandResult, ExecError> {
        Ok(CommandResult::new(0, "ok", ""))
    }

    async fn run_with_timeout(
        &self,
        cmd: &str,
        _timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        self.run(cmd).await
    }

    fn executor_type(&self) -> &'static str {
        "mock"
    }
}

/// Fetcher that returns an empty 200 for every URL
#[derive(Default)]
pub struct MockFetcher;

#[async_trait]
impl HttpFetcher for MockFetcher {
    async fn fetch(&self, _url: &str) -> Result<FetchResponse, FetchError> {
        Ok(FetchResponse {
            status: 200,
            body: String::new(),
        })
    }
}

/// Step whose state is a flag; `apply` sets it
#[derive(Clone)]
pub struct FlagStep {
    name: String,
    done: Arc<AtomicBool>,
    fails: bool,
    applied: Arc<AtomicU32>,
}

impl FlagStep {
    fn build(name: &str, done: bool, fails: bool) -> Self {
        Self {
            name: name.to_string(),
            done: Arc::new(AtomicBool::new(done)),
            fails,
            applied: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn pending(name: &str) -> Self {
        Self::build(name, false, false)
    }

    pub fn already_done(name: &str) -> Self {
        Self::build(name, true, false)
    }

    pub fn failing(name: &str) -> Self {
        Self::build(name, false, true)
    }

    pub fn applied(&self) -> u32 {
        self.applied.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Step for FlagStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn guard(&self, _ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
        Ok(Guard::from_bool(self.done.load(Ordering::SeqCst), "flag unset"))
    }

    async fn apply(&self, _ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        self.applied.fetch_add(1, Ordering::SeqCst);
        if self.fails {
            return Err(StepError::Execution {
                command: "false".to_string(),
                status: 1,
                stderr: "boom".to_string(),
            });
        }
        self.done.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Pending step that notifies one handler when applied
pub struct NotifyingStep {
    inner: FlagStep,
    handler: String,
}

impl NotifyingStep {
    pub fn new(name: &str, handler: &str) -> Self {
        Self {
            inner: FlagStep::pending(name),
            handler: handler.to_string(),
        }
    }
}

#[async_trait]
impl Step for NotifyingStep {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn options(&self) -> StepOptions {
        StepOptions::default().notify(self.handler.clone())
    }

    async fn guard(&self, ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
        self.inner.guard(ctx).await
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        self.inner.apply(ctx).await
    }
}

/// Handler counting its runs
pub struct RecordingHandler {
    name: String,
    runs: AtomicU32,
}

impl RecordingHandler {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            runs: AtomicU32::new(0),
        })
    }

    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, _ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
