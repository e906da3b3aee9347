//! `HostActor`: Per-host stage execution
//!
//! Runs the steps of a stage on one host in order, then flushes the
//! handlers those steps queued.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use kameo::actor::{ActorRef, WeakActorRef};
use kameo::error::ActorStopReason;
use kameo::message::{Context, Message};
use kameo::prelude::*;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use kubestrap_exec::{HttpFetcher, RemoteExecutor};
use kubestrap_inventory::{Host, Inventory};

use crate::config::RunConfig;
use crate::error::{CoreError, StepError};
use crate::event::RunEvent;
use crate::facts::FactCache;
use crate::handler::HandlerRegistry;
use crate::message::RunStage;
use crate::report::{HandlerResult, HostStageReport, HostStatus, StepOutcome, StepResult};
use crate::step::{Guard, Step, StepContext, StepOptions};

/// Step name under which handlers run
const HANDLER_SCOPE: &str = "handlers";

/// Arguments for spawning a `HostActor`
pub struct HostActorArgs {
    /// Host this actor drives
    pub host: Host,
    /// Remote executor (SSH or local)
    pub executor: Arc<dyn RemoteExecutor>,
    /// HTTP client for discovery steps
    pub fetcher: Arc<dyn HttpFetcher>,
    /// Inventory, for cross-host fact lookups
    pub inventory: Arc<Inventory>,
    /// Run-wide fact cache
    pub facts: Arc<FactCache>,
    /// Run settings
    pub config: RunConfig,
    /// Progress events
    pub event_tx: broadcast::Sender<RunEvent>,
}

/// Per-host actor running stages against a single machine
pub struct HostActor {
    host: Host,
    executor: Arc<dyn RemoteExecutor>,
    fetcher: Arc<dyn HttpFetcher>,
    inventory: Arc<Inventory>,
    facts: Arc<FactCache>,
    config: RunConfig,
    event_tx: broadcast::Sender<RunEvent>,
}

impl HostActor {
    /// Get the hostname
    #[must_use]
    pub fn name(&self) -> &str {
        &self.host.name
    }

    fn emit(&self, event: RunEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    fn context<'a>(&'a self, step: &'a str, options: &'a StepOptions) -> StepContext<'a> {
        StepContext::new(
            step,
            &self.host,
            &self.inventory,
            &self.facts,
            self.executor.as_ref(),
            self.fetcher.as_ref(),
            &options.outputs,
            options.timeout.unwrap_or(self.config.command_timeout),
            self.config.dry_run,
        )
    }

    /// Evaluate one step and time it
    async fn run_step(&self, step: &dyn Step, handlers: &HandlerRegistry) -> StepResult {
        let started = Instant::now();
        let options = step.options();
        let mut ctx = self.context(step.name(), &options);

        let mut result = self.evaluate(step, &options, &mut ctx, handlers).await;
        result.facts = ctx.take_written();
        result.duration = started.elapsed();
        result
    }

    async fn evaluate(
        &self,
        step: &dyn Step,
        options: &StepOptions,
        ctx: &mut StepContext<'_>,
        handlers: &HandlerRegistry,
    ) -> StepResult {
        let host = self.name();

        for req in &options.requires {
            let present = self
                .facts
                .get_from_role(&self.inventory, &req.role, &req.key)
                .is_ok_and(|value| !value.trim().is_empty());
            if present {
                continue;
            }
            let err = StepError::MissingDependency {
                role: req.role.clone(),
                key: req.key.clone(),
            };
            if self.config.dry_run {
                let mut result = StepResult::new(host, step.name(), StepOutcome::Skipped);
                result.message = Some(format!("{err}; not produced in a dry run"));
                return result;
            }
            return self.failure(step, options, &err, 0);
        }

        let guard = match step.guard(ctx).await {
            Ok(guard) => guard,
            Err(e) => return self.failure(step, options, &e, 0),
        };

        let reason = match guard {
            Guard::Satisfied => {
                if let Err(e) = step.publish(ctx).await {
                    return self.failure(step, options, &e, 0);
                }
                debug!(host, step = step.name(), "guard satisfied");
                return StepResult::new(host, step.name(), StepOutcome::Skipped);
            }
            Guard::Pending(reason) if self.config.dry_run => {
                // Queued so the flush can report which handlers would run
                for handler in &options.notify {
                    handlers.trigger(host, handler);
                }
                let mut result = StepResult::new(host, step.name(), StepOutcome::WouldApply);
                result.message = Some(reason);
                result.triggered.clone_from(&options.notify);
                return result;
            }
            Guard::Pending(reason) => reason,
        };

        info!(host, step = step.name(), reason = %reason, "applying");
        let attempts = match self.apply_with_retry(step, options, ctx).await {
            Ok(attempts) => attempts,
            Err((e, attempts)) => return self.failure(step, options, &e, attempts),
        };

        if !options.unverified {
            match step.guard(ctx).await {
                Ok(Guard::Satisfied) => {}
                Ok(Guard::Pending(still)) => {
                    let err = StepError::GuardCheck(format!("still pending after apply: {still}"));
                    return self.failure(step, options, &err, attempts);
                }
                Err(e) => return self.failure(step, options, &e, attempts),
            }
        }

        if let Err(e) = step.publish(ctx).await {
            return self.failure(step, options, &e, attempts);
        }

        for handler in &options.notify {
            if handlers.trigger(host, handler) {
                debug!(host, step = step.name(), handler = %handler, "handler queued");
            }
        }

        let mut result = StepResult::new(host, step.name(), StepOutcome::Applied);
        result.message = Some(reason);
        result.triggered.clone_from(&options.notify);
        result.attempts = attempts;
        result
    }

    /// Run the action, retrying retryable errors when the step opts in
    async fn apply_with_retry(
        &self,
        step: &dyn Step,
        options: &StepOptions,
        ctx: &mut StepContext<'_>,
    ) -> Result<u32, (StepError, u32)> {
        let max_attempts = options.retry.map_or(1, |policy| policy.attempts);
        let mut attempt = 1;
        loop {
            match step.apply(ctx).await {
                Ok(()) => return Ok(attempt),
                Err(e) if attempt < max_attempts && e.is_retryable() => {
                    let delay = options
                        .retry
                        .map(|policy| policy.delay_after(attempt))
                        .unwrap_or_default();
                    warn!(
                        host = %self.host.name,
                        step = step.name(),
                        attempt,
                        delay = ?delay,
                        error = %e,
                        "step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }

    fn failure(
        &self,
        step: &dyn Step,
        options: &StepOptions,
        err: &StepError,
        attempts: u32,
    ) -> StepResult {
        if options.tolerate_failure {
            warn!(host = %self.host.name, step = step.name(), error = %err, "step failed, tolerated");
        } else {
            error!(host = %self.host.name, step = step.name(), error = %err, "step failed");
        }
        let mut result = StepResult::failed(&self.host.name, step.name(), err);
        result.tolerated = options.tolerate_failure;
        result.attempts = attempts;
        result
    }

    async fn flush_handlers(&self, handlers: &HandlerRegistry) -> Vec<HandlerResult> {
        let options = StepOptions::default();
        let mut ctx = self.context(HANDLER_SCOPE, &options);
        handlers.flush(&mut ctx).await
    }
}

impl Actor for HostActor {
    type Args = HostActorArgs;
    type Error = CoreError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        info!(
            host = %args.host.name,
            executor = args.executor.executor_type(),
            id = %actor_ref.id(),
            "HostActor starting"
        );

        Ok(Self {
            host: args.host,
            executor: args.executor,
            fetcher: args.fetcher,
            inventory: args.inventory,
            facts: args.facts,
            config: args.config,
            event_tx: args.event_tx,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!(host = %self.host.name, reason = ?reason, "HostActor stopping");
        Ok(())
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<RunStage> for HostActor {
    type Reply = HostStageReport;

    async fn handle(&mut self, msg: RunStage, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        let stage = msg.stage;
        let host = self.host.name.clone();
        let mut steps = Vec::with_capacity(stage.steps().len());
        let mut status = HostStatus::Succeeded;

        for step in stage.steps() {
            if msg.cancel.load(Ordering::SeqCst) {
                warn!(host = %host, stage = stage.name(), "cancelled by a failure on another host");
                let result = StepResult::failed(&host, step.name(), &StepError::Cancelled);
                self.emit(RunEvent::StepFinished {
                    stage: stage.name().to_string(),
                    host: host.clone(),
                    step: result.step.clone(),
                    outcome: result.outcome,
                    message: result.message.clone(),
                });
                steps.push(result);
                status = HostStatus::Cancelled;
                break;
            }

            let result = self.run_step(step.as_ref(), &msg.handlers).await;
            self.emit(RunEvent::StepFinished {
                stage: stage.name().to_string(),
                host: host.clone(),
                step: result.step.clone(),
                outcome: result.outcome,
                message: result.message.clone(),
            });

            let fatal = result.is_fatal();
            steps.push(result);
            if fatal {
                status = HostStatus::Failed;
                break;
            }
        }

        // Whatever was applied before a failure still gets its handlers
        let handlers = self.flush_handlers(&msg.handlers).await;
        for result in &handlers {
            self.emit(RunEvent::HandlerFinished {
                stage: stage.name().to_string(),
                host: host.clone(),
                handler: result.handler.clone(),
                outcome: result.outcome,
            });
        }
        if status == HostStatus::Succeeded
            && handlers.iter().any(|h| h.outcome == StepOutcome::Failed)
        {
            status = HostStatus::Failed;
        }

        if status == HostStatus::Failed && stage.is_any_errors_fatal() {
            msg.cancel.store(true, Ordering::SeqCst);
        }

        info!(host = %host, stage = stage.name(), status = ?status, "stage finished on host");
        self.emit(RunEvent::HostFinished {
            stage: stage.name().to_string(),
            host: host.clone(),
            status,
        });

        HostStageReport {
            host,
            status,
            steps,
            handlers,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use kameo::actor::Spawn;

    use super::*;
    use crate::error::ErrorKind;
    use crate::stage::Stage;
    use crate::test_support::{FlagStep, MockExecutor, MockFetcher, NotifyingStep, RecordingHandler};

    fn spawn_actor(config: RunConfig) -> (ActorRef<HostActor>, Arc<FactCache>) {
        let host = Host::new("node1", "10.0.0.1").with_role("worker");
        let inventory = Arc::new(Inventory::new(vec![host.clone()]).expect("inventory"));
        let facts = Arc::new(FactCache::new());
        let (event_tx, _) = broadcast::channel(64);
        let actor = HostActor::spawn(HostActorArgs {
            host,
            executor: Arc::new(MockExecutor::default()),
            fetcher: Arc::new(MockFetcher::default()),
            inventory,
            facts: facts.clone(),
            config,
            event_tx,
        });
        (actor, facts)
    }

    fn run_stage(stage: Stage, handlers: HandlerRegistry) -> RunStage {
        RunStage {
            stage: Arc::new(stage),
            handlers: Arc::new(handlers),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    #[tokio::test]
    async fn test_handler_runs_once_for_many_triggers() {
        let (actor, _) = spawn_actor(RunConfig::default());
        let handler = RecordingHandler::new("reload");
        let registry = HandlerRegistry::new().with(handler.clone());

        let stage = Stage::new("config", "worker")
            .step(NotifyingStep::new("a", "reload"))
            .step(NotifyingStep::new("b", "reload"))
            .step(NotifyingStep::new("c", "reload"));

        let report = actor.ask(run_stage(stage, registry)).await.unwrap();

        assert_eq!(report.status, HostStatus::Succeeded);
        assert_eq!(report.steps.len(), 3);
        assert_eq!(handler.runs(), 1);
        assert_eq!(report.handlers.len(), 1);
        assert_eq!(report.handlers[0].outcome, StepOutcome::Applied);
    }

    #[tokio::test]
    async fn test_satisfied_step_does_not_notify() {
        let (actor, _) = spawn_actor(RunConfig::default());
        let handler = RecordingHandler::new("reload");
        let registry = HandlerRegistry::new().with(handler.clone());

        let stage = Stage::new("config", "worker").step(FlagStep::already_done("noop"));

        let report = actor.ask(run_stage(stage, registry)).await.unwrap();

        assert_eq!(report.steps[0].outcome, StepOutcome::Skipped);
        assert_eq!(handler.runs(), 0);
        assert!(report.handlers.is_empty());
    }

    #[tokio::test]
    async fn test_failed_step_stops_host_but_flushes_handlers() {
        let (actor, _) = spawn_actor(RunConfig::default());
        let handler = RecordingHandler::new("reload");
        let registry = HandlerRegistry::new().with(handler.clone());

        let stage = Stage::new("config", "worker")
            .step(NotifyingStep::new("a", "reload"))
            .step(FlagStep::failing("broken"))
            .step(FlagStep::pending("never"));

        let report = actor.ask(run_stage(stage, registry)).await.unwrap();

        assert_eq!(report.status, HostStatus::Failed);
        assert_eq!(report.steps.len(), 2);
        assert!(report.step("never").is_none());
        assert_eq!(handler.runs(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_reports_would_apply() {
        let config = RunConfig {
            dry_run: true,
            ..RunConfig::default()
        };
        let (actor, _) = spawn_actor(config);
        let handler = RecordingHandler::new("reload");
        let registry = HandlerRegistry::new().with(handler.clone());

        let pending = FlagStep::pending("install");
        let stage = Stage::new("config", "worker")
            .step(pending.clone())
            .step(NotifyingStep::new("a", "reload"));

        let report = actor.ask(run_stage(stage, registry)).await.unwrap();

        assert_eq!(report.status, HostStatus::Succeeded);
        assert!(report.steps.iter().all(|s| s.outcome == StepOutcome::WouldApply));
        assert_eq!(pending.applied(), 0);
        assert_eq!(handler.runs(), 0);
        assert_eq!(report.handlers.len(), 1);
        assert_eq!(report.handlers[0].outcome, StepOutcome::WouldApply);
    }

    struct ReadsRoleFact(&'static str);

    #[async_trait::async_trait]
    impl Step for ReadsRoleFact {
        fn name(&self) -> &str {
            "read role fact"
        }

        async fn guard(&self, ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
            ctx.role_fact(self.0, "control_plane.join_command")?;
            Ok(Guard::Satisfied)
        }

        async fn apply(&self, _ctx: &mut StepContext<'_>) -> Result<(), StepError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_role_fact_lookup_classifies_errors() {
        let (actor, _) = spawn_actor(RunConfig::default());

        let stage = Stage::new("join", "worker").step(ReadsRoleFact("etcd"));
        let report = actor.ask(run_stage(stage, HandlerRegistry::new())).await.unwrap();
        assert_eq!(report.status, HostStatus::Failed);
        assert_eq!(report.steps[0].error_kind, Some(ErrorKind::UnknownRole));

        let stage = Stage::new("join", "worker").step(ReadsRoleFact("worker"));
        let report = actor.ask(run_stage(stage, HandlerRegistry::new())).await.unwrap();
        assert_eq!(report.steps[0].error_kind, Some(ErrorKind::MissingDependency));
    }

    #[tokio::test]
    async fn test_cancel_flag_stops_before_first_step() {
        let (actor, _) = spawn_actor(RunConfig::default());
        let step = FlagStep::pending("install");
        let msg = run_stage(
            Stage::new("config", "worker").step(step.clone()),
            HandlerRegistry::new(),
        );
        msg.cancel.store(true, Ordering::SeqCst);

        let report = actor.ask(msg).await.unwrap();

        assert_eq!(report.status, HostStatus::Cancelled);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].outcome, StepOutcome::Failed);
        assert_eq!(report.steps[0].error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(step.applied(), 0);
    }
}
