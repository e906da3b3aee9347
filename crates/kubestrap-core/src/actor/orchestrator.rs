//! `OrchestratorActor`: Pipeline-wide orchestration
//!
//! Owns one `HostActor` per inventory host and drives stages over them in
//! order. A stage finishes on every targeted host before the next starts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use chrono::Utc;
use kameo::actor::{ActorRef, Spawn, WeakActorRef};
use kameo::error::ActorStopReason;
use kameo::message::{Context, Message};
use kameo::prelude::*;
use tokio::sync::broadcast;
use tracing::{error, info, instrument, warn};

use kubestrap_exec::{ExecError, HttpFetcher, RemoteExecutor};
use kubestrap_inventory::{Host, Inventory};

use crate::actor::host::{HostActor, HostActorArgs};
use crate::config::{FailurePolicy, RunConfig};
use crate::error::CoreError;
use crate::event::RunEvent;
use crate::facts::FactCache;
use crate::handler::HandlerRegistry;
use crate::message::{RunPipeline, RunStage};
use crate::report::{
    HostStageReport, HostStatus, RunOutcome, RunReport, StageReport, StageStatus,
};
use crate::stage::{Pipeline, Stage};

/// Factory for per-host executors
///
/// Allows injection of SSH, local or mock executors per host.
#[async_trait::async_trait]
pub trait ExecutorFactory: Send + Sync {
    /// Create a remote executor for the given host
    ///
    /// # Errors
    /// A host whose executor cannot be created is reported unreachable
    async fn create_executor(&self, host: &Host) -> Result<Arc<dyn RemoteExecutor>, ExecError>;
}

/// Arguments for spawning an `OrchestratorActor`
pub struct OrchestratorActorArgs {
    /// Target hosts and roles
    pub inventory: Arc<Inventory>,
    /// Factory for creating host executors
    pub factory: Arc<dyn ExecutorFactory>,
    /// HTTP client shared by all hosts
    pub fetcher: Arc<dyn HttpFetcher>,
    /// Run settings
    pub config: RunConfig,
    /// Progress events
    pub event_tx: broadcast::Sender<RunEvent>,
}

/// Pipeline orchestrator managing all host actors
pub struct OrchestratorActor {
    inventory: Arc<Inventory>,
    /// Registry of host actors by hostname
    hosts: HashMap<String, ActorRef<HostActor>>,
    /// Hosts without an executor, with the reason
    unreachable: HashMap<String, String>,
    facts: Arc<FactCache>,
    config: RunConfig,
    event_tx: broadcast::Sender<RunEvent>,
}

impl OrchestratorActor {
    /// Get event receiver
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.event_tx.subscribe()
    }

    /// Get number of reachable hosts
    #[must_use]
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    fn emit(&self, event: RunEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Run one stage on every targeted host not excluded by earlier failures
    #[instrument(skip_all, fields(stage = stage.name(), role = stage.role()))]
    async fn run_stage(
        &self,
        stage: &Arc<Stage>,
        handlers: &Arc<HandlerRegistry>,
        excluded: &HashSet<String>,
    ) -> Result<StageReport, CoreError> {
        let mut targets = self.inventory.resolve(stage.role())?;
        if stage.is_representative_only() {
            // Resolution order puts the representative first
            targets.truncate(1);
        }
        let mut report = StageReport::empty(stage.name(), stage.role(), StageStatus::Succeeded);

        let mut active = Vec::with_capacity(targets.len());
        for host in targets {
            if excluded.contains(&host.name) {
                report.excluded.push(host.name.clone());
            } else {
                active.push(host.name.clone());
            }
        }

        if active.is_empty() {
            info!("no hosts to run on");
            report.status = StageStatus::NoHosts;
            self.emit(RunEvent::StageFinished {
                stage: stage.name().to_string(),
                status: report.status,
            });
            return Ok(report);
        }

        info!(hosts = active.len(), serial = stage.is_serial(), "stage starting");
        self.emit(RunEvent::StageStarted {
            stage: stage.name().to_string(),
            hosts: active.clone(),
        });

        let cancel = Arc::new(AtomicBool::new(false));
        let message = |stage: &Arc<Stage>| RunStage {
            stage: stage.clone(),
            handlers: handlers.clone(),
            cancel: cancel.clone(),
        };

        if stage.is_serial() {
            for name in &active {
                let host_report = match self.hosts.get(name) {
                    Some(actor) => match actor.ask(message(stage)).await {
                        Ok(host_report) => host_report,
                        Err(e) => HostStageReport::unreachable(name, e.to_string()),
                    },
                    None => self.unreachable_report(stage.name(), name),
                };
                report.hosts.push(host_report);
            }
        } else {
            let mut handles = Vec::with_capacity(active.len());
            for name in &active {
                let handle = self.hosts.get(name).map(|actor| {
                    let actor = actor.clone();
                    let msg = message(stage);
                    tokio::spawn(async move { actor.ask(msg).await.map_err(|e| e.to_string()) })
                });
                handles.push((name, handle));
            }

            // Wait for every host; one failure does not abort the others
            for (name, handle) in handles {
                let host_report = match handle {
                    Some(handle) => match handle.await {
                        Ok(Ok(host_report)) => host_report,
                        Ok(Err(e)) => HostStageReport::unreachable(name, e),
                        Err(e) => {
                            error!(host = %name, error = %e, "host task panicked");
                            HostStageReport::unreachable(name, format!("host task failed: {e}"))
                        }
                    },
                    None => self.unreachable_report(stage.name(), name),
                };
                report.hosts.push(host_report);
            }
        }

        if report.hosts.iter().any(|h| h.status != HostStatus::Succeeded) {
            report.status = StageStatus::Failed;
        }

        info!(status = ?report.status, "stage finished");
        self.emit(RunEvent::StageFinished {
            stage: stage.name().to_string(),
            status: report.status,
        });

        Ok(report)
    }

    fn unreachable_report(&self, stage: &str, name: &str) -> HostStageReport {
        let reason = self
            .unreachable
            .get(name)
            .map_or("no executor for host", String::as_str);
        self.emit(RunEvent::HostFinished {
            stage: stage.to_string(),
            host: name.to_string(),
            status: HostStatus::Failed,
        });
        HostStageReport::unreachable(name, reason)
    }
}

impl Actor for OrchestratorActor {
    type Args = OrchestratorActorArgs;
    type Error = CoreError;

    async fn on_start(args: Self::Args, actor_ref: ActorRef<Self>) -> Result<Self, Self::Error> {
        info!(
            id = %actor_ref.id(),
            hosts = args.inventory.hosts().len(),
            dry_run = args.config.dry_run,
            "OrchestratorActor starting"
        );

        let facts = Arc::new(FactCache::new());
        let mut hosts = HashMap::new();
        let mut unreachable = HashMap::new();

        for host in args.inventory.hosts() {
            match args.factory.create_executor(host).await {
                Ok(executor) => {
                    let actor_ref = HostActor::spawn(HostActorArgs {
                        host: host.clone(),
                        executor,
                        fetcher: args.fetcher.clone(),
                        inventory: args.inventory.clone(),
                        facts: facts.clone(),
                        config: args.config.clone(),
                        event_tx: args.event_tx.clone(),
                    });
                    info!(host = %host.name, "spawned HostActor");
                    hosts.insert(host.name.clone(), actor_ref);
                }
                Err(e) => {
                    error!(host = %host.name, error = %e, "could not create executor");
                    unreachable.insert(host.name.clone(), e.to_string());
                }
            }
        }

        Ok(Self {
            inventory: args.inventory,
            hosts,
            unreachable,
            facts,
            config: args.config,
            event_tx: args.event_tx,
        })
    }

    async fn on_stop(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        reason: ActorStopReason,
    ) -> Result<(), Self::Error> {
        info!(reason = ?reason, "OrchestratorActor stopping");

        // Stop all host actors
        for (name, actor_ref) in &self.hosts {
            info!(host = %name, "stopping HostActor");
            actor_ref.stop_gracefully().await.ok();
        }

        Ok(())
    }
}

// ============================================================================
// Message Handlers
// ============================================================================

impl Message<RunPipeline> for OrchestratorActor {
    type Reply = Result<RunReport, CoreError>;

    async fn handle(
        &mut self,
        msg: RunPipeline,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let pipeline = msg.pipeline;
        pipeline.validate(&self.inventory)?;

        let started_at = Utc::now();
        let mut stages = Vec::with_capacity(pipeline.stages().len());
        let mut excluded: HashSet<String> = HashSet::new();
        let mut aborted = false;

        info!(
            stages = pipeline.stages().len(),
            policy = ?self.config.failure_policy,
            "starting pipeline"
        );

        for stage in pipeline.stages() {
            if aborted {
                stages.push(StageReport::empty(
                    stage.name(),
                    stage.role(),
                    StageStatus::NotRun,
                ));
                continue;
            }

            let report = self.run_stage(stage, pipeline.handlers(), &excluded).await?;
            if report.status == StageStatus::Failed {
                match self.config.failure_policy {
                    FailurePolicy::FailFast => {
                        warn!(stage = stage.name(), "stage failed, skipping remaining stages");
                        aborted = true;
                    }
                    FailurePolicy::ContinueUnaffected => {
                        let failed: Vec<String> =
                            report.failed_hosts().map(str::to_string).collect();
                        warn!(stage = stage.name(), hosts = ?failed, "excluding failed hosts from later stages");
                        excluded.extend(failed);
                    }
                }
            }
            stages.push(report);
        }

        let outcome = if stages.iter().any(|s| s.status == StageStatus::Failed) {
            RunOutcome::Failed
        } else {
            RunOutcome::Success
        };
        info!(outcome = ?outcome, "pipeline finished");
        self.emit(RunEvent::RunFinished { outcome });

        Ok(RunReport {
            outcome,
            dry_run: self.config.dry_run,
            stages,
            facts: self.facts.snapshot(),
            started_at,
            finished_at: Utc::now(),
        })
    }
}

/// Spawn an orchestrator, run `pipeline` to completion and stop it again
///
/// The pipeline is validated against the inventory before any host is
/// contacted.
///
/// # Errors
/// Validation errors, or `ActorError` if the orchestrator died
pub async fn run_pipeline(
    args: OrchestratorActorArgs,
    pipeline: Pipeline,
) -> Result<RunReport, CoreError> {
    pipeline.validate(&args.inventory)?;

    let orchestrator = OrchestratorActor::spawn(args);
    let result = orchestrator
        .ask(RunPipeline { pipeline })
        .await
        .map_err(|e| CoreError::ActorError(e.to_string()));
    orchestrator.stop_gracefully().await.ok();
    result
}
