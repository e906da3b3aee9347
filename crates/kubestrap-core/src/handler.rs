//! Deferred, coalesced actions
//!
//! Steps queue handlers by name; each host flushes its queue once at the end
//! of a stage, running every distinct handler a single time in the order it
//! was first triggered.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::{IndexMap, IndexSet};
use tracing::{info, warn};

use crate::error::StepError;
use crate::report::{HandlerResult, StepOutcome};
use crate::step::StepContext;

/// An idempotent deferred action such as a service-manager reload
#[async_trait]
pub trait Handler: Send + Sync {
    /// Name steps use to trigger it
    fn name(&self) -> &str;

    /// Perform the action on the context's host
    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError>;
}

/// Handler definitions plus the per-host trigger queues
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: IndexMap<String, Arc<dyn Handler>>,
    pending: DashMap<String, IndexSet<String>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("pending", &self.pending)
            .finish()
    }
}

impl HandlerRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler definition, replacing one with the same name
    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    /// Builder form of [`HandlerRegistry::register`]
    #[must_use]
    pub fn with(mut self, handler: Arc<dyn Handler>) -> Self {
        self.register(handler);
        self
    }

    /// Whether `name` is defined
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Queue `name` for `host`; returns false if it was already queued
    ///
    /// Unknown names are dropped with a warning; pipelines are validated
    /// against the registry before they run.
    pub fn trigger(&self, host: &str, name: &str) -> bool {
        if !self.contains(name) {
            warn!(host, handler = name, "trigger for unregistered handler ignored");
            return false;
        }
        self.pending
            .entry(host.to_string())
            .or_default()
            .insert(name.to_string())
    }

    /// Handlers currently queued for `host`, in trigger order
    #[must_use]
    pub fn pending(&self, host: &str) -> Vec<String> {
        self.pending
            .get(host)
            .map(|queued| queued.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Run and clear everything queued for the context's host
    ///
    /// Every queued handler is attempted even if an earlier one failed. In a
    /// dry run nothing executes and each entry reports `would_apply`.
    pub async fn flush(&self, ctx: &mut StepContext<'_>) -> Vec<HandlerResult> {
        let host = ctx.host().name.clone();
        let Some((_, queued)) = self.pending.remove(&host) else {
            return Vec::new();
        };

        let mut results = Vec::with_capacity(queued.len());
        for name in queued {
            let Some(handler) = self.handlers.get(&name) else {
                continue;
            };

            if ctx.dry_run() {
                results.push(HandlerResult {
                    host: host.clone(),
                    handler: name,
                    outcome: StepOutcome::WouldApply,
                    message: None,
                });
                continue;
            }

            let (outcome, message) = match handler.run(ctx).await {
                Ok(()) => {
                    info!(host = %host, handler = %name, "handler ran");
                    (StepOutcome::Applied, None)
                }
                Err(e) => {
                    warn!(host = %host, handler = %name, error = %e, "handler failed");
                    (StepOutcome::Failed, Some(e.to_string()))
                }
            };
            results.push(HandlerResult {
                host: host.clone(),
                handler: name,
                outcome,
                message,
            });
        }
        results
    }
}
