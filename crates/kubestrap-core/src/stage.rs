//! Stages and the pipeline they form

use std::collections::HashSet;
use std::sync::Arc;

use kubestrap_inventory::Inventory;

use crate::error::CoreError;
use crate::handler::HandlerRegistry;
use crate::step::Step;

/// Ordered steps applied to every host of one role
pub struct Stage {
    name: String,
    role: String,
    steps: Vec<Arc<dyn Step>>,
    serial: bool,
    any_errors_fatal: bool,
    representative_only: bool,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("role", &self.role)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("serial", &self.serial)
            .field("any_errors_fatal", &self.any_errors_fatal)
            .field("representative_only", &self.representative_only)
            .finish()
    }
}

impl Stage {
    /// Empty stage for `role`
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            steps: Vec::new(),
            serial: false,
            any_errors_fatal: false,
            representative_only: false,
        }
    }

    /// Append a step
    #[must_use]
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Append a shared step
    #[must_use]
    pub fn shared_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// Run hosts one after another instead of in parallel
    #[must_use]
    pub fn serial(mut self) -> Self {
        self.serial = true;
        self
    }

    /// First failure cancels hosts that have not finished
    #[must_use]
    pub fn any_errors_fatal(mut self) -> Self {
        self.any_errors_fatal = true;
        self
    }

    /// Run only on the role's representative (first) host
    ///
    /// For work exactly one host may do, such as creating the cluster. The
    /// other hosts of the role are not targeted at all.
    #[must_use]
    pub fn representative_only(mut self) -> Self {
        self.representative_only = true;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn role(&self) -> &str {
        &self.role
    }

    #[must_use]
    pub fn steps(&self) -> &[Arc<dyn Step>] {
        &self.steps
    }

    #[must_use]
    pub fn is_serial(&self) -> bool {
        self.serial
    }

    #[must_use]
    pub fn is_any_errors_fatal(&self) -> bool {
        self.any_errors_fatal
    }

    #[must_use]
    pub fn is_representative_only(&self) -> bool {
        self.representative_only
    }
}

/// Totally ordered stages plus the handlers their steps may trigger
#[derive(Debug, Default)]
pub struct Pipeline {
    stages: Vec<Arc<Stage>>,
    handlers: Arc<HandlerRegistry>,
}

impl Pipeline {
    /// Pipeline over `handlers` with no stages yet
    #[must_use]
    pub fn new(handlers: HandlerRegistry) -> Self {
        Self {
            stages: Vec::new(),
            handlers: Arc::new(handlers),
        }
    }

    /// Append the next stage
    #[must_use]
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    #[must_use]
    pub fn stages(&self) -> &[Arc<Stage>] {
        &self.stages
    }

    #[must_use]
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Check roles, handler names and stage names before anything runs
    ///
    /// # Errors
    /// `UnknownRole`, `UnknownHandler` or `DuplicateStage`
    pub fn validate(&self, inventory: &Inventory) -> Result<(), CoreError> {
        let mut names = HashSet::new();
        for stage in &self.stages {
            if !names.insert(stage.name()) {
                return Err(CoreError::DuplicateStage(stage.name().to_string()));
            }
            if !inventory.knows_role(stage.role()) {
                return Err(CoreError::UnknownRole {
                    stage: stage.name().to_string(),
                    role: stage.role().to_string(),
                });
            }
            for step in stage.steps() {
                let options = step.options();
                if let Some(handler) = options.notify.iter().find(|h| !self.handlers.contains(h)) {
                    return Err(CoreError::UnknownHandler {
                        step: step.name().to_string(),
                        handler: handler.clone(),
                    });
                }
                if let Some(req) = options
                    .requires
                    .iter()
                    .find(|r| !inventory.knows_role(&r.role))
                {
                    return Err(CoreError::UnknownRole {
                        stage: stage.name().to_string(),
                        role: req.role.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
