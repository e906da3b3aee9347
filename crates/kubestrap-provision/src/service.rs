//! systemd units and the handlers that reload or restart them

use async_trait::async_trait;
use kubestrap_core::{Guard, Handler, Step, StepContext, StepError};
use kubestrap_exec::command::quote;

use crate::shell::holds;

/// Handler: `systemctl daemon-reload`
pub const RELOAD_SYSTEMD: &str = "reload systemd";

/// Handler: restart the Docker daemon
pub const RESTART_DOCKER: &str = "restart docker";

/// Handler: re-read every sysctl drop-in
pub const APPLY_SYSCTL: &str = "apply sysctl";

/// Unit enabled at boot and, unless told otherwise, running
pub struct ServiceEnabled {
    name: String,
    unit: String,
    start: bool,
    daemon_reload: bool,
}

impl ServiceEnabled {
    /// Enable and start `unit`
    pub fn new(unit: impl Into<String>) -> Self {
        let unit = unit.into();
        Self {
            name: format!("enable {unit}"),
            unit,
            start: true,
            daemon_reload: false,
        }
    }

    /// Enable only; the unit is started by something else later
    #[must_use]
    pub fn enable_only(mut self) -> Self {
        self.start = false;
        self
    }

    /// Reload unit files before enabling, for units installed in the same stage
    #[must_use]
    pub fn daemon_reload(mut self) -> Self {
        self.daemon_reload = true;
        self
    }

    fn condition(&self) -> String {
        let unit = quote(&self.unit);
        if self.start {
            format!("systemctl is-enabled --quiet {unit} && systemctl is-active --quiet {unit}")
        } else {
            format!("systemctl is-enabled --quiet {unit}")
        }
    }
}

#[async_trait]
impl Step for ServiceEnabled {
    fn name(&self) -> &str {
        &self.name
    }

    async fn guard(&self, ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
        let done = holds(ctx, &self.condition()).await?;
        let reason = if self.start {
            format!("{} not enabled and running", self.unit)
        } else {
            format!("{} not enabled", self.unit)
        };
        Ok(Guard::from_bool(done, reason))
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        if self.daemon_reload {
            ctx.run(&ctx.command("systemctl").arg("daemon-reload")).await?;
        }
        let mut enable = ctx.command("systemctl").arg("enable");
        if self.start {
            enable = enable.arg("--now");
        }
        ctx.run(&enable.arg(self.unit.as_str())).await?;
        Ok(())
    }
}

/// `systemctl daemon-reload`
pub struct ReloadSystemd;

#[async_trait]
impl Handler for ReloadSystemd {
    fn name(&self) -> &str {
        RELOAD_SYSTEMD
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        ctx.run(&ctx.command("systemctl").arg("daemon-reload")).await?;
        Ok(())
    }
}

/// Restart one unit
pub struct RestartService {
    name: String,
    unit: String,
}

impl RestartService {
    /// Handler `name` restarting `unit`
    pub fn new(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
        }
    }
}

#[async_trait]
impl Handler for RestartService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let restart = ctx
            .command("systemctl")
            .arg("restart")
            .arg(self.unit.as_str());
        ctx.run(&restart).await?;
        Ok(())
    }
}

/// `sysctl --system`
pub struct ApplySysctl;

#[async_trait]
impl Handler for ApplySysctl {
    fn name(&self) -> &str {
        APPLY_SYSCTL
    }

    async fn run(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        ctx.run(&ctx.command("sysctl").arg("--system")).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition() {
        assert_eq!(
            ServiceEnabled::new("docker").condition(),
            "systemctl is-enabled --quiet docker && systemctl is-active --quiet docker"
        );
        assert_eq!(
            ServiceEnabled::new("kubelet").enable_only().condition(),
            "systemctl is-enabled --quiet kubelet"
        );
    }

    #[test]
    fn test_step_name() {
        assert_eq!(ServiceEnabled::new("cri-docker.socket").name(), "enable cri-docker.socket");
    }
}
