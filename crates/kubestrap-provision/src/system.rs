//! Host configuration steps: managed files, swap, kernel modules

use async_trait::async_trait;
use kubestrap_core::{Guard, Step, StepContext, StepError, StepOptions};
use kubestrap_exec::command::quote;
use tracing::info;

use crate::shell::{self, holds};

/// A file whose whole content is owned by the pipeline
pub struct ManagedFile {
    name: String,
    path: String,
    content: String,
    mode: String,
    notify: Option<String>,
}

impl ManagedFile {
    /// Step `name` keeping `path` at exactly `content`, mode 0644
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            content: content.into(),
            mode: "0644".to_string(),
            notify: None,
        }
    }

    /// Queue `handler` whenever the file is rewritten
    #[must_use]
    pub fn notify(mut self, handler: impl Into<String>) -> Self {
        self.notify = Some(handler.into());
        self
    }

    /// Kernel modules loaded at boot
    pub fn modules_load(path: impl Into<String>, modules: &[String]) -> Self {
        let content: String = modules.iter().map(|m| format!("{m}\n")).collect();
        Self::new("kernel modules at boot", path, content)
    }

    /// A sysctl drop-in with one `key = value` per line
    pub fn sysctl<'a, I>(path: impl Into<String>, settings: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let content: String = settings
            .into_iter()
            .map(|(key, value)| format!("{key} = {value}\n"))
            .collect();
        Self::new("sysctl settings", path, content)
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }
}

#[async_trait]
impl Step for ManagedFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> StepOptions {
        match &self.notify {
            Some(handler) => StepOptions::default().notify(handler.clone()),
            None => StepOptions::default(),
        }
    }

    async fn guard(&self, ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
        let current = holds(ctx, &shell::content_matches(&self.path, &self.content)).await?;
        Ok(Guard::from_bool(current, format!("{} differs", self.path)))
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let write = shell::write_file(&self.path, &self.content, &self.mode);
        ctx.run(&ctx.script(write)).await?;
        info!(host = %ctx.host().name, path = %self.path, "file written");
        Ok(())
    }
}

/// Turn swap off now and keep it off across reboots
pub struct DisableSwap;

/// No active swap and no uncommented swap entry in fstab
const SWAP_OFF: &str =
    "! swapon --noheadings --show | grep -q . && ! grep -Eq '^[^#].*[[:space:]]swap[[:space:]]' /etc/fstab";

#[async_trait]
impl Step for DisableSwap {
    fn name(&self) -> &str {
        "disable swap"
    }

    async fn guard(&self, ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
        let off = holds(ctx, SWAP_OFF).await?;
        Ok(Guard::from_bool(off, "swap enabled"))
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let script = r"swapoff -a && sed -i -E 's/^([^#].*[[:space:]]swap[[:space:]].*)$/# \1/' /etc/fstab";
        ctx.run(&ctx.script(script)).await?;
        Ok(())
    }
}

/// Load kernel modules into the running kernel
pub struct LoadKernelModules {
    modules: Vec<String>,
}

impl LoadKernelModules {
    pub fn new(modules: Vec<String>) -> Self {
        Self { modules }
    }

    fn loaded_condition(&self) -> String {
        self.modules
            .iter()
            .map(|m| format!("grep -q {} /proc/modules", quote(&format!("^{m} "))))
            .collect::<Vec<_>>()
            .join(" && ")
    }
}

#[async_trait]
impl Step for LoadKernelModules {
    fn name(&self) -> &str {
        "load kernel modules"
    }

    async fn guard(&self, ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
        let loaded = holds(ctx, &self.loaded_condition()).await?;
        Ok(Guard::from_bool(
            loaded,
            format!("load {}", self.modules.join(" ")),
        ))
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        for module in &self.modules {
            ctx.run(&ctx.command("modprobe").arg(module.as_str())).await?;
        }
        Ok(())
    }
}
