//! APT steps (Debian/Ubuntu): packages, holds, signing keys, repositories

use std::time::Duration;

use async_trait::async_trait;
use kubestrap_core::{Guard, RetryPolicy, Step, StepContext, StepError, StepOptions};
use kubestrap_exec::ShellCommand;
use kubestrap_exec::command::quote;
use tracing::{debug, info, instrument};

use crate::shell::{self, check, holds};

/// Package installs may wait on the dpkg lock of unattended upgrades
const APT_TIMEOUT: Duration = Duration::from_secs(900);

fn apt_get(ctx: &StepContext<'_>) -> ShellCommand {
    ctx.command("apt-get")
        .env("DEBIAN_FRONTEND", "noninteractive")
}

async fn apt_update(ctx: &StepContext<'_>) -> Result<(), StepError> {
    ctx.run(&apt_get(ctx).args(["update", "-q"])).await?;
    Ok(())
}

/// Condition true when every package is installed
fn installed(packages: &[String]) -> String {
    packages
        .iter()
        .map(|p| {
            format!(
                "dpkg-query -W -f='${{Status}}' {} 2>/dev/null | grep -q 'install ok installed'",
                quote(p)
            )
        })
        .collect::<Vec<_>>()
        .join(" && ")
}

/// Ensure packages are installed
pub struct AptPackages {
    name: String,
    packages: Vec<String>,
}

impl AptPackages {
    /// Step `name` installing `packages`
    pub fn new(name: impl Into<String>, packages: Vec<String>) -> Self {
        Self {
            name: name.into(),
            packages,
        }
    }
}

#[async_trait]
impl Step for AptPackages {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> StepOptions {
        StepOptions::default()
            .timeout(APT_TIMEOUT)
            .retry(RetryPolicy::new(3, Duration::from_secs(10)))
    }

    async fn guard(&self, ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
        let done = holds(ctx, &installed(&self.packages)).await?;
        Ok(Guard::from_bool(
            done,
            format!("install {}", self.packages.join(" ")),
        ))
    }

    #[instrument(skip_all, fields(host = %ctx.host().name, packages = ?self.packages))]
    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        apt_update(ctx).await?;
        let install = apt_get(ctx)
            .args(["install", "-y", "-q", "--no-install-recommends"])
            .args(self.packages.iter().cloned());
        ctx.run(&install).await?;
        info!(count = self.packages.len(), "packages installed");
        Ok(())
    }
}

/// Pin packages at their installed version
pub struct AptHold {
    name: String,
    packages: Vec<String>,
}

impl AptHold {
    pub fn new(name: impl Into<String>, packages: Vec<String>) -> Self {
        Self {
            name: name.into(),
            packages,
        }
    }
}

#[async_trait]
impl Step for AptHold {
    fn name(&self) -> &str {
        &self.name
    }

    async fn guard(&self, ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
        let condition = self
            .packages
            .iter()
            .map(|p| format!("apt-mark showhold | grep -qxF {}", quote(p)))
            .collect::<Vec<_>>()
            .join(" && ");
        let held = holds(ctx, &condition).await?;
        Ok(Guard::from_bool(
            held,
            format!("hold {}", self.packages.join(" ")),
        ))
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let hold = ctx
            .command("apt-mark")
            .arg("hold")
            .args(self.packages.iter().cloned());
        ctx.run(&hold).await?;
        Ok(())
    }
}

/// Install an ASCII-armored repository signing key as a keyring
pub struct AptKey {
    name: String,
    url: String,
    keyring: String,
}

impl AptKey {
    /// Fetch `url` into the binary keyring at `keyring`
    pub fn new(name: impl Into<String>, url: impl Into<String>, keyring: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            keyring: keyring.into(),
        }
    }
}

#[async_trait]
impl Step for AptKey {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> StepOptions {
        StepOptions::default().retry(RetryPolicy::new(3, Duration::from_secs(5)))
    }

    async fn guard(&self, ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
        let present = holds(ctx, &format!("test -s {}", quote(&self.keyring))).await?;
        Ok(Guard::from_bool(present, format!("{} missing", self.keyring)))
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let armored = format!("/tmp/kubestrap-{}.asc", self.keyring.replace('/', "_"));
        shell::download(ctx, &self.url, &armored).await?;

        let dir = self
            .keyring
            .rsplit_once('/')
            .map_or("/etc/apt/keyrings", |(dir, _)| dir);
        let install = format!(
            "install -d -m 0755 {dir} && gpg --dearmor --batch --yes -o {keyring} {armored} && chmod 0644 {keyring}; status=$?; rm -f {armored}; exit $status",
            dir = quote(dir),
            keyring = quote(&self.keyring),
            armored = quote(&armored),
        );
        ctx.run(&ctx.script(install)).await?;
        debug!(keyring = %self.keyring, "signing key installed");
        Ok(())
    }
}

/// A one-line apt source list file
pub struct AptRepository {
    name: String,
    line: String,
    file: String,
}

impl AptRepository {
    /// Write `line` to `file` under `/etc/apt/sources.list.d`
    pub fn new(name: impl Into<String>, line: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            line: line.into(),
            file: file.into(),
        }
    }

    fn content(&self) -> String {
        format!("{}\n", self.line)
    }
}

#[async_trait]
impl Step for AptRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> StepOptions {
        StepOptions::default()
            .timeout(APT_TIMEOUT)
            .retry(RetryPolicy::new(3, Duration::from_secs(10)))
    }

    async fn guard(&self, ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
        let present = ctx
            .probe(&check(ctx, &shell::content_matches(&self.file, &self.content())))
            .await?;
        Ok(Guard::from_bool(present, format!("{} not configured", self.file)))
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let write = shell::write_file(&self.file, &self.content(), "0644");
        ctx.run(&ctx.script(write)).await?;
        apt_update(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_installed_condition() {
        let condition = installed(&["curl".to_string(), "gpg".to_string()]);
        assert_eq!(
            condition,
            "dpkg-query -W -f='${Status}' curl 2>/dev/null | grep -q 'install ok installed' && \
             dpkg-query -W -f='${Status}' gpg 2>/dev/null | grep -q 'install ok installed'"
        );
    }

    #[test]
    fn test_repository_content_has_trailing_newline() {
        let repo = AptRepository::new(
            "kubernetes repository",
            "deb https://pkgs.k8s.io/core:/stable:/v1.30/deb/ /",
            "/etc/apt/sources.list.d/kubernetes.list",
        );
        assert_eq!(repo.content(), "deb https://pkgs.k8s.io/core:/stable:/v1.30/deb/ /\n");
    }
}
