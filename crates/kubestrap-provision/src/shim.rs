//! Runtime shim (cri-dockerd): release discovery, binary, systemd units
//!
//! The shim version is not pinned. Each run asks the release feed for the
//! latest tag and stores it as a fact; the install step compares the
//! installed binary against that fact.

use std::time::Duration;

use async_trait::async_trait;
use kubestrap_core::{Guard, RetryPolicy, Step, StepContext, StepError, StepOptions};
use kubestrap_exec::command::quote;
use serde::Deserialize;
use tracing::info;

use crate::keys::SHIM_VERSION;
use crate::service::RELOAD_SYSTEMD;
use crate::settings::ClusterSettings;
use crate::shell::{self, holds};

const SHIM_BINARY: &str = "/usr/local/bin/cri-dockerd";
const UNIT_DIR: &str = "/etc/systemd/system";
const UNITS: [&str; 2] = ["cri-docker.service", "cri-docker.socket"];

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
}

/// Extract the version from release metadata, without the leading `v`
///
/// # Errors
/// A description of what is wrong with the body
pub fn parse_release_version(body: &str) -> Result<String, String> {
    let release: Release =
        serde_json::from_str(body).map_err(|e| format!("malformed release metadata: {e}"))?;
    let tag = release.tag_name.trim();
    let version = tag.strip_prefix('v').unwrap_or(tag);
    if version.is_empty() || !version.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(format!("unexpected release tag {:?}", release.tag_name));
    }
    Ok(version.to_string())
}

/// Condition: both units exist and the service starts the relocated binary
fn units_condition() -> String {
    let mut parts: Vec<String> = UNITS
        .iter()
        .map(|unit| format!("test -f {UNIT_DIR}/{unit}"))
        .collect();
    parts.push(format!("grep -qF {SHIM_BINARY} {UNIT_DIR}/{}", UNITS[0]));
    parts.join(" && ")
}

/// Look up the latest shim release
pub struct DiscoverShimVersion {
    release_url: String,
}

impl DiscoverShimVersion {
    pub fn new(settings: &ClusterSettings) -> Self {
        Self {
            release_url: settings.shim_release_url.clone(),
        }
    }
}

#[async_trait]
impl Step for DiscoverShimVersion {
    fn name(&self) -> &str {
        "discover shim version"
    }

    fn options(&self) -> StepOptions {
        StepOptions::default().output(SHIM_VERSION)
    }

    async fn guard(&self, _ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
        Ok(Guard::Satisfied)
    }

    async fn apply(&self, _ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        Ok(())
    }

    async fn publish(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let discovery = |reason: String| StepError::Discovery {
            url: self.release_url.clone(),
            reason,
        };

        let response = ctx
            .fetch(&self.release_url)
            .await
            .map_err(|e| discovery(e.to_string()))?;
        if !response.is_success() {
            return Err(discovery(format!("HTTP {}", response.status)));
        }

        let version = parse_release_version(&response.body).map_err(discovery)?;
        info!(host = %ctx.host().name, version = %version, "shim release discovered");
        ctx.set_fact(SHIM_VERSION, version)
    }
}

/// Install the discovered shim release binary
pub struct InstallShim {
    settings: ClusterSettings,
}

impl InstallShim {
    pub fn new(settings: &ClusterSettings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }
}

#[async_trait]
impl Step for InstallShim {
    fn name(&self) -> &str {
        "install shim"
    }

    fn options(&self) -> StepOptions {
        StepOptions::default().retry(RetryPolicy::new(3, Duration::from_secs(5)))
    }

    async fn guard(&self, ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
        let version = ctx.fact(SHIM_VERSION)?;
        let condition = format!(
            "{SHIM_BINARY} --version 2>&1 | grep -qF {}",
            quote(&version)
        );
        let installed = holds(ctx, &condition).await?;
        Ok(Guard::from_bool(
            installed,
            format!("cri-dockerd {version} not installed"),
        ))
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let version = ctx.fact(SHIM_VERSION)?;
        let url = self
            .settings
            .shim_url(&self.settings.shim_download_url, &version);
        let archive = "/tmp/kubestrap-cri-dockerd.tgz";
        shell::download(ctx, &url, archive).await?;

        let unpack = format!(
            "dir=$(mktemp -d) && tar -xzf {archive} -C \"$dir\" && install -m 0755 \"$dir\"/cri-dockerd/cri-dockerd {SHIM_BINARY}; status=$?; rm -rf \"$dir\" {archive}; exit $status"
        );
        ctx.run(&ctx.script(unpack)).await?;
        info!(host = %ctx.host().name, version = %version, "shim installed");
        Ok(())
    }
}

/// systemd service and socket units for the shim
pub struct ShimUnits {
    settings: ClusterSettings,
}

impl ShimUnits {
    pub fn new(settings: &ClusterSettings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }
}

#[async_trait]
impl Step for ShimUnits {
    fn name(&self) -> &str {
        "install shim units"
    }

    fn options(&self) -> StepOptions {
        StepOptions::default()
            .notify(RELOAD_SYSTEMD)
            .retry(RetryPolicy::new(3, Duration::from_secs(5)))
    }

    async fn guard(&self, ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
        let present = holds(ctx, &units_condition()).await?;
        Ok(Guard::from_bool(
            present,
            format!("cri-dockerd units missing or not pointing at {SHIM_BINARY}"),
        ))
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let version = ctx.fact(SHIM_VERSION)?;
        let base = self
            .settings
            .shim_url(&self.settings.shim_units_url, &version);
        for unit in UNITS {
            let url = format!("{}/{unit}", base.trim_end_matches('/'));
            let staged = format!("/tmp/kubestrap-{unit}");
            shell::download(ctx, &url, &staged).await?;
            let place = format!(
                "install -m 0644 {staged} {UNIT_DIR}/{unit}; status=$?; rm -f {staged}; exit $status"
            );
            ctx.run(&ctx.script(place)).await?;
        }

        // Upstream units expect the binary under /usr/bin
        let relocate = format!(
            "sed -i 's,/usr/bin/cri-dockerd,{SHIM_BINARY},' {UNIT_DIR}/{}",
            UNITS[0]
        );
        ctx.run(&ctx.script(relocate)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_release_version() {
        assert_eq!(
            parse_release_version(r#"{"tag_name": "v0.3.14", "name": "v0.3.14"}"#).unwrap(),
            "0.3.14"
        );
        assert_eq!(
            parse_release_version(r#"{"tag_name": "0.4.0"}"#).unwrap(),
            "0.4.0"
        );
    }

    #[test]
    fn test_units_condition_checks_binary_path() {
        assert_eq!(
            units_condition(),
            "test -f /etc/systemd/system/cri-docker.service \
             && test -f /etc/systemd/system/cri-docker.socket \
             && grep -qF /usr/local/bin/cri-dockerd /etc/systemd/system/cri-docker.service"
        );
    }

    #[test]
    fn test_parse_release_version_rejects_garbage() {
        assert!(parse_release_version("<html>rate limited</html>").is_err());
        assert!(parse_release_version(r#"{"name": "v1"}"#).is_err());
        assert!(parse_release_version(r#"{"tag_name": "v"}"#).is_err());
        assert!(parse_release_version(r#"{"tag_name": "nightly"}"#).is_err());
    }
}
