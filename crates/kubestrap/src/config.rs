//! Configuration loading and types
//!
//! One TOML file describes a whole run: run settings, cluster settings and
//! the inventory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{WrapErr, eyre};
use serde::{Deserialize, Serialize};

use kubestrap_core::{FailurePolicy, RunConfig};
use kubestrap_inventory::{Host, Inventory, InventoryFile};
use kubestrap_provision::ClusterSettings;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "KUBESTRAP_INVENTORY";

/// Top-level configuration for one kubestrap run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// How the run behaves
    #[serde(default)]
    pub run: RunSettings,
    /// What gets installed
    #[serde(default)]
    pub cluster: ClusterSettings,
    /// Roles that exist even when no host carries them
    #[serde(default)]
    pub roles: Vec<String>,
    /// Individual hosts
    #[serde(default)]
    pub host: Vec<Host>,
}

/// `[run]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Seconds a remote command may run unless the step sets its own deadline
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
    /// Seconds to establish an SSH session
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Seconds for release-metadata requests
    #[serde(default = "default_http_timeout")]
    pub http_timeout: u64,
    /// What a failed stage does to the rest of the run
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Environment variable holding a base64 SSH key for hosts without `ssh_key`
    #[serde(default)]
    pub ssh_key_env: Option<String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            command_timeout: default_command_timeout(),
            connect_timeout: default_connect_timeout(),
            http_timeout: default_http_timeout(),
            failure_policy: FailurePolicy::default(),
            ssh_key_env: None,
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_command_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_http_timeout() -> u64 {
    30
}

impl RunSettings {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout)
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read, parsed or validated
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content).wrap_err_with(|| format!("invalid config {}", path.display()))
    }

    /// Parse and validate configuration text
    ///
    /// # Errors
    /// Malformed TOML or settings the pipeline cannot use
    pub fn parse(content: &str) -> eyre::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.cluster.validate()?;
        if config.run.command_timeout == 0 {
            return Err(eyre!("run.command_timeout must be at least 1 second"));
        }
        Ok(config)
    }

    /// Find the config file: explicit path, then `KUBESTRAP_INVENTORY`
    /// (handled by clap), then the usual locations
    ///
    /// # Errors
    /// Returns error when no candidate exists
    pub fn locate(explicit: Option<PathBuf>) -> eyre::Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path);
        }

        let mut paths = vec![
            PathBuf::from("kubestrap.toml"),
            PathBuf::from("/etc/kubestrap/kubestrap.toml"),
        ];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("kubestrap/kubestrap.toml"));
        }

        paths
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| eyre!("no inventory file given and none found (set {CONFIG_ENV})"))
    }

    /// Validated inventory, optionally limited to one role
    ///
    /// # Errors
    /// Inventory validation errors, or an unknown or empty `limit` role
    pub fn inventory(&self, limit: Option<&str>) -> eyre::Result<Inventory> {
        let inventory = Inventory::from_file(InventoryFile {
            roles: self.roles.clone(),
            host: self.host.clone(),
        })?;
        match limit {
            Some(role) => inventory
                .limit(role)
                .wrap_err_with(|| format!("--limit {role}")),
            None => Ok(inventory),
        }
    }

    /// Engine settings for this run
    #[must_use]
    pub fn run_config(&self, dry_run: bool) -> RunConfig {
        RunConfig {
            dry_run,
            failure_policy: self.run.failure_policy,
            command_timeout: Duration::from_secs(self.run.command_timeout),
        }
    }
}
