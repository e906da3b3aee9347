//! Inventory type definitions

use std::collections::BTreeSet;
use std::time::Duration;

use kubestrap_exec::ConnectionInfo;
use serde::{Deserialize, Serialize};

/// Universal role, every host belongs to it implicitly
pub const ALL: &str = "all";
/// Hosts that run the cluster control plane
pub const CONTROL_PLANE: &str = "control_plane";
/// Hosts joined as worker nodes
pub const WORKER: &str = "worker";

/// One managed machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Unique name used in reports and as the fact-cache key
    pub name: String,
    /// IP address or DNS name used to connect
    pub addr: String,
    /// SSH user
    #[serde(default = "default_user")]
    pub user: String,
    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to SSH private key, falls back to `~/.ssh/id_*`
    #[serde(default)]
    pub ssh_key: Option<String>,
    /// Role membership
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

fn default_user() -> String {
    "root".to_string()
}

fn default_port() -> u16 {
    22
}

impl Host {
    /// Create a host with default connection settings and no roles
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            user: default_user(),
            port: default_port(),
            ssh_key: None,
            roles: BTreeSet::new(),
        }
    }

    /// Add a role
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Set the SSH user
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Whether the host is in `role`; always true for `all`
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        role == ALL || self.roles.contains(role)
    }

    /// Whether commands should run on this machine instead of over SSH
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self.addr.as_str(), "localhost" | "127.0.0.1" | "::1")
    }

    /// Whether commands need a `sudo` prefix
    #[must_use]
    pub fn needs_sudo(&self) -> bool {
        self.user != "root"
    }

    /// SSH connection parameters
    #[must_use]
    pub fn connection_info(&self, connect_timeout: Duration) -> ConnectionInfo {
        let info = ConnectionInfo::new(&self.addr, &self.user)
            .with_port(self.port)
            .with_connect_timeout(connect_timeout);
        match &self.ssh_key {
            Some(key) => info.with_ssh_key(key),
            None => info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_role_is_implicit() {
        let host = Host::new("cp-1", "10.0.0.10").with_role(CONTROL_PLANE);
        assert!(host.has_role(ALL));
        assert!(host.has_role(CONTROL_PLANE));
        assert!(!host.has_role(WORKER));
    }

    #[test]
    fn test_sudo_only_for_non_root() {
        assert!(!Host::new("a", "10.0.0.1").needs_sudo());
        assert!(Host::new("b", "10.0.0.2").with_user("ubuntu").needs_sudo());
    }

    #[test]
    fn test_connection_info_carries_key() {
        let mut host = Host::new("w-1", "10.0.0.11");
        host.ssh_key = Some("/keys/cluster".to_string());
        host.port = 2200;
        let info = host.connection_info(Duration::from_secs(5));
        assert_eq!(info.port, 2200);
        assert_eq!(info.ssh_key.as_deref(), Some("/keys/cluster"));
    }
}
