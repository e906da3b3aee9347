//! Role resolution over a fixed host list

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::InventoryError;
use crate::types::{ALL, Host};

/// On-disk shape of an inventory
///
/// ```toml
/// roles = ["control_plane", "worker"]
///
/// [[host]]
/// name = "cp-1"
/// addr = "10.0.0.10"
/// roles = ["control_plane"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventoryFile {
    /// Roles that exist even when no host carries them yet
    #[serde(default)]
    pub roles: Vec<String>,
    /// Hosts in declaration order
    #[serde(default)]
    pub host: Vec<Host>,
}

/// Validated host set for one run
#[derive(Debug, Clone)]
pub struct Inventory {
    hosts: Vec<Host>,
    known_roles: BTreeSet<String>,
}

impl Inventory {
    /// Build and validate an inventory
    ///
    /// # Errors
    /// Fails on an empty host list, duplicate names or malformed role names
    pub fn new(hosts: Vec<Host>) -> Result<Self, InventoryError> {
        Self::with_roles(hosts, std::iter::empty::<String>())
    }

    /// Build an inventory that also knows `declared` roles, possibly empty ones
    ///
    /// # Errors
    /// Same as [`Inventory::new`]
    pub fn with_roles<I, S>(hosts: Vec<Host>, declared: I) -> Result<Self, InventoryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if hosts.is_empty() {
            return Err(InventoryError::Empty);
        }

        let mut seen = HashSet::new();
        for host in &hosts {
            if !seen.insert(host.name.as_str()) {
                return Err(InventoryError::DuplicateHost(host.name.clone()));
            }
        }

        let mut known_roles: BTreeSet<String> = declared.into_iter().map(Into::into).collect();
        known_roles.extend(hosts.iter().flat_map(|h| h.roles.iter().cloned()));
        known_roles.insert(ALL.to_string());

        if let Some(bad) = known_roles.iter().find(|r| !is_valid_role(r)) {
            return Err(InventoryError::InvalidRole(bad.clone()));
        }

        debug!(hosts = hosts.len(), roles = ?known_roles, "inventory loaded");

        Ok(Self { hosts, known_roles })
    }

    /// Parse a TOML inventory
    ///
    /// # Errors
    /// Returns `InventoryError::Parse` for malformed TOML, then validates like [`Inventory::new`]
    pub fn from_toml_str(content: &str) -> Result<Self, InventoryError> {
        let file: InventoryFile =
            toml::from_str(content).map_err(|e| InventoryError::Parse(e.to_string()))?;
        Self::from_file(file)
    }

    /// Validate an already-deserialized inventory file
    ///
    /// # Errors
    /// Same as [`Inventory::new`]
    pub fn from_file(file: InventoryFile) -> Result<Self, InventoryError> {
        Self::with_roles(file.host, file.roles)
    }

    /// All hosts in declaration order
    #[must_use]
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// Known role names, including `all`
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.known_roles.iter().map(String::as_str)
    }

    /// Whether `role` is defined
    #[must_use]
    pub fn knows_role(&self, role: &str) -> bool {
        self.known_roles.contains(role)
    }

    /// Look up one host by name
    ///
    /// # Errors
    /// Returns `InventoryError::UnknownHost` if no host has that name
    pub fn host(&self, name: &str) -> Result<&Host, InventoryError> {
        self.hosts
            .iter()
            .find(|h| h.name == name)
            .ok_or_else(|| InventoryError::UnknownHost(name.to_string()))
    }

    /// Hosts in `role`, in declaration order
    ///
    /// # Errors
    /// Returns `InventoryError::UnknownRole` for undefined roles
    pub fn resolve(&self, role: &str) -> Result<Vec<&Host>, InventoryError> {
        if !self.knows_role(role) {
            return Err(InventoryError::UnknownRole(role.to_string()));
        }
        Ok(self.hosts.iter().filter(|h| h.has_role(role)).collect())
    }

    /// First host of `role`; the designated source for role-level facts
    ///
    /// # Errors
    /// `UnknownRole` for undefined roles, `EmptyRole` when no host carries it
    pub fn representative(&self, role: &str) -> Result<&Host, InventoryError> {
        self.resolve(role)?
            .into_iter()
            .next()
            .ok_or_else(|| InventoryError::EmptyRole(role.to_string()))
    }

    /// Restrict the inventory to the hosts of `role`
    ///
    /// Role definitions are kept, so stages for other roles resolve to no hosts
    /// instead of failing.
    ///
    /// # Errors
    /// `UnknownRole` for undefined roles, `Empty` when the role has no hosts
    pub fn limit(&self, role: &str) -> Result<Self, InventoryError> {
        let hosts: Vec<Host> = self.resolve(role)?.into_iter().cloned().collect();
        if hosts.is_empty() {
            return Err(InventoryError::Empty);
        }
        Ok(Self {
            hosts,
            known_roles: self.known_roles.clone(),
        })
    }
}

fn is_valid_role(role: &str) -> bool {
    !role.is_empty()
        && role
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
