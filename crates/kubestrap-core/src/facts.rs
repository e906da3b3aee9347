//! Run-scoped fact cache
//!
//! Facts are keyed by `(host, key)`. Each host writes only its own keys, so
//! the map never sees cross-host write contention. Reads of another host's
//! facts are safe only after the producing stage finished; the orchestrator
//! guarantees that by running stages strictly in order.

use std::collections::BTreeMap;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use kubestrap_inventory::Inventory;
use tracing::debug;

use crate::error::FactError;

/// Write-once `(host, key) → value` store shared by all host actors
#[derive(Debug, Default)]
pub struct FactCache {
    facts: DashMap<(String, String), String>,
}

impl FactCache {
    /// Empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fact
    ///
    /// Writing the value already stored is a no-op, so re-running a producing
    /// step is harmless.
    ///
    /// # Errors
    /// Returns `FactError::Conflict` if a different value is already stored
    pub fn put(
        &self,
        host: &str,
        key: &str,
        value: impl Into<String>,
    ) -> Result<(), FactError> {
        let value = value.into();
        match self.facts.entry((host.to_string(), key.to_string())) {
            Entry::Occupied(existing) if existing.get() == &value => Ok(()),
            Entry::Occupied(existing) => Err(FactError::Conflict {
                host: host.to_string(),
                key: key.to_string(),
                existing: existing.get().clone(),
                attempted: value,
            }),
            Entry::Vacant(slot) => {
                debug!(host, key, "fact set");
                slot.insert(value);
                Ok(())
            }
        }
    }

    /// Replace a fact unconditionally
    pub fn overwrite(&self, host: &str, key: &str, value: impl Into<String>) {
        debug!(host, key, "fact overwritten");
        self.facts
            .insert((host.to_string(), key.to_string()), value.into());
    }

    /// Read a fact of `host`
    ///
    /// # Errors
    /// Returns `FactError::NotFound` if unset
    pub fn get(&self, host: &str, key: &str) -> Result<String, FactError> {
        self.facts
            .get(&(host.to_string(), key.to_string()))
            .map(|v| v.value().clone())
            .ok_or_else(|| FactError::NotFound {
                host: host.to_string(),
                key: key.to_string(),
            })
    }

    /// Read a fact from the representative (first) host of `role`
    ///
    /// # Errors
    /// `FactError::Role` when the role is unknown or empty, `NotFound` when unset
    pub fn get_from_role(
        &self,
        inventory: &Inventory,
        role: &str,
        key: &str,
    ) -> Result<String, FactError> {
        let host = inventory.representative(role)?;
        self.get(&host.name, key)
    }

    /// All facts of one host
    #[must_use]
    pub fn host_facts(&self, host: &str) -> BTreeMap<String, String> {
        self.facts
            .iter()
            .filter(|entry| entry.key().0 == host)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect()
    }

    /// Ordered copy of everything, host → key → value
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        let mut out: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for entry in &self.facts {
            let (host, key) = entry.key();
            out.entry(host.clone())
                .or_default()
                .insert(key.clone(), entry.value().clone());
        }
        out
    }

    /// Number of stored facts
    #[must_use]
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    /// Whether nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}
