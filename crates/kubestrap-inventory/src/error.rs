//! Error types for kubestrap-inventory

use thiserror::Error;

/// Errors raised while loading or querying the inventory
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InventoryError {
    /// A stage or lookup referenced a role no host declares
    #[error("unknown role: {0}")]
    UnknownRole(String),

    /// The role exists but has no hosts to pick a representative from
    #[error("role {0} has no hosts")]
    EmptyRole(String),

    /// Lookup by name failed
    #[error("unknown host: {0}")]
    UnknownHost(String),

    /// Two hosts share a name
    #[error("duplicate host name: {0}")]
    DuplicateHost(String),

    /// Role names must be `[a-z0-9_]+`
    #[error("invalid role name: {0:?}")]
    InvalidRole(String),

    /// No hosts at all
    #[error("inventory has no hosts")]
    Empty,

    /// The inventory file could not be parsed
    #[error("inventory parse error: {0}")]
    Parse(String),
}
