//! kubestrap-inventory: hosts and roles
//!
//! Static description of the fleet for one run. Every lookup is pure; nothing
//! here touches the network.

pub mod error;
pub mod inventory;
pub mod types;

pub use error::InventoryError;
pub use inventory::{Inventory, InventoryFile};
pub use types::{ALL, CONTROL_PLANE, Host, WORKER};
