//! kubestrap-provision: Cluster bootstrap steps
//!
//! Concrete steps and handlers for bringing Debian/Ubuntu hosts up as a
//! kubeadm cluster with Docker and cri-dockerd, plus the seven-stage
//! pipeline that orders them.

pub mod apt;
pub mod cluster;
pub mod keys;
pub mod network;
pub mod pipeline;
pub mod service;
pub mod settings;
pub mod shim;
pub mod system;

mod shell;

pub use network::{Cidr, PodNetwork, choose_cidr};
pub use pipeline::{bootstrap_pipeline, stages};
pub use settings::{ClusterSettings, SettingsError};
