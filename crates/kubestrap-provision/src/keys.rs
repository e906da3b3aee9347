//! Fact keys written and read by the bootstrap steps
//!
//! Keys are namespaced by the component that produces them.

/// Primary IPv4 address of a host
pub const HOST_IP: &str = "host.ip";

/// Pod network range chosen on the control plane
pub const POD_CIDR: &str = "network.pod_cidr";

/// cri-dockerd release without the leading `v`
pub const SHIM_VERSION: &str = "shim.version";

/// `kubeadm join ...` line workers execute
pub const JOIN_COMMAND: &str = "control_plane.join_command";
