//! Cluster settings: versions, package sets, download locations

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::{Cidr, PodNetwork};

/// Invalid cluster settings
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    /// Not an IPv4 network in `a.b.c.d/n` form
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    /// Kubernetes version must be `major.minor`
    #[error("invalid kubernetes version {0:?}, expected major.minor")]
    InvalidVersion(String),

    /// Any other rejected field
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending key
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Everything the bootstrap pipeline needs besides the inventory
///
/// Every key is optional in the config file; missing keys take the
/// defaults below. URL templates may contain `{version}` and `{arch}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Kubernetes minor release, e.g. `1.30`
    pub kubernetes_version: String,
    /// Installed on every host before anything else
    pub prerequisite_packages: Vec<String>,
    /// Container runtime packages
    pub runtime_packages: Vec<String>,
    /// Cluster tools, held at their installed version
    pub cluster_packages: Vec<String>,
    /// Kubernetes apt repository, `{version}` is the minor release
    pub kubernetes_repo: String,
    /// Release metadata of the runtime shim (JSON with `tag_name`)
    pub shim_release_url: String,
    /// Shim release tarball
    pub shim_download_url: String,
    /// Directory holding the shim's systemd units
    pub shim_units_url: String,
    /// CRI socket passed to kubeadm
    pub shim_socket: String,
    /// Debian architecture name
    pub arch: String,
    /// Pod range unless the control plane lives inside it
    pub pod_cidr_default: Cidr,
    /// Pod range used when it does
    pub pod_cidr_alternate: Cidr,
    /// Network plugin manifest applied after init
    pub network_plugin_manifest: String,
    /// User that gets a kubeconfig; defaults to each host's SSH user
    pub admin_user: Option<String>,
    /// Loaded now and at boot
    pub kernel_modules: Vec<String>,
    /// Written to a sysctl drop-in, in order
    pub sysctl: IndexMap<String, String>,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        let network = PodNetwork::default();
        Self {
            kubernetes_version: "1.30".to_string(),
            prerequisite_packages: strings(&[
                "apt-transport-https",
                "ca-certificates",
                "curl",
                "gpg",
            ]),
            runtime_packages: strings(&["docker.io"]),
            cluster_packages: strings(&["kubelet", "kubeadm", "kubectl"]),
            kubernetes_repo: "https://pkgs.k8s.io/core:/stable:/v{version}/deb/".to_string(),
            shim_release_url: "https://api.github.com/repos/Mirantis/cri-dockerd/releases/latest"
                .to_string(),
            shim_download_url: "https://github.com/Mirantis/cri-dockerd/releases/download/v{version}/cri-dockerd-{version}.{arch}.tgz"
                .to_string(),
            shim_units_url:
                "https://raw.githubusercontent.com/Mirantis/cri-dockerd/v{version}/packaging/systemd"
                    .to_string(),
            shim_socket: "unix:///var/run/cri-dockerd.sock".to_string(),
            arch: "amd64".to_string(),
            pod_cidr_default: network.default,
            pod_cidr_alternate: network.alternate,
            network_plugin_manifest:
                "https://raw.githubusercontent.com/projectcalico/calico/v3.27.3/manifests/calico.yaml"
                    .to_string(),
            admin_user: None,
            kernel_modules: strings(&["overlay", "br_netfilter"]),
            sysctl: [
                ("net.bridge.bridge-nf-call-iptables", "1"),
                ("net.bridge.bridge-nf-call-ip6tables", "1"),
                ("net.ipv4.ip_forward", "1"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

impl ClusterSettings {
    /// Reject settings the pipeline cannot work with
    ///
    /// # Errors
    /// The first invalid field found
    pub fn validate(&self) -> Result<(), SettingsError> {
        let version_ok = self
            .kubernetes_version
            .split_once('.')
            .is_some_and(|(major, minor)| {
                !major.is_empty()
                    && !minor.is_empty()
                    && major.chars().all(|c| c.is_ascii_digit())
                    && minor.chars().all(|c| c.is_ascii_digit())
            });
        if !version_ok {
            return Err(SettingsError::InvalidVersion(
                self.kubernetes_version.clone(),
            ));
        }

        for (field, packages) in [
            ("prerequisite_packages", &self.prerequisite_packages),
            ("runtime_packages", &self.runtime_packages),
            ("cluster_packages", &self.cluster_packages),
        ] {
            if packages.is_empty() {
                return Err(SettingsError::Invalid {
                    field,
                    reason: "at least one package is required".to_string(),
                });
            }
        }

        if !self.shim_socket.starts_with("unix://") {
            return Err(SettingsError::Invalid {
                field: "shim_socket",
                reason: format!("{} is not a unix:// socket", self.shim_socket),
            });
        }

        if self.pod_cidr_default == self.pod_cidr_alternate {
            return Err(SettingsError::Invalid {
                field: "pod_cidr_alternate",
                reason: "must differ from pod_cidr_default".to_string(),
            });
        }

        for (field, url) in [
            ("shim_release_url", &self.shim_release_url),
            ("shim_download_url", &self.shim_download_url),
            ("shim_units_url", &self.shim_units_url),
            ("kubernetes_repo", &self.kubernetes_repo),
            ("network_plugin_manifest", &self.network_plugin_manifest),
        ] {
            if !url.starts_with("https://") && !url.starts_with("http://") {
                return Err(SettingsError::Invalid {
                    field,
                    reason: format!("{url} is not an http(s) URL"),
                });
            }
        }

        Ok(())
    }

    /// Pod ranges as a selector
    #[must_use]
    pub fn pod_network(&self) -> PodNetwork {
        PodNetwork {
            default: self.pod_cidr_default,
            alternate: self.pod_cidr_alternate,
        }
    }

    /// Kubernetes repository URL for the configured release
    #[must_use]
    pub fn kubernetes_repo_url(&self) -> String {
        self.kubernetes_repo
            .replace("{version}", &self.kubernetes_version)
    }

    /// Fill `{version}` and `{arch}` into a shim URL template
    #[must_use]
    pub fn shim_url(&self, template: &str, version: &str) -> String {
        template
            .replace("{version}", version)
            .replace("{arch}", &self.arch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        ClusterSettings::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings: ClusterSettings = toml::from_str(
            r#"
            kubernetes_version = "1.29"
            pod_cidr_default = "172.16.0.0/16"
            "#,
        )
        .unwrap();

        assert_eq!(settings.kubernetes_version, "1.29");
        assert_eq!(settings.pod_cidr_default.to_string(), "172.16.0.0/16");
        assert_eq!(settings.pod_cidr_alternate.to_string(), "10.244.0.0/16");
        assert_eq!(settings.cluster_packages, vec!["kubelet", "kubeadm", "kubectl"]);
        assert_eq!(
            settings.kubernetes_repo_url(),
            "https://pkgs.k8s.io/core:/stable:/v1.29/deb/"
        );
    }

    #[test]
    fn test_bad_cidr_rejected_at_parse() {
        let result: Result<ClusterSettings, _> = toml::from_str(r#"pod_cidr_default = "10.0.0.0""#);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects() {
        let settings = ClusterSettings {
            kubernetes_version: "latest".to_string(),
            ..ClusterSettings::default()
        };
        assert_eq!(
            settings.validate(),
            Err(SettingsError::InvalidVersion("latest".to_string()))
        );

        let settings = ClusterSettings {
            shim_socket: "/var/run/cri-dockerd.sock".to_string(),
            ..ClusterSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::Invalid {
                field: "shim_socket",
                ..
            })
        ));

        let settings = ClusterSettings {
            cluster_packages: Vec::new(),
            ..ClusterSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_shim_url() {
        let settings = ClusterSettings::default();
        assert_eq!(
            settings.shim_url(&settings.shim_download_url, "0.3.14"),
            "https://github.com/Mirantis/cri-dockerd/releases/download/v0.3.14/cri-dockerd-0.3.14.amd64.tgz"
        );
    }
}
