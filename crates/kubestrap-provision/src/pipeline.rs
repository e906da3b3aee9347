//! The seven-stage cluster bootstrap pipeline

use std::sync::Arc;

use kubestrap_core::{HandlerRegistry, Pipeline, Stage};
use kubestrap_inventory::{ALL, CONTROL_PLANE, WORKER};
use serde_json::json;

use crate::apt::{AptHold, AptKey, AptPackages, AptRepository};
use crate::cluster::{AdminKubeconfig, ChoosePodCidr, DetectAddress, KubeadmInit, NetworkPlugin, WorkerJoin};
use crate::service::{
    ApplySysctl, APPLY_SYSCTL, RELOAD_SYSTEMD, RESTART_DOCKER, ReloadSystemd, RestartService,
    ServiceEnabled,
};
use crate::settings::ClusterSettings;
use crate::shim::{DiscoverShimVersion, InstallShim, ShimUnits};
use crate::system::{DisableSwap, LoadKernelModules, ManagedFile};

/// Stage names in execution order
pub mod stages {
    pub const PREREQUISITES: &str = "prerequisites";
    pub const RUNTIME: &str = "runtime";
    pub const SHIM: &str = "shim";
    pub const CLUSTER_TOOLS: &str = "cluster-tools";
    pub const KERNEL_CONFIG: &str = "kernel-config";
    pub const CONTROL_PLANE_INIT: &str = "control-plane-init";
    pub const WORKER_JOIN: &str = "worker-join";

    /// All stages, in order
    pub const ORDER: [&str; 7] = [
        PREREQUISITES,
        RUNTIME,
        SHIM,
        CLUSTER_TOOLS,
        KERNEL_CONFIG,
        CONTROL_PLANE_INIT,
        WORKER_JOIN,
    ];
}

const KUBERNETES_KEYRING: &str = "/etc/apt/keyrings/kubernetes-apt-keyring.gpg";

/// Docker daemon config selecting the systemd cgroup driver kubelet expects
fn docker_daemon_config() -> String {
    let config = json!({
        "exec-opts": ["native.cgroupdriver=systemd"],
        "log-driver": "json-file",
        "log-opts": { "max-size": "100m" },
        "storage-driver": "overlay2",
    });
    format!("{config:#}\n")
}

fn handlers() -> HandlerRegistry {
    HandlerRegistry::new()
        .with(Arc::new(ReloadSystemd))
        .with(Arc::new(RestartService::new(RESTART_DOCKER, "docker")))
        .with(Arc::new(ApplySysctl))
}

/// Build the pipeline that turns the inventory into a running cluster
///
/// Stages run in [`stages::ORDER`]. Control-plane init runs on the first
/// control-plane host only; it is the one that creates the cluster.
#[must_use]
pub fn bootstrap_pipeline(settings: &ClusterSettings) -> Pipeline {
    let repo_url = settings.kubernetes_repo_url();

    Pipeline::new(handlers())
        .stage(
            Stage::new(stages::PREREQUISITES, ALL).step(AptPackages::new(
                "prerequisite packages",
                settings.prerequisite_packages.clone(),
            )),
        )
        .stage(
            Stage::new(stages::RUNTIME, ALL)
                .step(AptPackages::new(
                    "runtime packages",
                    settings.runtime_packages.clone(),
                ))
                .step(
                    ManagedFile::new(
                        "docker daemon config",
                        "/etc/docker/daemon.json",
                        docker_daemon_config(),
                    )
                    .notify(RESTART_DOCKER),
                )
                .step(ServiceEnabled::new("docker")),
        )
        .stage(
            Stage::new(stages::SHIM, ALL)
                .step(DiscoverShimVersion::new(settings))
                .step(InstallShim::new(settings))
                .step(ShimUnits::new(settings))
                .step(ServiceEnabled::new("cri-docker.socket").daemon_reload())
                .step(ServiceEnabled::new("cri-docker.service")),
        )
        .stage(
            Stage::new(stages::CLUSTER_TOOLS, ALL)
                .step(AptKey::new(
                    "kubernetes signing key",
                    format!("{repo_url}Release.key"),
                    KUBERNETES_KEYRING,
                ))
                .step(AptRepository::new(
                    "kubernetes repository",
                    format!("deb [signed-by={KUBERNETES_KEYRING}] {repo_url} /"),
                    "/etc/apt/sources.list.d/kubernetes.list",
                ))
                .step(AptPackages::new(
                    "cluster packages",
                    settings.cluster_packages.clone(),
                ))
                .step(AptHold::new(
                    "hold cluster packages",
                    settings.cluster_packages.clone(),
                ))
                .step(ServiceEnabled::new("kubelet").enable_only()),
        )
        .stage(
            Stage::new(stages::KERNEL_CONFIG, ALL)
                .step(DisableSwap)
                .step(ManagedFile::modules_load(
                    "/etc/modules-load.d/k8s.conf",
                    &settings.kernel_modules,
                ))
                .step(LoadKernelModules::new(settings.kernel_modules.clone()))
                .step(
                    ManagedFile::sysctl("/etc/sysctl.d/k8s.conf", &settings.sysctl)
                        .notify(APPLY_SYSCTL),
                ),
        )
        .stage(
            Stage::new(stages::CONTROL_PLANE_INIT, CONTROL_PLANE)
                .representative_only()
                .step(DetectAddress)
                .step(ChoosePodCidr::new(settings))
                .step(KubeadmInit::new(settings))
                .step(AdminKubeconfig::new(settings))
                .step(NetworkPlugin::new(settings)),
        )
        .stage(Stage::new(stages::WORKER_JOIN, WORKER).step(WorkerJoin::new(settings)))
}
