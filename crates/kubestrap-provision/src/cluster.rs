//! Control-plane initialization and worker join
//!
//! The control plane publishes its address, the pod range it chose and a
//! fresh join command. Workers read the join command through the role-level
//! fact lookup, so it always comes from the first control-plane host.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use kubestrap_core::{Guard, RetryPolicy, Step, StepContext, StepError, StepOptions};
use kubestrap_exec::command::quote;
use kubestrap_inventory::CONTROL_PLANE;
use tracing::{info, instrument};

use crate::keys::{HOST_IP, JOIN_COMMAND, POD_CIDR};
use crate::network::PodNetwork;
use crate::settings::ClusterSettings;
use crate::shell::{check, holds};

/// Written by `kubeadm init` on the control plane
pub const ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";

/// Written by `kubeadm join` on a worker
pub const KUBELET_CONF: &str = "/etc/kubernetes/kubelet.conf";

/// Records the manifest URL last applied by the network plugin step
const NETWORK_PLUGIN_MARKER: &str = "/etc/kubernetes/kubestrap-network-plugin";

const KUBEADM_TIMEOUT: Duration = Duration::from_secs(900);

/// First IPv4 address in `hostname -I` output
fn first_ipv4(output: &str) -> Option<Ipv4Addr> {
    output
        .split_whitespace()
        .find_map(|word| word.parse::<Ipv4Addr>().ok())
}

/// Record the host's primary IPv4 address
pub struct DetectAddress;

#[async_trait]
impl Step for DetectAddress {
    fn name(&self) -> &str {
        "detect address"
    }

    fn options(&self) -> StepOptions {
        StepOptions::default().output(HOST_IP)
    }

    async fn guard(&self, _ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
        Ok(Guard::Satisfied)
    }

    async fn apply(&self, _ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        Ok(())
    }

    async fn publish(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let result = ctx.run(&ctx.command("hostname").arg("-I")).await?;
        let ip = first_ipv4(&result.stdout).ok_or_else(|| {
            StepError::GuardCheck(format!(
                "no IPv4 address in `hostname -I` output {:?}",
                result.stdout_trimmed()
            ))
        })?;
        ctx.set_fact(HOST_IP, ip.to_string())
    }
}

/// Pick the pod range that does not overlap the control plane's address
pub struct ChoosePodCidr {
    network: PodNetwork,
}

impl ChoosePodCidr {
    pub fn new(settings: &ClusterSettings) -> Self {
        Self {
            network: settings.pod_network(),
        }
    }
}

#[async_trait]
impl Step for ChoosePodCidr {
    fn name(&self) -> &str {
        "choose pod network"
    }

    fn options(&self) -> StepOptions {
        StepOptions::default().output(POD_CIDR)
    }

    async fn guard(&self, _ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
        Ok(Guard::Satisfied)
    }

    async fn apply(&self, _ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        Ok(())
    }

    async fn publish(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let raw = ctx.fact(HOST_IP)?;
        let ip: Ipv4Addr = raw
            .parse()
            .map_err(|_| StepError::GuardCheck(format!("{HOST_IP} is not an IPv4 address: {raw}")))?;
        let cidr = self.network.choose(ip);
        info!(host = %ctx.host().name, ip = %ip, cidr = %cidr, "pod network chosen");
        ctx.set_fact(POD_CIDR, cidr.to_string())
    }
}

/// `kubeadm init` on the control plane, then derive the join command
pub struct KubeadmInit {
    socket: String,
}

impl KubeadmInit {
    pub fn new(settings: &ClusterSettings) -> Self {
        Self {
            socket: settings.shim_socket.clone(),
        }
    }
}

#[async_trait]
impl Step for KubeadmInit {
    fn name(&self) -> &str {
        "kubeadm init"
    }

    fn options(&self) -> StepOptions {
        StepOptions::default()
            .output(JOIN_COMMAND)
            .timeout(KUBEADM_TIMEOUT)
    }

    async fn guard(&self, ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
        let initialized = holds(ctx, &format!("test -f {ADMIN_CONF}")).await?;
        Ok(Guard::from_bool(initialized, "cluster not initialized"))
    }

    #[instrument(skip_all, fields(host = %ctx.host().name))]
    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let ip = ctx.fact(HOST_IP)?;
        let cidr = ctx.fact(POD_CIDR)?;
        let init = ctx.command("kubeadm").args([
            "init".to_string(),
            format!("--pod-network-cidr={cidr}"),
            format!("--apiserver-advertise-address={ip}"),
            format!("--cri-socket={}", self.socket),
        ]);
        ctx.run(&init).await?;
        info!(cidr = %cidr, "control plane initialized");
        Ok(())
    }

    /// Join commands embed a short-lived token, so a fresh one is created
    /// on every run instead of reusing what `init` printed.
    async fn publish(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        if ctx.dry_run() {
            return Ok(());
        }
        let create = ctx
            .command("kubeadm")
            .args(["token", "create", "--print-join-command"]);
        let result = ctx.run(&create).await?;
        let join = result.stdout_trimmed();
        if !join.starts_with("kubeadm join ") {
            return Err(StepError::Execution {
                command: create.render(),
                status: result.status,
                stderr: format!("unexpected join command output {join:?}"),
            });
        }
        ctx.set_fact(JOIN_COMMAND, join)
    }
}

/// Kubeconfig for the administrating user
pub struct AdminKubeconfig {
    user: Option<String>,
}

impl AdminKubeconfig {
    pub fn new(settings: &ClusterSettings) -> Self {
        Self {
            user: settings.admin_user.clone(),
        }
    }

    fn user<'a>(&'a self, ctx: &'a StepContext<'_>) -> &'a str {
        self.user.as_deref().unwrap_or(&ctx.host().user)
    }
}

/// Shell prelude setting `$home` and `$group` for a user
fn user_env(user: &str) -> String {
    let user = quote(user);
    format!(
        "home=$(getent passwd {user} | cut -d: -f6) && group=$(id -gn {user}) && test -n \"$home\""
    )
}

#[async_trait]
impl Step for AdminKubeconfig {
    fn name(&self) -> &str {
        "admin kubeconfig"
    }

    async fn guard(&self, ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
        let user = self.user(ctx).to_string();
        let condition = format!(
            "{} && cmp -s {ADMIN_CONF} \"$home/.kube/config\"",
            user_env(&user)
        );
        let current = holds(ctx, &condition).await?;
        Ok(Guard::from_bool(
            current,
            format!("kubeconfig for {user} missing or stale"),
        ))
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let user = self.user(ctx).to_string();
        let script = format!(
            "{env} && install -d -m 0700 -o {u} -g \"$group\" \"$home/.kube\" && install -m 0600 -o {u} -g \"$group\" {ADMIN_CONF} \"$home/.kube/config\"",
            env = user_env(&user),
            u = quote(&user),
        );
        ctx.run(&ctx.script(script)).await?;
        Ok(())
    }
}

/// Apply the pod network plugin manifest once per manifest URL
pub struct NetworkPlugin {
    manifest: String,
}

impl NetworkPlugin {
    pub fn new(settings: &ClusterSettings) -> Self {
        Self {
            manifest: settings.network_plugin_manifest.clone(),
        }
    }
}

#[async_trait]
impl Step for NetworkPlugin {
    fn name(&self) -> &str {
        "network plugin"
    }

    fn options(&self) -> StepOptions {
        // The API server may still be starting right after init
        StepOptions::default().retry(RetryPolicy::new(5, Duration::from_secs(5)))
    }

    async fn guard(&self, ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
        let condition = format!(
            "grep -qxF {} {NETWORK_PLUGIN_MARKER}",
            quote(&self.manifest)
        );
        let applied = ctx.probe(&check(ctx, &condition)).await?;
        Ok(Guard::from_bool(applied, "network plugin not applied"))
    }

    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let apply = ctx.command("kubectl").args([
            "--kubeconfig",
            ADMIN_CONF,
            "apply",
            "-f",
            self.manifest.as_str(),
        ]);
        ctx.run(&apply).await?;

        let record = format!(
            "printf '%s\\n' {} > {NETWORK_PLUGIN_MARKER}",
            quote(&self.manifest)
        );
        ctx.run(&ctx.script(record)).await?;
        Ok(())
    }
}

/// Join a worker using the control plane's join command
pub struct WorkerJoin {
    socket: String,
}

impl WorkerJoin {
    pub fn new(settings: &ClusterSettings) -> Self {
        Self {
            socket: settings.shim_socket.clone(),
        }
    }

    /// Join line with the CRI socket appended
    #[must_use]
    pub fn join_line(&self, join: &str) -> String {
        format!("{} --cri-socket {}", join.trim(), quote(&self.socket))
    }
}

#[async_trait]
impl Step for WorkerJoin {
    fn name(&self) -> &str {
        "kubeadm join"
    }

    fn options(&self) -> StepOptions {
        StepOptions::default()
            .requires(CONTROL_PLANE, JOIN_COMMAND)
            .timeout(KUBEADM_TIMEOUT)
    }

    async fn guard(&self, ctx: &mut StepContext<'_>) -> Result<Guard, StepError> {
        let joined = holds(ctx, &format!("test -f {KUBELET_CONF}")).await?;
        Ok(Guard::from_bool(joined, "not joined"))
    }

    #[instrument(skip_all, fields(host = %ctx.host().name))]
    async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<(), StepError> {
        let join = ctx.role_fact(CONTROL_PLANE, JOIN_COMMAND)?;
        ctx.run(&ctx.script(self.join_line(&join))).await?;
        info!("worker joined");
        Ok(())
    }
}
