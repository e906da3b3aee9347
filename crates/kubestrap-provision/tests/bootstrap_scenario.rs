use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use kubestrap_core::*;
use kubestrap_exec::{
    CommandResult, ExecError, FetchError, FetchResponse, HttpFetcher, RemoteExecutor,
};
use kubestrap_inventory::{CONTROL_PLANE, Host, Inventory, WORKER};
use kubestrap_provision::keys::{JOIN_COMMAND, POD_CIDR, SHIM_VERSION};
use kubestrap_provision::{ClusterSettings, bootstrap_pipeline, stages};

const JOIN: &str =
    "kubeadm join 192.168.1.10:6443 --token abcdef.0123456789abcdef --discovery-token-ca-cert-hash sha256:feed";

/// A host that converges: every check fails until the step's action ran once
struct FakeHost {
    ip: &'static str,
    seen_checks: Mutex<HashSet<String>>,
    commands: Mutex<Vec<String>>,
}

impl FakeHost {
    fn new(ip: &'static str) -> Arc<Self> {
        Arc::new(Self {
            ip,
            seen_checks: Mutex::new(HashSet::new()),
            commands: Mutex::new(Vec::new()),
        })
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    fn ran(&self, needle: &str) -> bool {
        self.commands().iter().any(|c| c.contains(needle))
    }
}

#[async_trait]
impl RemoteExecutor for FakeHost {
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.commands.lock().unwrap().push(cmd.to_string());

        if cmd.contains("then exit 0; else exit 1; fi") {
            let first = self.seen_checks.lock().unwrap().insert(cmd.to_string());
            return Ok(CommandResult::new(if first { 1 } else { 0 }, "", ""));
        }
        if cmd.starts_with("hostname") {
            return Ok(CommandResult::new(0, format!("{} 172.17.0.1\n", self.ip), ""));
        }
        if cmd.contains("token create --print-join-command") {
            return Ok(CommandResult::new(0, format!("{JOIN} \n"), ""));
        }
        Ok(CommandResult::new(0, "", ""))
    }

    async fn run_with_timeout(
        &self,
        cmd: &str,
        _timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        self.run(cmd).await
    }

    fn executor_type(&self) -> &'static str {
        "fake"
    }
}

/// Release feed; the first `failures` requests get HTTP 500
struct FakeReleases {
    failures: usize,
    calls: AtomicUsize,
}

impl FakeReleases {
    fn healthy() -> Arc<Self> {
        Self::failing(0)
    }

    fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl HttpFetcher for FakeReleases {
    async fn fetch(&self, _url: &str) -> Result<FetchResponse, FetchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Ok(FetchResponse {
                status: 500,
                body: "internal error".to_string(),
            });
        }
        Ok(FetchResponse {
            status: 200,
            body: r#"{"tag_name": "v0.3.14", "draft": false}"#.to_string(),
        })
    }
}

struct Fleet {
    hosts: HashMap<String, Arc<FakeHost>>,
}

#[async_trait]
impl ExecutorFactory for Fleet {
    async fn create_executor(&self, host: &Host) -> Result<Arc<dyn RemoteExecutor>, ExecError> {
        self.hosts
            .get(&host.name)
            .map(|h| h.clone() as Arc<dyn RemoteExecutor>)
            .ok_or_else(|| ExecError::ConnectionFailed {
                host: host.name.clone(),
                reason: "unknown host".to_string(),
            })
    }
}

fn inventory() -> Inventory {
    Inventory::new(vec![
        Host::new("cp1", "192.168.1.10").with_role(CONTROL_PLANE),
        Host::new("w1", "192.168.1.11").with_role(WORKER),
        Host::new("w2", "192.168.1.12").with_role(WORKER),
    ])
    .unwrap()
}

fn fleet() -> Arc<Fleet> {
    Arc::new(Fleet {
        hosts: HashMap::from([
            ("cp1".to_string(), FakeHost::new("192.168.1.10")),
            ("w1".to_string(), FakeHost::new("192.168.1.11")),
            ("w2".to_string(), FakeHost::new("192.168.1.12")),
        ]),
    })
}

async fn bootstrap(
    fleet: &Arc<Fleet>,
    releases: Arc<FakeReleases>,
    config: RunConfig,
) -> RunReport {
    bootstrap_inventory(inventory(), fleet, releases, config).await
}

async fn bootstrap_inventory(
    inventory: Inventory,
    fleet: &Arc<Fleet>,
    releases: Arc<FakeReleases>,
    config: RunConfig,
) -> RunReport {
    let (event_tx, _) = broadcast::channel(1024);
    let args = OrchestratorActorArgs {
        inventory: Arc::new(inventory),
        factory: fleet.clone(),
        fetcher: releases,
        config,
        event_tx,
    };
    run_pipeline(args, bootstrap_pipeline(&ClusterSettings::default()))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_fresh_cluster_bootstrap() {
    let fleet = fleet();
    let report = bootstrap(&fleet, FakeReleases::healthy(), RunConfig::default()).await;

    assert!(report.is_success(), "{:?}", report.first_failure());
    assert_eq!(report.stages.len(), 7);
    let names: Vec<&str> = report.stages.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, stages::ORDER);

    let init = report
        .stage(stages::CONTROL_PLANE_INIT)
        .unwrap()
        .host("cp1")
        .unwrap()
        .step("kubeadm init")
        .unwrap();
    assert_eq!(init.outcome, StepOutcome::Applied);
    assert_eq!(init.facts[JOIN_COMMAND], JOIN);

    // 192.168.1.10 lies inside the default pod range
    assert_eq!(report.facts["cp1"][POD_CIDR], "10.244.0.0/16");
    assert!(fleet.hosts["cp1"].ran("--pod-network-cidr=10.244.0.0/16"));
    assert_eq!(report.facts["w1"][SHIM_VERSION], "0.3.14");

    for worker in ["w1", "w2"] {
        let join = report
            .stage(stages::WORKER_JOIN)
            .unwrap()
            .host(worker)
            .unwrap()
            .step("kubeadm join")
            .unwrap();
        assert_eq!(join.outcome, StepOutcome::Applied);
        assert!(
            fleet.hosts[worker].ran(&format!(
                "{JOIN} --cri-socket unix:///var/run/cri-dockerd.sock"
            )),
            "{worker} did not run the control plane's join command"
        );
        assert!(!fleet.hosts[worker].ran("kubeadm init"));
    }
    assert!(!fleet.hosts["cp1"].ran("kubeadm join"));
}

#[tokio::test]
async fn test_handlers_run_once_per_host() {
    let fleet = fleet();
    let report = bootstrap(&fleet, FakeReleases::healthy(), RunConfig::default()).await;

    let runtime = report.stage(stages::RUNTIME).unwrap();
    for host in &runtime.hosts {
        let handlers: Vec<&str> = host.handlers.iter().map(|h| h.handler.as_str()).collect();
        assert_eq!(handlers, vec!["restart docker"]);
        assert_eq!(host.handlers[0].outcome, StepOutcome::Applied);
    }

    let kernel = report.stage(stages::KERNEL_CONFIG).unwrap();
    assert!(
        kernel
            .hosts
            .iter()
            .all(|h| h.handlers.len() == 1 && h.handlers[0].handler == "apply sysctl")
    );

    let restarts = fleet.hosts["w1"]
        .commands()
        .iter()
        .filter(|c| c.contains("systemctl restart docker"))
        .count();
    assert_eq!(restarts, 1);
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let fleet = fleet();
    let first = bootstrap(&fleet, FakeReleases::healthy(), RunConfig::default()).await;
    assert!(first.is_success());
    let commands_before = fleet.hosts["w1"].commands().len();

    let second = bootstrap(&fleet, FakeReleases::healthy(), RunConfig::default()).await;

    assert!(second.is_success(), "{:?}", second.first_failure());
    assert!(second.summary().values().all(|s| s.applied == 0 && s.failed == 0));
    assert!(
        second
            .stages
            .iter()
            .flat_map(|s| s.hosts.iter())
            .all(|h| h.handlers.is_empty())
    );
    // Join command is derived again for the workers
    assert_eq!(second.facts["cp1"][JOIN_COMMAND], JOIN);

    let rerun: Vec<String> = fleet.hosts["w1"].commands()[commands_before..].to_vec();
    assert!(!rerun.iter().any(|c| c.contains("kubeadm join")));
    assert!(!rerun.iter().any(|c| c.contains("apt-get")));
}

#[tokio::test]
async fn test_discovery_failure_aborts_pipeline() {
    let fleet = fleet();
    let report = bootstrap(&fleet, FakeReleases::failing(1), RunConfig::default()).await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    let shim = report.first_failure().unwrap();
    assert_eq!(shim.name, stages::SHIM);

    let failed: Vec<&HostStageReport> = shim
        .hosts
        .iter()
        .filter(|h| h.status == HostStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    let step = failed[0].step("discover shim version").unwrap();
    assert_eq!(step.outcome, StepOutcome::Failed);
    assert_eq!(step.error_kind, Some(ErrorKind::Discovery));
    assert!(step.message.as_deref().unwrap().contains("HTTP 500"));
    assert!(failed[0].step("install shim").is_none());

    for later in [
        stages::CLUSTER_TOOLS,
        stages::KERNEL_CONFIG,
        stages::CONTROL_PLANE_INIT,
        stages::WORKER_JOIN,
    ] {
        assert_eq!(report.stage(later).unwrap().status, StageStatus::NotRun);
    }
    assert!(fleet.hosts.values().all(|h| !h.ran("kubeadm")));
}

#[tokio::test]
async fn test_discovery_failure_with_continue_unaffected() {
    let fleet = fleet();
    let config = RunConfig {
        failure_policy: FailurePolicy::ContinueUnaffected,
        ..RunConfig::default()
    };
    let report = bootstrap(&fleet, FakeReleases::failing(1), config).await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    let shim = report.stage(stages::SHIM).unwrap();
    let failed: Vec<String> = shim.failed_hosts().map(str::to_string).collect();
    assert_eq!(failed.len(), 1);

    let tools = report.stage(stages::CLUSTER_TOOLS).unwrap();
    assert_eq!(tools.status, StageStatus::Succeeded);
    assert_eq!(tools.excluded, failed);
    assert_eq!(tools.hosts.len(), 2);
    assert!(!fleet.hosts[&failed[0]].ran("apt-mark hold"));
}

#[tokio::test]
async fn test_dry_run_on_fresh_hosts() {
    let fleet = fleet();
    let config = RunConfig {
        dry_run: true,
        ..RunConfig::default()
    };
    let report = bootstrap(&fleet, FakeReleases::healthy(), config).await;

    assert!(report.is_success(), "{:?}", report.first_failure());
    assert!(report.step_results().all(|s| s.outcome != StepOutcome::Applied));

    let init = report
        .stage(stages::CONTROL_PLANE_INIT)
        .unwrap()
        .host("cp1")
        .unwrap()
        .step("kubeadm init")
        .unwrap();
    assert_eq!(init.outcome, StepOutcome::WouldApply);

    let join = report
        .stage(stages::WORKER_JOIN)
        .unwrap()
        .host("w1")
        .unwrap()
        .step("kubeadm join")
        .unwrap();
    assert_eq!(join.outcome, StepOutcome::Skipped);
    assert!(join.message.as_deref().unwrap().contains(JOIN_COMMAND));

    let runtime = report.stage(stages::RUNTIME).unwrap().host("w2").unwrap();
    assert_eq!(runtime.handlers[0].outcome, StepOutcome::WouldApply);

    for host in fleet.hosts.values() {
        assert!(!host.ran("apt-get"));
        assert!(!host.ran("kubeadm"));
        assert!(!host.ran("systemctl restart"));
        assert!(!host.ran("curl -fsSL"));
    }
}

#[tokio::test]
async fn test_only_first_control_plane_initializes() {
    let inventory = Inventory::new(vec![
        Host::new("cp1", "192.168.1.10").with_role(CONTROL_PLANE),
        Host::new("cp2", "192.168.1.20").with_role(CONTROL_PLANE),
        Host::new("w1", "192.168.1.11").with_role(WORKER),
    ])
    .unwrap();
    let fleet = Arc::new(Fleet {
        hosts: HashMap::from([
            ("cp1".to_string(), FakeHost::new("192.168.1.10")),
            ("cp2".to_string(), FakeHost::new("192.168.1.20")),
            ("w1".to_string(), FakeHost::new("192.168.1.11")),
        ]),
    });

    let report =
        bootstrap_inventory(inventory, &fleet, FakeReleases::healthy(), RunConfig::default())
            .await;

    assert!(report.is_success(), "{:?}", report.first_failure());
    let init = report.stage(stages::CONTROL_PLANE_INIT).unwrap();
    assert_eq!(init.hosts.len(), 1);
    assert!(init.host("cp2").is_none());

    assert!(fleet.hosts["cp1"].ran("kubeadm init"));
    assert!(!fleet.hosts["cp2"].ran("kubeadm init"));
    assert!(!fleet.hosts["cp2"].ran("token create"));
    assert!(!report.facts.get("cp2").is_some_and(|f| f.contains_key(JOIN_COMMAND)));

    // Shared stages still prepare the second control-plane host
    assert!(report.stage(stages::RUNTIME).unwrap().host("cp2").is_some());
    assert!(fleet.hosts["w1"].ran(&format!("{JOIN} --cri-socket")));
}

#[tokio::test]
async fn test_shim_units_reinstalled_without_relocated_binary() {
    let fleet = fleet();
    let report = bootstrap(&fleet, FakeReleases::healthy(), RunConfig::default()).await;
    assert!(report.is_success(), "{:?}", report.first_failure());

    let units = report
        .stage(stages::SHIM)
        .unwrap()
        .host("w1")
        .unwrap()
        .step("install shim units")
        .unwrap();
    assert_eq!(units.outcome, StepOutcome::Applied);

    let w1 = &fleet.hosts["w1"];
    assert!(w1.ran("grep -qF /usr/local/bin/cri-dockerd /etc/systemd/system/cri-docker.service"));
    assert!(w1.ran("-o /tmp/kubestrap-cri-docker.service"));
    assert!(w1.ran(
        "install -m 0644 /tmp/kubestrap-cri-docker.service /etc/systemd/system/cri-docker.service"
    ));
    assert!(w1.ran("s,/usr/bin/cri-dockerd,/usr/local/bin/cri-dockerd,"));
    assert!(!w1.ran("-o /etc/systemd/system/cri-docker.service"));
}
