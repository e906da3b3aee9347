//! Executor factory: local shell for this machine, SSH for everything else

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use kubestrap_core::ExecutorFactory;
use kubestrap_exec::{ExecError, KeySource, LocalExecutor, RemoteExecutor, SshExecutor};
use kubestrap_inventory::Host;

/// Default implementation of `ExecutorFactory`
#[derive(Debug, Clone)]
pub struct HostExecutorFactory {
    connect_timeout: Duration,
    key_env: Option<String>,
}

impl HostExecutorFactory {
    /// Create a new factory instance
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            key_env: None,
        }
    }

    /// Read keys for hosts without `ssh_key` from a base64 environment variable
    #[must_use]
    pub fn with_key_env(mut self, var_name: Option<String>) -> Self {
        self.key_env = var_name;
        self
    }

    /// Where the key for `host` comes from
    fn key_source(&self, host: &Host) -> KeySource {
        match (&host.ssh_key, &self.key_env) {
            (Some(path), _) => KeySource::Path(path.into()),
            (None, Some(var)) => KeySource::Env(var.clone()),
            (None, None) => KeySource::Default,
        }
    }

    fn create_executor_sync(&self, host: &Host) -> Result<Arc<dyn RemoteExecutor>, ExecError> {
        if host.is_local() {
            debug!(host = %host.name, "using local executor");
            return Ok(Arc::new(LocalExecutor::new()));
        }

        let executor = SshExecutor::new(
            host.connection_info(self.connect_timeout),
            &self.key_source(host),
        )?;
        debug!(host = %host.name, addr = %host.addr, port = host.port, "using SSH executor");
        Ok(Arc::new(executor))
    }
}

#[async_trait]
impl ExecutorFactory for HostExecutorFactory {
    async fn create_executor(&self, host: &Host) -> Result<Arc<dyn RemoteExecutor>, ExecError> {
        self.create_executor_sync(host)
    }
}
