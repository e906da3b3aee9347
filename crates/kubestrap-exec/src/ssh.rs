//! SSH command execution using russh crate

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh::{ChannelMsg, Disconnect, client};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::error::ExecError;
use crate::keys::{KeySource, ResolvedKey};
use crate::result::{CommandResult, ConnectionInfo};
use crate::traits::RemoteExecutor;

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Freshly provisioned nodes have no known_hosts entry yet
        Ok(true)
    }
}

/// SSH command executor
///
/// Holds one session per host, opened on first use and reused for every
/// command of the run. Commands on one executor are serialized.
pub struct SshExecutor {
    conn_info: ConnectionInfo,
    key: ResolvedKey,
    session: Mutex<Option<client::Handle<SshClientHandler>>>,
}

impl std::fmt::Debug for SshExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshExecutor")
            .field("conn_info", &self.conn_info)
            .field("key", &self.key)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SshExecutor {
    /// Create a new SSH executor
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if key resolution fails
    pub fn new(conn_info: ConnectionInfo, key_source: &KeySource) -> Result<Self, ExecError> {
        let key = key_source
            .resolve()
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;

        Ok(Self {
            conn_info,
            key,
            session: Mutex::new(None),
        })
    }

    /// Get connection info
    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.conn_info
    }

    fn connection_failed(&self, reason: impl ToString) -> ExecError {
        ExecError::ConnectionFailed {
            host: self.conn_info.host.clone(),
            reason: reason.to_string(),
        }
    }

    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn connect(&self) -> Result<(), ExecError> {
        let mut session_lock = self.session.lock().await;

        if session_lock.is_some() {
            return Ok(());
        }

        info!(
            port = self.conn_info.port,
            user = %self.conn_info.user,
            "opening SSH session"
        );

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(600)),
            ..Default::default()
        });

        let connecting = client::connect(
            config,
            (self.conn_info.host.as_str(), self.conn_info.port),
            SshClientHandler,
        );
        let mut session = timeout(self.conn_info.connect_timeout, connecting)
            .await
            .map_err(|_| self.connection_failed("connect timed out"))?
            .map_err(|e| self.connection_failed(e))?;

        let Some(key_path) = self.key.path() else {
            return Err(ExecError::AuthenticationFailed(
                "SSH agent authentication is not supported, configure ssh_key".to_string(),
            ));
        };

        let key_pair =
            load_secret_key(key_path, None).map_err(|e| ExecError::SshKeyError(e.to_string()))?;
        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let auth_res = session
            .authenticate_publickey(
                &self.conn_info.user,
                PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
            )
            .await
            .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

        if !auth_res.success() {
            return Err(ExecError::AuthenticationFailed(format!(
                "public key rejected for {}@{}",
                self.conn_info.user, self.conn_info.host
            )));
        }

        info!("SSH session authenticated");

        *session_lock = Some(session);
        Ok(())
    }

    #[instrument(skip(self, cmd), fields(host = %self.conn_info.host))]
    async fn execute_remote(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        let mut session_lock = self.session.lock().await;
        let session = session_lock.as_mut().ok_or(ExecError::NotConnected)?;

        debug!(command = %cmd, "executing remote command");
        let start = Instant::now();

        let mut channel = match session.channel_open_session().await {
            Ok(channel) => channel,
            Err(e) => {
                // broken session, reconnect on next call
                session_lock.take();
                return Err(ExecError::IoError(e.to_string()));
            }
        };

        channel
            .exec(true, cmd)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let mut status = -1;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => status = exit_status.cast_signed(),
                _ => {}
            }
        }

        let result = CommandResult {
            status,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            duration: start.elapsed(),
        };

        debug!(
            command = %cmd,
            status = result.status,
            duration = ?result.duration,
            "remote command completed"
        );

        Ok(result)
    }

    /// Disconnect from remote host
    ///
    /// # Errors
    /// Returns `ExecError::IoError` if disconnection fails
    pub async fn disconnect(&self) -> Result<(), ExecError> {
        let mut session_lock = self.session.lock().await;

        if let Some(session) = session_lock.take() {
            session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
            info!(host = %self.conn_info.host, "SSH disconnected");
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.connect().await?;
        self.execute_remote(cmd).await
    }

    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout_duration: Duration,
    ) -> Result<CommandResult, ExecError> {
        // connection setup has its own deadline
        self.connect().await?;

        match timeout(timeout_duration, self.execute_remote(cmd)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    host = %self.conn_info.host,
                    command = %cmd,
                    timeout = ?timeout_duration,
                    "remote command timed out"
                );
                Err(ExecError::Timeout {
                    timeout: timeout_duration,
                })
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.session
            .try_lock()
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    fn executor_type(&self) -> &'static str {
        "ssh"
    }
}

/// Builder for `SshExecutor`
pub struct SshExecutorBuilder {
    conn_info: ConnectionInfo,
    key_source: KeySource,
}

impl SshExecutorBuilder {
    /// Create builder with required fields
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            conn_info: ConnectionInfo::new(host, user),
            key_source: KeySource::Default,
        }
    }

    /// Set SSH key path
    #[must_use]
    pub fn with_key_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.key_source = KeySource::Path(path.into());
        self
    }

    /// Set key from environment variable (base64)
    #[must_use]
    pub fn with_env_key(mut self, var_name: impl Into<String>) -> Self {
        self.key_source = KeySource::Env(var_name.into());
        self
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.conn_info.port = port;
        self
    }

    /// Set the session establishment deadline
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.conn_info.connect_timeout = timeout;
        self
    }

    /// Build the executor
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if key resolution fails
    pub fn build(self) -> Result<SshExecutor, ExecError> {
        SshExecutor::new(self.conn_info, &self.key_source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_rejects_missing_key() {
        let err = SshExecutorBuilder::new("10.0.0.10", "ubuntu")
            .with_key_path("/nonexistent/kubestrap/id_ed25519")
            .build()
            .unwrap_err();
        assert!(matches!(err, ExecError::SshKeyError(_)));
    }

    #[tokio::test]
    #[ignore = "requires SSH server"]
    async fn test_ssh_roundtrip() {
        let executor = SshExecutorBuilder::new("127.0.0.1", "root").build().unwrap();
        let result = executor.run("echo ok").await.unwrap();
        assert_eq!(result.stdout_trimmed(), "ok");
    }
}
