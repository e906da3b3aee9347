//! SSH key management and resolution

use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

/// Key file names tried, in order, for `KeySource::Default`
const DEFAULT_KEY_NAMES: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

static TEMP_KEY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// SSH key resolution strategy
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Explicit path to key file
    Path(PathBuf),
    /// First existing key among `~/.ssh/id_ed25519`, `id_ecdsa`, `id_rsa`
    Default,
    /// Use SSH agent
    Agent,
    /// Base64-encoded key from environment
    Env(String),
}

impl KeySource {
    /// Resolve key source to a path or agent
    ///
    /// For `Env`, decodes base64 and writes a private temp file removed on drop.
    ///
    /// # Errors
    /// Returns `KeyError` if key resolution fails (env not set, invalid base64, etc.)
    pub fn resolve(&self) -> Result<ResolvedKey, KeyError> {
        match self {
            KeySource::Path(path) => {
                validate_key_permissions(path)?;
                Ok(ResolvedKey::Path(path.clone()))
            }
            KeySource::Default => {
                let ssh_dir = dirs::home_dir()
                    .map(|home| home.join(".ssh"))
                    .ok_or_else(|| KeyError::NotFound("home directory".to_string()))?;
                let path = DEFAULT_KEY_NAMES
                    .iter()
                    .map(|name| ssh_dir.join(name))
                    .find(|candidate| candidate.is_file())
                    .ok_or_else(|| KeyError::NotFound(ssh_dir.display().to_string()))?;
                validate_key_permissions(&path)?;
                debug!(path = %path.display(), "using default SSH key");
                Ok(ResolvedKey::Path(path))
            }
            KeySource::Agent => Ok(ResolvedKey::Agent),
            KeySource::Env(var_name) => {
                let base64_key =
                    env::var(var_name).map_err(|_| KeyError::EnvNotSet(var_name.clone()))?;
                let key_data = base64_decode(&base64_key).map_err(|_| KeyError::InvalidBase64)?;

                let temp_path = write_temp_key(&key_data)?;
                Ok(ResolvedKey::Temp(temp_path))
            }
        }
    }
}

/// Resolved key location
#[derive(Debug)]
pub enum ResolvedKey {
    /// Path to key file
    Path(PathBuf),
    /// Use SSH agent
    Agent,
    /// Temporary file (will be deleted on drop)
    Temp(PathBuf),
}

impl ResolvedKey {
    /// Get path for SSH library
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            ResolvedKey::Path(p) | ResolvedKey::Temp(p) => Some(p),
            ResolvedKey::Agent => None,
        }
    }

    /// Whether to use SSH agent
    #[must_use]
    pub fn use_agent(&self) -> bool {
        matches!(self, ResolvedKey::Agent)
    }
}

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("no SSH key found in {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim())
}

fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => KeyError::NotFound(path.display().to_string()),
        _ => KeyError::Io(e),
    })?;

    // group/other bits must be clear
    if metadata.permissions().mode() & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}

fn write_temp_key(key_data: &[u8]) -> Result<PathBuf, KeyError> {
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    // one file per resolved key, several hosts may resolve the same variable
    let seq = TEMP_KEY_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_path =
        env::temp_dir().join(format!("kubestrap_ssh_key_{}_{seq}", std::process::id()));

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&temp_path)?;
    file.write_all(key_data)?;

    debug!(path = %temp_path.display(), "wrote temporary SSH key");

    Ok(temp_path)
}

impl Drop for ResolvedKey {
    fn drop(&mut self) {
        if let ResolvedKey::Temp(path) = self
            && let Err(e) = std::fs::remove_file(&*path)
        {
            warn!(path = %path.display(), error = %e, "failed to remove temp key");
        }
    }
}
