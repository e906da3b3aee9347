//! kubestrap-exec: Remote execution abstraction
//!
//! The only channels the provisioning engine has to affect or observe a host:
//! shell commands run locally or over SSH, and plain HTTP fetches for release metadata.

pub mod command;
pub mod error;
pub mod fetch;
pub mod keys;
pub mod local;
pub mod result;
pub mod ssh;
pub mod traits;

pub use command::ShellCommand;
pub use error::ExecError;
pub use fetch::{FetchError, FetchResponse, HttpFetcher, ReqwestFetcher};
pub use keys::{KeyError, KeySource, ResolvedKey};
pub use local::LocalExecutor;
pub use result::{CommandResult, ConnectionInfo};
pub use ssh::{SshExecutor, SshExecutorBuilder};
pub use traits::RemoteExecutor;
