use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while bringing the device plugin up or registering it.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to remove stale socket {path:?}: {source}")]
    StaleSocket {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to bind device plugin socket {path:?}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("device plugin server on {path:?} did not become ready within {timeout:?}: {message}")]
    NotReady {
        path: PathBuf,
        timeout: Duration,
        message: String,
    },
    #[error("device plugin server is already serving")]
    AlreadyServing,
    #[error("device plugin server was stopped, create a new instance to serve again")]
    Stopped,
    #[error("device-plugin: cannot connect to kubelet service {path:?}: {message}")]
    KubeletUnreachable { path: PathBuf, message: String },
    #[error("device-plugin: cannot register to kubelet service: {message}")]
    RegistrationRejected { message: String },
}
