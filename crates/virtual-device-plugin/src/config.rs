use std::convert::Infallible;
use std::path::Path;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

/// Directory the kubelet watches for device plugin sockets.
pub const DEFAULT_DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";

/// Registration socket served by the kubelet.
pub const KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";

/// Pod resources socket served by the kubelet.
pub const POD_RESOURCES_SOCKET: &str = "/var/lib/kubelet/pod-resources/kubelet.sock";

#[derive(Parser, Clone, Debug)]
#[command(about = "Advertises a pool of virtual devices to the kubelet", version = &**utils::version::VERSION)]
pub struct Cli {
    #[arg(
        value_name = "DEVICE_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the virtual device config file, e.g. /etc/virtual-device/device.yaml"
    )]
    pub device_config: PathBuf,

    #[arg(long, help = "Run without registering to kubelet")]
    pub no_register: bool,

    #[arg(long, default_value_t = 2112, help = "Metrics port")]
    pub metrics_port: u16,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_PATH",
        default_value = DEFAULT_DEVICE_PLUGIN_PATH,
        value_parser = parse_device_plugin_path,
        value_hint = clap::ValueHint::DirPath,
        help = "Directory the device plugin socket is created in, an empty value means the default"
    )]
    pub device_plugin_path: PathBuf,

    #[arg(
        long,
        hide = true,
        default_value = KUBELET_SOCKET,
        help = "Kubelet registration socket"
    )]
    pub kubelet_socket: PathBuf,

    #[arg(
        long,
        hide = true,
        default_value = POD_RESOURCES_SOCKET,
        help = "Kubelet pod resources socket"
    )]
    pub pod_resources_socket: PathBuf,
}

/// An empty `DEVICE_PLUGIN_PATH` is treated as unset.
fn parse_device_plugin_path(value: &str) -> Result<PathBuf, Infallible> {
    if value.is_empty() {
        return Ok(PathBuf::from(DEFAULT_DEVICE_PLUGIN_PATH));
    }
    Ok(PathBuf::from(value))
}

/// Errors raised while loading the virtual device config.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Resource name is required.")]
    MissingResourceName,
    #[error("Socket name is required.")]
    MissingSocketName,
    #[error("Count must not be less than 1.")]
    InvalidCount,
    #[error("failed to read device config {path:?}: {message}")]
    Read { path: PathBuf, message: String },
    #[error("failed to parse device config {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Describes the pool of virtual devices advertised to the kubelet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDeviceConfig {
    /// schedulable resource name, e.g. "example.com/foo"
    #[serde(default)]
    pub resource_name: String,
    /// socket file name relative to the device plugin directory
    #[serde(default)]
    pub socket_name: String,
    /// number of virtual devices to advertise
    #[serde(default)]
    pub count: i64,
}

impl VirtualDeviceConfig {
    /// Reads, parses and validates a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let config: Self = serde_yaml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;

        info!("Device config: {config:?}");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resource_name.is_empty() {
            return Err(ConfigError::MissingResourceName);
        }
        if self.socket_name.is_empty() {
            return Err(ConfigError::MissingSocketName);
        }
        if self.count < 1 {
            return Err(ConfigError::InvalidCount);
        }
        Ok(())
    }

    /// Number of devices, only meaningful after [`Self::validate`] succeeded.
    pub fn device_count(&self) -> usize {
        usize::try_from(self.count).unwrap_or(0)
    }

    /// Full path of the plugin socket inside `plugin_dir`.
    pub fn socket_path(&self, plugin_dir: impl AsRef<Path>) -> PathBuf {
        plugin_dir.as_ref().join(&self.socket_name)
    }
}
