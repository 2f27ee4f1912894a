//! Kubernetes device plugin advertising a fixed pool of virtual devices.
//!
//! The plugin serves the kubelet device plugin API on a unix socket in the
//! kubelet's plugin directory, registers its resource name with the kubelet
//! and exports how many of its devices are currently assigned to pods.

pub mod app;
pub mod config;
pub mod device;
pub mod device_plugin;
pub mod error;
pub mod health;
pub mod metrics;
pub mod plugin_server;
pub mod registration;
pub mod uds;
