//! Device usage metrics.
//!
//! Two gauges labelled with the resource name are exported in the
//! Prometheus text format: the configured device count, set once, and the
//! number of devices the kubelet reports as assigned to containers,
//! refreshed by [`poller::PodResourcesPoller`].

use core::error::Error;

use prometheus::Encoder;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;

pub mod poller;
pub mod server;

pub use poller::PodResourcesPoller;
pub use server::MetricsServer;

/// Errors raised by the metrics poller and the metrics HTTP server.
#[derive(Debug, derive_more::Display)]
pub enum MetricsError {
    #[display("Failed to register metrics: {message}")]
    Registration { message: String },
    #[display("Failed to connect to {socket}: {message}")]
    ConnectionFailed { socket: String, message: String },
    #[display("Failure getting pod resources: {message}")]
    ListFailed { message: String },
    #[display("Metrics server failed: {message}")]
    ServerFailed { message: String },
}

impl Error for MetricsError {}

/// Gauges of one device plugin, held in their own registry.
#[derive(Debug, Clone)]
pub struct DeviceMetrics {
    registry: Registry,
    total_count: IntGauge,
    used_count: IntGauge,
}

impl DeviceMetrics {
    pub fn new(resource_name: &str, total: usize) -> Result<Self, MetricsError> {
        let registration = |e: prometheus::Error| MetricsError::Registration {
            message: e.to_string(),
        };

        let registry = Registry::new();
        let total_count = IntGauge::with_opts(
            Opts::new("virtual_device_total_count", "The total count of virtual device")
                .const_label("resourceName", resource_name),
        )
        .map_err(registration)?;
        let used_count = IntGauge::with_opts(
            Opts::new("virtual_device_used_count", "The used count of virtual device")
                .const_label("resourceName", resource_name),
        )
        .map_err(registration)?;

        registry
            .register(Box::new(total_count.clone()))
            .map_err(registration)?;
        registry
            .register(Box::new(used_count.clone()))
            .map_err(registration)?;

        total_count.set(saturating_i64(total));

        Ok(Self {
            registry,
            total_count,
            used_count,
        })
    }

    pub fn total(&self) -> i64 {
        self.total_count.get()
    }

    pub fn used(&self) -> i64 {
        self.used_count.get()
    }

    pub fn set_used(&self, used: usize) {
        self.used_count.set(saturating_i64(used));
    }

    /// Renders all gauges in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn saturating_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
