use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::DeviceMetrics;
use super::MetricsError;
use crate::uds;

pub mod pod_resources {
    tonic::include_proto!("v1");
}

use pod_resources::pod_resources_lister_client::PodResourcesListerClient;
use pod_resources::ListPodResourcesRequest;
use pod_resources::ListPodResourcesResponse;

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const POD_RESOURCES_TIMEOUT: Duration = Duration::from_secs(10);

/// Keeps the used-device gauge in step with the kubelet's pod-resources API.
pub struct PodResourcesPoller {
    socket_path: PathBuf,
    resource_name: String,
    metrics: Arc<DeviceMetrics>,
    interval: Duration,
    timeout: Duration,
}

impl PodResourcesPoller {
    pub fn new<P: Into<PathBuf>>(
        socket_path: P,
        resource_name: impl Into<String>,
        metrics: Arc<DeviceMetrics>,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            resource_name: resource_name.into(),
            metrics,
            interval: POLL_INTERVAL,
            timeout: POD_RESOURCES_TIMEOUT,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Lists pod resources once and publishes the number of devices in use.
    ///
    /// The gauge keeps its previous value when the kubelet cannot be reached.
    ///
    /// # Errors
    ///
    /// - [`MetricsError::ConnectionFailed`] if the socket cannot be dialed
    /// - [`MetricsError::ListFailed`] if the `List` call fails or times out
    #[tracing::instrument(skip(self), fields(resource_name = %self.resource_name))]
    pub async fn poll_once(&self) -> Result<usize, Report<MetricsError>> {
        let channel = uds::connect(&self.socket_path, Some(self.timeout))
            .await
            .map_err(|e| MetricsError::ConnectionFailed {
                socket: self.socket_path.display().to_string(),
                message: e.to_string(),
            })?;

        let mut client = PodResourcesListerClient::new(channel);
        let response = client
            .list(tonic::Request::new(ListPodResourcesRequest {}))
            .await
            .map_err(|status| MetricsError::ListFailed {
                message: status.message().to_string(),
            })?
            .into_inner();

        debug!(
            "Processing {} pods for allocated devices",
            response.pod_resources.len()
        );

        let used = count_used_devices(&response, &self.resource_name);
        self.metrics.set_used(used);
        debug!("{used} devices in use");
        Ok(used)
    }

    #[tracing::instrument(skip(self, cancellation_token))]
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!("Starting pod resources poller");

        loop {
            if let Err(e) = self.poll_once().await {
                warn!("Failed to update metrics: {e:?}");
            }

            select! {
                _ = cancellation_token.cancelled() => {
                    info!("pod resources poller shutdown requested");
                    break;
                }
                _ = sleep(self.interval) => {}
            }
        }
    }
}

/// Counts the device ids assigned to `resource_name` across all pods and containers.
pub fn count_used_devices(response: &ListPodResourcesResponse, resource_name: &str) -> usize {
    response
        .pod_resources
        .iter()
        .flat_map(|pod| &pod.containers)
        .flat_map(|container| &container.devices)
        .filter(|devices| devices.resource_name == resource_name)
        .map(|devices| devices.device_ids.len())
        .sum()
}
