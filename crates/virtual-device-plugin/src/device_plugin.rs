#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use api::device_plugin_server::DevicePlugin;
use api::AllocateRequest;
use api::AllocateResponse;
use api::ContainerAllocateResponse;
use api::DevicePluginOptions;
use api::Empty;
use api::ListAndWatchResponse;
use api::PreStartContainerRequest;
use api::PreStartContainerResponse;
use api::PreferredAllocationRequest;
use api::PreferredAllocationResponse;
use api::RegisterRequest;
use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::VirtualDeviceConfig;
use crate::device::DeviceState;
use crate::device::UnknownDevice;

/// Device plugin API version this plugin speaks.
pub const API_VERSION: &str = "v1beta1";

/// Virtual Device Plugin for Kubernetes
#[derive(Debug)]
pub struct VirtualDevicePlugin {
    /// device plugin socket name, relative to the device plugin directory
    endpoint: String,
    /// resource name (e.g. "example.com/foo")
    resource_name: String,
    /// device plugin options
    options: DevicePluginOptions,
    devices: DeviceState,
}

impl VirtualDevicePlugin {
    /// create a new Virtual Device Plugin instance
    pub fn new(endpoint: String, resource_name: String, devices: DeviceState) -> Arc<Self> {
        let options = DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        };

        Arc::new(Self {
            endpoint,
            resource_name,
            options,
            devices,
        })
    }

    pub fn from_config(config: &VirtualDeviceConfig, devices: DeviceState) -> Arc<Self> {
        Self::new(
            config.socket_name.clone(),
            config.resource_name.clone(),
            devices,
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn options(&self) -> DevicePluginOptions {
        self.options
    }

    pub fn devices(&self) -> &DeviceState {
        &self.devices
    }

    /// Request announcing this plugin to the kubelet.
    pub fn register_request(&self) -> RegisterRequest {
        RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: self.endpoint.clone(),
            resource_name: self.resource_name.clone(),
            options: Some(self.options),
        }
    }

    /// Environment variable carrying the allocated ids, e.g. `VIRTUAL_DEVICE_EXAMPLE_COM_FOO`.
    ///
    /// Every character of the resource name that is not an ASCII letter or
    /// digit becomes `_`, not only `-`. Consumers that expected
    /// `VIRTUAL_DEVICE_EXAMPLE.COM/FOO` for `example.com/foo` must switch to
    /// the underscored name, which is a valid shell identifier.
    pub fn env_var_name(&self) -> String {
        let suffix: String = self
            .resource_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("VIRTUAL_DEVICE_{suffix}")
    }

    pub fn annotation_key(&self) -> String {
        format!("virtual-device/{}", self.resource_name)
    }

    fn list_response(&self) -> ListAndWatchResponse {
        let devices = self
            .devices
            .snapshot()
            .iter()
            .map(api::Device::from)
            .collect();
        ListAndWatchResponse { devices }
    }

    /// Validates every requested id up front so that a bad request never
    /// produces a partial response. No reservation is recorded.
    pub fn allocate(&self, request: &AllocateRequest) -> Result<AllocateResponse, UnknownDevice> {
        for container_req in &request.container_requests {
            self.devices.validate(container_req.devices_ids.as_slice())?;
        }

        let env_name = self.env_var_name();
        let annotation_key = self.annotation_key();
        let container_responses = request
            .container_requests
            .iter()
            .map(|container_req| {
                let device_ids = container_req.devices_ids.join(",");
                ContainerAllocateResponse {
                    envs: HashMap::from([(env_name.clone(), device_ids.clone())]),
                    annotations: HashMap::from([(annotation_key.clone(), device_ids)]),
                    ..Default::default()
                }
            })
            .collect();

        Ok(AllocateResponse {
            container_responses,
        })
    }
}

/// DevicePlugin service implementation
/// serves the device list and allocations of a [`VirtualDevicePlugin`]
#[derive(Debug)]
pub struct DevicePluginService {
    device_plugin: Arc<VirtualDevicePlugin>,
    /// cancelled when the server stops, ends every open device list stream
    cancellation_token: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        device_plugin: Arc<VirtualDevicePlugin>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            device_plugin,
            cancellation_token,
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    /// get device plugin options
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");

        Ok(Response::new(self.device_plugin.options()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// list devices and resend the whole list on every health change
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch device list");

        let (tx, rx) = mpsc::unbounded_channel();
        // subscribe before the first snapshot so no transition falls in between
        let mut health_rx = self.device_plugin.devices().subscribe();
        let device_plugin = self.device_plugin.clone();
        let cancellation_token = self.cancellation_token.clone();

        if tx.send(Ok(device_plugin.list_response())).is_err() {
            return Err(Status::internal("failed to send initial device list"));
        }

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("device watch task stopped");
                        break;
                    }
                    _ = tx.closed() => {
                        info!("device list watcher disconnected");
                        break;
                    }
                    event = health_rx.recv() => {
                        match event {
                            Ok(device) => {
                                info!("device {} is {}, resending device list", device.id, device.health);
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                warn!("missed {skipped} health notifications, resending device list");
                            }
                            Err(RecvError::Closed) => {
                                info!("health notifications closed, device watch task stopped");
                                break;
                            }
                        }
                        if let Err(e) = tx.send(Ok(device_plugin.list_response())) {
                            error!("failed to send device list: {e}");
                            break;
                        }
                    }
                }
            }
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    /// preferred allocation is not offered, kubelet never calls this
    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        debug!("getting preferred device allocation: {:?}", req);
        let response = PreferredAllocationResponse {
            container_responses: vec![],
        };
        Ok(Response::new(response))
    }

    /// allocate devices to container
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!("allocating devices to containers: {:?}", req);

        match self.device_plugin.allocate(&req) {
            Ok(response) => {
                info!(
                    "device allocation completed for {} containers",
                    response.container_responses.len()
                );
                Ok(Response::new(response))
            }
            Err(e) => {
                error!("can't allocate device {}", e.0);
                Err(Status::invalid_argument(format!(
                    "invalid allocation request: {e}"
                )))
            }
        }
    }

    /// pre-start container, never required by this plugin
    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.into_inner());
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
