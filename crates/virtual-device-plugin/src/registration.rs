use std::path::Path;

use tonic::Request;
use tracing::info;

use crate::device_plugin::api::registration_client::RegistrationClient;
use crate::device_plugin::VirtualDevicePlugin;
use crate::error::PluginError;
use crate::uds;

/// register device plugin with kubelet
///
/// The plugin server must already be serving, the kubelet dials back into
/// the advertised endpoint as soon as it accepts the registration.
pub async fn register_with_kubelet(
    device_plugin: &VirtualDevicePlugin,
    kubelet_socket: impl AsRef<Path>,
) -> Result<(), PluginError> {
    let kubelet_socket = kubelet_socket.as_ref();
    info!(
        "registering device plugin {} with kubelet: {:?}",
        device_plugin.resource_name(),
        kubelet_socket
    );

    let channel =
        uds::connect(kubelet_socket, None)
            .await
            .map_err(|e| PluginError::KubeletUnreachable {
                path: kubelet_socket.to_path_buf(),
                message: e.to_string(),
            })?;
    let mut client = RegistrationClient::new(channel);

    client
        .register(Request::new(device_plugin.register_request()))
        .await
        .map_err(|status| PluginError::RegistrationRejected {
            message: status.message().to_string(),
        })?;

    info!("successfully registered device plugin with kubelet");
    Ok(())
}
