use std::path::Path;
use std::time::Duration;

use similar_asserts::assert_eq;
use test_log::test;
use tokio_stream::StreamExt;
use tonic::transport::Channel;
use tonic::Code;
use virtual_device_plugin::config::VirtualDeviceConfig;
use virtual_device_plugin::device::DeviceHealth;
use virtual_device_plugin::device::DeviceRegistry;
use virtual_device_plugin::device::DeviceState;
use virtual_device_plugin::device_plugin::api::device_plugin_client::DevicePluginClient;
use virtual_device_plugin::device_plugin::api::AllocateRequest;
use virtual_device_plugin::device_plugin::api::ContainerAllocateRequest;
use virtual_device_plugin::device_plugin::api::Empty;
use virtual_device_plugin::device_plugin::api::ListAndWatchResponse;
use virtual_device_plugin::device_plugin::VirtualDevicePlugin;
use virtual_device_plugin::plugin_server::PluginServer;
use virtual_device_plugin::uds;

const TIMEOUT: Duration = Duration::from_secs(5);

fn foo_config() -> VirtualDeviceConfig {
    VirtualDeviceConfig {
        resource_name: "foo".to_string(),
        socket_name: "foo.sock".to_string(),
        count: 10,
    }
}

async fn start_plugin(dir: &Path) -> (PluginServer, DevicePluginClient<Channel>) {
    let config = foo_config();
    let devices = DeviceState::new(DeviceRegistry::build(
        &config.resource_name,
        config.device_count(),
    ));
    let server = PluginServer::new(
        VirtualDevicePlugin::from_config(&config, devices),
        config.socket_path(dir),
    );
    server.start().await.expect("plugin server should start");

    let channel = uds::connect(server.socket_path(), Some(TIMEOUT))
        .await
        .expect("should connect to plugin socket");
    (server, DevicePluginClient::new(channel))
}

fn allocate_request(ids: &[&str]) -> AllocateRequest {
    AllocateRequest {
        container_requests: vec![ContainerAllocateRequest {
            devices_ids: ids.iter().map(|id| id.to_string()).collect(),
        }],
    }
}

fn health_of(response: &ListAndWatchResponse, id: &str) -> String {
    response
        .devices
        .iter()
        .find(|device| device.id == id)
        .map(|device| device.health.clone())
        .unwrap_or_else(|| panic!("{id} should be listed"))
}

#[test(tokio::test)]
async fn options_report_no_optional_calls() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let (server, mut client) = start_plugin(dir.path()).await;

    let options = client
        .get_device_plugin_options(Empty {})
        .await
        .expect("options call should succeed")
        .into_inner();

    assert!(!options.pre_start_required);
    assert!(!options.get_preferred_allocation_available);
    server.stop().await;
}

#[test(tokio::test)]
async fn list_and_watch_streams_initial_devices_and_updates() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let (server, mut client) = start_plugin(dir.path()).await;

    let mut stream = client
        .list_and_watch(Empty {})
        .await
        .expect("list and watch should open")
        .into_inner();

    let first = tokio::time::timeout(TIMEOUT, stream.next())
        .await
        .expect("initial list should arrive")
        .expect("stream should be open")
        .expect("initial list should be ok");
    let ids: Vec<_> = first.devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["foo-1", "foo-2", "foo-3", "foo-4", "foo-5", "foo-6", "foo-7", "foo-8", "foo-9", "foo-10"]
    );
    assert!(first.devices.iter().all(|d| d.health == "Healthy"));

    let changed = server
        .device_plugin()
        .devices()
        .set_health("foo-4", DeviceHealth::Unhealthy)
        .expect("foo-4 is known");
    assert!(changed);

    let update = tokio::time::timeout(TIMEOUT, stream.next())
        .await
        .expect("update should arrive")
        .expect("stream should be open")
        .expect("update should be ok");
    assert_eq!(update.devices.len(), 10);
    assert_eq!(health_of(&update, "foo-4"), "Unhealthy");
    assert_eq!(health_of(&update, "foo-5"), "Healthy");

    server.stop().await;

    let end = tokio::time::timeout(TIMEOUT, stream.next())
        .await
        .expect("stream should end once the server stops");
    assert!(end.map_or(true, |item| item.is_err()));
}

#[test(tokio::test)]
async fn allocate_exposes_ids_as_env_and_annotation() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let (server, mut client) = start_plugin(dir.path()).await;

    let response = client
        .allocate(allocate_request(&["foo-1", "foo-3"]))
        .await
        .expect("allocation should succeed")
        .into_inner();

    assert_eq!(response.container_responses.len(), 1);
    let container = &response.container_responses[0];
    assert_eq!(
        container.envs.get("VIRTUAL_DEVICE_FOO").map(String::as_str),
        Some("foo-1,foo-3")
    );
    assert_eq!(
        container.annotations.get("virtual-device/foo").map(String::as_str),
        Some("foo-1,foo-3")
    );
    assert!(container.mounts.is_empty());
    assert!(container.devices.is_empty());
    server.stop().await;
}

#[test(tokio::test)]
async fn allocate_rejects_unknown_device() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let (server, mut client) = start_plugin(dir.path()).await;

    let status = client
        .allocate(allocate_request(&["foo-1", "foo-99"]))
        .await
        .expect_err("foo-99 does not exist");

    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(
        status.message().contains("foo-99"),
        "message: {}",
        status.message()
    );
    server.stop().await;
}

#[test(tokio::test)]
async fn stop_removes_socket_and_refuses_new_clients() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let (server, _client) = start_plugin(dir.path()).await;
    let socket = server.socket_path().to_path_buf();
    assert!(socket.exists());

    server.stop().await;

    assert!(!socket.exists());
    assert!(uds::connect(&socket, Some(Duration::from_secs(1)))
        .await
        .is_err());
}

#[test(tokio::test)]
async fn shared_device_state_feeds_every_watcher() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let (server, mut client) = start_plugin(dir.path()).await;

    let mut first = client
        .list_and_watch(Empty {})
        .await
        .expect("first watch should open")
        .into_inner();
    let mut second = client
        .list_and_watch(Empty {})
        .await
        .expect("second watch should open")
        .into_inner();
    for stream in [&mut first, &mut second] {
        tokio::time::timeout(TIMEOUT, stream.next())
            .await
            .expect("initial list should arrive")
            .expect("stream should be open")
            .expect("initial list should be ok");
    }

    server
        .device_plugin()
        .devices()
        .set_health("foo-10", DeviceHealth::Unhealthy)
        .expect("foo-10 is known");

    for stream in [&mut first, &mut second] {
        let update = tokio::time::timeout(TIMEOUT, stream.next())
            .await
            .expect("update should arrive")
            .expect("stream should be open")
            .expect("update should be ok");
        assert_eq!(health_of(&update, "foo-10"), "Unhealthy");
    }

    server.stop().await;
}
