//! Socket and lifecycle management of the device plugin gRPC server.
//!
//! A [`PluginServer`] moves through `Idle -> Starting -> Serving -> Stopped`
//! exactly once. Stopping is idempotent and never fails; a stopped server
//! cannot be started again.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::device_plugin::api::device_plugin_client::DevicePluginClient;
use crate::device_plugin::api::device_plugin_server::DevicePluginServer;
use crate::device_plugin::api::Empty;
use crate::device_plugin::DevicePluginService;
use crate::device_plugin::VirtualDevicePlugin;
use crate::error::PluginError;
use crate::uds;

/// Upper bound for the self-dial performed before the server is declared ready.
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(5);

/// How long open streams may take to drain on stop before the server task is aborted.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

type ServeHandle = JoinHandle<Result<(), tonic::transport::Error>>;

#[derive(Debug)]
struct Serving {
    cancellation_token: CancellationToken,
    handle: ServeHandle,
}

#[derive(Debug)]
enum Lifecycle {
    Idle,
    Starting,
    Serving(Serving),
    Stopped,
}

/// Owns the device plugin socket and the gRPC server bound to it.
#[derive(Debug)]
pub struct PluginServer {
    device_plugin: Arc<VirtualDevicePlugin>,
    socket_path: PathBuf,
    readiness_timeout: Duration,
    state: Mutex<Lifecycle>,
}

impl PluginServer {
    pub fn new(device_plugin: Arc<VirtualDevicePlugin>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            device_plugin,
            socket_path: socket_path.into(),
            readiness_timeout: READINESS_TIMEOUT,
            state: Mutex::new(Lifecycle::Idle),
        }
    }

    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn device_plugin(&self) -> &Arc<VirtualDevicePlugin> {
        &self.device_plugin
    }

    pub fn is_serving(&self) -> bool {
        matches!(*self.lock_state(), Lifecycle::Serving(_))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds the socket, serves the device plugin in the background and
    /// returns once a client could reach it.
    ///
    /// A leftover socket file from a previous run is removed first. On any
    /// failure everything started so far is torn down again.
    pub async fn start(&self) -> Result<(), PluginError> {
        {
            let mut state = self.lock_state();
            match *state {
                Lifecycle::Idle => *state = Lifecycle::Starting,
                Lifecycle::Starting | Lifecycle::Serving(_) => {
                    return Err(PluginError::AlreadyServing)
                }
                Lifecycle::Stopped => return Err(PluginError::Stopped),
            }
        }

        let serving = match self.spawn_server().await {
            Ok(serving) => serving,
            Err(e) => {
                let mut state = self.lock_state();
                if matches!(*state, Lifecycle::Starting) {
                    *state = Lifecycle::Idle;
                }
                return Err(e);
            }
        };

        let stopped_meanwhile = {
            let mut state = self.lock_state();
            if matches!(*state, Lifecycle::Starting) {
                *state = Lifecycle::Serving(serving);
                None
            } else {
                Some(serving)
            }
        };

        if let Some(serving) = stopped_meanwhile {
            warn!("device plugin server was stopped while starting");
            self.shutdown(serving).await;
            return Err(PluginError::Stopped);
        }

        info!("device plugin server is serving on {:?}", self.socket_path);
        Ok(())
    }

    async fn spawn_server(&self) -> Result<Serving, PluginError> {
        info!("start device plugin server: {:?}", self.socket_path);

        remove_socket(&self.socket_path).map_err(|source| PluginError::StaleSocket {
            path: self.socket_path.clone(),
            source,
        })?;

        let listener = UnixListener::bind(&self.socket_path).map_err(|source| PluginError::Bind {
            path: self.socket_path.clone(),
            source,
        })?;

        let cancellation_token = CancellationToken::new();
        let device_plugin_service =
            DevicePluginService::new(self.device_plugin.clone(), cancellation_token.clone());
        let device_plugin_server = DevicePluginServer::new(device_plugin_service);

        info!("gRPC server is bound to: {:?}", self.socket_path);

        let shutdown_token = cancellation_token.clone();
        let handle = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(device_plugin_server)
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        shutdown_token.cancelled().await;
                        info!("shutting down gRPC server");
                    },
                )
                .await
        });

        let serving = Serving {
            cancellation_token,
            handle,
        };

        if let Err(e) = self.wait_until_ready().await {
            error!("device plugin server failed readiness check: {e}");
            self.shutdown(serving).await;
            return Err(e);
        }

        Ok(serving)
    }

    /// Dials our own socket and performs one call, bounded by the readiness timeout.
    async fn wait_until_ready(&self) -> Result<(), PluginError> {
        let not_ready = |message: String| PluginError::NotReady {
            path: self.socket_path.clone(),
            timeout: self.readiness_timeout,
            message,
        };

        let probe = async {
            let channel = uds::connect(&self.socket_path, Some(self.readiness_timeout))
                .await
                .map_err(|e| not_ready(e.to_string()))?;
            DevicePluginClient::new(channel)
                .get_device_plugin_options(Request::new(Empty {}))
                .await
                .map_err(|status| not_ready(status.to_string()))?;
            Ok::<(), PluginError>(())
        };

        tokio::time::timeout(self.readiness_timeout, probe)
            .await
            .map_err(|_| not_ready("timed out".to_string()))?
    }

    /// Stops serving and removes the socket file. Safe to call in any state
    /// and any number of times.
    pub async fn stop(&self) {
        let previous = {
            let mut state = self.lock_state();
            match *state {
                Lifecycle::Idle | Lifecycle::Stopped => return,
                _ => std::mem::replace(&mut *state, Lifecycle::Stopped),
            }
        };

        // a start in progress notices the state change and unwinds by itself
        if let Lifecycle::Serving(serving) = previous {
            info!("stopping device plugin server on {:?}", self.socket_path);
            self.shutdown(serving).await;
        }
    }

    async fn shutdown(&self, serving: Serving) {
        let Serving {
            cancellation_token,
            mut handle,
        } = serving;
        cancellation_token.cancel();

        match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, &mut handle).await {
            Ok(Ok(Ok(()))) => info!("gRPC server stopped"),
            Ok(Ok(Err(e))) => warn!("gRPC server stopped with error: {e}"),
            Ok(Err(e)) => warn!("gRPC server task failed: {e}"),
            Err(_) => {
                warn!(
                    "gRPC server did not stop within {:?}, aborting",
                    SHUTDOWN_GRACE_PERIOD
                );
                handle.abort();
            }
        }

        if let Err(e) = remove_socket(&self.socket_path) {
            warn!("failed to remove socket {:?}: {e}", self.socket_path);
        }
    }
}

impl Drop for PluginServer {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Lifecycle::Serving(serving) = state {
            serving.cancellation_token.cancel();
        }
    }
}

/// Removes the socket file, a missing file is not an error.
fn remove_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::device::DeviceRegistry;
    use crate::device::DeviceState;

    fn server(socket_path: &Path) -> PluginServer {
        let devices = DeviceState::new(DeviceRegistry::build("foo", 3));
        let plugin = VirtualDevicePlugin::new("foo.sock".to_string(), "foo".to_string(), devices);
        PluginServer::new(plugin, socket_path).with_readiness_timeout(Duration::from_secs(2))
    }

    async fn client(socket_path: &Path) -> DevicePluginClient<tonic::transport::Channel> {
        let channel = uds::connect(socket_path, Some(Duration::from_secs(2)))
            .await
            .expect("should connect to plugin socket");
        DevicePluginClient::new(channel)
    }

    #[test(tokio::test)]
    async fn start_serves_and_stop_removes_socket() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("foo.sock");
        let server = server(&path);

        server.start().await.expect("server should start");
        assert!(server.is_serving());
        assert!(path.exists(), "socket file should exist while serving");

        let options = client(&path)
            .await
            .get_device_plugin_options(Request::new(Empty {}))
            .await
            .expect("options call should succeed")
            .into_inner();
        assert!(!options.pre_start_required);

        server.stop().await;
        assert!(!server.is_serving());
        assert!(!path.exists(), "socket file should be removed on stop");
    }

    #[test(tokio::test)]
    async fn start_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("foo.sock");
        // a listener dropped without unlinking leaves the file behind, like a crash
        drop(std::os::unix::net::UnixListener::bind(&path).expect("should bind stale socket"));
        assert!(path.exists());

        let server = server(&path);
        server.start().await.expect("server should replace stale socket");

        client(&path)
            .await
            .get_device_plugin_options(Request::new(Empty {}))
            .await
            .expect("new server should answer");
        server.stop().await;
    }

    #[test(tokio::test)]
    async fn second_instance_takes_over_socket_path() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("foo.sock");
        let first = server(&path);
        let second = server(&path);

        first.start().await.expect("first server should start");
        second.start().await.expect("second server should start on same path");

        second.stop().await;
        first.stop().await;
        assert!(!path.exists());
    }

    #[test(tokio::test)]
    async fn start_fails_when_socket_dir_is_missing() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("missing").join("foo.sock");
        let server = server(&path);

        let err = server.start().await.expect_err("bind should fail");

        assert!(matches!(err, PluginError::Bind { .. }), "got {err:?}");
        assert!(!server.is_serving());
    }

    #[test(tokio::test)]
    async fn start_fails_when_stale_path_cannot_be_removed() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("foo.sock");
        std::fs::create_dir(&path).expect("should create blocking directory");

        let err = server(&path)
            .start()
            .await
            .expect_err("cleanup should fail on a directory");

        assert!(matches!(err, PluginError::StaleSocket { .. }), "got {err:?}");
    }

    #[test(tokio::test)]
    async fn start_twice_is_rejected() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let server = server(&dir.path().join("foo.sock"));

        server.start().await.expect("server should start");
        let err = server.start().await.expect_err("second start should fail");

        assert!(matches!(err, PluginError::AlreadyServing), "got {err:?}");
        server.stop().await;
    }

    #[test(tokio::test)]
    async fn stopped_server_cannot_restart() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let server = server(&dir.path().join("foo.sock"));

        server.start().await.expect("server should start");
        server.stop().await;
        let err = server.start().await.expect_err("restart should fail");

        assert!(matches!(err, PluginError::Stopped), "got {err:?}");
    }

    #[test(tokio::test)]
    async fn stop_is_idempotent() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("foo.sock");

        let never_started = server(&path);
        never_started.stop().await;
        never_started.stop().await;
        assert!(!path.exists());

        let started = server(&path);
        started.start().await.expect("server should start");
        started.stop().await;
        started.stop().await;
        assert!(!path.exists());
    }

    #[test(tokio::test)]
    async fn stop_closes_open_device_list_streams() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("foo.sock");
        let server = server(&path);
        server.start().await.expect("server should start");

        let mut stream = client(&path)
            .await
            .list_and_watch(Request::new(Empty {}))
            .await
            .expect("stream should open")
            .into_inner();
        let initial = stream
            .message()
            .await
            .expect("initial list")
            .expect("initial list present");
        assert_eq!(initial.devices.len(), 3);

        server.stop().await;

        let next = tokio::time::timeout(Duration::from_secs(2), stream.message())
            .await
            .expect("stream should end after stop");
        assert!(
            !matches!(next, Ok(Some(_))),
            "no further device list expected, got {next:?}"
        );
    }

    #[test(tokio::test)]
    async fn readiness_probe_fails_without_listener() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let server = server(&dir.path().join("foo.sock"))
            .with_readiness_timeout(Duration::from_millis(200));

        let err = server
            .wait_until_ready()
            .await
            .expect_err("nothing is listening");

        assert!(matches!(err, PluginError::NotReady { .. }), "got {err:?}");
    }
}
