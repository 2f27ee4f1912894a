//! gRPC client channels over unix domain sockets.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;

/// Opens a channel to the gRPC server listening on `socket_path`.
///
/// The connection is established eagerly. With `timeout` set, both the
/// connect and every request on the channel are bounded by it.
pub async fn connect(
    socket_path: impl AsRef<Path>,
    timeout: Option<Duration>,
) -> Result<Channel, io::Error> {
    let socket_path: PathBuf = socket_path.as_ref().to_path_buf();

    // the authority is a placeholder, the connector always dials the socket
    let mut endpoint = Endpoint::from_static("http://[::]:50051");
    if let Some(timeout) = timeout {
        endpoint = endpoint.timeout(timeout);
    }

    let connecting = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let socket_path = socket_path.clone();
        async move { UnixStream::connect(socket_path).await.map(TokioIo::new) }
    }));

    let channel = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?,
        None => connecting.await,
    };

    channel.map_err(|e| io::Error::other(format!("{e:?}")))
}
