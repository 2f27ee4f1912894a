use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use poem::get;
use poem::handler;
use poem::http::StatusCode;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::web::Data;
use poem::Endpoint;
use poem::EndpointExt;
use poem::Response;
use poem::Route;
use poem::Server;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;

use super::DeviceMetrics;
use super::MetricsError;

const METRICS_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

/// Serves `GET /metrics` over plain HTTP.
pub struct MetricsServer {
    listen_addr: String,
    metrics: Arc<DeviceMetrics>,
}

impl MetricsServer {
    /// Listens on every interface at `port`.
    pub fn new(port: u16, metrics: Arc<DeviceMetrics>) -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{port}"),
            metrics,
        }
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    /// Run until cancelled.
    ///
    /// # Errors
    ///
    /// - [`MetricsError::ServerFailed`] if the address cannot be bound or the server stops on its own
    pub async fn run(
        self,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<MetricsError>> {
        info!("Starting metrics server on {}", self.listen_addr);

        let app = build_routes(self.metrics);
        let listener = TcpListener::bind(&self.listen_addr);

        match Server::new(listener)
            .run_with_graceful_shutdown(
                app,
                cancellation_token.cancelled_owned(),
                Some(METRICS_SHUTDOWN_TIMEOUT),
            )
            .await
        {
            Ok(()) => {
                info!("metrics server stopped");
                Ok(())
            }
            Err(e) => {
                error!("metrics server failed: {e}");
                Err(Report::new(MetricsError::ServerFailed {
                    message: format!("{}: {e}", self.listen_addr),
                }))
            }
        }
    }
}

pub fn build_routes(metrics: Arc<DeviceMetrics>) -> impl Endpoint {
    Route::new()
        .at("/metrics", get(render_metrics))
        .data(metrics)
        .with(Tracing)
}

#[handler]
async fn render_metrics(metrics: Data<&Arc<DeviceMetrics>>) -> poem::Result<Response> {
    let body = metrics.encode().map_err(|e| {
        poem::Error::from_string(
            format!("failed to encode metrics: {e}"),
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    })?;

    Ok(Response::builder().content_type(TEXT_FORMAT).body(body))
}
