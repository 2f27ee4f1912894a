use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use tokio::signal::unix::signal;
use tokio::signal::unix::Signal;
use tokio::signal::unix::SignalKind;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::core::Application;
use crate::health::HealthMonitor;
use crate::health::LoggingHealthCheck;
use crate::metrics::MetricsServer;
use crate::metrics::PodResourcesPoller;

const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Task manager, responsible for starting and managing all background tasks
pub struct Tasks {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Start all background tasks
    pub fn spawn_all_tasks(&mut self, app: &Application) {
        let health_task = self.spawn_health_monitor_task(app);
        self.push("health monitor", health_task);

        let poller_task = self.spawn_pod_resources_poller_task(app);
        self.push("pod resources poller", poller_task);

        let metrics_server_task = self.spawn_metrics_server_task(app);
        self.push("metrics server", metrics_server_task);
    }

    pub fn push(&mut self, name: &'static str, task: JoinHandle<()>) {
        self.tasks.push((name, task));
    }

    /// Wait for `shutdown` or for any task to exit, then cancel and collect
    /// the rest.
    ///
    /// Every task is expected to run until cancelled, so one finishing on
    /// its own is reported as an error.
    pub async fn wait_for_completion(&mut self, shutdown: &CancellationToken) -> Result<()> {
        if self.tasks.is_empty() {
            shutdown.cancelled().await;
            self.cancellation_token.cancel();
            return Ok(());
        }

        let finished = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown requested, cancelling all tasks");
                None
            }
            (result, index, _) = futures::future::select_all(
                self.tasks.iter_mut().map(|(_, task)| task),
            ) => Some((index, result)),
        };

        self.cancellation_token.cancel();

        let outcome = match finished {
            None => Ok(()),
            Some((index, result)) => {
                let (name, _) = self.tasks.remove(index);
                match result {
                    Ok(()) => tracing::error!("{name} task exited unexpectedly"),
                    Err(e) => tracing::error!("{name} task failed: {e}"),
                }
                Err(anyhow!("{name} task exited unexpectedly"))
            }
        };

        self.wait_for_tasks_with_timeout(TASK_SHUTDOWN_TIMEOUT).await;
        outcome
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for (name, task) in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("{name} task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }

    fn spawn_health_monitor_task(&self, app: &Application) -> JoinHandle<()> {
        let monitor = HealthMonitor::new(
            app.plugin_server().device_plugin().devices().clone(),
            Arc::new(LoggingHealthCheck),
        );
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            monitor.run(token).await;
            tracing::info!("Health monitor task completed");
        })
    }

    fn spawn_pod_resources_poller_task(&self, app: &Application) -> JoinHandle<()> {
        let poller = PodResourcesPoller::new(
            app.cli().pod_resources_socket.clone(),
            app.config().resource_name.clone(),
            app.metrics().clone(),
        );
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            poller.run(token).await;
            tracing::info!("Pod resources poller task completed");
        })
    }

    fn spawn_metrics_server_task(&self, app: &Application) -> JoinHandle<()> {
        let server = MetricsServer::new(app.cli().metrics_port, app.metrics().clone());
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            if let Err(e) = server.run(token).await {
                tracing::error!("Metrics server failed: {e:?}");
            } else {
                tracing::info!("Metrics server task completed");
            }
        })
    }
}

/// Termination signals, registered as soon as the value exists so that a
/// signal arriving during startup is never handled by the default action.
pub struct ShutdownSignals {
    sigint: Signal,
    sigterm: Signal,
    sighup: Signal,
    sigquit: Signal,
}

impl ShutdownSignals {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sighup: signal(SignalKind::hangup())?,
            sigquit: signal(SignalKind::quit())?,
        })
    }

    /// Waits for the next signal and returns its name.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sighup.recv() => "SIGHUP",
            _ = self.sigquit.recv() => "SIGQUIT",
        }
    }

    /// Cancels `shutdown` on the first signal. The task ends with the token.
    pub fn forward_to(mut self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                name = self.recv() => {
                    tracing::info!("Received {name}, initiating graceful shutdown");
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        })
    }
}
