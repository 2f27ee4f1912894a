use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::app::tasks::ShutdownSignals;
use crate::app::tasks::Tasks;
use crate::config::Cli;
use crate::config::VirtualDeviceConfig;
use crate::device::DeviceRegistry;
use crate::device::DeviceState;
use crate::device_plugin::VirtualDevicePlugin;
use crate::metrics::DeviceMetrics;
use crate::plugin_server::PluginServer;
use crate::registration::register_with_kubelet;

/// Application core structure with explicit dependencies
pub struct Application {
    cli: Cli,
    config: VirtualDeviceConfig,
    plugin_server: Arc<PluginServer>,
    metrics: Arc<DeviceMetrics>,
}

impl Application {
    /// Loads the device config and builds every component without touching
    /// the filesystem or the network.
    pub fn build(cli: Cli) -> Result<Self> {
        let config = VirtualDeviceConfig::load(&cli.device_config)?;

        let devices = DeviceState::new(DeviceRegistry::build(
            &config.resource_name,
            config.device_count(),
        ));
        let device_plugin = VirtualDevicePlugin::from_config(&config, devices);
        let plugin_server = Arc::new(PluginServer::new(
            device_plugin,
            config.socket_path(&cli.device_plugin_path),
        ));
        let metrics = Arc::new(
            DeviceMetrics::new(&config.resource_name, config.device_count())
                .context("failed to create device metrics")?,
        );

        Ok(Self {
            cli,
            config,
            plugin_server,
            metrics,
        })
    }

    pub fn cli(&self) -> &Cli {
        &self.cli
    }

    pub fn config(&self) -> &VirtualDeviceConfig {
        &self.config
    }

    pub fn plugin_server(&self) -> &Arc<PluginServer> {
        &self.plugin_server
    }

    pub fn metrics(&self) -> &Arc<DeviceMetrics> {
        &self.metrics
    }

    /// Serve and register the device plugin, then run the background tasks
    /// until a termination signal arrives or one of them gives up.
    ///
    /// Signal handlers are installed before anything else so that a signal
    /// during startup shuts down gracefully as well.
    pub async fn run(&self) -> Result<()> {
        let shutdown = CancellationToken::new();
        let signals = ShutdownSignals::install().context("failed to install signal handlers")?;
        let forwarder = signals.forward_to(shutdown.clone());

        let result = self.run_until(shutdown.clone()).await;

        shutdown.cancel();
        if let Err(e) = forwarder.await {
            warn!("signal forwarder failed: {e}");
        }
        result
    }

    /// Like [`Self::run`], but stops when `shutdown` is cancelled instead of
    /// listening for signals. A shutdown is never an error.
    pub async fn run_until(&self, shutdown: CancellationToken) -> Result<()> {
        let start = self.plugin_server.start();
        tokio::pin!(start);
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("shutdown requested while starting the device plugin server");
                // a start in flight may already own the socket, let it finish first
                if let Err(e) = start.await {
                    warn!("device plugin server did not start: {e}");
                }
                self.plugin_server.stop().await;
                return Ok(());
            }
            result = &mut start => result?,
        }

        if self.cli.no_register {
            info!("kubelet registration disabled");
        } else {
            let registration =
                register_with_kubelet(self.plugin_server.device_plugin(), &self.cli.kubelet_socket);
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("shutdown requested during kubelet registration");
                    self.plugin_server.stop().await;
                    return Ok(());
                }
                result = registration => {
                    if let Err(e) = result {
                        self.plugin_server.stop().await;
                        return Err(e.into());
                    }
                }
            }
        }

        let mut tasks = Tasks::new();
        tasks.spawn_all_tasks(self);

        let result = tasks.wait_for_completion(&shutdown).await;
        self.plugin_server.stop().await;

        info!("Application run completed");
        result
    }
}
