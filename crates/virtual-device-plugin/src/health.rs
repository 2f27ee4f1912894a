//! Periodic device health evaluation.
//!
//! Virtual devices have no hardware to probe, so the default check only logs
//! the registry. A real probe implements [`DeviceHealthCheck`]; the monitor
//! applies whatever transitions it reports through [`DeviceState`], which in
//! turn wakes every open device list stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::device::Device;
use crate::device::DeviceHealth;
use crate::device::DeviceState;

pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub device_id: String,
    pub health: DeviceHealth,
}

/// Evaluates the health of every device and reports the ones that changed.
#[async_trait]
pub trait DeviceHealthCheck: Send + Sync {
    async fn evaluate(&self, devices: &[Device]) -> Vec<HealthTransition>;
}

/// Reports every device as unchanged.
#[derive(Debug, Default)]
pub struct LoggingHealthCheck;

#[async_trait]
impl DeviceHealthCheck for LoggingHealthCheck {
    async fn evaluate(&self, devices: &[Device]) -> Vec<HealthTransition> {
        info!(?devices, "device health check");
        Vec::new()
    }
}

pub struct HealthMonitor {
    devices: DeviceState,
    check: Arc<dyn DeviceHealthCheck>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(devices: DeviceState, check: Arc<dyn DeviceHealthCheck>) -> Self {
        Self {
            devices,
            check,
            interval: HEALTH_CHECK_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs one evaluation and applies its transitions, returning how many changed a device.
    pub async fn check_once(&self) -> usize {
        let snapshot = self.devices.snapshot();
        let transitions = self.check.evaluate(&snapshot).await;

        let mut changed = 0;
        for transition in transitions {
            match self
                .devices
                .set_health(&transition.device_id, transition.health)
            {
                Ok(true) => {
                    info!(
                        "device {} became {}",
                        transition.device_id, transition.health
                    );
                    changed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!("health check reported {e}"),
            }
        }
        changed
    }

    #[tracing::instrument(skip(self, cancellation_token))]
    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!("Starting device health monitor");
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("device health monitor shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.check_once().await;
                }
            }
        }
    }
}
