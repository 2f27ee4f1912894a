//! Virtual device registry.
//!
//! The registry is built once from the device config and never grows or
//! shrinks. Health changes go through [`DeviceState::set_health`], which
//! updates the registry before broadcasting the changed device so that any
//! snapshot taken in reaction to the notification already observes it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::device_plugin::api;

/// Capacity of the health notification channel per subscriber.
const HEALTH_CHANNEL_CAPACITY: usize = 64;

/// Displays as the health string of the device plugin wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum DeviceHealth {
    #[display("Healthy")]
    Healthy,
    #[display("Unhealthy")]
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub health: DeviceHealth,
}

impl From<&Device> for api::Device {
    fn from(device: &Device) -> Self {
        api::Device {
            id: device.id.clone(),
            health: device.health.to_string(),
            topology: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown device: {0}")]
pub struct UnknownDevice(pub String);

/// Fixed set of virtual devices, kept in index order.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
    index: HashMap<String, usize>,
}

impl DeviceRegistry {
    /// Creates `count` healthy devices named `<resource_name>-1` .. `<resource_name>-<count>`.
    pub fn build(resource_name: &str, count: usize) -> Self {
        let devices: Vec<Device> = (1..=count)
            .map(|i| Device {
                id: format!("{resource_name}-{i}"),
                health: DeviceHealth::Healthy,
            })
            .collect();
        let index = devices
            .iter()
            .enumerate()
            .map(|(pos, device)| (device.id.clone(), pos))
            .collect();

        Self { devices, index }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn lookup(&self, id: &str) -> Result<&Device, UnknownDevice> {
        self.index
            .get(id)
            .map(|&pos| &self.devices[pos])
            .ok_or_else(|| UnknownDevice(id.to_string()))
    }

    /// Devices in index order.
    pub fn snapshot(&self) -> Vec<Device> {
        self.devices.clone()
    }

    /// Fails on the first id that is not part of the registry.
    pub fn validate<S: AsRef<str>>(&self, ids: &[S]) -> Result<(), UnknownDevice> {
        for id in ids {
            self.lookup(id.as_ref())?;
        }
        Ok(())
    }

    /// Returns the updated device, or `None` when the health did not change.
    fn set_health(&mut self, id: &str, health: DeviceHealth) -> Result<Option<Device>, UnknownDevice> {
        let pos = *self
            .index
            .get(id)
            .ok_or_else(|| UnknownDevice(id.to_string()))?;
        let device = &mut self.devices[pos];
        if device.health == health {
            return Ok(None);
        }
        device.health = health;
        Ok(Some(device.clone()))
    }
}

/// Registry shared between the protocol service and the health monitor,
/// paired with the broadcast channel announcing health transitions.
#[derive(Debug, Clone)]
pub struct DeviceState {
    registry: Arc<RwLock<DeviceRegistry>>,
    health_tx: broadcast::Sender<Device>,
}

impl DeviceState {
    pub fn new(registry: DeviceRegistry) -> Self {
        let (health_tx, _) = broadcast::channel(HEALTH_CHANNEL_CAPACITY);
        Self {
            registry: Arc::new(RwLock::new(registry)),
            health_tx,
        }
    }

    pub fn snapshot(&self) -> Vec<Device> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    pub fn lookup(&self, id: &str) -> Result<Device, UnknownDevice> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(id)
            .cloned()
    }

    pub fn validate<S: AsRef<str>>(&self, ids: &[S]) -> Result<(), UnknownDevice> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .validate(ids)
    }

    pub fn len(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receives every device whose health changed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Device> {
        self.health_tx.subscribe()
    }

    /// Records a health transition and notifies subscribers.
    ///
    /// Returns `Ok(false)` when the device already had the requested health,
    /// in which case nothing is broadcast.
    pub fn set_health(&self, id: &str, health: DeviceHealth) -> Result<bool, UnknownDevice> {
        let updated = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_health(id, health)?;

        let Some(device) = updated else {
            return Ok(false);
        };

        debug!("device {} is now {}", device.id, device.health);
        if self.health_tx.send(device).is_err() {
            debug!("no device list watchers, {id} will be reported on next subscription");
        }
        Ok(true)
    }
}
