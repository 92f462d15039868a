//! Sub-device store
//!
//! The gateway keeps the platform's list of its sub-devices together with the
//! list version. Add and delete are gated on the version: an update whose
//! version is not newer than the stored one is ignored.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::Result;

/// A sub-device known to the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDeviceRecord {
    /// Stable id the device logs in with
    pub node_id: String,
    /// Platform device id
    pub device_id: String,
    /// Platform product id
    pub product_id: Option<String>,
    /// List version the record arrived with
    pub version: i64,
}

/// Storage for the sub-device list
#[async_trait]
pub trait SubDeviceStore: Send + Sync {
    /// Look up a sub-device by node id
    async fn get_sub_device(&self, node_id: &str) -> Result<Option<SubDeviceRecord>>;

    /// Add or overwrite sub-devices
    ///
    /// Returns `false`, leaving the store untouched, if `version` is not
    /// newer than the stored version.
    async fn add_sub_devices(&self, devices: &[SubDeviceRecord], version: i64) -> Result<bool>;

    /// Delete sub-devices by node id, version-gated like [`Self::add_sub_devices`]
    async fn delete_sub_devices(&self, devices: &[SubDeviceRecord], version: i64) -> Result<bool>;

    /// Version of the stored list
    async fn get_version(&self) -> Result<i64>;
}

#[derive(Debug, Default)]
struct StoreState {
    version: i64,
    devices: HashMap<String, SubDeviceRecord>,
}

/// In-memory [`SubDeviceStore`]
#[derive(Debug, Default)]
pub struct MemorySubDeviceStore {
    state: RwLock<StoreState>,
}

impl MemorySubDeviceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with `devices` at `version`
    #[must_use]
    pub fn with_devices(devices: Vec<SubDeviceRecord>, version: i64) -> Self {
        let devices = devices
            .into_iter()
            .map(|d| (d.node_id.clone(), d))
            .collect();
        Self {
            state: RwLock::new(StoreState { version, devices }),
        }
    }

    /// Number of stored sub-devices
    pub async fn len(&self) -> usize {
        self.state.read().await.devices.len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.devices.is_empty()
    }
}

#[async_trait]
impl SubDeviceStore for MemorySubDeviceStore {
    async fn get_sub_device(&self, node_id: &str) -> Result<Option<SubDeviceRecord>> {
        Ok(self.state.read().await.devices.get(node_id).cloned())
    }

    async fn add_sub_devices(&self, devices: &[SubDeviceRecord], version: i64) -> Result<bool> {
        let mut state = self.state.write().await;
        if version <= state.version {
            tracing::debug!(version, stored = state.version, "ignoring stale sub-device add");
            return Ok(false);
        }

        for device in devices {
            state.devices.insert(device.node_id.clone(), device.clone());
        }
        state.version = version;
        tracing::info!(count = devices.len(), version, "sub-devices added");
        Ok(true)
    }

    async fn delete_sub_devices(&self, devices: &[SubDeviceRecord], version: i64) -> Result<bool> {
        let mut state = self.state.write().await;
        if version <= state.version {
            tracing::debug!(version, stored = state.version, "ignoring stale sub-device delete");
            return Ok(false);
        }

        for device in devices {
            state.devices.remove(&device.node_id);
        }
        state.version = version;
        tracing::info!(count = devices.len(), version, "sub-devices deleted");
        Ok(true)
    }

    async fn get_version(&self) -> Result<i64> {
        Ok(self.state.read().await.version)
    }
}
