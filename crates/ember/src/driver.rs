//! The storage backend seam.
//!
//! The plugin drives an arbitrary block-storage backend through the
//! [`StorageDriver`] trait; the actual array/cluster logic lives outside
//! this crate. A memory-backed [`FakeDriver`] ships in-tree so the binary
//! and the tests can run without a real backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::errors::DriverError;
use crate::object::{Snapshot, Volume};

/// Pool statistics as the backend reports them.
#[derive(Clone, Copy, Debug)]
pub struct BackendStats {
    pub total_capacity_gb: f64,
    pub free_capacity_gb: f64,
}

/// Connector properties a node registers, handed to the driver when a
/// connection is initialized.
pub type ConnectorBlob = Value;

/// Narrow interface to the storage backend. One instance serves one
/// configured backend.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Backend identifier; also the value of `Volume.backend_id`.
    fn id(&self) -> &str;

    /// Driver implementation name, reported in the plugin manifest.
    fn driver_name(&self) -> &str;

    fn driver_version(&self) -> &str;

    /// Whether the driver is a supported one. Purely informational.
    fn supported(&self) -> bool {
        true
    }

    /// Cheap backend sanity check used by Probe.
    async fn check_setup(&self) -> Result<(), DriverError>;

    async fn stats(&self, refresh: bool) -> Result<BackendStats, DriverError>;

    async fn create_volume(&self, volume: &Volume) -> Result<(), DriverError>;

    async fn delete_volume(&self, volume: &Volume) -> Result<(), DriverError>;

    async fn clone_volume(&self, source: &Volume, volume: &Volume) -> Result<(), DriverError>;

    async fn extend_volume(&self, volume: &Volume, new_size_gb: i64) -> Result<(), DriverError>;

    async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<(), DriverError>;

    async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<(), DriverError>;

    async fn create_volume_from_snapshot(
        &self,
        snapshot: &Snapshot,
        volume: &Volume,
    ) -> Result<(), DriverError>;

    /// Exports the volume for the given connector and returns the
    /// transport details (target, LUN, portals...) the node needs.
    async fn initialize_connection(
        &self,
        volume: &Volume,
        connector: &ConnectorBlob,
    ) -> Result<Value, DriverError>;

    async fn terminate_connection(
        &self,
        volume: &Volume,
        connector: &ConnectorBlob,
    ) -> Result<(), DriverError>;
}

/// Builds the configured driver from the `X_CSI_BACKEND_CONFIG` JSON. The
/// `driver` key selects the implementation.
pub fn from_config(config: &Value) -> Result<Arc<dyn StorageDriver>, String> {
    let name = config
        .get("driver")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "backend config needs a 'driver' key".to_owned())?;
    match name {
        "fake" => Ok(Arc::new(FakeDriver::from_config(config))),
        other => Err(format!("unknown storage driver '{}'", other)),
    }
}

/// Memory-backed driver for development and tests. Volumes and snapshots
/// only exist as bookkeeping entries; connections point at a path under
/// the configured device directory.
pub struct FakeDriver {
    id: String,
    capacity_gb: f64,
    volumes: Mutex<HashMap<String, i64>>,
    snapshots: Mutex<HashMap<String, i64>>,
}

impl FakeDriver {
    pub fn from_config(config: &Value) -> Self {
        let id = config
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("fake")
            .to_owned();
        let capacity_gb = config
            .get("capacity_gb")
            .and_then(|v| v.as_f64())
            .unwrap_or(100.0);
        FakeDriver {
            id,
            capacity_gb,
            volumes: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    fn used_gb(&self) -> f64 {
        self.volumes.lock().unwrap().values().sum::<i64>() as f64
    }
}

#[async_trait]
impl StorageDriver for FakeDriver {
    fn id(&self) -> &str {
        &self.id
    }

    fn driver_name(&self) -> &str {
        "FakeDriver"
    }

    fn driver_version(&self) -> &str {
        "1.0"
    }

    async fn check_setup(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn stats(&self, _refresh: bool) -> Result<BackendStats, DriverError> {
        Ok(BackendStats {
            total_capacity_gb: self.capacity_gb,
            free_capacity_gb: self.capacity_gb - self.used_gb(),
        })
    }

    async fn create_volume(&self, volume: &Volume) -> Result<(), DriverError> {
        self.volumes
            .lock()
            .unwrap()
            .insert(volume.id.clone(), volume.size_gb);
        Ok(())
    }

    async fn delete_volume(&self, volume: &Volume) -> Result<(), DriverError> {
        self.volumes.lock().unwrap().remove(&volume.id);
        Ok(())
    }

    async fn clone_volume(&self, _source: &Volume, volume: &Volume) -> Result<(), DriverError> {
        self.volumes
            .lock()
            .unwrap()
            .insert(volume.id.clone(), volume.size_gb);
        Ok(())
    }

    async fn extend_volume(&self, volume: &Volume, new_size_gb: i64) -> Result<(), DriverError> {
        let mut volumes = self.volumes.lock().unwrap();
        match volumes.get_mut(&volume.id) {
            Some(size) => {
                *size = new_size_gb;
                Ok(())
            }
            None => Err(DriverError::NotFound(volume.id.clone())),
        }
    }

    async fn create_snapshot(&self, snapshot: &Snapshot) -> Result<(), DriverError> {
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.id.clone(), snapshot.volume_size_gb);
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<(), DriverError> {
        self.snapshots.lock().unwrap().remove(&snapshot.id);
        Ok(())
    }

    async fn create_volume_from_snapshot(
        &self,
        _snapshot: &Snapshot,
        volume: &Volume,
    ) -> Result<(), DriverError> {
        self.volumes
            .lock()
            .unwrap()
            .insert(volume.id.clone(), volume.size_gb);
        Ok(())
    }

    async fn initialize_connection(
        &self,
        volume: &Volume,
        connector: &ConnectorBlob,
    ) -> Result<Value, DriverError> {
        if !self.volumes.lock().unwrap().contains_key(&volume.id) {
            return Err(DriverError::NotFound(volume.id.clone()));
        }
        Ok(json!({
            "driver_volume_type": "fake",
            "data": {
                "volume_id": volume.id,
                "size_bytes": volume.size_bytes(),
                "host": connector.get("host").cloned().unwrap_or(Value::Null),
            }
        }))
    }

    async fn terminate_connection(
        &self,
        _volume: &Volume,
        _connector: &ConnectorBlob,
    ) -> Result<(), DriverError> {
        Ok(())
    }
}
