//! State shared by the Identity, Controller and Node services. The
//! services are independent tonic servers registered side by side; they
//! all hold the same `PluginContext`.

use std::sync::Arc;
use std::time::Duration;

use tonic::Status;

use k8s_csi::v1_3_0::CapacityRange;

use crate::capability::{Capabilities, ServiceCapabilities};
use crate::config::{Config, Feature};
use crate::driver::StorageDriver;
use crate::object::{Connection, Snapshot, Volume, VolumeStatus, CAPABILITIES_KEY, GB};
use crate::persistence::{ConnectionFilter, PersistenceStore, SnapshotFilter, VolumeFilter};
use crate::serializer::Serializer;
use crate::topology::TopologyTree;

/// How often waiting loops re-read the persistence store.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Attach retries waiting for a multipath device to assemble.
pub const MULTIPATH_FIND_RETRIES: u32 = 3;

pub struct PluginContext {
    pub config: Config,
    pub persistence: Arc<dyn PersistenceStore>,
    pub driver: Option<Arc<dyn StorageDriver>>,
    pub serializer: Serializer,
    pub service_caps: ServiceCapabilities,
    pub topology: Option<TopologyTree>,
}

/// Result of waiting for a state transition.
pub enum WaitOutcome {
    Reached(Volume),
    /// The volume landed in an error state.
    Errored(Volume),
    /// The record disappeared while waiting.
    Gone,
}

impl PluginContext {
    pub fn new(
        config: Config,
        persistence: Arc<dyn PersistenceStore>,
        driver: Option<Arc<dyn StorageDriver>>,
    ) -> Result<Self, String> {
        let topology = match &config.topologies {
            Some(topologies) => Some(TopologyTree::new(topologies)?),
            None => None,
        };

        // Multi-node access only when the backend says it can share the
        // volume.
        let multiattach = config
            .backend
            .as_ref()
            .and_then(|b| b.get("multiattach"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let service_caps = ServiceCapabilities {
            can_block_rwx: multiattach,
            can_mount_rwx: multiattach,
            supported_fs_types: config.supported_fs_types.clone(),
        };

        let serializer = Serializer::new(config.abort_duplicates);

        Ok(PluginContext {
            config,
            persistence,
            driver,
            serializer,
            service_caps,
            topology,
        })
    }

    pub fn backend_id(&self) -> Option<&str> {
        self.driver.as_deref().map(|d| d.id())
    }

    pub fn driver(&self) -> Result<&Arc<dyn StorageDriver>, Status> {
        self.driver
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("No backend configured in this mode"))
    }

    pub fn fail_if_disabled(&self, feature: Feature) -> Result<(), Status> {
        if self.config.ember.disabled(feature) {
            return Err(Status::invalid_argument(format!(
                "Feature {:?} is disabled in this deployment",
                feature
            )));
        }
        Ok(())
    }

    pub async fn get_volume(&self, volume_id: &str) -> Result<Option<Volume>, Status> {
        let volumes = self
            .persistence
            .get_volumes(VolumeFilter {
                id: Some(volume_id),
                backend: self.backend_id(),
                ..Default::default()
            })
            .await?;
        Ok(volumes.into_iter().next())
    }

    /// Volume lookup for RPCs that require it to exist.
    pub async fn require_volume(&self, volume_id: &str) -> Result<Volume, Status> {
        self.get_volume(volume_id).await?.ok_or_else(|| {
            Status::not_found(format!("Volume {} does not exist", volume_id))
        })
    }

    /// Name lookup used for create idempotency. Soft-deleted records are
    /// not candidates for reuse.
    pub async fn get_volume_by_name(&self, name: &str) -> Result<Option<Volume>, Status> {
        let volumes = self
            .persistence
            .get_volumes(VolumeFilter {
                name: Some(name),
                backend: self.backend_id(),
                ..Default::default()
            })
            .await?;
        Ok(volumes
            .into_iter()
            .find(|v| v.status != VolumeStatus::Deleted))
    }

    pub async fn list_volumes(&self) -> Result<Vec<Volume>, Status> {
        let volumes = self
            .persistence
            .get_volumes(VolumeFilter {
                backend: self.backend_id(),
                ..Default::default()
            })
            .await?;
        Ok(volumes
            .into_iter()
            .filter(|v| v.status != VolumeStatus::Deleted)
            .collect())
    }

    pub async fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<Snapshot>, Status> {
        let snapshots = self
            .persistence
            .get_snapshots(SnapshotFilter {
                id: Some(snapshot_id),
                ..Default::default()
            })
            .await?;
        Ok(snapshots.into_iter().next())
    }

    pub async fn get_snapshot_by_name(&self, name: &str) -> Result<Option<Snapshot>, Status> {
        let snapshots = self
            .persistence
            .get_snapshots(SnapshotFilter {
                name: Some(name),
                ..Default::default()
            })
            .await?;
        Ok(snapshots.into_iter().next())
    }

    pub async fn connections_for_volume(&self, volume_id: &str) -> Result<Vec<Connection>, Status> {
        Ok(self
            .persistence
            .get_connections(ConnectionFilter {
                volume_id: Some(volume_id),
                ..Default::default()
            })
            .await?)
    }

    /// The capabilities recorded on the volume at creation time.
    pub fn volume_capabilities(&self, volume: &Volume) -> Option<Capabilities> {
        volume
            .metadata
            .get(CAPABILITIES_KEY)
            .and_then(|blob| Capabilities::from_json(blob).ok())
    }

    pub fn validate_capabilities(&self, capabilities: &Capabilities) -> Result<(), Status> {
        if let Some(reason) = self.service_caps.unsupported(capabilities) {
            return Err(Status::invalid_argument(reason));
        }
        Ok(())
    }

    /// Polls the store until the volume reaches one of the target states.
    /// Error states are terminal; a record disappearing mid-wait is
    /// reported as such so delete waits can treat it as done.
    pub async fn wait_for_volume(
        &self,
        volume_id: &str,
        targets: &[VolumeStatus],
    ) -> Result<WaitOutcome, Status> {
        loop {
            let volume = match self.get_volume(volume_id).await? {
                Some(volume) => volume,
                None => return Ok(WaitOutcome::Gone),
            };
            if targets.contains(&volume.status) {
                return Ok(WaitOutcome::Reached(volume));
            }
            if volume.status.is_error() {
                return Ok(WaitOutcome::Errored(volume));
            }
            tokio::time::sleep(REFRESH_INTERVAL).await;
        }
    }
}

/// Derives the volume size and the acceptable byte range from a capacity
/// range. Sizes are whole GiBs; the floor is 1 GiB.
pub fn calculate_size(range: Option<&CapacityRange>) -> Result<(i64, i64, i64), Status> {
    let (required, limit) = match range {
        None => (GB, 0),
        Some(range) => (range.required_bytes, range.limit_bytes),
    };

    let min_bytes = required;
    let max_bytes = if limit > 0 { limit } else { min_bytes };

    if max_bytes < min_bytes {
        return Err(Status::invalid_argument(
            "limit_bytes is smaller than required_bytes",
        ));
    }

    let mut vol_bytes = min_bytes;
    if vol_bytes < GB {
        if max_bytes < GB {
            return Err(Status::out_of_range(
                "Unsupported capacity_range (min size is 1GB)",
            ));
        }
        vol_bytes = max_bytes;
    }

    // Backends provision whole GiBs; round up and make sure the result
    // still honors the limit.
    let vol_gb = (vol_bytes + GB - 1) / GB;
    if vol_gb * GB > max_bytes && min_bytes > GB {
        return Err(Status::out_of_range(
            "Cannot satisfy capacity_range with whole GiB sizes",
        ));
    }

    Ok((vol_gb, min_bytes, max_bytes))
}

/// Extra mkfs arguments per filesystem; ext4 needs `-F` to skip the
/// confirmation prompt when the target is a file.
pub fn mkfs_args(fs_type: &str) -> &'static [&'static str] {
    match fs_type {
        "ext2" | "ext3" | "ext4" => &["-F"],
        _ => &[],
    }
}
