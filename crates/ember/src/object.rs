//! The entities tracked by the plugin: volumes, snapshots, connections and
//! key-value records. The persistence store owns the authoritative copy of
//! each of these; everything here is plain serializable data that is
//! reconstituted from storage on every request.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bytes in a gibibyte, the unit the backend drivers work in.
pub const GB: i64 = 1024 * 1024 * 1024;

/// Volume metadata key holding the JSON list of capabilities the volume was
/// created with.
pub const CAPABILITIES_KEY: &str = "capabilities";

/// Volume metadata key recording the filesystem the staging target was
/// formatted with. Set at most once.
pub const FS_TYPE_KEY: &str = "fs_type";

/// Connector-info key carrying the serialized capability of a publish call.
pub const CAPABILITY_KEY: &str = "capability";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeStatus {
    #[serde(rename = "creating")]
    Creating,
    #[serde(rename = "available")]
    Available,
    #[serde(rename = "in-use")]
    InUse,
    #[serde(rename = "deleting")]
    Deleting,
    #[serde(rename = "deleted")]
    Deleted,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "error_deleting")]
    ErrorDeleting,
}

impl VolumeStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, VolumeStatus::Error | VolumeStatus::ErrorDeleting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeStatus::Creating => "creating",
            VolumeStatus::Available => "available",
            VolumeStatus::InUse => "in-use",
            VolumeStatus::Deleting => "deleting",
            VolumeStatus::Deleted => "deleted",
            VolumeStatus::Error => "error",
            VolumeStatus::ErrorDeleting => "error_deleting",
        }
    }
}

impl std::fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provisioned volume. `name` is the orchestrator's idempotency key,
/// `id` is assigned by us at creation time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub size_gb: i64,
    pub status: VolumeStatus,
    pub backend_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_volume_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    /// Concurrency token of the stored record, when the backend provides one.
    #[serde(skip)]
    pub resource_version: Option<String>,
}

impl Volume {
    pub fn new(name: &str, size_gb: i64, backend_id: &str) -> Self {
        Volume {
            id: Uuid::new_v4().to_string(),
            name: name.to_owned(),
            size_gb,
            status: VolumeStatus::Creating,
            backend_id: backend_id.to_owned(),
            source_snapshot_id: None,
            source_volume_id: None,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            resource_version: None,
        }
    }

    pub fn size_bytes(&self) -> i64 {
        self.size_gb * GB
    }

    /// The filesystem the staging target was formatted with, if any.
    pub fn fs_type(&self) -> Option<&str> {
        self.metadata.get(FS_TYPE_KEY).map(|s| s.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotStatus {
    #[serde(rename = "creating")]
    Creating,
    #[serde(rename = "available")]
    Available,
    #[serde(rename = "deleting")]
    Deleting,
    #[serde(rename = "error")]
    Error,
}

/// A point-in-time copy of a volume. Snapshots keep their parent volume
/// alive: a volume that still owns snapshots is only soft-deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    pub volume_id: String,
    /// Size of the parent volume when the snapshot was taken.
    pub volume_size_gb: i64,
    pub status: SnapshotStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub resource_version: Option<String>,
}

impl Snapshot {
    pub fn new(name: &str, volume: &Volume) -> Self {
        Snapshot {
            id: Uuid::new_v4().to_string(),
            name: name.to_owned(),
            volume_id: volume.id.clone(),
            volume_size_gb: volume.size_gb,
            status: SnapshotStatus::Creating,
            created_at: Utc::now(),
            resource_version: None,
        }
    }

    pub fn size_bytes(&self) -> i64 {
        self.volume_size_gb * GB
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachMode {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "rw")]
    ReadWrite,
}

/// The record of a volume being published to a node.
///
/// ControllerPublishVolume creates one per node. NodeStageVolume fills in
/// `mountpoint` with the staging path, and NodePublishVolume duplicates the
/// staged connection once per target path, carrying the pod uid in
/// `instance_uuid`. A volume is `in-use` exactly while at least one of
/// these exists.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub volume_id: String,
    /// Node id the volume is attached to.
    pub attached_host: String,
    /// Connector properties of the node plus the serialized capability the
    /// publish was requested with (under the `capability` key).
    pub connector_info: serde_json::Value,
    /// Transport details handed back by the driver (target, LUN, portal...).
    pub connection_info: serde_json::Value,
    /// Staging path once NodeStageVolume ran, or the target path on
    /// NodePublish duplicates. Empty until then.
    #[serde(default)]
    pub mountpoint: String,
    /// Pod uid for NodePublish duplicates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_uuid: Option<String>,
    pub attach_mode: AttachMode,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub resource_version: Option<String>,
}

impl Connection {
    pub fn new(
        volume_id: &str,
        attached_host: &str,
        connector_info: serde_json::Value,
        connection_info: serde_json::Value,
        attach_mode: AttachMode,
    ) -> Self {
        Connection {
            id: Uuid::new_v4().to_string(),
            volume_id: volume_id.to_owned(),
            attached_host: attached_host.to_owned(),
            connector_info,
            connection_info,
            mountpoint: String::new(),
            instance_uuid: None,
            attach_mode,
            status: "attached".to_owned(),
            created_at: Utc::now(),
            resource_version: None,
        }
    }

    /// The serialized capability this connection was published with.
    pub fn capability_blob(&self) -> Option<&str> {
        self.connector_info.get(CAPABILITY_KEY).and_then(|v| v.as_str())
    }
}

/// Opaque key-value record. Used for the per-node connector properties and
/// the probe counter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    #[serde(skip)]
    pub resource_version: Option<String>,
}

impl KeyValue {
    pub fn new(key: &str, value: &str) -> Self {
        KeyValue {
            key: key.to_owned(),
            value: value.to_owned(),
            resource_version: None,
        }
    }
}

/// Converts a timestamp to the decimal nanosecond string used as a paging
/// token.
pub fn date_to_nanos(date: &DateTime<Utc>) -> String {
    date.timestamp_nanos().to_string()
}

/// Parses a paging token back into a timestamp. Fails on anything that is
/// not a decimal nanosecond count.
pub fn nanos_to_date(token: &str) -> Result<DateTime<Utc>, std::num::ParseIntError> {
    let nanos: i64 = token.parse()?;
    Ok(Utc.timestamp_nanos(nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_status_round_trips_through_json() {
        let vol = Volume::new("vol-1", 1, "backend");
        let json = serde_json::to_string(&vol).unwrap();
        let back: Volume = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, VolumeStatus::Creating);
        assert_eq!(back.id, vol.id);
        assert!(json.contains("\"creating\""));
    }

    #[test]
    fn in_use_serializes_with_dash() {
        let mut vol = Volume::new("vol-1", 1, "backend");
        vol.status = VolumeStatus::InUse;
        let json = serde_json::to_string(&vol).unwrap();
        assert!(json.contains("\"in-use\""));
    }

    #[test]
    fn paging_token_round_trip() {
        let now = Utc::now();
        let token = date_to_nanos(&now);
        let back = nanos_to_date(&token).unwrap();
        assert_eq!(back.timestamp_nanos(), now.timestamp_nanos());
    }

    #[test]
    fn bad_paging_token_is_rejected() {
        assert!(nanos_to_date("not-a-number").is_err());
    }

    #[test]
    fn connection_capability_blob() {
        let conn = Connection::new(
            "vol",
            "node-1",
            serde_json::json!({ "capability": "{\"is_block\":true}" }),
            serde_json::json!({}),
            AttachMode::ReadWrite,
        );
        assert_eq!(conn.capability_blob(), Some("{\"is_block\":true}"));
    }
}
