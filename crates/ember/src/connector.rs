//! Node-side transport plumbing: the connector properties a node
//! advertises, the per-node identity record in the key-value store, and
//! the seam to whatever actually logs into the storage target and surfaces
//! a block device on the host.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{DriverError, PersistenceError};
use crate::object::{Connection, KeyValue, GB};
use crate::persistence::PersistenceStore;

const INITIATOR_NAME_FILE: &str = "/etc/iscsi/initiatorname.iscsi";

/// What this node can do transport-wise. Serialized into the node's
/// key-value record so the controller can hand it to the driver when
/// publishing a volume here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectorProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub multipath: bool,
    #[serde(default)]
    pub do_local_attach: bool,
}

impl ConnectorProperties {
    /// Collects this host's properties. The initiator IQN is read from the
    /// usual open-iscsi location when present.
    pub async fn gather(storage_nw_ip: Option<&str>, request_multipath: bool) -> Self {
        let initiator = read_initiator(INITIATOR_NAME_FILE).await;
        let host = hostname();
        ConnectorProperties {
            initiator,
            ip: storage_nw_ip.map(|s| s.to_owned()),
            host,
            multipath: request_multipath,
            do_local_attach: false,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("connector serialization cannot fail")
    }
}

async fn read_initiator(path: &str) -> Option<String> {
    let content = tokio::fs::read_to_string(path).await.ok()?;
    content.lines().find_map(|line| {
        let line = line.trim();
        line.strip_prefix("InitiatorName=").map(|iqn| iqn.to_owned())
    })
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    nix::unistd::gethostname(&mut buf)
        .ok()
        .and_then(|name| name.to_str().ok())
        .map(|s| s.to_owned())
        .unwrap_or_default()
}

/// The per-node identity record: node id plus connector properties, stored
/// under the node id key so the controller side can find it.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub id: String,
    pub connector: Value,
}

impl NodeInfo {
    pub async fn get(
        persistence: &dyn PersistenceStore,
        node_id: &str,
    ) -> Result<Option<NodeInfo>, PersistenceError> {
        let kv = match persistence.get_key_value(node_id).await? {
            Some(kv) => kv,
            None => return Ok(None),
        };
        let connector =
            serde_json::from_str(&kv.value).map_err(|source| PersistenceError::Corrupt {
                kind: "node",
                id: node_id.to_owned(),
                source,
            })?;
        Ok(Some(NodeInfo {
            id: node_id.to_owned(),
            connector,
        }))
    }

    /// Registers this node's connector properties, overwriting any stale
    /// record from a previous incarnation.
    pub async fn set(
        persistence: &dyn PersistenceStore,
        node_id: &str,
        properties: &ConnectorProperties,
    ) -> Result<NodeInfo, PersistenceError> {
        let connector = properties.to_value();
        let mut kv = KeyValue::new(node_id, &connector.to_string());
        persistence.set_key_value(&mut kv).await?;
        Ok(NodeInfo {
            id: node_id.to_owned(),
            connector,
        })
    }
}

/// Attaches and detaches published volumes on this host.
#[async_trait]
pub trait VolumeConnector: Send + Sync {
    /// Logs into the transport described by the connection and returns the
    /// local device path once it exists.
    async fn attach(&self, connection: &Connection) -> Result<PathBuf, DriverError>;

    /// Whether the attached path is a multipath device. Used to decide if
    /// attach should be retried waiting for multipath to assemble.
    fn is_multipath(&self, device: &Path) -> bool {
        device.to_string_lossy().starts_with("/dev/dm")
    }

    async fn detach(&self, connection: &Connection) -> Result<(), DriverError>;

    /// Rescans the transport after a backend-side resize and returns the
    /// new device size in bytes.
    async fn extend(&self, connection: &Connection) -> Result<i64, DriverError>;
}

/// Builds the connector matching the configured driver.
pub fn from_config(config: &Value, state_path: &Path) -> Result<Arc<dyn VolumeConnector>, String> {
    let name = config
        .get("driver")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "backend config needs a 'driver' key".to_owned())?;
    match name {
        "fake" => Ok(Arc::new(FakeConnector {
            device_dir: state_path.join("devices"),
        })),
        other => Err(format!("unknown storage driver '{}'", other)),
    }
}

/// Development connector: the "device" is a sparse file under the state
/// directory, sized from the connection info.
pub struct FakeConnector {
    device_dir: PathBuf,
}

#[async_trait]
impl VolumeConnector for FakeConnector {
    async fn attach(&self, connection: &Connection) -> Result<PathBuf, DriverError> {
        tokio::fs::create_dir_all(&self.device_dir)
            .await
            .map_err(|e| DriverError::Operation {
                operation: "attach",
                resource: connection.volume_id.clone(),
                message: e.to_string(),
            })?;
        let device = self.device_dir.join(&connection.volume_id);
        let size = connection
            .connection_info
            .pointer("/data/size_bytes")
            .and_then(|v| v.as_i64())
            .unwrap_or(GB);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&device)
            .await
            .map_err(|e| DriverError::Operation {
                operation: "attach",
                resource: connection.volume_id.clone(),
                message: e.to_string(),
            })?;
        file.set_len(size as u64)
            .await
            .map_err(|e| DriverError::Operation {
                operation: "attach",
                resource: connection.volume_id.clone(),
                message: e.to_string(),
            })?;
        Ok(device)
    }

    fn is_multipath(&self, _device: &Path) -> bool {
        // File-backed devices have no multipath to wait for.
        true
    }

    async fn detach(&self, connection: &Connection) -> Result<(), DriverError> {
        let device = self.device_dir.join(&connection.volume_id);
        match tokio::fs::remove_file(&device).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DriverError::Operation {
                operation: "detach",
                resource: connection.volume_id.clone(),
                message: e.to_string(),
            }),
        }
    }

    async fn extend(&self, connection: &Connection) -> Result<i64, DriverError> {
        let device = self.device_dir.join(&connection.volume_id);
        let metadata = tokio::fs::metadata(&device)
            .await
            .map_err(|e| DriverError::Operation {
                operation: "extend",
                resource: connection.volume_id.clone(),
                message: e.to_string(),
            })?;
        Ok(metadata.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::AttachMode;

    fn connection(volume_id: &str, size: i64) -> Connection {
        Connection::new(
            volume_id,
            "node-1",
            serde_json::json!({}),
            serde_json::json!({ "data": { "size_bytes": size } }),
            AttachMode::ReadWrite,
        )
    }

    #[tokio::test]
    async fn fake_connector_attach_detach() {
        let dir = tempfile::tempdir().expect("should be able to create tempdir");
        let connector = FakeConnector {
            device_dir: dir.path().join("devices"),
        };
        let conn = connection("vol-1", 4 * GB);

        let device = connector.attach(&conn).await.unwrap();
        assert!(device.exists());
        assert_eq!(connector.extend(&conn).await.unwrap(), 4 * GB);

        connector.detach(&conn).await.unwrap();
        assert!(!device.exists());
        // Detach is idempotent.
        connector.detach(&conn).await.unwrap();
    }

    #[test]
    fn connector_properties_round_trip() {
        let props = ConnectorProperties {
            initiator: Some("iqn.2004-10.com.example:node".to_owned()),
            ip: Some("10.0.0.5".to_owned()),
            host: "node-1".to_owned(),
            multipath: true,
            do_local_attach: false,
        };
        let value = props.to_value();
        assert_eq!(value["multipath"], serde_json::json!(true));
        let back: ConnectorProperties = serde_json::from_value(value).unwrap();
        assert_eq!(back.initiator, props.initiator);
    }
}
