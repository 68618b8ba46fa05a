//! Durable storage for the plugin's entities.
//!
//! The store is the single source of truth across restarts and across the
//! controller/node split: both sides reconstitute volumes, snapshots and
//! connections from here on every request. Two backends exist, a
//! relational one and one keeping each record in a Kubernetes custom
//! resource.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::PersistenceError;
use crate::object::{Connection, KeyValue, Snapshot, Volume};

pub mod crd;
pub mod sql;

/// Backend selection, parsed from `X_CSI_PERSISTENCE_CONFIG`.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "storage", rename_all = "lowercase")]
pub enum PersistenceConfig {
    /// Relational store reached through a database URL.
    Db { connection: String },
    /// Kubernetes custom resources, one per record.
    Crd {
        #[serde(default = "default_namespace")]
        namespace: String,
    },
}

fn default_namespace() -> String {
    "default".to_owned()
}

impl PersistenceConfig {
    /// Short name of the backend, reported in the plugin manifest.
    pub fn kind(&self) -> &'static str {
        match self {
            PersistenceConfig::Db { .. } => "db",
            PersistenceConfig::Crd { .. } => "crd",
        }
    }
}

/// All-optional lookup filters, AND-combined by the backends.
#[derive(Clone, Copy, Debug, Default)]
pub struct VolumeFilter<'a> {
    pub id: Option<&'a str>,
    pub name: Option<&'a str>,
    pub backend: Option<&'a str>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SnapshotFilter<'a> {
    pub id: Option<&'a str>,
    pub name: Option<&'a str>,
    pub volume_id: Option<&'a str>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectionFilter<'a> {
    pub id: Option<&'a str>,
    pub volume_id: Option<&'a str>,
}

/// CRUD over the four entity kinds. `set_*` take `is_new` so backends can
/// distinguish a create from an update of an existing record; stores that
/// track a resource version write it back into the entity.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn get_volumes(&self, filter: VolumeFilter<'_>) -> Result<Vec<Volume>, PersistenceError>;
    async fn set_volume(&self, volume: &mut Volume, is_new: bool) -> Result<(), PersistenceError>;
    async fn delete_volume(&self, volume_id: &str) -> Result<(), PersistenceError>;

    async fn get_snapshots(
        &self,
        filter: SnapshotFilter<'_>,
    ) -> Result<Vec<Snapshot>, PersistenceError>;
    async fn set_snapshot(
        &self,
        snapshot: &mut Snapshot,
        is_new: bool,
    ) -> Result<(), PersistenceError>;
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), PersistenceError>;

    async fn get_connections(
        &self,
        filter: ConnectionFilter<'_>,
    ) -> Result<Vec<Connection>, PersistenceError>;
    async fn set_connection(
        &self,
        connection: &mut Connection,
        is_new: bool,
    ) -> Result<(), PersistenceError>;
    async fn delete_connection(&self, connection_id: &str) -> Result<(), PersistenceError>;

    async fn get_key_value(&self, key: &str) -> Result<Option<KeyValue>, PersistenceError>;
    async fn set_key_value(&self, kv: &mut KeyValue) -> Result<(), PersistenceError>;
    async fn delete_key_value(&self, key: &str) -> Result<(), PersistenceError>;
}

/// Builds the configured store, running any bootstrap it needs (schema
/// creation, CRD definitions).
pub async fn from_config(
    config: &PersistenceConfig,
) -> Result<Arc<dyn PersistenceStore>, PersistenceError> {
    match config {
        PersistenceConfig::Db { connection } => {
            Ok(Arc::new(sql::SqlStore::connect(connection).await?))
        }
        PersistenceConfig::Crd { namespace } => {
            let client = kube::Client::try_default().await?;
            Ok(Arc::new(crd::CrdStore::new(client, namespace).await?))
        }
    }
}
