//! Relational persistence backend.
//!
//! Each entity is stored as its JSON form plus the handful of columns the
//! lookup filters need. The same statements run against SQLite and MySQL,
//! which is why placeholders are `?` everywhere.

use async_trait::async_trait;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use tracing::debug;

use crate::errors::PersistenceError;
use crate::object::{Connection, KeyValue, Snapshot, Volume};

use super::{ConnectionFilter, PersistenceStore, SnapshotFilter, VolumeFilter};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS volumes (
        id VARCHAR(36) PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        backend VARCHAR(255) NOT NULL,
        created_at_ns BIGINT NOT NULL,
        json TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS snapshots (
        id VARCHAR(36) PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        volume_id VARCHAR(36) NOT NULL,
        created_at_ns BIGINT NOT NULL,
        json TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS connections (
        id VARCHAR(36) PRIMARY KEY,
        volume_id VARCHAR(36) NOT NULL,
        created_at_ns BIGINT NOT NULL,
        json TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS key_values (
        key_name VARCHAR(255) PRIMARY KEY,
        key_value TEXT NOT NULL
    )",
];

// The Any driver registry is process-global and must only be filled once.
static INSTALL_DRIVERS: std::sync::Once = std::sync::Once::new();

pub struct SqlStore {
    pool: AnyPool,
}

impl SqlStore {
    /// Connects to the database URL and creates any missing tables.
    pub async fn connect(url: &str) -> Result<Self, PersistenceError> {
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);
        let pool = AnyPoolOptions::new().max_connections(5).connect(url).await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        debug!(url, "connected to relational store");
        Ok(SqlStore { pool })
    }

    fn decode<T: serde::de::DeserializeOwned>(
        kind: &'static str,
        id: String,
        json: &str,
    ) -> Result<T, PersistenceError> {
        serde_json::from_str(json).map_err(|source| PersistenceError::Corrupt { kind, id, source })
    }

    async fn upsert<'a>(
        &self,
        insert: sqlx::query::Query<'a, sqlx::Any, sqlx::any::AnyArguments<'a>>,
        update: sqlx::query::Query<'a, sqlx::Any, sqlx::any::AnyArguments<'a>>,
        retry_insert: sqlx::query::Query<'a, sqlx::Any, sqlx::any::AnyArguments<'a>>,
        is_new: bool,
        id: &str,
    ) -> Result<(), PersistenceError> {
        if is_new {
            return insert.execute(&self.pool).await.map(|_| ()).map_err(|err| {
                if is_unique_violation(&err) {
                    PersistenceError::Conflict(id.to_owned())
                } else {
                    err.into()
                }
            });
        }

        let result = update.execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            retry_insert.execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(dbe) => {
            matches!(dbe.kind(), sqlx::error::ErrorKind::UniqueViolation)
        }
        _ => false,
    }
}

#[async_trait]
impl PersistenceStore for SqlStore {
    async fn get_volumes(&self, filter: VolumeFilter<'_>) -> Result<Vec<Volume>, PersistenceError> {
        let mut sql =
            String::from("SELECT id, json FROM volumes WHERE 1 = 1");
        if filter.id.is_some() {
            sql.push_str(" AND id = ?");
        }
        if filter.name.is_some() {
            sql.push_str(" AND name = ?");
        }
        if filter.backend.is_some() {
            sql.push_str(" AND backend = ?");
        }
        sql.push_str(" ORDER BY created_at_ns");

        let mut query = sqlx::query(&sql);
        for value in [filter.id, filter.name, filter.backend].into_iter().flatten() {
            query = query.bind(value.to_owned());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let json: String = row.try_get("json")?;
                Self::decode("volume", id, &json)
            })
            .collect()
    }

    async fn set_volume(&self, volume: &mut Volume, is_new: bool) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(volume).expect("volume serialization cannot fail");
        let nanos = volume.created_at.timestamp_nanos();
        let insert = sqlx::query(
            "INSERT INTO volumes (id, name, backend, created_at_ns, json) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(volume.id.clone())
        .bind(volume.name.clone())
        .bind(volume.backend_id.clone())
        .bind(nanos)
        .bind(json.clone());
        let update = sqlx::query(
            "UPDATE volumes SET name = ?, backend = ?, created_at_ns = ?, json = ? WHERE id = ?",
        )
        .bind(volume.name.clone())
        .bind(volume.backend_id.clone())
        .bind(nanos)
        .bind(json.clone())
        .bind(volume.id.clone());
        let retry = sqlx::query(
            "INSERT INTO volumes (id, name, backend, created_at_ns, json) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(volume.id.clone())
        .bind(volume.name.clone())
        .bind(volume.backend_id.clone())
        .bind(nanos)
        .bind(json);
        self.upsert(insert, update, retry, is_new, &volume.id).await
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM volumes WHERE id = ?")
            .bind(volume_id.to_owned())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_snapshots(
        &self,
        filter: SnapshotFilter<'_>,
    ) -> Result<Vec<Snapshot>, PersistenceError> {
        let mut sql = String::from("SELECT id, json FROM snapshots WHERE 1 = 1");
        if filter.id.is_some() {
            sql.push_str(" AND id = ?");
        }
        if filter.name.is_some() {
            sql.push_str(" AND name = ?");
        }
        if filter.volume_id.is_some() {
            sql.push_str(" AND volume_id = ?");
        }
        sql.push_str(" ORDER BY created_at_ns");

        let mut query = sqlx::query(&sql);
        for value in [filter.id, filter.name, filter.volume_id]
            .into_iter()
            .flatten()
        {
            query = query.bind(value.to_owned());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let json: String = row.try_get("json")?;
                Self::decode("snapshot", id, &json)
            })
            .collect()
    }

    async fn set_snapshot(
        &self,
        snapshot: &mut Snapshot,
        is_new: bool,
    ) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(snapshot).expect("snapshot serialization cannot fail");
        let nanos = snapshot.created_at.timestamp_nanos();
        let insert = sqlx::query(
            "INSERT INTO snapshots (id, name, volume_id, created_at_ns, json) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(snapshot.id.clone())
        .bind(snapshot.name.clone())
        .bind(snapshot.volume_id.clone())
        .bind(nanos)
        .bind(json.clone());
        let update = sqlx::query(
            "UPDATE snapshots SET name = ?, volume_id = ?, created_at_ns = ?, json = ? WHERE id = ?",
        )
        .bind(snapshot.name.clone())
        .bind(snapshot.volume_id.clone())
        .bind(nanos)
        .bind(json.clone())
        .bind(snapshot.id.clone());
        let retry = sqlx::query(
            "INSERT INTO snapshots (id, name, volume_id, created_at_ns, json) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(snapshot.id.clone())
        .bind(snapshot.name.clone())
        .bind(snapshot.volume_id.clone())
        .bind(nanos)
        .bind(json);
        self.upsert(insert, update, retry, is_new, &snapshot.id).await
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM snapshots WHERE id = ?")
            .bind(snapshot_id.to_owned())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_connections(
        &self,
        filter: ConnectionFilter<'_>,
    ) -> Result<Vec<Connection>, PersistenceError> {
        let mut sql = String::from("SELECT id, json FROM connections WHERE 1 = 1");
        if filter.id.is_some() {
            sql.push_str(" AND id = ?");
        }
        if filter.volume_id.is_some() {
            sql.push_str(" AND volume_id = ?");
        }
        sql.push_str(" ORDER BY created_at_ns");

        let mut query = sqlx::query(&sql);
        for value in [filter.id, filter.volume_id].into_iter().flatten() {
            query = query.bind(value.to_owned());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let json: String = row.try_get("json")?;
                Self::decode("connection", id, &json)
            })
            .collect()
    }

    async fn set_connection(
        &self,
        connection: &mut Connection,
        is_new: bool,
    ) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(connection).expect("connection serialization cannot fail");
        let nanos = connection.created_at.timestamp_nanos();
        let insert = sqlx::query(
            "INSERT INTO connections (id, volume_id, created_at_ns, json) VALUES (?, ?, ?, ?)",
        )
        .bind(connection.id.clone())
        .bind(connection.volume_id.clone())
        .bind(nanos)
        .bind(json.clone());
        let update =
            sqlx::query("UPDATE connections SET volume_id = ?, created_at_ns = ?, json = ? WHERE id = ?")
                .bind(connection.volume_id.clone())
                .bind(nanos)
                .bind(json.clone())
                .bind(connection.id.clone());
        let retry = sqlx::query(
            "INSERT INTO connections (id, volume_id, created_at_ns, json) VALUES (?, ?, ?, ?)",
        )
        .bind(connection.id.clone())
        .bind(connection.volume_id.clone())
        .bind(nanos)
        .bind(json);
        self.upsert(insert, update, retry, is_new, &connection.id)
            .await
    }

    async fn delete_connection(&self, connection_id: &str) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM connections WHERE id = ?")
            .bind(connection_id.to_owned())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_key_value(&self, key: &str) -> Result<Option<KeyValue>, PersistenceError> {
        let row = sqlx::query("SELECT key_value FROM key_values WHERE key_name = ?")
            .bind(key.to_owned())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let value: String = row.try_get("key_value")?;
                Ok(Some(KeyValue::new(key, &value)))
            }
            None => Ok(None),
        }
    }

    async fn set_key_value(&self, kv: &mut KeyValue) -> Result<(), PersistenceError> {
        let updated = sqlx::query("UPDATE key_values SET key_value = ? WHERE key_name = ?")
            .bind(kv.value.clone())
            .bind(kv.key.clone())
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            sqlx::query("INSERT INTO key_values (key_name, key_value) VALUES (?, ?)")
                .bind(kv.key.clone())
                .bind(kv.value.clone())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn delete_key_value(&self, key: &str) -> Result<(), PersistenceError> {
        sqlx::query("DELETE FROM key_values WHERE key_name = ?")
            .bind(key.to_owned())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{AttachMode, VolumeStatus};

    async fn store() -> (tempfile::TempDir, SqlStore) {
        let dir = tempfile::tempdir().expect("should be able to create tempdir");
        let url = format!("sqlite://{}/store.db?mode=rwc", dir.path().display());
        let store = SqlStore::connect(&url).await.expect("store should connect");
        (dir, store)
    }

    #[tokio::test]
    async fn volume_round_trip_and_filters() {
        let (_dir, store) = store().await;
        let mut vol = Volume::new("vol-1", 2, "backend-a");
        store.set_volume(&mut vol, true).await.unwrap();

        let by_name = store
            .get_volumes(VolumeFilter {
                name: Some("vol-1"),
                backend: Some("backend-a"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].id, vol.id);
        assert_eq!(by_name[0].size_gb, 2);

        let missing = store
            .get_volumes(VolumeFilter {
                name: Some("vol-1"),
                backend: Some("backend-b"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn volume_update_replaces_record() {
        let (_dir, store) = store().await;
        let mut vol = Volume::new("vol-1", 1, "backend-a");
        store.set_volume(&mut vol, true).await.unwrap();

        vol.status = VolumeStatus::Available;
        store.set_volume(&mut vol, false).await.unwrap();

        let stored = store
            .get_volumes(VolumeFilter {
                id: Some(&vol.id),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(stored[0].status, VolumeStatus::Available);
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let (_dir, store) = store().await;
        let mut vol = Volume::new("vol-1", 1, "backend-a");
        store.set_volume(&mut vol, true).await.unwrap();
        let err = store.set_volume(&mut vol.clone(), true).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Conflict(_)));
    }

    #[tokio::test]
    async fn deleted_volume_is_gone() {
        let (_dir, store) = store().await;
        let mut vol = Volume::new("vol-1", 1, "backend-a");
        store.set_volume(&mut vol, true).await.unwrap();
        store.delete_volume(&vol.id).await.unwrap();
        let stored = store.get_volumes(VolumeFilter::default()).await.unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn connection_lookup_by_volume() {
        let (_dir, store) = store().await;
        let mut conn = Connection::new(
            "vol-1",
            "node-1",
            serde_json::json!({}),
            serde_json::json!({"target": "iqn"}),
            AttachMode::ReadWrite,
        );
        store.set_connection(&mut conn, true).await.unwrap();

        let found = store
            .get_connections(ConnectionFilter {
                volume_id: Some("vol-1"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].attached_host, "node-1");
    }

    #[tokio::test]
    async fn key_value_round_trip() {
        let (_dir, store) = store().await;
        assert!(store.get_key_value("probe").await.unwrap().is_none());

        let mut kv = KeyValue::new("probe", "1");
        store.set_key_value(&mut kv).await.unwrap();
        kv.value = "2".to_owned();
        store.set_key_value(&mut kv).await.unwrap();

        let stored = store.get_key_value("probe").await.unwrap().unwrap();
        assert_eq!(stored.value, "2");

        store.delete_key_value("probe").await.unwrap();
        assert!(store.get_key_value("probe").await.unwrap().is_none());
    }
}
