//! Kubernetes custom-resource persistence backend.
//!
//! Every record is a namespaced custom resource: the entity JSON lives in a
//! `json` annotation (`value` for key-values) and the filterable fields are
//! mirrored as labels so lookups can ride on label selectors. Id lookups
//! use get-by-name, since the resource name is the entity id (or the key
//! for key-values).
//!
//! All containers using this backend need RBAC to list/create
//! `customresourcedefinitions` and full access to the `ember-csi.io` group.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use serde_json::json;
use tracing::{debug, error};

use crate::errors::PersistenceError;
use crate::object::{Connection, KeyValue, Snapshot, Volume};

use super::{ConnectionFilter, PersistenceStore, SnapshotFilter, VolumeFilter};

pub const DOMAIN: &str = "ember-csi.io";
pub const CRD_VERSION: &str = "v1";

/// Kubernetes label values cap out at 63 characters; longer values are
/// split into numbered follow-up labels.
const MAX_LABEL_LEN: usize = 63;

const JSON_ANNOTATION: &str = "json";
const VALUE_ANNOTATION: &str = "value";

#[derive(Clone, Copy)]
struct CrdKind {
    kind: &'static str,
    singular: &'static str,
    plural: &'static str,
    shortname: &'static str,
}

const VOLUME_KIND: CrdKind = CrdKind {
    kind: "Volume",
    singular: "volume",
    plural: "volumes",
    shortname: "vol",
};
const SNAPSHOT_KIND: CrdKind = CrdKind {
    kind: "Snapshot",
    singular: "snapshot",
    plural: "snapshots",
    shortname: "snap",
};
const CONNECTION_KIND: CrdKind = CrdKind {
    kind: "Connection",
    singular: "connection",
    plural: "connections",
    shortname: "conn",
};
const KEYVALUE_KIND: CrdKind = CrdKind {
    kind: "KeyValue",
    singular: "keyvalue",
    plural: "keyvalues",
    shortname: "kv",
};

const ALL_KINDS: &[CrdKind] = &[VOLUME_KIND, SNAPSHOT_KIND, CONNECTION_KIND, KEYVALUE_KIND];

impl CrdKind {
    fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(DOMAIN, CRD_VERSION, self.kind),
            self.plural,
        )
    }

    fn definition(&self) -> CustomResourceDefinition {
        // The v1 CRD API requires a schema; ours is free-form since the
        // payload is an opaque annotation.
        serde_json::from_value(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": { "name": format!("{}.{}", self.plural, DOMAIN) },
            "spec": {
                "group": DOMAIN,
                "scope": "Namespaced",
                "names": {
                    "kind": self.kind,
                    "singular": self.singular,
                    "plural": self.plural,
                    "shortNames": [self.shortname],
                    "categories": ["ember"],
                },
                "versions": [{
                    "name": CRD_VERSION,
                    "served": true,
                    "storage": true,
                    "schema": {
                        "openAPIV3Schema": {
                            "type": "object",
                            "x-kubernetes-preserve-unknown-fields": true,
                        }
                    }
                }],
            }
        }))
        .expect("static CRD definition must deserialize")
    }
}

/// Splits label values longer than the Kubernetes limit into `key`,
/// `key2`, `key3`... chunks, and drops empty values.
pub fn prepare_labels<'a, I>(labels: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut result = BTreeMap::new();
    for (key, value) in labels {
        if value.is_empty() {
            continue;
        }
        if value.len() > MAX_LABEL_LEN {
            let chars: Vec<char> = value.chars().collect();
            let mut index = 2;
            let mut start = MAX_LABEL_LEN;
            while start < chars.len() {
                let end = (start + MAX_LABEL_LEN).min(chars.len());
                result.insert(
                    format!("{}{}", key, index),
                    chars[start..end].iter().collect(),
                );
                index += 1;
                start = end;
            }
            result.insert(key.to_owned(), chars[..MAX_LABEL_LEN].iter().collect());
        } else {
            result.insert(key.to_owned(), value.to_owned());
        }
    }
    result
}

fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn is_api_error(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == code)
}

pub struct CrdStore {
    namespace: String,
    volumes: Api<DynamicObject>,
    snapshots: Api<DynamicObject>,
    connections: Api<DynamicObject>,
    keyvalues: Api<DynamicObject>,
}

impl CrdStore {
    /// Connects to the cluster and makes sure our four resource
    /// definitions exist.
    pub async fn new(client: Client, namespace: &str) -> Result<Self, PersistenceError> {
        Self::ensure_crds_exist(client.clone()).await?;
        Ok(Self::with_client(client, namespace))
    }

    /// Builds the store without the definition bootstrap. Used by tests
    /// with a mock API service.
    pub fn with_client(client: Client, namespace: &str) -> Self {
        let api = |kind: &CrdKind| {
            Api::<DynamicObject>::namespaced_with(client.clone(), namespace, &kind.api_resource())
        };
        CrdStore {
            namespace: namespace.to_owned(),
            volumes: api(&VOLUME_KIND),
            snapshots: api(&SNAPSHOT_KIND),
            connections: api(&CONNECTION_KIND),
            keyvalues: api(&KEYVALUE_KIND),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn ensure_crds_exist(client: Client) -> Result<(), PersistenceError> {
        let crds: Api<CustomResourceDefinition> = Api::all(client);
        let existing = crds.list(&ListParams::default()).await?;
        let current: Vec<String> = existing
            .items
            .into_iter()
            .filter_map(|crd| crd.metadata.name)
            .collect();

        for kind in ALL_KINDS {
            let name = format!("{}.{}", kind.plural, DOMAIN);
            if current.iter().any(|n| n == &name) {
                continue;
            }
            debug!(%name, "creating custom resource definition");
            match crds.create(&PostParams::default(), &kind.definition()).await {
                Ok(_) => {}
                // Someone else created it between the list and now.
                Err(err) if is_api_error(&err, 409) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Creates or updates a custom resource. The stored resourceVersion is
    /// the concurrency token: updates of an already-known record replace
    /// with it, updates of an unknown one fetch it first and fall back to
    /// create when the record is missing entirely.
    async fn apply(
        api: &Api<DynamicObject>,
        name: &str,
        mut object: DynamicObject,
        is_new: bool,
        resource_version: Option<String>,
    ) -> Result<DynamicObject, PersistenceError> {
        let pp = PostParams::default();

        if is_new {
            return api.create(&pp, &object).await.map_err(|err| {
                if is_api_error(&err, 409) {
                    PersistenceError::Conflict(name.to_owned())
                } else {
                    err.into()
                }
            });
        }

        let version = match resource_version {
            Some(version) => Some(version),
            None => match api.get(name).await {
                Ok(existing) => existing.metadata.resource_version,
                Err(err) if is_api_error(&err, 404) => {
                    return api.create(&pp, &object).await.map_err(Into::into)
                }
                Err(err) => return Err(err.into()),
            },
        };

        object.metadata.resource_version = version;
        api.replace(name, &pp, &object).await.map_err(|err| {
            if is_api_error(&err, 409) {
                PersistenceError::Conflict(name.to_owned())
            } else {
                err.into()
            }
        })
    }

    fn build_object(
        kind: &CrdKind,
        name: &str,
        labels: BTreeMap<String, String>,
        annotation: (&str, String),
    ) -> DynamicObject {
        let mut object = DynamicObject::new(name, &kind.api_resource());
        object.metadata.labels = Some(labels);
        let mut annotations = BTreeMap::new();
        annotations.insert(annotation.0.to_owned(), annotation.1);
        object.metadata.annotations = Some(annotations);
        object
    }

    /// Shared lookup: get-by-name when the id label is part of the filter,
    /// label-selector list otherwise. Missing records are an empty result,
    /// never an error.
    async fn lookup(
        api: &Api<DynamicObject>,
        kind: &CrdKind,
        labels: BTreeMap<String, String>,
        id: Option<&str>,
    ) -> Result<Vec<DynamicObject>, PersistenceError> {
        if let Some(id) = id {
            let object = match api.get(id).await {
                Ok(object) => object,
                Err(err) if is_api_error(&err, 404) => return Ok(vec![]),
                Err(err) => return Err(err.into()),
            };
            // The other filters must match the stored labels too.
            let stored = object.metadata.labels.clone().unwrap_or_default();
            for (key, value) in &labels {
                if stored.get(key) != Some(value) {
                    error!(
                        kind = kind.kind,
                        id,
                        label = key.as_str(),
                        "stored record does not match requested label"
                    );
                    return Ok(vec![]);
                }
            }
            return Ok(vec![object]);
        }

        let lp = ListParams::default().labels(&selector_string(&labels));
        let list = api.list(&lp).await?;
        Ok(list.items)
    }

    fn entity_from_object<T: serde::de::DeserializeOwned>(
        kind: &'static str,
        object: &DynamicObject,
    ) -> Result<(T, Option<String>), PersistenceError> {
        let id = object.metadata.name.clone().unwrap_or_default();
        let annotations = object.metadata.annotations.clone().unwrap_or_default();
        let payload = annotations.get(JSON_ANNOTATION).cloned().unwrap_or_default();
        let entity = serde_json::from_str(&payload).map_err(|source| {
            PersistenceError::Corrupt {
                kind,
                id,
                source,
            }
        })?;
        Ok((entity, object.metadata.resource_version.clone()))
    }

    async fn delete(api: &Api<DynamicObject>, name: &str) -> Result<(), PersistenceError> {
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(err) if is_api_error(&err, 404) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn volume_labels(volume: &Volume) -> BTreeMap<String, String> {
    prepare_labels([
        ("backend_name", volume.backend_id.as_str()),
        ("volume_id", volume.id.as_str()),
        ("volume_name", volume.name.as_str()),
    ])
}

fn snapshot_labels(snapshot: &Snapshot) -> BTreeMap<String, String> {
    prepare_labels([
        ("snapshot_id", snapshot.id.as_str()),
        ("snapshot_name", snapshot.name.as_str()),
        ("volume_id", snapshot.volume_id.as_str()),
    ])
}

fn connection_labels(connection: &Connection) -> BTreeMap<String, String> {
    prepare_labels([
        ("connection_id", connection.id.as_str()),
        ("volume_id", connection.volume_id.as_str()),
    ])
}

#[async_trait]
impl PersistenceStore for CrdStore {
    async fn get_volumes(&self, filter: VolumeFilter<'_>) -> Result<Vec<Volume>, PersistenceError> {
        let labels = prepare_labels(
            [
                filter.name.map(|v| ("volume_name", v)),
                filter.backend.map(|v| ("backend_name", v)),
            ]
            .into_iter()
            .flatten(),
        );
        let objects = Self::lookup(&self.volumes, &VOLUME_KIND, labels, filter.id).await?;
        objects
            .iter()
            .map(|object| {
                let (mut volume, version): (Volume, _) =
                    Self::entity_from_object("volume", object)?;
                volume.resource_version = version;
                Ok(volume)
            })
            .collect()
    }

    async fn set_volume(&self, volume: &mut Volume, is_new: bool) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(volume).expect("volume serialization cannot fail");
        let object = Self::build_object(
            &VOLUME_KIND,
            &volume.id,
            volume_labels(volume),
            (JSON_ANNOTATION, payload),
        );
        let stored = Self::apply(
            &self.volumes,
            &volume.id,
            object,
            is_new,
            volume.resource_version.clone(),
        )
        .await?;
        volume.resource_version = stored.metadata.resource_version;
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<(), PersistenceError> {
        Self::delete(&self.volumes, volume_id).await
    }

    async fn get_snapshots(
        &self,
        filter: SnapshotFilter<'_>,
    ) -> Result<Vec<Snapshot>, PersistenceError> {
        let labels = prepare_labels(
            [
                filter.name.map(|v| ("snapshot_name", v)),
                filter.volume_id.map(|v| ("volume_id", v)),
            ]
            .into_iter()
            .flatten(),
        );
        let objects = Self::lookup(&self.snapshots, &SNAPSHOT_KIND, labels, filter.id).await?;
        objects
            .iter()
            .map(|object| {
                let (mut snapshot, version): (Snapshot, _) =
                    Self::entity_from_object("snapshot", object)?;
                snapshot.resource_version = version;
                Ok(snapshot)
            })
            .collect()
    }

    async fn set_snapshot(
        &self,
        snapshot: &mut Snapshot,
        is_new: bool,
    ) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(snapshot).expect("snapshot serialization cannot fail");
        let object = Self::build_object(
            &SNAPSHOT_KIND,
            &snapshot.id,
            snapshot_labels(snapshot),
            (JSON_ANNOTATION, payload),
        );
        let stored = Self::apply(
            &self.snapshots,
            &snapshot.id,
            object,
            is_new,
            snapshot.resource_version.clone(),
        )
        .await?;
        snapshot.resource_version = stored.metadata.resource_version;
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), PersistenceError> {
        Self::delete(&self.snapshots, snapshot_id).await
    }

    async fn get_connections(
        &self,
        filter: ConnectionFilter<'_>,
    ) -> Result<Vec<Connection>, PersistenceError> {
        let labels = prepare_labels(
            [filter.volume_id.map(|v| ("volume_id", v))]
                .into_iter()
                .flatten(),
        );
        let objects = Self::lookup(&self.connections, &CONNECTION_KIND, labels, filter.id).await?;
        objects
            .iter()
            .map(|object| {
                let (mut connection, version): (Connection, _) =
                    Self::entity_from_object("connection", object)?;
                connection.resource_version = version;
                Ok(connection)
            })
            .collect()
    }

    async fn set_connection(
        &self,
        connection: &mut Connection,
        is_new: bool,
    ) -> Result<(), PersistenceError> {
        let payload =
            serde_json::to_string(connection).expect("connection serialization cannot fail");
        let object = Self::build_object(
            &CONNECTION_KIND,
            &connection.id,
            connection_labels(connection),
            (JSON_ANNOTATION, payload),
        );
        let stored = Self::apply(
            &self.connections,
            &connection.id,
            object,
            is_new,
            connection.resource_version.clone(),
        )
        .await?;
        connection.resource_version = stored.metadata.resource_version;
        Ok(())
    }

    async fn delete_connection(&self, connection_id: &str) -> Result<(), PersistenceError> {
        Self::delete(&self.connections, connection_id).await
    }

    async fn get_key_value(&self, key: &str) -> Result<Option<KeyValue>, PersistenceError> {
        let object = match self.keyvalues.get(key).await {
            Ok(object) => object,
            Err(err) if is_api_error(&err, 404) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let annotations = object.metadata.annotations.unwrap_or_default();
        let value = annotations.get(VALUE_ANNOTATION).cloned().unwrap_or_default();
        let mut kv = KeyValue::new(key, &value);
        kv.resource_version = object.metadata.resource_version;
        Ok(Some(kv))
    }

    async fn set_key_value(&self, kv: &mut KeyValue) -> Result<(), PersistenceError> {
        let object = Self::build_object(
            &KEYVALUE_KIND,
            &kv.key,
            BTreeMap::new(),
            (VALUE_ANNOTATION, kv.value.clone()),
        );
        let stored = Self::apply(
            &self.keyvalues,
            &kv.key,
            object,
            false,
            kv.resource_version.clone(),
        )
        .await?;
        kv.resource_version = stored.metadata.resource_version;
        Ok(())
    }

    async fn delete_key_value(&self, key: &str) -> Result<(), PersistenceError> {
        Self::delete(&self.keyvalues, key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Request as HttpRequest, Response as HttpResponse};
    use hyper::Body;
    use kube::Client;
    use tower_test::mock;

    use crate::object::Volume;
    use crate::persistence::VolumeFilter;

    #[tokio::test]
    async fn missing_records_are_empty_results() {
        let (mock_service, handle) = mock::pair::<HttpRequest<Body>, HttpResponse<Body>>();
        let api_task = tokio::spawn(async move {
            tokio::pin!(handle);
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            assert_eq!(
                request.uri().path(),
                "/apis/ember-csi.io/v1/namespaces/ember/volumes/vol-1"
            );
            let status = serde_json::json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "reason": "NotFound",
                "message": "volumes \"vol-1\" not found",
                "code": 404,
            });
            send.send_response(
                HttpResponse::builder()
                    .status(404)
                    .body(Body::from(serde_json::to_vec(&status).unwrap()))
                    .unwrap(),
            );
        });

        let store = CrdStore::with_client(Client::new(mock_service, "default"), "ember");
        let volumes = store
            .get_volumes(VolumeFilter {
                id: Some("vol-1"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(volumes.is_empty());
        api_task.await.unwrap();
    }

    #[tokio::test]
    async fn stored_volume_round_trips_through_the_annotation() {
        let volume = Volume::new("vol-1", 2, "backend-a");
        let payload = serde_json::to_string(&volume).unwrap();
        let id = volume.id.clone();

        let (mock_service, handle) = mock::pair::<HttpRequest<Body>, HttpResponse<Body>>();
        let object = serde_json::json!({
            "apiVersion": "ember-csi.io/v1",
            "kind": "Volume",
            "metadata": {
                "name": id,
                "namespace": "ember",
                "resourceVersion": "42",
                "labels": {
                    "backend_name": "backend-a",
                    "volume_id": id,
                    "volume_name": "vol-1",
                },
                "annotations": { "json": payload },
            },
        });
        let api_task = tokio::spawn(async move {
            tokio::pin!(handle);
            let (request, send) = handle.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            send.send_response(
                HttpResponse::builder()
                    .body(Body::from(serde_json::to_vec(&object).unwrap()))
                    .unwrap(),
            );
        });

        let store = CrdStore::with_client(Client::new(mock_service, "default"), "ember");
        let volumes = store
            .get_volumes(VolumeFilter {
                id: Some(&volume.id),
                name: Some("vol-1"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].id, volume.id);
        assert_eq!(volumes[0].size_gb, 2);
        assert_eq!(volumes[0].resource_version.as_deref(), Some("42"));
        api_task.await.unwrap();
    }

    #[test]
    fn short_labels_pass_through() {
        let labels = prepare_labels([("volume_id", "abc"), ("volume_name", "vol")]);
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["volume_id"], "abc");
    }

    #[test]
    fn empty_labels_are_dropped() {
        let labels = prepare_labels([("volume_name", "")]);
        assert!(labels.is_empty());
    }

    #[test]
    fn long_labels_are_chunked() {
        let value: String = std::iter::repeat('x').take(150).collect();
        let labels = prepare_labels([("volume_name", value.as_str())]);
        assert_eq!(labels["volume_name"].len(), 63);
        assert_eq!(labels["volume_name2"].len(), 63);
        assert_eq!(labels["volume_name3"].len(), 150 - 2 * 63);
        let rebuilt = format!(
            "{}{}{}",
            labels["volume_name"], labels["volume_name2"], labels["volume_name3"]
        );
        assert_eq!(rebuilt, value);
    }

    #[test]
    fn selector_joins_labels() {
        let labels = prepare_labels([("volume_id", "abc"), ("backend_name", "lvm")]);
        let selector = selector_string(&labels);
        assert_eq!(selector, "backend_name=lvm,volume_id=abc");
    }

    #[test]
    fn crd_definitions_deserialize() {
        for kind in ALL_KINDS {
            let crd = kind.definition();
            assert_eq!(
                crd.metadata.name.as_deref(),
                Some(format!("{}.{}", kind.plural, DOMAIN).as_str())
            );
            assert_eq!(crd.spec.group, DOMAIN);
            assert_eq!(crd.spec.versions.len(), 1);
        }
    }
}
