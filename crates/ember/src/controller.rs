//! CSI Controller service: cluster-wide volume and snapshot lifecycle plus
//! attach/detach bookkeeping.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tonic::{Request, Response, Status};

use k8s_csi::v1_3_0::controller_server::Controller;
use k8s_csi::v1_3_0::controller_service_capability::rpc::Type as RpcType;
use k8s_csi::v1_3_0::controller_service_capability::{Rpc, Type as CapabilityType};
use k8s_csi::v1_3_0::volume_content_source::{
    SnapshotSource, Type as SourceType, VolumeSource,
};
use k8s_csi::v1_3_0::{
    list_snapshots_response, list_volumes_response, validate_volume_capabilities_response,
    ControllerExpandVolumeRequest, ControllerExpandVolumeResponse, ControllerGetCapabilitiesRequest,
    ControllerGetCapabilitiesResponse, ControllerGetVolumeRequest, ControllerGetVolumeResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse, ControllerServiceCapability,
    ControllerUnpublishVolumeRequest, ControllerUnpublishVolumeResponse, CreateSnapshotRequest,
    CreateSnapshotResponse, CreateVolumeRequest, CreateVolumeResponse, DeleteSnapshotRequest,
    DeleteSnapshotResponse, DeleteVolumeRequest, DeleteVolumeResponse, GetCapacityRequest,
    GetCapacityResponse, ListSnapshotsRequest, ListSnapshotsResponse, ListVolumesRequest,
    ListVolumesResponse, Snapshot as CsiSnapshot, ValidateVolumeCapabilitiesRequest,
    ValidateVolumeCapabilitiesResponse, Volume as CsiVolume, VolumeContentSource,
};

use crate::capability::{
    Capabilities, Capability, ALREADY_PUBLISHED_CAP, INCOMPATIBLE_REQUESTED_CAPABILITY,
};
use crate::config::Feature;
use crate::connector::NodeInfo;
use crate::object::{
    date_to_nanos, nanos_to_date, AttachMode, Snapshot, SnapshotStatus, Volume, VolumeStatus,
    CAPABILITIES_KEY, CAPABILITY_KEY, GB,
};
use crate::persistence::SnapshotFilter;
use crate::plugin::{calculate_size, PluginContext, WaitOutcome};
use crate::rpc::{self, required_field, required_list, required_str};

/// Parameter keys the orchestrator is not allowed to smuggle in, since
/// they would clash with attributes we manage.
const FORBIDDEN_PARAMETERS: &[&str] = &["id", "name", "size", "volume_size", "multiattach"];

const QOS_PREFIX: &str = "qos_";
const XTRA_PREFIX: &str = "xtra_";

#[derive(Clone)]
pub struct ControllerService {
    ctx: Arc<PluginContext>,
}

impl ControllerService {
    pub fn new(ctx: Arc<PluginContext>) -> Self {
        ControllerService { ctx }
    }

    fn capability_list(&self) -> Vec<ControllerServiceCapability> {
        let ember = &self.ctx.config.ember;
        let mut types = vec![
            RpcType::CreateDeleteVolume,
            RpcType::PublishUnpublishVolume,
            RpcType::ListVolumes,
            RpcType::GetCapacity,
            RpcType::PublishReadonly,
        ];
        if !ember.disabled(Feature::Snapshot) {
            types.push(RpcType::CreateDeleteSnapshot);
            types.push(RpcType::ListSnapshots);
        }
        if !ember.disabled(Feature::Clone) {
            types.push(RpcType::CloneVolume);
        }
        if self.ctx.config.spec_version.supports_expansion() && !ember.disabled(Feature::Expand) {
            types.push(RpcType::ExpandVolume);
        }
        types
            .into_iter()
            .map(|t| ControllerServiceCapability {
                r#type: Some(CapabilityType::Rpc(Rpc { r#type: t as i32 })),
            })
            .collect()
    }

    /// Maps request parameters into volume metadata, routing the qos_ and
    /// xtra_ prefixes to their namespaces.
    fn extract_parameters(
        parameters: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, Status> {
        let mut metadata = BTreeMap::new();
        for (key, value) in parameters {
            if FORBIDDEN_PARAMETERS.contains(&key.as_str()) {
                return Err(Status::invalid_argument(format!(
                    "Invalid parameter {}",
                    key
                )));
            }
            let mapped = if let Some(name) = key.strip_prefix(QOS_PREFIX) {
                format!("qos:{}", name)
            } else if let Some(name) = key.strip_prefix(XTRA_PREFIX) {
                format!("xtra:{}", name)
            } else {
                key.clone()
            };
            metadata.insert(mapped, value.clone());
        }
        Ok(metadata)
    }

    /// The inverse of `extract_parameters`, for volume_context responses.
    fn volume_context(volume: &Volume) -> BTreeMap<String, String> {
        volume
            .metadata
            .iter()
            .filter(|(key, _)| {
                key.as_str() != CAPABILITIES_KEY && key.as_str() != crate::object::FS_TYPE_KEY
            })
            .map(|(key, value)| {
                let restored = if let Some(name) = key.strip_prefix("qos:") {
                    format!("{}{}", QOS_PREFIX, name)
                } else if let Some(name) = key.strip_prefix("xtra:") {
                    format!("{}{}", XTRA_PREFIX, name)
                } else {
                    key.clone()
                };
                (restored, value.clone())
            })
            .collect()
    }

    fn to_csi_volume(&self, volume: &Volume) -> CsiVolume {
        let content_source = if let Some(snapshot_id) = &volume.source_snapshot_id {
            Some(VolumeContentSource {
                r#type: Some(SourceType::Snapshot(SnapshotSource {
                    snapshot_id: snapshot_id.clone(),
                })),
            })
        } else {
            volume.source_volume_id.as_ref().map(|volume_id| VolumeContentSource {
                r#type: Some(SourceType::Volume(VolumeSource {
                    volume_id: volume_id.clone(),
                })),
            })
        };

        let accessible_topology = self
            .ctx
            .topology
            .as_ref()
            .map(|tree| tree.grpc_topologies())
            .unwrap_or_default();

        CsiVolume {
            capacity_bytes: volume.size_bytes(),
            volume_id: volume.id.clone(),
            volume_context: Self::volume_context(volume),
            content_source,
            accessible_topology,
        }
    }

    fn to_csi_snapshot(snapshot: &Snapshot) -> CsiSnapshot {
        CsiSnapshot {
            size_bytes: snapshot.size_bytes(),
            snapshot_id: snapshot.id.clone(),
            source_volume_id: snapshot.volume_id.clone(),
            creation_time: Some(prost_types::Timestamp {
                seconds: snapshot.created_at.timestamp(),
                nanos: snapshot.created_at.timestamp_subsec_nanos() as i32,
            }),
            ready_to_use: snapshot.status == SnapshotStatus::Available,
        }
    }

    fn validate_create_requirements(&self, request: &CreateVolumeRequest) -> Result<(), Status> {
        if let Some(tree) = &self.ctx.topology {
            if let Some(requirements) = &request.accessibility_requirements {
                tree.validate_requirements(requirements)?;
            }
        }
        Ok(())
    }

    /// Creates the backend volume according to the requested content
    /// source and persists the final state. The record exists in
    /// `creating` state during the backend call so concurrent retries can
    /// find and wait on it.
    async fn provision(
        &self,
        request: &CreateVolumeRequest,
        mut volume: Volume,
        vol_gb: i64,
    ) -> Result<Volume, Status> {
        let driver = self.ctx.driver()?.clone();

        enum Source {
            Empty,
            Snapshot(Snapshot),
            Volume(Volume),
        }

        let source = match request
            .volume_content_source
            .as_ref()
            .and_then(|s| s.r#type.as_ref())
        {
            None => Source::Empty,
            Some(SourceType::Snapshot(source)) => {
                self.ctx.fail_if_disabled(Feature::Snapshot)?;
                let snapshot = self
                    .ctx
                    .get_snapshot(&source.snapshot_id)
                    .await?
                    .ok_or_else(|| {
                        Status::not_found(format!(
                            "Snapshot {} does not exist",
                            source.snapshot_id
                        ))
                    })?;
                if snapshot.status != SnapshotStatus::Available {
                    return Err(Status::invalid_argument(format!(
                        "Snapshot {} is not available",
                        snapshot.id
                    )));
                }
                if snapshot.volume_size_gb > vol_gb {
                    return Err(Status::out_of_range(format!(
                        "Snapshot {} is bigger than requested volume",
                        snapshot.id
                    )));
                }
                volume.source_snapshot_id = Some(snapshot.id.clone());
                Source::Snapshot(snapshot)
            }
            Some(SourceType::Volume(source)) => {
                self.ctx.fail_if_disabled(Feature::Clone)?;
                let source_volume = self
                    .ctx
                    .get_volume(&source.volume_id)
                    .await?
                    .ok_or_else(|| {
                        Status::not_found(format!("Volume {} does not exist", source.volume_id))
                    })?;
                if !matches!(
                    source_volume.status,
                    VolumeStatus::Available | VolumeStatus::InUse
                ) {
                    return Err(Status::invalid_argument(format!(
                        "Volume {} is not available",
                        source_volume.id
                    )));
                }
                if source_volume.size_gb > vol_gb {
                    return Err(Status::out_of_range(format!(
                        "Volume {} is bigger than requested volume",
                        source_volume.id
                    )));
                }
                volume.source_volume_id = Some(source_volume.id.clone());
                Source::Volume(source_volume)
            }
        };

        self.ctx.persistence.set_volume(&mut volume, true).await?;

        let created = match &source {
            Source::Empty => driver.create_volume(&volume).await,
            Source::Snapshot(snapshot) => {
                driver.create_volume_from_snapshot(snapshot, &volume).await
            }
            Source::Volume(source_volume) => driver.clone_volume(source_volume, &volume).await,
        };

        match created {
            Ok(()) => {
                volume.status = VolumeStatus::Available;
                self.ctx.persistence.set_volume(&mut volume, false).await?;
                Ok(volume)
            }
            Err(err) => {
                volume.status = VolumeStatus::Error;
                self.ctx.persistence.set_volume(&mut volume, false).await?;
                Err(Status::unknown(err.to_string()))
            }
        }
    }

    async fn do_create_volume(
        &self,
        request: &CreateVolumeRequest,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let name = required_str(&request.name, "name")?;
        required_list(&request.volume_capabilities, "volume_capabilities")?;

        let (vol_gb, min_bytes, max_bytes) = calculate_size(request.capacity_range.as_ref())?;
        let capabilities = Capabilities::from_grpc(
            &request.volume_capabilities,
            &self.ctx.config.default_mount_fs,
        )?;
        self.ctx.validate_capabilities(&capabilities)?;
        self.validate_create_requirements(request)?;
        let parameters = Self::extract_parameters(&request.parameters)?;

        let _slot = self.ctx.serializer.lock("CreateVolume", name).await?;

        let volume = match self.ctx.get_volume_by_name(name).await? {
            Some(existing) => {
                if existing.size_bytes() < min_bytes || existing.size_bytes() > max_bytes {
                    return Err(Status::already_exists(
                        "Volume already exists but is incompatible",
                    ));
                }
                let existing = if existing.status == VolumeStatus::Creating {
                    // Another request is provisioning it; wait for the
                    // outcome.
                    match self
                        .ctx
                        .wait_for_volume(&existing.id, &[VolumeStatus::Available])
                        .await?
                    {
                        WaitOutcome::Reached(volume) => volume,
                        WaitOutcome::Errored(volume) => {
                            return Err(Status::aborted(format!(
                                "Operation pending for volume ({})",
                                volume.status
                            )))
                        }
                        WaitOutcome::Gone => {
                            return Err(Status::aborted(
                                "Volume disappeared while being created",
                            ))
                        }
                    }
                } else {
                    existing
                };
                if !matches!(
                    existing.status,
                    VolumeStatus::Available | VolumeStatus::InUse
                ) {
                    return Err(Status::aborted(format!(
                        "Operation pending for volume ({})",
                        existing.status
                    )));
                }
                existing
            }
            None => {
                let backend_id = self.ctx.backend_id().unwrap_or_default().to_owned();
                let mut volume = Volume::new(name, vol_gb, &backend_id);
                volume.metadata = parameters;
                volume
                    .metadata
                    .insert(CAPABILITIES_KEY.to_owned(), capabilities.to_json());
                self.provision(request, volume, vol_gb).await?
            }
        };

        Ok(Response::new(CreateVolumeResponse {
            volume: Some(self.to_csi_volume(&volume)),
        }))
    }

    async fn do_delete_volume(
        &self,
        request: &DeleteVolumeRequest,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let volume_id = required_str(&request.volume_id, "volume_id")?;
        let _slot = self.ctx.serializer.lock("DeleteVolume", volume_id).await?;

        let mut volume = match self.ctx.get_volume(volume_id).await? {
            Some(volume) => volume,
            None => return Ok(Response::new(DeleteVolumeResponse {})),
        };

        if volume.status == VolumeStatus::InUse {
            return Err(Status::failed_precondition("Volume in use"));
        }
        if !matches!(
            volume.status,
            VolumeStatus::Available | VolumeStatus::Deleting | VolumeStatus::Deleted
        ) && !volume.status.is_error()
        {
            return Err(Status::aborted(format!(
                "Operation pending for volume ({})",
                volume.status
            )));
        }

        if volume.status == VolumeStatus::Deleting {
            // A previous delete is in flight; a NotFound race here means it
            // finished.
            match self
                .ctx
                .wait_for_volume(&volume.id, &[VolumeStatus::Deleted])
                .await?
            {
                WaitOutcome::Reached(_) | WaitOutcome::Gone => {
                    return Ok(Response::new(DeleteVolumeResponse {}))
                }
                WaitOutcome::Errored(errored) => volume = errored,
            }
        }

        // A volume that still owns snapshots is only soft-deleted so the
        // snapshots stay usable; deleting its last snapshot finishes the
        // job.
        let snapshots = self
            .ctx
            .persistence
            .get_snapshots(SnapshotFilter {
                volume_id: Some(&volume.id),
                ..Default::default()
            })
            .await?;
        if !snapshots.is_empty() {
            if volume.status != VolumeStatus::Deleted {
                volume.status = VolumeStatus::Deleted;
                self.ctx.persistence.set_volume(&mut volume, false).await?;
            }
            return Ok(Response::new(DeleteVolumeResponse {}));
        }

        if volume.status != VolumeStatus::Deleted {
            volume.status = VolumeStatus::Deleting;
            self.ctx.persistence.set_volume(&mut volume, false).await?;

            if let Err(err) = self.ctx.driver()?.delete_volume(&volume).await {
                volume.status = VolumeStatus::ErrorDeleting;
                self.ctx.persistence.set_volume(&mut volume, false).await?;
                return Err(Status::unknown(err.to_string()));
            }
        }

        self.ctx.persistence.delete_volume(&volume.id).await?;
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    async fn do_publish(
        &self,
        request: &ControllerPublishVolumeRequest,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        let volume_id = required_str(&request.volume_id, "volume_id")?;
        let node_id = required_str(&request.node_id, "node_id")?;
        let capability = required_field(&request.volume_capability, "volume_capability")?;

        let _slot = self
            .ctx
            .serializer
            .lock("ControllerPublishVolume", volume_id)
            .await?;

        let node = NodeInfo::get(self.ctx.persistence.as_ref(), node_id)
            .await?
            .ok_or_else(|| Status::not_found(format!("Node {} does not exist", node_id)))?;

        let mut volume = self.ctx.require_volume(volume_id).await?;
        if !matches!(
            volume.status,
            VolumeStatus::Available | VolumeStatus::InUse
        ) {
            return Err(Status::aborted(format!(
                "Operation pending for volume ({})",
                volume.status
            )));
        }

        let requested = Capability::from_grpc(
            capability,
            request.readonly,
            &self.ctx.config.default_mount_fs,
        )?;

        let connections = self.ctx.connections_for_volume(&volume.id).await?;
        if let Some(existing) = connections.iter().find(|c| c.attached_host == node_id) {
            let published = existing
                .capability_blob()
                .and_then(|blob| Capability::from_json(blob).ok());
            if published.as_ref() != Some(&requested) {
                return Err(Status::already_exists(ALREADY_PUBLISHED_CAP));
            }
            return Ok(Response::new(ControllerPublishVolumeResponse {
                publish_context: publish_context(existing),
            }));
        }

        if let Some(vol_caps) = self.ctx.volume_capabilities(&volume) {
            if !vol_caps.supports(&requested) {
                return Err(Status::invalid_argument(INCOMPATIBLE_REQUESTED_CAPABILITY));
            }
        }
        requested.incompatible_connections(&connections, &[])?;

        // The node's connector blob travels on the connection, augmented
        // with the capability this publish was made with.
        let mut connector_info = node.connector.clone();
        if let Some(map) = connector_info.as_object_mut() {
            map.insert(
                CAPABILITY_KEY.to_owned(),
                serde_json::Value::String(requested.to_json()),
            );
        }

        let connection_info = self
            .ctx
            .driver()?
            .initialize_connection(&volume, &connector_info)
            .await
            .map_err(|e| Status::unknown(e.to_string()))?;

        let attach_mode = if requested.used_as_ro() {
            AttachMode::ReadOnly
        } else {
            AttachMode::ReadWrite
        };
        let mut connection = crate::object::Connection::new(
            &volume.id,
            node_id,
            connector_info,
            connection_info,
            attach_mode,
        );
        self.ctx
            .persistence
            .set_connection(&mut connection, true)
            .await?;

        if volume.status != VolumeStatus::InUse {
            volume.status = VolumeStatus::InUse;
            self.ctx.persistence.set_volume(&mut volume, false).await?;
        }

        Ok(Response::new(ControllerPublishVolumeResponse {
            publish_context: publish_context(&connection),
        }))
    }

    async fn do_unpublish(
        &self,
        request: &ControllerUnpublishVolumeRequest,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        let volume_id = required_str(&request.volume_id, "volume_id")?;
        let _slot = self
            .ctx
            .serializer
            .lock("ControllerUnpublishVolume", volume_id)
            .await?;

        // An empty node id means unpublish everywhere.
        let node_id = match request.node_id.as_str() {
            "" => None,
            node_id => {
                NodeInfo::get(self.ctx.persistence.as_ref(), node_id)
                    .await?
                    .ok_or_else(|| {
                        Status::not_found(format!("Node {} does not exist", node_id))
                    })?;
                Some(node_id)
            }
        };

        let mut volume = self.ctx.require_volume(volume_id).await?;

        let connections = self.ctx.connections_for_volume(&volume.id).await?;
        let (matching, remaining): (Vec<_>, Vec<_>) = connections
            .into_iter()
            .partition(|c| node_id.map(|n| c.attached_host == n).unwrap_or(true));

        // NodePublish duplicates (per-target-path records) only need their
        // record removed; the primary connection is the one the driver
        // knows about, so it goes last.
        let (duplicates, primaries): (Vec<_>, Vec<_>) =
            matching.into_iter().partition(|c| c.instance_uuid.is_some());
        for connection in &duplicates {
            self.ctx.persistence.delete_connection(&connection.id).await?;
        }
        for connection in &primaries {
            self.ctx
                .driver()?
                .terminate_connection(&volume, &connection.connector_info)
                .await
                .map_err(|e| Status::unknown(e.to_string()))?;
            self.ctx.persistence.delete_connection(&connection.id).await?;
        }

        if remaining.is_empty() && volume.status == VolumeStatus::InUse {
            volume.status = VolumeStatus::Available;
            self.ctx.persistence.set_volume(&mut volume, false).await?;
        }

        Ok(Response::new(ControllerUnpublishVolumeResponse {}))
    }

    async fn do_expand(
        &self,
        request: &ControllerExpandVolumeRequest,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        let volume_id = required_str(&request.volume_id, "volume_id")?;
        required_field(&request.capacity_range, "capacity_range")?;
        self.ctx.fail_if_disabled(Feature::Expand)?;

        let _slot = self
            .ctx
            .serializer
            .lock("ControllerExpandVolume", volume_id)
            .await?;

        let mut volume = self.ctx.require_volume(volume_id).await?;
        let (vol_gb, min_bytes, max_bytes) = calculate_size(request.capacity_range.as_ref())?;

        if volume.size_gb > vol_gb {
            return Err(Status::out_of_range(format!(
                "Volume cannot shrink from {} to {} GiB",
                volume.size_gb, vol_gb
            )));
        }

        let used = volume.status == VolumeStatus::InUse;
        if used && self.ctx.config.ember.disabled(Feature::ExpandOnline) {
            return Err(Status::failed_precondition("Online expansion is disabled"));
        }

        if volume.size_bytes() < min_bytes || volume.size_bytes() > max_bytes {
            self.ctx
                .driver()?
                .extend_volume(&volume, vol_gb)
                .await
                .map_err(|e| Status::unknown(e.to_string()))?;
            volume.size_gb = vol_gb;
            self.ctx.persistence.set_volume(&mut volume, false).await?;
        }

        // The node has work to do when the volume is attached somewhere or
        // carries a filesystem that will need growing after staging.
        let node_expansion_required = used || volume.fs_type().is_some();
        Ok(Response::new(ControllerExpandVolumeResponse {
            capacity_bytes: volume.size_bytes(),
            node_expansion_required,
        }))
    }

    async fn do_create_snapshot(
        &self,
        request: &CreateSnapshotRequest,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        let name = required_str(&request.name, "name")?;
        let source_volume_id = required_str(&request.source_volume_id, "source_volume_id")?;
        self.ctx.fail_if_disabled(Feature::Snapshot)?;

        let _slot = self.ctx.serializer.lock("CreateSnapshot", name).await?;

        let snapshot = match self.ctx.get_snapshot_by_name(name).await? {
            Some(existing) => {
                if existing.volume_id != source_volume_id {
                    return Err(Status::already_exists(format!(
                        "Snapshot {} from {} exists for volume {}",
                        name, source_volume_id, existing.volume_id
                    )));
                }
                existing
            }
            None => {
                let volume = self.ctx.require_volume(source_volume_id).await?;
                let mut snapshot = Snapshot::new(name, &volume);
                self.ctx
                    .persistence
                    .set_snapshot(&mut snapshot, true)
                    .await?;
                match self.ctx.driver()?.create_snapshot(&snapshot).await {
                    Ok(()) => {
                        snapshot.status = SnapshotStatus::Available;
                        self.ctx
                            .persistence
                            .set_snapshot(&mut snapshot, false)
                            .await?;
                        snapshot
                    }
                    Err(err) => {
                        snapshot.status = SnapshotStatus::Error;
                        self.ctx
                            .persistence
                            .set_snapshot(&mut snapshot, false)
                            .await?;
                        return Err(Status::unknown(err.to_string()));
                    }
                }
            }
        };

        Ok(Response::new(CreateSnapshotResponse {
            snapshot: Some(Self::to_csi_snapshot(&snapshot)),
        }))
    }

    async fn do_delete_snapshot(
        &self,
        request: &DeleteSnapshotRequest,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        let snapshot_id = required_str(&request.snapshot_id, "snapshot_id")?;
        let _slot = self
            .ctx
            .serializer
            .lock("DeleteSnapshot", snapshot_id)
            .await?;

        let snapshot = match self.ctx.get_snapshot(snapshot_id).await? {
            Some(snapshot) => snapshot,
            None => return Ok(Response::new(DeleteSnapshotResponse {})),
        };

        self.ctx
            .driver()?
            .delete_snapshot(&snapshot)
            .await
            .map_err(|e| Status::unknown(e.to_string()))?;
        self.ctx.persistence.delete_snapshot(&snapshot.id).await?;

        // Deleting the last snapshot of a soft-deleted volume completes
        // the pending volume deletion.
        if let Some(volume) = self.ctx.get_volume(&snapshot.volume_id).await? {
            if volume.status == VolumeStatus::Deleted {
                let left = self
                    .ctx
                    .persistence
                    .get_snapshots(SnapshotFilter {
                        volume_id: Some(&volume.id),
                        ..Default::default()
                    })
                    .await?;
                if left.is_empty() {
                    self.ctx
                        .driver()?
                        .delete_volume(&volume)
                        .await
                        .map_err(|e| Status::unknown(e.to_string()))?;
                    self.ctx.persistence.delete_volume(&volume.id).await?;
                }
            }
        }

        Ok(Response::new(DeleteSnapshotResponse {}))
    }
}

fn publish_context(connection: &crate::object::Connection) -> BTreeMap<String, String> {
    let mut context = BTreeMap::new();
    context.insert(
        "connection_info".to_owned(),
        connection.connection_info.to_string(),
    );
    context
}

/// Sorts by creation time and applies the token/max-entries window. The
/// token is the nanosecond timestamp of the last entry of the previous
/// page; paging resumes strictly after it.
pub fn paginate<T>(
    mut items: Vec<T>,
    created_at: impl Fn(&T) -> DateTime<Utc>,
    starting_token: &str,
    max_entries: i32,
) -> Result<(Vec<T>, String), Status> {
    items.sort_by_key(|item| created_at(item));

    let start = if starting_token.is_empty() {
        0
    } else {
        let marker =
            nanos_to_date(starting_token).map_err(|_| Status::aborted("Invalid starting_token"))?;
        items
            .iter()
            .position(|item| created_at(item) > marker)
            .unwrap_or(items.len())
    };

    let end = if max_entries > 0 {
        (start + max_entries as usize).min(items.len())
    } else {
        items.len()
    };

    let next_token = if end < items.len() && end > start {
        date_to_nanos(&created_at(&items[end - 1]))
    } else {
        String::new()
    };

    let page = items.drain(..end).skip(start).collect();
    Ok((page, next_token))
}

#[async_trait::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let request = request.into_inner();
        rpc::log_request(&request);
        rpc::logged("CreateVolume", &request.name, self.do_create_volume(&request)).await
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let request = request.into_inner();
        rpc::log_request(&request);
        rpc::logged(
            "DeleteVolume",
            &request.volume_id,
            self.do_delete_volume(&request),
        )
        .await
    }

    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        let request = request.into_inner();
        rpc::log_request(&request);
        rpc::logged(
            "ControllerPublishVolume",
            &request.volume_id,
            self.do_publish(&request),
        )
        .await
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        let request = request.into_inner();
        rpc::log_request(&request);
        rpc::logged(
            "ControllerUnpublishVolume",
            &request.volume_id,
            self.do_unpublish(&request),
        )
        .await
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let request = request.into_inner();
        rpc::log_request(&request);
        rpc::logged("ValidateVolumeCapabilities", &request.volume_id, async {
            required_str(&request.volume_id, "volume_id")?;
            required_list(&request.volume_capabilities, "volume_capabilities")?;

            let volume = self.ctx.require_volume(&request.volume_id).await?;

            let requested = Capabilities::from_grpc(
                &request.volume_capabilities,
                &self.ctx.config.default_mount_fs,
            )?;
            let mut message = self
                .ctx
                .service_caps
                .unsupported(&requested)
                .map(|m| m.to_owned());

            if message.is_none() {
                if let Some(vol_caps) = self.ctx.volume_capabilities(&volume) {
                    if requested.iter().any(|cap| !vol_caps.supports(cap)) {
                        message = Some(INCOMPATIBLE_REQUESTED_CAPABILITY.to_owned());
                    }
                }
            }

            if message.is_none() {
                let context = Self::volume_context(&volume);
                for (key, value) in &request.parameters {
                    if context.get(key) != Some(value) {
                        message = Some(format!("Parameter {} does not match", key));
                        break;
                    }
                }
            }

            let response = match message {
                Some(message) => ValidateVolumeCapabilitiesResponse {
                    confirmed: None,
                    message,
                },
                None => ValidateVolumeCapabilitiesResponse {
                    confirmed: Some(validate_volume_capabilities_response::Confirmed {
                        volume_context: request.volume_context.clone(),
                        volume_capabilities: request.volume_capabilities.clone(),
                        parameters: request.parameters.clone(),
                    }),
                    message: String::new(),
                },
            };
            Ok(Response::new(response))
        })
        .await
    }

    async fn list_volumes(
        &self,
        request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        let request = request.into_inner();
        rpc::log_request(&request);
        rpc::logged("ListVolumes", "", async {
            let volumes = self.ctx.list_volumes().await?;
            let (page, next_token) = paginate(
                volumes,
                |v| v.created_at,
                &request.starting_token,
                request.max_entries,
            )?;
            let entries = page
                .iter()
                .map(|volume| list_volumes_response::Entry {
                    volume: Some(self.to_csi_volume(volume)),
                    status: None,
                })
                .collect();
            Ok(Response::new(ListVolumesResponse {
                entries,
                next_token,
            }))
        })
        .await
    }

    async fn get_capacity(
        &self,
        request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        let request = request.into_inner();
        rpc::log_request(&request);
        rpc::logged("GetCapacity", "", async {
            if !request.volume_capabilities.is_empty() {
                let capabilities = Capabilities::from_grpc(
                    &request.volume_capabilities,
                    &self.ctx.config.default_mount_fs,
                )?;
                self.ctx.validate_capabilities(&capabilities)?;
            }
            if let (Some(tree), Some(topology)) =
                (&self.ctx.topology, &request.accessible_topology)
            {
                if !tree.accessible(&topology.segments)? {
                    return Err(Status::invalid_argument("Topology is not accessible"));
                }
            }

            let stats = self
                .ctx
                .driver()?
                .stats(true)
                .await
                .map_err(|e| Status::unknown(e.to_string()))?;
            Ok(Response::new(GetCapacityResponse {
                available_capacity: (stats.free_capacity_gb * GB as f64) as i64,
            }))
        })
        .await
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        rpc::logged("ControllerGetCapabilities", "", async {
            Ok(Response::new(ControllerGetCapabilitiesResponse {
                capabilities: self.capability_list(),
            }))
        })
        .await
    }

    async fn create_snapshot(
        &self,
        request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        let request = request.into_inner();
        rpc::log_request(&request);
        rpc::logged(
            "CreateSnapshot",
            &request.name,
            self.do_create_snapshot(&request),
        )
        .await
    }

    async fn delete_snapshot(
        &self,
        request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        let request = request.into_inner();
        rpc::log_request(&request);
        rpc::logged(
            "DeleteSnapshot",
            &request.snapshot_id,
            self.do_delete_snapshot(&request),
        )
        .await
    }

    async fn list_snapshots(
        &self,
        request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<ListSnapshotsResponse>, Status> {
        let request = request.into_inner();
        rpc::log_request(&request);
        rpc::logged("ListSnapshots", &request.snapshot_id, async {
            let filter = SnapshotFilter {
                id: match request.snapshot_id.as_str() {
                    "" => None,
                    id => Some(id),
                },
                volume_id: match request.source_volume_id.as_str() {
                    "" => None,
                    id => Some(id),
                },
                ..Default::default()
            };
            let snapshots = self.ctx.persistence.get_snapshots(filter).await?;
            let (page, next_token) = paginate(
                snapshots,
                |s| s.created_at,
                &request.starting_token,
                request.max_entries,
            )?;
            let entries = page
                .iter()
                .map(|snapshot| list_snapshots_response::Entry {
                    snapshot: Some(Self::to_csi_snapshot(snapshot)),
                })
                .collect();
            Ok(Response::new(ListSnapshotsResponse {
                entries,
                next_token,
            }))
        })
        .await
    }

    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        let request = request.into_inner();
        rpc::log_request(&request);
        rpc::logged(
            "ControllerExpandVolume",
            &request.volume_id,
            self.do_expand(&request),
        )
        .await
    }

    async fn controller_get_volume(
        &self,
        _request: Request<ControllerGetVolumeRequest>,
    ) -> Result<Response<ControllerGetVolumeResponse>, Status> {
        // Not advertised in our capability list.
        Err(Status::unimplemented("ControllerGetVolume is not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn stamped(nanos: i64) -> DateTime<Utc> {
        Utc.timestamp_nanos(nanos)
    }

    #[test]
    fn pagination_windows_are_stable() {
        let items: Vec<DateTime<Utc>> = (1..=5).map(|i| stamped(i * 1_000)).collect();

        let (page1, token1) = paginate(items.clone(), |t| *t, "", 2).unwrap();
        assert_eq!(page1.len(), 2);
        assert!(!token1.is_empty());

        let (page2, token2) = paginate(items.clone(), |t| *t, &token1, 2).unwrap();
        assert_eq!(page2.len(), 2);
        assert!(!token2.is_empty());

        let (page3, token3) = paginate(items.clone(), |t| *t, &token2, 2).unwrap();
        assert_eq!(page3.len(), 1);
        assert!(token3.is_empty());

        // Concatenation equals the full sorted listing.
        let mut all: Vec<_> = page1;
        all.extend(page2);
        all.extend(page3);
        assert_eq!(all, items);
    }

    #[test]
    fn pagination_rejects_bad_tokens() {
        let items = vec![stamped(1_000)];
        let err = paginate(items, |t| *t, "not-nanos", 2).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Aborted);
        assert_eq!(err.message(), "Invalid starting_token");
    }

    #[test]
    fn pagination_without_limit_returns_everything() {
        let items: Vec<DateTime<Utc>> = (1..=3).map(|i| stamped(i * 1_000)).collect();
        let (page, token) = paginate(items.clone(), |t| *t, "", 0).unwrap();
        assert_eq!(page, items);
        assert!(token.is_empty());
    }

    #[test]
    fn forbidden_parameters_are_rejected() {
        let mut params = BTreeMap::new();
        params.insert("size".to_owned(), "10".to_owned());
        let err = ControllerService::extract_parameters(&params).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn parameter_prefixes_map_to_namespaces() {
        let mut params = BTreeMap::new();
        params.insert("qos_iops".to_owned(), "1000".to_owned());
        params.insert("xtra_thin".to_owned(), "true".to_owned());
        params.insert("plain".to_owned(), "kept".to_owned());
        let metadata = ControllerService::extract_parameters(&params).unwrap();
        assert_eq!(metadata["qos:iops"], "1000");
        assert_eq!(metadata["xtra:thin"], "true");
        assert_eq!(metadata["plain"], "kept");

        let mut volume = Volume::new("v", 1, "b");
        volume.metadata = metadata;
        let context = ControllerService::volume_context(&volume);
        assert_eq!(context["qos_iops"], "1000");
        assert_eq!(context["xtra_thin"], "true");
        assert_eq!(context["plain"], "kept");
    }

    #[test]
    fn snapshot_response_is_built_from_the_record() {
        let volume = Volume::new("vol", 3, "backend");
        let mut snapshot = Snapshot::new("snap", &volume);
        snapshot.status = SnapshotStatus::Available;
        let csi = ControllerService::to_csi_snapshot(&snapshot);
        assert_eq!(csi.snapshot_id, snapshot.id);
        assert_eq!(csi.source_volume_id, volume.id);
        assert_eq!(csi.size_bytes, 3 * GB);
        assert!(csi.ready_to_use);
        assert!(csi.creation_time.is_some());
    }
}
