//! CSI Node service: staging, publishing, host-side expansion and stats
//! for volumes consumed on this host.
//!
//! The staging layout has two fixed anchors: the real device is bind
//! mounted at the private path `<state>/vols/<volume id>` so later calls
//! can always find the canonical source, and the staged mount itself lives
//! at `<staging_target_path>/stage`.

use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::warn;

use k8s_csi::v1_3_0::node_server::Node;
use k8s_csi::v1_3_0::node_service_capability::rpc::Type as RpcType;
use k8s_csi::v1_3_0::node_service_capability::{Rpc, Type as CapabilityType};
use k8s_csi::v1_3_0::volume_usage::Unit;
use k8s_csi::v1_3_0::{
    NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetCapabilitiesRequest,
    NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse,
    NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest,
    NodePublishVolumeResponse, NodeServiceCapability, NodeStageVolumeRequest,
    NodeStageVolumeResponse, NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse,
    NodeUnstageVolumeRequest, NodeUnstageVolumeResponse, Topology, VolumeUsage,
};

use crate::capability::{Capabilities, Capability, INCOMPATIBLE_CAP_PATH};
use crate::config::Feature;
use crate::connector::VolumeConnector;
use crate::mount;
use crate::object::{Connection, Volume, FS_TYPE_KEY};
use crate::plugin::{calculate_size, mkfs_args, PluginContext, MULTIPATH_FIND_RETRIES};
use crate::rpc::{self, required_field, required_str};

/// Fixed leaf name of the staged mount inside the CO-provided staging
/// directory.
pub const STAGED_NAME: &str = "stage";

/// volume_context key carrying the consuming pod's uid.
const POD_UID_KEY: &str = "csi.storage.k8s.io/pod.uid";

const EXT_FILESYSTEMS: &[&str] = &["ext2", "ext3", "ext4"];

#[derive(Clone)]
pub struct NodeService {
    ctx: Arc<PluginContext>,
    connector: Arc<dyn VolumeConnector>,
}

impl NodeService {
    pub fn new(ctx: Arc<PluginContext>, connector: Arc<dyn VolumeConnector>) -> Self {
        NodeService { ctx, connector }
    }

    fn node_id(&self) -> &str {
        self.ctx
            .config
            .node_id
            .as_deref()
            .expect("node service always has a node id")
    }

    fn private_bind(&self, volume_id: &str) -> PathBuf {
        self.ctx.config.ember.state_path.join("vols").join(volume_id)
    }

    /// The device backing a volume on this host, from the mount table via
    /// the private bind anchor.
    async fn vol_device(&self, volume_id: &str) -> Result<(Option<String>, PathBuf), Status> {
        let private_bind = self.private_bind(volume_id);
        let mountinfo = mount::read_mountinfo().await?;
        let device = mount::device_for_path(&mountinfo, &private_bind.to_string_lossy())
            .map(|d| d.to_owned());
        Ok((device, private_bind))
    }

    /// The primary connection for this node (the one ControllerPublish
    /// made, not a per-target duplicate).
    async fn staging_connection(&self, volume_id: &str) -> Result<Option<Connection>, Status> {
        let connections = self.ctx.connections_for_volume(volume_id).await?;
        Ok(connections
            .into_iter()
            .find(|c| c.attached_host == self.node_id() && c.instance_uuid.is_none()))
    }

    fn check_path(path: &str, field: &'static str, is_block: bool) -> Result<(), Status> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            Status::invalid_argument(format!("Invalid {} path: {}", field, e))
        })?;
        let file_type = metadata.file_type();
        let valid = if is_block {
            file_type.is_block_device() || file_type.is_file()
        } else {
            file_type.is_dir()
        };
        if !valid {
            return Err(Status::invalid_argument(format!("Invalid existing {}", field)));
        }
        Ok(())
    }

    fn staged_path(staging_target_path: &str) -> PathBuf {
        Path::new(staging_target_path).join(STAGED_NAME)
    }

    /// Attaches the volume and anchors the device at the private bind.
    /// Slow fabrics may need a few attach rounds before multipath shows
    /// up; attach is cheap to repeat since the session already exists.
    async fn attach_volume(
        &self,
        connection: &Connection,
        private_bind: &Path,
    ) -> Result<String, Status> {
        let want_multipath = connection
            .connector_info
            .get("multipath")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let mut device = self
            .connector
            .attach(connection)
            .await
            .map_err(|e| Status::unknown(e.to_string()))?;
        if want_multipath {
            for _ in 1..MULTIPATH_FIND_RETRIES {
                if self.connector.is_multipath(&device) {
                    break;
                }
                warn!(volume = %connection.volume_id, "multipath not present yet, retrying attach");
                device = self
                    .connector
                    .attach(connection)
                    .await
                    .map_err(|e| Status::unknown(e.to_string()))?;
            }
        }

        if let Some(parent) = private_bind.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Status::unknown(format!("cannot create private bind directory: {}", e))
            })?;
        }
        if !private_bind.exists() {
            tokio::fs::File::create(private_bind)
                .await
                .map_err(|e| Status::unknown(format!("cannot create private bind: {}", e)))?;
        }
        let device_str = device.to_string_lossy().into_owned();
        mount::bind_mount(&device_str, &private_bind.to_string_lossy(), false).await?;
        Ok(device_str)
    }

    /// Stages a mount volume: format if needed, then mount the private
    /// bind at the staged path.
    async fn stage_mount(
        &self,
        volume: &mut Volume,
        capability: &Capability,
        private_bind: &Path,
        staged: &Path,
    ) -> Result<(), Status> {
        let private = private_bind.to_string_lossy();
        let mounts = mount::read_mounts().await?;
        let existing = mount::mounts_for_source(&mounts, &private);

        if let Some(current) = existing.first() {
            if current.target != staged.to_string_lossy() {
                return Err(Status::already_exists(format!(
                    "Filesystem already mounted on {}",
                    current.target
                )));
            }
            let missing: Vec<&String> = capability
                .mount_flags
                .as_deref()
                .unwrap_or_default()
                .iter()
                .filter(|&flag| !current.options.contains(flag))
                .collect();
            if !missing.is_empty() {
                return Err(Status::already_exists(format!(
                    "Already mounted with different flags ({:?})",
                    missing
                )));
            }
            return Ok(());
        }

        let fs_type = capability
            .fs_type
            .clone()
            .unwrap_or_else(|| self.ctx.config.default_mount_fs.clone());

        // The staging filesystem is created at most once; both the
        // recorded fs-type and whatever is actually on the device must
        // agree with the request.
        let formatted = match volume.fs_type() {
            Some(existing) => Some(existing.to_owned()),
            None => mount::existing_filesystem(&private).await?,
        };
        match formatted {
            Some(existing) if existing != fs_type => {
                return Err(Status::already_exists(format!(
                    "Cannot stage filesystem {} on device that already has filesystem {}",
                    fs_type, existing
                )));
            }
            Some(_) => {}
            None => {
                mount::mkfs(&fs_type, &private, mkfs_args(&fs_type)).await?;
            }
        }

        mount::mount(
            &fs_type,
            capability.mount_flags.as_deref().unwrap_or_default(),
            &private,
            &staged.to_string_lossy(),
        )
        .await?;

        if volume.fs_type() != Some(fs_type.as_str()) {
            volume
                .metadata
                .insert(FS_TYPE_KEY.to_owned(), fs_type);
            self.ctx.persistence.set_volume(volume, false).await?;
        }
        Ok(())
    }

    async fn do_stage(
        &self,
        request: &NodeStageVolumeRequest,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let volume_id = required_str(&request.volume_id, "volume_id")?;
        let staging_target = required_str(&request.staging_target_path, "staging_target_path")?;
        let capability = required_field(&request.volume_capability, "volume_capability")?;

        let _slot = self.ctx.serializer.lock("NodeStageVolume", volume_id).await?;

        let mut volume = self.ctx.require_volume(volume_id).await?;
        let requested = Capability::from_grpc(
            capability,
            false,
            &self.ctx.config.default_mount_fs,
        )?;
        self.ctx
            .validate_capabilities(&Capabilities(vec![requested.clone()]))?;

        Self::check_path(staging_target, "staging_target_path", false)?;
        let staged = Self::staged_path(staging_target);
        if requested.is_block {
            if !staged.exists() {
                tokio::fs::File::create(&staged)
                    .await
                    .map_err(|e| Status::unknown(format!("cannot create staged node: {}", e)))?;
            }
        } else {
            tokio::fs::create_dir_all(&staged)
                .await
                .map_err(|e| Status::unknown(format!("cannot create staged node: {}", e)))?;
        }

        let mut connection = self
            .staging_connection(volume_id)
            .await?
            .ok_or_else(|| {
                Status::failed_precondition("Volume is not published to this node")
            })?;
        if let Some(blob) = connection.capability_blob() {
            if let Ok(published) = Capability::from_json(blob) {
                if !published.supports(&requested) {
                    return Err(Status::already_exists(
                        "Volume was published to this node with an incompatible capability",
                    ));
                }
            }
        }

        let (device, private_bind) = self.vol_device(volume_id).await?;
        if device.is_none() {
            self.attach_volume(&connection, &private_bind).await?;
        }

        if requested.is_block {
            let mountinfo = mount::read_mountinfo().await?;
            if mount::device_for_path(&mountinfo, &staged.to_string_lossy()).is_none() {
                mount::bind_mount(
                    &private_bind.to_string_lossy(),
                    &staged.to_string_lossy(),
                    false,
                )
                .await?;
            }
        } else {
            self.stage_mount(&mut volume, &requested, &private_bind, &staged)
                .await?;
        }

        let staged_str = staged.to_string_lossy().into_owned();
        if connection.mountpoint != staged_str {
            connection.mountpoint = staged_str;
            self.ctx
                .persistence
                .set_connection(&mut connection, false)
                .await?;
        }

        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    async fn do_unstage(
        &self,
        request: &NodeUnstageVolumeRequest,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let volume_id = required_str(&request.volume_id, "volume_id")?;
        let staging_target = required_str(&request.staging_target_path, "staging_target_path")?;

        let _slot = self
            .ctx
            .serializer
            .lock("NodeUnstageVolume", volume_id)
            .await?;

        self.ctx.require_volume(volume_id).await?;

        let (device, private_bind) = self.vol_device(volume_id).await?;
        if let Some(device) = device {
            let private = private_bind.to_string_lossy().into_owned();
            let mountinfo = mount::read_mountinfo().await?;
            let mounts = mount::read_mounts().await?;
            let count = mount::count_volume_mounts(&mountinfo, &mounts, &device, &private);

            // Two mounts is the idle staged state: the private bind and
            // the staging mount. Anything above that is a consumer still
            // publishing the volume.
            if count > 2 {
                return Err(Status::aborted("Operation pending for volume"));
            }

            let connection = self.staging_connection(volume_id).await?;
            if count == 2 {
                let staged = connection
                    .as_ref()
                    .filter(|c| !c.mountpoint.is_empty())
                    .map(|c| PathBuf::from(&c.mountpoint))
                    .unwrap_or_else(|| Self::staged_path(staging_target));
                mount::unmount(&staged.to_string_lossy(), 4).await?;
                remove_staged_node(&staged).await;
            }
            if count > 0 {
                mount::unmount(&private, 4).await?;
            }
            if private_bind.exists() {
                tokio::fs::remove_file(&private_bind)
                    .await
                    .map_err(|e| Status::unknown(format!("cannot remove private bind: {}", e)))?;
            }

            if let Some(mut connection) = connection {
                self.connector
                    .detach(&connection)
                    .await
                    .map_err(|e| Status::unknown(e.to_string()))?;
                if !connection.mountpoint.is_empty() {
                    connection.mountpoint = String::new();
                    self.ctx
                        .persistence
                        .set_connection(&mut connection, false)
                        .await?;
                }
            }
        }

        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    async fn do_publish(
        &self,
        request: &NodePublishVolumeRequest,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let volume_id = required_str(&request.volume_id, "volume_id")?;
        let staging_target = required_str(&request.staging_target_path, "staging_target_path")?;
        let target = required_str(&request.target_path, "target_path")?;
        let capability = required_field(&request.volume_capability, "volume_capability")?;

        let _slot = self
            .ctx
            .serializer
            .lock("NodePublishVolume", volume_id)
            .await?;

        self.ctx.require_volume(volume_id).await?;
        let requested = Capability::from_grpc(
            capability,
            request.readonly,
            &self.ctx.config.default_mount_fs,
        )?;

        // Staging must have completed: device anchored and, for mounts,
        // the staged path mounted from the private bind.
        let (device, private_bind) = self.vol_device(volume_id).await?;
        let staged = Self::staged_path(staging_target);
        let staged_ok = match device {
            None => false,
            Some(_) if requested.is_block => {
                let mountinfo = mount::read_mountinfo().await?;
                mount::device_for_path(&mountinfo, &staged.to_string_lossy()).is_some()
            }
            Some(_) => {
                let mounts = mount::read_mounts().await?;
                !mount::mounts_for_source(&mounts, &private_bind.to_string_lossy()).is_empty()
            }
        };
        if !staged_ok {
            return Err(Status::failed_precondition(
                "Staging was not successfully called",
            ));
        }

        Self::check_path(target, "target_path", requested.is_block)?;

        let pod_uid = request.volume_context.get(POD_UID_KEY).cloned();

        let connections = self.ctx.connections_for_volume(volume_id).await?;
        let existing = connections.iter().find(|c| c.mountpoint == target);
        let staging_connection = connections
            .iter()
            .find(|c| c.attached_host == self.node_id() && c.instance_uuid.is_none());

        match existing {
            Some(existing) => {
                let published = existing
                    .capability_blob()
                    .and_then(|blob| Capability::from_json(blob).ok());
                if published.as_ref() != Some(&requested) {
                    return Err(Status::already_exists(INCOMPATIBLE_CAP_PATH));
                }
                if existing.instance_uuid != pod_uid {
                    let mut updated = existing.clone();
                    updated.instance_uuid = pod_uid;
                    self.ctx
                        .persistence
                        .set_connection(&mut updated, false)
                        .await?;
                }
            }
            None => {
                let staging_connection = staging_connection.ok_or_else(|| {
                    Status::failed_precondition("Staging was not successfully called")
                })?;

                let exclude = [staging_connection.id.as_str()];
                requested.incompatible_connections(&connections, &exclude)?;

                let mut connector_info = staging_connection.connector_info.clone();
                if let Some(map) = connector_info.as_object_mut() {
                    map.insert(
                        crate::object::CAPABILITY_KEY.to_owned(),
                        serde_json::Value::String(requested.to_json()),
                    );
                }
                let mut duplicate = Connection::new(
                    volume_id,
                    self.node_id(),
                    connector_info,
                    staging_connection.connection_info.clone(),
                    staging_connection.attach_mode,
                );
                duplicate.mountpoint = target.to_owned();
                duplicate.instance_uuid = pod_uid;
                self.ctx
                    .persistence
                    .set_connection(&mut duplicate, true)
                    .await?;
            }
        }

        let mountinfo = mount::read_mountinfo().await?;
        if mount::device_for_path(&mountinfo, target).is_none() {
            mount::bind_mount(
                &staged.to_string_lossy(),
                target,
                requested.used_as_ro(),
            )
            .await?;
        }

        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn do_unpublish(
        &self,
        request: &NodeUnpublishVolumeRequest,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let volume_id = required_str(&request.volume_id, "volume_id")?;
        let target = required_str(&request.target_path, "target_path")?;

        let _slot = self
            .ctx
            .serializer
            .lock("NodeUnpublishVolume", volume_id)
            .await?;

        let mountinfo = mount::read_mountinfo().await?;
        if mount::device_for_path(&mountinfo, target).is_some() {
            // Flush through the private device before tearing the bind
            // down.
            let (_, private_bind) = self.vol_device(volume_id).await?;
            if let Err(err) = mount::sync_device(&private_bind.to_string_lossy()).await {
                warn!(%err, "sync before unpublish failed");
            }
            mount::unmount(target, 4).await?;
            remove_staged_node(Path::new(target)).await;
        }

        let connections = self.ctx.connections_for_volume(volume_id).await?;
        if let Some(connection) = connections.iter().find(|c| c.mountpoint == target) {
            self.ctx.persistence.delete_connection(&connection.id).await?;
        }

        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn do_expand(
        &self,
        request: &NodeExpandVolumeRequest,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        let volume_id = required_str(&request.volume_id, "volume_id")?;
        required_str(&request.volume_path, "volume_path")?;
        self.ctx.fail_if_disabled(Feature::Expand)?;

        let _slot = self
            .ctx
            .serializer
            .lock("NodeExpandVolume", volume_id)
            .await?;

        let volume = self.ctx.require_volume(volume_id).await?;

        if let Some(range) = &request.capacity_range {
            let (requested_gb, min_bytes, max_bytes) = calculate_size(Some(range))?;
            if volume.size_bytes() < min_bytes || volume.size_bytes() > max_bytes {
                return Err(Status::out_of_range(format!(
                    "New size requested ({}) doesn't match controller resized volume ({})",
                    requested_gb, volume.size_gb
                )));
            }
        }

        let (device, private_bind) = self.vol_device(volume_id).await?;
        if device.is_none() {
            return Err(Status::failed_precondition(
                "Volume is not mounted, cannot resize",
            ));
        }

        let connection = self
            .staging_connection(volume_id)
            .await?
            .ok_or_else(|| {
                Status::failed_precondition("Volume is not published to this node")
            })?;
        let current_size = self
            .connector
            .extend(&connection)
            .await
            .map_err(|e| Status::unknown(e.to_string()))?;

        self.resize_filesystem(&volume, &private_bind).await?;

        Ok(Response::new(NodeExpandVolumeResponse {
            capacity_bytes: current_size,
        }))
    }

    /// Grows the staged filesystem after the device itself grew. Resizing
    /// happens mounted, so the ext tools target the private bind and the
    /// others the staged mount point.
    async fn resize_filesystem(&self, volume: &Volume, private_bind: &Path) -> Result<(), Status> {
        let fs_type = match volume.fs_type() {
            Some(fs_type) => fs_type.to_owned(),
            None => return Ok(()),
        };

        let private = private_bind.to_string_lossy().into_owned();
        let mounts = mount::read_mounts().await?;
        let mounted = mount::mounts_for_source(&mounts, &private);
        let mut target = mounted
            .first()
            .map(|m| PathBuf::from(&m.target))
            .ok_or_else(|| {
                Status::failed_precondition("Volume is not mounted, cannot resize")
            })?;
        if target.file_name().map(|n| n != STAGED_NAME).unwrap_or(true) {
            warn!(target = %target.display(), "staged mount without the stage leaf");
            target = target.join(STAGED_NAME);
        }
        let target = target.to_string_lossy().into_owned();

        if EXT_FILESYSTEMS.contains(&fs_type.as_str()) {
            mount::sudo(
                "resize2fs",
                &["-f", "-F", &private],
                1,
                std::time::Duration::from_secs(1),
                &[],
            )
            .await?;
        } else if fs_type == "btrfs" {
            mount::sudo(
                "btrfs",
                &["filesystem", "resize", "max", &target],
                1,
                std::time::Duration::from_secs(1),
                &[],
            )
            .await?;
        } else if fs_type == "xfs" {
            mount::sudo(
                "xfs_growfs",
                &["-d", &target],
                1,
                std::time::Duration::from_secs(1),
                &[],
            )
            .await?;
        } else {
            return Err(Status::failed_precondition(format!(
                "Don't know how to extend {} filesystem",
                fs_type
            )));
        }
        Ok(())
    }

    async fn do_get_stats(
        &self,
        request: &NodeGetVolumeStatsRequest,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        let volume_id = required_str(&request.volume_id, "volume_id")?;
        let volume_path = required_str(&request.volume_path, "volume_path")?;

        let _slot = self
            .ctx
            .serializer
            .lock("NodeGetVolumeStats", volume_id)
            .await?;

        if !Path::new(volume_path).exists() {
            return Err(Status::not_found(format!(
                "Cannot access path {}",
                volume_path
            )));
        }

        // The path can be a publish path or the staging directory; in the
        // latter case the actual mount is one level down at the staged
        // leaf.
        let mountinfo = mount::read_mountinfo().await?;
        let mut path = volume_path.to_owned();
        let mut device_for_path = mount::device_for_path(&mountinfo, &path);
        if device_for_path.is_none() {
            path = Self::staged_path(volume_path).to_string_lossy().into_owned();
            device_for_path = mount::device_for_path(&mountinfo, &path);
        }
        let device_for_path = device_for_path
            .map(|d| d.to_owned())
            .ok_or_else(|| {
                Status::not_found(format!("Could not find the device in path {}", volume_path))
            })?;

        let (device_for_vol, private_bind) = self.vol_device(volume_id).await?;
        let device_for_vol = device_for_vol.unwrap_or_default();

        let usage = if device_for_path == device_for_vol {
            // Block staging binds straight to the real device.
            let total = mount::block_device_size(&device_for_vol).await?;
            VolumeUsage {
                available: 0,
                total,
                used: 0,
                unit: Unit::Bytes as i32,
            }
        } else if device_for_path == private_bind.to_string_lossy() {
            let (total, used, available) = mount::fs_usage(Path::new(&path))?;
            VolumeUsage {
                available,
                total,
                used,
                unit: Unit::Bytes as i32,
            }
        } else {
            return Err(Status::invalid_argument(
                "Path does not match with requested volume",
            ));
        };

        Ok(Response::new(NodeGetVolumeStatsResponse {
            usage: vec![usage],
            volume_condition: None,
        }))
    }

    fn capability_list(&self) -> Vec<NodeServiceCapability> {
        let ember = &self.ctx.config.ember;
        let mut types = vec![RpcType::StageUnstageVolume, RpcType::GetVolumeStats];
        // A node can only ever resize mounted volumes, so disabling online
        // expansion removes the whole node capability.
        if self.ctx.config.spec_version.supports_expansion()
            && !ember.disabled(Feature::Expand)
            && !ember.disabled(Feature::ExpandOnline)
        {
            types.push(RpcType::ExpandVolume);
        }
        types
            .into_iter()
            .map(|t| NodeServiceCapability {
                r#type: Some(CapabilityType::Rpc(Rpc { r#type: t as i32 })),
            })
            .collect()
    }
}

async fn remove_staged_node(path: &Path) {
    let result = match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(_) => return,
    };
    if let Err(err) = result {
        warn!(path = %path.display(), %err, "could not remove staged node");
    }
}

#[async_trait::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let request = request.into_inner();
        rpc::log_request(&request);
        rpc::logged("NodeStageVolume", &request.volume_id, self.do_stage(&request)).await
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let request = request.into_inner();
        rpc::log_request(&request);
        rpc::logged(
            "NodeUnstageVolume",
            &request.volume_id,
            self.do_unstage(&request),
        )
        .await
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let request = request.into_inner();
        rpc::log_request(&request);
        rpc::logged(
            "NodePublishVolume",
            &request.volume_id,
            self.do_publish(&request),
        )
        .await
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let request = request.into_inner();
        rpc::log_request(&request);
        rpc::logged(
            "NodeUnpublishVolume",
            &request.volume_id,
            self.do_unpublish(&request),
        )
        .await
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        let request = request.into_inner();
        rpc::log_request(&request);
        rpc::logged(
            "NodeGetVolumeStats",
            &request.volume_id,
            self.do_get_stats(&request),
        )
        .await
    }

    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        let request = request.into_inner();
        rpc::log_request(&request);
        rpc::logged(
            "NodeExpandVolume",
            &request.volume_id,
            self.do_expand(&request),
        )
        .await
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        rpc::logged("NodeGetCapabilities", "", async {
            Ok(Response::new(NodeGetCapabilitiesResponse {
                capabilities: self.capability_list(),
            }))
        })
        .await
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        rpc::logged("NodeGetInfo", "", async {
            let accessible_topology = self
                .ctx
                .config
                .node_topology_segments()
                .map_err(|e| Status::internal(e.to_string()))?
                .map(|segments| Topology { segments });
            Ok(Response::new(NodeGetInfoResponse {
                node_id: self.node_id().to_owned(),
                max_volumes_per_node: 0,
                accessible_topology,
            }))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::AccessMode;
    use crate::config::{Config, EmberConfig, Endpoint, Mode as ServiceMode, SpecVersion};
    use crate::persistence::sql::SqlStore;

    async fn service_with(ember: EmberConfig) -> (tempfile::TempDir, NodeService) {
        let tmp = tempfile::tempdir().expect("should be able to create tempdir");
        let url = format!("sqlite://{}/node.db?mode=rwc", tmp.path().display());
        let store = SqlStore::connect(&url).await.expect("store should connect");

        let config = Config {
            endpoint: Endpoint::Unix(tmp.path().join("csi.sock")),
            mode: ServiceMode::Node,
            spec_version: SpecVersion::V1_1,
            persistence: serde_json::from_value(serde_json::json!({
                "storage": "db",
                "connection": url,
            }))
            .unwrap(),
            backend: None,
            ember: EmberConfig {
                state_path: tmp.path().join("state"),
                ..ember
            },
            node_id: Some("io.ember-csi.n1".to_owned()),
            storage_nw_ip: None,
            default_mount_fs: "ext4".to_owned(),
            topologies: None,
            node_topology: None,
            abort_duplicates: false,
            system_files: None,
            supported_fs_types: vec!["ext4".to_owned(), "xfs".to_owned()],
        };
        let state_path = config.ember.state_path.clone();
        let ctx = Arc::new(PluginContext::new(config, Arc::new(store), None).unwrap());
        let connector = crate::connector::from_config(
            &serde_json::json!({ "driver": "fake" }),
            &state_path,
        )
        .unwrap();
        (tmp, NodeService::new(ctx, connector))
    }

    async fn service() -> (tempfile::TempDir, NodeService) {
        service_with(EmberConfig::default()).await
    }

    fn mount_capability(fs_type: &str) -> Capability {
        Capability {
            is_block: false,
            access_mode: AccessMode::SingleNodeWriter,
            fs_type: Some(fs_type.to_owned()),
            mount_flags: Some(vec![]),
            ro_forced: false,
        }
    }

    #[tokio::test]
    async fn staging_a_different_filesystem_conflicts() {
        let (tmp, service) = service().await;
        let mut volume = Volume::new("v", 1, "fake");
        volume
            .metadata
            .insert(FS_TYPE_KEY.to_owned(), "ext4".to_owned());

        let err = service
            .stage_mount(
                &mut volume,
                &mount_capability("xfs"),
                &tmp.path().join("state/vols/v"),
                &tmp.path().join("staging/stage"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::AlreadyExists);
        assert!(err.message().contains(
            "Cannot stage filesystem xfs on device that already has filesystem ext4"
        ));
    }

    #[tokio::test]
    async fn path_checks_match_the_access_type() {
        let tmp = tempfile::tempdir().expect("should be able to create tempdir");
        let dir = tmp.path().join("dir");
        std::fs::create_dir(&dir).unwrap();
        let file = tmp.path().join("file");
        std::fs::write(&file, b"").unwrap();

        let dir = dir.to_string_lossy();
        let file = file.to_string_lossy();
        assert!(NodeService::check_path(&dir, "staging_target_path", false).is_ok());
        assert!(NodeService::check_path(&file, "staging_target_path", true).is_ok());

        let err = NodeService::check_path(&dir, "staging_target_path", true).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        let err = NodeService::check_path(&file, "target_path", false).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        let err =
            NodeService::check_path("/definitely/not/here", "target_path", false).unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[test]
    fn staged_path_appends_the_stage_leaf() {
        assert_eq!(
            NodeService::staged_path("/var/lib/kubelet/plugins/staging"),
            PathBuf::from("/var/lib/kubelet/plugins/staging/stage")
        );
    }

    #[tokio::test]
    async fn expand_capability_follows_feature_gates() {
        let (_tmp, service) = service().await;
        assert_eq!(service.capability_list().len(), 3);

        let (_tmp, limited) = service_with(EmberConfig {
            disabled: vec!["expand".to_owned()],
            ..Default::default()
        })
        .await;
        assert_eq!(limited.capability_list().len(), 2);

        let (_tmp, offline_only) = service_with(EmberConfig {
            disabled: vec!["expand_online".to_owned()],
            ..Default::default()
        })
        .await;
        assert_eq!(offline_only.capability_list().len(), 2);
    }

    #[tokio::test]
    async fn unstaged_volume_cannot_expand() {
        let (_tmp, service) = service().await;
        let mut volume = Volume::new("v", 1, "fake");
        service
            .ctx
            .persistence
            .set_volume(&mut volume, true)
            .await
            .unwrap();

        let err = service
            .do_expand(&NodeExpandVolumeRequest {
                volume_id: volume.id.clone(),
                volume_path: "/somewhere".to_owned(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
        assert!(err.message().contains("not mounted"));
    }
}
