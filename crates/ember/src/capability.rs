//! The capability value model: access modes, block/mount kinds, and the
//! compatibility rules between a requested capability and what a volume or
//! its existing connections allow.
//!
//! Assumptions baked into these checks, mirroring how Kubernetes drives the
//! plugin:
//!
//! - ControllerPublishVolume is called once per node and volume, with the
//!   widest permissions that will be needed on that node.
//! - NodeStageVolume runs once per volume on a node, NodePublishVolume may
//!   run several times for different target paths.

use serde::{Deserialize, Serialize};
use tonic::Status;

use k8s_csi::v1_3_0::volume_capability::access_mode::Mode;
use k8s_csi::v1_3_0::volume_capability::AccessType;
use k8s_csi::v1_3_0::VolumeCapability;

use crate::object::Connection;

pub const INCOMPATIBLE_SINGLE: &str =
    "Single access mode not compatible with already existing published modes";
pub const INCOMPATIBLE_REQUESTED_CAPABILITY: &str =
    "Volume was not created with a compatible capability to the requested one";
pub const INCOMPATIBLE_MULTI_CAP: &str =
    "Volume already published with incompatible multi access mode";
pub const MULTIPLE_RW: &str = "Volume published as RWXO and there's already a writer";
pub const INCOMPATIBLE_CAP_PATH: &str =
    "Volume already published in that path with different capabilities";
pub const ALREADY_PUBLISHED_CAP: &str =
    "Volume already published on that node with different capabilities";

/// CSI access modes we understand. Stored in capability blobs as the wire
/// enum value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

impl AccessMode {
    pub fn is_single(&self) -> bool {
        matches!(
            self,
            AccessMode::SingleNodeWriter | AccessMode::SingleNodeReaderOnly
        )
    }

    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            AccessMode::SingleNodeReaderOnly | AccessMode::MultiNodeReaderOnly
        )
    }
}

impl From<AccessMode> for i32 {
    fn from(mode: AccessMode) -> i32 {
        match mode {
            AccessMode::SingleNodeWriter => Mode::SingleNodeWriter as i32,
            AccessMode::SingleNodeReaderOnly => Mode::SingleNodeReaderOnly as i32,
            AccessMode::MultiNodeReaderOnly => Mode::MultiNodeReaderOnly as i32,
            AccessMode::MultiNodeSingleWriter => Mode::MultiNodeSingleWriter as i32,
            AccessMode::MultiNodeMultiWriter => Mode::MultiNodeMultiWriter as i32,
        }
    }
}

impl TryFrom<i32> for AccessMode {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match Mode::from_i32(value) {
            Some(Mode::SingleNodeWriter) => Ok(AccessMode::SingleNodeWriter),
            Some(Mode::SingleNodeReaderOnly) => Ok(AccessMode::SingleNodeReaderOnly),
            Some(Mode::MultiNodeReaderOnly) => Ok(AccessMode::MultiNodeReaderOnly),
            Some(Mode::MultiNodeSingleWriter) => Ok(AccessMode::MultiNodeSingleWriter),
            Some(Mode::MultiNodeMultiWriter) => Ok(AccessMode::MultiNodeMultiWriter),
            _ => Err(format!("unknown access mode {}", value)),
        }
    }
}

/// One requested or recorded volume capability.
///
/// Equality is over every field, including `ro_forced`, so a publish
/// retried with a different readonly flag is a different capability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub is_block: bool,
    pub access_mode: AccessMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_flags: Option<Vec<String>>,
    #[serde(default)]
    pub ro_forced: bool,
}

impl Capability {
    /// Builds a capability from the wire message. Mount capabilities with
    /// no filesystem get the configured default so equality checks compare
    /// what will actually be used.
    pub fn from_grpc(
        capability: &VolumeCapability,
        ro_forced: bool,
        default_fs: &str,
    ) -> Result<Self, Status> {
        let mode = capability
            .access_mode
            .as_ref()
            .map(|m| m.mode)
            .unwrap_or_default();
        let access_mode = AccessMode::try_from(mode)
            .map_err(|_| Status::invalid_argument("Unsupported access mode"))?;

        match capability.access_type.as_ref() {
            Some(AccessType::Block(_)) => Ok(Capability {
                is_block: true,
                access_mode,
                fs_type: None,
                mount_flags: None,
                ro_forced,
            }),
            Some(AccessType::Mount(mount)) => {
                let fs_type = if mount.fs_type.is_empty() {
                    default_fs.to_owned()
                } else {
                    mount.fs_type.clone()
                };
                Ok(Capability {
                    is_block: false,
                    access_mode,
                    fs_type: Some(fs_type),
                    mount_flags: Some(mount.mount_flags.clone()),
                    ro_forced,
                })
            }
            None => Err(Status::invalid_argument(
                "Missing access type in volume capability",
            )),
        }
    }

    pub fn from_json(blob: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(blob)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("capability serialization cannot fail")
    }

    pub fn multi_mode(&self) -> bool {
        !self.access_mode.is_single()
    }

    /// Whether the volume will actually be used read-only, either because
    /// the mode is a reader mode or because the publish forced it.
    pub fn used_as_ro(&self) -> bool {
        self.ro_forced || self.access_mode.is_read_only()
    }

    /// Whether a volume carrying `self` can serve a request for `other`:
    /// identical, or the same block/mount kind with `self` no more
    /// restrictive in read-only or multi-node terms, and for mounts the
    /// same filesystem and flags.
    pub fn supports(&self, other: &Capability) -> bool {
        if self == other {
            return true;
        }

        if self.is_block != other.is_block
            || (!other.used_as_ro() && self.used_as_ro())
            || (other.multi_mode() && !self.multi_mode())
        {
            return false;
        }

        self.is_block
            || (self.fs_type == other.fs_type && self.mount_flags == other.mount_flags)
    }

    /// Checks this capability against the volume's other connections,
    /// ignoring ids in `exclude`. An error means the publish must not
    /// proceed.
    pub fn incompatible_connections(
        &self,
        all_conns: &[Connection],
        exclude: &[&str],
    ) -> Result<(), Status> {
        let others: Vec<&Connection> = all_conns
            .iter()
            .filter(|c| !exclude.contains(&c.id.as_str()))
            .collect();
        if others.is_empty() {
            return Ok(());
        }

        if !self.multi_mode() {
            return Err(Status::failed_precondition(INCOMPATIBLE_SINGLE));
        }

        let check_rw =
            self.access_mode == AccessMode::MultiNodeSingleWriter && !self.used_as_ro();

        for conn in others {
            let cap = match conn.capability_blob().map(Capability::from_json) {
                Some(Ok(cap)) => cap,
                // A connection without a readable capability was made by an
                // incompatible publish path.
                _ => return Err(Status::failed_precondition(INCOMPATIBLE_MULTI_CAP)),
            };

            if cap.access_mode != self.access_mode {
                return Err(Status::failed_precondition(INCOMPATIBLE_MULTI_CAP));
            }

            if check_rw && !cap.used_as_ro() {
                return Err(Status::failed_precondition(MULTIPLE_RW));
            }
        }

        Ok(())
    }
}

/// The capabilities a volume was created with.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(pub Vec<Capability>);

impl Capabilities {
    pub fn from_grpc(
        capabilities: &[VolumeCapability],
        default_fs: &str,
    ) -> Result<Self, Status> {
        let caps = capabilities
            .iter()
            .map(|c| Capability::from_grpc(c, false, default_fs))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Capabilities(caps))
    }

    pub fn from_json(blob: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(blob)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("capability serialization cannot fail")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Capability> {
        self.0.iter()
    }

    pub fn supports(&self, capability: &Capability) -> bool {
        self.0.iter().any(|cap| cap.supports(capability))
    }
}

/// What this deployment of the plugin can serve: whether block and mount
/// multi-node access are available, and which filesystems the host can
/// format.
#[derive(Clone, Debug)]
pub struct ServiceCapabilities {
    pub can_block_rwx: bool,
    pub can_mount_rwx: bool,
    pub supported_fs_types: Vec<String>,
}

impl ServiceCapabilities {
    /// Returns the reason a capability set cannot be served, or `None` when
    /// every capability is acceptable.
    pub fn unsupported(&self, capabilities: &Capabilities) -> Option<&'static str> {
        for capability in capabilities.iter() {
            // Block and mount RWX support are independent.
            let rwx = if capability.is_block {
                self.can_block_rwx
            } else {
                self.can_mount_rwx
            };
            if capability.multi_mode() && !rwx {
                return Some("Unsupported access mode");
            }

            if !capability.is_block {
                if let Some(fs_type) = &capability.fs_type {
                    if !self.supported_fs_types.iter().any(|f| f == fs_type) {
                        return Some("Unsupported file system type");
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::AttachMode;

    fn mount_cap(mode: AccessMode, fs: &str, ro_forced: bool) -> Capability {
        Capability {
            is_block: false,
            access_mode: mode,
            fs_type: Some(fs.to_owned()),
            mount_flags: Some(vec![]),
            ro_forced,
        }
    }

    fn block_cap(mode: AccessMode, ro_forced: bool) -> Capability {
        Capability {
            is_block: true,
            access_mode: mode,
            fs_type: None,
            mount_flags: None,
            ro_forced,
        }
    }

    fn conn_with_cap(cap: &Capability) -> Connection {
        Connection::new(
            "vol-1",
            "node-1",
            serde_json::json!({ "capability": cap.to_json() }),
            serde_json::json!({}),
            AttachMode::ReadWrite,
        )
    }

    #[test]
    fn identical_capability_is_supported() {
        let cap = mount_cap(AccessMode::SingleNodeWriter, "ext4", false);
        assert!(cap.supports(&cap.clone()));
    }

    #[test]
    fn block_does_not_support_mount() {
        let block = block_cap(AccessMode::SingleNodeWriter, false);
        let mount = mount_cap(AccessMode::SingleNodeWriter, "ext4", false);
        assert!(!block.supports(&mount));
        assert!(!mount.supports(&block));
    }

    #[test]
    fn read_only_cannot_serve_writer() {
        let ro = mount_cap(AccessMode::SingleNodeReaderOnly, "ext4", false);
        let rw = mount_cap(AccessMode::SingleNodeWriter, "ext4", false);
        assert!(!ro.supports(&rw));
        // A writer capability can serve a reader request.
        assert!(rw.supports(&ro));
    }

    #[test]
    fn single_cannot_serve_multi() {
        let single = mount_cap(AccessMode::SingleNodeWriter, "ext4", false);
        let multi = mount_cap(AccessMode::MultiNodeMultiWriter, "ext4", false);
        assert!(!single.supports(&multi));
        assert!(multi.supports(&single));
    }

    #[test]
    fn mismatched_fs_type_is_unsupported() {
        let ext4 = mount_cap(AccessMode::SingleNodeWriter, "ext4", false);
        let xfs = mount_cap(AccessMode::SingleNodeWriter, "xfs", false);
        assert!(!ext4.supports(&xfs));
    }

    #[test]
    fn single_mode_conflicts_with_any_connection() {
        let existing = mount_cap(AccessMode::SingleNodeWriter, "ext4", false);
        let conns = vec![conn_with_cap(&existing)];
        let req = mount_cap(AccessMode::SingleNodeWriter, "ext4", false);
        let err = req.incompatible_connections(&conns, &[]).unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);
        assert_eq!(err.message(), INCOMPATIBLE_SINGLE);
    }

    #[test]
    fn excluded_connections_are_ignored() {
        let existing = mount_cap(AccessMode::SingleNodeWriter, "ext4", false);
        let conns = vec![conn_with_cap(&existing)];
        let req = mount_cap(AccessMode::SingleNodeWriter, "ext4", false);
        let id = conns[0].id.clone();
        assert!(req.incompatible_connections(&conns, &[id.as_str()]).is_ok());
    }

    #[test]
    fn differing_multi_modes_conflict() {
        let existing = mount_cap(AccessMode::MultiNodeReaderOnly, "ext4", false);
        let conns = vec![conn_with_cap(&existing)];
        let req = mount_cap(AccessMode::MultiNodeMultiWriter, "ext4", false);
        let err = req.incompatible_connections(&conns, &[]).unwrap_err();
        assert_eq!(err.message(), INCOMPATIBLE_MULTI_CAP);
    }

    #[test]
    fn second_writer_is_rejected_for_single_writer_mode() {
        let writer = mount_cap(AccessMode::MultiNodeSingleWriter, "ext4", false);
        let conns = vec![conn_with_cap(&writer)];
        let second = mount_cap(AccessMode::MultiNodeSingleWriter, "ext4", false);
        let err = second.incompatible_connections(&conns, &[]).unwrap_err();
        assert_eq!(err.message(), MULTIPLE_RW);

        // A reader alongside the writer is fine.
        let reader = mount_cap(AccessMode::MultiNodeSingleWriter, "ext4", true);
        assert!(reader.incompatible_connections(&conns, &[]).is_ok());
    }

    #[test]
    fn multi_mode_is_unsupported_without_rwx() {
        let service = ServiceCapabilities {
            can_block_rwx: false,
            can_mount_rwx: false,
            supported_fs_types: vec!["ext4".to_owned()],
        };
        let caps = Capabilities(vec![mount_cap(
            AccessMode::MultiNodeMultiWriter,
            "ext4",
            false,
        )]);
        assert_eq!(service.unsupported(&caps), Some("Unsupported access mode"));
    }

    #[test]
    fn unknown_fs_type_is_unsupported() {
        let service = ServiceCapabilities {
            can_block_rwx: true,
            can_mount_rwx: true,
            supported_fs_types: vec!["ext4".to_owned()],
        };
        let caps = Capabilities(vec![mount_cap(AccessMode::SingleNodeWriter, "zfs", false)]);
        assert_eq!(
            service.unsupported(&caps),
            Some("Unsupported file system type")
        );
    }

    #[test]
    fn capability_blob_round_trip() {
        let cap = mount_cap(AccessMode::MultiNodeSingleWriter, "xfs", true);
        let blob = cap.to_json();
        let back = Capability::from_json(&blob).unwrap();
        assert_eq!(cap, back);
        // The access mode is stored as the wire enum value.
        assert!(blob.contains("\"access_mode\":4"));
    }
}
