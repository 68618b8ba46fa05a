//! End-to-end tests driving the gRPC surface over a UNIX socket, with the
//! fake driver and a SQLite store. These cover the controller and identity
//! flows; node staging needs real mounts and is covered by unit tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tonic::transport::Channel;
use tonic::Code;

use k8s_csi::v1_3_0::controller_client::ControllerClient;
use k8s_csi::v1_3_0::identity_client::IdentityClient;
use k8s_csi::v1_3_0::volume_capability::access_mode::Mode;
use k8s_csi::v1_3_0::volume_capability::{AccessMode, AccessType, MountVolume};
use k8s_csi::v1_3_0::*;

use ember::config::{Config, EmberConfig, Endpoint, Mode as ServiceMode, SpecVersion};
use ember::connector::{ConnectorProperties, NodeInfo};
use ember::persistence;

const GIB: i64 = 1024 * 1024 * 1024;
const NODE_ID: &str = "io.ember-csi.n1";

struct TestPlugin {
    _tmp: tempfile::TempDir,
    controller: ControllerClient<Channel>,
    identity: IdentityClient<Channel>,
}

async fn start_plugin() -> TestPlugin {
    let tmp = tempfile::tempdir().expect("should be able to create tempdir");
    let socket_path = tmp.path().join("csi.sock");
    let db_url = format!("sqlite://{}/ember.db?mode=rwc", tmp.path().display());

    let config = Config {
        endpoint: Endpoint::Unix(socket_path.clone()),
        mode: ServiceMode::Controller,
        spec_version: SpecVersion::V1_1,
        persistence: serde_json::from_value(serde_json::json!({
            "storage": "db",
            "connection": db_url,
        }))
        .unwrap(),
        backend: Some(serde_json::json!({ "driver": "fake", "capacity_gb": 100.0 })),
        ember: EmberConfig::default(),
        node_id: None,
        storage_nw_ip: None,
        default_mount_fs: "ext4".to_owned(),
        topologies: None,
        node_topology: None,
        abort_duplicates: false,
        system_files: None,
        supported_fs_types: vec!["ext4".to_owned(), "xfs".to_owned()],
    };

    // Register a node the controller can publish to, like a node plugin
    // would at startup.
    let store = persistence::from_config(&config.persistence)
        .await
        .expect("store should connect");
    let properties = ConnectorProperties {
        initiator: Some("iqn.2004-10.com.example:n1".to_owned()),
        ip: Some("192.168.1.10".to_owned()),
        host: "n1".to_owned(),
        multipath: false,
        do_local_attach: false,
    };
    NodeInfo::set(store.as_ref(), NODE_ID, &properties)
        .await
        .expect("node registration should work");

    tokio::spawn(async move {
        ember::server::run(config).await.expect("server should run");
    });

    wait_for_socket(&socket_path).await;
    let channel = ember::grpc_sock::client::socket_channel(socket_path)
        .await
        .expect("should be able to connect");

    TestPlugin {
        _tmp: tmp,
        controller: ControllerClient::new(channel.clone()),
        identity: IdentityClient::new(channel),
    }
}

async fn wait_for_socket(path: &Path) {
    for _ in 0..50 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("server socket never appeared");
}

fn mount_capability(mode: Mode) -> VolumeCapability {
    VolumeCapability {
        access_type: Some(AccessType::Mount(MountVolume {
            fs_type: "ext4".to_owned(),
            mount_flags: vec![],
        })),
        access_mode: Some(AccessMode { mode: mode as i32 }),
    }
}

fn create_request(name: &str, required_bytes: i64, limit_bytes: i64) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: name.to_owned(),
        capacity_range: Some(CapacityRange {
            required_bytes,
            limit_bytes,
        }),
        volume_capabilities: vec![mount_capability(Mode::SingleNodeWriter)],
        parameters: BTreeMap::new(),
        secrets: BTreeMap::new(),
        volume_content_source: None,
        accessibility_requirements: None,
    }
}

#[tokio::test]
async fn probe_and_plugin_info() {
    let mut plugin = start_plugin().await;

    let probe = plugin.identity.probe(ProbeRequest {}).await.unwrap();
    assert_eq!(probe.get_ref().ready, Some(true));

    let info = plugin
        .identity
        .get_plugin_info(GetPluginInfoRequest {})
        .await
        .unwrap();
    let info = info.get_ref();
    assert_eq!(info.name, "io.ember-csi");
    assert_eq!(info.manifest["persistence"], "db");
    assert_eq!(info.manifest["mode"], "controller");
    assert_eq!(info.manifest["driver"], "FakeDriver");

    let caps = plugin
        .identity
        .get_plugin_capabilities(GetPluginCapabilitiesRequest {})
        .await
        .unwrap();
    // Controller service plus volume expansion on a 1.1 deployment.
    assert_eq!(caps.get_ref().capabilities.len(), 2);
}

#[tokio::test]
async fn create_volume_is_idempotent_by_name() {
    let mut plugin = start_plugin().await;

    let first = plugin
        .controller
        .create_volume(create_request("v1", GIB, 0))
        .await
        .unwrap();
    let first = first.get_ref().volume.clone().unwrap();
    assert_eq!(first.capacity_bytes, GIB);
    assert!(!first.volume_id.is_empty());

    let second = plugin
        .controller
        .create_volume(create_request("v1", GIB, 0))
        .await
        .unwrap();
    let second = second.get_ref().volume.clone().unwrap();
    assert_eq!(second.volume_id, first.volume_id);
}

#[tokio::test]
async fn create_volume_with_incompatible_size_conflicts() {
    let mut plugin = start_plugin().await;

    plugin
        .controller
        .create_volume(create_request("v1", GIB, 0))
        .await
        .unwrap();

    let err = plugin
        .controller
        .create_volume(create_request("v1", 5 * GIB, 0))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);
}

#[tokio::test]
async fn zero_capacity_range_is_out_of_range() {
    let mut plugin = start_plugin().await;

    let err = plugin
        .controller
        .create_volume(create_request("v1", 0, 0))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::OutOfRange);
    assert!(err.message().contains("min size is 1GB"));
}

#[tokio::test]
async fn delete_volume_is_absorbing() {
    let mut plugin = start_plugin().await;

    // Unknown ids are fine.
    plugin
        .controller
        .delete_volume(DeleteVolumeRequest {
            volume_id: "nonexistent".to_owned(),
            secrets: BTreeMap::new(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn publish_is_idempotent_and_capability_checked() {
    let mut plugin = start_plugin().await;

    let volume = plugin
        .controller
        .create_volume(create_request("v1", GIB, 0))
        .await
        .unwrap()
        .get_ref()
        .volume
        .clone()
        .unwrap();

    let publish = |capability, readonly| ControllerPublishVolumeRequest {
        volume_id: volume.volume_id.clone(),
        node_id: NODE_ID.to_owned(),
        volume_capability: Some(capability),
        readonly,
        secrets: BTreeMap::new(),
        volume_context: BTreeMap::new(),
    };

    let first = plugin
        .controller
        .controller_publish_volume(publish(mount_capability(Mode::SingleNodeWriter), false))
        .await
        .unwrap();
    assert!(first.get_ref().publish_context.contains_key("connection_info"));

    // Retrying with the same capability succeeds without a second
    // connection.
    plugin
        .controller
        .controller_publish_volume(publish(mount_capability(Mode::SingleNodeWriter), false))
        .await
        .unwrap();

    // A different capability on the same node is a conflict.
    let err = plugin
        .controller
        .controller_publish_volume(publish(mount_capability(Mode::SingleNodeReaderOnly), false))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);

    // The volume is now in use, so deleting it is a precondition failure.
    let err = plugin
        .controller
        .delete_volume(DeleteVolumeRequest {
            volume_id: volume.volume_id.clone(),
            secrets: BTreeMap::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);

    plugin
        .controller
        .controller_unpublish_volume(ControllerUnpublishVolumeRequest {
            volume_id: volume.volume_id.clone(),
            node_id: NODE_ID.to_owned(),
            secrets: BTreeMap::new(),
        })
        .await
        .unwrap();

    // Detached again, deletion works.
    plugin
        .controller
        .delete_volume(DeleteVolumeRequest {
            volume_id: volume.volume_id,
            secrets: BTreeMap::new(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn publish_to_unknown_node_is_not_found() {
    let mut plugin = start_plugin().await;

    let volume = plugin
        .controller
        .create_volume(create_request("v1", GIB, 0))
        .await
        .unwrap()
        .get_ref()
        .volume
        .clone()
        .unwrap();

    let err = plugin
        .controller
        .controller_publish_volume(ControllerPublishVolumeRequest {
            volume_id: volume.volume_id,
            node_id: "io.ember-csi.ghost".to_owned(),
            volume_capability: Some(mount_capability(Mode::SingleNodeWriter)),
            readonly: false,
            secrets: BTreeMap::new(),
            volume_context: BTreeMap::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn listing_pages_without_gaps_or_duplicates() {
    let mut plugin = start_plugin().await;

    for i in 1..=5 {
        plugin
            .controller
            .create_volume(create_request(&format!("v{}", i), GIB, 0))
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    let mut token = String::new();
    let mut pages = Vec::new();
    loop {
        let response = plugin
            .controller
            .list_volumes(ListVolumesRequest {
                max_entries: 2,
                starting_token: token.clone(),
            })
            .await
            .unwrap();
        let response = response.get_ref();
        pages.push(response.entries.len());
        for entry in &response.entries {
            seen.push(entry.volume.clone().unwrap().volume_id);
        }
        if response.next_token.is_empty() {
            break;
        }
        token = response.next_token.clone();
    }

    assert_eq!(pages, vec![2, 2, 1]);
    let full = plugin
        .controller
        .list_volumes(ListVolumesRequest {
            max_entries: 0,
            starting_token: String::new(),
        })
        .await
        .unwrap();
    let all: Vec<String> = full
        .get_ref()
        .entries
        .iter()
        .map(|e| e.volume.clone().unwrap().volume_id)
        .collect();
    assert_eq!(seen, all);
}

#[tokio::test]
async fn bad_paging_token_aborts() {
    let mut plugin = start_plugin().await;
    let err = plugin
        .controller
        .list_volumes(ListVolumesRequest {
            max_entries: 0,
            starting_token: "bogus".to_owned(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Aborted);
}

#[tokio::test]
async fn snapshot_lifecycle_with_soft_deleted_volume() {
    let mut plugin = start_plugin().await;

    let volume = plugin
        .controller
        .create_volume(create_request("v1", GIB, 0))
        .await
        .unwrap()
        .get_ref()
        .volume
        .clone()
        .unwrap();
    plugin
        .controller
        .create_volume(create_request("other", GIB, 0))
        .await
        .unwrap();

    let snapshot = plugin
        .controller
        .create_snapshot(CreateSnapshotRequest {
            source_volume_id: volume.volume_id.clone(),
            name: "snap1".to_owned(),
            secrets: BTreeMap::new(),
            parameters: BTreeMap::new(),
        })
        .await
        .unwrap()
        .get_ref()
        .snapshot
        .clone()
        .unwrap();
    assert!(snapshot.ready_to_use);
    assert_eq!(snapshot.source_volume_id, volume.volume_id);

    // Same snapshot name for a different volume collides.
    let other = plugin
        .controller
        .list_volumes(ListVolumesRequest::default())
        .await
        .unwrap()
        .get_ref()
        .entries
        .iter()
        .map(|e| e.volume.clone().unwrap())
        .find(|v| v.volume_id != volume.volume_id)
        .unwrap();
    let err = plugin
        .controller
        .create_snapshot(CreateSnapshotRequest {
            source_volume_id: other.volume_id,
            name: "snap1".to_owned(),
            secrets: BTreeMap::new(),
            parameters: BTreeMap::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);

    // Deleting the parent volume only soft-deletes it while the snapshot
    // exists: it stops being listed but the snapshot stays usable.
    plugin
        .controller
        .delete_volume(DeleteVolumeRequest {
            volume_id: volume.volume_id.clone(),
            secrets: BTreeMap::new(),
        })
        .await
        .unwrap();
    let listed = plugin
        .controller
        .list_volumes(ListVolumesRequest::default())
        .await
        .unwrap();
    assert!(listed
        .get_ref()
        .entries
        .iter()
        .all(|e| e.volume.as_ref().unwrap().volume_id != volume.volume_id));

    let snapshots = plugin
        .controller
        .list_snapshots(ListSnapshotsRequest {
            source_volume_id: volume.volume_id.clone(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(snapshots.get_ref().entries.len(), 1);

    // Removing the last snapshot cascades into the pending volume delete.
    plugin
        .controller
        .delete_snapshot(DeleteSnapshotRequest {
            snapshot_id: snapshot.snapshot_id,
            secrets: BTreeMap::new(),
        })
        .await
        .unwrap();
    let snapshots = plugin
        .controller
        .list_snapshots(ListSnapshotsRequest {
            source_volume_id: volume.volume_id,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(snapshots.get_ref().entries.is_empty());
}

#[tokio::test]
async fn create_volume_from_snapshot_source() {
    let mut plugin = start_plugin().await;

    let volume = plugin
        .controller
        .create_volume(create_request("v1", GIB, 0))
        .await
        .unwrap()
        .get_ref()
        .volume
        .clone()
        .unwrap();
    let snapshot = plugin
        .controller
        .create_snapshot(CreateSnapshotRequest {
            source_volume_id: volume.volume_id,
            name: "snap1".to_owned(),
            secrets: BTreeMap::new(),
            parameters: BTreeMap::new(),
        })
        .await
        .unwrap()
        .get_ref()
        .snapshot
        .clone()
        .unwrap();

    let mut request = create_request("restored", GIB, 0);
    request.volume_content_source = Some(VolumeContentSource {
        r#type: Some(volume_content_source::Type::Snapshot(
            volume_content_source::SnapshotSource {
                snapshot_id: snapshot.snapshot_id.clone(),
            },
        )),
    });
    let restored = plugin
        .controller
        .create_volume(request)
        .await
        .unwrap()
        .get_ref()
        .volume
        .clone()
        .unwrap();
    match restored.content_source.unwrap().r#type.unwrap() {
        volume_content_source::Type::Snapshot(source) => {
            assert_eq!(source.snapshot_id, snapshot.snapshot_id)
        }
        other => panic!("unexpected content source {:?}", other),
    }
}

#[tokio::test]
async fn expand_volume_reports_capacity_and_node_work() {
    let mut plugin = start_plugin().await;

    let volume = plugin
        .controller
        .create_volume(create_request("v1", GIB, 0))
        .await
        .unwrap()
        .get_ref()
        .volume
        .clone()
        .unwrap();

    let expanded = plugin
        .controller
        .controller_expand_volume(ControllerExpandVolumeRequest {
            volume_id: volume.volume_id.clone(),
            capacity_range: Some(CapacityRange {
                required_bytes: 2 * GIB,
                limit_bytes: 0,
            }),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(expanded.get_ref().capacity_bytes, 2 * GIB);
    // Detached and never formatted, so no node expansion is needed.
    assert!(!expanded.get_ref().node_expansion_required);

    // Shrinking is rejected.
    let err = plugin
        .controller
        .controller_expand_volume(ControllerExpandVolumeRequest {
            volume_id: volume.volume_id,
            capacity_range: Some(CapacityRange {
                required_bytes: GIB,
                limit_bytes: GIB,
            }),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::OutOfRange);
}

#[tokio::test]
async fn get_capacity_uses_backend_stats() {
    let mut plugin = start_plugin().await;

    let capacity = plugin
        .controller
        .get_capacity(GetCapacityRequest::default())
        .await
        .unwrap();
    assert_eq!(capacity.get_ref().available_capacity, 100 * GIB);

    plugin
        .controller
        .create_volume(create_request("v1", 10 * GIB, 0))
        .await
        .unwrap();
    let capacity = plugin
        .controller
        .get_capacity(GetCapacityRequest::default())
        .await
        .unwrap();
    assert_eq!(capacity.get_ref().available_capacity, 90 * GIB);
}

#[tokio::test]
async fn missing_required_fields_are_invalid() {
    let mut plugin = start_plugin().await;

    let err = plugin
        .controller
        .create_volume(CreateVolumeRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.message().contains("name"));

    let err = plugin
        .controller
        .delete_volume(DeleteVolumeRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}
