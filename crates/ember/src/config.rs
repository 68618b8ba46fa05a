//! Environment-driven configuration.
//!
//! Everything is read from the `CSI_*`/`X_CSI_*` variables the container
//! orchestrator sidecars set, with the JSON envelopes parsed and validated
//! up front. Validation failures carry distinct process exit codes so a
//! crash-looping pod points at the misconfigured knob.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use structopt::StructOpt;
use thiserror::Error;

use crate::persistence::PersistenceConfig;

pub const DEFAULT_PLUGIN_NAME: &str = "io.ember-csi";
const DEFAULT_PERSISTENCE: &str = r#"{"storage": "db", "connection": "sqlite://ember.db?mode=rwc"}"#;

/// Directory scanned for `mkfs.*` helpers to enumerate the filesystems the
/// host can format.
const MKFS_DIR: &str = "/sbin";
const MKFS_PREFIX: &str = "mkfs.";

lazy_static! {
    static ref PLUGIN_NAME_RE: Regex =
        Regex::new(r"^[A-Za-z]{2,6}(\.[A-Za-z0-9-]{1,63})+$").expect("static regex must compile");
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid mode value ({0})")]
    BadMode(String),
    #[error("Missing required backend configuration")]
    MissingBackend,
    #[error("Invalid system files archive: {0}")]
    BadSystemFiles(String),
    #[error("Unsupported CSI spec version {0}")]
    BadSpecVersion(String),
    #[error("Invalid topology configuration: {0}")]
    Topology(String),
    #[error("Invalid plugin name {0}")]
    BadPluginName(String),
    #[error("Invalid JSON data for {0}")]
    BadJson(&'static str),
    #[error("grpc_workers must be greater than zero")]
    BadWorkers,
    #[error("Invalid endpoint {0}")]
    BadEndpoint(String),
    #[error("Invalid default mount filesystem {0}")]
    BadDefaultFs(String),
}

impl ConfigError {
    /// Process exit code for the failure. Stable so deployment tooling can
    /// tell misconfigurations apart.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::BadMode(_) | ConfigError::BadDefaultFs(_) => 1,
            ConfigError::MissingBackend => 2,
            ConfigError::BadSystemFiles(_) => 3,
            ConfigError::BadSpecVersion(_) => 4,
            ConfigError::Topology(_) => 5,
            ConfigError::BadPluginName(_) => 6,
            ConfigError::BadJson(_) => 7,
            ConfigError::BadWorkers => 8,
            ConfigError::BadEndpoint(_) => 9,
        }
    }
}

/// Which CSI services this process serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Controller,
    Node,
    All,
}

impl Mode {
    pub fn serves_controller(&self) -> bool {
        matches!(self, Mode::Controller | Mode::All)
    }

    pub fn serves_node(&self) -> bool {
        matches!(self, Mode::Node | Mode::All)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Controller => "controller",
            Mode::Node => "node",
            Mode::All => "all",
        }
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "controller" => Ok(Mode::Controller),
            "node" => Ok(Mode::Node),
            "all" => Ok(Mode::All),
            other => Err(ConfigError::BadMode(other.to_owned())),
        }
    }
}

/// CSI spec versions we accept. The wire surface is the 1.x protobuf
/// package, which every 1.x orchestrator speaks; the pre-GA 0.x surfaces
/// are rejected at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecVersion {
    V1_0,
    V1_1,
}

impl SpecVersion {
    /// Volume expansion entered the spec in 1.1.0.
    pub fn supports_expansion(&self) -> bool {
        matches!(self, SpecVersion::V1_1)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SpecVersion::V1_0 => "1.0.0",
            SpecVersion::V1_1 => "1.1.0",
        }
    }
}

impl FromStr for SpecVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.0.0" => Ok(SpecVersion::V1_0),
            "1.1.0" => Ok(SpecVersion::V1_1),
            other => Err(ConfigError::BadSpecVersion(other.to_owned())),
        }
    }
}

/// Where the gRPC server listens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ConfigError::BadEndpoint(s.to_owned()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(ConfigError::BadEndpoint(s.to_owned()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        s.parse::<SocketAddr>()
            .map(Endpoint::Tcp)
            .map_err(|_| ConfigError::BadEndpoint(s.to_owned()))
    }
}

/// Features that can be switched off through the `disabled` list of the
/// ember config.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Feature {
    Snapshot,
    Clone,
    Expand,
    ExpandOnline,
}

impl Feature {
    fn key(&self) -> &'static str {
        match self {
            Feature::Snapshot => "snapshot",
            Feature::Clone => "clone",
            Feature::Expand => "expand",
            Feature::ExpandOnline => "expand_online",
        }
    }
}

/// The `X_CSI_EMBER_CONFIG` JSON envelope.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EmberConfig {
    pub plugin_name: String,
    pub grpc_workers: usize,
    pub request_multipath: bool,
    pub enable_probe: bool,
    pub state_path: PathBuf,
    pub file_locks_path: Option<PathBuf>,
    pub disabled: Vec<String>,
    /// Raises the default log level to debug. `RUST_LOG` still wins.
    pub debug: bool,
}

impl Default for EmberConfig {
    fn default() -> Self {
        EmberConfig {
            plugin_name: DEFAULT_PLUGIN_NAME.to_owned(),
            grpc_workers: 30,
            request_multipath: true,
            enable_probe: true,
            state_path: PathBuf::from("/var/lib/ember-csi"),
            file_locks_path: None,
            disabled: vec![],
            debug: false,
        }
    }
}

impl EmberConfig {
    pub fn disabled(&self, feature: Feature) -> bool {
        // Disabling expansion altogether also disables online expansion.
        if feature == Feature::ExpandOnline && self.disabled(Feature::Expand) {
            return true;
        }
        self.disabled.iter().any(|f| f == feature.key())
    }
}

// The recognized environment variables. structopt fills each flag from its
// environment variable when the flag itself is not passed.
#[derive(Debug, StructOpt)]
#[structopt(
    name = "ember-csi",
    about = "A CSI plugin exposing block-storage drivers to container orchestrators"
)]
pub struct Opts {
    #[structopt(
        long = "endpoint",
        env = "CSI_ENDPOINT",
        default_value = "[::]:50051",
        help = "Listening endpoint, host:port or unix:/path"
    )]
    endpoint: String,

    #[structopt(
        long = "mode",
        env = "CSI_MODE",
        default_value = "all",
        help = "Which services to serve: controller, node or all"
    )]
    mode: String,

    #[structopt(
        long = "spec-version",
        env = "X_CSI_SPEC_VERSION",
        default_value = "1.1.0",
        help = "CSI spec version to advertise"
    )]
    spec_version: String,

    #[structopt(
        long = "persistence-config",
        env = "X_CSI_PERSISTENCE_CONFIG",
        help = "JSON selecting the metadata store"
    )]
    persistence_config: Option<String>,

    #[structopt(
        long = "backend-config",
        env = "X_CSI_BACKEND_CONFIG",
        help = "JSON passed through to the storage driver"
    )]
    backend_config: Option<String>,

    #[structopt(
        long = "ember-config",
        env = "X_CSI_EMBER_CONFIG",
        help = "JSON with plugin-level settings"
    )]
    ember_config: Option<String>,

    #[structopt(long = "node-id", env = "X_CSI_NODE_ID", help = "This node's identifier")]
    node_id: Option<String>,

    #[structopt(
        long = "storage-nw-ip",
        env = "X_CSI_STORAGE_NW_IP",
        help = "IP to use on the storage network"
    )]
    storage_nw_ip: Option<String>,

    #[structopt(
        long = "default-mount-fs",
        env = "X_CSI_DEFAULT_MOUNT_FS",
        default_value = "ext4",
        help = "Filesystem used when a mount capability does not name one"
    )]
    default_mount_fs: String,

    #[structopt(
        long = "topologies",
        env = "X_CSI_TOPOLOGIES",
        help = "JSON list of topologies volumes can be provisioned in"
    )]
    topologies: Option<String>,

    #[structopt(
        long = "node-topology",
        env = "X_CSI_NODE_TOPOLOGY",
        help = "JSON object with this node's topology segments"
    )]
    node_topology: Option<String>,

    #[structopt(
        long = "abort-duplicates",
        env = "X_CSI_ABORT_DUPLICATES",
        help = "Set to true to reject concurrent duplicate requests instead of queueing"
    )]
    abort_duplicates: Option<String>,

    #[structopt(
        long = "system-files",
        env = "X_CSI_SYSTEM_FILES",
        help = "Tar archive extracted over / before startup"
    )]
    system_files: Option<String>,
}

/// Fully parsed and validated process configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub endpoint: Endpoint,
    pub mode: Mode,
    pub spec_version: SpecVersion,
    pub persistence: PersistenceConfig,
    pub backend: Option<serde_json::Value>,
    pub ember: EmberConfig,
    /// Fully qualified node id (`<plugin_name>.<node id>`).
    pub node_id: Option<String>,
    pub storage_nw_ip: Option<String>,
    pub default_mount_fs: String,
    pub topologies: Option<Vec<serde_json::Map<String, serde_json::Value>>>,
    pub node_topology: Option<serde_json::Map<String, serde_json::Value>>,
    pub abort_duplicates: bool,
    pub system_files: Option<PathBuf>,
    pub supported_fs_types: Vec<String>,
}

impl Config {
    /// Reads flags and environment and validates the result.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_opts(Opts::from_args())
    }

    fn from_opts(opts: Opts) -> Result<Self, ConfigError> {
        let mode: Mode = opts.mode.parse()?;
        let spec_version: SpecVersion = opts.spec_version.parse()?;
        let endpoint: Endpoint = opts.endpoint.parse()?;

        let persistence_json = opts
            .persistence_config
            .unwrap_or_else(|| DEFAULT_PERSISTENCE.to_owned());
        let persistence: PersistenceConfig = serde_json::from_str(&persistence_json)
            .map_err(|_| ConfigError::BadJson("X_CSI_PERSISTENCE_CONFIG"))?;

        let backend = opts
            .backend_config
            .map(|raw| {
                serde_json::from_str::<serde_json::Value>(&raw)
                    .map_err(|_| ConfigError::BadJson("X_CSI_BACKEND_CONFIG"))
            })
            .transpose()?;
        if mode != Mode::Node && backend.is_none() {
            return Err(ConfigError::MissingBackend);
        }

        let ember: EmberConfig = match opts.ember_config {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|_| ConfigError::BadJson("X_CSI_EMBER_CONFIG"))?,
            None => EmberConfig::default(),
        };
        if !PLUGIN_NAME_RE.is_match(&ember.plugin_name) {
            return Err(ConfigError::BadPluginName(ember.plugin_name.clone()));
        }
        if ember.grpc_workers == 0 {
            return Err(ConfigError::BadWorkers);
        }

        let topologies = opts
            .topologies
            .map(|raw| {
                serde_json::from_str::<Vec<serde_json::Map<String, serde_json::Value>>>(&raw)
                    .map_err(|e| ConfigError::Topology(e.to_string()))
            })
            .transpose()?;
        let node_topology = opts
            .node_topology
            .map(|raw| {
                serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&raw)
                    .map_err(|e| ConfigError::Topology(e.to_string()))
            })
            .transpose()?;
        if mode.serves_node() && node_topology.is_none() && topologies.is_some() {
            return Err(ConfigError::Topology(
                "node topology is required when topologies are configured".to_owned(),
            ));
        }

        let supported_fs_types = system_fs_types(Path::new(MKFS_DIR));
        if !supported_fs_types.iter().any(|f| f == &opts.default_mount_fs) {
            return Err(ConfigError::BadDefaultFs(opts.default_mount_fs));
        }

        let node_id = match mode.serves_node() {
            true => {
                let id = opts.node_id.unwrap_or_else(default_node_name);
                Some(format!("{}.{}", ember.plugin_name, id))
            }
            false => None,
        };

        let abort_duplicates = opts
            .abort_duplicates
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Config {
            endpoint,
            mode,
            spec_version,
            persistence,
            backend,
            ember,
            node_id,
            storage_nw_ip: opts.storage_nw_ip,
            default_mount_fs: opts.default_mount_fs,
            topologies,
            node_topology,
            abort_duplicates,
            system_files: opts.system_files.map(PathBuf::from),
            supported_fs_types,
        })
    }

    /// Typed node topology segments, validated as flat strings.
    pub fn node_topology_segments(
        &self,
    ) -> Result<Option<std::collections::BTreeMap<String, String>>, ConfigError> {
        match &self.node_topology {
            None => Ok(None),
            Some(map) => {
                let mut segments = std::collections::BTreeMap::new();
                for (key, value) in map {
                    let value = value.as_str().ok_or_else(|| {
                        ConfigError::Topology(format!("segment {} must be a string", key))
                    })?;
                    segments.insert(key.to_lowercase(), value.to_owned());
                }
                Ok(Some(segments))
            }
        }
    }
}

fn default_node_name() -> String {
    let mut buf = [0u8; 256];
    nix::unistd::gethostname(&mut buf)
        .ok()
        .and_then(|name| name.to_str().ok())
        .map(|s| s.to_owned())
        .unwrap_or_else(|| "localhost".to_owned())
}

/// Filesystems the host can format, from the mkfs helpers present.
fn system_fs_types(dir: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return vec![],
    };
    let mut types: Vec<String> = entries
        .filter_map(|entry| {
            let name = entry.ok()?.file_name();
            let name = name.to_string_lossy();
            name.strip_prefix(MKFS_PREFIX).map(|fs| fs.to_owned())
        })
        .collect();
    types.sort();
    types
}

/// Unpacks the `X_CSI_SYSTEM_FILES` archive over the root filesystem.
pub async fn extract_system_files(archive: &Path) -> Result<(), ConfigError> {
    if !archive.exists() {
        return Err(ConfigError::BadSystemFiles(format!(
            "{} does not exist",
            archive.display()
        )));
    }
    let output = tokio::process::Command::new("tar")
        .args(["-xf"])
        .arg(archive)
        .args(["-C", "/"])
        .output()
        .await
        .map_err(|e| ConfigError::BadSystemFiles(e.to_string()))?;
    if !output.status.success() {
        return Err(ConfigError::BadSystemFiles(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            "unix:/csi/csi.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/csi/csi.sock"))
        );
        assert_eq!(
            "unix:///csi/csi.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/csi/csi.sock"))
        );
        assert!(matches!(
            "127.0.0.1:50051".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp(_)
        ));
        assert!(matches!(
            "[::]:50051".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp(_)
        ));
        assert!("unix:".parse::<Endpoint>().is_err());
        assert!("not-an-endpoint".parse::<Endpoint>().is_err());
    }

    #[test]
    fn mode_parsing_is_case_insensitive() {
        assert_eq!("Controller".parse::<Mode>().unwrap(), Mode::Controller);
        assert_eq!("ALL".parse::<Mode>().unwrap(), Mode::All);
        let err = "sidecar".parse::<Mode>().unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn pre_ga_spec_versions_are_rejected() {
        assert!("1.0.0".parse::<SpecVersion>().is_ok());
        assert!("1.1.0".parse::<SpecVersion>().is_ok());
        let err = "0.2.0".parse::<SpecVersion>().unwrap_err();
        assert_eq!(err.exit_code(), 4);
        assert!("0.3.0".parse::<SpecVersion>().is_err());
        assert!("2.0.0".parse::<SpecVersion>().is_err());
    }

    #[test]
    fn ember_config_defaults() {
        let config: EmberConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.plugin_name, DEFAULT_PLUGIN_NAME);
        assert_eq!(config.grpc_workers, 30);
        assert!(config.request_multipath);
        assert!(config.enable_probe);
        assert!(config.disabled.is_empty());
    }

    #[test]
    fn disabling_expand_disables_online_expand() {
        let config: EmberConfig =
            serde_json::from_str(r#"{"disabled": ["expand"]}"#).unwrap();
        assert!(config.disabled(Feature::Expand));
        assert!(config.disabled(Feature::ExpandOnline));
        assert!(!config.disabled(Feature::Snapshot));

        let config: EmberConfig =
            serde_json::from_str(r#"{"disabled": ["expand_online"]}"#).unwrap();
        assert!(!config.disabled(Feature::Expand));
        assert!(config.disabled(Feature::ExpandOnline));
    }

    #[test]
    fn plugin_name_validation() {
        assert!(PLUGIN_NAME_RE.is_match("io.ember-csi"));
        assert!(PLUGIN_NAME_RE.is_match("com.example.csi-driver"));
        assert!(!PLUGIN_NAME_RE.is_match("ember"));
        assert!(!PLUGIN_NAME_RE.is_match("toolongprefix.name"));
    }

    #[test]
    fn fs_type_enumeration_from_mkfs_helpers() {
        let dir = tempfile::tempdir().expect("should be able to create tempdir");
        for helper in ["mkfs.ext4", "mkfs.xfs", "fsck.ext4"] {
            std::fs::write(dir.path().join(helper), b"").unwrap();
        }
        let types = system_fs_types(dir.path());
        assert_eq!(types, vec!["ext4".to_owned(), "xfs".to_owned()]);
    }
}
