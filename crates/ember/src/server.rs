//! Server assembly: builds the persistence store, driver and connector for
//! the configured mode, registers the CSI services side by side and serves
//! them over TCP or a UNIX socket.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tonic::transport::Server;
use tracing::info;

use k8s_csi::v1_3_0::controller_server::ControllerServer;
use k8s_csi::v1_3_0::identity_server::IdentityServer;
use k8s_csi::v1_3_0::node_server::NodeServer;

use crate::config::{Config, Endpoint};
use crate::connector::{ConnectorProperties, NodeInfo};
use crate::controller::ControllerService;
use crate::grpc_sock;
use crate::identity::IdentityService;
use crate::node::NodeService;
use crate::plugin::PluginContext;
use crate::{connector, driver, persistence};

/// Keepalive tuning. Driver calls (attach, mkfs, clone) routinely take
/// longer than gRPC's default ping-strike allowance, so the server is
/// deliberately liberal about keepalives.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(120);
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("could not bind to {endpoint}: {message}")]
    Bind { endpoint: String, message: String },
    #[error("backend driver error: {0}")]
    Driver(String),
    #[error("persistence store error: {0}")]
    Persistence(#[from] crate::errors::PersistenceError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ServerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::Bind { .. } => 9,
            ServerError::Driver(_) => 2,
            _ => 1,
        }
    }
}

/// Builds everything the configured mode needs and serves until the
/// process receives a termination signal.
pub async fn run(config: Config) -> Result<(), ServerError> {
    let persistence = persistence::from_config(&config.persistence).await?;

    let driver = match config.mode.serves_controller() {
        true => {
            let backend = config
                .backend
                .as_ref()
                .expect("controller modes always carry a backend config");
            Some(driver::from_config(backend).map_err(ServerError::Driver)?)
        }
        false => None,
    };

    let node_setup = match config.mode.serves_node() {
        true => {
            let node_id = config
                .node_id
                .clone()
                .expect("node modes always carry a node id");
            let properties = ConnectorProperties::gather(
                config.storage_nw_ip.as_deref(),
                config.ember.request_multipath,
            )
            .await;
            NodeInfo::set(persistence.as_ref(), &node_id, &properties).await?;

            tokio::fs::create_dir_all(config.ember.state_path.join("vols"))
                .await
                .map_err(|e| ServerError::Other(e.into()))?;

            let backend = config
                .backend
                .clone()
                .unwrap_or_else(|| serde_json::json!({ "driver": "fake" }));
            let volume_connector = connector::from_config(&backend, &config.ember.state_path)
                .map_err(ServerError::Driver)?;
            Some(volume_connector)
        }
        false => None,
    };

    let ctx = Arc::new(
        PluginContext::new(config, persistence, driver)
            .map_err(|e| ServerError::Other(anyhow::anyhow!(e)))?,
    );
    log_configuration(&ctx);

    let identity = IdentityService::new(ctx.clone());
    let controller = ctx
        .config
        .mode
        .serves_controller()
        .then(|| ControllerService::new(ctx.clone()));
    let node = node_setup.map(|volume_connector| NodeService::new(ctx.clone(), volume_connector));

    let router = Server::builder()
        .http2_keepalive_interval(Some(KEEPALIVE_INTERVAL))
        .http2_keepalive_timeout(Some(KEEPALIVE_TIMEOUT))
        .tcp_keepalive(Some(TCP_KEEPALIVE))
        .concurrency_limit_per_connection(ctx.config.ember.grpc_workers)
        .add_service(IdentityServer::new(identity))
        .add_optional_service(controller.map(ControllerServer::new))
        .add_optional_service(node.map(NodeServer::new));

    let endpoint = ctx.config.endpoint.clone();
    info!(endpoint = ?endpoint, "now serving");
    match endpoint {
        Endpoint::Tcp(addr) => router
            .serve_with_shutdown(addr, shutdown_signal())
            .await
            .map_err(|e| ServerError::Bind {
                endpoint: addr.to_string(),
                message: e.to_string(),
            })?,
        Endpoint::Unix(path) => {
            let socket = grpc_sock::server::Socket::new(&path).map_err(|e| ServerError::Bind {
                endpoint: path.display().to_string(),
                message: e.to_string(),
            })?;
            router
                .serve_with_incoming_shutdown(socket, shutdown_signal())
                .await
                .map_err(|e| ServerError::Bind {
                    endpoint: path.display().to_string(),
                    message: e.to_string(),
                })?
        }
    }

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("could not listen for the termination signal");
    }
}

fn log_configuration(ctx: &PluginContext) {
    let config = &ctx.config;
    info!(
        "Ember CSI v{} with {} workers (CSI spec: v{})",
        env!("CARGO_PKG_VERSION"),
        config.ember.grpc_workers,
        config.spec_version.as_str()
    );
    info!("Persistence module: {}", config.persistence.kind());
    match &ctx.driver {
        Some(driver) => info!(
            "Running as {} with backend {} v{}",
            config.mode.as_str(),
            driver.driver_name(),
            driver.driver_version()
        ),
        None => info!("Running as {}", config.mode.as_str()),
    }
    info!("Plugin name: {}", config.ember.plugin_name);
    info!(
        "Supported filesystems: {}",
        config.supported_fs_types.join(", ")
    );
}
