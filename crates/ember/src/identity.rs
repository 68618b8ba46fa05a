//! CSI Identity service: plugin info, plugin capabilities and the probe
//! that exercises the persistence store and the backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use tonic::{Request, Response, Status};

use k8s_csi::v1_3_0::identity_server::Identity;
use k8s_csi::v1_3_0::plugin_capability::service::Type as ServiceType;
use k8s_csi::v1_3_0::plugin_capability::volume_expansion::Type as ExpansionType;
use k8s_csi::v1_3_0::plugin_capability::{Service, Type as PluginType, VolumeExpansion};
use k8s_csi::v1_3_0::{
    GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
};

use crate::config::Feature;
use crate::plugin::PluginContext;
use crate::rpc;

const VENDOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct IdentityService {
    ctx: Arc<PluginContext>,
}

impl IdentityService {
    pub fn new(ctx: Arc<PluginContext>) -> Self {
        IdentityService { ctx }
    }

    fn manifest(&self) -> BTreeMap<String, String> {
        let mut manifest = BTreeMap::new();
        manifest.insert(
            "persistence".to_owned(),
            self.ctx.config.persistence.kind().to_owned(),
        );
        manifest.insert("mode".to_owned(), self.ctx.config.mode.as_str().to_owned());
        manifest.insert(
            "csi-spec".to_owned(),
            self.ctx.config.spec_version.as_str().to_owned(),
        );
        if let Some(driver) = &self.ctx.driver {
            manifest.insert("driver".to_owned(), driver.driver_name().to_owned());
            manifest.insert(
                "driver-version".to_owned(),
                driver.driver_version().to_owned(),
            );
            manifest.insert(
                "driver-supported".to_owned(),
                driver.supported().to_string(),
            );
        }
        manifest
    }

    fn capabilities(&self) -> Vec<PluginCapability> {
        let mut capabilities = vec![PluginCapability {
            r#type: Some(PluginType::Service(Service {
                r#type: ServiceType::ControllerService as i32,
            })),
        }];

        let has_topology =
            self.ctx.topology.is_some() || self.ctx.config.node_topology.is_some();
        if has_topology {
            capabilities.push(PluginCapability {
                r#type: Some(PluginType::Service(Service {
                    r#type: ServiceType::VolumeAccessibilityConstraints as i32,
                })),
            });
        }

        let ember = &self.ctx.config.ember;
        if self.ctx.config.spec_version.supports_expansion() && !ember.disabled(Feature::Expand) {
            let expansion = if ember.disabled(Feature::ExpandOnline) {
                ExpansionType::Offline
            } else {
                ExpansionType::Online
            };
            capabilities.push(PluginCapability {
                r#type: Some(PluginType::VolumeExpansion(VolumeExpansion {
                    r#type: expansion as i32,
                })),
            });
        }

        capabilities
    }

    /// The probe key is per process role so controller and node probes on
    /// a shared store do not fight over the counter.
    fn probe_key(&self) -> String {
        match &self.ctx.config.node_id {
            Some(node_id) => format!("probe-{}", node_id),
            None => format!("probe-{}", self.ctx.config.ember.plugin_name),
        }
    }

    async fn run_probe(&self) -> Result<(), Status> {
        let key = self.probe_key();
        let counter = self
            .ctx
            .persistence
            .get_key_value(&key)
            .await
            .map_err(|_| Status::failed_precondition("Persistence is not accessible"))?
            .and_then(|kv| kv.value.parse::<u64>().ok())
            .unwrap_or(0);

        let mut kv = crate::object::KeyValue::new(&key, &(counter + 1).to_string());
        self.ctx
            .persistence
            .set_key_value(&mut kv)
            .await
            .map_err(|_| Status::failed_precondition("Persistence is not accessible"))?;

        let stored = self
            .ctx
            .persistence
            .get_key_value(&key)
            .await
            .map_err(|_| Status::failed_precondition("Persistence is not accessible"))?;
        if stored.map(|kv| kv.value) != Some((counter + 1).to_string()) {
            return Err(Status::failed_precondition(
                "Persistence is not accessible",
            ));
        }

        if let Some(driver) = &self.ctx.driver {
            driver
                .check_setup()
                .await
                .map_err(|e| Status::failed_precondition(e.to_string()))?;
            driver
                .stats(true)
                .await
                .map_err(|e| Status::failed_precondition(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        rpc::logged("GetPluginInfo", "", async {
            Ok(Response::new(GetPluginInfoResponse {
                name: self.ctx.config.ember.plugin_name.clone(),
                vendor_version: VENDOR_VERSION.to_owned(),
                manifest: self.manifest(),
            }))
        })
        .await
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        rpc::logged("GetPluginCapabilities", "", async {
            Ok(Response::new(GetPluginCapabilitiesResponse {
                capabilities: self.capabilities(),
            }))
        })
        .await
    }

    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        rpc::logged("Probe", "", async {
            if self.ctx.config.ember.enable_probe {
                self.run_probe().await?;
            }
            Ok(Response::new(ProbeResponse { ready: Some(true) }))
        })
        .await
    }
}
