//! Hierarchical topology constraints for volume scheduling.
//!
//! The plugin is configured with an ordered list of segment maps. The order
//! of the keys across those maps defines a domain hierarchy (say rack
//! inside zone inside region), and a requested topology is accessible when
//! its segments form a prefix of one of the configured paths.

use std::collections::BTreeMap;

use serde_json::Value;
use tonic::Status;
use tracing::warn;

use k8s_csi::v1_3_0::{Topology, TopologyRequirement};

/// The configured topology hierarchy.
#[derive(Clone, Debug)]
pub struct TopologyTree {
    /// Domain keys in dominance order.
    levels: Vec<String>,
    /// Each configured topology as an ordered (domain, value) path.
    hierarchy: Vec<Vec<(String, String)>>,
}

impl TopologyTree {
    /// Builds the hierarchy from configured segment maps. Maps whose path is
    /// a prefix of another configured path are dropped in favor of the more
    /// specific one.
    pub fn new(topologies: &[serde_json::Map<String, Value>]) -> Result<Self, String> {
        if topologies.is_empty() {
            return Err("topology list cannot be empty".to_owned());
        }

        let mut levels: Vec<String> = Vec::new();
        let mut hierarchy: Vec<Vec<(String, String)>> = Vec::new();

        for topology in topologies {
            let mut path = Vec::with_capacity(topology.len());
            for (key, value) in topology {
                let value = value
                    .as_str()
                    .ok_or_else(|| format!("topology segment {} must be a string", key))?;
                path.push((key.to_lowercase(), value.to_owned()));
            }
            if path.is_empty() {
                return Err("topology entry cannot be empty".to_owned());
            }

            if path.len() >= levels.len() {
                for (key, _) in &path[levels.len()..] {
                    levels.push(key.clone());
                }
            }

            // When one configured path extends another, only the broader
            // one is kept.
            let mut replace = None;
            let mut skip = false;
            for (i, existing) in hierarchy.iter().enumerate() {
                if path.len() <= existing.len() && path[..] == existing[..path.len()] {
                    warn!(ignored = ?existing, kept = ?path, "dropping topology included in a broader one");
                    replace = Some(i);
                    break;
                } else if existing.len() <= path.len() && *existing == path[..existing.len()] {
                    warn!(ignored = ?path, kept = ?existing, "dropping topology included in a broader one");
                    skip = true;
                    break;
                }
            }

            match replace {
                Some(i) => hierarchy[i] = path,
                None if !skip => hierarchy.push(path),
                None => {}
            }
        }

        Ok(TopologyTree { levels, hierarchy })
    }

    /// Whether the given segments select a reachable point of the
    /// hierarchy. Segments naming a known domain that is not reachable in
    /// hierarchical order are an invalid request.
    pub fn accessible(&self, segments: &BTreeMap<String, String>) -> Result<bool, Status> {
        let mut path: Vec<(&str, &str)> = Vec::new();
        let mut unused: Vec<&str> = segments.keys().map(|k| k.as_str()).collect();

        for domain in &self.levels {
            match segments.get(domain) {
                Some(value) => {
                    path.push((domain.as_str(), value.as_str()));
                    unused.retain(|k| k != domain);
                }
                None => break,
            }
        }

        // Any known domain left over means a level above it was missing
        // from the request.
        if unused.iter().any(|k| self.levels.iter().any(|l| l == k)) {
            return Err(Status::invalid_argument(
                "Missing domain topology in request",
            ));
        }

        let accessible = self.hierarchy.iter().any(|configured| {
            configured.len() >= path.len()
                && configured[..path.len()]
                    .iter()
                    .zip(&path)
                    .all(|((ck, cv), (rk, rv))| ck == rk && cv == rv)
        });
        Ok(accessible)
    }

    /// Validates the requisite/preferred pair of a CreateVolume request.
    pub fn validate_requirements(&self, requirement: &TopologyRequirement) -> Result<(), Status> {
        let requisite = &requirement.requisite;
        let preferred = &requirement.preferred;
        if requisite.is_empty() && preferred.is_empty() {
            return Err(Status::invalid_argument(
                "Need topology requisite and/or preferred field",
            ));
        }

        if !requisite.is_empty() {
            for p in preferred {
                if !requisite.iter().any(|r| r.segments == p.segments) {
                    return Err(Status::invalid_argument(
                        "All preferred topologies must be in requisite topologies",
                    ));
                }
            }
        }

        let to_check = if requisite.is_empty() {
            preferred
        } else {
            requisite
        };
        for topology in to_check {
            if self.accessible(&topology.segments)? {
                return Ok(());
            }
        }
        Err(Status::invalid_argument(
            "None of the requested topologies are accessible",
        ))
    }

    /// The configured topologies as wire messages, for CreateVolume
    /// responses and the plugin capability report.
    pub fn grpc_topologies(&self) -> Vec<Topology> {
        self.hierarchy
            .iter()
            .map(|path| Topology {
                segments: path.iter().cloned().collect(),
            })
            .collect()
    }
}
