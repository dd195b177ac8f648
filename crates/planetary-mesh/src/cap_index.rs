use crate::types::{JobParams, NodeCapability, ResourceKind, ResourceMap};
use icn_core_types::Did;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Selector for filtering nodes by their advertised capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySelector {
    /// Runtime the node must support, e.g. "wasm"
    pub runtime: Option<String>,

    /// Features the node must advertise
    pub features: Vec<String>,

    /// Minimum available quantity per resource kind
    pub min_resources: ResourceMap,

    /// Acceptable regions; empty means any
    pub regions: Vec<String>,
}

/// First requirement a capability fails to meet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityMismatch {
    Runtime(String),
    Feature(String),
    Resource {
        kind: ResourceKind,
        needed: u64,
        available: u64,
    },
    Region(Option<String>),
}

impl std::fmt::Display for CapabilityMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityMismatch::Runtime(r) => write!(f, "runtime {} not supported", r),
            CapabilityMismatch::Feature(feat) => write!(f, "feature {} missing", feat),
            CapabilityMismatch::Resource { kind, needed, available } => {
                write!(f, "{} needed {}, available {}", kind, needed, available)
            }
            CapabilityMismatch::Region(region) => {
                write!(f, "region {} not allowed", region.as_deref().unwrap_or("<none>"))
            }
        }
    }
}

impl CapabilitySelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requirements implied by a job's parameters and policy.
    pub fn from_job(params: &JobParams) -> Self {
        Self {
            runtime: params.required_runtime.clone(),
            features: params.required_features.clone(),
            min_resources: params.policy.resource_requirements.clone(),
            regions: params.policy.allowed_regions.clone(),
        }
    }

    pub fn matches(&self, capability: &NodeCapability) -> bool {
        self.mismatch(capability).is_none()
    }

    /// Check every requirement, reporting the first one not met.
    pub fn mismatch(&self, capability: &NodeCapability) -> Option<CapabilityMismatch> {
        if let Some(runtime) = &self.runtime {
            if !capability.supported_runtimes.iter().any(|r| r == runtime) {
                return Some(CapabilityMismatch::Runtime(runtime.clone()));
            }
        }

        if let Some(missing) = self
            .features
            .iter()
            .find(|f| !capability.specialized_features.contains(f))
        {
            return Some(CapabilityMismatch::Feature(missing.clone()));
        }

        for (kind, needed) in &self.min_resources {
            let available = capability.available_resources.get(kind).copied().unwrap_or(0);
            if available < *needed {
                return Some(CapabilityMismatch::Resource {
                    kind: kind.clone(),
                    needed: *needed,
                    available,
                });
            }
        }

        if !self.regions.is_empty() {
            let in_region = capability
                .region
                .as_ref()
                .map_or(false, |r| self.regions.contains(r));
            if !in_region {
                return Some(CapabilityMismatch::Region(capability.region.clone()));
            }
        }

        None
    }
}

/// Latest capability advertisement per node
#[derive(Debug, Default)]
pub struct CapabilityIndex {
    entries: RwLock<HashMap<Did, NodeCapability>>,
}

impl CapabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an advertisement unless a newer or equally recent one is already
    /// known for the same node. Returns whether it was stored.
    pub async fn upsert(&self, capability: NodeCapability) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(&capability.node_did) {
            Some(existing) if existing.timestamp >= capability.timestamp => {
                debug!(
                    "Ignoring stale capability advertisement from {}",
                    capability.node_did
                );
                false
            }
            _ => {
                entries.insert(capability.node_did.clone(), capability);
                true
            }
        }
    }

    pub async fn get(&self, did: &Did) -> Option<NodeCapability> {
        self.entries.read().await.get(did).cloned()
    }

    pub async fn list(&self) -> Vec<NodeCapability> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn filter(&self, selector: &CapabilitySelector) -> Vec<NodeCapability> {
        self.entries
            .read()
            .await
            .values()
            .filter(|c| selector.matches(c))
            .cloned()
            .collect()
    }

    /// Snapshot keyed by DID, for selection.
    pub async fn snapshot(&self) -> HashMap<Did, NodeCapability> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
