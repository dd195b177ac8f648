use crate::lifecycle::LocalJobStatus;
use crate::sandbox::ResourceUsage;
use chrono::{DateTime, Utc};
use icn_core_types::{Cid, Did};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kinds of resources a node advertises and a job may require.
///
/// Serialized as a plain string so it can key CBOR maps; names this version
/// does not know survive as `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceKind {
    /// CPU cores
    CpuCores,
    /// RAM in MB
    MemoryMb,
    /// Disk space in MB
    StorageMb,
    /// GPU cores
    GpuCores,
    BandwidthMbps,
    Other(String),
}

impl ResourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            ResourceKind::CpuCores => "cpu_cores",
            ResourceKind::MemoryMb => "memory_mb",
            ResourceKind::StorageMb => "storage_mb",
            ResourceKind::GpuCores => "gpu_cores",
            ResourceKind::BandwidthMbps => "bandwidth_mbps",
            ResourceKind::Other(name) => name,
        }
    }
}

impl From<String> for ResourceKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "cpu_cores" => ResourceKind::CpuCores,
            "memory_mb" => ResourceKind::MemoryMb,
            "storage_mb" => ResourceKind::StorageMb,
            "gpu_cores" => ResourceKind::GpuCores,
            "bandwidth_mbps" => ResourceKind::BandwidthMbps,
            _ => ResourceKind::Other(s),
        }
    }
}

impl From<ResourceKind> for String {
    fn from(kind: ResourceKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type ResourceMap = BTreeMap<ResourceKind, u64>;

/// Signed self-description broadcast by every executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapability {
    pub node_did: Did,
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// e.g. "wasm"
    pub supported_runtimes: Vec<String>,
    pub available_resources: ResourceMap,
    /// e.g. "sgx", "gpu-cuda"
    pub specialized_features: Vec<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation_ref: Option<Cid>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// Constraints an originator places on who may run a job and at what price
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Acceptable executor regions in order of preference; empty means any
    pub allowed_regions: Vec<String>,
    /// Price ceiling in compute units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_reputation: Option<u32>,
    /// Minimum resources the executor must have
    pub resource_requirements: ResourceMap,
}

impl ExecutionPolicy {
    pub fn region_allowed(&self, region: Option<&str>) -> bool {
        if self.allowed_regions.is_empty() {
            return true;
        }
        region.map_or(false, |r| self.allowed_regions.iter().any(|a| a == r))
    }

    /// Position of a region in the preference list; unlisted regions rank last.
    pub fn region_rank(&self, region: Option<&str>) -> usize {
        region
            .and_then(|r| self.allowed_regions.iter().position(|a| a == r))
            .unwrap_or(self.allowed_regions.len())
    }
}

/// Ceiling handed to the sandbox and checked again against the receipt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBudget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fuel: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_ms: Option<u64>,
}

impl ResourceBudget {
    /// Check reported usage against the ceiling.
    pub fn admits(&self, usage: &ResourceUsage) -> Result<(), String> {
        let checks = [
            ("fuel", self.max_fuel, usage.fuel_consumed),
            ("memory_mb", self.max_memory_mb, usage.memory_peak_mb),
            ("cpu_ms", self.max_cpu_ms, usage.cpu_ms),
        ];
        for (name, limit, used) in checks {
            if let Some(limit) = limit {
                if used > limit {
                    return Err(format!("{} usage {} exceeds budget {}", name, used, limit));
                }
            }
        }
        Ok(())
    }
}

/// What to run and under which constraints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParams {
    pub wasm_ref: Cid,
    pub input_refs: Vec<Cid>,
    pub policy: ExecutionPolicy,
    pub budget: ResourceBudget,
    pub interactive: bool,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_runtime: Option<String>,
    pub required_features: Vec<String>,
}

impl JobParams {
    /// Non-interactive job with an empty policy.
    pub fn new(wasm_ref: Cid, input_refs: Vec<Cid>, timeout_seconds: u64) -> Self {
        Self {
            wasm_ref,
            input_refs,
            policy: ExecutionPolicy::default(),
            budget: ResourceBudget::default(),
            interactive: false,
            timeout_seconds,
            max_retries: 0,
            required_runtime: None,
            required_features: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAnnouncement {
    pub announcement_id: String,
    pub originator_did: Did,
    /// Where bids should be sent
    pub originator_peer_id: String,
    pub job_params: JobParams,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bidding_duration_ms: Option<u64>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub announcement_id: String,
    pub executor_did: Did,
    pub executor_peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub announcement_id: String,
    pub originator_did: Did,
    pub executor_did: Did,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub announcement_id: String,
    pub executor_did: Did,
    pub local_status: LocalJobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// Announces that a receipt is retrievable from the DHT under `receipt_ref`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptAvailable {
    pub announcement_id: String,
    pub originator_did: Did,
    pub executor_did: Did,
    pub receipt_ref: Cid,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractiveMessage {
    pub announcement_id: String,
    pub sender_did: Did,
    pub recipient_did: Did,
    pub message_id: String,
    pub sequence_number: u64,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_kind_string_forms() {
        assert_eq!(String::from(ResourceKind::MemoryMb), "memory_mb");
        assert_eq!(ResourceKind::from("gpu_cores".to_string()), ResourceKind::GpuCores);
        assert_eq!(
            ResourceKind::from("tpu_chips".to_string()),
            ResourceKind::Other("tpu_chips".to_string())
        );
    }

    #[test]
    fn region_preference() {
        let policy = ExecutionPolicy {
            allowed_regions: vec!["eu-west".into(), "eu-north".into()],
            ..ExecutionPolicy::default()
        };
        assert!(policy.region_allowed(Some("eu-north")));
        assert!(!policy.region_allowed(Some("us-east")));
        assert!(!policy.region_allowed(None));
        assert_eq!(policy.region_rank(Some("eu-west")), 0);
        assert_eq!(policy.region_rank(Some("eu-north")), 1);
        assert_eq!(policy.region_rank(None), 2);

        let open = ExecutionPolicy::default();
        assert!(open.region_allowed(None));
    }

    #[test]
    fn budget_admits_usage_within_limits() {
        let budget = ResourceBudget {
            max_fuel: Some(5_000),
            max_memory_mb: Some(64),
            max_cpu_ms: None,
        };
        let mut usage = ResourceUsage {
            fuel_consumed: 4_000,
            cpu_ms: 1_000_000,
            memory_peak_mb: 64,
            host_calls: 3,
        };
        assert!(budget.admits(&usage).is_ok());
        usage.fuel_consumed = 5_001;
        assert!(budget.admits(&usage).unwrap_err().contains("fuel"));
    }
}
