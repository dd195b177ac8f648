use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for a mesh node.
///
/// Every section and field has a default, so an empty TOML file is a valid
/// configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct MeshConfig {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub bidding: BiddingConfig,
    pub execution: ExecutionConfig,
    pub replay: ReplayConfig,
    pub session: SessionConfig,
    pub workers: WorkerConfig,
    pub advertise: AdvertiseConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct NodeConfig {
    /// Human readable alias included in capability advertisements
    pub alias: Option<String>,
    /// Region this node advertises and bids from
    pub region: Option<String>,
    /// Path to a 32-byte secret key; a fresh key is generated when absent
    pub key_path: Option<PathBuf>,
    pub supported_runtimes: Vec<String>,
    pub specialized_features: Vec<String>,
    /// Resource quantities to advertise instead of detected host values
    pub resources: Option<BTreeMap<String, u64>>,
    /// Whether this node bids on and executes jobs
    pub executor_enabled: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            alias: None,
            region: None,
            key_path: None,
            supported_runtimes: vec!["wasm".to_string()],
            specialized_features: Vec::new(),
            resources: None,
            executor_enabled: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub capabilities_topic: String,
    pub announce_topic: String,
    pub receipts_topic: String,
    /// Also broadcast receipt availability notices on the receipts topic
    pub broadcast_receipts: bool,
    /// Publish announcements on `<announce_topic>.<region>` for each allowed region
    pub regional_announce_topics: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            capabilities_topic: "capabilities".to_string(),
            announce_topic: "jobs.announce".to_string(),
            receipts_topic: "receipts.available".to_string(),
            broadcast_receipts: true,
            regional_announce_topics: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BiddingConfig {
    /// Bidding window used when an announcement carries no duration
    pub default_window_secs: u64,
    /// Extra delivery attempts for an assignment before the job fails
    pub assignment_retry_budget: u32,
    pub assignment_retry_backoff_ms: u64,
    /// Time after the execution timeout the originator waits for a receipt
    pub receipt_grace_secs: u64,
}

impl Default for BiddingConfig {
    fn default() -> Self {
        Self {
            default_window_secs: 30,
            assignment_retry_budget: 3,
            assignment_retry_backoff_ms: 250,
            receipt_grace_secs: 30,
        }
    }
}

impl BiddingConfig {
    pub fn default_window(&self) -> Duration {
        Duration::from_secs(self.default_window_secs)
    }

    pub fn assignment_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.assignment_retry_backoff_ms)
    }

    pub fn receipt_grace(&self) -> Duration {
        Duration::from_secs(self.receipt_grace_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Timeout applied when a job does not specify one
    pub default_timeout_secs: u64,
    /// Bound on any single DHT get or put
    pub dht_timeout_secs: u64,
    /// Lowest price this node will bid
    pub min_price: u64,
    pub max_concurrent_jobs: usize,
    /// Originator DIDs whose jobs are never bid on
    pub blocklist: Vec<String>,
    /// Directory where validated receipts are written as JSON
    pub receipt_export_dir: Option<PathBuf>,
    /// How long a finished job stays queryable before it is dropped
    pub job_retention_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
            dht_timeout_secs: 30,
            min_price: 0,
            max_concurrent_jobs: 4,
            blocklist: Vec::new(),
            receipt_export_dir: None,
            job_retention_secs: 3600,
        }
    }
}

impl ExecutionConfig {
    pub fn dht_timeout(&self) -> Duration {
        Duration::from_secs(self.dht_timeout_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ReplayConfig {
    /// Messages whose timestamp differs from local time by more than this are dropped
    pub acceptance_window_secs: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self { acceptance_window_secs: 300 }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// Out-of-order interactive messages buffered per stream
    pub buffer_limit: usize,
    /// How long a buffered message may wait for the gap before it is reported
    pub max_wait_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { buffer_limit: 64, max_wait_ms: 2_000 }
    }
}

impl SessionConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    pub count: usize,
    pub queue_depth: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { count: 4, queue_depth: 1_024 }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AdvertiseConfig {
    pub interval_secs: u64,
}

impl Default for AdvertiseConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl AdvertiseConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl MeshConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse TOML config: {}", e))
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string(self).map_err(|e| anyhow::anyhow!("Failed to render TOML config: {}", e))
    }
}

/// Load a mesh node configuration from a TOML file.
pub fn load_mesh_config(path: impl AsRef<Path>) -> anyhow::Result<MeshConfig> {
    let path = path.as_ref();
    let config_content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file from {}: {}", path.display(), e))?;
    toml::from_str(&config_content)
        .map_err(|e| anyhow::anyhow!("Failed to parse TOML config from {}: {}", path.display(), e))
}
