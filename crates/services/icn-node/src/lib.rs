//! Node service: identity loading, logging setup and an in-process devnet
//! that drives jobs through a full mesh of nodes.

use anyhow::{anyhow, Context};
use futures::future::join_all;
use icn_config::{MeshConfig, NodeConfig};
use icn_core_types::{Cid, DidKey};
use planetary_mesh::{
    JobParams, MemoryNetwork, MeshIdentity, MeshNode, OriginatorJobState, ScriptedSandbox,
};
use rand::RngCore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEVNET_REGIONS: [&str; 2] = ["eu-west", "us-east"];

/// Install the global tracing subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // A second init (tests) is harmless
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Load the node key from `key_path`, or generate a throwaway one.
pub fn load_identity(config: &NodeConfig, peer_id: &str) -> anyhow::Result<MeshIdentity> {
    let did_key = match &config.key_path {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("Failed to read key file {}", path.display()))?;
            DidKey::from_secret_bytes(&bytes).map_err(|e| anyhow!("Invalid key file {}: {}", path.display(), e))?
        }
        None => {
            tracing::warn!("No key_path configured, using an ephemeral identity");
            DidKey::new()
        }
    };
    Ok(MeshIdentity::new(did_key, peer_id))
}

/// Write a fresh 32-byte secret key and return the DID it controls.
pub fn generate_key_file(path: &Path) -> anyhow::Result<String> {
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, secret).with_context(|| format!("Failed to write key file {}", path.display()))?;
    Ok(DidKey::from_seed(&secret).did().to_string())
}

#[derive(Debug, Clone)]
pub struct DevnetOptions {
    pub executors: usize,
    pub jobs: usize,
    pub bidding_window: Duration,
    /// Simulated sandbox run time
    pub execution_delay: Duration,
}

impl Default for DevnetOptions {
    fn default() -> Self {
        Self {
            executors: 3,
            jobs: 2,
            bidding_window: Duration::from_millis(500),
            execution_delay: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DevnetJob {
    pub announcement_id: String,
    pub state: OriginatorJobState,
    pub executor: Option<String>,
    pub receipt_ref: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DevnetReport {
    pub jobs: Vec<DevnetJob>,
    /// Originator metrics in Prometheus text format
    pub metrics: String,
}

/// Start one originator and `executors` executors on a shared in-memory
/// network, submit `jobs` jobs and wait for every one to finish.
///
/// Executors ask increasing prices and alternate between two regions.
pub async fn run_devnet(base: MeshConfig, options: DevnetOptions) -> anyhow::Result<DevnetReport> {
    if options.executors == 0 {
        return Err(anyhow!("a devnet needs at least one executor"));
    }
    let network = MemoryNetwork::new();

    let mut originator_config = base.clone();
    originator_config.node.executor_enabled = false;
    originator_config.node.alias = Some("originator".into());
    let originator = start_node(&network, "originator", originator_config, &options).await?;

    let mut executors = Vec::with_capacity(options.executors);
    for i in 0..options.executors {
        let mut config = base.clone();
        config.node.executor_enabled = true;
        config.node.alias = Some(format!("executor-{}", i));
        config.node.region = Some(DEVNET_REGIONS[i % DEVNET_REGIONS.len()].to_string());
        config.execution.min_price = base.execution.min_price + i as u64;
        executors.push(start_node(&network, &format!("executor-{}", i), config, &options).await?);
    }

    // Give advertisements a moment to land before the first announcement
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while originator.known_capabilities().await.len() < options.executors {
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!("Not every executor advertised before submitting jobs");
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut ids = Vec::with_capacity(options.jobs);
    for n in 0..options.jobs {
        let wasm = Cid::from_bytes(format!("devnet-module-{}", n).as_bytes())?;
        let input = Cid::from_bytes(format!("devnet-input-{}", n).as_bytes())?;
        let mut params = JobParams::new(wasm, vec![input], 10);
        params.required_runtime = Some("wasm".to_string());
        let id = originator.submit_job(params, Some(options.bidding_window)).await?;
        tracing::info!(job = %id, "Submitted devnet job");
        ids.push(id);
    }

    let wait = options.bidding_window + Duration::from_secs(30);
    let finished = join_all(ids.iter().map(|id| originator.wait_for_job(id, wait))).await;

    let mut jobs = Vec::with_capacity(finished.len());
    for outcome in finished {
        let job = outcome?;
        let executor = job.assigned_executor().map(|d| d.to_string());
        tracing::info!(
            job = %job.id(),
            state = %job.state,
            executor = executor.as_deref().unwrap_or("-"),
            "Devnet job finished"
        );
        jobs.push(DevnetJob {
            announcement_id: job.id().to_string(),
            state: job.state,
            executor,
            receipt_ref: job.receipt_ref.as_ref().map(|c| c.to_string()),
        });
    }

    let metrics = originator.metrics().gather_text()?;
    originator.shutdown();
    for executor in &executors {
        executor.shutdown();
    }
    Ok(DevnetReport { jobs, metrics })
}

async fn start_node(
    network: &MemoryNetwork,
    peer_id: &str,
    config: MeshConfig,
    options: &DevnetOptions,
) -> anyhow::Result<MeshNode> {
    let (transport, inbound) = network.join(peer_id);
    let sandbox = ScriptedSandbox::new().with_delay(options.execution_delay);
    let node = MeshNode::builder(MeshIdentity::generate(peer_id), Arc::new(transport), inbound)
        .config(config)
        .sandbox(Arc::new(sandbox))
        .start()
        .await?;
    tracing::debug!(peer = peer_id, did = %node.did(), "Devnet node started");
    Ok(node)
}
