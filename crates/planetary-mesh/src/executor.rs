//! Executor-side view of jobs: deciding whether to bid, accepting
//! assignments, running the sandbox and assembling receipts.

use crate::cap_index::{CapabilityMismatch, CapabilitySelector};
use crate::codec::SignedPayload;
use crate::error::{MeshError, MeshResult};
use crate::identity::MeshIdentity;
use crate::lifecycle::{CanonicalStatus, LocalJobStatus};
use crate::metrics::MeshMetrics;
use crate::receipt::{ExecutionFailure, ExecutionReceipt};
use crate::sandbox::{ExecutionSandbox, ResourceUsage, SandboxExit, SandboxRequest};
use crate::types::{Assignment, Bid, JobAnnouncement, NodeCapability, ResourceKind, ResourceMap};
use chrono::{DateTime, Utc};
use icn_config::{ExecutionConfig, NodeConfig};
use icn_core_types::{Cid, Did};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;

/// Local rules for which announcements this node bids on
#[derive(Debug, Clone, Default)]
pub struct AcceptancePolicy {
    /// Price asked for every job; jobs whose ceiling is lower are declined
    pub min_price: u64,
    pub max_concurrent_jobs: usize,
    /// Originators this node never works for
    pub blocklist: HashSet<Did>,
}

impl AcceptancePolicy {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        let blocklist = config
            .blocklist
            .iter()
            .filter_map(|entry| match Did::parse(entry) {
                Ok(did) => Some(did),
                Err(e) => {
                    warn!("Ignoring blocklist entry {}: {}", entry, e);
                    None
                }
            })
            .collect();
        Self {
            min_price: config.min_price,
            max_concurrent_jobs: config.max_concurrent_jobs,
            blocklist,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclineReason {
    OwnJob,
    Blocklisted(Did),
    AtCapacity { running: usize, limit: usize },
    Capability(CapabilityMismatch),
    PriceBelowMinimum { ceiling: u64, min_price: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BidDecision {
    Bid { price: u64 },
    Decline(DeclineReason),
}

/// Decide whether to bid on an announcement. Pure: the same inputs always
/// give the same decision.
pub fn decide_bid(
    announcement: &JobAnnouncement,
    capability: &NodeCapability,
    policy: &AcceptancePolicy,
    running: usize,
) -> BidDecision {
    if announcement.originator_did == capability.node_did {
        return BidDecision::Decline(DeclineReason::OwnJob);
    }
    if policy.blocklist.contains(&announcement.originator_did) {
        return BidDecision::Decline(DeclineReason::Blocklisted(announcement.originator_did.clone()));
    }
    if running >= policy.max_concurrent_jobs {
        return BidDecision::Decline(DeclineReason::AtCapacity {
            running,
            limit: policy.max_concurrent_jobs,
        });
    }
    if let Some(mismatch) = CapabilitySelector::from_job(&announcement.job_params).mismatch(capability) {
        return BidDecision::Decline(DeclineReason::Capability(mismatch));
    }
    if let Some(ceiling) = announcement.job_params.policy.max_price {
        if ceiling < policy.min_price {
            return BidDecision::Decline(DeclineReason::PriceBelowMinimum {
                ceiling,
                min_price: policy.min_price,
            });
        }
    }
    BidDecision::Bid {
        price: policy.min_price,
    }
}

/// Resources this host offers: the configured override, or what the
/// machine reports.
pub fn local_resources(config: &NodeConfig) -> ResourceMap {
    match &config.resources {
        Some(resources) => resources
            .iter()
            .map(|(name, qty)| (ResourceKind::from(name.clone()), *qty))
            .collect(),
        None => detect_host_resources(),
    }
}

pub fn detect_host_resources() -> ResourceMap {
    let mut resources = ResourceMap::new();
    resources.insert(ResourceKind::CpuCores, num_cpus::get() as u64);
    match sys_info::mem_info() {
        Ok(mem) => {
            resources.insert(ResourceKind::MemoryMb, mem.total / 1024);
        }
        Err(e) => warn!("Could not read memory info: {}", e),
    }
    match sys_info::disk_info() {
        Ok(disk) => {
            resources.insert(ResourceKind::StorageMb, disk.total / 1024);
        }
        Err(e) => warn!("Could not read disk info: {}", e),
    }
    resources
}

/// Signed capability advertisement for this node.
pub fn build_capability(
    identity: &MeshIdentity,
    config: &NodeConfig,
    available_resources: ResourceMap,
) -> MeshResult<NodeCapability> {
    NodeCapability {
        node_did: identity.did().clone(),
        peer_id: identity.peer_id().to_string(),
        alias: config.alias.clone(),
        region: config.region.clone(),
        supported_runtimes: config.supported_runtimes.clone(),
        available_resources,
        specialized_features: config.specialized_features.clone(),
        timestamp: Utc::now(),
        attestation_ref: None,
        signature: Vec::new(),
    }
    .sign_with(identity)
}

/// A job this node bid on
#[derive(Debug, Clone)]
pub struct ExecutorJob {
    pub announcement: JobAnnouncement,
    pub bid: Bid,
    pub status: LocalJobStatus,
    pub assignment: Option<Assignment>,
    pub receipt_ref: Option<Cid>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutorJob {
    /// Nothing further happens to this job: its bid lapsed, or it ran and
    /// its receipt exists.
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal() && (self.assignment.is_none() || self.receipt_ref.is_some())
    }
}

/// Executor-side job table, independent of the originator registry
pub struct ExecutorEngine {
    local_did: Did,
    jobs: RwLock<HashMap<String, ExecutorJob>>,
}

impl ExecutorEngine {
    pub fn new(local_did: Did) -> Self {
        Self {
            local_did,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, announcement_id: &str) -> Option<ExecutorJob> {
        self.jobs.read().await.get(announcement_id).cloned()
    }

    pub async fn status(&self, announcement_id: &str) -> Option<LocalJobStatus> {
        self.jobs.read().await.get(announcement_id).map(|j| j.status)
    }

    pub async fn list(&self) -> Vec<ExecutorJob> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Drop settled jobs last touched at or before `cutoff`. Returns the ids
    /// removed.
    pub async fn evict_finished(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut jobs = self.jobs.write().await;
        let expired: Vec<String> = jobs
            .iter()
            .filter(|(_, job)| job.is_settled() && job.updated_at <= cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            jobs.remove(id);
        }
        expired
    }

    /// Jobs assigned and still executing.
    pub async fn running(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|j| j.status.canonical() == CanonicalStatus::Running)
            .count()
    }

    /// Remember a bid that was sent. One bid per announcement.
    pub async fn record_bid(&self, announcement: JobAnnouncement, bid: Bid) -> MeshResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&announcement.announcement_id) {
            return Err(MeshError::contextual(format!(
                "already bid on {}",
                announcement.announcement_id
            )));
        }
        jobs.insert(
            announcement.announcement_id.clone(),
            ExecutorJob {
                announcement,
                bid,
                status: LocalJobStatus::BiddingOpen,
                assignment: None,
                receipt_ref: None,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Accept a verified assignment. It must name this node and match a live
    /// bid from the same originator.
    pub async fn accept_assignment(&self, assignment: &Assignment) -> MeshResult<JobAnnouncement> {
        if assignment.executor_did != self.local_did {
            return Err(MeshError::contextual(format!(
                "wrong recipient: assignment for {} names {}",
                assignment.announcement_id, assignment.executor_did
            )));
        }
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&assignment.announcement_id).ok_or_else(|| {
            MeshError::contextual(format!("no bid for {}", assignment.announcement_id))
        })?;
        if job.announcement.originator_did != assignment.originator_did {
            return Err(MeshError::contextual(format!(
                "assignment for {} signed by {}, not the originator",
                assignment.announcement_id, assignment.originator_did
            )));
        }
        job.status = job.status.transition(LocalJobStatus::PreparingExecution)?;
        job.assignment = Some(assignment.clone());
        job.updated_at = Utc::now();
        info!("Accepted assignment for {}", assignment.announcement_id);
        Ok(job.announcement.clone())
    }

    pub async fn transition(&self, announcement_id: &str, next: LocalJobStatus) -> MeshResult<LocalJobStatus> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(announcement_id)
            .ok_or_else(|| MeshError::NotFound(announcement_id.to_string()))?;
        job.status = job.status.transition(next)?;
        job.updated_at = Utc::now();
        debug!("Executor job {} now {}", announcement_id, job.status);
        Ok(job.status)
    }

    pub async fn set_receipt_ref(&self, announcement_id: &str, receipt_ref: Cid) -> MeshResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(announcement_id)
            .ok_or_else(|| MeshError::NotFound(announcement_id.to_string()))?;
        job.receipt_ref = Some(receipt_ref);
        job.updated_at = Utc::now();
        Ok(())
    }

    /// Give up on a bid that was never answered. Returns whether it expired.
    pub async fn expire_bid(&self, announcement_id: &str) -> bool {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(announcement_id) {
            Some(job) if job.status == LocalJobStatus::BiddingOpen => {
                job.status = LocalJobStatus::Cancelled;
                job.updated_at = Utc::now();
                debug!("Bid on {} expired without assignment", announcement_id);
                true
            }
            _ => false,
        }
    }
}

/// Outcome of running one job, across all retries
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRun {
    pub result: Result<Vec<Cid>, ExecutionFailure>,
    pub resource_usage: ResourceUsage,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl ExecutionRun {
    /// Local status the executor ends in.
    pub fn final_status(&self) -> LocalJobStatus {
        match &self.result {
            Ok(_) => LocalJobStatus::Completed,
            Err(ExecutionFailure::Timeout) => LocalJobStatus::TimedOut,
            Err(ExecutionFailure::Cancelled) => LocalJobStatus::Cancelled,
            Err(_) => LocalJobStatus::Failed,
        }
    }
}

/// Invoke the sandbox until it succeeds, fails permanently, runs out of
/// retries or the job timeout passes. The timeout covers all attempts;
/// dropping the pending call cancels it.
pub async fn execute_with_retries(
    sandbox: &dyn ExecutionSandbox,
    request: SandboxRequest,
    max_retries: u32,
    timeout: Duration,
    metrics: &MeshMetrics,
) -> ExecutionRun {
    let started_at = Utc::now();
    let deadline = tokio::time::Instant::now() + timeout;
    let mut usage = ResourceUsage::default();
    let mut attempts = 0u32;

    let result = loop {
        attempts += 1;
        match tokio::time::timeout_at(deadline, sandbox.execute(request.clone())).await {
            Err(_) => {
                metrics.sandbox_attempts.with_label_values(&["timeout"]).inc();
                warn!("Job {} exceeded its {:?} timeout", request.announcement_id, timeout);
                break Err(ExecutionFailure::Timeout);
            }
            Ok(Ok(outcome)) => {
                usage.accumulate(&outcome.resource_usage);
                match outcome.status {
                    SandboxExit::Success => {
                        metrics.sandbox_attempts.with_label_values(&["success"]).inc();
                        break match request.budget.admits(&usage) {
                            Ok(()) => Ok(outcome.output_refs),
                            Err(reason) => Err(ExecutionFailure::BudgetExceeded(reason)),
                        };
                    }
                    SandboxExit::Failure { code, message } => {
                        metrics.sandbox_attempts.with_label_values(&["exit"]).inc();
                        break Err(ExecutionFailure::NonZeroExit { code, message });
                    }
                }
            }
            Ok(Err(err)) if err.is_transient() && attempts <= max_retries => {
                metrics.sandbox_attempts.with_label_values(&["retry"]).inc();
                warn!(
                    "Job {} attempt {} failed ({}), retrying",
                    request.announcement_id, attempts, err
                );
            }
            Ok(Err(err)) => {
                metrics.sandbox_attempts.with_label_values(&["error"]).inc();
                break Err(err.into());
            }
        }
    };

    ExecutionRun {
        result,
        resource_usage: usage,
        attempts,
        started_at,
        ended_at: Utc::now(),
    }
}

/// Unsigned receipt for a finished run.
pub fn assemble_receipt(announcement: &JobAnnouncement, executor_did: &Did, run: &ExecutionRun) -> ExecutionReceipt {
    let (status, output_refs, failure_reason) = match &run.result {
        Ok(outputs) => (CanonicalStatus::CompletedSuccessfully, outputs.clone(), None),
        Err(failure) => (run.final_status().canonical(), Vec::new(), Some(failure.clone())),
    };
    ExecutionReceipt {
        announcement_id: announcement.announcement_id.clone(),
        originator_did: announcement.originator_did.clone(),
        executor_did: executor_did.clone(),
        job_params: announcement.job_params.clone(),
        resource_usage: run.resource_usage.clone(),
        output_refs,
        status,
        failure_reason,
        attempts: run.attempts,
        started_at: run.started_at,
        ended_at: run.ended_at,
        signature: Vec::new(),
    }
}
