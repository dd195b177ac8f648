//! Originator-side record of announced jobs.
//!
//! A job moves `Draft -> Announced -> CollectingBids -> Selecting -> Assigned
//! -> Monitoring` and ends `Completed`, `Failed` or `TimedOut`. Every method
//! validates the current state first; messages that do not fit are rejected
//! with `ContextualViolation` and leave the job untouched.

use crate::error::{MeshError, MeshResult};
use crate::lifecycle::{CanonicalStatus, LocalJobStatus, OriginatorJobState};
use crate::receipt::ExecutionReceipt;
use crate::scheduler::{check_bid_policy, Scheduler};
use crate::types::{Assignment, Bid, JobAnnouncement, NodeCapability, ReceiptAvailable, StatusUpdate};
use chrono::{DateTime, Duration, Utc};
use icn_core_types::{Cid, Did};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

/// Why an originator gave up on a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    NoEligibleBid,
    AssignmentUndeliverable,
    /// Cancelled by the originator
    Cancelled,
    /// The executor's receipt reports failure
    ExecutionFailed(String),
    /// The executor's receipt reports the job was cancelled
    ExecutorCancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoEligibleBid => write!(f, "no eligible bid"),
            FailureReason::AssignmentUndeliverable => write!(f, "assignment undeliverable"),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::ExecutionFailed(reason) => write!(f, "execution failed: {}", reason),
            FailureReason::ExecutorCancelled => write!(f, "cancelled by executor"),
        }
    }
}

/// Everything the originator knows about one of its jobs
#[derive(Debug, Clone)]
pub struct OriginatorJob {
    pub announcement: JobAnnouncement,
    pub state: OriginatorJobState,
    pub bidding_deadline: Option<DateTime<Utc>>,
    /// Admitted bids in arrival order
    pub bids: Vec<Bid>,
    pub selected: Option<Bid>,
    pub assignment: Option<Assignment>,
    pub status_history: Vec<StatusUpdate>,
    pub receipt: Option<ExecutionReceipt>,
    pub receipt_ref: Option<Cid>,
    pub failure: Option<FailureReason>,
    pub updated_at: DateTime<Utc>,
}

impl OriginatorJob {
    fn new(announcement: JobAnnouncement) -> Self {
        Self {
            announcement,
            state: OriginatorJobState::Draft,
            bidding_deadline: None,
            bids: Vec::new(),
            selected: None,
            assignment: None,
            status_history: Vec::new(),
            receipt: None,
            receipt_ref: None,
            failure: None,
            updated_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.announcement.announcement_id
    }

    fn advance(&mut self, next: OriginatorJobState) -> MeshResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(MeshError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!("Job {}: {} -> {}", self.id(), self.state, next);
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn fail(&mut self, reason: FailureReason) -> MeshResult<()> {
        self.advance(OriginatorJobState::Failed)?;
        info!("Job {} failed: {}", self.id(), reason);
        self.failure = Some(reason);
        Ok(())
    }

    fn require(&self, state: OriginatorJobState, what: &str) -> MeshResult<()> {
        if self.state != state {
            return Err(MeshError::contextual(format!(
                "{} for {} while {}",
                what,
                self.id(),
                self.state
            )));
        }
        Ok(())
    }

    /// Most recent executor-reported status.
    pub fn last_executor_status(&self) -> Option<LocalJobStatus> {
        self.status_history.last().map(|u| u.local_status)
    }

    /// Input may flow once the executor reports it is running, and only
    /// while the job is still live.
    pub fn accepts_interactive_input(&self) -> bool {
        matches!(self.state, OriginatorJobState::Assigned | OriginatorJobState::Monitoring)
            && self
                .last_executor_status()
                .map_or(false, |status| status.is_interactive_window())
    }

    pub fn assigned_executor(&self) -> Option<&Did> {
        self.assignment.as_ref().map(|a| &a.executor_did)
    }

    /// The job's status in the shared vocabulary.
    pub fn canonical_status(&self) -> CanonicalStatus {
        match (self.state, &self.failure) {
            (OriginatorJobState::Failed, Some(FailureReason::Cancelled))
            | (OriginatorJobState::Failed, Some(FailureReason::ExecutorCancelled)) => {
                CanonicalStatus::Cancelled
            }
            (state, _) => state.local_status().canonical(),
        }
    }
}

/// Jobs this node has announced, keyed by announcement id
pub struct JobRegistry {
    local_did: Did,
    jobs: RwLock<HashMap<String, OriginatorJob>>,
}

impl JobRegistry {
    pub fn new(local_did: Did) -> Self {
        Self {
            local_did,
            jobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_did(&self) -> &Did {
        &self.local_did
    }

    pub async fn get(&self, announcement_id: &str) -> Option<OriginatorJob> {
        self.jobs.read().await.get(announcement_id).cloned()
    }

    pub async fn list(&self) -> Vec<OriginatorJob> {
        self.jobs.read().await.values().cloned().collect()
    }

    pub async fn contains(&self, announcement_id: &str) -> bool {
        self.jobs.read().await.contains_key(announcement_id)
    }

    /// Drop finished jobs last touched at or before `cutoff`. Returns the ids
    /// removed.
    pub async fn evict_finished(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut jobs = self.jobs.write().await;
        let expired: Vec<String> = jobs
            .values()
            .filter(|job| job.state.is_terminal() && job.updated_at <= cutoff)
            .map(|job| job.id().to_string())
            .collect();
        for id in &expired {
            jobs.remove(id);
        }
        expired
    }

    async fn with_job<T>(
        &self,
        announcement_id: &str,
        f: impl FnOnce(&mut OriginatorJob) -> MeshResult<T>,
    ) -> MeshResult<T> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(announcement_id)
            .ok_or_else(|| MeshError::contextual(format!("unknown announcement {}", announcement_id)))?;
        f(job)
    }

    pub async fn insert_draft(&self, announcement: JobAnnouncement) -> MeshResult<()> {
        if announcement.originator_did != self.local_did {
            return Err(MeshError::contextual("announcement is not ours"));
        }
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&announcement.announcement_id) {
            return Err(MeshError::contextual(format!(
                "announcement {} already exists",
                announcement.announcement_id
            )));
        }
        jobs.insert(announcement.announcement_id.clone(), OriginatorJob::new(announcement));
        Ok(())
    }

    pub async fn mark_announced(&self, announcement_id: &str) -> MeshResult<()> {
        self.with_job(announcement_id, |job| job.advance(OriginatorJobState::Announced))
            .await
    }

    /// Start collecting bids until `now + window`.
    pub async fn open_bidding(
        &self,
        announcement_id: &str,
        window: std::time::Duration,
        now: DateTime<Utc>,
    ) -> MeshResult<DateTime<Utc>> {
        let window = Duration::from_std(window).map_err(|e| MeshError::Internal(e.to_string()))?;
        self.with_job(announcement_id, |job| {
            job.advance(OriginatorJobState::CollectingBids)?;
            let deadline = now + window;
            job.bidding_deadline = Some(deadline);
            Ok(deadline)
        })
        .await
    }

    /// Admit a verified bid received at `now`.
    pub async fn accept_bid(
        &self,
        bid: Bid,
        now: DateTime<Utc>,
        capability: Option<&NodeCapability>,
        scheduler: &Scheduler,
    ) -> MeshResult<()> {
        let announcement_id = bid.announcement_id.clone();
        self.with_job(&announcement_id, |job| {
            job.require(OriginatorJobState::CollectingBids, "bid")?;
            match job.bidding_deadline {
                Some(deadline) if now < deadline => {}
                _ => {
                    return Err(MeshError::contextual(format!(
                        "bid from {} after bidding deadline",
                        bid.executor_did
                    )))
                }
            }
            if job.bids.iter().any(|b| b.executor_did == bid.executor_did) {
                return Err(MeshError::contextual(format!(
                    "{} already bid on {}",
                    bid.executor_did,
                    job.id()
                )));
            }
            check_bid_policy(
                &bid,
                &job.announcement.job_params.policy,
                capability,
                scheduler.reputation(),
            )?;
            debug!("Job {}: admitted bid from {} at {:?}", job.id(), bid.executor_did, bid.price);
            job.bids.push(bid);
            job.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    /// Stop accepting bids. Returns `false` if bidding had already closed.
    pub async fn close_bidding(&self, announcement_id: &str) -> MeshResult<bool> {
        self.with_job(announcement_id, |job| {
            if job.state != OriginatorJobState::CollectingBids {
                return Ok(false);
            }
            job.advance(OriginatorJobState::Selecting)?;
            Ok(true)
        })
        .await
    }

    /// Pick the winning bid. No eligible bid fails the job and returns `None`.
    pub async fn select_executor(
        &self,
        announcement_id: &str,
        scheduler: &Scheduler,
        capabilities: &HashMap<Did, NodeCapability>,
    ) -> MeshResult<Option<Bid>> {
        self.with_job(announcement_id, |job| {
            job.require(OriginatorJobState::Selecting, "selection")?;
            let winner = scheduler
                .select(&job.bids, &job.announcement.job_params.policy, capabilities)
                .cloned();
            match winner {
                Some(bid) => {
                    job.selected = Some(bid.clone());
                    Ok(Some(bid))
                }
                None => {
                    job.fail(FailureReason::NoEligibleBid)?;
                    Ok(None)
                }
            }
        })
        .await
    }

    pub async fn record_assignment(&self, assignment: Assignment) -> MeshResult<()> {
        let announcement_id = assignment.announcement_id.clone();
        self.with_job(&announcement_id, |job| {
            job.require(OriginatorJobState::Selecting, "assignment")?;
            let selected = job
                .selected
                .as_ref()
                .ok_or_else(|| MeshError::contextual("no bid selected"))?;
            if selected.executor_did != assignment.executor_did {
                return Err(MeshError::contextual(format!(
                    "assignment to {} but {} won",
                    assignment.executor_did, selected.executor_did
                )));
            }
            job.advance(OriginatorJobState::Assigned)?;
            job.assignment = Some(assignment);
            Ok(())
        })
        .await
    }

    pub async fn assignment_delivered(&self, announcement_id: &str) -> MeshResult<()> {
        self.with_job(announcement_id, |job| {
            // A status update may have arrived before the delivery ack
            if job.state == OriginatorJobState::Monitoring {
                return Ok(());
            }
            job.advance(OriginatorJobState::Monitoring)
        })
        .await
    }

    pub async fn assignment_delivery_failed(&self, announcement_id: &str) -> MeshResult<()> {
        self.with_job(announcement_id, |job| {
            job.require(OriginatorJobState::Assigned, "delivery failure")?;
            job.fail(FailureReason::AssignmentUndeliverable)
        })
        .await
    }

    /// Record a verified status update from the assigned executor. Returns
    /// `false` for updates older than the latest one seen.
    pub async fn ingest_status(&self, update: StatusUpdate) -> MeshResult<bool> {
        let announcement_id = update.announcement_id.clone();
        self.with_job(&announcement_id, |job| {
            if !matches!(job.state, OriginatorJobState::Assigned | OriginatorJobState::Monitoring) {
                return Err(MeshError::contextual(format!(
                    "status update for {} while {}",
                    job.id(),
                    job.state
                )));
            }
            if job.assigned_executor() != Some(&update.executor_did) {
                return Err(MeshError::contextual(format!(
                    "status update from unassigned executor {}",
                    update.executor_did
                )));
            }
            if let Some(last) = job.last_executor_status() {
                if update.local_status.progress() < last.progress() {
                    debug!(
                        "Job {}: ignoring stale status {} after {}",
                        job.id(),
                        update.local_status,
                        last
                    );
                    return Ok(false);
                }
            }
            if job.state == OriginatorJobState::Assigned {
                job.advance(OriginatorJobState::Monitoring)?;
            }
            job.status_history.push(update);
            job.updated_at = Utc::now();
            Ok(true)
        })
        .await
    }

    /// Validate a receipt availability notice against the recorded
    /// assignment, before anything is fetched.
    pub async fn check_receipt_notice(&self, notice: &ReceiptAvailable) -> MeshResult<()> {
        if notice.originator_did != self.local_did {
            return Err(MeshError::contextual(format!(
                "receipt notice addressed to {}",
                notice.originator_did
            )));
        }
        let jobs = self.jobs.read().await;
        let job = jobs.get(&notice.announcement_id).ok_or_else(|| {
            MeshError::contextual(format!("receipt notice for unknown {}", notice.announcement_id))
        })?;
        if job.assigned_executor() != Some(&notice.executor_did) {
            return Err(MeshError::contextual(format!(
                "receipt notice from {} which was not assigned {}",
                notice.executor_did, notice.announcement_id
            )));
        }
        if job.state.is_terminal() {
            return Err(MeshError::contextual(format!(
                "receipt notice for finished job {}",
                notice.announcement_id
            )));
        }
        Ok(())
    }

    /// Finish the job from a receipt whose signature and content reference
    /// were already verified.
    pub async fn complete_with_receipt(
        &self,
        receipt: ExecutionReceipt,
        receipt_ref: Cid,
    ) -> MeshResult<OriginatorJobState> {
        let local_did = self.local_did.clone();
        let announcement_id = receipt.announcement_id.clone();
        self.with_job(&announcement_id, |job| {
            if !matches!(job.state, OriginatorJobState::Assigned | OriginatorJobState::Monitoring) {
                return Err(MeshError::contextual(format!(
                    "receipt for {} while {}",
                    job.id(),
                    job.state
                )));
            }
            let executor = job
                .assigned_executor()
                .cloned()
                .ok_or_else(|| MeshError::contextual("receipt without assignment"))?;
            receipt.check_consistency(
                &job.announcement.announcement_id,
                &job.announcement.job_params,
                &local_did,
                &executor,
            )?;
            if job.state == OriginatorJobState::Assigned {
                job.advance(OriginatorJobState::Monitoring)?;
            }
            match receipt.status {
                CanonicalStatus::CompletedSuccessfully => job.advance(OriginatorJobState::Completed)?,
                CanonicalStatus::Cancelled => job.fail(FailureReason::ExecutorCancelled)?,
                _ => {
                    let reason = receipt
                        .failure_reason
                        .as_ref()
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "unspecified".to_string());
                    job.fail(FailureReason::ExecutionFailed(reason))?
                }
            }
            job.receipt = Some(receipt);
            job.receipt_ref = Some(receipt_ref);
            Ok(job.state)
        })
        .await
    }

    /// Job timer fired. Only assigned or monitored jobs time out; returns
    /// whether the job changed.
    pub async fn expire(&self, announcement_id: &str) -> MeshResult<bool> {
        self.with_job(announcement_id, |job| {
            if !job.state.can_transition_to(OriginatorJobState::TimedOut) {
                return Ok(false);
            }
            warn!("Job {} timed out without a valid receipt", job.id());
            job.advance(OriginatorJobState::TimedOut)?;
            Ok(true)
        })
        .await
    }

    /// Cancel a job that has not finished.
    pub async fn cancel_job(&self, announcement_id: &str) -> MeshResult<()> {
        self.with_job(announcement_id, |job| {
            if job.state.is_terminal() {
                return Err(MeshError::contextual(format!(
                    "job {} already {}",
                    job.id(),
                    job.state
                )));
            }
            job.fail(FailureReason::Cancelled)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SignedPayload;
    use crate::identity::MeshIdentity;
    use crate::receipt::ExecutionFailure;
    use crate::sandbox::ResourceUsage;
    use crate::types::JobParams;

    fn announcement(originator: &MeshIdentity, max_price: Option<u64>) -> JobAnnouncement {
        let mut params = JobParams::new(Cid::from_bytes(b"wasm").unwrap(), vec![], 30);
        params.policy.max_price = max_price;
        JobAnnouncement {
            announcement_id: "job-1".into(),
            originator_did: originator.did().clone(),
            originator_peer_id: originator.peer_id().into(),
            job_params: params,
            timestamp: Utc::now(),
            bidding_duration_ms: None,
            signature: Vec::new(),
        }
        .sign_with(originator)
        .unwrap()
    }

    fn bid(executor: &MeshIdentity, price: u64) -> Bid {
        Bid {
            announcement_id: "job-1".into(),
            executor_did: executor.did().clone(),
            executor_peer_id: executor.peer_id().into(),
            price: Some(price),
            region: None,
            timestamp: Utc::now(),
            signature: Vec::new(),
        }
    }

    async fn collecting(
        originator: &MeshIdentity,
        max_price: Option<u64>,
        window_ms: u64,
    ) -> (JobRegistry, DateTime<Utc>) {
        let registry = JobRegistry::new(originator.did().clone());
        registry.insert_draft(announcement(originator, max_price)).await.unwrap();
        registry.mark_announced("job-1").await.unwrap();
        let now = Utc::now();
        registry
            .open_bidding("job-1", std::time::Duration::from_millis(window_ms), now)
            .await
            .unwrap();
        (registry, now)
    }

    #[tokio::test]
    async fn zero_window_rejects_every_bid() {
        let originator = MeshIdentity::generate("orig");
        let executor = MeshIdentity::generate("exec");
        let (registry, opened) = collecting(&originator, None, 0).await;

        let err = registry
            .accept_bid(bid(&executor, 1), opened, None, &Scheduler::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::ContextualViolation(_)));
        assert!(registry.get("job-1").await.unwrap().bids.is_empty());
    }

    #[tokio::test]
    async fn bids_are_not_retractable() {
        let originator = MeshIdentity::generate("orig");
        let executor = MeshIdentity::generate("exec");
        let (registry, opened) = collecting(&originator, None, 10_000).await;
        let scheduler = Scheduler::default();

        registry.accept_bid(bid(&executor, 5), opened, None, &scheduler).await.unwrap();
        let err = registry
            .accept_bid(bid(&executor, 3), opened, None, &scheduler)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::ContextualViolation(_)));
        assert_eq!(registry.get("job-1").await.unwrap().bids[0].price, Some(5));
    }

    #[tokio::test]
    async fn policy_rejection_leaves_state_unchanged() {
        let originator = MeshIdentity::generate("orig");
        let a = MeshIdentity::generate("a");
        let b = MeshIdentity::generate("b");
        let (registry, opened) = collecting(&originator, Some(9), 10_000).await;
        let scheduler = Scheduler::default();

        let err = registry.accept_bid(bid(&a, 10), opened, None, &scheduler).await.unwrap_err();
        assert!(matches!(err, MeshError::PolicyViolation(_)));
        registry.accept_bid(bid(&b, 8), opened, None, &scheduler).await.unwrap();

        assert!(registry.close_bidding("job-1").await.unwrap());
        assert!(!registry.close_bidding("job-1").await.unwrap());
        let winner = registry
            .select_executor("job-1", &scheduler, &HashMap::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&winner.executor_did, b.did());
    }

    #[tokio::test]
    async fn no_bids_fails_with_no_eligible_bid() {
        let originator = MeshIdentity::generate("orig");
        let (registry, _) = collecting(&originator, None, 10_000).await;
        registry.close_bidding("job-1").await.unwrap();
        let winner = registry
            .select_executor("job-1", &Scheduler::default(), &HashMap::new())
            .await
            .unwrap();
        assert!(winner.is_none());
        let job = registry.get("job-1").await.unwrap();
        assert_eq!(job.state, OriginatorJobState::Failed);
        assert_eq!(job.failure, Some(FailureReason::NoEligibleBid));
    }

    async fn assigned(originator: &MeshIdentity, executor: &MeshIdentity) -> JobRegistry {
        let (registry, opened) = collecting(originator, None, 10_000).await;
        let scheduler = Scheduler::default();
        registry.accept_bid(bid(executor, 2), opened, None, &scheduler).await.unwrap();
        registry.close_bidding("job-1").await.unwrap();
        registry
            .select_executor("job-1", &scheduler, &HashMap::new())
            .await
            .unwrap();
        registry
            .record_assignment(Assignment {
                announcement_id: "job-1".into(),
                originator_did: originator.did().clone(),
                executor_did: executor.did().clone(),
                timestamp: Utc::now(),
                signature: Vec::new(),
            })
            .await
            .unwrap();
        registry
    }

    fn receipt(
        originator: &MeshIdentity,
        executor: &MeshIdentity,
        params: &JobParams,
        status: CanonicalStatus,
    ) -> ExecutionReceipt {
        let now = Utc::now();
        ExecutionReceipt {
            announcement_id: "job-1".into(),
            originator_did: originator.did().clone(),
            executor_did: executor.did().clone(),
            job_params: params.clone(),
            resource_usage: ResourceUsage::default(),
            output_refs: vec![],
            status,
            failure_reason: match status {
                CanonicalStatus::Failed => Some(ExecutionFailure::Timeout),
                _ => None,
            },
            attempts: 1,
            started_at: now,
            ended_at: now,
            signature: Vec::new(),
        }
    }

    #[tokio::test]
    async fn receipt_notice_must_match_assignment() {
        let originator = MeshIdentity::generate("orig");
        let executor = MeshIdentity::generate("exec");
        let stranger = MeshIdentity::generate("stranger");
        let registry = assigned(&originator, &executor).await;

        let mut notice = ReceiptAvailable {
            announcement_id: "job-1".into(),
            originator_did: originator.did().clone(),
            executor_did: stranger.did().clone(),
            receipt_ref: Cid::from_bytes(b"r").unwrap(),
            timestamp: Utc::now(),
            signature: Vec::new(),
        };
        assert!(registry.check_receipt_notice(&notice).await.is_err());
        notice.executor_did = executor.did().clone();
        registry.check_receipt_notice(&notice).await.unwrap();
    }

    #[tokio::test]
    async fn failed_receipt_fails_job_with_reason() {
        let originator = MeshIdentity::generate("orig");
        let executor = MeshIdentity::generate("exec");
        let registry = assigned(&originator, &executor).await;
        registry.assignment_delivered("job-1").await.unwrap();

        let params = registry.get("job-1").await.unwrap().announcement.job_params;
        let receipt = receipt(&originator, &executor, &params, CanonicalStatus::Failed);
        let state = registry
            .complete_with_receipt(receipt, Cid::from_bytes(b"r").unwrap())
            .await
            .unwrap();
        assert_eq!(state, OriginatorJobState::Failed);
        let job = registry.get("job-1").await.unwrap();
        assert_eq!(job.failure, Some(FailureReason::ExecutionFailed("timeout".into())));
        assert_eq!(job.canonical_status(), CanonicalStatus::Failed);
        assert!(!registry.expire("job-1").await.unwrap());
    }

    #[tokio::test]
    async fn inconsistent_receipt_is_rejected_and_job_times_out() {
        let originator = MeshIdentity::generate("orig");
        let executor = MeshIdentity::generate("exec");
        let registry = assigned(&originator, &executor).await;
        registry.assignment_delivered("job-1").await.unwrap();

        let mut params = registry.get("job-1").await.unwrap().announcement.job_params;
        params.wasm_ref = Cid::from_bytes(b"other").unwrap();
        let receipt = receipt(&originator, &executor, &params, CanonicalStatus::CompletedSuccessfully);
        assert!(registry
            .complete_with_receipt(receipt, Cid::from_bytes(b"r").unwrap())
            .await
            .is_err());
        assert_eq!(registry.get("job-1").await.unwrap().state, OriginatorJobState::Monitoring);

        assert!(registry.expire("job-1").await.unwrap());
        assert_eq!(registry.get("job-1").await.unwrap().state, OriginatorJobState::TimedOut);
    }

    #[tokio::test]
    async fn stale_status_updates_are_ignored() {
        let originator = MeshIdentity::generate("orig");
        let executor = MeshIdentity::generate("exec");
        let registry = assigned(&originator, &executor).await;
        let update = |status| StatusUpdate {
            announcement_id: "job-1".into(),
            executor_did: executor.did().clone(),
            local_status: status,
            details: None,
            timestamp: Utc::now(),
            signature: Vec::new(),
        };

        assert!(registry.ingest_status(update(LocalJobStatus::Running)).await.unwrap());
        assert!(!registry
            .ingest_status(update(LocalJobStatus::PreparingExecution))
            .await
            .unwrap());
        let job = registry.get("job-1").await.unwrap();
        assert_eq!(job.state, OriginatorJobState::Monitoring);
        assert_eq!(job.last_executor_status(), Some(LocalJobStatus::Running));
        assert_eq!(job.canonical_status(), CanonicalStatus::Running);
    }

    #[tokio::test]
    async fn input_waits_for_a_running_executor() {
        let originator = MeshIdentity::generate("orig");
        let executor = MeshIdentity::generate("exec");
        let registry = assigned(&originator, &executor).await;
        let update = |status| StatusUpdate {
            announcement_id: "job-1".into(),
            executor_did: executor.did().clone(),
            local_status: status,
            details: None,
            timestamp: Utc::now(),
            signature: Vec::new(),
        };
        assert!(!registry.get("job-1").await.unwrap().accepts_interactive_input());

        registry
            .ingest_status(update(LocalJobStatus::PreparingExecution))
            .await
            .unwrap();
        assert!(!registry.get("job-1").await.unwrap().accepts_interactive_input());

        registry.ingest_status(update(LocalJobStatus::Running)).await.unwrap();
        assert!(registry.get("job-1").await.unwrap().accepts_interactive_input());

        registry.ingest_status(update(LocalJobStatus::Completed)).await.unwrap();
        assert!(!registry.get("job-1").await.unwrap().accepts_interactive_input());
    }

    #[tokio::test]
    async fn only_finished_jobs_are_evicted() {
        let originator = MeshIdentity::generate("orig");
        let executor = MeshIdentity::generate("exec");
        let registry = assigned(&originator, &executor).await;
        let before = Utc::now() - Duration::seconds(1);
        assert!(registry.evict_finished(Utc::now()).await.is_empty());

        registry.assignment_delivery_failed("job-1").await.unwrap();
        assert!(registry.evict_finished(before).await.is_empty());
        assert!(registry.contains("job-1").await);

        assert_eq!(registry.evict_finished(Utc::now()).await, vec!["job-1".to_string()]);
        assert!(registry.get("job-1").await.is_none());
    }

    #[tokio::test]
    async fn cancel_and_undeliverable() {
        let originator = MeshIdentity::generate("orig");
        let executor = MeshIdentity::generate("exec");
        let registry = assigned(&originator, &executor).await;
        registry.assignment_delivery_failed("job-1").await.unwrap();
        let job = registry.get("job-1").await.unwrap();
        assert_eq!(job.failure, Some(FailureReason::AssignmentUndeliverable));
        assert!(registry.cancel_job("job-1").await.is_err());

        let (registry, _) = collecting(&originator, None, 10_000).await;
        registry.cancel_job("job-1").await.unwrap();
        let job = registry.get("job-1").await.unwrap();
        assert_eq!(job.canonical_status(), CanonicalStatus::Cancelled);
    }
}
