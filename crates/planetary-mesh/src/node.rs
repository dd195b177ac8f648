//! A running mesh node.
//!
//! One network loop decodes inbound traffic onto a bounded work queue that a
//! small worker pool authenticates and dispatches. Timer commands run on their
//! own loop so a saturated queue never delays bidding deadlines or job
//! timeouts. Executions and assignment delivery run as separate tasks and
//! report back through the same registries.

use crate::cap_index::{CapabilityIndex, CapabilitySelector};
use crate::codec::{self, SignedPayload};
use crate::error::{MeshError, MeshResult};
use crate::executor::{
    assemble_receipt, build_capability, decide_bid, execute_with_retries, local_resources,
    AcceptancePolicy, BidDecision, ExecutionRun, ExecutorEngine, ExecutorJob,
};
use crate::identity::{did_document_key, DhtDidResolver, MeshIdentity, SignatureVerifier};
use crate::lifecycle::{CanonicalStatus, LocalJobStatus, OriginatorJobState};
use crate::metrics::MeshMetrics;
use crate::protocol::{regional_topic, MeshProtocolMessage, SignedMessage};
use crate::receipt::{open_receipt, ExecutionFailure, ExecutionReceipt};
use crate::registry::{JobRegistry, OriginatorJob};
use crate::replay::ReplayGuard;
use crate::sandbox::{ExecutionSandbox, ResourceLedger, SandboxRequest, ScriptedSandbox};
use crate::scheduler::Scheduler;
use crate::session::{Direction, SessionEvent, SessionRelay};
use crate::transport::{MeshTransport, TransportEvent};
use crate::trust::{ReputationSource, TrustLedger};
use crate::types::{
    Assignment, Bid, InteractiveMessage, JobAnnouncement, JobParams, NodeCapability, ReceiptAvailable,
    StatusUpdate,
};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use icn_config::MeshConfig;
use icn_core_types::{Cid, Did};
use log::{debug, error, info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1_024;

/// Upper bound on the delay between assignment delivery attempts
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Something an application embedding the node may want to observe
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    JobAnnounced {
        announcement_id: String,
    },
    BidAccepted {
        announcement_id: String,
        executor_did: Did,
        price: Option<u64>,
    },
    BidRejected {
        announcement_id: String,
        executor_did: Did,
        reason: String,
    },
    ExecutorSelected {
        announcement_id: String,
        executor_did: Did,
    },
    /// Progress reported by the executor of one of our jobs
    ExecutorStatus {
        announcement_id: String,
        status: LocalJobStatus,
    },
    /// One of our jobs reached a terminal state
    JobFinished {
        announcement_id: String,
        state: OriginatorJobState,
        status: CanonicalStatus,
    },
    BidSubmitted {
        announcement_id: String,
        price: u64,
    },
    /// This node finished executing a job and published its receipt
    ExecutionFinished {
        announcement_id: String,
        status: CanonicalStatus,
        receipt_ref: Option<Cid>,
    },
    Interactive(SessionEvent),
    MessageRejected {
        peer_id: String,
        kind: &'static str,
        reason: String,
    },
}

#[derive(Debug)]
enum Command {
    CloseBidding(String),
    JobTimeout(String),
    ExpireBid(String),
    Advertise,
    SessionTick,
    Sweep,
}

enum Work {
    Inbound {
        source: String,
        received_at: DateTime<Utc>,
        message: SignedMessage,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TaskKind {
    BiddingClose,
    JobTimeout,
    BidExpiry,
    Delivery,
    Execution,
}

struct NodeInner {
    identity: MeshIdentity,
    config: MeshConfig,
    transport: Arc<dyn MeshTransport>,
    sandbox: Arc<dyn ExecutionSandbox>,
    verifier: SignatureVerifier,
    replay: ReplayGuard,
    trust: TrustLedger,
    capabilities: CapabilityIndex,
    registry: JobRegistry,
    engine: ExecutorEngine,
    scheduler: Scheduler,
    acceptance: AcceptancePolicy,
    ledger: ResourceLedger,
    sessions: Mutex<SessionRelay>,
    metrics: MeshMetrics,
    events: broadcast::Sender<NodeEvent>,
    commands: mpsc::UnboundedSender<Command>,
    job_tasks: std::sync::Mutex<HashMap<(String, TaskKind), JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// Configures and starts a [`MeshNode`]
pub struct MeshNodeBuilder {
    identity: MeshIdentity,
    transport: Arc<dyn MeshTransport>,
    inbound: mpsc::Receiver<TransportEvent>,
    config: MeshConfig,
    sandbox: Arc<dyn ExecutionSandbox>,
    reputation: Option<Arc<dyn ReputationSource>>,
}

impl MeshNodeBuilder {
    pub fn config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }

    pub fn sandbox(mut self, sandbox: Arc<dyn ExecutionSandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Reputation scores used for bid policy checks and ranking
    pub fn reputation(mut self, reputation: Arc<dyn ReputationSource>) -> Self {
        self.reputation = Some(reputation);
        self
    }

    /// Publish the node's DID document if it needs one, subscribe to the
    /// mesh topics and spawn the network loop, workers and tickers.
    pub async fn start(self) -> MeshResult<MeshNode> {
        let MeshNodeBuilder {
            identity,
            transport,
            inbound,
            config,
            sandbox,
            reputation,
        } = self;

        let metrics = MeshMetrics::new().map_err(|e| MeshError::Internal(e.to_string()))?;
        let resolver = Arc::new(DhtDidResolver::new(transport.clone(), config.execution.dht_timeout()));
        resolver.insert(identity.did().clone(), *identity.verifying_key()).await;

        if identity.needs_did_document() {
            let document = identity.did_document()?;
            transport
                .dht_put(&did_document_key(identity.did()), codec::to_canonical(&document)?)
                .await?;
            debug!("Published DID document for {}", identity.did());
        }

        let network = &config.network;
        transport.subscribe(&network.capabilities_topic).await?;
        transport.subscribe(&network.announce_topic).await?;
        transport.subscribe(&network.receipts_topic).await?;
        if let (true, Some(region)) = (network.regional_announce_topics, &config.node.region) {
            transport
                .subscribe(&regional_topic(&network.announce_topic, region))
                .await?;
        }

        let (work_tx, work_rx) = mpsc::channel(config.workers.queue_depth.max(1));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(NodeInner {
            verifier: SignatureVerifier::new(resolver),
            replay: ReplayGuard::new(std::time::Duration::from_secs(config.replay.acceptance_window_secs)),
            trust: TrustLedger::new(),
            capabilities: CapabilityIndex::new(),
            registry: JobRegistry::new(identity.did().clone()),
            engine: ExecutorEngine::new(identity.did().clone()),
            scheduler: Scheduler::new(reputation),
            acceptance: AcceptancePolicy::from_config(&config.execution),
            ledger: ResourceLedger::new(local_resources(&config.node)),
            sessions: Mutex::new(SessionRelay::new(config.session.buffer_limit, config.session.max_wait())),
            metrics,
            events,
            commands,
            job_tasks: std::sync::Mutex::new(HashMap::new()),
            shutdown,
            identity,
            config,
            transport,
            sandbox,
        });

        if let Err(err) = inner.advertise().await {
            warn!("Initial capability advertisement failed: {}", err);
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(network_loop(
            inner.clone(),
            inbound,
            work_tx,
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(command_loop(inner.clone(), command_rx, shutdown_rx)));
        let queue = Arc::new(Mutex::new(work_rx));
        for worker in 0..inner.config.workers.count.max(1) {
            tasks.push(tokio::spawn(worker_loop(inner.clone(), queue.clone(), worker)));
        }
        if inner.config.node.executor_enabled {
            let period = inner.config.advertise.interval().max(Duration::from_secs(1));
            tasks.push(spawn_ticker(inner.commands.clone(), period, || Command::Advertise));
        }
        let tick = (inner.config.session.max_wait() / 2).max(Duration::from_millis(10));
        tasks.push(spawn_ticker(inner.commands.clone(), tick, || Command::SessionTick));
        let sweep = (inner.config.execution.job_retention() / 2)
            .clamp(Duration::from_millis(50), Duration::from_secs(30));
        tasks.push(spawn_ticker(inner.commands.clone(), sweep, || Command::Sweep));

        info!(
            "Mesh node {} started on peer {} (executor {})",
            inner.identity.did(),
            inner.identity.peer_id(),
            if inner.config.node.executor_enabled { "enabled" } else { "disabled" }
        );

        Ok(MeshNode {
            inner,
            tasks: Arc::new(std::sync::Mutex::new(tasks)),
        })
    }
}

/// Handle on a running node. Cheap to clone.
#[derive(Clone)]
pub struct MeshNode {
    inner: Arc<NodeInner>,
    tasks: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl MeshNode {
    pub fn builder(
        identity: MeshIdentity,
        transport: Arc<dyn MeshTransport>,
        inbound: mpsc::Receiver<TransportEvent>,
    ) -> MeshNodeBuilder {
        MeshNodeBuilder {
            identity,
            transport,
            inbound,
            config: MeshConfig::default(),
            sandbox: Arc::new(ScriptedSandbox::new()),
            reputation: None,
        }
    }

    pub fn did(&self) -> &Did {
        self.inner.identity.did()
    }

    pub fn peer_id(&self) -> &str {
        self.inner.identity.peer_id()
    }

    pub fn metrics(&self) -> &MeshMetrics {
        &self.inner.metrics
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// Announce a job and open bidding for `bidding_window`, or the
    /// configured default. Returns the announcement id.
    pub async fn submit_job(&self, params: JobParams, bidding_window: Option<Duration>) -> MeshResult<String> {
        let inner = &self.inner;
        let window = bidding_window.unwrap_or_else(|| inner.config.bidding.default_window());
        let announcement_id = Uuid::new_v4().to_string();
        let matching = inner
            .capabilities
            .filter(&CapabilitySelector::from_job(&params))
            .await
            .len();
        let announcement = JobAnnouncement {
            announcement_id: announcement_id.clone(),
            originator_did: inner.identity.did().clone(),
            originator_peer_id: inner.identity.peer_id().to_string(),
            job_params: params,
            timestamp: Utc::now(),
            bidding_duration_ms: Some(millis(window)),
            signature: Vec::new(),
        }
        .sign_with(&inner.identity)?;
        let regions = announcement.job_params.policy.allowed_regions.clone();
        let bytes = MeshProtocolMessage::JobAnnouncement(announcement.clone()).encode()?;

        inner.registry.insert_draft(announcement).await?;
        inner.registry.mark_announced(&announcement_id).await?;
        inner
            .registry
            .open_bidding(&announcement_id, window, Utc::now())
            .await?;

        if let Err(err) = inner.publish_announcement(bytes, &regions).await {
            error!("Job {}: announcement failed: {}", announcement_id, err);
            inner.registry.cancel_job(&announcement_id).await?;
            inner.finish_job(&announcement_id).await;
            return Err(err);
        }
        info!(
            "Announced job {} with a {:?} bidding window ({} known executors match)",
            announcement_id, window, matching
        );
        inner.emit(NodeEvent::JobAnnounced {
            announcement_id: announcement_id.clone(),
        });
        inner.schedule(
            &announcement_id,
            TaskKind::BiddingClose,
            window,
            Command::CloseBidding(announcement_id.clone()),
        );
        Ok(announcement_id)
    }

    /// Close bidding now instead of waiting for the window to pass.
    pub async fn close_bidding(&self, announcement_id: &str) -> MeshResult<()> {
        self.inner.close_bidding(announcement_id).await
    }

    pub async fn cancel_job(&self, announcement_id: &str) -> MeshResult<()> {
        self.inner.registry.cancel_job(announcement_id).await?;
        self.inner.cancel_task(announcement_id, TaskKind::Delivery);
        info!("Job {} cancelled", announcement_id);
        self.inner.finish_job(announcement_id).await;
        Ok(())
    }

    /// Send interactive data on a running job. The direction follows from
    /// this node's role in the job. Returns the sequence number used.
    pub async fn send_interactive(&self, announcement_id: &str, data: Vec<u8>) -> MeshResult<u64> {
        self.inner.send_interactive(announcement_id, data).await
    }

    pub async fn job(&self, announcement_id: &str) -> Option<OriginatorJob> {
        self.inner.registry.get(announcement_id).await
    }

    pub async fn jobs(&self) -> Vec<OriginatorJob> {
        self.inner.registry.list().await
    }

    pub async fn executor_job(&self, announcement_id: &str) -> Option<ExecutorJob> {
        self.inner.engine.get(announcement_id).await
    }

    /// Jobs this node has bid on or executed and not yet dropped.
    pub async fn executor_jobs(&self) -> Vec<ExecutorJob> {
        self.inner.engine.list().await
    }

    pub async fn known_capabilities(&self) -> Vec<NodeCapability> {
        self.inner.capabilities.list().await
    }

    pub fn trust_score(&self, peer_id: &str) -> i64 {
        self.inner.trust.score(peer_id)
    }

    /// Wait until one of our jobs reaches a terminal state.
    pub async fn wait_for_job(&self, announcement_id: &str, timeout: Duration) -> MeshResult<OriginatorJob> {
        let mut events = self.inner.events.subscribe();
        let deadline = Instant::now() + timeout;
        loop {
            let job = self
                .inner
                .registry
                .get(announcement_id)
                .await
                .ok_or_else(|| MeshError::NotFound(announcement_id.to_string()))?;
            if job.state.is_terminal() {
                return Ok(job);
            }
            if !next_event(&mut events, deadline).await? {
                return Err(MeshError::Timeout(format!("job {} still {}", announcement_id, job.state)));
            }
        }
    }

    /// Wait until this node has finished executing a job, or gave up on it.
    pub async fn wait_for_execution(&self, announcement_id: &str, timeout: Duration) -> MeshResult<ExecutorJob> {
        let mut events = self.inner.events.subscribe();
        let deadline = Instant::now() + timeout;
        loop {
            let job = self
                .inner
                .engine
                .get(announcement_id)
                .await
                .ok_or_else(|| MeshError::NotFound(announcement_id.to_string()))?;
            if job.receipt_ref.is_some() || job.status == LocalJobStatus::Cancelled {
                return Ok(job);
            }
            if !next_event(&mut events, deadline).await? {
                return Err(MeshError::Timeout(format!("execution of {} still {}", announcement_id, job.status)));
            }
        }
    }

    /// Stop the network loop, workers, timers and running executions.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let mut job_tasks = self.inner.job_tasks.lock().unwrap_or_else(|p| p.into_inner());
        for (_, handle) in job_tasks.drain() {
            handle.abort();
        }
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for handle in tasks.drain(..) {
            handle.abort();
        }
        info!("Mesh node {} stopped", self.inner.identity.did());
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Doubled retry delay, capped unless the starting delay was already larger.
fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(MAX_RETRY_BACKOFF.max(current))
}

/// Returns `false` once the deadline passes.
async fn next_event(events: &mut broadcast::Receiver<NodeEvent>, deadline: Instant) -> MeshResult<bool> {
    match tokio::time::timeout_at(deadline, events.recv()).await {
        Err(_) => Ok(false),
        Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => Ok(true),
        Ok(Err(broadcast::error::RecvError::Closed)) => Err(MeshError::Internal("node stopped".to_string())),
    }
}

fn spawn_ticker(
    commands: mpsc::UnboundedSender<Command>,
    period: Duration,
    make: fn() -> Command,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if commands.send(make()).is_err() {
                break;
            }
        }
    })
}

async fn network_loop(
    inner: Arc<NodeInner>,
    mut inbound: mpsc::Receiver<TransportEvent>,
    work: mpsc::Sender<Work>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = inbound.recv() => {
                let Some(event) = event else {
                    info!("Transport closed for {}", inner.identity.peer_id());
                    break;
                };
                let Some(item) = inner.admit(event) else { continue };
                match work.try_send(item) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        inner.metrics.queue_overflow.inc();
                        warn!("Work queue full, dropping inbound message");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        }
    }
    debug!("Network loop for {} exited", inner.identity.peer_id());
}

/// Runs timer commands apart from the inbound work queue.
async fn command_loop(
    inner: Arc<NodeInner>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            command = commands.recv() => {
                let Some(command) = command else { break };
                debug!("Running {:?}", command);
                if let Err(err) = inner.run_command(command).await {
                    warn!("Scheduled command failed: {}", err);
                }
            }
        }
    }
    debug!("Command loop for {} exited", inner.identity.peer_id());
}

async fn worker_loop(inner: Arc<NodeInner>, queue: Arc<Mutex<mpsc::Receiver<Work>>>, worker: usize) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(item) = next else { break };
        match item {
            Work::Inbound {
                source,
                received_at,
                message,
            } => {
                let kind = message.message().kind();
                debug!("Worker {} handling {} from {}", worker, kind, source);
                if let Err(err) = inner.handle_message(&source, received_at, message).await {
                    inner.reject(&source, kind, &err);
                }
            }
        }
    }
}

impl NodeInner {
    fn emit(&self, event: NodeEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Drop traffic from distrusted peers and decode the rest.
    fn admit(&self, event: TransportEvent) -> Option<Work> {
        let (source, data) = match event {
            TransportEvent::Gossip { source, data, .. } => (source, data),
            TransportEvent::Direct { source, data } => (source, data),
        };
        if !self.trust.is_trusted(&source) {
            debug!("Ignoring traffic from distrusted peer {}", source);
            return None;
        }
        match SignedMessage::decode(&data) {
            Ok(message) => Some(Work::Inbound {
                source,
                received_at: Utc::now(),
                message,
            }),
            Err(err) => {
                self.reject(&source, "undecodable", &err);
                None
            }
        }
    }

    fn reject(&self, source: &str, kind: &'static str, err: &MeshError) {
        self.metrics.messages_rejected.with_label_values(&[err.label()]).inc();
        if let MeshError::Authentication(_) = err {
            let score = self.trust.penalize(source);
            warn!("Rejected {} from {}: {} (trust now {})", kind, source, err, score);
        } else {
            debug!("Rejected {} from {}: {}", kind, source, err);
        }
        self.emit(NodeEvent::MessageRejected {
            peer_id: source.to_string(),
            kind,
            reason: err.to_string(),
        });
    }

    async fn handle_message(
        self: &Arc<Self>,
        source: &str,
        received_at: DateTime<Utc>,
        signed: SignedMessage,
    ) -> MeshResult<()> {
        let message = signed.message();
        self.metrics.messages_received.with_label_values(&[message.kind()]).inc();
        self.replay.check_window(message.timestamp(), received_at)?;
        signed.verify(&self.verifier).await?;
        // Interactive streams deduplicate by sequence number instead
        if !message.is_interactive() {
            self.replay.check(message.timestamp(), message.signature(), received_at)?;
        }

        match signed.into_message() {
            MeshProtocolMessage::CapabilityAdvertisement(capability) => {
                self.on_capability(source, capability).await
            }
            MeshProtocolMessage::JobAnnouncement(announcement) => self.on_announcement(announcement).await,
            MeshProtocolMessage::JobBid(bid) => self.on_bid(source, bid, received_at).await,
            MeshProtocolMessage::JobAssignment(assignment) => self.on_assignment(assignment).await,
            MeshProtocolMessage::JobStatusUpdate(update) => self.on_status(update).await,
            MeshProtocolMessage::ExecutionReceiptAvailable(notice) => self.on_receipt_notice(notice).await,
            MeshProtocolMessage::InteractiveInput(message) => self.on_interactive(Direction::Input, message).await,
            MeshProtocolMessage::InteractiveOutput(message) => {
                self.on_interactive(Direction::Output, message).await
            }
        }
    }

    async fn run_command(self: &Arc<Self>, command: Command) -> MeshResult<()> {
        match command {
            Command::CloseBidding(id) => self.close_bidding(&id).await,
            Command::JobTimeout(id) => {
                if self.registry.expire(&id).await? {
                    self.finish_job(&id).await;
                }
                Ok(())
            }
            Command::ExpireBid(id) => {
                self.engine.expire_bid(&id).await;
                self.forget_task(&id, TaskKind::BidExpiry);
                Ok(())
            }
            Command::Advertise => self.advertise().await,
            Command::SessionTick => {
                let events = self.sessions.lock().await.tick(Instant::now());
                for event in events {
                    self.emit(NodeEvent::Interactive(event));
                }
                Ok(())
            }
            Command::Sweep => {
                self.sweep().await;
                Ok(())
            }
        }
    }

    /// Drop jobs that finished longer than the retention period ago, along
    /// with their streams and expired replay digests.
    async fn sweep(&self) {
        let now = Utc::now();
        let Some(cutoff) = chrono::Duration::from_std(self.config.execution.job_retention())
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            return;
        };
        let mut evicted = self.registry.evict_finished(cutoff).await;
        evicted.extend(self.engine.evict_finished(cutoff).await);
        let digests = self.replay.sweep(now);

        let mut sessions = self.sessions.lock().await;
        for id in &evicted {
            sessions.close(id);
        }
        if !evicted.is_empty() || digests > 0 {
            debug!(
                "Dropped {} finished jobs and {} replay digests ({} streams open, {} digests tracked, {} reservations held)",
                evicted.len(),
                digests,
                sessions.open_streams(),
                self.replay.tracked(),
                self.ledger.active_reservations()
            );
        }
    }

    fn schedule(&self, id: &str, kind: TaskKind, delay: Duration, command: Command) {
        let commands = self.commands.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(command);
        });
        self.track(id, kind, handle);
    }

    fn track(&self, id: &str, kind: TaskKind, handle: JoinHandle<()>) {
        let mut tasks = self.job_tasks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = tasks.insert((id.to_string(), kind), handle) {
            previous.abort();
        }
    }

    fn cancel_task(&self, id: &str, kind: TaskKind) {
        let removed = self
            .job_tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(id.to_string(), kind));
        if let Some(handle) = removed {
            handle.abort();
        }
    }

    /// Drop the handle of a task that is finishing on its own.
    fn forget_task(&self, id: &str, kind: TaskKind) {
        self.job_tasks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(id.to_string(), kind));
    }

    async fn send_direct(&self, peer_id: &str, message: &MeshProtocolMessage) -> MeshResult<()> {
        let bytes = message.encode()?;
        self.transport.send_direct(peer_id, bytes).await?;
        Ok(())
    }

    async fn advertise(&self) -> MeshResult<()> {
        if !self.config.node.executor_enabled {
            return Ok(());
        }
        let capability = build_capability(&self.identity, &self.config.node, self.ledger.available())?;
        let bytes = MeshProtocolMessage::CapabilityAdvertisement(capability).encode()?;
        self.transport
            .publish(&self.config.network.capabilities_topic, bytes)
            .await?;
        debug!("Advertised capabilities of {}", self.identity.did());
        Ok(())
    }

    async fn publish_announcement(&self, bytes: Vec<u8>, regions: &[String]) -> MeshResult<()> {
        let network = &self.config.network;
        let mut topics = vec![network.announce_topic.clone()];
        if network.regional_announce_topics {
            topics.extend(regions.iter().map(|r| regional_topic(&network.announce_topic, r)));
        }
        try_join_all(
            topics
                .iter()
                .map(|topic| self.transport.publish(topic, bytes.clone())),
        )
        .await?;
        Ok(())
    }

    /// Cancel a finished job's timers, close its streams and report it.
    async fn finish_job(&self, id: &str) {
        self.cancel_task(id, TaskKind::BiddingClose);
        self.cancel_task(id, TaskKind::JobTimeout);
        self.sessions.lock().await.close(id);
        let Some(job) = self.registry.get(id).await else { return };
        let status = job.canonical_status();
        self.metrics
            .job_outcomes
            .with_label_values(&["originator", &status.to_string()])
            .inc();
        match &job.failure {
            Some(reason) => info!("Job {} finished {} ({})", id, job.state, reason),
            None => info!("Job {} finished {}", id, job.state),
        }
        self.emit(NodeEvent::JobFinished {
            announcement_id: id.to_string(),
            state: job.state,
            status,
        });
    }

    // Originator side

    async fn on_bid(&self, source: &str, bid: Bid, received_at: DateTime<Utc>) -> MeshResult<()> {
        if bid.executor_peer_id != source {
            return Err(MeshError::contextual(format!(
                "bid names peer {} but arrived from {}",
                bid.executor_peer_id, source
            )));
        }
        let capability = self.capabilities.get(&bid.executor_did).await;
        let announcement_id = bid.announcement_id.clone();
        let executor_did = bid.executor_did.clone();
        let price = bid.price;
        match self
            .registry
            .accept_bid(bid, received_at, capability.as_ref(), &self.scheduler)
            .await
        {
            Ok(()) => {
                self.metrics.bids.with_label_values(&["accepted"]).inc();
                self.emit(NodeEvent::BidAccepted {
                    announcement_id,
                    executor_did,
                    price,
                });
                Ok(())
            }
            Err(err) => {
                self.metrics.bids.with_label_values(&["rejected"]).inc();
                self.emit(NodeEvent::BidRejected {
                    announcement_id,
                    executor_did,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn close_bidding(self: &Arc<Self>, id: &str) -> MeshResult<()> {
        self.cancel_task(id, TaskKind::BiddingClose);
        if !self.registry.close_bidding(id).await? {
            return Ok(());
        }
        let capabilities = self.capabilities.snapshot().await;
        let Some(bid) = self.registry.select_executor(id, &self.scheduler, &capabilities).await? else {
            warn!("Job {}: no eligible bid", id);
            self.finish_job(id).await;
            return Ok(());
        };
        info!("Job {}: selected {} at {:?}", id, bid.executor_did, bid.price);
        self.emit(NodeEvent::ExecutorSelected {
            announcement_id: id.to_string(),
            executor_did: bid.executor_did.clone(),
        });

        let assignment = Assignment {
            announcement_id: id.to_string(),
            originator_did: self.identity.did().clone(),
            executor_did: bid.executor_did.clone(),
            timestamp: Utc::now(),
            signature: Vec::new(),
        }
        .sign_with(&self.identity)?;
        self.registry.record_assignment(assignment.clone()).await?;

        let inner = self.clone();
        let handle = tokio::spawn(async move { inner.deliver_assignment(bid, assignment).await });
        self.track(id, TaskKind::Delivery, handle);
        Ok(())
    }

    /// Send the assignment, retrying with exponential backoff. Delivery
    /// starts the job timer; exhausting the budget fails the job.
    async fn deliver_assignment(self: Arc<Self>, bid: Bid, assignment: Assignment) {
        let id = assignment.announcement_id.clone();
        let result = match MeshProtocolMessage::JobAssignment(assignment).encode() {
            Ok(bytes) => self.send_with_retries(&bid.executor_peer_id, &id, bytes).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => match self.registry.assignment_delivered(&id).await {
                Ok(()) => {
                    let job_timeout = self.job_timeout(&id).await + self.config.bidding.receipt_grace();
                    self.schedule(&id, TaskKind::JobTimeout, job_timeout, Command::JobTimeout(id.clone()));
                }
                Err(err) => debug!("Job {}: delivered assignment no longer wanted: {}", id, err),
            },
            Err(err) => {
                error!("Job {}: assignment undeliverable to {}: {}", id, bid.executor_did, err);
                match self.registry.assignment_delivery_failed(&id).await {
                    Ok(()) => self.finish_job(&id).await,
                    Err(e) => debug!("Job {}: {}", id, e),
                }
            }
        }
        self.forget_task(&id, TaskKind::Delivery);
    }

    async fn send_with_retries(&self, peer_id: &str, id: &str, bytes: Vec<u8>) -> MeshResult<()> {
        let budget = self.config.bidding.assignment_retry_budget;
        let mut backoff = self.config.bidding.assignment_retry_backoff();
        let mut attempt = 0;
        loop {
            match self.transport.send_direct(peer_id, bytes.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < budget => {
                    attempt += 1;
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=millis(backoff) / 4));
                    warn!("Job {}: delivery to {} failed ({}), retry {} in {:?}", id, peer_id, err, attempt, backoff);
                    tokio::time::sleep(backoff.saturating_add(jitter)).await;
                    backoff = next_backoff(backoff);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn job_timeout(&self, id: &str) -> Duration {
        let seconds = self
            .registry
            .get(id)
            .await
            .map(|job| job.announcement.job_params.timeout_seconds)
            .unwrap_or(0);
        self.effective_timeout(seconds)
    }

    fn effective_timeout(&self, timeout_seconds: u64) -> Duration {
        if timeout_seconds == 0 {
            Duration::from_secs(self.config.execution.default_timeout_secs)
        } else {
            Duration::from_secs(timeout_seconds)
        }
    }

    async fn on_status(&self, update: StatusUpdate) -> MeshResult<()> {
        let announcement_id = update.announcement_id.clone();
        let status = update.local_status;
        if self.registry.ingest_status(update).await? {
            debug!("Job {}: executor reports {}", announcement_id, status);
            self.emit(NodeEvent::ExecutorStatus { announcement_id, status });
        }
        Ok(())
    }

    async fn on_receipt_notice(&self, notice: ReceiptAvailable) -> MeshResult<()> {
        if &notice.originator_did != self.identity.did() {
            debug!("Observed receipt {} for {}", notice.receipt_ref, notice.announcement_id);
            return Ok(());
        }
        self.registry.check_receipt_notice(&notice).await?;
        // An unusable receipt counts as no receipt; the job timer decides
        let receipt = self.fetch_receipt(&notice.receipt_ref).await.map_err(|err| {
            warn!("Job {}: receipt {} unusable: {}", notice.announcement_id, notice.receipt_ref, err);
            err
        })?;
        if receipt.executor_did != notice.executor_did {
            return Err(MeshError::contextual(format!(
                "receipt {} signed by {}, notice from {}",
                notice.receipt_ref, receipt.executor_did, notice.executor_did
            )));
        }
        let state = self
            .registry
            .complete_with_receipt(receipt.clone(), notice.receipt_ref.clone())
            .await?;
        debug!("Job {}: receipt {} accepted, now {}", notice.announcement_id, notice.receipt_ref, state);
        self.export_receipt(&receipt).await;
        self.finish_job(&notice.announcement_id).await;
        Ok(())
    }

    async fn fetch_receipt(&self, receipt_ref: &Cid) -> MeshResult<ExecutionReceipt> {
        let key = receipt_ref.to_bytes();
        let lookup = tokio::time::timeout(self.config.execution.dht_timeout(), self.transport.dht_get(&key))
            .await
            .map_err(|_| MeshError::Timeout(format!("fetching receipt {}", receipt_ref)))??;
        let Some(bytes) = lookup else {
            let providers = self.transport.dht_find_providers(&key).await.unwrap_or_default();
            return Err(MeshError::NotFound(format!(
                "receipt {} ({} providers known)",
                receipt_ref,
                providers.len()
            )));
        };
        open_receipt(receipt_ref, &bytes, &self.verifier).await
    }

    async fn export_receipt(&self, receipt: &ExecutionReceipt) {
        let Some(dir) = &self.config.execution.receipt_export_dir else { return };
        let path = dir.join(format!("{}.json", receipt.announcement_id));
        let result: MeshResult<()> = async {
            let json = serde_json::to_string_pretty(&receipt.to_json()?)
                .map_err(|e| MeshError::Internal(e.to_string()))?;
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| MeshError::Internal(e.to_string()))?;
            tokio::fs::write(&path, json)
                .await
                .map_err(|e| MeshError::Internal(e.to_string()))
        }
        .await;
        match result {
            Ok(()) => debug!("Exported receipt to {}", path.display()),
            Err(err) => warn!("Could not export receipt to {}: {}", path.display(), err),
        }
    }

    // Executor side

    async fn on_capability(&self, source: &str, capability: NodeCapability) -> MeshResult<()> {
        if capability.peer_id != source {
            return Err(MeshError::contextual(format!(
                "capability names peer {} but arrived from {}",
                capability.peer_id, source
            )));
        }
        let did = capability.node_did.clone();
        if !self.capabilities.upsert(capability).await {
            debug!("Ignoring stale capability advertisement from {}", did);
        }
        Ok(())
    }

    async fn on_announcement(&self, announcement: JobAnnouncement) -> MeshResult<()> {
        if !self.config.node.executor_enabled || &announcement.originator_did == self.identity.did() {
            return Ok(());
        }
        let id = announcement.announcement_id.clone();
        let capability = build_capability(&self.identity, &self.config.node, self.ledger.available())?;
        let running = self.engine.running().await;
        let price = match decide_bid(&announcement, &capability, &self.acceptance, running) {
            BidDecision::Bid { price } => price,
            BidDecision::Decline(reason) => {
                debug!("Not bidding on {}: {:?}", id, reason);
                self.metrics.bids.with_label_values(&["declined"]).inc();
                return Ok(());
            }
        };

        let bid = Bid {
            announcement_id: id.clone(),
            executor_did: self.identity.did().clone(),
            executor_peer_id: self.identity.peer_id().to_string(),
            price: Some(price),
            region: self.config.node.region.clone(),
            timestamp: Utc::now(),
            signature: Vec::new(),
        }
        .sign_with(&self.identity)?;
        let originator_peer = announcement.originator_peer_id.clone();
        let window = announcement
            .bidding_duration_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.bidding.default_window());
        self.engine.record_bid(announcement, bid.clone()).await?;
        self.send_direct(&originator_peer, &MeshProtocolMessage::JobBid(bid)).await?;

        info!("Bid {} on job {}", price, id);
        self.metrics.bids.with_label_values(&["submitted"]).inc();
        self.emit(NodeEvent::BidSubmitted {
            announcement_id: id.clone(),
            price,
        });
        let expiry = window + self.config.bidding.receipt_grace();
        self.schedule(&id, TaskKind::BidExpiry, expiry, Command::ExpireBid(id.clone()));
        Ok(())
    }

    async fn on_assignment(self: &Arc<Self>, assignment: Assignment) -> MeshResult<()> {
        let announcement = self.engine.accept_assignment(&assignment).await?;
        let id = announcement.announcement_id.clone();
        self.cancel_task(&id, TaskKind::BidExpiry);
        let inner = self.clone();
        let handle = tokio::spawn(async move { inner.run_job(announcement).await });
        self.track(&id, TaskKind::Execution, handle);
        Ok(())
    }

    async fn run_job(self: Arc<Self>, announcement: JobAnnouncement) {
        let id = announcement.announcement_id.clone();
        self.metrics.running_executions.inc();
        let timer = self.metrics.execution_seconds.start_timer();
        if let Err(err) = self.execute_and_report(&announcement).await {
            error!("Job {}: execution reporting failed: {}", id, err);
        }
        timer.observe_duration();
        self.metrics.running_executions.dec();
        self.sessions.lock().await.close(&id);
        self.forget_task(&id, TaskKind::Execution);
        // Freed capacity
        if let Err(err) = self.advertise().await {
            debug!("Capability refresh failed: {}", err);
        }
    }

    async fn execute_and_report(&self, announcement: &JobAnnouncement) -> MeshResult<()> {
        let id = &announcement.announcement_id;
        let params = &announcement.job_params;
        self.report_status(announcement, LocalJobStatus::PreparingExecution, None)
            .await;

        let run = match self.ledger.reserve(id, &params.policy.resource_requirements) {
            Err(err) => {
                warn!("Job {}: {}", id, err);
                let now = Utc::now();
                ExecutionRun {
                    result: Err(ExecutionFailure::InsufficientResources(err.to_string())),
                    resource_usage: Default::default(),
                    attempts: 0,
                    started_at: now,
                    ended_at: now,
                }
            }
            Ok(reservation) => {
                self.engine.transition(id, LocalJobStatus::Running).await?;
                self.report_status(announcement, LocalJobStatus::Running, None).await;
                let request = SandboxRequest {
                    announcement_id: id.clone(),
                    wasm_ref: params.wasm_ref.clone(),
                    input_refs: params.input_refs.clone(),
                    policy: params.policy.clone(),
                    budget: params.budget.clone(),
                };
                let timeout = self.effective_timeout(params.timeout_seconds);
                let run = execute_with_retries(
                    self.sandbox.as_ref(),
                    request,
                    params.max_retries,
                    timeout,
                    &self.metrics,
                )
                .await;
                drop(reservation);
                run
            }
        };

        let final_status = run.final_status();
        let succeeded = run.result.is_ok();
        if succeeded {
            self.engine.transition(id, LocalJobStatus::ProducingOutputs).await?;
            self.report_status(announcement, LocalJobStatus::ProducingOutputs, None)
                .await;
        }
        self.engine.transition(id, final_status).await?;
        let details = run.result.as_ref().err().map(|failure| failure.to_string());
        self.report_status(announcement, final_status, details).await;
        self.metrics
            .job_outcomes
            .with_label_values(&["executor", &final_status.canonical().to_string()])
            .inc();

        let receipt = assemble_receipt(announcement, self.identity.did(), &run).sign_with(&self.identity)?;
        let bytes = receipt.encode()?;
        let receipt_ref = Cid::for_dag_cbor(&bytes).map_err(|e| MeshError::Internal(e.to_string()))?;
        self.engine.set_receipt_ref(id, receipt_ref.clone()).await?;
        if succeeded {
            self.engine.transition(id, LocalJobStatus::ReceiptGenerated).await?;
            self.report_status(announcement, LocalJobStatus::ReceiptGenerated, None)
                .await;
        }

        self.anchor_receipt(&receipt_ref, bytes).await?;
        if succeeded {
            self.engine.transition(id, LocalJobStatus::ReceiptAnchored).await?;
            self.report_status(announcement, LocalJobStatus::ReceiptAnchored, None)
                .await;
        }

        let notice = ReceiptAvailable {
            announcement_id: id.clone(),
            originator_did: announcement.originator_did.clone(),
            executor_did: self.identity.did().clone(),
            receipt_ref: receipt_ref.clone(),
            timestamp: Utc::now(),
            signature: Vec::new(),
        }
        .sign_with(&self.identity)?;
        let message = MeshProtocolMessage::ExecutionReceiptAvailable(notice);
        if let Err(err) = self.send_direct(&announcement.originator_peer_id, &message).await {
            warn!("Job {}: receipt notice not delivered: {}", id, err);
        }
        if self.config.network.broadcast_receipts {
            self.transport
                .publish(&self.config.network.receipts_topic, message.encode()?)
                .await?;
        }

        info!("Job {} finished {} with receipt {}", id, final_status, receipt_ref);
        self.emit(NodeEvent::ExecutionFinished {
            announcement_id: id.clone(),
            status: receipt.status,
            receipt_ref: Some(receipt_ref),
        });
        Ok(())
    }

    async fn anchor_receipt(&self, receipt_ref: &Cid, bytes: Vec<u8>) -> MeshResult<()> {
        let key = receipt_ref.to_bytes();
        let timeout = self.config.execution.dht_timeout();
        tokio::time::timeout(timeout, self.transport.dht_put(&key, bytes))
            .await
            .map_err(|_| MeshError::Timeout(format!("storing receipt {}", receipt_ref)))??;
        tokio::time::timeout(timeout, self.transport.dht_provide(&key))
            .await
            .map_err(|_| MeshError::Timeout(format!("providing receipt {}", receipt_ref)))??;
        Ok(())
    }

    async fn report_status(&self, announcement: &JobAnnouncement, status: LocalJobStatus, details: Option<String>) {
        let update = StatusUpdate {
            announcement_id: announcement.announcement_id.clone(),
            executor_did: self.identity.did().clone(),
            local_status: status,
            details,
            timestamp: Utc::now(),
            signature: Vec::new(),
        };
        let result = match update.sign_with(&self.identity) {
            Ok(update) => {
                self.send_direct(
                    &announcement.originator_peer_id,
                    &MeshProtocolMessage::JobStatusUpdate(update),
                )
                .await
            }
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!("Job {}: status {} not reported: {}", announcement.announcement_id, status, err);
        }
    }

    // Interactive streams

    async fn on_interactive(&self, direction: Direction, message: InteractiveMessage) -> MeshResult<()> {
        if &message.recipient_did != self.identity.did() {
            return Err(MeshError::contextual(format!(
                "interactive message for {} delivered to {}",
                message.recipient_did,
                self.identity.did()
            )));
        }
        let id = message.announcement_id.as_str();
        match direction {
            Direction::Input => {
                let job = self
                    .engine
                    .get(id)
                    .await
                    .ok_or_else(|| MeshError::contextual(format!("input for unknown job {}", id)))?;
                if job.announcement.originator_did != message.sender_did {
                    return Err(MeshError::contextual(format!("input for {} from {}", id, message.sender_did)));
                }
                check_interactive(&job.announcement, job.status.is_interactive_window())?;
            }
            Direction::Output => {
                let job = self
                    .registry
                    .get(id)
                    .await
                    .ok_or_else(|| MeshError::contextual(format!("output for unknown job {}", id)))?;
                if job.assigned_executor() != Some(&message.sender_did) {
                    return Err(MeshError::contextual(format!("output for {} from {}", id, message.sender_did)));
                }
                let open = matches!(job.state, OriginatorJobState::Assigned | OriginatorJobState::Monitoring);
                check_interactive(&job.announcement, open)?;
            }
        }
        let events = self
            .sessions
            .lock()
            .await
            .receive(direction, message, Instant::now());
        for event in events {
            self.emit(NodeEvent::Interactive(event));
        }
        Ok(())
    }

    async fn send_interactive(&self, announcement_id: &str, data: Vec<u8>) -> MeshResult<u64> {
        let (direction, recipient_did, peer_id) = if let Some(job) = self.registry.get(announcement_id).await {
            check_interactive(&job.announcement, job.accepts_interactive_input())?;
            let selected = job
                .selected
                .ok_or_else(|| MeshError::contextual(format!("{} has no executor", announcement_id)))?;
            (Direction::Input, selected.executor_did, selected.executor_peer_id)
        } else if let Some(job) = self.engine.get(announcement_id).await {
            check_interactive(&job.announcement, job.status.is_interactive_window())?;
            (
                Direction::Output,
                job.announcement.originator_did,
                job.announcement.originator_peer_id,
            )
        } else {
            return Err(MeshError::NotFound(announcement_id.to_string()));
        };

        let sequence_number = self.sessions.lock().await.next_sequence(announcement_id, direction);
        let message = InteractiveMessage {
            announcement_id: announcement_id.to_string(),
            sender_did: self.identity.did().clone(),
            recipient_did,
            message_id: Uuid::new_v4().to_string(),
            sequence_number,
            data,
            timestamp: Utc::now(),
            signature: Vec::new(),
        }
        .sign_with(&self.identity)?;
        let wire = match direction {
            Direction::Input => MeshProtocolMessage::InteractiveInput(message),
            Direction::Output => MeshProtocolMessage::InteractiveOutput(message),
        };
        self.send_direct(&peer_id, &wire).await?;
        Ok(sequence_number)
    }
}

fn check_interactive(announcement: &JobAnnouncement, window_open: bool) -> MeshResult<()> {
    if !announcement.job_params.interactive {
        return Err(MeshError::contextual(format!(
            "job {} is not interactive",
            announcement.announcement_id
        )));
    }
    if !window_open {
        return Err(MeshError::contextual(format!(
            "job {} is not accepting interactive traffic",
            announcement.announcement_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_doubles_up_to_the_cap() {
        assert_eq!(next_backoff(Duration::from_millis(250)), Duration::from_millis(500));
        assert_eq!(next_backoff(Duration::from_secs(45)), MAX_RETRY_BACKOFF);
        assert_eq!(next_backoff(MAX_RETRY_BACKOFF), MAX_RETRY_BACKOFF);
        // A configured start above the cap is kept, never doubled
        assert_eq!(next_backoff(Duration::from_secs(600)), Duration::from_secs(600));
        assert_eq!(next_backoff(Duration::MAX), Duration::MAX);

        let mut backoff = Duration::from_millis(1);
        for _ in 0..200 {
            backoff = next_backoff(backoff);
        }
        assert_eq!(backoff, MAX_RETRY_BACKOFF);
    }

    #[test]
    fn oversized_durations_saturate_to_u64_millis() {
        assert_eq!(millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
