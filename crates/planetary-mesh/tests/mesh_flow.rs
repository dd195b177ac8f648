//! End-to-end job flows across nodes on an in-memory network.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use icn_config::MeshConfig;
use icn_core_types::{Cid, Did, DidKey};
use planetary_mesh::codec::SignedPayload;
use planetary_mesh::registry::FailureReason;
use planetary_mesh::sandbox::SandboxError;
use planetary_mesh::session::{Direction, SessionEvent};
use planetary_mesh::transport::TransportError;
use planetary_mesh::types::StatusUpdate;
use planetary_mesh::{
    Assignment, Bid, CanonicalStatus, ExecutionFailure, ExecutionSandbox, JobParams, LocalJobStatus,
    MemoryNetwork, MemoryTransport, MeshIdentity, MeshNode, MeshProtocolMessage, MeshTransport, NodeEvent,
    OriginatorJobState, ScriptedSandbox, ScriptedStep,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(10);

fn config(min_price: u64, executor: bool) -> MeshConfig {
    let mut config = MeshConfig::default();
    config.node.executor_enabled = executor;
    config.node.resources = Some(BTreeMap::from([
        ("cpu_cores".to_string(), 8),
        ("memory_mb".to_string(), 4096),
    ]));
    config.execution.min_price = min_price;
    config.bidding.assignment_retry_budget = 2;
    config.bidding.assignment_retry_backoff_ms = 10;
    config.bidding.receipt_grace_secs = 1;
    config.session.max_wait_ms = 200;
    config
}

async fn start(
    network: &MemoryNetwork,
    peer: &str,
    config: MeshConfig,
    sandbox: Arc<dyn ExecutionSandbox>,
) -> MeshNode {
    let (transport, inbound) = network.join(peer);
    MeshNode::builder(MeshIdentity::generate(peer), Arc::new(transport), inbound)
        .config(config)
        .sandbox(sandbox)
        .start()
        .await
        .unwrap()
}

async fn wait_for_capabilities(node: &MeshNode, count: usize) {
    tokio::time::timeout(WAIT, async {
        while node.known_capabilities().await.len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("capabilities never arrived");
}

async fn wait_for_event(
    events: &mut broadcast::Receiver<NodeEvent>,
    matches: impl Fn(&NodeEvent) -> bool,
) -> NodeEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
    })
    .await
    .expect("event never arrived")
}

fn job(max_price: Option<u64>) -> JobParams {
    let mut params = JobParams::new(
        Cid::from_bytes(b"module").unwrap(),
        vec![Cid::from_bytes(b"input-0").unwrap()],
        5,
    );
    params.policy.max_price = max_price;
    params
}

#[tokio::test]
async fn cheapest_eligible_executor_runs_the_job() -> Result<()> {
    let export_dir = tempfile::tempdir()?;
    let network = MemoryNetwork::new();
    let mut originator_config = config(0, false);
    originator_config.execution.receipt_export_dir = Some(export_dir.path().to_path_buf());
    let originator = start(&network, "originator", originator_config, Arc::new(ScriptedSandbox::new())).await;
    let pricey = start(&network, "pricey", config(10, true), Arc::new(ScriptedSandbox::new())).await;
    let cheap = start(&network, "cheap", config(8, true), Arc::new(ScriptedSandbox::new())).await;
    wait_for_capabilities(&originator, 2).await;

    let id = originator
        .submit_job(job(Some(9)), Some(Duration::from_millis(300)))
        .await?;
    let finished = originator.wait_for_job(&id, WAIT).await?;

    assert_eq!(finished.state, OriginatorJobState::Completed);
    assert_eq!(finished.canonical_status(), CanonicalStatus::CompletedSuccessfully);
    assert_eq!(finished.assigned_executor(), Some(cheap.did()));
    assert_eq!(finished.bids.len(), 1);
    let receipt = finished.receipt.expect("receipt recorded");
    assert_eq!(&receipt.executor_did, cheap.did());
    assert_eq!(receipt.output_refs.len(), 1);
    assert_eq!(finished.receipt_ref, Some(receipt.content_ref()?));

    // The pricier executor declined outright
    assert!(pricey.executor_job(&id).await.is_none());
    let executed = cheap.wait_for_execution(&id, WAIT).await?;
    assert_eq!(executed.status, LocalJobStatus::ReceiptAnchored);

    let exported = std::fs::read_to_string(export_dir.path().join(format!("{}.json", id)))?;
    let json: serde_json::Value = serde_json::from_str(&exported)?;
    assert_eq!(json["executor_did"], cheap.did().to_string());

    let metrics = originator.metrics().gather_text()?;
    assert!(metrics.contains("mesh_bids_total"));
    Ok(())
}

#[tokio::test]
async fn zero_bidding_window_fails_without_bids() -> Result<()> {
    let network = MemoryNetwork::new();
    let originator = start(&network, "originator", config(0, false), Arc::new(ScriptedSandbox::new())).await;
    let _executor = start(&network, "executor", config(1, true), Arc::new(ScriptedSandbox::new())).await;
    wait_for_capabilities(&originator, 1).await;

    let id = originator.submit_job(job(None), Some(Duration::ZERO)).await?;
    let finished = originator.wait_for_job(&id, WAIT).await?;

    assert_eq!(finished.state, OriginatorJobState::Failed);
    assert_eq!(finished.failure, Some(FailureReason::NoEligibleBid));
    assert!(finished.assignment.is_none());
    Ok(())
}

#[tokio::test]
async fn sandbox_timeout_produces_failed_receipt() -> Result<()> {
    let network = MemoryNetwork::new();
    let originator = start(&network, "originator", config(0, false), Arc::new(ScriptedSandbox::new())).await;
    let sandbox = ScriptedSandbox::with_script([ScriptedStep::Fail(SandboxError::Timeout)]);
    let executor = start(&network, "executor", config(1, true), Arc::new(sandbox)).await;
    wait_for_capabilities(&originator, 1).await;

    let id = originator
        .submit_job(job(None), Some(Duration::from_millis(200)))
        .await?;
    let finished = originator.wait_for_job(&id, WAIT).await?;

    assert_eq!(finished.state, OriginatorJobState::Failed);
    assert_eq!(finished.canonical_status(), CanonicalStatus::Failed);
    assert_eq!(
        finished.failure,
        Some(FailureReason::ExecutionFailed("timeout".to_string()))
    );
    let receipt = finished.receipt.expect("failed runs still produce receipts");
    assert_eq!(receipt.status, CanonicalStatus::Failed);
    assert_eq!(receipt.failure_reason, Some(ExecutionFailure::Timeout));
    assert!(receipt.output_refs.is_empty());

    let executed = executor.wait_for_execution(&id, WAIT).await?;
    assert_eq!(executed.status, LocalJobStatus::TimedOut);
    Ok(())
}

#[tokio::test]
async fn unreachable_executor_fails_the_assignment() -> Result<()> {
    let network = MemoryNetwork::new();
    let originator = start(&network, "originator", config(0, false), Arc::new(ScriptedSandbox::new())).await;
    let _executor = start(&network, "executor", config(1, true), Arc::new(ScriptedSandbox::new())).await;
    wait_for_capabilities(&originator, 1).await;
    let mut events = originator.subscribe();

    let id = originator
        .submit_job(job(None), Some(Duration::from_millis(300)))
        .await?;
    wait_for_event(&mut events, |e| matches!(e, NodeEvent::BidAccepted { .. })).await;
    network.set_reachable("executor", false);

    let finished = originator.wait_for_job(&id, WAIT).await?;
    assert_eq!(finished.state, OriginatorJobState::Failed);
    assert_eq!(finished.failure, Some(FailureReason::AssignmentUndeliverable));
    Ok(())
}

#[tokio::test]
async fn transient_delivery_failures_are_retried() -> Result<()> {
    let network = MemoryNetwork::new();
    let originator = start(&network, "originator", config(0, false), Arc::new(ScriptedSandbox::new())).await;
    let _executor = start(&network, "executor", config(1, true), Arc::new(ScriptedSandbox::new())).await;
    wait_for_capabilities(&originator, 1).await;
    let mut events = originator.subscribe();

    let id = originator
        .submit_job(job(None), Some(Duration::from_millis(300)))
        .await?;
    wait_for_event(&mut events, |e| matches!(e, NodeEvent::BidAccepted { .. })).await;
    // Within the retry budget of two
    network.fail_next_direct("executor", 2);

    let finished = originator.wait_for_job(&id, WAIT).await?;
    assert_eq!(finished.state, OriginatorJobState::Completed);
    Ok(())
}

#[tokio::test]
async fn cancelled_job_ignores_late_bids() -> Result<()> {
    let network = MemoryNetwork::new();
    let originator = start(&network, "originator", config(0, false), Arc::new(ScriptedSandbox::new())).await;
    let id = originator
        .submit_job(job(None), Some(Duration::from_secs(30)))
        .await?;
    originator.cancel_job(&id).await?;

    let finished = originator.job(&id).await.expect("job tracked");
    assert_eq!(finished.state, OriginatorJobState::Failed);
    assert_eq!(finished.canonical_status(), CanonicalStatus::Cancelled);
    assert!(originator.cancel_job(&id).await.is_err());
    Ok(())
}

#[tokio::test]
async fn assignment_for_another_executor_is_refused() -> Result<()> {
    let network = MemoryNetwork::new();
    let bystander = start(&network, "bystander", config(1, true), Arc::new(ScriptedSandbox::new())).await;
    let mut events = bystander.subscribe();

    let rogue = MeshIdentity::generate("rogue");
    let (rogue_transport, _rogue_inbound) = network.join("rogue");
    let assignment = Assignment {
        announcement_id: "job-elsewhere".into(),
        originator_did: rogue.did().clone(),
        executor_did: MeshIdentity::generate("someone").did().clone(),
        timestamp: Utc::now(),
        signature: Vec::new(),
    }
    .sign_with(&rogue)?;
    rogue_transport
        .send_direct("bystander", MeshProtocolMessage::JobAssignment(assignment).encode()?)
        .await?;

    let rejected = wait_for_event(&mut events, |e| matches!(e, NodeEvent::MessageRejected { .. })).await;
    match rejected {
        NodeEvent::MessageRejected { kind, reason, .. } => {
            assert_eq!(kind, "JobAssignmentV1");
            assert!(reason.contains("wrong recipient"), "{}", reason);
        }
        other => panic!("unexpected {:?}", other),
    }
    // Contextual rejections do not cost trust
    assert_eq!(bystander.trust_score("rogue"), 100);
    Ok(())
}

#[tokio::test]
async fn forged_bid_costs_the_sender_trust() -> Result<()> {
    let network = MemoryNetwork::new();
    let originator = start(&network, "originator", config(0, false), Arc::new(ScriptedSandbox::new())).await;
    let mut events = originator.subscribe();
    let id = originator
        .submit_job(job(None), Some(Duration::from_secs(5)))
        .await?;

    let forger = MeshIdentity::generate("forger");
    let (forger_transport, _forger_inbound) = network.join("forger");
    let mut bid = Bid {
        announcement_id: id.clone(),
        executor_did: forger.did().clone(),
        executor_peer_id: "forger".into(),
        price: Some(1),
        region: None,
        timestamp: Utc::now(),
        signature: Vec::new(),
    }
    .sign_with(&forger)?;
    bid.price = Some(0);
    forger_transport
        .send_direct("originator", MeshProtocolMessage::JobBid(bid).encode()?)
        .await?;

    let rejected = wait_for_event(&mut events, |e| matches!(e, NodeEvent::MessageRejected { .. })).await;
    assert!(matches!(rejected, NodeEvent::MessageRejected { kind: "JobBidV1", .. }));
    assert_eq!(originator.trust_score("forger"), 90);
    assert!(originator.job(&id).await.expect("job").bids.is_empty());
    Ok(())
}

#[tokio::test]
async fn interactive_data_flows_both_ways_in_order() -> Result<()> {
    let network = MemoryNetwork::new();
    let originator = start(&network, "originator", config(0, false), Arc::new(ScriptedSandbox::new())).await;
    let sandbox = ScriptedSandbox::new().with_delay(Duration::from_millis(800));
    let executor = start(&network, "executor", config(1, true), Arc::new(sandbox)).await;
    wait_for_capabilities(&originator, 1).await;
    let mut originator_events = originator.subscribe();
    let mut executor_events = executor.subscribe();

    let mut params = job(None);
    params.interactive = true;
    let id = originator
        .submit_job(params, Some(Duration::from_millis(200)))
        .await?;
    wait_for_event(&mut originator_events, |e| {
        matches!(e, NodeEvent::ExecutorStatus { status: LocalJobStatus::Running, .. })
    })
    .await;

    assert_eq!(originator.send_interactive(&id, b"first".to_vec()).await?, 0);
    assert_eq!(originator.send_interactive(&id, b"second".to_vec()).await?, 1);
    for expected in [b"first".to_vec(), b"second".to_vec()] {
        let event = wait_for_event(&mut executor_events, |e| matches!(e, NodeEvent::Interactive(_))).await;
        match event {
            NodeEvent::Interactive(SessionEvent::Deliver { direction, message }) => {
                assert_eq!(direction, Direction::Input);
                assert_eq!(message.data, expected);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    assert_eq!(executor.send_interactive(&id, b"reply".to_vec()).await?, 0);
    let event = wait_for_event(&mut originator_events, |e| matches!(e, NodeEvent::Interactive(_))).await;
    match event {
        NodeEvent::Interactive(SessionEvent::Deliver { direction, message }) => {
            assert_eq!(direction, Direction::Output);
            assert_eq!(message.data, b"reply".to_vec());
            assert_eq!(&message.sender_did, executor.did());
        }
        other => panic!("unexpected {:?}", other),
    }

    let finished = originator.wait_for_job(&id, WAIT).await?;
    assert_eq!(finished.state, OriginatorJobState::Completed);
    // The stream is closed once the job is over
    assert!(originator.send_interactive(&id, b"late".to_vec()).await.is_err());
    Ok(())
}

#[tokio::test]
async fn non_interactive_jobs_refuse_interactive_traffic() -> Result<()> {
    let network = MemoryNetwork::new();
    let originator = start(&network, "originator", config(0, false), Arc::new(ScriptedSandbox::new())).await;
    let id = originator
        .submit_job(job(None), Some(Duration::from_secs(5)))
        .await?;
    assert!(originator.send_interactive(&id, b"x".to_vec()).await.is_err());
    assert!(originator.send_interactive("unknown", b"x".to_vec()).await.is_err());
    originator.shutdown();
    Ok(())
}

/// Memory transport whose DHT lookups never answer
struct StalledDht(MemoryTransport);

#[async_trait]
impl MeshTransport for StalledDht {
    fn local_peer_id(&self) -> String {
        self.0.local_peer_id()
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.0.subscribe(topic).await
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        self.0.publish(topic, data).await
    }

    async fn send_direct(&self, peer_id: &str, data: Vec<u8>) -> Result<(), TransportError> {
        self.0.send_direct(peer_id, data).await
    }

    async fn dht_put(&self, key: &[u8], value: Vec<u8>) -> Result<(), TransportError> {
        self.0.dht_put(key, value).await
    }

    async fn dht_get(&self, _key: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        futures::future::pending().await
    }

    async fn dht_provide(&self, key: &[u8]) -> Result<(), TransportError> {
        self.0.dht_provide(key).await
    }

    async fn dht_find_providers(&self, key: &[u8]) -> Result<Vec<String>, TransportError> {
        self.0.dht_find_providers(key).await
    }
}

#[tokio::test]
async fn bidding_closes_while_workers_are_stuck() -> Result<()> {
    let network = MemoryNetwork::new();
    let mut originator_config = config(0, false);
    originator_config.workers.count = 1;
    originator_config.workers.queue_depth = 1;
    originator_config.execution.dht_timeout_secs = 60;
    let (transport, inbound) = network.join("originator");
    let originator = MeshNode::builder(
        MeshIdentity::generate("originator"),
        Arc::new(StalledDht(transport)),
        inbound,
    )
    .config(originator_config)
    .start()
    .await?;

    // Each message needs a DID document lookup that never returns, so the
    // only worker hangs and the queue behind it stays full.
    let flooder = MeshIdentity::with_did(Did::parse("did:icn:flooder")?, DidKey::new(), "flooder");
    let (flood_transport, _flood_inbound) = network.join("flooder");
    for n in 0..16 {
        let update = StatusUpdate {
            announcement_id: format!("job-{}", n),
            executor_did: flooder.did().clone(),
            local_status: LocalJobStatus::Running,
            details: None,
            timestamp: Utc::now(),
            signature: Vec::new(),
        }
        .sign_with(&flooder)?;
        flood_transport
            .send_direct("originator", MeshProtocolMessage::JobStatusUpdate(update).encode()?)
            .await?;
    }

    let id = originator
        .submit_job(job(None), Some(Duration::from_millis(100)))
        .await?;
    let finished = originator.wait_for_job(&id, WAIT).await?;
    assert_eq!(finished.state, OriginatorJobState::Failed);
    assert_eq!(finished.failure, Some(FailureReason::NoEligibleBid));
    assert!(originator.metrics().queue_overflow.get() > 0);
    originator.shutdown();
    Ok(())
}

#[tokio::test]
async fn input_is_refused_until_the_executor_runs() -> Result<()> {
    let network = MemoryNetwork::new();
    let mut originator_config = config(0, false);
    originator_config.bidding.assignment_retry_budget = 8;
    originator_config.bidding.assignment_retry_backoff_ms = 100;
    let originator = start(&network, "originator", originator_config, Arc::new(ScriptedSandbox::new())).await;
    // Keep the bid alive while delivery is retried
    let mut executor_config = config(1, true);
    executor_config.bidding.receipt_grace_secs = 5;
    let sandbox = ScriptedSandbox::new().with_delay(Duration::from_millis(800));
    let executor = start(&network, "executor", executor_config, Arc::new(sandbox)).await;
    wait_for_capabilities(&originator, 1).await;
    let mut originator_events = originator.subscribe();
    let mut executor_events = executor.subscribe();

    let mut params = job(None);
    params.interactive = true;
    let id = originator
        .submit_job(params, Some(Duration::from_millis(200)))
        .await?;
    wait_for_event(&mut originator_events, |e| matches!(e, NodeEvent::BidAccepted { .. })).await;
    network.set_reachable("executor", false);

    // Assigned, but the executor has not started
    tokio::time::timeout(WAIT, async {
        while originator.job(&id).await.map(|j| j.state) != Some(OriginatorJobState::Assigned) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    let err = originator.send_interactive(&id, b"early".to_vec()).await.unwrap_err();
    assert!(err.to_string().contains("not accepting interactive traffic"), "{}", err);

    network.set_reachable("executor", true);
    wait_for_event(&mut originator_events, |e| {
        matches!(e, NodeEvent::ExecutorStatus { status: LocalJobStatus::Running, .. })
    })
    .await;

    // The refused send used no sequence number
    assert_eq!(originator.send_interactive(&id, b"first".to_vec()).await?, 0);
    let event = wait_for_event(&mut executor_events, |e| matches!(e, NodeEvent::Interactive(_))).await;
    match event {
        NodeEvent::Interactive(SessionEvent::Deliver { message, .. }) => {
            assert_eq!(message.sequence_number, 0);
            assert_eq!(message.data, b"first".to_vec());
        }
        other => panic!("unexpected {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn finished_jobs_are_dropped_after_retention() -> Result<()> {
    let network = MemoryNetwork::new();
    let mut originator_config = config(0, false);
    originator_config.execution.job_retention_secs = 0;
    let mut executor_config = config(1, true);
    executor_config.execution.job_retention_secs = 0;
    let originator = start(&network, "originator", originator_config, Arc::new(ScriptedSandbox::new())).await;
    let executor = start(&network, "executor", executor_config, Arc::new(ScriptedSandbox::new())).await;
    wait_for_capabilities(&originator, 1).await;
    let mut originator_events = originator.subscribe();
    let mut executor_events = executor.subscribe();

    let id = originator
        .submit_job(job(None), Some(Duration::from_millis(200)))
        .await?;
    // Live jobs are never swept
    assert!(originator.job(&id).await.is_some());

    let finished = wait_for_event(&mut originator_events, |e| matches!(e, NodeEvent::JobFinished { .. })).await;
    assert!(matches!(
        finished,
        NodeEvent::JobFinished { state: OriginatorJobState::Completed, .. }
    ));
    wait_for_event(&mut executor_events, |e| matches!(e, NodeEvent::ExecutionFinished { .. })).await;

    tokio::time::timeout(WAIT, async {
        while originator.job(&id).await.is_some() || !executor.executor_jobs().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;
    assert!(originator.jobs().await.is_empty());
    assert!(executor.executor_job(&id).await.is_none());
    Ok(())
}
