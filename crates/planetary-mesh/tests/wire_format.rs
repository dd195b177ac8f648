//! Wire compatibility of the protocol envelope.

use chrono::{DateTime, Utc};
use icn_core_types::{Cid, Did};
use planetary_mesh::codec::{self, SignedPayload};
use planetary_mesh::identity::DidKeyResolver;
use planetary_mesh::protocol::Channel;
use planetary_mesh::types::{InteractiveMessage, ReceiptAvailable, StatusUpdate};
use planetary_mesh::{
    Assignment, Bid, JobAnnouncement, JobParams, LocalJobStatus, MeshError, MeshIdentity,
    MeshProtocolMessage, NodeCapability, ResourceKind, SignatureVerifier, SignedMessage,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

fn cid(seed: &str) -> Cid {
    Cid::from_bytes(seed.as_bytes()).unwrap()
}

/// One instance of every variant with optional fields left empty.
fn minimal_messages(identity: &MeshIdentity) -> Vec<MeshProtocolMessage> {
    let did = identity.did().clone();
    let now = Utc::now();
    let interactive = InteractiveMessage {
        announcement_id: "job-1".into(),
        sender_did: did.clone(),
        recipient_did: did.clone(),
        message_id: "m-0".into(),
        sequence_number: 0,
        data: Vec::new(),
        timestamp: now,
        signature: Vec::new(),
    }
    .sign_with(identity)
    .unwrap();
    vec![
        MeshProtocolMessage::CapabilityAdvertisement(
            NodeCapability {
                node_did: did.clone(),
                peer_id: "peer".into(),
                alias: None,
                region: None,
                supported_runtimes: Vec::new(),
                available_resources: BTreeMap::new(),
                specialized_features: Vec::new(),
                timestamp: now,
                attestation_ref: None,
                signature: Vec::new(),
            }
            .sign_with(identity)
            .unwrap(),
        ),
        MeshProtocolMessage::JobAnnouncement(
            JobAnnouncement {
                announcement_id: "job-1".into(),
                originator_did: did.clone(),
                originator_peer_id: "peer".into(),
                job_params: JobParams::new(cid("module"), Vec::new(), 0),
                timestamp: now,
                bidding_duration_ms: None,
                signature: Vec::new(),
            }
            .sign_with(identity)
            .unwrap(),
        ),
        MeshProtocolMessage::JobBid(
            Bid {
                announcement_id: "job-1".into(),
                executor_did: did.clone(),
                executor_peer_id: "peer".into(),
                price: None,
                region: None,
                timestamp: now,
                signature: Vec::new(),
            }
            .sign_with(identity)
            .unwrap(),
        ),
        MeshProtocolMessage::JobAssignment(
            Assignment {
                announcement_id: "job-1".into(),
                originator_did: did.clone(),
                executor_did: did.clone(),
                timestamp: now,
                signature: Vec::new(),
            }
            .sign_with(identity)
            .unwrap(),
        ),
        MeshProtocolMessage::JobStatusUpdate(
            StatusUpdate {
                announcement_id: "job-1".into(),
                executor_did: did.clone(),
                local_status: LocalJobStatus::AwaitingInputs,
                details: None,
                timestamp: now,
                signature: Vec::new(),
            }
            .sign_with(identity)
            .unwrap(),
        ),
        MeshProtocolMessage::ExecutionReceiptAvailable(
            ReceiptAvailable {
                announcement_id: "job-1".into(),
                originator_did: did.clone(),
                executor_did: did,
                receipt_ref: cid("receipt"),
                timestamp: now,
                signature: Vec::new(),
            }
            .sign_with(identity)
            .unwrap(),
        ),
        MeshProtocolMessage::InteractiveInput(interactive.clone()),
        MeshProtocolMessage::InteractiveOutput(interactive),
    ]
}

#[test]
fn every_variant_survives_the_wire() {
    let identity = MeshIdentity::generate("peer");
    let messages = minimal_messages(&identity);
    let kinds: Vec<_> = messages.iter().map(|m| m.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            "CapabilityAdvertisementV1",
            "JobAnnouncementV1",
            "JobBidV1",
            "JobAssignmentV1",
            "JobStatusUpdateV1",
            "ExecutionReceiptAvailableV1",
            "InteractiveInputV1",
            "InteractiveOutputV1",
        ]
    );
    for message in messages {
        let decoded = MeshProtocolMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.signer(), identity.did());
    }
}

#[test]
fn broadcast_and_direct_channels() {
    let identity = MeshIdentity::generate("peer");
    let broadcast: Vec<_> = minimal_messages(&identity)
        .into_iter()
        .filter(|m| m.channel() == Channel::Broadcast)
        .map(|m| m.kind())
        .collect();
    assert_eq!(broadcast, vec!["CapabilityAdvertisementV1", "JobAnnouncementV1"]);
}

#[test]
fn populated_optional_fields_round_trip() {
    let identity = MeshIdentity::generate("peer");
    let mut params = JobParams::new(cid("module"), vec![cid("a"), cid("b")], 30);
    params.policy.allowed_regions = vec!["eu-west".into(), "us-east".into()];
    params.policy.max_price = Some(9);
    params.policy.min_reputation = Some(50);
    params
        .policy
        .resource_requirements
        .insert(ResourceKind::Other("tpu".into()), 2);
    params.budget.max_fuel = Some(1_000_000);
    params.required_runtime = Some("wasm".into());
    params.required_features = vec!["sgx".into()];
    params.interactive = true;
    let announcement = JobAnnouncement {
        announcement_id: "job-2".into(),
        originator_did: identity.did().clone(),
        originator_peer_id: "peer".into(),
        job_params: params,
        timestamp: Utc::now(),
        bidding_duration_ms: Some(1_500),
        signature: Vec::new(),
    }
    .sign_with(&identity)
    .unwrap();
    let message = MeshProtocolMessage::JobAnnouncement(announcement);
    assert_eq!(MeshProtocolMessage::decode(&message.encode().unwrap()).unwrap(), message);
}

/// A bid as a newer peer might send it
#[derive(Serialize, Clone)]
struct FutureBid {
    announcement_id: String,
    executor_did: Did,
    executor_peer_id: String,
    price: Option<u64>,
    timestamp: DateTime<Utc>,
    #[serde(with = "serde_bytes")]
    signature: Vec<u8>,
    energy_source: String,
}

impl SignedPayload for FutureBid {
    const SCHEMA: &'static str = "JobBidV1";

    fn signer(&self) -> &Did {
        &self.executor_did
    }

    fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn signature_mut(&mut self) -> &mut Vec<u8> {
        &mut self.signature
    }
}

/// A bid missing its executor
#[derive(Serialize)]
struct TruncatedBid {
    announcement_id: String,
    executor_peer_id: String,
    timestamp: DateTime<Utc>,
    #[serde(with = "serde_bytes")]
    signature: Vec<u8>,
}

#[derive(Serialize)]
enum Envelope<T> {
    #[serde(rename = "JobBidV1")]
    JobBid(T),
}

#[tokio::test]
async fn unknown_fields_are_ignored_but_still_signed() {
    let identity = MeshIdentity::generate("peer");
    let verifier = SignatureVerifier::new(Arc::new(DidKeyResolver));
    let bid = FutureBid {
        announcement_id: "job-1".into(),
        executor_did: identity.did().clone(),
        executor_peer_id: "peer".into(),
        price: Some(3),
        timestamp: Utc::now(),
        signature: Vec::new(),
        energy_source: "solar".into(),
    }
    .sign_with(&identity)
    .unwrap();
    let bytes = codec::to_canonical(&Envelope::JobBid(bid.clone())).unwrap();

    let received = SignedMessage::decode(&bytes).unwrap();
    received.verify(&verifier).await.unwrap();
    match received.into_message() {
        MeshProtocolMessage::JobBid(decoded) => {
            assert_eq!(decoded.price, Some(3));
            assert_eq!(decoded.region, None);
            assert_eq!(decoded.signature, bid.signature);
        }
        other => panic!("decoded as {}", other.kind()),
    }

    // The field this build drops is still covered by the signature
    let mut tampered = bid;
    tampered.energy_source = "coal".into();
    let bytes = codec::to_canonical(&Envelope::JobBid(tampered)).unwrap();
    let received = SignedMessage::decode(&bytes).unwrap();
    assert!(matches!(
        received.verify(&verifier).await,
        Err(MeshError::Authentication(_))
    ));
}

#[test]
fn missing_required_field_is_malformed() {
    let bytes = codec::to_canonical(&Envelope::JobBid(TruncatedBid {
        announcement_id: "job-1".into(),
        executor_peer_id: "peer".into(),
        timestamp: Utc::now(),
        signature: Vec::new(),
    }))
    .unwrap();
    assert!(matches!(MeshProtocolMessage::decode(&bytes), Err(MeshError::Malformed(_))));
    assert!(matches!(
        MeshProtocolMessage::decode(b"not cbor at all"),
        Err(MeshError::Malformed(_))
    ));
}
