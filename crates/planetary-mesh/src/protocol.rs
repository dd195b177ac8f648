//! Wire envelope for every mesh message.
//!
//! Each variant is tagged with a versioned name (`JobBidV1`, ...). A change
//! that old decoders cannot read gets a new variant with the next suffix;
//! optional fields may be added to an existing version.

use crate::codec::{self, SignedPayload};
use crate::error::{MeshError, MeshResult};
use crate::identity::SignatureVerifier;
use crate::types::{
    Assignment, Bid, InteractiveMessage, JobAnnouncement, NodeCapability, ReceiptAvailable,
    StatusUpdate,
};
use chrono::{DateTime, Utc};
use icn_core_types::Did;
use ipld_core::ipld::Ipld;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CAPABILITIES_TOPIC: &str = "capabilities";
pub const JOBS_ANNOUNCE_TOPIC: &str = "jobs.announce";
pub const RECEIPTS_TOPIC: &str = "receipts.available";

/// Announce topic scoped to one region, e.g. `jobs.announce.eu-west`.
pub fn regional_topic(base: &str, region: &str) -> String {
    format!("{}.{}", base, region)
}

/// How a message kind travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Broadcast,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeshProtocolMessage {
    #[serde(rename = "CapabilityAdvertisementV1")]
    CapabilityAdvertisement(NodeCapability),
    #[serde(rename = "JobAnnouncementV1")]
    JobAnnouncement(JobAnnouncement),
    #[serde(rename = "JobBidV1")]
    JobBid(Bid),
    #[serde(rename = "JobAssignmentV1")]
    JobAssignment(Assignment),
    #[serde(rename = "JobStatusUpdateV1")]
    JobStatusUpdate(StatusUpdate),
    #[serde(rename = "ExecutionReceiptAvailableV1")]
    ExecutionReceiptAvailable(ReceiptAvailable),
    /// Originator to executor
    #[serde(rename = "InteractiveInputV1")]
    InteractiveInput(InteractiveMessage),
    /// Executor to originator
    #[serde(rename = "InteractiveOutputV1")]
    InteractiveOutput(InteractiveMessage),
}

impl MeshProtocolMessage {
    pub fn encode(&self) -> MeshResult<Vec<u8>> {
        codec::to_canonical(self)
    }

    pub fn decode(bytes: &[u8]) -> MeshResult<Self> {
        codec::from_canonical(bytes)
    }

    /// Versioned wire name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            MeshProtocolMessage::CapabilityAdvertisement(_) => "CapabilityAdvertisementV1",
            MeshProtocolMessage::JobAnnouncement(_) => "JobAnnouncementV1",
            MeshProtocolMessage::JobBid(_) => "JobBidV1",
            MeshProtocolMessage::JobAssignment(_) => "JobAssignmentV1",
            MeshProtocolMessage::JobStatusUpdate(_) => "JobStatusUpdateV1",
            MeshProtocolMessage::ExecutionReceiptAvailable(_) => "ExecutionReceiptAvailableV1",
            MeshProtocolMessage::InteractiveInput(_) => "InteractiveInputV1",
            MeshProtocolMessage::InteractiveOutput(_) => "InteractiveOutputV1",
        }
    }

    /// Schema name the inner message is signed under. Both interactive
    /// directions share one.
    pub fn signing_schema(&self) -> &'static str {
        match self {
            MeshProtocolMessage::CapabilityAdvertisement(_) => NodeCapability::SCHEMA,
            MeshProtocolMessage::JobAnnouncement(_) => JobAnnouncement::SCHEMA,
            MeshProtocolMessage::JobBid(_) => Bid::SCHEMA,
            MeshProtocolMessage::JobAssignment(_) => Assignment::SCHEMA,
            MeshProtocolMessage::JobStatusUpdate(_) => StatusUpdate::SCHEMA,
            MeshProtocolMessage::ExecutionReceiptAvailable(_) => ReceiptAvailable::SCHEMA,
            MeshProtocolMessage::InteractiveInput(_) | MeshProtocolMessage::InteractiveOutput(_) => {
                InteractiveMessage::SCHEMA
            }
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            MeshProtocolMessage::CapabilityAdvertisement(_) | MeshProtocolMessage::JobAnnouncement(_) => {
                Channel::Broadcast
            }
            _ => Channel::Direct,
        }
    }

    /// Join key; capability advertisements belong to no job.
    pub fn announcement_id(&self) -> Option<&str> {
        match self {
            MeshProtocolMessage::CapabilityAdvertisement(_) => None,
            MeshProtocolMessage::JobAnnouncement(m) => Some(&m.announcement_id),
            MeshProtocolMessage::JobBid(m) => Some(&m.announcement_id),
            MeshProtocolMessage::JobAssignment(m) => Some(&m.announcement_id),
            MeshProtocolMessage::JobStatusUpdate(m) => Some(&m.announcement_id),
            MeshProtocolMessage::ExecutionReceiptAvailable(m) => Some(&m.announcement_id),
            MeshProtocolMessage::InteractiveInput(m) | MeshProtocolMessage::InteractiveOutput(m) => {
                Some(&m.announcement_id)
            }
        }
    }

    pub fn signer(&self) -> &Did {
        match self {
            MeshProtocolMessage::CapabilityAdvertisement(m) => m.signer(),
            MeshProtocolMessage::JobAnnouncement(m) => m.signer(),
            MeshProtocolMessage::JobBid(m) => m.signer(),
            MeshProtocolMessage::JobAssignment(m) => m.signer(),
            MeshProtocolMessage::JobStatusUpdate(m) => m.signer(),
            MeshProtocolMessage::ExecutionReceiptAvailable(m) => m.signer(),
            MeshProtocolMessage::InteractiveInput(m) | MeshProtocolMessage::InteractiveOutput(m) => {
                m.signer()
            }
        }
    }

    pub fn signature(&self) -> &[u8] {
        match self {
            MeshProtocolMessage::CapabilityAdvertisement(m) => m.signature(),
            MeshProtocolMessage::JobAnnouncement(m) => m.signature(),
            MeshProtocolMessage::JobBid(m) => m.signature(),
            MeshProtocolMessage::JobAssignment(m) => m.signature(),
            MeshProtocolMessage::JobStatusUpdate(m) => m.signature(),
            MeshProtocolMessage::ExecutionReceiptAvailable(m) => m.signature(),
            MeshProtocolMessage::InteractiveInput(m) | MeshProtocolMessage::InteractiveOutput(m) => {
                m.signature()
            }
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            MeshProtocolMessage::CapabilityAdvertisement(m) => m.timestamp,
            MeshProtocolMessage::JobAnnouncement(m) => m.timestamp,
            MeshProtocolMessage::JobBid(m) => m.timestamp,
            MeshProtocolMessage::JobAssignment(m) => m.timestamp,
            MeshProtocolMessage::JobStatusUpdate(m) => m.timestamp,
            MeshProtocolMessage::ExecutionReceiptAvailable(m) => m.timestamp,
            MeshProtocolMessage::InteractiveInput(m) | MeshProtocolMessage::InteractiveOutput(m) => {
                m.timestamp
            }
        }
    }

    pub fn is_interactive(&self) -> bool {
        matches!(
            self,
            MeshProtocolMessage::InteractiveInput(_) | MeshProtocolMessage::InteractiveOutput(_)
        )
    }
}

/// A received message together with the bytes its signature covers, rebuilt
/// from the body as it arrived. Fields unknown to this build stay covered.
///
/// Inbound messages are only ever verified through this type; re-encoding the
/// decoded value would drop such fields.
#[derive(Debug, Clone)]
pub struct SignedMessage {
    message: MeshProtocolMessage,
    signed_bytes: Vec<u8>,
}

impl SignedMessage {
    pub fn decode(bytes: &[u8]) -> MeshResult<Self> {
        let message = MeshProtocolMessage::decode(bytes)?;
        let mut envelope: BTreeMap<String, Ipld> = codec::from_canonical(bytes)?;
        let body = envelope
            .remove(message.kind())
            .ok_or_else(|| MeshError::Malformed(format!("{} envelope without a body", message.kind())))?;
        let signed_bytes = codec::signing_bytes_of(message.signing_schema(), body)?;
        Ok(Self { message, signed_bytes })
    }

    pub fn message(&self) -> &MeshProtocolMessage {
        &self.message
    }

    pub fn into_message(self) -> MeshProtocolMessage {
        self.message
    }

    pub async fn verify(&self, verifier: &SignatureVerifier) -> MeshResult<()> {
        verifier
            .verify_signed(
                self.message.signing_schema(),
                self.message.signer(),
                &self.signed_bytes,
                self.message.signature(),
            )
            .await
    }
}
