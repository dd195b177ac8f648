#![deny(unsafe_code)]
//! Planetary Mesh - job coordination for the InterCooperative Network
//!
//! Nodes advertise what they can run, originators announce jobs and collect
//! bids, the winning executor runs the job in a sandbox and publishes a
//! signed receipt that the originator fetches and verifies.
//!
//! - [`protocol`]: the versioned wire envelope and its topics
//! - [`registry`]: originator job state and bid selection via [`scheduler`]
//! - [`executor`]: bid decisions, assignment handling and sandbox runs
//! - [`node`]: the network loop and workers tying it all together

pub mod cap_index;
pub mod codec;
pub mod error;
pub mod executor;
pub mod identity;
pub mod lifecycle;
pub mod metrics;
pub mod node;
pub mod protocol;
pub mod receipt;
pub mod registry;
pub mod replay;
pub mod sandbox;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod trust;
pub mod types;

// Re-export common types
pub use cap_index::{CapabilityIndex, CapabilitySelector};
pub use error::{AuthError, MeshError, MeshResult};
pub use identity::{DidResolver, MeshIdentity, SignatureVerifier};
pub use lifecycle::{CanonicalStatus, LocalJobStatus, OriginatorJobState};
pub use node::{MeshNode, MeshNodeBuilder, NodeEvent};
pub use protocol::{MeshProtocolMessage, SignedMessage};
pub use receipt::{ExecutionFailure, ExecutionReceipt};
pub use sandbox::{ExecutionSandbox, ScriptedSandbox, ScriptedStep};
pub use scheduler::Scheduler;
pub use transport::{MemoryNetwork, MemoryTransport, MeshTransport, TransportEvent};
pub use types::{
    Assignment, Bid, ExecutionPolicy, JobAnnouncement, JobParams, NodeCapability, ResourceBudget,
    ResourceKind,
};
