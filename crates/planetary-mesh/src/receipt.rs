//! Signed, content-addressed record of one job execution.

use crate::codec;
use crate::error::{MeshError, MeshResult};
use crate::identity::SignatureVerifier;
use crate::lifecycle::CanonicalStatus;
use crate::sandbox::{ResourceUsage, SandboxError};
use crate::types::JobParams;
use chrono::{DateTime, Utc};
use icn_core_types::cid_model::DAG_CBOR_CODEC;
use icn_core_types::{Cid, Did};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

/// Why an execution did not complete successfully
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionFailure {
    Timeout,
    ResourceExceeded(String),
    RuntimeTrap(String),
    InputUnavailable(String),
    /// The guest ran to completion but reported failure
    NonZeroExit { code: i32, message: String },
    /// Usage reported by the sandbox exceeds the job budget
    BudgetExceeded(String),
    /// Local resources could not be reserved
    InsufficientResources(String),
    Cancelled,
}

impl From<SandboxError> for ExecutionFailure {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Timeout => ExecutionFailure::Timeout,
            SandboxError::ResourceExceeded(m) => ExecutionFailure::ResourceExceeded(m),
            SandboxError::RuntimeTrap(m) => ExecutionFailure::RuntimeTrap(m),
            SandboxError::InputUnavailable(m) => ExecutionFailure::InputUnavailable(m),
        }
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionFailure::Timeout => write!(f, "timeout"),
            ExecutionFailure::ResourceExceeded(m) => write!(f, "resource exceeded: {}", m),
            ExecutionFailure::RuntimeTrap(m) => write!(f, "runtime trap: {}", m),
            ExecutionFailure::InputUnavailable(m) => write!(f, "input unavailable: {}", m),
            ExecutionFailure::NonZeroExit { code, message } => write!(f, "exit {}: {}", code, message),
            ExecutionFailure::BudgetExceeded(m) => write!(f, "budget exceeded: {}", m),
            ExecutionFailure::InsufficientResources(m) => write!(f, "insufficient resources: {}", m),
            ExecutionFailure::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReceipt {
    pub announcement_id: String,
    pub originator_did: Did,
    pub executor_did: Did,
    /// Copy of the announced parameters the executor ran against
    pub job_params: JobParams,
    pub resource_usage: ResourceUsage,
    pub output_refs: Vec<Cid>,
    pub status: CanonicalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<ExecutionFailure>,
    /// Sandbox invocations, including retries
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl ExecutionReceipt {
    /// Canonical encoding of the signed receipt; the bytes stored in the DHT.
    pub fn encode(&self) -> MeshResult<Vec<u8>> {
        codec::to_canonical(self)
    }

    /// DAG-CBOR CID over the signed encoding.
    pub fn content_ref(&self) -> MeshResult<Cid> {
        let bytes = self.encode()?;
        Cid::for_dag_cbor(&bytes).map_err(|e| MeshError::Malformed(e.to_string()))
    }

    /// Check the receipt describes the job the originator announced and
    /// assigned, and that its outcome fields are coherent.
    pub fn check_consistency(
        &self,
        announcement_id: &str,
        params: &JobParams,
        originator: &Did,
        executor: &Did,
    ) -> MeshResult<()> {
        if self.announcement_id != announcement_id {
            return Err(MeshError::contextual(format!(
                "receipt is for {}, expected {}",
                self.announcement_id, announcement_id
            )));
        }
        if &self.originator_did != originator || &self.executor_did != executor {
            return Err(MeshError::contextual(format!(
                "receipt parties {} / {} do not match assignment",
                self.originator_did, self.executor_did
            )));
        }
        if self.job_params.wasm_ref != params.wasm_ref
            || self.job_params.input_refs != params.input_refs
            || self.job_params.budget != params.budget
        {
            return Err(MeshError::contextual(
                "receipt job parameters differ from the announcement",
            ));
        }
        if self.ended_at < self.started_at {
            return Err(MeshError::Malformed("receipt ends before it starts".into()));
        }
        match self.status {
            CanonicalStatus::CompletedSuccessfully => {
                if self.failure_reason.is_some() {
                    return Err(MeshError::Malformed(
                        "successful receipt carries a failure reason".into(),
                    ));
                }
                params
                    .budget
                    .admits(&self.resource_usage)
                    .map_err(MeshError::PolicyViolation)
            }
            CanonicalStatus::Failed | CanonicalStatus::Cancelled => Ok(()),
            CanonicalStatus::Pending | CanonicalStatus::Running => Err(MeshError::Malformed(format!(
                "receipt with non-final status {}",
                self.status
            ))),
        }
    }

    /// Human-readable export form.
    pub fn to_json(&self) -> MeshResult<serde_json::Value> {
        Ok(json!({
            "receipt_ref": self.content_ref()?.to_string(),
            "announcement_id": self.announcement_id,
            "originator_did": self.originator_did.as_str(),
            "executor_did": self.executor_did.as_str(),
            "wasm_ref": self.job_params.wasm_ref.to_string(),
            "input_refs": self.job_params.input_refs.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
            "output_refs": self.output_refs.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
            "status": self.status.to_string(),
            "failure_reason": self.failure_reason.as_ref().map(|r| r.to_string()),
            "attempts": self.attempts,
            "resource_usage": {
                "fuel_consumed": self.resource_usage.fuel_consumed,
                "cpu_ms": self.resource_usage.cpu_ms,
                "memory_peak_mb": self.resource_usage.memory_peak_mb,
                "host_calls": self.resource_usage.host_calls,
            },
            "started_at": self.started_at.to_rfc3339(),
            "ended_at": self.ended_at.to_rfc3339(),
            "signature": hex::encode(&self.signature),
        }))
    }
}

/// Decode receipt bytes fetched under `receipt_ref` and check that they hash
/// to it and carry a valid executor signature.
pub async fn open_receipt(
    receipt_ref: &Cid,
    bytes: &[u8],
    verifier: &SignatureVerifier,
) -> MeshResult<ExecutionReceipt> {
    if receipt_ref.codec() != DAG_CBOR_CODEC {
        return Err(MeshError::Malformed(format!(
            "receipt reference {} is not DAG-CBOR",
            receipt_ref
        )));
    }
    if !receipt_ref.matches(bytes) {
        return Err(MeshError::Malformed(format!(
            "content does not hash to {}",
            receipt_ref
        )));
    }
    let (receipt, signed_bytes) = codec::decode_signed::<ExecutionReceipt>(bytes)?;
    verifier.verify_decoded(&receipt, &signed_bytes).await?;
    Ok(receipt)
}
