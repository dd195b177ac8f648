use crate::sandbox::SandboxError;
use thiserror::Error;

/// Why a signature could not be accepted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The claimed DID could not be resolved to a public key
    #[error("DID could not be resolved: {0}")]
    Unresolvable(String),

    /// The key resolved but the signature does not match the payload
    #[error("Signature does not match for {0}")]
    SignatureMismatch(String),

    #[error("Malformed signature: {0}")]
    MalformedSignature(String),
}

/// Errors that can occur while coordinating mesh jobs
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeshError {
    /// Failed schema or required-field checks
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthError),

    /// Valid message that does not fit local state (unknown job, wrong recipient, closed window)
    #[error("Contextual violation: {0}")]
    ContextualViolation(String),

    /// Bid or capability does not satisfy an execution policy
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Execution failed: {0}")]
    Execution(#[from] SandboxError),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Timestamp outside the acceptance window or already-seen message
    #[error("Replay rejected: {0}")]
    Replay(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Unknown status: {0}")]
    UnknownStatus(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeshError {
    /// Short label used for metrics and log fields.
    pub fn label(&self) -> &'static str {
        match self {
            MeshError::Malformed(_) => "malformed",
            MeshError::Authentication(_) => "authentication",
            MeshError::ContextualViolation(_) => "contextual",
            MeshError::PolicyViolation(_) => "policy",
            MeshError::Execution(_) => "execution",
            MeshError::Timeout(_) => "timeout",
            MeshError::Replay(_) => "replay",
            MeshError::Transport(_) => "transport",
            MeshError::InvalidTransition { .. } => "transition",
            MeshError::UnknownStatus(_) => "unknown_status",
            MeshError::NotFound(_) => "not_found",
            MeshError::Internal(_) => "internal",
        }
    }

    pub(crate) fn contextual(msg: impl Into<String>) -> Self {
        MeshError::ContextualViolation(msg.into())
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
