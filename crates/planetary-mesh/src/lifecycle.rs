//! Job lifecycle states shared by originators and executors.
//!
//! Nodes track jobs with fine-grained [`LocalJobStatus`] values. Anything that
//! leaves the node in a receipt or report is reduced to a [`CanonicalStatus`]
//! through [`LocalJobStatus::canonical`], a fixed table that every node
//! applies identically.

use crate::error::MeshError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fine-grained status of a job as seen by one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocalJobStatus {
    PendingAnnouncement,
    Announced,
    BiddingOpen,
    BiddingClosed,
    Assigned,
    PreparingExecution,
    Running,
    AwaitingInputs,
    ProducingOutputs,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
    ReceiptGenerated,
    ReceiptAnchored,
}

/// Stable outcome vocabulary used in receipts and external reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CanonicalStatus {
    Pending,
    Running,
    CompletedSuccessfully,
    Failed,
    Cancelled,
}

impl LocalJobStatus {
    pub const ALL: [LocalJobStatus; 15] = [
        LocalJobStatus::PendingAnnouncement,
        LocalJobStatus::Announced,
        LocalJobStatus::BiddingOpen,
        LocalJobStatus::BiddingClosed,
        LocalJobStatus::Assigned,
        LocalJobStatus::PreparingExecution,
        LocalJobStatus::Running,
        LocalJobStatus::AwaitingInputs,
        LocalJobStatus::ProducingOutputs,
        LocalJobStatus::Completed,
        LocalJobStatus::Failed,
        LocalJobStatus::Cancelled,
        LocalJobStatus::TimedOut,
        LocalJobStatus::ReceiptGenerated,
        LocalJobStatus::ReceiptAnchored,
    ];

    /// Reduce to the canonical status. Total over every local status.
    pub fn canonical(self) -> CanonicalStatus {
        use LocalJobStatus::*;
        match self {
            PendingAnnouncement | Announced | BiddingOpen | BiddingClosed | Assigned => {
                CanonicalStatus::Pending
            }
            PreparingExecution | Running | AwaitingInputs | ProducingOutputs => {
                CanonicalStatus::Running
            }
            Completed | ReceiptGenerated | ReceiptAnchored => CanonicalStatus::CompletedSuccessfully,
            Failed | TimedOut => CanonicalStatus::Failed,
            Cancelled => CanonicalStatus::Cancelled,
        }
    }

    pub fn as_str(self) -> &'static str {
        use LocalJobStatus::*;
        match self {
            PendingAnnouncement => "PendingAnnouncement",
            Announced => "Announced",
            BiddingOpen => "BiddingOpen",
            BiddingClosed => "BiddingClosed",
            Assigned => "Assigned",
            PreparingExecution => "PreparingExecution",
            Running => "Running",
            AwaitingInputs => "AwaitingInputs",
            ProducingOutputs => "ProducingOutputs",
            Completed => "Completed",
            Failed => "Failed",
            Cancelled => "Cancelled",
            TimedOut => "TimedOut",
            ReceiptGenerated => "ReceiptGenerated",
            ReceiptAnchored => "ReceiptAnchored",
        }
    }

    /// Order along the happy path; used to ignore stale status updates.
    pub fn progress(self) -> u8 {
        use LocalJobStatus::*;
        match self {
            PendingAnnouncement => 0,
            Announced => 1,
            BiddingOpen => 2,
            BiddingClosed => 3,
            Assigned => 4,
            PreparingExecution => 5,
            Running | AwaitingInputs => 6,
            ProducingOutputs => 7,
            Completed | Failed | Cancelled | TimedOut => 8,
            ReceiptGenerated => 9,
            ReceiptAnchored => 10,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LocalJobStatus::Failed
                | LocalJobStatus::Cancelled
                | LocalJobStatus::TimedOut
                | LocalJobStatus::ReceiptAnchored
        )
    }

    /// Whether interactive traffic is allowed in this status.
    pub fn is_interactive_window(self) -> bool {
        matches!(
            self,
            LocalJobStatus::Running | LocalJobStatus::AwaitingInputs | LocalJobStatus::ProducingOutputs
        )
    }

    /// Executor-side transition table.
    pub fn can_transition_to(self, next: LocalJobStatus) -> bool {
        use LocalJobStatus::*;
        match (self, next) {
            (BiddingOpen, PreparingExecution) => true,
            (BiddingOpen, Cancelled) => true,
            (PreparingExecution, Running) => true,
            (Running, AwaitingInputs) | (AwaitingInputs, Running) => true,
            (Running, ProducingOutputs) | (AwaitingInputs, ProducingOutputs) => true,
            (ProducingOutputs, Completed) => true,
            (Completed, ReceiptGenerated) => true,
            (ReceiptGenerated, ReceiptAnchored) => true,
            (PreparingExecution | Running | AwaitingInputs | ProducingOutputs, Failed) => true,
            (PreparingExecution | Running | AwaitingInputs | ProducingOutputs, TimedOut) => true,
            (PreparingExecution | Running | AwaitingInputs | ProducingOutputs, Cancelled) => true,
            _ => false,
        }
    }

    /// Validate a transition, returning the new status.
    pub fn transition(self, next: LocalJobStatus) -> Result<LocalJobStatus, MeshError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(MeshError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for LocalJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LocalJobStatus {
    type Err = MeshError;

    /// Unknown names are rejected, never defaulted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LocalJobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| MeshError::UnknownStatus(s.to_string()))
    }
}

/// Reduce a status name received from outside the node.
pub fn reduce_status_name(name: &str) -> Result<CanonicalStatus, MeshError> {
    name.parse::<LocalJobStatus>().map(LocalJobStatus::canonical)
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CanonicalStatus::Pending => "Pending",
            CanonicalStatus::Running => "Running",
            CanonicalStatus::CompletedSuccessfully => "CompletedSuccessfully",
            CanonicalStatus::Failed => "Failed",
            CanonicalStatus::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Originator view of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OriginatorJobState {
    Draft,
    Announced,
    CollectingBids,
    Selecting,
    Assigned,
    Monitoring,
    Completed,
    Failed,
    TimedOut,
}

impl OriginatorJobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OriginatorJobState::Completed | OriginatorJobState::Failed | OriginatorJobState::TimedOut
        )
    }

    pub fn can_transition_to(self, next: OriginatorJobState) -> bool {
        use OriginatorJobState::*;
        match (self, next) {
            (Draft, Announced) => true,
            (Announced, CollectingBids) => true,
            (CollectingBids, Selecting) => true,
            (Selecting, Assigned) => true,
            (Assigned, Monitoring) => true,
            (Monitoring, Completed) => true,
            (Assigned | Monitoring, TimedOut) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Equivalent local status, for reports that leave the node.
    pub fn local_status(self) -> LocalJobStatus {
        match self {
            OriginatorJobState::Draft => LocalJobStatus::PendingAnnouncement,
            OriginatorJobState::Announced => LocalJobStatus::Announced,
            OriginatorJobState::CollectingBids => LocalJobStatus::BiddingOpen,
            OriginatorJobState::Selecting => LocalJobStatus::BiddingClosed,
            OriginatorJobState::Assigned => LocalJobStatus::Assigned,
            OriginatorJobState::Monitoring => LocalJobStatus::Running,
            OriginatorJobState::Completed => LocalJobStatus::Completed,
            OriginatorJobState::Failed => LocalJobStatus::Failed,
            OriginatorJobState::TimedOut => LocalJobStatus::TimedOut,
        }
    }
}

impl fmt::Display for OriginatorJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
