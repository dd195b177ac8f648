//! Boundary to the external execution sandbox.
//!
//! The mesh never runs WebAssembly itself. It hands a [`SandboxRequest`] to an
//! [`ExecutionSandbox`] implementation and records whatever comes back. This
//! module also owns the [`ResourceLedger`] that reserves local capacity for
//! the duration of a job.

use crate::error::MeshError;
use crate::types::{ExecutionPolicy, ResourceBudget, ResourceKind, ResourceMap};
use async_trait::async_trait;
use icn_core_types::Cid;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Failures reported by the sandbox
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxError {
    #[error("execution timed out")]
    Timeout,

    #[error("resource limit exceeded: {0}")]
    ResourceExceeded(String),

    #[error("runtime trap: {0}")]
    RuntimeTrap(String),

    #[error("input unavailable: {0}")]
    InputUnavailable(String),
}

impl SandboxError {
    /// Transient failures may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, SandboxError::InputUnavailable(_))
    }
}

/// Metered consumption reported by the sandbox
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub fuel_consumed: u64,
    pub cpu_ms: u64,
    pub memory_peak_mb: u64,
    pub host_calls: u64,
}

impl ResourceUsage {
    /// Sum usage across retried attempts.
    pub fn accumulate(&mut self, other: &ResourceUsage) {
        self.fuel_consumed = self.fuel_consumed.saturating_add(other.fuel_consumed);
        self.cpu_ms = self.cpu_ms.saturating_add(other.cpu_ms);
        self.memory_peak_mb = self.memory_peak_mb.max(other.memory_peak_mb);
        self.host_calls = self.host_calls.saturating_add(other.host_calls);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxRequest {
    pub announcement_id: String,
    pub wasm_ref: Cid,
    pub input_refs: Vec<Cid>,
    pub policy: ExecutionPolicy,
    pub budget: ResourceBudget,
}

/// How the guest program ended when the sandbox itself did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxExit {
    Success,
    Failure { code: i32, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxOutcome {
    pub output_refs: Vec<Cid>,
    pub resource_usage: ResourceUsage,
    pub status: SandboxExit,
}

/// The black-box executor of job payloads.
///
/// Implementations may take arbitrarily long; callers wrap every call in a
/// timeout and drop the future to cancel it.
#[async_trait]
pub trait ExecutionSandbox: Send + Sync {
    async fn execute(&self, request: SandboxRequest) -> Result<SandboxOutcome, SandboxError>;
}

#[derive(Debug, Default)]
struct LedgerState {
    capacity: ResourceMap,
    reservations: HashMap<String, ResourceMap>,
}

impl LedgerState {
    fn reserved_total(&self, kind: &ResourceKind) -> u64 {
        self.reservations
            .values()
            .filter_map(|r| r.get(kind))
            .fold(0u64, |acc, v| acc.saturating_add(*v))
    }
}

/// Tracks how much of the node's advertised capacity is held by running jobs.
#[derive(Debug, Clone, Default)]
pub struct ResourceLedger {
    inner: Arc<Mutex<LedgerState>>,
}

impl ResourceLedger {
    pub fn new(capacity: ResourceMap) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LedgerState {
                capacity,
                reservations: HashMap::new(),
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Capacity not currently held by any reservation.
    pub fn available(&self) -> ResourceMap {
        let state = self.state();
        state
            .capacity
            .iter()
            .map(|(kind, total)| (kind.clone(), total.saturating_sub(state.reserved_total(kind))))
            .collect()
    }

    /// Reserve `requirements` for a job. The returned guard releases on drop,
    /// which covers completion, failure and task cancellation alike.
    pub fn reserve(
        &self,
        announcement_id: &str,
        requirements: &ResourceMap,
    ) -> Result<Reservation, MeshError> {
        let mut state = self.state();
        if state.reservations.contains_key(announcement_id) {
            return Err(MeshError::contextual(format!(
                "resources already reserved for {}",
                announcement_id
            )));
        }
        for (kind, needed) in requirements {
            let total = state.capacity.get(kind).copied().unwrap_or(0);
            let free = total.saturating_sub(state.reserved_total(kind));
            if free < *needed {
                return Err(MeshError::PolicyViolation(format!(
                    "insufficient {}: need {}, free {}",
                    kind, needed, free
                )));
            }
        }
        state
            .reservations
            .insert(announcement_id.to_string(), requirements.clone());
        Ok(Reservation {
            ledger: self.clone(),
            announcement_id: announcement_id.to_string(),
        })
    }

    pub fn active_reservations(&self) -> usize {
        self.state().reservations.len()
    }

    fn release(&self, announcement_id: &str) {
        self.state().reservations.remove(announcement_id);
    }
}

/// Held for the lifetime of a job's execution.
#[derive(Debug)]
pub struct Reservation {
    ledger: ResourceLedger,
    announcement_id: String,
}

impl Reservation {
    pub fn announcement_id(&self) -> &str {
        &self.announcement_id
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.ledger.release(&self.announcement_id);
    }
}

/// One scripted sandbox reaction
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Succeed,
    Exit { code: i32, message: String },
    Fail(SandboxError),
    /// Never returns; used to exercise cancellation
    Hang,
}

/// Deterministic in-process sandbox for tests and the local devnet.
///
/// Steps are consumed in order; once the script is exhausted every call
/// succeeds. Successful runs produce one output whose CID is derived from the
/// module and inputs.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    script: Mutex<VecDeque<ScriptedStep>>,
    delay: Duration,
    calls: AtomicU32,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(steps: impl IntoIterator<Item = ScriptedStep>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Simulated run time for every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> ScriptedStep {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or(ScriptedStep::Succeed)
    }

    fn output_for(request: &SandboxRequest) -> Result<Cid, SandboxError> {
        let mut material = request.wasm_ref.to_bytes();
        for input in &request.input_refs {
            material.extend(input.to_bytes());
        }
        Cid::from_bytes(&material).map_err(|e| SandboxError::RuntimeTrap(e.to_string()))
    }
}

#[async_trait]
impl ExecutionSandbox for ScriptedSandbox {
    async fn execute(&self, request: SandboxRequest) -> Result<SandboxOutcome, SandboxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.next_step();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let usage = ResourceUsage {
            fuel_consumed: 1_000 * (request.input_refs.len() as u64 + 1),
            cpu_ms: self.delay.as_millis() as u64,
            memory_peak_mb: 16,
            host_calls: request.input_refs.len() as u64,
        };
        match step {
            ScriptedStep::Succeed => Ok(SandboxOutcome {
                output_refs: vec![Self::output_for(&request)?],
                resource_usage: usage,
                status: SandboxExit::Success,
            }),
            ScriptedStep::Exit { code, message } => Ok(SandboxOutcome {
                output_refs: Vec::new(),
                resource_usage: usage,
                status: SandboxExit::Failure { code, message },
            }),
            ScriptedStep::Fail(err) => Err(err),
            ScriptedStep::Hang => {
                std::future::pending::<()>().await;
                Err(SandboxError::Timeout)
            }
        }
    }
}
