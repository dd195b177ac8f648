//! Prometheus metrics for one mesh node.

use prometheus::{
    opts, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

/// Counters and gauges registered on a node-local registry, so several
/// nodes can share a process.
#[derive(Clone)]
pub struct MeshMetrics {
    registry: Registry,
    /// Decoded inbound messages by wire kind
    pub messages_received: IntCounterVec,
    /// Dropped inbound messages by error label
    pub messages_rejected: IntCounterVec,
    /// Bids seen by the originator, by outcome
    pub bids: IntCounterVec,
    /// Final job states by role and status
    pub job_outcomes: IntCounterVec,
    pub sandbox_attempts: IntCounterVec,
    pub queue_overflow: IntCounter,
    pub running_executions: IntGauge,
    pub execution_seconds: Histogram,
}

impl MeshMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let messages_received = IntCounterVec::new(
            opts!("icn_mesh_messages_received_total", "Inbound mesh messages by kind"),
            &["kind"],
        )?;
        let messages_rejected = IntCounterVec::new(
            opts!("icn_mesh_messages_rejected_total", "Inbound mesh messages rejected, by reason"),
            &["reason"],
        )?;
        let bids = IntCounterVec::new(
            opts!("icn_mesh_bids_total", "Bids by outcome"),
            &["outcome"],
        )?;
        let job_outcomes = IntCounterVec::new(
            opts!("icn_mesh_job_outcomes_total", "Jobs reaching a final state"),
            &["role", "status"],
        )?;
        let sandbox_attempts = IntCounterVec::new(
            opts!("icn_mesh_sandbox_attempts_total", "Sandbox invocations by result"),
            &["result"],
        )?;
        let queue_overflow = IntCounter::new(
            "icn_mesh_worker_queue_overflow_total",
            "Messages dropped because the worker queue was full",
        )?;
        let running_executions =
            IntGauge::new("icn_mesh_running_executions", "Jobs currently executing on this node")?;
        let execution_seconds = Histogram::with_opts(
            HistogramOpts::new("icn_mesh_execution_seconds", "Wall time spent in the sandbox per job")
                .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        )?;

        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(messages_rejected.clone()))?;
        registry.register(Box::new(bids.clone()))?;
        registry.register(Box::new(job_outcomes.clone()))?;
        registry.register(Box::new(sandbox_attempts.clone()))?;
        registry.register(Box::new(queue_overflow.clone()))?;
        registry.register(Box::new(running_executions.clone()))?;
        registry.register(Box::new(execution_seconds.clone()))?;

        Ok(Self {
            registry,
            messages_received,
            messages_rejected,
            bids,
            job_outcomes,
            sandbox_attempts,
            queue_overflow,
            running_executions,
            execution_seconds,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of everything registered.
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
