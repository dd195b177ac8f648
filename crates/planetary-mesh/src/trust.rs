//! Peer trust scores and the optional reputation source used in selection.

use icn_core_types::Did;
use log::warn;
use std::collections::HashMap;
use std::sync::Mutex;

/// Score every peer starts with
pub const INITIAL_TRUST: i64 = 100;
/// Deducted for each message that fails authentication
pub const AUTH_FAILURE_PENALTY: i64 = 10;

/// Executor reputation, consulted for `min_reputation` and ranking.
pub trait ReputationSource: Send + Sync {
    /// `None` when the executor is unknown to the source.
    fn reputation(&self, did: &Did) -> Option<u32>;
}

/// Fixed reputation table
#[derive(Debug, Default, Clone)]
pub struct StaticReputation {
    scores: HashMap<Did, u32>,
}

impl StaticReputation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, did: Did, score: u32) -> Self {
        self.scores.insert(did, score);
        self
    }
}

impl ReputationSource for StaticReputation {
    fn reputation(&self, did: &Did) -> Option<u32> {
        self.scores.get(did).copied()
    }
}

/// Per transport peer trust. Peers that reach zero are ignored.
#[derive(Debug, Default)]
pub struct TrustLedger {
    scores: Mutex<HashMap<String, i64>>,
}

impl TrustLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score(&self, peer_id: &str) -> i64 {
        self.scores
            .lock()
            .map(|s| s.get(peer_id).copied().unwrap_or(INITIAL_TRUST))
            .unwrap_or(INITIAL_TRUST)
    }

    /// Record an authentication failure and return the new score.
    pub fn penalize(&self, peer_id: &str) -> i64 {
        let mut scores = self.scores.lock().unwrap_or_else(|p| p.into_inner());
        let score = scores.entry(peer_id.to_string()).or_insert(INITIAL_TRUST);
        *score = (*score - AUTH_FAILURE_PENALTY).max(0);
        if *score == 0 {
            warn!("Peer {} trust exhausted, ignoring further traffic", peer_id);
        }
        *score
    }

    pub fn is_trusted(&self, peer_id: &str) -> bool {
        self.score(peer_id) > 0
    }
}
