//! Replay protection: an acceptance window on message timestamps plus a
//! record of signatures already processed inside that window.

use crate::error::{MeshError, MeshResult};
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

/// Seen-set size above which expired digests are swept
const SWEEP_THRESHOLD: usize = 4096;

#[derive(Debug)]
pub struct ReplayGuard {
    window: Duration,
    seen: Mutex<HashMap<[u8; 32], DateTime<Utc>>>,
}

impl ReplayGuard {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window: Duration::from_std(window).unwrap_or_else(|_| Duration::seconds(300)),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Accept a message once. Timestamps further than the window from `now`,
    /// in either direction, are rejected, as is any signature seen before.
    pub fn check(&self, timestamp: DateTime<Utc>, signature: &[u8], now: DateTime<Utc>) -> MeshResult<()> {
        self.check_window(timestamp, now)?;
        let digest: [u8; 32] = Sha256::digest(signature).into();
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        if seen.contains_key(&digest) {
            return Err(MeshError::Replay(format!(
                "signature {} already seen",
                hex::encode(&digest[..8])
            )));
        }
        if seen.len() >= SWEEP_THRESHOLD {
            self.retain_live(&mut seen, now);
        }
        seen.insert(digest, timestamp);
        Ok(())
    }

    /// Timestamp check alone, for streams that deduplicate by sequence number.
    pub fn check_window(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> MeshResult<()> {
        if (now - timestamp).abs() > self.window {
            return Err(MeshError::Replay(format!(
                "timestamp {} outside acceptance window",
                timestamp.to_rfc3339()
            )));
        }
        Ok(())
    }

    /// Forget signatures whose timestamps fell out of the window. Returns how
    /// many were dropped.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut seen = self.seen.lock().unwrap_or_else(|p| p.into_inner());
        self.retain_live(&mut seen, now)
    }

    fn retain_live(&self, seen: &mut HashMap<[u8; 32], DateTime<Utc>>, now: DateTime<Utc>) -> usize {
        let before = seen.len();
        let horizon = now - self.window;
        seen.retain(|_, ts| *ts >= horizon);
        before - seen.len()
    }

    pub fn tracked(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }
}
