//! Bid admission and deterministic executor selection.

use crate::error::{MeshError, MeshResult};
use crate::trust::ReputationSource;
use crate::types::{Bid, ExecutionPolicy, NodeCapability};
use chrono::{DateTime, Utc};
use icn_core_types::Did;
use log::debug;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

/// Check a bid against the job's execution policy.
///
/// `capability` is the bidder's latest advertisement, if known; without one
/// the resource requirements cannot be checked and the bid is taken at its
/// word. `min_reputation` only applies when a reputation source is present.
pub fn check_bid_policy(
    bid: &Bid,
    policy: &ExecutionPolicy,
    capability: Option<&NodeCapability>,
    reputation: Option<&dyn ReputationSource>,
) -> MeshResult<()> {
    if let (Some(ceiling), Some(price)) = (policy.max_price, bid.price) {
        if price > ceiling {
            return Err(MeshError::PolicyViolation(format!(
                "price {} above ceiling {}",
                price, ceiling
            )));
        }
    }

    let region = bid_region(bid, capability);
    if !policy.region_allowed(region) {
        return Err(MeshError::PolicyViolation(format!(
            "region {} not allowed",
            region.unwrap_or("<none>")
        )));
    }

    if let (Some(min), Some(source)) = (policy.min_reputation, reputation) {
        let score = source.reputation(&bid.executor_did).unwrap_or(0);
        if score < min {
            return Err(MeshError::PolicyViolation(format!(
                "reputation {} below minimum {}",
                score, min
            )));
        }
    }

    if let Some(capability) = capability {
        for (kind, needed) in &policy.resource_requirements {
            let available = capability.available_resources.get(kind).copied().unwrap_or(0);
            if available < *needed {
                return Err(MeshError::PolicyViolation(format!(
                    "{} needed {}, advertised {}",
                    kind, needed, available
                )));
            }
        }
    }

    Ok(())
}

/// The bid's own region, falling back to the bidder's advertisement.
fn bid_region<'a>(bid: &'a Bid, capability: Option<&'a NodeCapability>) -> Option<&'a str> {
    bid.region
        .as_deref()
        .or_else(|| capability.and_then(|c| c.region.as_deref()))
}

/// Total order over bids; the smallest key wins.
///
/// Effective price, then reputation (highest first), then region preference,
/// then earliest timestamp, then executor DID.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RankKey {
    pub price: u64,
    pub reputation: Reverse<u32>,
    pub region_rank: usize,
    pub timestamp: DateTime<Utc>,
    pub executor_did: Did,
}

/// Selects the executor for a job from its admitted bids
#[derive(Clone, Default)]
pub struct Scheduler {
    reputation: Option<Arc<dyn ReputationSource>>,
}

impl Scheduler {
    pub fn new(reputation: Option<Arc<dyn ReputationSource>>) -> Self {
        Self { reputation }
    }

    pub fn reputation(&self) -> Option<&dyn ReputationSource> {
        self.reputation.as_deref()
    }

    pub fn rank_key(
        &self,
        bid: &Bid,
        policy: &ExecutionPolicy,
        capability: Option<&NodeCapability>,
    ) -> RankKey {
        // A bid without a price is valued at the ceiling it accepted
        let price = bid.price.or(policy.max_price).unwrap_or(u64::MAX);
        let reputation = self
            .reputation
            .as_ref()
            .and_then(|source| source.reputation(&bid.executor_did))
            .unwrap_or(0);
        RankKey {
            price,
            reputation: Reverse(reputation),
            region_rank: policy.region_rank(bid_region(bid, capability)),
            timestamp: bid.timestamp,
            executor_did: bid.executor_did.clone(),
        }
    }

    /// Re-filter by policy and pick the best bid. Same inputs, same winner,
    /// regardless of the order bids arrived in.
    pub fn select<'a>(
        &self,
        bids: &'a [Bid],
        policy: &ExecutionPolicy,
        capabilities: &HashMap<Did, NodeCapability>,
    ) -> Option<&'a Bid> {
        let winner = bids
            .iter()
            .filter(|bid| {
                let capability = capabilities.get(&bid.executor_did);
                check_bid_policy(bid, policy, capability, self.reputation()).is_ok()
            })
            .min_by_key(|bid| self.rank_key(bid, policy, capabilities.get(&bid.executor_did)));
        if let Some(bid) = winner {
            debug!(
                "Selected {} for {} out of {} bids",
                bid.executor_did,
                bid.announcement_id,
                bids.len()
            );
        }
        winner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::StaticReputation;
    use crate::types::ResourceKind;
    use chrono::Duration;

    fn bid(name: &str, price: Option<u64>, region: Option<&str>, offset_ms: i64) -> Bid {
        let base = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Bid {
            announcement_id: "job-1".into(),
            executor_did: Did::parse(&format!("did:icn:{}", name)).unwrap(),
            executor_peer_id: name.into(),
            price,
            region: region.map(String::from),
            timestamp: base + Duration::milliseconds(offset_ms),
            signature: Vec::new(),
        }
    }

    fn policy(max_price: Option<u64>) -> ExecutionPolicy {
        ExecutionPolicy {
            max_price,
            ..ExecutionPolicy::default()
        }
    }

    #[test]
    fn price_above_ceiling_is_rejected_and_cheaper_bid_wins() {
        let bids = vec![bid("a", Some(10), None, 0), bid("b", Some(8), None, 5)];
        let policy = policy(Some(9));
        assert!(matches!(
            check_bid_policy(&bids[0], &policy, None, None),
            Err(MeshError::PolicyViolation(_))
        ));
        let winner = Scheduler::default()
            .select(&bids, &policy, &HashMap::new())
            .unwrap();
        assert_eq!(winner.executor_peer_id, "b");
    }

    #[test]
    fn selection_is_independent_of_arrival_order() {
        let mut bids = vec![
            bid("c", Some(5), Some("eu-north"), 10),
            bid("a", Some(5), Some("eu-west"), 10),
            bid("b", Some(5), Some("eu-west"), 10),
            bid("d", Some(5), Some("eu-west"), 20),
        ];
        let policy = ExecutionPolicy {
            allowed_regions: vec!["eu-west".into(), "eu-north".into()],
            ..ExecutionPolicy::default()
        };
        let scheduler = Scheduler::default();
        let first = scheduler
            .select(&bids, &policy, &HashMap::new())
            .unwrap()
            .clone();
        bids.reverse();
        let second = scheduler.select(&bids, &policy, &HashMap::new()).unwrap();
        assert_eq!(&first, second);
        // Region preference, then timestamp, then DID
        assert_eq!(first.executor_peer_id, "a");
    }

    #[test]
    fn missing_price_ranks_at_ceiling() {
        let bids = vec![bid("a", None, None, 0), bid("b", Some(9), None, 5)];
        let winner = Scheduler::default()
            .select(&bids, &policy(Some(9)), &HashMap::new())
            .unwrap();
        // Tied at 9, earlier timestamp wins
        assert_eq!(winner.executor_peer_id, "a");

        let winner = Scheduler::default()
            .select(&bids, &policy(None), &HashMap::new())
            .unwrap();
        assert_eq!(winner.executor_peer_id, "b");
    }

    #[test]
    fn reputation_orders_equal_prices_and_enforces_minimum() {
        let bids = vec![bid("a", Some(5), None, 0), bid("b", Some(5), None, 5)];
        let source = StaticReputation::new()
            .with(bids[0].executor_did.clone(), 20)
            .with(bids[1].executor_did.clone(), 90);
        let scheduler = Scheduler::new(Some(Arc::new(source)));

        let winner = scheduler.select(&bids, &policy(None), &HashMap::new()).unwrap();
        assert_eq!(winner.executor_peer_id, "b");

        let strict = ExecutionPolicy {
            min_reputation: Some(95),
            ..ExecutionPolicy::default()
        };
        assert!(scheduler.select(&bids, &strict, &HashMap::new()).is_none());
        // Without a source the minimum is not enforced
        assert!(Scheduler::default().select(&bids, &strict, &HashMap::new()).is_some());
    }

    #[test]
    fn advertised_resources_are_checked_when_known() {
        let bid = bid("a", Some(1), None, 0);
        let mut policy = policy(None);
        policy.resource_requirements.insert(ResourceKind::MemoryMb, 8192);
        let capability = NodeCapability {
            node_did: bid.executor_did.clone(),
            peer_id: "a".into(),
            alias: None,
            region: None,
            supported_runtimes: vec!["wasm".into()],
            available_resources: [(ResourceKind::MemoryMb, 1024)].into_iter().collect(),
            specialized_features: vec![],
            timestamp: Utc::now(),
            attestation_ref: None,
            signature: vec![],
        };
        assert!(check_bid_policy(&bid, &policy, Some(&capability), None).is_err());
        assert!(check_bid_policy(&bid, &policy, None, None).is_ok());
    }
}
