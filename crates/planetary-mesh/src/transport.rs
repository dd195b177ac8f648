//! Network transport abstraction and the in-process mesh used by tests and
//! the devnet.

use crate::error::MeshError;
use async_trait::async_trait;
use log::{debug, trace};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;

/// Inbound queue size per peer on the in-memory network
const PEER_INBOX_CAPACITY: usize = 4096;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Message dropped: {0}")]
    Dropped(String),

    #[error("Transport closed")]
    Closed,

    #[error("Internal transport error: {0}")]
    Internal(String),
}

impl From<TransportError> for MeshError {
    fn from(err: TransportError) -> Self {
        MeshError::Transport(err.to_string())
    }
}

/// Traffic delivered to a node by its transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Broadcast received on a subscribed topic
    Gossip {
        topic: String,
        source: String,
        data: Vec<u8>,
    },
    /// Point-to-point message addressed to this peer
    Direct { source: String, data: Vec<u8> },
}

/// Everything the coordination core needs from the network.
///
/// Inbound traffic is not pulled through this trait; implementations push
/// [`TransportEvent`]s onto the channel handed out when the transport is
/// created.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    fn local_peer_id(&self) -> String;

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError>;

    async fn send_direct(&self, peer_id: &str, data: Vec<u8>) -> Result<(), TransportError>;

    async fn dht_put(&self, key: &[u8], value: Vec<u8>) -> Result<(), TransportError>;

    async fn dht_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TransportError>;

    /// Announce that this peer can serve `key`.
    async fn dht_provide(&self, key: &[u8]) -> Result<(), TransportError>;

    async fn dht_find_providers(&self, key: &[u8]) -> Result<Vec<String>, TransportError>;
}

struct PeerSlot {
    inbox: mpsc::Sender<TransportEvent>,
    topics: HashSet<String>,
    reachable: bool,
    /// Direct sends to this peer that will fail before delivery resumes
    fail_next_direct: u32,
}

#[derive(Default)]
struct NetworkState {
    peers: HashMap<String, PeerSlot>,
    records: HashMap<Vec<u8>, Vec<u8>>,
    providers: HashMap<Vec<u8>, BTreeSet<String>>,
}

/// A shared in-process network: gossip topics, direct delivery and a single
/// DHT keyspace, with hooks for injecting faults.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer, returning its transport and inbound event stream.
    /// Joining again under the same id replaces the previous attachment.
    pub fn join(&self, peer_id: impl Into<String>) -> (MemoryTransport, mpsc::Receiver<TransportEvent>) {
        let peer_id = peer_id.into();
        let (tx, rx) = mpsc::channel(PEER_INBOX_CAPACITY);
        if let Ok(mut state) = self.state.write() {
            state.peers.insert(
                peer_id.clone(),
                PeerSlot {
                    inbox: tx,
                    topics: HashSet::new(),
                    reachable: true,
                    fail_next_direct: 0,
                },
            );
        }
        debug!("Peer {} joined memory network", peer_id);
        (
            MemoryTransport {
                peer_id,
                network: self.clone(),
            },
            rx,
        )
    }

    pub fn leave(&self, peer_id: &str) {
        if let Ok(mut state) = self.state.write() {
            state.peers.remove(peer_id);
            for providers in state.providers.values_mut() {
                providers.remove(peer_id);
            }
        }
    }

    /// An unreachable peer receives nothing and direct sends to it fail.
    pub fn set_reachable(&self, peer_id: &str, reachable: bool) {
        if let Ok(mut state) = self.state.write() {
            if let Some(slot) = state.peers.get_mut(peer_id) {
                slot.reachable = reachable;
            }
        }
    }

    /// Fail the next `count` direct messages addressed to `peer_id`.
    pub fn fail_next_direct(&self, peer_id: &str, count: u32) {
        if let Ok(mut state) = self.state.write() {
            if let Some(slot) = state.peers.get_mut(peer_id) {
                slot.fail_next_direct = count;
            }
        }
    }

    pub fn peer_count(&self) -> usize {
        self.state.read().map(|s| s.peers.len()).unwrap_or(0)
    }

    fn lock_err<T>(_: T) -> TransportError {
        TransportError::Internal("network state poisoned".to_string())
    }
}

/// One peer's handle on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    peer_id: String,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl MeshTransport for MemoryTransport {
    fn local_peer_id(&self) -> String {
        self.peer_id.clone()
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.network.state.write().map_err(MemoryNetwork::lock_err)?;
        let slot = state
            .peers
            .get_mut(&self.peer_id)
            .ok_or_else(|| TransportError::UnknownPeer(self.peer_id.clone()))?;
        slot.topics.insert(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let targets: Vec<mpsc::Sender<TransportEvent>> = {
            let state = self.network.state.read().map_err(MemoryNetwork::lock_err)?;
            state
                .peers
                .iter()
                .filter(|(id, slot)| **id != self.peer_id && slot.reachable && slot.topics.contains(topic))
                .map(|(_, slot)| slot.inbox.clone())
                .collect()
        };
        trace!("{} publishing {} bytes on {} to {} peers", self.peer_id, data.len(), topic, targets.len());
        for inbox in targets {
            let event = TransportEvent::Gossip {
                topic: topic.to_string(),
                source: self.peer_id.clone(),
                data: data.clone(),
            };
            // Gossip is best effort; a closed inbox is a departed peer.
            let _ = inbox.send(event).await;
        }
        Ok(())
    }

    async fn send_direct(&self, peer_id: &str, data: Vec<u8>) -> Result<(), TransportError> {
        let inbox = {
            let mut state = self.network.state.write().map_err(MemoryNetwork::lock_err)?;
            let slot = state
                .peers
                .get_mut(peer_id)
                .ok_or_else(|| TransportError::UnknownPeer(peer_id.to_string()))?;
            if !slot.reachable {
                return Err(TransportError::PeerUnreachable(peer_id.to_string()));
            }
            if slot.fail_next_direct > 0 {
                slot.fail_next_direct -= 1;
                return Err(TransportError::Dropped(format!("direct message to {}", peer_id)));
            }
            slot.inbox.clone()
        };
        inbox
            .send(TransportEvent::Direct {
                source: self.peer_id.clone(),
                data,
            })
            .await
            .map_err(|_| TransportError::PeerUnreachable(peer_id.to_string()))
    }

    async fn dht_put(&self, key: &[u8], value: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.network.state.write().map_err(MemoryNetwork::lock_err)?;
        state.records.insert(key.to_vec(), value);
        Ok(())
    }

    async fn dht_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        let state = self.network.state.read().map_err(MemoryNetwork::lock_err)?;
        Ok(state.records.get(key).cloned())
    }

    async fn dht_provide(&self, key: &[u8]) -> Result<(), TransportError> {
        let mut state = self.network.state.write().map_err(MemoryNetwork::lock_err)?;
        state
            .providers
            .entry(key.to_vec())
            .or_default()
            .insert(self.peer_id.clone());
        Ok(())
    }

    async fn dht_find_providers(&self, key: &[u8]) -> Result<Vec<String>, TransportError> {
        let state = self.network.state.read().map_err(MemoryNetwork::lock_err)?;
        Ok(state
            .providers
            .get(key)
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default())
    }
}
