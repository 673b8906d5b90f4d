//! Fan-out of encoded frames to every connection in a document room.
//!
//! Uses a tokio broadcast channel: one send reaches all subscribers, and
//! each connection skips frames it originated. A receiver that falls more
//! than `capacity` frames behind lags and drops the oldest ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::protocol::{ClientId, ProtocolError, SyncMessage};

/// A connection registered in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub client_id: ClientId,
    /// Relay-assigned id of the socket. A client that reconnects keeps its
    /// client id but gets a new connection id.
    pub connection: u64,
    pub read_only: bool,
}

/// Encoded frame plus the connection it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: ClientId,
    pub bytes: Arc<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Broadcast group for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    peers: RwLock<HashMap<ClientId, PeerInfo>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is the per-receiver buffer before lagging peers drop frames.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Envelope> {
        self.peers.write().await.insert(info.client_id, info);
        self.sender.subscribe()
    }

    /// Remove `client_id` if it is still registered through `connection`.
    /// A newer connection of the same client is left alone.
    pub async fn remove_peer(&self, client_id: ClientId, connection: u64) -> Option<PeerInfo> {
        let mut peers = self.peers.write().await;
        match peers.get(&client_id) {
            Some(info) if info.connection == connection => peers.remove(&client_id),
            _ => None,
        }
    }

    /// Encode and fan out `msg` on behalf of `from`.
    pub fn broadcast(&self, from: ClientId, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(from, Arc::new(encoded)))
    }

    /// Fan out pre-encoded bytes. Returns the number of receivers.
    pub fn broadcast_raw(&self, from: ClientId, bytes: Arc<Vec<u8>>) -> usize {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.sender.send(Envelope { from, bytes }).unwrap_or(0)
    }

    /// Count frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, client_id: ClientId) -> bool {
        self.peers.read().await.contains_key(&client_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
