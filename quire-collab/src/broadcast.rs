//! Per-document fan-out with an in-memory backlog.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! messages. Durable messages (operations, annotations) are also appended
//! to the room backlog so late joiners can catch up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Encoded message shared between all receivers.
pub type Frame = Arc<Vec<u8>>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
    pub backlog_len: usize,
}

/// What a peer gets when it joins a room.
pub struct Membership {
    pub receiver: broadcast::Receiver<Frame>,
    /// Durable messages recorded before `receiver` subscribed.
    pub backlog: Vec<Frame>,
}

/// A broadcast group for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    backlog: RwLock<Vec<Frame>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    ///
    /// `capacity` determines how many messages can be buffered per peer
    /// before lagging peers start dropping messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            backlog: RwLock::new(Vec::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Add a peer and hand it the backlog plus a live receiver.
    ///
    /// The backlog lock is held across subscribe and snapshot, so every
    /// durable message is seen exactly once: either in the snapshot or on
    /// the receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> Membership {
        let backlog = self.backlog.read().await;
        let receiver = self.sender.subscribe();
        let snapshot = backlog.clone();
        drop(backlog);

        self.peers.write().await.insert(info.peer_id, info);
        Membership {
            receiver,
            backlog: snapshot,
        }
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Broadcast an ephemeral message to every subscriber.
    ///
    /// Returns the number of receivers; filtering the sender is the
    /// receiver's job.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes directly.
    pub fn broadcast_raw(&self, frame: Frame) -> usize {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.sender.send(frame).unwrap_or(0)
    }

    /// Append to the backlog, then broadcast.
    pub async fn record_and_broadcast(&self, frame: Frame) -> usize {
        let mut backlog = self.backlog.write().await;
        backlog.push(frame.clone());
        self.broadcast_raw(frame)
    }

    /// Count messages a lagging receiver missed.
    pub fn record_dropped(&self, n: u64) {
        self.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn backlog_len(&self) -> usize {
        self.backlog.read().await.len()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
            backlog_len: self.backlog.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Room manager: maps document IDs to broadcast groups.
///
/// Each document gets its own group so messages are isolated between
/// documents.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create a room for the given document.
    pub async fn get_or_create(&self, doc_id: Uuid) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(doc_id)
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    pub async fn get(&self, doc_id: &Uuid) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    /// Remove a room with no peers and no history.
    pub async fn remove_if_empty(&self, doc_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc_id) {
            if room.peer_count().await == 0 && room.backlog_len().await == 0 {
                rooms.remove(doc_id);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
