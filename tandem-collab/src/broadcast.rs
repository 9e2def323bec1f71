//! Fan-out broadcast to N-1 peers with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! envelopes; a peer that falls further behind observes `Lagged`.
//!
//! Frames travel pre-encoded inside an [`Envelope`] that names the sending
//! replica, so connection tasks can skip their own messages without
//! decoding anything.
//!
//! Membership is one slot per replica, owned by the connection that last
//! joined with it. A replica that reconnects before its old socket is noticed
//! takes the slot over, and the old connection's departure becomes a no-op.
//!
//! Reference: Patterson & Hennessy, Section 6.4 (Interconnection Networks)

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tandem_core::ReplicaId;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::{Message, ProtocolError};

/// Identifies one connection's membership in a group.
pub type ConnId = u64;

/// One pre-encoded frame and the replica that sent it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: ReplicaId,
    pub frame: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Atomic broadcast stats, so the send path never takes a lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A broadcast group for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    /// Connected replicas and the connection holding each slot
    peers: RwLock<HashMap<ReplicaId, ConnId>>,
    next_conn: AtomicU64,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many envelopes each peer may have buffered before
    /// it starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            capacity,
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a peer and return its connection id and receiver. A replica
    /// already present is taken over by the new connection.
    pub async fn add_peer(&self, replica_id: ReplicaId) -> (ConnId, broadcast::Receiver<Envelope>) {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let mut peers = self.peers.write().await;
        if let Some(previous) = peers.insert(replica_id, conn) {
            log::debug!("Replica {replica_id} rejoined on connection {conn}, replacing {previous}");
        }
        (conn, self.sender.subscribe())
    }

    /// Remove `replica_id` if `conn` still holds its slot.
    pub async fn remove_peer(&self, replica_id: &ReplicaId, conn: ConnId) -> bool {
        let mut peers = self.peers.write().await;
        if peers.get(replica_id) != Some(&conn) {
            return false;
        }
        peers.remove(replica_id);
        true
    }

    /// Whether `conn` is the connection currently registered for `replica_id`.
    pub async fn is_current(&self, replica_id: &ReplicaId, conn: ConnId) -> bool {
        self.peers.read().await.get(replica_id) == Some(&conn)
    }

    /// Encode and broadcast a message on behalf of `from`.
    ///
    /// Returns the number of receivers, the sender's own included; skipping
    /// it is the receiver's job.
    pub fn broadcast(&self, from: ReplicaId, msg: &Message) -> Result<usize, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(Envelope { from, frame }))
    }

    /// Broadcast an already-encoded frame.
    pub fn broadcast_raw(&self, envelope: Envelope) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.atomic_stats
            .messages_sent
            .fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record envelopes a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<ReplicaId> {
        self.peers.read().await.keys().copied().collect()
    }

    pub async fn has_peer(&self, replica_id: &ReplicaId) -> bool {
        self.peers.read().await.contains_key(replica_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl AsRef<BroadcastGroup> for BroadcastGroup {
    fn as_ref(&self) -> &BroadcastGroup {
        self
    }
}

/// A peer's admission to a room.
pub struct Joined<R> {
    pub room: Arc<R>,
    pub conn: ConnId,
    pub receiver: broadcast::Receiver<Envelope>,
    /// The room did not exist before this join.
    pub created: bool,
}

/// What [`RoomManager::leave`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// The connection no longer held its replica's slot; nothing changed.
    Stale,
    /// Removed; other peers remain.
    Left,
    /// Removed, and the now-empty room was dropped.
    Closed,
}

/// Room manager: maps document ids to rooms.
///
/// Joins and leaves take the table's write lock for their whole duration,
/// so a room can never be removed between a peer looking it up and
/// subscribing to it.
pub struct RoomManager<R> {
    rooms: RwLock<HashMap<String, Arc<R>>>,
    max_peers_per_room: usize,
}

impl<R: AsRef<BroadcastGroup>> RoomManager<R> {
    pub fn new(max_peers_per_room: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            max_peers_per_room,
        }
    }

    /// Add `replica_id` to the room for `doc_id`, creating the room with
    /// `make` if needed. `None` if the room is full.
    pub async fn join(
        &self,
        doc_id: &str,
        replica_id: ReplicaId,
        make: impl FnOnce() -> R,
    ) -> Option<Joined<R>> {
        let mut rooms = self.rooms.write().await;
        let created = !rooms.contains_key(doc_id);
        let room = rooms
            .entry(doc_id.to_string())
            .or_insert_with(|| Arc::new(make()))
            .clone();

        let group: &BroadcastGroup = (*room).as_ref();
        if !group.has_peer(&replica_id).await
            && group.peer_count().await >= self.max_peers_per_room
        {
            log::warn!("Room {doc_id} is full ({} peers)", self.max_peers_per_room);
            return None;
        }
        let (conn, receiver) = group.add_peer(replica_id).await;
        Some(Joined {
            room,
            conn,
            receiver,
            created,
        })
    }

    /// Remove the membership `conn` holds for `replica_id`.
    ///
    /// `on_depart` runs under the table lock only when `conn` still owns the
    /// slot; its flag says whether the room is about to be dropped for being
    /// empty. A connection that was superseded by a rejoin leaves the room
    /// untouched.
    pub async fn leave(
        &self,
        doc_id: &str,
        replica_id: &ReplicaId,
        conn: ConnId,
        on_depart: impl FnOnce(&R, bool),
    ) -> Departure {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(doc_id).cloned() else {
            return Departure::Stale;
        };
        let group: &BroadcastGroup = (*room).as_ref();
        if !group.remove_peer(replica_id, conn).await {
            return Departure::Stale;
        }
        let closing = group.peer_count().await == 0;
        on_depart(&room, closing);
        if closing {
            rooms.remove(doc_id);
            Departure::Closed
        } else {
            Departure::Left
        }
    }

    pub async fn get(&self, doc_id: &str) -> Option<Arc<R>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
