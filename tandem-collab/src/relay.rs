//! WebSocket relay with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (doc_id) ── Replica (op store) ── BroadcastGroup
//! Client B ──┘        │                                     │
//!                     ├── presence cache                    │
//!                     └── SnapshotStore (load / save)       │
//!                                          ┌────────────────┼───────────┐
//!                                          ▼                ▼           ▼
//!                                       Client A         Client B    Client C
//! ```
//!
//! The relay never resolves conflicts. It merges incoming ops into a room
//! replica only so it can answer handshakes with a delta and persist the
//! op-log when the last editor leaves; frames are forwarded as received.
//!
//! Handshake, per connection:
//! 1. client → `HELLO{doc, token, replica, sv}`
//! 2. relay validates the token (close code 1008 on rejection)
//! 3. relay → `UPDATE{delta_since(sv)}` (if any), `SYNC_STEP{relay sv}`,
//!    then one `PRESENCE` per peer already in the room
//! 4. client → `UPDATE{what the relay lacks}`, `PRESENCE{self}`
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 5

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use futures_util::{SinkExt, StreamExt};
use tandem_core::{Replica, ReplicaId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{BroadcastGroup, ConnId, Departure, Envelope, RoomManager};
use crate::presence::PresenceEntry;
use crate::protocol::{FrameBuffer, Message};
use crate::storage::SnapshotStore;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

impl RelayConfig {
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            max_peers_per_room: 10,
            broadcast_capacity: 64,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub auth_failures: u64,
    pub persisted_snapshots: u64,
}

/// What the relay knows about an open document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentInfo {
    pub doc_id: String,
    /// Display names of editors that have announced presence
    pub editors: Vec<String>,
    /// Connected editors, announced or not
    pub editor_count: usize,
    /// Visible length in chars
    pub content_length: usize,
    pub last_modified: SystemTime,
}

// ───────────────────────────────────────────────────────────────────
// Token validation
// ───────────────────────────────────────────────────────────────────

/// Decides whether a `HELLO` may join a document.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, doc_id: &str, token: &str) -> bool;
}

/// Accepts every token.
pub struct AllowAll;

impl TokenValidator for AllowAll {
    fn validate(&self, _doc_id: &str, _token: &str) -> bool {
        true
    }
}

/// Accepts a fixed set of tokens for every document.
pub struct StaticTokens {
    tokens: HashSet<String>,
}

impl StaticTokens {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a comma-separated list, ignoring blanks.
    pub fn parse(list: &str) -> Self {
        Self::new(
            list.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty()),
        )
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl TokenValidator for StaticTokens {
    fn validate(&self, _doc_id: &str, token: &str) -> bool {
        self.tokens.contains(token)
    }
}

// ───────────────────────────────────────────────────────────────────
// Rooms
// ───────────────────────────────────────────────────────────────────

struct RoomState {
    replica: Replica,
    presence: HashMap<ReplicaId, PresenceEntry>,
    last_modified: SystemTime,
}

/// Document room: op store + presence cache + broadcast group.
struct DocumentRoom {
    state: Mutex<RoomState>,
    broadcast: BroadcastGroup,
}

impl DocumentRoom {
    /// Create a room, seeding it from the store when a snapshot exists.
    fn open(doc_id: &str, store: Option<&dyn SnapshotStore>, capacity: usize) -> Self {
        let relay_id = ReplicaId::random();
        let replica = match store.map(|s| s.load_snapshot(doc_id)) {
            Some(Ok(Some(bytes))) => match Replica::load(relay_id, &bytes) {
                Ok(replica) => {
                    log::info!(
                        "Loaded snapshot for doc {doc_id} ({} ops)",
                        replica.op_count()
                    );
                    replica
                }
                Err(e) => {
                    log::error!("Unreadable snapshot for doc {doc_id}: {e}");
                    Replica::new(relay_id)
                }
            },
            Some(Err(e)) => {
                log::error!("Failed to load snapshot for doc {doc_id}: {e}");
                Replica::new(relay_id)
            }
            Some(Ok(None)) | None => Replica::new(relay_id),
        };

        Self {
            state: Mutex::new(RoomState {
                replica,
                presence: HashMap::new(),
                last_modified: SystemTime::now(),
            }),
            broadcast: BroadcastGroup::new(capacity),
        }
    }

    fn state(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Save the op-log. Returns whether a snapshot was written.
    fn persist(&self, doc_id: &str, store: &dyn SnapshotStore) -> bool {
        let bytes = match self.state().replica.encode_state() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to encode doc {doc_id}: {e}");
                return false;
            }
        };
        match store.save_snapshot(doc_id, &bytes) {
            Ok(()) => {
                log::info!("Persisted snapshot for doc {doc_id} (room closing)");
                true
            }
            Err(e) => {
                log::error!("Failed to persist snapshot for doc {doc_id}: {e}");
                false
            }
        }
    }
}

impl AsRef<BroadcastGroup> for DocumentRoom {
    fn as_ref(&self) -> &BroadcastGroup {
        &self.broadcast
    }
}

// ───────────────────────────────────────────────────────────────────
// Relay
// ───────────────────────────────────────────────────────────────────

struct Shared {
    config: RelayConfig,
    rooms: RoomManager<DocumentRoom>,
    stats: RwLock<RelayStats>,
    store: Option<Arc<dyn SnapshotStore>>,
    validator: Arc<dyn TokenValidator>,
}

/// The relay server.
#[derive(Clone)]
pub struct Relay {
    shared: Arc<Shared>,
}

/// Per-connection state once `HELLO` has been accepted.
struct Member {
    doc_id: String,
    replica_id: ReplicaId,
    conn: ConnId,
    room: Arc<DocumentRoom>,
}

enum Reply {
    Frames(Vec<Vec<u8>>),
    Close(CloseCode, &'static str),
}

impl Reply {
    fn none() -> Self {
        Reply::Frames(Vec::new())
    }

    fn one(msg: &Message) -> Result<Self, BoxError> {
        Ok(Reply::Frames(vec![msg.encode()?]))
    }
}

impl Relay {
    /// Relay with no persistence that accepts every token.
    pub fn new(config: RelayConfig) -> Self {
        Self::build(config, None, Arc::new(AllowAll))
    }

    pub fn with_store(config: RelayConfig, store: Arc<dyn SnapshotStore>) -> Self {
        Self::build(config, Some(store), Arc::new(AllowAll))
    }

    pub fn build(
        config: RelayConfig,
        store: Option<Arc<dyn SnapshotStore>>,
        validator: Arc<dyn TokenValidator>,
    ) -> Self {
        let rooms = RoomManager::new(config.max_peers_per_room);
        Self {
            shared: Arc::new(Shared {
                config,
                rooms,
                stats: RwLock::new(RelayStats::default()),
                store,
                validator,
            }),
        }
    }

    /// Bind `config.bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = shared.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.shared.stats.read().await.clone();
        stats.active_rooms = self.shared.rooms.room_count().await;
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub async fn room_count(&self) -> usize {
        self.shared.rooms.room_count().await
    }

    /// Editors and content size of an open document.
    pub async fn document_info(&self, doc_id: &str) -> Option<DocumentInfo> {
        let room = self.shared.rooms.get(doc_id).await?;
        let editor_count = room.broadcast.peer_count().await;
        let state = room.state();
        let mut editors: Vec<String> = state
            .presence
            .values()
            .map(|p| p.display.name.clone())
            .collect();
        editors.sort();
        Some(DocumentInfo {
            doc_id: doc_id.to_string(),
            editors,
            editor_count,
            content_length: state.replica.len(),
            last_modified: state.last_modified,
        })
    }

    /// Info for every open document, sorted by id.
    pub async fn documents(&self) -> Vec<DocumentInfo> {
        let mut doc_ids = self.shared.rooms.active_documents().await;
        doc_ids.sort();
        let mut documents = Vec::with_capacity(doc_ids.len());
        for doc_id in doc_ids {
            // A room may close between listing and lookup.
            if let Some(info) = self.document_info(&doc_id).await {
                documents.push(info);
            }
        }
        documents
    }

    /// Current visible text of an open document.
    pub async fn document_text(&self, doc_id: &str) -> Option<String> {
        let room = self.shared.rooms.get(doc_id).await?;
        let text = room.state().replica.snapshot();
        Some(text)
    }
}

impl Shared {
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut member: Option<Member> = None;
        let result = self.pump(ws_stream, addr, &mut member).await;

        if let Some(m) = member {
            self.depart(m).await;
        }
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    /// Move frames between one socket and its room until either side stops.
    async fn pump(
        &self,
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        member: &mut Option<Member>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut broadcast_rx: Option<broadcast::Receiver<Envelope>> = None;
        let mut frames = FrameBuffer::new();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(WsMessage::Binary(data))) => {
                            frames.extend(&data);
                            loop {
                                let frame = match frames.next_frame() {
                                    Ok(Some(frame)) => frame,
                                    Ok(None) => break,
                                    Err(e) => {
                                        log::warn!("Bad frame from {addr}: {e}");
                                        break;
                                    }
                                };
                                {
                                    let mut s = self.stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += frame.len() as u64;
                                }
                                let msg = match Message::decode(&frame) {
                                    Ok(msg) => msg,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };
                                match self.handle_message(msg, frame, member, &mut broadcast_rx).await? {
                                    Reply::Frames(out) => {
                                        for bytes in out {
                                            ws_sender.send(WsMessage::Binary(bytes.into())).await?;
                                        }
                                    }
                                    Reply::Close(code, reason) => {
                                        log::info!("Closing {addr}: {reason}");
                                        ws_sender
                                            .send(WsMessage::Close(Some(CloseFrame {
                                                code,
                                                reason: reason.into(),
                                            })))
                                            .await?;
                                        // Give the client a moment to acknowledge.
                                        let _ = tokio::time::timeout(Duration::from_secs(1), async {
                                            while let Some(Ok(_)) = ws_receiver.next().await {}
                                        })
                                        .await;
                                        return Ok(());
                                    }
                                }
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            ws_sender.send(WsMessage::Pong(data)).await?;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }
                        _ => {}
                    }
                }

                env = async {
                    match broadcast_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match env {
                        Ok(env) => {
                            if member.as_ref().is_some_and(|m| m.replica_id == env.from) {
                                continue;
                            }
                            ws_sender.send(WsMessage::Binary(env.frame.to_vec().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // Missed ops come back with the client's next handshake.
                            log::warn!("Peer at {addr} lagged by {n} messages, disconnecting");
                            if let Some(m) = member.as_ref() {
                                m.room.broadcast.record_dropped(n);
                            }
                            return Ok(());
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
            }
        }
    }

    async fn handle_message(
        &self,
        msg: Message,
        frame: Vec<u8>,
        member: &mut Option<Member>,
        broadcast_rx: &mut Option<broadcast::Receiver<Envelope>>,
    ) -> Result<Reply, BoxError> {
        match msg {
            Message::Hello {
                doc_id,
                auth_token,
                replica_id,
                state_vector,
            } => {
                if member.is_some() {
                    log::warn!("Duplicate HELLO from {replica_id}, ignored");
                    return Ok(Reply::none());
                }
                if !self.validator.validate(&doc_id, &auth_token) {
                    self.stats.write().await.auth_failures += 1;
                    log::warn!("Rejected token from {replica_id} for doc {doc_id}");
                    return Ok(Reply::Close(CloseCode::Policy, "unauthorized"));
                }

                let store = self.store.clone();
                let capacity = self.config.broadcast_capacity;
                let Some(joined) = self
                    .rooms
                    .join(&doc_id, replica_id, || {
                        DocumentRoom::open(&doc_id, store.as_deref(), capacity)
                    })
                    .await
                else {
                    return Ok(Reply::Close(CloseCode::Again, "room full"));
                };

                let mut out = Vec::new();
                {
                    let state = joined.room.state();
                    let delta = state.replica.delta_since(&state_vector);
                    if !delta.is_empty() {
                        out.push(Message::Update { ops: delta }.encode()?);
                    }
                    out.push(
                        Message::SyncStep {
                            state_vector: state.replica.state_vector(),
                        }
                        .encode()?,
                    );
                    for (id, entry) in &state.presence {
                        if *id != replica_id {
                            out.push(
                                Message::Presence {
                                    replica_id: *id,
                                    entry: Some(entry.clone()),
                                }
                                .encode()?,
                            );
                        }
                    }
                }

                log::info!(
                    "Peer {replica_id} joined doc {doc_id}{}",
                    if joined.created { " (new room)" } else { "" }
                );
                *broadcast_rx = Some(joined.receiver);
                *member = Some(Member {
                    doc_id,
                    replica_id,
                    conn: joined.conn,
                    room: joined.room,
                });
                Ok(Reply::Frames(out))
            }

            Message::Ping => Reply::one(&Message::Pong),
            Message::Pong => Ok(Reply::none()),

            other => {
                let Some(m) = member.as_ref() else {
                    log::warn!("{:?} before HELLO, dropped", other.message_type());
                    return Ok(Reply::none());
                };
                self.handle_member_message(m, other, frame)
            }
        }
    }

    fn handle_member_message(
        &self,
        member: &Member,
        msg: Message,
        frame: Vec<u8>,
    ) -> Result<Reply, BoxError> {
        match msg {
            Message::Update { ops } => {
                let outcome = {
                    let mut state = member.room.state();
                    let outcome = state.replica.merge(ops);
                    if outcome.applied > 0 {
                        state.last_modified = SystemTime::now();
                    }
                    outcome
                };
                log::debug!(
                    "Update from {} on {}: {} applied, {} duplicate",
                    member.replica_id,
                    member.doc_id,
                    outcome.applied,
                    outcome.duplicates
                );
                member.room.broadcast.broadcast_raw(Envelope {
                    from: member.replica_id,
                    frame: Arc::new(frame),
                });
                Ok(Reply::none())
            }
            Message::Presence { replica_id, entry } => {
                if replica_id != member.replica_id {
                    log::warn!(
                        "Presence for {replica_id} sent by {}, dropped",
                        member.replica_id
                    );
                    return Ok(Reply::none());
                }
                log::trace!("Presence from {replica_id} on {}", member.doc_id);
                {
                    let mut state = member.room.state();
                    match entry {
                        Some(entry) => {
                            state.presence.insert(replica_id, entry);
                        }
                        None => {
                            state.presence.remove(&replica_id);
                        }
                    }
                }
                member.room.broadcast.broadcast_raw(Envelope {
                    from: member.replica_id,
                    frame: Arc::new(frame),
                });
                Ok(Reply::none())
            }
            Message::SyncStep { state_vector } => {
                let delta = member.room.state().replica.delta_since(&state_vector);
                Reply::one(&Message::Update { ops: delta })
            }
            Message::Hello { .. } | Message::Ping | Message::Pong => Ok(Reply::none()),
        }
    }

    /// Peer disconnected: drop its presence, tell the room, persist if it
    /// was the last one. Nothing happens if the replica has since rejoined
    /// on another connection.
    async fn depart(&self, member: Member) {
        let Member {
            doc_id,
            replica_id,
            conn,
            room: _,
        } = member;

        let mut persisted = false;
        let departure = self
            .rooms
            .leave(&doc_id, &replica_id, conn, |room, closing| {
                room.state().presence.remove(&replica_id);
                if closing {
                    if let Some(store) = self.store.as_deref() {
                        persisted = room.persist(&doc_id, store);
                    }
                    return;
                }
                let left = Message::Presence {
                    replica_id,
                    entry: None,
                };
                if let Err(e) = room.broadcast.broadcast(replica_id, &left) {
                    log::warn!("Failed to announce departure of {replica_id}: {e}");
                }
            })
            .await;

        match departure {
            Departure::Stale => {
                log::info!("Superseded connection of {replica_id} to doc {doc_id} ended");
                return;
            }
            Departure::Left => log::info!("Peer {replica_id} left doc {doc_id}"),
            Departure::Closed => {
                log::info!("Peer {replica_id} left doc {doc_id}");
                log::info!("Room {doc_id} removed (empty)");
            }
        }
        if persisted {
            self.stats.write().await.persisted_snapshots += 1;
        }
    }
}
