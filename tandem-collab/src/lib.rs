//! # tandem-collab: networked editing over `tandem-core` replicas
//!
//! Keeps a local text widget, its replica, and every other editor of the
//! same document in step through a WebSocket relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐                        ┌──────────────┐
//! │ TextWidget   │                        │ Relay        │
//! └──────┬───────┘                        │ (stateless   │
//!        │ TextEdit                       │  forwarder)  │
//! ┌──────▼───────┐      WebSocket         └──────┬───────┘
//! │ EditorBinding│    length-prefixed            │
//! │  + Replica   │      frames            ┌──────┴───────┐
//! └──────┬───────┘ ◄────────────────────► │ Room per doc │
//!        │                                │  op store    │
//! ┌──────▼───────┐                        │  presence    │
//! │ SyncClient   │                        │  Broadcast   │
//! │  Session,    │                        └──────┬───────┘
//! │  Presence    │                               │
//! └──────────────┘                        ┌──────▼───────┐
//!                                         │SnapshotStore │
//!                                         └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary frames (tag + bincode payload)
//! - [`session`]: Connection state machine, pending queue, backoff
//! - [`client`]: Async driver tying session, binding and transport together
//! - [`binding`]: Widget ⇄ replica adapter with caret/selection preservation
//! - [`presence`]: Cursor, selection and identity of remote peers
//! - [`relay`]: WebSocket relay with per-document rooms
//! - [`broadcast`]: Room fan-out with backpressure
//! - [`storage`]: Snapshot persistence (in-memory, RocksDB)

pub mod binding;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod diff;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use binding::{shift_offset, BufferWidget, EditorBinding, TextWidget};
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnId, Departure, Envelope, RoomManager};
pub use client::SyncClient;
pub use config::ClientConfig;
pub use diff::minimal_edit;
pub use presence::{
    CursorColor, PeerDisplay, PeerPresence, PresenceEntry, PresenceRegistry, PresenceStatus,
    Selection,
};
pub use protocol::{FrameBuffer, Message, MessageType, ProtocolError};
pub use relay::{AllowAll, DocumentInfo, Relay, RelayConfig, RelayStats, StaticTokens, TokenValidator};
pub use session::{
    Backoff, BackoffConfig, ClientEvent, ConnectionStatus, SessionError, SessionMachine,
    SessionState,
};
pub use storage::{MemoryStore, SnapshotStore, StoreError};
#[cfg(feature = "rocksdb")]
pub use storage::{DocumentMetadata, RocksStore, StoreConfig};
