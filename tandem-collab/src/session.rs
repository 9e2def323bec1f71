//! Sync session state machine.
//!
//! ```text
//!            open             SYNC_STEP
//! Connecting ────► Syncing ─────────────► Synced
//!     ▲               │                     │
//!     │               └──── close/error ────┤
//!     │                                     ▼
//! Reconnecting ◄──────── backoff ────── Disconnected
//!
//!   close() / auth rejected (any state) ──► Closed
//! ```
//!
//! [`SessionMachine`] does no I/O: it takes decoded messages and transport
//! notifications, mutates the binding and presence registry it is handed,
//! and returns the messages to send plus the events to surface. The client
//! driver owns the sockets and timers.
//!
//! Reference: Kleppmann, DDIA Chapter 5, "Handling Node Outages"

use std::time::Duration;

use rand::Rng;
use tandem_core::{Op, Replica, ReplicaError, ReplicaId, TextEdit};
use thiserror::Error;

use crate::binding::{EditorBinding, TextWidget};
use crate::presence::{PresenceEntry, PresenceRegistry};
use crate::protocol::{Message, ProtocolError};
use crate::storage::StoreError;

/// Default cap on op batches waiting for a handshake.
pub const DEFAULT_MAX_PENDING: usize = 10_000;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    Syncing,
    Synced,
    Disconnected,
    Reconnecting,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// A transport is open (handshaking or synced).
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Syncing | SessionState::Synced)
    }
}

/// Read-only projection for status indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub synced: bool,
    /// Remote peers with presence.
    pub peer_count: usize,
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("relay rejected credentials: {0}")]
    AuthRejected(String),

    #[error("session closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Replica(#[from] ReplicaError),
}

/// What the session reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(SessionState),
    /// Remote ops changed the visible text; the widget already shows it.
    RemoteEdit(Vec<TextEdit>),
    PresenceChanged {
        replica_id: ReplicaId,
        entry: Option<PresenceEntry>,
    },
    Error(SessionError),
}

/// Result of feeding one input to the machine.
#[derive(Debug, Default)]
pub struct Step {
    pub outbound: Vec<Message>,
    pub events: Vec<ClientEvent>,
}

impl Step {
    fn send(&mut self, msg: Message) {
        self.outbound.push(msg);
    }

    fn emit(&mut self, event: ClientEvent) {
        self.events.push(event);
    }
}

// ───────────────────────────────────────────────────────────────────
// Pending queue
// ───────────────────────────────────────────────────────────────────

/// Bookkeeping for local op batches produced while not synced.
///
/// Only counts are kept: the replica holds the ops themselves, and the next
/// handshake delta carries every one of them, so nothing is ever replayed
/// from here. The cap only decides when to warn.
pub struct PendingQueue {
    batches: usize,
    ops: usize,
    max_ops: usize,
}

impl PendingQueue {
    pub fn new(max_ops: usize) -> Self {
        Self {
            batches: 0,
            ops: 0,
            max_ops,
        }
    }

    /// Count a batch of `ops` ops. Returns `false` if it would exceed the
    /// cap; the ops still reach peers through the next handshake.
    pub fn enqueue(&mut self, ops: usize) -> bool {
        if self.ops + ops > self.max_ops {
            return false;
        }
        self.ops += ops;
        self.batches += 1;
        true
    }

    pub fn clear(&mut self) {
        self.batches = 0;
        self.ops = 0;
    }

    /// Number of queued batches.
    pub fn len(&self) -> usize {
        self.batches
    }

    pub fn is_empty(&self) -> bool {
        self.batches == 0
    }

    /// Total queued ops across batches.
    pub fn op_count(&self) -> usize {
        self.ops
    }
}

// ───────────────────────────────────────────────────────────────────
// Backoff
// ───────────────────────────────────────────────────────────────────

/// Reconnect backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    /// Fraction of the delay randomized either way, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    /// `jitter` clamped to `0.0..=1.0`; NaN and infinities count as none.
    pub fn effective_jitter(&self) -> f64 {
        if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn for_testing() -> Self {
        Self {
            base: Duration::from_millis(20),
            factor: 2.0,
            max: Duration::from_millis(200),
            jitter: 0.1,
        }
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Un-jittered delay for the given attempt, capped at `max`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.config.factor.powi(attempt.min(32) as i32);
        let nanos = self.config.base.as_nanos() as f64 * exp;
        Duration::from_nanos(nanos.min(self.config.max.as_nanos() as f64) as u64)
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = self.config.effective_jitter();
        if jitter == 0.0 {
            return delay;
        }
        let scale = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        Duration::from_secs_f64(delay.as_secs_f64() * scale).min(self.config.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// ───────────────────────────────────────────────────────────────────
// Machine
// ───────────────────────────────────────────────────────────────────

/// Protocol state for one document session.
pub struct SessionMachine {
    doc_id: String,
    auth_token: String,
    replica_id: ReplicaId,
    state: SessionState,
    pending: PendingQueue,
}

impl SessionMachine {
    pub fn new(
        doc_id: impl Into<String>,
        auth_token: impl Into<String>,
        replica_id: ReplicaId,
        max_pending: usize,
    ) -> Self {
        Self {
            doc_id: doc_id.into(),
            auth_token: auth_token.into(),
            replica_id,
            state: SessionState::Connecting,
            pending: PendingQueue::new(max_pending),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn pending(&self) -> &PendingQueue {
        &self.pending
    }

    pub fn status(&self, presence: &PresenceRegistry) -> ConnectionStatus {
        ConnectionStatus {
            connected: self.state.is_connected(),
            synced: self.state == SessionState::Synced,
            peer_count: presence.peer_count(),
        }
    }

    fn transition(&mut self, to: SessionState, step: &mut Step) {
        if self.state != to {
            log::debug!("Session {}: {:?} -> {:?}", self.doc_id, self.state, to);
            self.state = to;
            step.emit(ClientEvent::StateChanged(to));
        }
    }

    /// A new transport attempt is starting.
    pub fn on_connecting(&mut self) -> Step {
        let mut step = Step::default();
        if self.state != SessionState::Closed {
            self.transition(SessionState::Connecting, &mut step);
        }
        step
    }

    /// The transport is open: say hello with our current state vector.
    pub fn on_open(&mut self, replica: &Replica) -> Step {
        let mut step = Step::default();
        if self.state != SessionState::Connecting {
            log::warn!("Transport opened in state {:?}, ignoring", self.state);
            return step;
        }
        step.send(Message::Hello {
            doc_id: self.doc_id.clone(),
            auth_token: self.auth_token.clone(),
            replica_id: self.replica_id,
            state_vector: replica.state_vector(),
        });
        self.transition(SessionState::Syncing, &mut step);
        step
    }

    /// Handle one decoded inbound message.
    pub fn on_message<W: TextWidget>(
        &mut self,
        msg: Message,
        binding: &mut EditorBinding<W>,
        presence: &mut PresenceRegistry,
    ) -> Step {
        let mut step = Step::default();
        if !self.state.is_connected() {
            log::debug!("Dropping {:?} received in state {:?}", msg.message_type(), self.state);
            return step;
        }

        match msg {
            Message::Update { ops } => {
                let outcome = binding.apply_remote(ops);
                log::debug!(
                    "Merged update: {} applied, {} duplicate, {} parked, {} dropped",
                    outcome.applied,
                    outcome.duplicates,
                    outcome.parked,
                    outcome.dropped
                );
                if outcome.changed_text() {
                    step.emit(ClientEvent::RemoteEdit(outcome.edits));
                }
            }
            Message::SyncStep { state_vector } => {
                let delta = binding.replica().delta_since(&state_vector);
                if !delta.is_empty() {
                    log::debug!("Sending {} ops the relay is missing", delta.len());
                    step.send(Message::Update { ops: delta });
                }
                self.pending.clear();
                step.send(Message::Presence {
                    replica_id: self.replica_id,
                    entry: Some(presence.announce()),
                });
                self.transition(SessionState::Synced, &mut step);
            }
            Message::Presence { replica_id, entry } => {
                if presence.apply_remote(replica_id, entry.clone()) {
                    step.emit(ClientEvent::PresenceChanged { replica_id, entry });
                }
            }
            Message::Ping => step.send(Message::Pong),
            Message::Pong => {}
            Message::Hello { .. } => log::warn!("Unexpected HELLO from relay, dropped"),
        }
        step
    }

    /// Local ops were produced. Sent right away when synced, queued otherwise.
    pub fn on_local_ops(&mut self, ops: Vec<Op>) -> Step {
        let mut step = Step::default();
        if ops.is_empty() || self.state == SessionState::Closed {
            return step;
        }
        if self.state == SessionState::Synced {
            step.send(Message::Update { ops });
        } else if !self.pending.enqueue(ops.len()) {
            log::warn!(
                "Pending queue full ({} ops); edits will travel with the next handshake",
                self.pending.op_count()
            );
        }
        step
    }

    /// Local presence to broadcast. Dropped unless synced.
    pub fn on_local_presence(&mut self, entry: PresenceEntry) -> Step {
        let mut step = Step::default();
        if self.state == SessionState::Synced {
            step.send(Message::Presence {
                replica_id: self.replica_id,
                entry: Some(entry),
            });
        }
        step
    }

    /// Transport closed or failed. Remote presence goes immediately.
    pub fn on_disconnect(&mut self, presence: &mut PresenceRegistry) -> Step {
        let mut step = Step::default();
        if self.state == SessionState::Closed {
            return step;
        }
        let peers: Vec<ReplicaId> = presence.remote_peers().map(|p| p.entry.replica_id).collect();
        presence.clear_remote();
        for replica_id in peers {
            step.emit(ClientEvent::PresenceChanged {
                replica_id,
                entry: None,
            });
        }
        self.transition(SessionState::Disconnected, &mut step);
        step
    }

    /// A reconnect has been scheduled.
    pub fn on_reconnect_scheduled(&mut self) -> Step {
        let mut step = Step::default();
        if self.state == SessionState::Disconnected {
            self.transition(SessionState::Reconnecting, &mut step);
        }
        step
    }

    /// The relay refused our token. Terminal.
    pub fn on_auth_rejected(&mut self, reason: &str, presence: &mut PresenceRegistry) -> Step {
        let mut step = self.on_disconnect(presence);
        log::warn!("Relay rejected credentials for {}: {reason}", self.doc_id);
        step.emit(ClientEvent::Error(SessionError::AuthRejected(
            reason.to_string(),
        )));
        self.pending.clear();
        self.transition(SessionState::Closed, &mut step);
        step
    }

    /// Deliberate close. Pending ops are discarded, not flushed.
    pub fn close(&mut self) -> Step {
        let mut step = Step::default();
        self.pending.clear();
        self.transition(SessionState::Closed, &mut step);
        step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::BufferWidget;
    use tandem_core::StateVector;

    struct Peer {
        machine: SessionMachine,
        binding: EditorBinding<BufferWidget>,
        presence: PresenceRegistry,
    }

    impl Peer {
        fn new() -> Self {
            let replica = Replica::random();
            let id = replica.id();
            Self {
                machine: SessionMachine::new("doc", "token", id, 100),
                binding: EditorBinding::new(replica, BufferWidget::default()),
                presence: PresenceRegistry::with_intervals(
                    id,
                    "tester",
                    Duration::ZERO,
                    Duration::from_secs(300),
                ),
            }
        }

        fn recv(&mut self, msg: Message) -> Step {
            self.machine
                .on_message(msg, &mut self.binding, &mut self.presence)
        }

        fn type_text(&mut self, offset: usize, text: &str) -> Step {
            let edit = self.binding.widget_mut().user_edit(offset, 0, text);
            let ops = self.binding.on_local_edit(&edit).unwrap();
            self.machine.on_local_ops(ops)
        }

        fn synced(mut self) -> Self {
            let replica = self.binding.replica().clone();
            self.machine.on_open(&replica);
            self.recv(Message::SyncStep {
                state_vector: StateVector::new(),
            });
            assert_eq!(self.machine.state(), SessionState::Synced);
            self
        }
    }

    #[test]
    fn test_open_sends_hello() {
        let mut peer = Peer::new();
        let replica = peer.binding.replica().clone();
        let step = peer.machine.on_open(&replica);

        match &step.outbound[..] {
            [Message::Hello {
                doc_id,
                auth_token,
                replica_id,
                ..
            }] => {
                assert_eq!(doc_id, "doc");
                assert_eq!(auth_token, "token");
                assert_eq!(*replica_id, replica.id());
            }
            other => panic!("expected HELLO, got {other:?}"),
        }
        assert_eq!(peer.machine.state(), SessionState::Syncing);
        assert_eq!(
            step.events,
            vec![ClientEvent::StateChanged(SessionState::Syncing)]
        );
    }

    #[test]
    fn test_offline_edits_queue_then_travel_in_handshake() {
        let mut peer = Peer::new();
        let step = peer.type_text(0, "hello");
        assert!(step.outbound.is_empty());
        assert_eq!(peer.machine.pending().op_count(), 5);

        let replica = peer.binding.replica().clone();
        peer.machine.on_open(&replica);
        let step = peer.recv(Message::SyncStep {
            state_vector: StateVector::new(),
        });

        assert!(matches!(&step.outbound[0], Message::Update { ops } if ops.len() == 5));
        assert!(matches!(&step.outbound[1], Message::Presence { entry: Some(_), .. }));
        assert!(peer.machine.pending().is_empty());
        assert!(step
            .events
            .contains(&ClientEvent::StateChanged(SessionState::Synced)));
    }

    #[test]
    fn test_handshake_skips_ops_relay_has() {
        let mut peer = Peer::new();
        peer.type_text(0, "abc");
        let relay_sv = peer.binding.replica().state_vector();

        let replica = peer.binding.replica().clone();
        peer.machine.on_open(&replica);
        let step = peer.recv(Message::SyncStep {
            state_vector: relay_sv,
        });
        assert!(!step
            .outbound
            .iter()
            .any(|m| matches!(m, Message::Update { .. })));
    }

    #[test]
    fn test_synced_sends_immediately() {
        let mut peer = Peer::new().synced();
        let step = peer.type_text(0, "x");
        assert!(matches!(&step.outbound[..], [Message::Update { ops }] if ops.len() == 1));
        assert!(peer.machine.pending().is_empty());
    }

    #[test]
    fn test_remote_update_reaches_widget() {
        let mut peer = Peer::new().synced();
        let mut other = Replica::random();
        let ops = other.insert(0, "remote").unwrap();

        let step = peer.recv(Message::Update { ops });
        assert_eq!(
            step.events,
            vec![ClientEvent::RemoteEdit(vec![TextEdit::insert(0, "remote")])]
        );
        assert_eq!(peer.binding.widget().as_str(), "remote");
    }

    #[test]
    fn test_ping_answered() {
        let mut peer = Peer::new().synced();
        let step = peer.recv(Message::Ping);
        assert_eq!(step.outbound, vec![Message::Pong]);
    }

    #[test]
    fn test_disconnect_clears_presence_keeps_replica() {
        let mut peer = Peer::new().synced();
        peer.type_text(0, "kept");
        let remote = ReplicaId::random();
        peer.recv(Message::Presence {
            replica_id: remote,
            entry: Some(PresenceEntry::new(remote, "other")),
        });
        assert_eq!(peer.machine.status(&peer.presence).peer_count, 1);

        let step = peer.machine.on_disconnect(&mut peer.presence);
        assert_eq!(peer.presence.peer_count(), 0);
        assert!(step.events.contains(&ClientEvent::PresenceChanged {
            replica_id: remote,
            entry: None
        }));
        assert_eq!(peer.machine.state(), SessionState::Disconnected);

        // Still editable offline.
        let step = peer.type_text(4, "!");
        assert!(step.outbound.is_empty());
        assert_eq!(peer.binding.replica().snapshot(), "kept!");

        let status = peer.machine.status(&peer.presence);
        assert!(!status.connected && !status.synced);
    }

    #[test]
    fn test_messages_dropped_when_not_connected() {
        let mut peer = Peer::new();
        let mut other = Replica::random();
        let step = peer.recv(Message::Update {
            ops: other.insert(0, "late").unwrap(),
        });
        assert!(step.events.is_empty());
        assert!(peer.binding.replica().is_empty());
    }

    #[test]
    fn test_reconnect_cycle() {
        let mut peer = Peer::new().synced();
        peer.machine.on_disconnect(&mut peer.presence);
        peer.machine.on_reconnect_scheduled();
        assert_eq!(peer.machine.state(), SessionState::Reconnecting);
        peer.machine.on_connecting();
        assert_eq!(peer.machine.state(), SessionState::Connecting);
    }

    #[test]
    fn test_auth_rejection_is_terminal() {
        let mut peer = Peer::new();
        let replica = peer.binding.replica().clone();
        peer.machine.on_open(&replica);
        let step = peer.machine.on_auth_rejected("bad token", &mut peer.presence);

        assert!(step.events.contains(&ClientEvent::Error(SessionError::AuthRejected(
            "bad token".into()
        ))));
        assert_eq!(peer.machine.state(), SessionState::Closed);

        peer.machine.on_connecting();
        peer.machine.on_reconnect_scheduled();
        assert_eq!(peer.machine.state(), SessionState::Closed);
    }

    #[test]
    fn test_close_discards_pending() {
        let mut peer = Peer::new();
        peer.type_text(0, "unsent");
        assert!(!peer.machine.pending().is_empty());

        peer.machine.close();
        assert!(peer.machine.pending().is_empty());
        assert_eq!(peer.machine.state(), SessionState::Closed);
        assert!(peer.type_text(0, "more").outbound.is_empty());
        assert_eq!(peer.binding.replica().snapshot(), "moreunsent");
    }

    #[test]
    fn test_pending_queue_capacity() {
        let mut queue = PendingQueue::new(3);
        assert!(queue.enqueue(2));
        assert!(!queue.enqueue(2));
        assert!(queue.enqueue(1));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.op_count(), 3);

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.op_count(), 0);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(BackoffConfig {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(1),
            jitter: 0.0,
        });
        let delays: Vec<u128> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_jitter_within_bounds() {
        let mut backoff = Backoff::new(BackoffConfig {
            base: Duration::from_millis(1000),
            factor: 1.0,
            max: Duration::from_secs(10),
            jitter: 0.25,
        });
        for _ in 0..50 {
            let ms = backoff.next_delay().as_millis();
            assert!((750..=1250).contains(&ms), "delay {ms}ms out of range");
        }
    }

    #[test]
    fn test_backoff_ignores_non_finite_jitter() {
        for jitter in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut backoff = Backoff::new(BackoffConfig {
                base: Duration::from_millis(100),
                factor: 2.0,
                max: Duration::from_secs(1),
                jitter,
            });
            assert_eq!(backoff.next_delay(), Duration::from_millis(100));
            assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        }
    }
}
