//! Sync client: drives one document session against a relay.
//!
//! Provides:
//! - Connection lifecycle (connect, reconnect with backoff, close)
//! - Local edits → ops → relay, remote ops → replica → widget
//! - Presence (cursor/selection) broadcast, throttled
//! - Keepalive and periodic op-log snapshots
//!
//! Everything runs on the caller's task. [`SyncClient::next_event`] is the
//! only suspension point; socket I/O happens in a spawned transport task
//! that just moves bytes.
//!
//! Reference: Kleppmann, DDIA Chapter 5 (Replication)

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tandem_core::{Op, Replica, ReplicaId, TextEdit};
use tokio::sync::mpsc;

use crate::binding::{BufferWidget, EditorBinding, TextWidget};
use crate::config::ClientConfig;
use crate::presence::{PresenceRegistry, Selection};
use crate::protocol::Message;
use crate::session::{
    Backoff, ClientEvent, ConnectionStatus, SessionError, SessionMachine, SessionState, Step,
};
use crate::storage::SnapshotStore;
use crate::transport::{self, TransportEvent, TransportEventKind, TransportHandle};

/// The sync client.
pub struct SyncClient<W: TextWidget = BufferWidget> {
    config: ClientConfig,
    binding: EditorBinding<W>,
    presence: PresenceRegistry,
    machine: SessionMachine,
    backoff: Backoff,
    store: Option<Arc<dyn SnapshotStore>>,

    transport: Option<TransportHandle>,
    epoch: u64,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,

    /// Events ready for `next_event`
    events: VecDeque<ClientEvent>,
    reconnect_at: Option<Instant>,
    last_inbound: Instant,
    next_ping: Option<Instant>,
    next_snapshot: Option<Instant>,
    /// Ops produced since the last snapshot save
    unsaved: bool,
}

impl<W: TextWidget> SyncClient<W> {
    /// Client over a fresh, empty replica.
    pub fn new(config: ClientConfig, widget: W) -> Self {
        Self::with_replica(config, Replica::random(), widget)
    }

    /// Client over an existing replica, e.g. one returned by
    /// [`close`](Self::close) or loaded by the caller.
    pub fn with_replica(config: ClientConfig, replica: Replica, widget: W) -> Self {
        let replica_id = replica.id();
        let presence = PresenceRegistry::with_intervals(
            replica_id,
            config.display_name.clone(),
            config.presence_interval,
            config.idle_timeout,
        );
        let machine = SessionMachine::new(
            config.doc_id.clone(),
            config.auth_token.clone(),
            replica_id,
            config.max_pending,
        );
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        Self {
            backoff: Backoff::new(config.backoff.clone()),
            binding: EditorBinding::new(replica, widget),
            presence,
            machine,
            store: None,
            transport: None,
            epoch: 0,
            transport_tx,
            transport_rx,
            events: VecDeque::new(),
            reconnect_at: None,
            last_inbound: Instant::now(),
            next_ping: None,
            next_snapshot: None,
            unsaved: false,
            config,
        }
    }

    /// Seed the replica from `store` (op-log or flattened text) and save
    /// back to it every `snapshot_interval`.
    pub fn open(
        config: ClientConfig,
        store: Arc<dyn SnapshotStore>,
        widget: W,
    ) -> Result<Self, SessionError> {
        let replica_id = ReplicaId::random();
        let replica = match store.load_snapshot(&config.doc_id)? {
            Some(bytes) => Replica::load(replica_id, &bytes)?,
            None => Replica::new(replica_id),
        };
        log::info!(
            "Opened doc {} with {} chars ({} ops)",
            config.doc_id,
            replica.len(),
            replica.op_count()
        );
        let mut client = Self::with_replica(config, replica, widget);
        client.next_snapshot = client.config.snapshot_interval.map(|i| Instant::now() + i);
        client.store = Some(store);
        Ok(client)
    }

    // ─── Accessors ───────────────────────────────────────────

    pub fn replica(&self) -> &Replica {
        self.binding.replica()
    }

    pub fn widget(&self) -> &W {
        self.binding.widget()
    }

    pub fn widget_mut(&mut self) -> &mut W {
        self.binding.widget_mut()
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.machine.status(&self.presence)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Op batches waiting for the next handshake.
    pub fn pending_len(&self) -> usize {
        self.machine.pending().len()
    }

    // ─── Lifecycle ───────────────────────────────────────────

    /// Start connecting. Must be called inside a tokio runtime.
    pub fn connect(&mut self) {
        if self.machine.state() == SessionState::Closed || self.transport.is_some() {
            return;
        }
        self.reconnect_at = None;
        let step = self.machine.on_connecting();
        self.apply(step);

        self.epoch += 1;
        let url = self.config.url();
        log::info!("Connecting to {url} (attempt {})", self.backoff.attempt() + 1);
        self.transport = Some(transport::spawn(
            url,
            self.epoch,
            self.config.connect_timeout,
            self.transport_tx.clone(),
        ));
    }

    /// Stop syncing and hand back the binding. Timers are cancelled and
    /// queued frames are dropped, not flushed.
    pub fn close(mut self) -> EditorBinding<W> {
        self.transport = None;
        let step = self.machine.close();
        self.apply(step);
        log::info!("Session for {} closed", self.config.doc_id);
        self.binding
    }

    // ─── Local input ─────────────────────────────────────────

    /// Record an edit the widget has already applied.
    pub fn local_edit(&mut self, edit: &TextEdit) -> Result<Vec<Op>, SessionError> {
        let ops = self.binding.on_local_edit(edit)?;
        if !ops.is_empty() {
            self.unsaved = true;
            let step = self.machine.on_local_ops(ops.clone());
            self.apply(step);
        }
        Ok(ops)
    }

    /// Move the local caret/selection and broadcast it unless throttled.
    pub fn set_cursor(&mut self, cursor: usize, selection: Option<Selection>) {
        let widget = self.binding.widget_mut();
        widget.set_selection(selection);
        widget.set_caret(cursor);
        if let Some(entry) = self.presence.set_local(cursor, selection) {
            let step = self.machine.on_local_presence(entry);
            self.apply(step);
        }
    }

    /// Persist the op-log now.
    pub fn save_snapshot(&mut self) -> Result<(), SessionError> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        let bytes = self.binding.replica().encode_state()?;
        store.save_snapshot(&self.config.doc_id, &bytes)?;
        self.unsaved = false;
        log::debug!("Saved snapshot for {} ({} bytes)", self.config.doc_id, bytes.len());
        Ok(())
    }

    // ─── Event loop ──────────────────────────────────────────

    /// Wait for the next event. `None` once the session is closed and
    /// every event has been delivered.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
            if self.machine.state() == SessionState::Closed {
                return None;
            }

            let deadline = self.next_deadline();
            tokio::select! {
                event = self.transport_rx.recv() => {
                    if let Some(event) = event {
                        self.on_transport(event);
                    }
                }
                _ = sleep_until(deadline) => self.on_timers(Instant::now()),
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let keepalive_expiry = self
            .transport
            .as_ref()
            .filter(|_| self.machine.state().is_connected())
            .map(|_| self.last_inbound + self.config.keepalive_timeout);
        [
            self.reconnect_at,
            self.next_ping,
            keepalive_expiry,
            self.presence.flush_deadline(),
            self.next_snapshot,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn on_transport(&mut self, event: TransportEvent) {
        if event.epoch != self.epoch {
            log::trace!("Ignoring event from stale transport {}", event.epoch);
            return;
        }
        match event.kind {
            TransportEventKind::Opened => {
                self.last_inbound = Instant::now();
                self.next_ping = Some(Instant::now() + self.config.keepalive_interval);
                let step = self.machine.on_open(self.binding.replica());
                self.apply(step);
            }
            TransportEventKind::Frame(frame) => {
                self.last_inbound = Instant::now();
                let msg = match Message::decode(&frame) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("Dropping undecodable frame: {e}");
                        return;
                    }
                };
                let was_synced = self.machine.state() == SessionState::Synced;
                let step = self
                    .machine
                    .on_message(msg, &mut self.binding, &mut self.presence);
                let remote_edit = step
                    .events
                    .iter()
                    .any(|e| matches!(e, ClientEvent::RemoteEdit(_)));
                self.apply(step);
                if remote_edit {
                    self.follow_widget_caret();
                }
                if !was_synced && self.machine.state() == SessionState::Synced {
                    log::info!("Synced {} with relay", self.config.doc_id);
                    self.backoff.reset();
                }
            }
            TransportEventKind::Closed {
                auth_rejected: true,
                reason,
            } => {
                self.stop_transport();
                let step = self.machine.on_auth_rejected(&reason, &mut self.presence);
                self.apply(step);
            }
            TransportEventKind::Closed { reason, .. } => {
                log::warn!("Transport closed: {reason}");
                self.disconnect();
            }
        }
    }

    fn on_timers(&mut self, now: Instant) {
        if self.reconnect_at.is_some_and(|t| t <= now) {
            self.reconnect_at = None;
            self.connect();
        }

        if self.transport.is_some() && self.machine.state().is_connected() {
            if now.duration_since(self.last_inbound) >= self.config.keepalive_timeout {
                log::warn!(
                    "No traffic for {:?}, dropping connection",
                    self.config.keepalive_timeout
                );
                self.disconnect();
            } else if self.next_ping.is_some_and(|t| t <= now) {
                self.send(&Message::Ping);
                self.next_ping = Some(now + self.config.keepalive_interval);
            }
        }

        if let Some(entry) = self.presence.flush_due() {
            let step = self.machine.on_local_presence(entry);
            self.apply(step);
        }

        if self.next_snapshot.is_some_and(|t| t <= now) {
            self.next_snapshot = self.config.snapshot_interval.map(|i| now + i);
            if self.unsaved {
                if let Err(e) = self.save_snapshot() {
                    log::error!("Snapshot save failed: {e}");
                    self.events.push_back(ClientEvent::Error(e));
                }
            }
        }
    }

    /// Re-announce the caret when remote edits have shifted it.
    fn follow_widget_caret(&mut self) {
        let widget = self.binding.widget();
        let (caret, selection) = (widget.caret(), widget.selection());
        let local = self.presence.local();
        if local.cursor != caret || local.selection != selection {
            log::trace!("Remote edit moved caret to {caret}");
            self.set_cursor(caret, selection);
        }
    }

    /// Transport lost: clear presence and schedule a reconnect.
    fn disconnect(&mut self) {
        self.stop_transport();
        let step = self.machine.on_disconnect(&mut self.presence);
        self.apply(step);

        let delay = self.backoff.next_delay();
        log::info!("Reconnecting in {delay:?}");
        self.reconnect_at = Some(Instant::now() + delay);
        let step = self.machine.on_reconnect_scheduled();
        self.apply(step);
    }

    fn stop_transport(&mut self) {
        self.transport = None;
        self.next_ping = None;
    }

    fn apply(&mut self, step: Step) {
        for msg in &step.outbound {
            self.send(msg);
        }
        self.events.extend(step.events);
    }

    fn send(&mut self, msg: &Message) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        match msg.encode() {
            Ok(frame) => {
                log::trace!("Sending {:?} ({} bytes)", msg.message_type(), frame.len());
                if !transport.send(frame) {
                    log::debug!("Transport already stopped, frame dropped");
                }
            }
            Err(e) => {
                log::warn!("Failed to encode {:?}: {e}", msg.message_type());
                self.events.push_back(ClientEvent::Error(e.into()));
            }
        }
    }
}

impl SyncClient<BufferWidget> {
    /// Edit the headless buffer as a user would and sync the result.
    pub fn type_text(
        &mut self,
        offset: usize,
        deleted: usize,
        inserted: &str,
    ) -> Result<Vec<Op>, SessionError> {
        let edit = self.widget_mut().user_edit(offset, deleted, inserted);
        self.local_edit(&edit)
    }

    pub fn text(&self) -> &str {
        self.widget().as_str()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}
