//! Presence registry: cursors, selections and display info of every peer.
//!
//! ## Architecture
//!
//! ```text
//! Local caret move
//!       │
//!       ▼
//! PresenceRegistry::set_local()
//!       │  (throttled: 30/s, trailing change kept for flush_due())
//!       ▼
//! Message::Presence { replica_id, Some(entry) }
//!       │
//!       ▼   (relay fan-out)
//! Remote PresenceRegistry::apply_remote()
//!       │
//!       ▼
//! status_of() / remote_peers()  →  UI chrome
//! ```
//!
//! Entries are ephemeral: a disconnect clears every remote entry at once and
//! the relay announces `Presence { id, None }` when a peer leaves.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tandem_core::ReplicaId;

/// Default minimum interval between local presence broadcasts (30/s).
pub const DEFAULT_PRESENCE_INTERVAL: Duration = Duration::from_millis(33);

/// Default inactivity after which a peer is shown as idle.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Idle peers are dropped by [`PresenceRegistry::cleanup_idle`] after this
/// many idle timeouts without an update.
const EXPIRY_FACTOR: u32 = 6;

// ───────────────────────────────────────────────────────────────────
// Wire types
// ───────────────────────────────────────────────────────────────────

/// RGBA color for a peer's caret and selection highlight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a replica id.
    pub fn from_replica(id: ReplicaId) -> Self {
        let hue = (id.as_uuid().as_u128() % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        p + (q - p) * 6.0 * t
    } else if t < 0.5 {
        q
    } else if t < 2.0 / 3.0 {
        p + (q - p) * (2.0 / 3.0 - t) * 6.0
    } else {
        p
    }
}

/// Selected char range, `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

impl Selection {
    /// Build from two ends in either order.
    pub fn new(a: usize, b: usize) -> Self {
        Self {
            start: a.min(b),
            end: a.max(b),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerDisplay {
    pub name: String,
    pub color: CursorColor,
}

/// Presence state as sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub replica_id: ReplicaId,
    /// Caret offset in chars.
    pub cursor: usize,
    pub selection: Option<Selection>,
    pub display: PeerDisplay,
}

impl PresenceEntry {
    pub fn new(replica_id: ReplicaId, name: impl Into<String>) -> Self {
        Self {
            replica_id,
            cursor: 0,
            selection: None,
            display: PeerDisplay {
                name: name.into(),
                color: CursorColor::from_replica(replica_id),
            },
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Local records
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Active,
    /// No update within the idle timeout.
    Idle,
}

/// A remote peer's entry plus when we last heard from it.
#[derive(Debug, Clone)]
pub struct PeerPresence {
    pub entry: PresenceEntry,
    pub last_seen: Instant,
}

impl PeerPresence {
    pub fn status(&self, idle_timeout: Duration) -> PresenceStatus {
        if self.last_seen.elapsed() >= idle_timeout {
            PresenceStatus::Idle
        } else {
            PresenceStatus::Active
        }
    }
}

/// Tracks presence for the local replica and all remote peers of a document.
pub struct PresenceRegistry {
    local: PresenceEntry,
    peers: HashMap<ReplicaId, PeerPresence>,
    /// Minimum interval between local broadcasts.
    interval: Duration,
    last_broadcast: Option<Instant>,
    /// A local change was throttled and not yet broadcast.
    dirty: bool,
    idle_timeout: Duration,
}

impl PresenceRegistry {
    pub fn new(local_id: ReplicaId, display_name: impl Into<String>) -> Self {
        Self::with_intervals(
            local_id,
            display_name,
            DEFAULT_PRESENCE_INTERVAL,
            DEFAULT_IDLE_TIMEOUT,
        )
    }

    pub fn with_intervals(
        local_id: ReplicaId,
        display_name: impl Into<String>,
        interval: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            local: PresenceEntry::new(local_id, display_name),
            peers: HashMap::new(),
            interval,
            last_broadcast: None,
            dirty: false,
            idle_timeout,
        }
    }

    /// Update the local caret/selection.
    ///
    /// Returns the entry to broadcast, or `None` if throttled. A throttled
    /// change is released later by [`flush_due`](Self::flush_due).
    pub fn set_local(
        &mut self,
        cursor: usize,
        selection: Option<Selection>,
    ) -> Option<PresenceEntry> {
        let selection = selection.filter(|s| !s.is_empty());
        let unchanged = self.local.cursor == cursor && self.local.selection == selection;
        if unchanged && !self.dirty && self.last_broadcast.is_some() {
            return None;
        }
        self.local.cursor = cursor;
        self.local.selection = selection;

        if self.throttled() {
            log::trace!("Presence update throttled (cursor {cursor})");
            self.dirty = true;
            return None;
        }
        Some(self.announce())
    }

    /// Release a throttled local change once the interval has elapsed.
    pub fn flush_due(&mut self) -> Option<PresenceEntry> {
        if self.dirty && !self.throttled() {
            Some(self.announce())
        } else {
            None
        }
    }

    /// Time until a throttled change can be flushed.
    pub fn flush_deadline(&self) -> Option<Instant> {
        if !self.dirty {
            return None;
        }
        Some(self.last_broadcast.map_or_else(Instant::now, |t| t + self.interval))
    }

    /// Broadcast the local entry unconditionally (e.g. after a handshake).
    pub fn announce(&mut self) -> PresenceEntry {
        self.last_broadcast = Some(Instant::now());
        self.dirty = false;
        self.local.clone()
    }

    fn throttled(&self) -> bool {
        self.last_broadcast
            .is_some_and(|t| t.elapsed() < self.interval)
    }

    /// Set or remove a remote entry. Returns whether anything changed.
    ///
    /// Entries for the local replica are ignored.
    pub fn apply_remote(&mut self, replica_id: ReplicaId, entry: Option<PresenceEntry>) -> bool {
        if replica_id == self.local.replica_id {
            return false;
        }
        match entry {
            Some(mut entry) => {
                entry.replica_id = replica_id;
                log::trace!("Presence from {replica_id}: cursor {}", entry.cursor);
                let previous = self.peers.insert(
                    replica_id,
                    PeerPresence {
                        entry: entry.clone(),
                        last_seen: Instant::now(),
                    },
                );
                previous.map_or(true, |p| p.entry != entry)
            }
            None => {
                let removed = self.peers.remove(&replica_id).is_some();
                if removed {
                    log::debug!("Peer {replica_id} left");
                }
                removed
            }
        }
    }

    pub fn get(&self, replica_id: &ReplicaId) -> Option<&PeerPresence> {
        self.peers.get(replica_id)
    }

    pub fn local(&self) -> &PresenceEntry {
        &self.local
    }

    pub fn local_id(&self) -> ReplicaId {
        self.local.replica_id
    }

    pub fn remote_peers(&self) -> impl Iterator<Item = &PeerPresence> {
        self.peers.values()
    }

    /// Drop every remote entry; returns how many were removed.
    pub fn clear_remote(&mut self) -> usize {
        let n = self.peers.len();
        self.peers.clear();
        n
    }

    /// Number of remote peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn status_of(&self, replica_id: &ReplicaId) -> Option<PresenceStatus> {
        self.peers
            .get(replica_id)
            .map(|p| p.status(self.idle_timeout))
    }

    /// Remove peers that have been silent for several idle timeouts.
    pub fn cleanup_idle(&mut self) -> Vec<ReplicaId> {
        let expiry = self.idle_timeout * EXPIRY_FACTOR;
        let stale: Vec<ReplicaId> = self
            .peers
            .iter()
            .filter(|(_, p)| p.last_seen.elapsed() >= expiry)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }
}
