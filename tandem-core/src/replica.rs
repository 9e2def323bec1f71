//! Replica store: an RGA sequence CRDT over characters.
//!
//! ```text
//!   start ─► h ─► e ─► l ─► l ─► o          document order (tombstones kept)
//!            │                   ╳ deleted
//!            └─ origin of 'e'
//! ```
//!
//! Every character is an insertion op anchored on its causal predecessor.
//! A new insertion is placed right after its origin, skipping every following
//! element whose key `(lamport, replica, seq)` is greater than its own. Since
//! an insertion's Lamport value is always greater than its origin's, the skip
//! also jumps over the whole subtree of each greater sibling, and two replicas
//! that integrate the same ops in any causal order end up with the same
//! sequence.
//!
//! Deletions only flip a tombstone flag, so positions are never renumbered
//! and a concurrent insert anchored on a deleted character still lands where
//! its author meant it.
//!
//! Reference: Roh et al., "Replicated abstract data types: Building blocks
//! for collaborative applications" (2011)

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;

use crate::error::ReplicaError;
use crate::id::{OpId, ReplicaId};
use crate::op::{Op, TextEdit};
use crate::state_vector::StateVector;

/// Upper bound on ops waiting for missing dependencies.
pub const MAX_PENDING: usize = 10_000;

/// Prefix marking an op-log snapshot produced by [`Replica::encode_state`].
const SNAPSHOT_MAGIC: &[u8; 4] = b"TNDM";
const SNAPSHOT_VERSION: u8 = 1;

#[derive(Debug, Clone)]
struct Node {
    id: OpId,
    lamport: u64,
    content: char,
    deleted: bool,
}

impl Node {
    fn key(&self) -> (u64, ReplicaId, u64) {
        (self.lamport, self.id.replica, self.id.seq)
    }
}

#[derive(Serialize, Deserialize)]
struct OpLog {
    ops: Vec<Op>,
}

/// Result of merging a batch of foreign ops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Ops integrated, including previously parked ops released by this batch.
    pub applied: usize,
    /// Ops already known (idempotent re-delivery).
    pub duplicates: usize,
    /// Ops that had to wait for a missing dependency during this merge.
    pub parked: usize,
    /// Structurally invalid ops that were discarded.
    pub dropped: usize,
    /// Visible changes in application order, in char offsets.
    pub edits: Vec<TextEdit>,
}

impl MergeOutcome {
    /// Whether the merge changed the visible text.
    pub fn changed_text(&self) -> bool {
        !self.edits.is_empty()
    }
}

enum Readiness {
    Ready,
    Known,
    Blocked,
    Invalid(&'static str),
}

/// One replica of a shared text document.
#[derive(Debug, Clone)]
pub struct Replica {
    id: ReplicaId,
    /// Last seq handed out by this replica.
    seq: u64,
    /// Highest Lamport value seen.
    clock: u64,
    nodes: Vec<Node>,
    /// Lamport value of every integrated insertion.
    inserts: HashMap<OpId, u64>,
    /// Every integrated op in integration (causal) order.
    log: Vec<Op>,
    vector: StateVector,
    pending: Vec<Op>,
    visible: usize,
    /// Position of the most recently integrated node; typing hits it.
    hint: usize,
}

impl Replica {
    pub fn new(id: ReplicaId) -> Self {
        Self {
            id,
            seq: 0,
            clock: 0,
            nodes: Vec::new(),
            inserts: HashMap::new(),
            log: Vec::new(),
            vector: StateVector::new(),
            pending: Vec::new(),
            visible: 0,
            hint: 0,
        }
    }

    pub fn random() -> Self {
        Self::new(ReplicaId::random())
    }

    /// Seed a replica from flattened text.
    ///
    /// The seed ops are generated under [`ReplicaId::SEED`] with fixed seqs
    /// and Lamport values, so two peers seeding the same text produce the
    /// same ops and merging them does not duplicate anything.
    pub fn from_text(id: ReplicaId, text: &str) -> Self {
        let mut replica = Self::new(id);
        let mut origin = None;
        let ops: Vec<Op> = text
            .chars()
            .enumerate()
            .map(|(i, content)| {
                let op_id = OpId::new(ReplicaId::SEED, i as u64 + 1);
                let op = Op::Insert {
                    id: op_id,
                    origin,
                    lamport: i as u64 + 1,
                    content,
                };
                origin = Some(op_id);
                op
            })
            .collect();
        replica.merge(ops);
        replica
    }

    /// Restore a replica from snapshot bytes.
    ///
    /// Accepts an op-log from [`Replica::encode_state`] or plain UTF-8 text,
    /// which is seeded with [`Replica::from_text`].
    pub fn load(id: ReplicaId, bytes: &[u8]) -> Result<Self, ReplicaError> {
        let Some(body) = strip_snapshot_header(bytes)? else {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| ReplicaError::Decode(format!("neither op-log nor UTF-8: {e}")))?;
            return Ok(Self::from_text(id, text));
        };

        let (log, _): (OpLog, usize) =
            bincode::serde::decode_from_slice(body, bincode::config::standard())
                .map_err(|e| ReplicaError::Decode(e.to_string()))?;

        let mut replica = Self::new(id);
        let outcome = replica.merge(log.ops);
        if outcome.dropped > 0 || replica.pending_count() > 0 {
            warn!(
                "Snapshot for replica {} had {} invalid and {} unresolved ops",
                id,
                outcome.dropped,
                replica.pending_count()
            );
        }
        Ok(replica)
    }

    /// Serialize every integrated op, in causal order.
    pub fn encode_state(&self) -> Result<Vec<u8>, ReplicaError> {
        let log = OpLog {
            ops: self.log.clone(),
        };
        let body = bincode::serde::encode_to_vec(&log, bincode::config::standard())
            .map_err(|e| ReplicaError::Encode(e.to_string()))?;

        let mut bytes = Vec::with_capacity(SNAPSHOT_MAGIC.len() + 1 + body.len());
        bytes.extend_from_slice(SNAPSHOT_MAGIC);
        bytes.push(SNAPSHOT_VERSION);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Materialize the visible text.
    pub fn snapshot(&self) -> String {
        self.nodes
            .iter()
            .filter(|n| !n.deleted)
            .map(|n| n.content)
            .collect()
    }

    /// Visible length in chars.
    pub fn len(&self) -> usize {
        self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }

    pub fn state_vector(&self) -> StateVector {
        self.vector.clone()
    }

    /// Ops this replica has that `remote` lacks, in causal order.
    pub fn delta_since(&self, remote: &StateVector) -> Vec<Op> {
        self.log
            .iter()
            .filter(|op| !remote.contains(&op.id()))
            .cloned()
            .collect()
    }

    /// Ids of the visible characters in document order.
    pub fn visible_ids(&self) -> Vec<OpId> {
        self.nodes
            .iter()
            .filter(|n| !n.deleted)
            .map(|n| n.id)
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.nodes.len() - self.visible
    }

    /// Number of integrated ops, insertions and deletions alike.
    pub fn op_count(&self) -> usize {
        self.log.len()
    }

    // ─── Local edits ─────────────────────────────────────────

    /// Insert `text` at visible char `offset`.
    pub fn insert(&mut self, offset: usize, text: &str) -> Result<Vec<Op>, ReplicaError> {
        if offset > self.visible {
            return Err(ReplicaError::OffsetOutOfBounds {
                offset,
                len: self.visible,
            });
        }
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let mut origin = if offset == 0 {
            None
        } else {
            self.visible_node_index(offset - 1).map(|i| self.nodes[i].id)
        };

        let mut ops = Vec::with_capacity(text.chars().count());
        for content in text.chars() {
            self.seq += 1;
            self.clock += 1;
            let id = OpId::new(self.id, self.seq);
            let op = Op::Insert {
                id,
                origin,
                lamport: self.clock,
                content,
            };
            self.integrate(&op);
            ops.push(op);
            origin = Some(id);
        }
        Ok(ops)
    }

    /// Tombstone the visible chars in `range`.
    pub fn delete(&mut self, range: Range<usize>) -> Result<Vec<Op>, ReplicaError> {
        if range.start > range.end || range.end > self.visible {
            return Err(ReplicaError::RangeOutOfBounds {
                start: range.start,
                end: range.end,
                len: self.visible,
            });
        }

        let targets: Vec<OpId> = self
            .nodes
            .iter()
            .filter(|n| !n.deleted)
            .skip(range.start)
            .take(range.len())
            .map(|n| n.id)
            .collect();

        let mut ops = Vec::with_capacity(targets.len());
        for target in targets {
            self.seq += 1;
            let op = Op::Delete {
                id: OpId::new(self.id, self.seq),
                target,
            };
            self.integrate(&op);
            ops.push(op);
        }
        Ok(ops)
    }

    // ─── Merge ───────────────────────────────────────────────

    /// Integrate foreign ops.
    ///
    /// Never fails: known ops are skipped, ops with missing dependencies are
    /// parked until those arrive, and malformed ops are dropped.
    pub fn merge(&mut self, ops: impl IntoIterator<Item = Op>) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for op in ops {
            match self.readiness(&op) {
                Readiness::Ready => {
                    if let Some(edit) = self.integrate(&op) {
                        push_edit(&mut outcome.edits, edit);
                    }
                    outcome.applied += 1;
                }
                Readiness::Known => outcome.duplicates += 1,
                Readiness::Blocked => {
                    if self.pending.iter().any(|p| p.id() == op.id()) {
                        outcome.duplicates += 1;
                    } else {
                        outcome.parked += 1;
                        self.park(op);
                    }
                }
                Readiness::Invalid(reason) => {
                    warn!("Dropping op {}: {}", op.id(), reason);
                    outcome.dropped += 1;
                }
            }
        }

        if outcome.applied > 0 && !self.pending.is_empty() {
            self.drain_pending(&mut outcome);
        }

        if outcome.applied > 0 || outcome.parked > 0 {
            debug!(
                "Replica {} merged {} ops ({} duplicate, {} parked, {} pending)",
                self.id,
                outcome.applied,
                outcome.duplicates,
                outcome.parked,
                self.pending.len()
            );
        }
        outcome
    }

    fn park(&mut self, op: Op) {
        if self.pending.len() >= MAX_PENDING {
            let evicted = self.pending.remove(0);
            warn!(
                "Pending queue full, evicting op {} waiting on {:?}",
                evicted.id(),
                evicted.dependency()
            );
        }
        self.pending.push(op);
    }

    fn drain_pending(&mut self, outcome: &mut MergeOutcome) {
        loop {
            let mut progressed = false;
            let waiting = std::mem::take(&mut self.pending);
            for op in waiting {
                match self.readiness(&op) {
                    Readiness::Ready => {
                        if let Some(edit) = self.integrate(&op) {
                            push_edit(&mut outcome.edits, edit);
                        }
                        outcome.applied += 1;
                        progressed = true;
                    }
                    Readiness::Known => {}
                    Readiness::Blocked => self.pending.push(op),
                    Readiness::Invalid(reason) => {
                        warn!("Dropping parked op {}: {}", op.id(), reason);
                        outcome.dropped += 1;
                    }
                }
            }
            if !progressed || self.pending.is_empty() {
                break;
            }
        }
    }

    fn readiness(&self, op: &Op) -> Readiness {
        let id = op.id();
        if id.seq == 0 {
            return Readiness::Invalid("seq 0 is reserved");
        }
        if self.vector.contains(&id) {
            return Readiness::Known;
        }

        let dependency = match op {
            Op::Insert {
                origin, lamport, ..
            } => {
                if *lamport == 0 {
                    return Readiness::Invalid("lamport 0 is reserved");
                }
                match origin {
                    None => None,
                    Some(origin) => Some((*origin, Some(*lamport))),
                }
            }
            Op::Delete { target, .. } => Some((*target, None)),
        };

        if let Some((dep, lamport)) = dependency {
            if dep.replica == id.replica && dep.seq >= id.seq {
                return Readiness::Invalid("depends on a later op of its own replica");
            }
            if !self.vector.contains(&dep) {
                return Readiness::Blocked;
            }
            match (self.inserts.get(&dep), lamport) {
                (None, _) => return Readiness::Invalid("dependency is not an insertion"),
                (Some(origin_lamport), Some(lamport)) if lamport <= *origin_lamport => {
                    return Readiness::Invalid("lamport not greater than origin");
                }
                _ => {}
            }
        }

        // Each replica's ops integrate in seq order
        if id.seq != self.vector.get(&id.replica) + 1 {
            return Readiness::Blocked;
        }
        Readiness::Ready
    }

    /// Apply a ready op; returns the visible change, if any.
    fn integrate(&mut self, op: &Op) -> Option<TextEdit> {
        let id = op.id();
        let edit = match op {
            Op::Insert {
                origin,
                lamport,
                content,
                ..
            } => {
                let node = Node {
                    id,
                    lamport: *lamport,
                    content: *content,
                    deleted: false,
                };
                let mut pos = match origin {
                    Some(origin) => self.node_index(origin).map_or(0, |i| i + 1),
                    None => 0,
                };
                while pos < self.nodes.len() && self.nodes[pos].key() > node.key() {
                    pos += 1;
                }
                let offset = self.visible_before(pos);
                self.nodes.insert(pos, node);
                self.inserts.insert(id, *lamport);
                self.visible += 1;
                self.clock = self.clock.max(*lamport);
                self.hint = pos;
                Some(TextEdit::insert(offset, content.to_string()))
            }
            Op::Delete { target, .. } => match self.node_index(target) {
                Some(pos) => {
                    let offset = self.visible_before(pos);
                    let node = &mut self.nodes[pos];
                    let edit = if node.deleted {
                        None
                    } else {
                        node.deleted = true;
                        self.visible -= 1;
                        Some(TextEdit::delete(offset, 1))
                    };
                    self.hint = pos;
                    edit
                }
                None => None,
            },
        };

        if id.replica == self.id && id.seq > self.seq {
            self.seq = id.seq;
        }
        self.vector.advance(id.replica, id.seq);
        self.log.push(op.clone());
        edit
    }

    fn node_index(&self, id: &OpId) -> Option<usize> {
        if self.nodes.get(self.hint).is_some_and(|n| n.id == *id) {
            return Some(self.hint);
        }
        self.nodes.iter().position(|n| n.id == *id)
    }

    fn visible_node_index(&self, offset: usize) -> Option<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.deleted)
            .nth(offset)
            .map(|(i, _)| i)
    }

    fn visible_before(&self, pos: usize) -> usize {
        self.nodes[..pos].iter().filter(|n| !n.deleted).count()
    }
}

fn strip_snapshot_header(bytes: &[u8]) -> Result<Option<&[u8]>, ReplicaError> {
    match bytes.strip_prefix(SNAPSHOT_MAGIC.as_slice()) {
        None => Ok(None),
        Some([SNAPSHOT_VERSION, body @ ..]) => Ok(Some(body)),
        Some(_) => Err(ReplicaError::Decode(
            "unsupported snapshot version".to_string(),
        )),
    }
}

/// Append an edit, folding it into the previous one when contiguous.
fn push_edit(edits: &mut Vec<TextEdit>, edit: TextEdit) {
    if let Some(last) = edits.last_mut() {
        let last_is_insert = last.deleted == 0;
        let last_is_delete = last.inserted.is_empty();
        if last_is_insert && edit.deleted == 0 && edit.offset == last.offset + last.inserted_len() {
            last.inserted.push_str(&edit.inserted);
            return;
        }
        if last_is_delete && edit.inserted.is_empty() {
            if edit.offset == last.offset {
                last.deleted += edit.deleted;
                return;
            }
            if edit.offset + edit.deleted == last.offset {
                last.offset = edit.offset;
                last.deleted += edit.deleted;
                return;
            }
        }
    }
    edits.push(edit);
}
