//! Replica and op identifiers.
//!
//! Every op in the document is addressed by an [`OpId`]: the replica that
//! generated it plus that replica's sequence number. Ids are never reused,
//! so a position marker survives any amount of concurrent editing.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of one replica (one process editing one document).
///
/// Random per document session. The total order on replica ids is the
/// tie-break between concurrent insertions with equal Lamport values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    /// Reserved identity for ops created when seeding from flattened text.
    ///
    /// Every peer seeding the same text produces byte-identical ops under this
    /// id, so merging two independently seeded replicas never duplicates text.
    pub const SEED: ReplicaId = ReplicaId(Uuid::nil());

    /// Generate a fresh random identity.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn is_seed(&self) -> bool {
        *self == Self::SEED
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // First 8 hex digits are plenty for logs
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

impl From<Uuid> for ReplicaId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Globally unique identifier of a single op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub replica: ReplicaId,
    /// Per-replica sequence number, starting at 1.
    pub seq: u64,
}

impl OpId {
    pub fn new(replica: ReplicaId, seq: u64) -> Self {
        Self { replica, seq }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.replica, self.seq)
    }
}
