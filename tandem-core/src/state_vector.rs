//! State vectors: per-replica summaries of integrated ops.
//!
//! A replica integrates each peer's ops in sequence order, so "highest seq
//! seen from R" fully describes which of R's ops are known. Two vectors are
//! enough to compute the minimal delta between replicas, and the pointwise
//! minimum over all peers is the causal-stability point a future tombstone
//! collector would need.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::id::{OpId, ReplicaId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    clocks: BTreeMap<ReplicaId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest contiguous seq integrated from `replica` (0 = none).
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.clocks.get(replica).copied().unwrap_or(0)
    }

    /// Whether the op is covered by this vector.
    pub fn contains(&self, id: &OpId) -> bool {
        id.seq <= self.get(&id.replica)
    }

    /// Raise the entry for `replica` to `seq` (never lowers it).
    pub fn advance(&mut self, replica: ReplicaId, seq: u64) {
        let entry = self.clocks.entry(replica).or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
    }

    /// Pointwise maximum.
    pub fn merge(&mut self, other: &StateVector) {
        for (replica, seq) in &other.clocks {
            self.advance(*replica, *seq);
        }
    }

    /// Pointwise minimum: the ops every participant has observed.
    pub fn meet(&self, other: &StateVector) -> StateVector {
        let clocks = self
            .clocks
            .iter()
            .filter_map(|(replica, seq)| {
                let min = (*seq).min(other.get(replica));
                (min > 0).then_some((*replica, min))
            })
            .collect();
        StateVector { clocks }
    }

    /// True if every op known to `other` is known to `self`.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other
            .clocks
            .iter()
            .all(|(replica, seq)| self.get(replica) >= *seq)
    }

    /// Total number of ops summarized.
    pub fn total(&self) -> u64 {
        self.clocks.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.clocks.iter()
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}

impl FromIterator<(ReplicaId, u64)> for StateVector {
    fn from_iter<T: IntoIterator<Item = (ReplicaId, u64)>>(iter: T) -> Self {
        let mut sv = StateVector::new();
        for (replica, seq) in iter {
            sv.advance(replica, seq);
        }
        sv
    }
}
