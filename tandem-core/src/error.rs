use thiserror::Error;

/// Errors from local replica operations and snapshot handling.
///
/// Merging foreign ops never produces one of these: ops that cannot be
/// integrated are parked or dropped and reported in the merge outcome.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplicaError {
    #[error("offset {offset} out of bounds (length {len})")]
    OffsetOutOfBounds { offset: usize, len: usize },

    #[error("range {start}..{end} out of bounds (length {len})")]
    RangeOutOfBounds { start: usize, end: usize, len: usize },

    #[error("snapshot encode failed: {0}")]
    Encode(String),

    #[error("snapshot decode failed: {0}")]
    Decode(String),
}
