//! Replicated text for concurrent editing.
//!
//! A [`Replica`] holds one copy of a shared document as a sequence CRDT.
//! Local edits produce [`Op`]s to ship to peers; foreign ops are merged in
//! any order, any number of times, and every replica that has seen the same
//! ops shows the same text.
//!
//! ```
//! use tandem_core::Replica;
//!
//! let mut alice = Replica::random();
//! let mut bob = Replica::random();
//!
//! let ops = alice.insert(0, "hello").unwrap();
//! bob.merge(ops);
//! assert_eq!(bob.snapshot(), "hello");
//! ```
//!
//! This crate does no I/O; networking lives in `tandem-collab`.

pub mod error;
pub mod id;
pub mod op;
pub mod replica;
pub mod state_vector;

pub use error::ReplicaError;
pub use id::{OpId, ReplicaId};
pub use op::{Op, TextEdit};
pub use replica::{MergeOutcome, Replica, MAX_PENDING};
pub use state_vector::StateVector;
