//! Shared text buffers.
//!
//! [`crdt`] holds the replication algorithm, [`change`] the editor-facing
//! edit type and [`controller`] the per-buffer handle tying both to the
//! workspace link.

pub mod change;
pub mod controller;
pub mod crdt;

pub use change::TextChange;
pub use controller::{select_buffer, BufferController, BufferStatus};
pub use crdt::{
    Applied, Forward, IdRange, Item, OpId, OpKind, Operation, Replica, ReplicaSnapshot,
    VersionVector,
};
