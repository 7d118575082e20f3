//! Consensus seam for the silo core.
//!
//! The consensus log transport itself is an external collaborator; this
//! crate defines the traits a replicated state machine implements and a
//! replication group exposes, plus the snapshot recorder and the snapshot
//! buffer allocator shared by transfers.

pub mod allocator;
pub mod group;
pub mod snapshot;
pub mod types;

pub use group::LocalGroup;
pub use snapshot::{OutgoingSnapshot, SnapshotRecorder};
pub use types::{
    Member, MemberChange, MemberChangeType, ProposalData, RaftError, ReplicationGroup, Snapshot,
    SnapshotBatch, SnapshotHeader, StateMachine,
};
