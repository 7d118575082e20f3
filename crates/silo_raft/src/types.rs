//! State-machine and replication-group contracts.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RaftError {
    #[error("snapshot temporarily unavailable")]
    SnapshotTemporarilyUnavailable,
    #[error("outgoing snapshot {0} exists")]
    SnapshotExists(String),
    #[error("raft group removed")]
    GroupRemoved,
}

/// One replicated mutation: a stable operation code plus opaque payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProposalData {
    pub op: u32,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberChangeType {
    AddMember,
    RemoveMember,
}

/// One member of a replication group. `context` carries application data
/// decoded by the state machine (for shards, the unit's Suid).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Member {
    pub node_id: u64,
    pub learner: bool,
    pub context: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberChange {
    pub change_type: MemberChangeType,
    pub member: Member,
}

/// One snapshot chunk: key/value pairs ready to batch into the store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotBatch {
    pub pairs: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Metadata accompanying a snapshot transfer.
#[derive(Clone, Debug, Default)]
pub struct SnapshotHeader {
    pub members: Vec<Member>,
}

/// A streamable snapshot, produced by a leader or received from one.
///
/// `read_batch` yields chunks until exhausted, then `None`. Implementations
/// release their pinned store resources on drop.
pub trait Snapshot: Send + Sync {
    /// Applied index the snapshot was taken at.
    fn index(&self) -> u64;
    fn read_batch(&self) -> anyhow::Result<Option<SnapshotBatch>>;
}

/// Application state machine driven by the consensus apply loop.
///
/// `apply` must advance durable state only through the whole batch: a
/// failed record leaves the applied index at the last fully-applied entry,
/// and replays of already-applied records must be no-ops.
pub trait StateMachine: Send + Sync + 'static {
    type Output: Send;

    fn apply(&self, batch: &[ProposalData], index: u64) -> anyhow::Result<Vec<Self::Output>>;

    fn leader_change(&self, peer_id: u64) -> anyhow::Result<()>;

    fn apply_member_change(&self, change: &MemberChange, index: u64) -> anyhow::Result<()>;

    fn snapshot(&self) -> anyhow::Result<Option<Box<dyn Snapshot>>>;

    fn apply_snapshot(&self, header: &SnapshotHeader, snap: Box<dyn Snapshot>)
        -> anyhow::Result<()>;
}

/// Handle to one replicated group, as exposed by the consensus layer.
#[async_trait]
pub trait ReplicationGroup: Send + Sync {
    type Output: Send;

    /// Replicate one proposal and return its apply result.
    async fn propose(&self, data: ProposalData) -> anyhow::Result<Self::Output>;

    async fn member_change(&self, change: MemberChange) -> anyhow::Result<()>;

    async fn leader_transfer(&self, peer_id: u64) -> anyhow::Result<()>;

    /// Linearizable read barrier.
    async fn read_index(&self) -> anyhow::Result<()>;

    /// Current leader peer, 0 while in election.
    fn leader(&self) -> u64;

    /// Tear the local replica of the group down.
    async fn remove(&self) -> anyhow::Result<()>;
}
