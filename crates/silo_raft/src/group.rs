//! Loopback replication group for tests and single-replica deployments:
//! proposals apply immediately, in submission order, at increasing indexes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::types::{
    MemberChange, ProposalData, RaftError, ReplicationGroup, StateMachine,
};

pub struct LocalGroup<S: StateMachine> {
    sm: Arc<S>,
    node_id: u64,
    next_index: AtomicU64,
    removed: AtomicBool,
    apply_lock: Mutex<()>,
}

impl<S: StateMachine> LocalGroup<S> {
    pub fn new(sm: Arc<S>, node_id: u64) -> Self {
        let group = Self {
            sm,
            node_id,
            next_index: AtomicU64::new(1),
            removed: AtomicBool::new(false),
            apply_lock: Mutex::new(()),
        };
        // A lone replica is its own leader from the start.
        let _ = group.sm.leader_change(node_id);
        group
    }

    /// Start the next apply at `index` (used when rebuilding from state).
    pub fn set_next_index(&self, index: u64) {
        self.next_index.store(index, Ordering::SeqCst);
    }

    pub fn state_machine(&self) -> &Arc<S> {
        &self.sm
    }
}

#[async_trait]
impl<S: StateMachine> ReplicationGroup for LocalGroup<S> {
    type Output = S::Output;

    async fn propose(&self, data: ProposalData) -> anyhow::Result<S::Output> {
        anyhow::ensure!(!self.removed.load(Ordering::SeqCst), RaftError::GroupRemoved);
        let _guard = self.apply_lock.lock().await;
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let mut outputs = self.sm.apply(std::slice::from_ref(&data), index)?;
        anyhow::ensure!(outputs.len() == 1, "apply returned {} outputs", outputs.len());
        Ok(outputs.remove(0))
    }

    async fn member_change(&self, change: MemberChange) -> anyhow::Result<()> {
        let _guard = self.apply_lock.lock().await;
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        self.sm.apply_member_change(&change, index)
    }

    async fn leader_transfer(&self, peer_id: u64) -> anyhow::Result<()> {
        self.sm.leader_change(peer_id)
    }

    async fn read_index(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn leader(&self) -> u64 {
        self.node_id
    }

    async fn remove(&self) -> anyhow::Result<()> {
        self.removed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
