//! Tracking of outgoing snapshots during transfers.
//!
//! The recorder tracks admission only: deleting an entry never closes the
//! underlying stream, which may still be feeding a follower. Stream
//! lifetime belongs to the state machine's snapshot handle, which releases
//! its pinned store resources when the last `Arc` drops.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::types::{Member, RaftError, Snapshot, SnapshotBatch};

/// A snapshot being streamed out, along with the group membership at the
/// time it was taken.
pub struct OutgoingSnapshot {
    id: String,
    snap: Box<dyn Snapshot>,
    members: Vec<Member>,
}

impl OutgoingSnapshot {
    pub fn new(id: String, snap: Box<dyn Snapshot>, members: Vec<Member>) -> Self {
        Self { id, snap, members }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index(&self) -> u64 {
        self.snap.index()
    }

    /// Next batch of snapshot data; `None` when exhausted.
    pub fn batch_data(&self) -> anyhow::Result<Option<SnapshotBatch>> {
        self.snap.read_batch()
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }
}

struct Entry {
    snap: Arc<OutgoingSnapshot>,
    expire: Instant,
}

struct Inner {
    // Front is the eviction candidate; `Get` refreshes an id to the back.
    evict: VecDeque<String>,
    snaps: HashMap<String, Entry>,
}

/// Bounded registry of in-flight outgoing snapshots with TTL-gated
/// eviction.
pub struct SnapshotRecorder {
    max_snapshot: usize,
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl SnapshotRecorder {
    pub fn new(max_snapshot: usize, timeout: Duration) -> Self {
        Self {
            max_snapshot: max_snapshot.max(1),
            timeout,
            inner: Mutex::new(Inner {
                evict: VecDeque::new(),
                snaps: HashMap::new(),
            }),
        }
    }

    /// Register a new outgoing snapshot. When the recorder is full, the
    /// oldest entry is evicted only if its TTL has lapsed; otherwise the
    /// caller must retry later.
    pub fn set(&self, snap: Arc<OutgoingSnapshot>) -> Result<(), RaftError> {
        let mut inner = self.inner.lock().expect("snapshot recorder lock poisoned");
        if inner.evict.len() >= self.max_snapshot {
            let oldest = inner.evict.front().cloned().expect("evict list is non-empty");
            let expired = inner
                .snaps
                .get(&oldest)
                .map(|entry| entry.expire <= Instant::now())
                .unwrap_or(true);
            if !expired {
                return Err(RaftError::SnapshotTemporarilyUnavailable);
            }
            inner.evict.pop_front();
            // The stream is not closed here; any transfer still holding the
            // Arc keeps it alive.
            inner.snaps.remove(&oldest);
        }

        if inner.snaps.contains_key(snap.id()) {
            return Err(RaftError::SnapshotExists(snap.id().to_string()));
        }
        let id = snap.id().to_string();
        inner.evict.push_back(id.clone());
        inner.snaps.insert(
            id,
            Entry {
                snap,
                expire: Instant::now() + self.timeout,
            },
        );
        Ok(())
    }

    /// Look up a snapshot, refreshing its TTL and eviction position.
    pub fn get(&self, id: &str) -> Option<Arc<OutgoingSnapshot>> {
        let mut inner = self.inner.lock().expect("snapshot recorder lock poisoned");
        if !inner.snaps.contains_key(id) {
            return None;
        }
        if let Some(pos) = inner.evict.iter().position(|entry| entry == id) {
            inner.evict.remove(pos);
        }
        inner.evict.push_back(id.to_string());
        let entry = inner.snaps.get_mut(id).expect("entry present");
        entry.expire = Instant::now() + self.timeout;
        Some(Arc::clone(&entry.snap))
    }

    /// The oldest tracked snapshot, without removing it.
    pub fn pop(&self) -> Option<Arc<OutgoingSnapshot>> {
        let inner = self.inner.lock().expect("snapshot recorder lock poisoned");
        let oldest = inner.evict.front()?;
        inner.snaps.get(oldest).map(|entry| Arc::clone(&entry.snap))
    }

    /// Stop tracking `id` without closing its stream.
    pub fn delete(&self, id: &str) {
        let mut inner = self.inner.lock().expect("snapshot recorder lock poisoned");
        if inner.snaps.remove(id).is_some() {
            if let Some(pos) = inner.evict.iter().position(|entry| entry == id) {
                inner.evict.remove(pos);
            }
        }
    }

    /// Drop all tracking. Streams still held by transfers stay open.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("snapshot recorder lock poisoned");
        inner.snaps.clear();
        inner.evict.clear();
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("snapshot recorder lock poisoned")
            .snaps
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
