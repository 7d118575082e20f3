//! Column-family KV engine seam used by shard state machines.
//!
//! The on-disk implementation is backed by fjall, with one partition per
//! column family. Range deletes are realized as a pinned scan plus one
//! delete batch; pinned scans serve both snapshots and ordered listing.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};

/// Column family holding shard-prefixed item/blob keys.
pub const DATA_CF: &str = "data";
/// Column family holding per-shard info records.
pub const INFO_CF: &str = "info";

/// One mutation inside a write batch.
#[derive(Clone, Debug)]
pub enum BatchOp {
    Set {
        cf: &'static str,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: &'static str,
        key: Vec<u8>,
    },
}

/// Ordered chunk reader over a pinned view of a key range.
pub trait KvIter: Send + Sync {
    /// Up to `n` key/value pairs in key order; empty when exhausted.
    fn next_chunk(&self, n: usize) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// Storage engine API the shard state machine operates over.
pub trait KvStore: Send + Sync + 'static {
    fn get(&self, cf: &'static str, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
    fn set(&self, cf: &'static str, key: &[u8], value: &[u8]) -> anyhow::Result<()>;
    fn delete(&self, cf: &'static str, key: &[u8]) -> anyhow::Result<()>;
    /// Commit all operations atomically.
    fn write_batch(&self, ops: Vec<BatchOp>) -> anyhow::Result<()>;
    /// Delete every key in `[from, to)`.
    fn delete_range(&self, cf: &'static str, from: &[u8], to: &[u8]) -> anyhow::Result<()>;
    /// Ordered scan of `[from, to)`, bounded by `limit`.
    fn scan(
        &self,
        cf: &'static str,
        from: &[u8],
        to: &[u8],
        limit: usize,
    ) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>>;
    /// Pinned, chunked reader over `[from, to)`; later writes are invisible.
    fn pinned_iter(
        &self,
        cf: &'static str,
        from: &[u8],
        to: &[u8],
    ) -> anyhow::Result<Box<dyn KvIter>>;
    /// Force buffered writes down to the engine (checkpoint).
    fn flush(&self) -> anyhow::Result<()>;
    /// Approximate on-disk bytes used by the engine.
    fn disk_space(&self) -> u64;
}

/// Fjall-backed KV store with on-demand partition opening.
pub struct FjallStore {
    keyspace: Arc<Keyspace>,
    partitions: RwLock<HashMap<&'static str, PartitionHandle>>,
}

impl FjallStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let keyspace = Config::new(path).open()?;
        Ok(Self {
            keyspace: Arc::new(keyspace),
            partitions: RwLock::new(HashMap::new()),
        })
    }

    fn partition(&self, cf: &'static str) -> anyhow::Result<PartitionHandle> {
        if let Some(partition) = self
            .partitions
            .read()
            .expect("partition lock poisoned")
            .get(cf)
        {
            return Ok(partition.clone());
        }
        let mut partitions = self.partitions.write().expect("partition lock poisoned");
        if let Some(partition) = partitions.get(cf) {
            return Ok(partition.clone());
        }
        let partition = self
            .keyspace
            .open_partition(cf, PartitionCreateOptions::default())?;
        partitions.insert(cf, partition.clone());
        Ok(partition)
    }
}

impl KvStore for FjallStore {
    fn get(&self, cf: &'static str, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let partition = self.partition(cf)?;
        Ok(partition.get(key)?.map(|slice| slice.to_vec()))
    }

    fn set(&self, cf: &'static str, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        let partition = self.partition(cf)?;
        partition.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, cf: &'static str, key: &[u8]) -> anyhow::Result<()> {
        let partition = self.partition(cf)?;
        partition.remove(key)?;
        Ok(())
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> anyhow::Result<()> {
        let mut batch = self.keyspace.batch();
        for op in ops {
            match op {
                BatchOp::Set { cf, key, value } => {
                    batch.insert(&self.partition(cf)?, key, value);
                }
                BatchOp::Delete { cf, key } => {
                    batch.remove(&self.partition(cf)?, key);
                }
            }
        }
        batch.commit()?;
        Ok(())
    }

    fn delete_range(&self, cf: &'static str, from: &[u8], to: &[u8]) -> anyhow::Result<()> {
        let partition = self.partition(cf)?;
        let mut batch = self.keyspace.batch();
        for entry in partition.range(from.to_vec()..to.to_vec()) {
            let (key, _) = entry?;
            batch.remove(&partition, key);
        }
        batch.commit()?;
        Ok(())
    }

    fn scan(
        &self,
        cf: &'static str,
        from: &[u8],
        to: &[u8],
        limit: usize,
    ) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let partition = self.partition(cf)?;
        let mut out = Vec::new();
        for entry in partition.range(from.to_vec()..to.to_vec()) {
            if out.len() >= limit {
                break;
            }
            let (key, value) = entry?;
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn pinned_iter(
        &self,
        cf: &'static str,
        from: &[u8],
        to: &[u8],
    ) -> anyhow::Result<Box<dyn KvIter>> {
        let partition = self.partition(cf)?;
        Ok(Box::new(FjallSnapshotIter {
            snapshot: partition.snapshot(),
            end: to.to_vec(),
            cursor: Mutex::new(Some(from.to_vec())),
        }))
    }

    fn flush(&self) -> anyhow::Result<()> {
        self.keyspace
            .persist(fjall::PersistMode::SyncAll)
            .map_err(Into::into)
    }

    fn disk_space(&self) -> u64 {
        self.keyspace.disk_space()
    }
}

struct FjallSnapshotIter {
    snapshot: fjall::Snapshot,
    end: Vec<u8>,
    /// Next key to resume from; `None` once exhausted.
    cursor: Mutex<Option<Vec<u8>>>,
}

impl KvIter for FjallSnapshotIter {
    fn next_chunk(&self, n: usize) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut cursor = self.cursor.lock().expect("snapshot iter lock poisoned");
        let Some(from) = cursor.clone() else {
            return Ok(Vec::new());
        };

        let mut out = Vec::with_capacity(n);
        for entry in self.snapshot.range(from..self.end.clone()) {
            let (key, value) = entry?;
            out.push((key.to_vec(), value.to_vec()));
            if out.len() >= n {
                break;
            }
        }

        *cursor = match out.last() {
            // Resume just past the last key returned.
            Some((last, _)) => {
                let mut next = last.clone();
                next.push(0);
                Some(next)
            }
            None => None,
        };
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, FjallStore) {
        let dir = TempDir::new().unwrap();
        let store = FjallStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn basic_ops_round_trip() {
        let (_dir, store) = open_store();
        store.set(DATA_CF, b"k1", b"v1").unwrap();
        assert_eq!(store.get(DATA_CF, b"k1").unwrap(), Some(b"v1".to_vec()));
        store.delete(DATA_CF, b"k1").unwrap();
        assert_eq!(store.get(DATA_CF, b"k1").unwrap(), None);
    }

    #[test]
    fn batch_commits_atomically_across_cfs() {
        let (_dir, store) = open_store();
        store
            .write_batch(vec![
                BatchOp::Set {
                    cf: DATA_CF,
                    key: b"a".to_vec(),
                    value: b"1".to_vec(),
                },
                BatchOp::Set {
                    cf: INFO_CF,
                    key: b"b".to_vec(),
                    value: b"2".to_vec(),
                },
            ])
            .unwrap();
        assert_eq!(store.get(DATA_CF, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(INFO_CF, b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn delete_range_is_end_exclusive() {
        let (_dir, store) = open_store();
        for key in [b"p0", b"p1", b"p2", b"q0"] {
            store.set(DATA_CF, key, b"v").unwrap();
        }
        store.delete_range(DATA_CF, b"p0", b"q0").unwrap();
        assert_eq!(store.get(DATA_CF, b"p1").unwrap(), None);
        assert_eq!(store.get(DATA_CF, b"q0").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn scan_is_ordered_and_bounded() {
        let (_dir, store) = open_store();
        for i in 0..10u8 {
            store.set(DATA_CF, &[b'k', i], &[i]).unwrap();
        }
        let out = store.scan(DATA_CF, b"k", b"l", 4).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].0, vec![b'k', 0]);
        assert_eq!(out[3].0, vec![b'k', 3]);
    }

    #[test]
    fn pinned_iter_ignores_later_writes() {
        let (_dir, store) = open_store();
        store.set(DATA_CF, b"k1", b"v1").unwrap();
        let iter = store.pinned_iter(DATA_CF, b"k", b"l").unwrap();
        store.set(DATA_CF, b"k2", b"v2").unwrap();

        let mut all = Vec::new();
        loop {
            let chunk = iter.next_chunk(1).unwrap();
            if chunk.is_empty() {
                break;
            }
            all.extend(chunk);
        }
        assert_eq!(all, vec![(b"k1".to_vec(), b"v1".to_vec())]);
    }
}
