//! Replicated state machine for one shard.
//!
//! Every mutation is idempotent under replay: inserts observe existing
//! keys, updates after deletes succeed without resurrecting, and equal
//! update values write nothing. The applied index advances only after a
//! whole batch applied.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use silo_proto::blob::{Blob, FieldId, Item};
use silo_proto::catalog::ShardUnit;
use silo_proto::codec;
use silo_proto::ids::DiskId;
use silo_raft::{
    Member, MemberChange, MemberChangeType, ProposalData, Snapshot, SnapshotBatch,
    SnapshotHeader, StateMachine,
};
use tokio::sync::OwnedRwLockReadGuard;

use crate::kv::{BatchOp, KvIter, DATA_CF};
use crate::shard::{
    decode_kv, ApplyResult, Shard, ShardMemberCtx, BLOB_RECORD_VERSION, ITEM_RECORD_VERSION,
    RAFT_OP_DELETE_BLOB, RAFT_OP_DELETE_ITEM, RAFT_OP_INSERT_BLOB, RAFT_OP_INSERT_ITEM,
    RAFT_OP_UPDATE_BLOB, RAFT_OP_UPDATE_ITEM,
};

/// Rows per streamed snapshot chunk.
const SNAPSHOT_BATCH_ROWS: usize = 128;

impl StateMachine for Shard {
    type Output = ApplyResult;

    fn apply(&self, batch: &[ProposalData], index: u64) -> anyhow::Result<Vec<ApplyResult>> {
        let mut results = Vec::with_capacity(batch.len());
        for record in batch {
            let result = match record.op {
                RAFT_OP_INSERT_ITEM => {
                    self.apply_insert_item(&record.data)?;
                    ApplyResult::default()
                }
                RAFT_OP_UPDATE_ITEM => {
                    self.apply_update_item(&record.data)?;
                    ApplyResult::default()
                }
                RAFT_OP_INSERT_BLOB => ApplyResult {
                    blob: Some(self.apply_insert_blob(&record.data)?),
                },
                RAFT_OP_UPDATE_BLOB => {
                    self.apply_update_blob(&record.data)?;
                    ApplyResult::default()
                }
                RAFT_OP_DELETE_ITEM | RAFT_OP_DELETE_BLOB => {
                    self.apply_delete_raw(&record.data)?;
                    ApplyResult::default()
                }
                other => {
                    // Corrupted log: refuse to guess at unknown operations.
                    anyhow::bail!("unsupported operation type {other} at index {index}");
                }
            };
            results.push(result);
        }

        self.set_applied_index(index);
        Ok(results)
    }

    fn leader_change(&self, peer_id: u64) -> anyhow::Result<()> {
        tracing::info!(
            suid = %self.suid(),
            disk_id = %self.disk_id(),
            peer_id,
            "shard leader change"
        );
        self.info.write().expect("shard info lock poisoned").leader =
            DiskId(peer_id as u32);
        Ok(())
    }

    fn apply_member_change(&self, change: &MemberChange, _index: u64) -> anyhow::Result<()> {
        let _guard = match self.state.prep_rw_check_sync() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::warn!(suid = %self.suid(), "shard is stop writing by delete");
                return Ok(());
            }
        };

        {
            let mut info = self.info.write().expect("shard info lock poisoned");
            match change.change_type {
                MemberChangeType::AddMember => {
                    let disk_id = DiskId(change.member.node_id as u32);
                    match info.units.iter_mut().find(|u| u.disk_id == disk_id) {
                        Some(unit) => unit.learner = change.member.learner,
                        None => {
                            let ctx: ShardMemberCtx =
                                serde_json::from_slice(&change.member.context)?;
                            info.units.push(ShardUnit {
                                suid: ctx.suid,
                                disk_id,
                                learner: change.member.learner,
                                ..Default::default()
                            });
                        }
                    }
                }
                MemberChangeType::RemoveMember => {
                    let disk_id = DiskId(change.member.node_id as u32);
                    info.units.retain(|u| u.disk_id != disk_id);
                    if disk_id == self.disk_id() {
                        self.raft_removed.store(true, Ordering::SeqCst);
                    }
                }
            }
        }

        match self.save_shard_info(false) {
            Ok(()) => Ok(()),
            Err(err) => Err(err.context("save shard info failed")),
        }
    }

    fn snapshot(&self) -> anyhow::Result<Option<Box<dyn Snapshot>>> {
        let guard = match self.state.prep_rw_check_sync() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::warn!(suid = %self.suid(), "shard is stop writing by delete");
                return Ok(None);
            }
        };

        let applied_index = self.applied_index();
        let iter = self.store.pinned_iter(
            DATA_CF,
            &self.keys.data_prefix(),
            &self.keys.data_max_prefix(),
        )?;
        Ok(Some(Box::new(ShardSnapshot {
            applied_index,
            iter,
            _gate: guard,
        })))
    }

    fn apply_snapshot(
        &self,
        header: &SnapshotHeader,
        snap: Box<dyn Snapshot>,
    ) -> anyhow::Result<()> {
        let _guard = match self.state.prep_rw_check_sync() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::warn!(suid = %self.suid(), "shard is stop writing by delete");
                return Ok(());
            }
        };
        tracing::debug!(suid = %self.suid(), index = snap.index(), "start apply snapshot");

        self.store.delete_range(
            DATA_CF,
            &self.keys.data_prefix(),
            &self.keys.data_max_prefix(),
        )?;

        loop {
            let Some(batch) = snap.read_batch()? else {
                break;
            };
            let ops = batch
                .pairs
                .into_iter()
                .map(|(key, value)| BatchOp::Set {
                    cf: DATA_CF,
                    key,
                    value,
                })
                .collect();
            self.store.write_batch(ops)?;
        }

        self.set_applied_index(snap.index());
        let units = units_from_members(&header.members)?;
        self.info.write().expect("shard info lock poisoned").units = units;
        self.save_shard_info(false)
            .map_err(|err| err.context("save shard info failed"))?;

        tracing::debug!(suid = %self.suid(), index = snap.index(), "apply snapshot done");
        Ok(())
    }
}

/// Rebuild the unit list carried by a snapshot header.
pub fn units_from_members(members: &[Member]) -> anyhow::Result<Vec<ShardUnit>> {
    let mut units = Vec::with_capacity(members.len());
    for member in members {
        let ctx: ShardMemberCtx = serde_json::from_slice(&member.context)
            .map_err(|err| anyhow::anyhow!("unmarshal member context failed: {err}"))?;
        units.push(ShardUnit {
            suid: ctx.suid,
            disk_id: DiskId(member.node_id as u32),
            learner: member.learner,
            ..Default::default()
        });
    }
    Ok(units)
}

struct ShardSnapshot {
    applied_index: u64,
    iter: Box<dyn KvIter>,
    /// Keeps the RW gate held until the last transfer drops the snapshot.
    _gate: OwnedRwLockReadGuard<()>,
}

impl Snapshot for ShardSnapshot {
    fn index(&self) -> u64 {
        self.applied_index
    }

    fn read_batch(&self) -> anyhow::Result<Option<SnapshotBatch>> {
        let pairs = self.iter.next_chunk(SNAPSHOT_BATCH_ROWS)?;
        if pairs.is_empty() {
            return Ok(None);
        }
        Ok(Some(SnapshotBatch { pairs }))
    }
}

impl Shard {
    fn apply_insert_item(&self, data: &[u8]) -> anyhow::Result<()> {
        let (key, value) = decode_kv(data)?;
        // Already inserted: replayed log entry, keep the first value.
        if self.store.get(DATA_CF, &key)?.is_some() {
            return Ok(());
        }
        self.store.set(DATA_CF, &key, &value)
    }

    fn apply_update_item(&self, data: &[u8]) -> anyhow::Result<()> {
        let (key, value) = decode_kv(data)?;
        let update: Item = codec::decode_record(ITEM_RECORD_VERSION, &value)?;

        let Some(current) = self.store.get(DATA_CF, &key)? else {
            // Replaying an update that raced a later delete.
            tracing::warn!(suid = %self.suid(), "item has been deleted");
            return Ok(());
        };
        let mut item: Item = codec::decode_record(ITEM_RECORD_VERSION, &current)?;

        let mut index_by_field: HashMap<FieldId, usize> = HashMap::with_capacity(item.fields.len());
        for (i, field) in item.fields.iter().enumerate() {
            index_by_field.insert(field.id, i);
        }
        for updated in update.fields {
            match index_by_field.get(&updated.id) {
                Some(&i) => item.fields[i].value = updated.value,
                None => item.fields.push(updated),
            }
        }

        let encoded = codec::encode_record(ITEM_RECORD_VERSION, &item)?;
        self.store.set(DATA_CF, &key, &encoded)
    }

    fn apply_insert_blob(&self, data: &[u8]) -> anyhow::Result<Blob> {
        let (key, value) = decode_kv(data)?;
        // Already inserted: return the existing record.
        if let Some(current) = self.store.get(DATA_CF, &key)? {
            return codec::decode_record(BLOB_RECORD_VERSION, &current);
        }
        self.store.set(DATA_CF, &key, &value)?;
        codec::decode_record(BLOB_RECORD_VERSION, &value)
    }

    fn apply_update_blob(&self, data: &[u8]) -> anyhow::Result<()> {
        let (key, value) = decode_kv(data)?;
        let Some(current) = self.store.get(DATA_CF, &key)? else {
            tracing::warn!(suid = %self.suid(), "blob has been deleted");
            return Ok(());
        };
        // Same value: replayed update, nothing to write.
        if current == value {
            return Ok(());
        }
        self.store.set(DATA_CF, &key, &value)
    }

    fn apply_delete_raw(&self, key: &[u8]) -> anyhow::Result<()> {
        // Independent existence check keeps deletes idempotent on replay.
        if self.store.get(DATA_CF, key)?.is_none() {
            return Ok(());
        }
        self.store.delete(DATA_CF, key)
    }
}

/// Build the member list for a snapshot header from the shard's units.
pub fn members_from_units(units: &[ShardUnit]) -> anyhow::Result<Vec<Member>> {
    let mut members = Vec::with_capacity(units.len());
    for unit in units {
        members.push(Member {
            node_id: unit.disk_id.0 as u64,
            learner: unit.learner,
            context: serde_json::to_vec(&ShardMemberCtx { suid: unit.suid })?,
        });
    }
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::FjallStore;
    use crate::shard::encode_kv;
    use silo_proto::blob::{Field, Location};
    use silo_proto::catalog::Range;
    use silo_proto::ids::{ClusterId, RouteVersion, ShardId, Suid};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn test_shard(dir: &TempDir, shard_id: u32, disk: u32) -> Arc<Shard> {
        let store = Arc::new(FjallStore::open(dir.path()).unwrap());
        new_shard_on(store, shard_id, disk)
    }

    fn new_shard_on(store: Arc<FjallStore>, shard_id: u32, disk: u32) -> Arc<Shard> {
        let suid = Suid::new(ShardId(shard_id), 0, 1);
        Arc::new(Shard::new(
            suid,
            DiskId(disk),
            ClusterId(1),
            store,
            Range::new_hash(0, u64::MAX),
            vec![ShardUnit {
                suid,
                disk_id: DiskId(disk),
                ..Default::default()
            }],
            RouteVersion(1),
        ))
    }

    fn blob_record(shard: &Shard, name: &[u8], size: u64) -> (Vec<u8>, Vec<u8>) {
        let blob = Blob {
            name: name.to_vec(),
            location: Location {
                size,
                ..Default::default()
            },
            sealed: false,
        };
        (
            shard.keys.blob_key(name),
            codec::encode_record(BLOB_RECORD_VERSION, &blob).unwrap(),
        )
    }

    fn item_record(shard: &Shard, id: &[u8], fields: Vec<Field>) -> (Vec<u8>, Vec<u8>) {
        let item = Item {
            id: id.to_vec(),
            fields,
        };
        (
            shard.keys.item_key(id),
            codec::encode_record(ITEM_RECORD_VERSION, &item).unwrap(),
        )
    }

    fn field(id: u32, value: &[u8]) -> Field {
        Field {
            id: FieldId(id),
            value: value.to_vec(),
        }
    }

    #[test]
    fn insert_twice_keeps_first_value() {
        let dir = TempDir::new().unwrap();
        let shard = test_shard(&dir, 1, 10);
        let (key, first) = blob_record(&shard, b"blob", 100);
        let (_, second) = blob_record(&shard, b"blob", 999);

        let out = shard
            .apply(
                &[ProposalData {
                    op: RAFT_OP_INSERT_BLOB,
                    data: encode_kv(&key, &first),
                }],
                1,
            )
            .unwrap();
        assert_eq!(out[0].blob.as_ref().unwrap().location.size, 100);

        // Replayed insert returns the first record untouched.
        let out = shard
            .apply(
                &[ProposalData {
                    op: RAFT_OP_INSERT_BLOB,
                    data: encode_kv(&key, &second),
                }],
                2,
            )
            .unwrap();
        assert_eq!(out[0].blob.as_ref().unwrap().location.size, 100);
        assert_eq!(shard.applied_index(), 2);
    }

    #[test]
    fn update_after_delete_does_not_resurrect() {
        let dir = TempDir::new().unwrap();
        let shard = test_shard(&dir, 1, 10);
        let (key, value) = item_record(&shard, b"item", vec![field(1, b"a")]);

        shard
            .apply(
                &[
                    ProposalData {
                        op: RAFT_OP_INSERT_ITEM,
                        data: encode_kv(&key, &value),
                    },
                    ProposalData {
                        op: RAFT_OP_DELETE_ITEM,
                        data: key.clone(),
                    },
                    ProposalData {
                        op: RAFT_OP_UPDATE_ITEM,
                        data: encode_kv(&key, &value),
                    },
                ],
                1,
            )
            .unwrap();
        assert_eq!(shard.store.get(DATA_CF, &key).unwrap(), None);
    }

    #[test]
    fn update_item_merges_fields_by_id() {
        let dir = TempDir::new().unwrap();
        let shard = test_shard(&dir, 1, 10);
        let (key, value) = item_record(&shard, b"item", vec![field(1, b"a"), field(2, b"b")]);
        let (_, update) = item_record(&shard, b"item", vec![field(2, b"B"), field(3, b"c")]);

        shard
            .apply(
                &[
                    ProposalData {
                        op: RAFT_OP_INSERT_ITEM,
                        data: encode_kv(&key, &value),
                    },
                    ProposalData {
                        op: RAFT_OP_UPDATE_ITEM,
                        data: encode_kv(&key, &update),
                    },
                ],
                1,
            )
            .unwrap();

        let stored = shard.store.get(DATA_CF, &key).unwrap().unwrap();
        let item: Item = codec::decode_record(ITEM_RECORD_VERSION, &stored).unwrap();
        assert_eq!(
            item.fields,
            vec![field(1, b"a"), field(2, b"B"), field(3, b"c")]
        );
    }

    #[test]
    fn unknown_op_fails_batch_without_advancing() {
        let dir = TempDir::new().unwrap();
        let shard = test_shard(&dir, 1, 10);
        let err = shard
            .apply(&[ProposalData { op: 99, data: vec![] }], 7)
            .unwrap_err();
        assert!(err.to_string().contains("unsupported operation type"));
        assert_eq!(shard.applied_index(), 0);
    }

    #[test]
    fn apply_replay_converges_after_any_crash_point() {
        // InsertBlob(k,v1), UpdateBlob(k,v2), DeleteBlob(k), InsertBlob(k,v3):
        // replaying any suffix from a crash point ends with k -> v3.
        let dir = TempDir::new().unwrap();
        let shard = test_shard(&dir, 1, 10);
        let (key, v1) = blob_record(&shard, b"k", 1);
        let (_, v2) = blob_record(&shard, b"k", 2);
        let (_, v3) = blob_record(&shard, b"k", 3);

        let log = [
            ProposalData {
                op: RAFT_OP_INSERT_BLOB,
                data: encode_kv(&key, &v1),
            },
            ProposalData {
                op: RAFT_OP_UPDATE_BLOB,
                data: encode_kv(&key, &v2),
            },
            ProposalData {
                op: RAFT_OP_DELETE_BLOB,
                data: key.clone(),
            },
            ProposalData {
                op: RAFT_OP_INSERT_BLOB,
                data: encode_kv(&key, &v3),
            },
        ];

        for crash_after in 0..log.len() {
            for (i, record) in log.iter().enumerate().take(crash_after + 1) {
                shard
                    .apply(std::slice::from_ref(record), (i + 1) as u64)
                    .unwrap();
            }
            // Restart: replay everything from the durable applied index.
            for (i, record) in log.iter().enumerate().skip(crash_after) {
                shard
                    .apply(std::slice::from_ref(record), (i + 1) as u64)
                    .unwrap();
            }
            let stored = shard.store.get(DATA_CF, &key).unwrap().unwrap();
            let blob: Blob = codec::decode_record(BLOB_RECORD_VERSION, &stored).unwrap();
            assert_eq!(blob.location.size, 3, "crash point {crash_after}");

            // Reset for the next crash point.
            shard.store.delete(DATA_CF, &key).unwrap();
        }
    }

    #[test]
    fn replicas_applying_the_same_log_converge() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = test_shard(&dir_a, 1, 10);
        let b = test_shard(&dir_b, 1, 11);

        let (key, v1) = blob_record(&a, b"k", 1);
        let (_, v2) = blob_record(&a, b"k", 2);
        let (ikey, ivalue) = item_record(&a, b"i", vec![field(1, b"x")]);
        let log = [
            ProposalData {
                op: RAFT_OP_INSERT_BLOB,
                data: encode_kv(&key, &v1),
            },
            ProposalData {
                op: RAFT_OP_UPDATE_BLOB,
                data: encode_kv(&key, &v2),
            },
            ProposalData {
                op: RAFT_OP_INSERT_ITEM,
                data: encode_kv(&ikey, &ivalue),
            },
        ];

        for (i, record) in log.iter().enumerate() {
            a.apply(std::slice::from_ref(record), (i + 1) as u64).unwrap();
            b.apply(std::slice::from_ref(record), (i + 1) as u64).unwrap();
        }

        assert_eq!(a.applied_index(), b.applied_index());
        let scan_a = a
            .store
            .scan(DATA_CF, &a.keys.data_prefix(), &a.keys.data_max_prefix(), 100)
            .unwrap();
        let scan_b = b
            .store
            .scan(DATA_CF, &b.keys.data_prefix(), &b.keys.data_max_prefix(), 100)
            .unwrap();
        assert_eq!(scan_a, scan_b);
        assert!(!scan_a.is_empty());
    }

    #[test]
    fn snapshot_replicates_shard_state() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let source = test_shard(&dir_a, 1, 10);
        let target = test_shard(&dir_b, 1, 11);

        for i in 0..10u8 {
            let (key, value) = blob_record(&source, &[b'n', i], i as u64);
            source
                .apply(
                    &[ProposalData {
                        op: RAFT_OP_INSERT_BLOB,
                        data: encode_kv(&key, &value),
                    }],
                    (i + 1) as u64,
                )
                .unwrap();
        }
        // Stale target content the snapshot must wipe.
        let (stale_key, stale_value) = blob_record(&target, b"stale", 0);
        target.store.set(DATA_CF, &stale_key, &stale_value).unwrap();

        let snap = source.snapshot().unwrap().unwrap();
        assert_eq!(snap.index(), 10);
        let members = members_from_units(&source.units()).unwrap();
        target
            .apply_snapshot(&SnapshotHeader { members }, snap)
            .unwrap();

        assert_eq!(target.applied_index(), 10);
        assert_eq!(target.store.get(DATA_CF, &stale_key).unwrap(), None);
        for i in 0..10u8 {
            let key = target.keys.blob_key(&[b'n', i]);
            let stored = target.store.get(DATA_CF, &key).unwrap().unwrap();
            let blob: Blob = codec::decode_record(BLOB_RECORD_VERSION, &stored).unwrap();
            assert_eq!(blob.location.size, i as u64);
        }
        // Units rebuilt from the snapshot header's members.
        assert_eq!(target.units(), source.units());
    }

    #[test]
    fn member_change_add_and_remove() {
        let dir = TempDir::new().unwrap();
        let shard = test_shard(&dir, 1, 10);

        let new_suid = Suid::new(ShardId(1), 1, 1);
        shard
            .apply_member_change(
                &MemberChange {
                    change_type: MemberChangeType::AddMember,
                    member: Member {
                        node_id: 11,
                        learner: true,
                        context: serde_json::to_vec(&ShardMemberCtx { suid: new_suid }).unwrap(),
                    },
                },
                1,
            )
            .unwrap();
        let units = shard.units();
        assert_eq!(units.len(), 2);
        assert!(units[1].learner);
        assert_eq!(units[1].suid, new_suid);

        // Re-adding the same disk only toggles the learner flag.
        shard
            .apply_member_change(
                &MemberChange {
                    change_type: MemberChangeType::AddMember,
                    member: Member {
                        node_id: 11,
                        learner: false,
                        context: Vec::new(),
                    },
                },
                2,
            )
            .unwrap();
        assert!(!shard.units()[1].learner);

        shard
            .apply_member_change(
                &MemberChange {
                    change_type: MemberChangeType::RemoveMember,
                    member: Member {
                        node_id: 11,
                        ..Default::default()
                    },
                },
                3,
            )
            .unwrap();
        assert_eq!(shard.units().len(), 1);
    }

    #[test]
    fn leader_change_updates_hint() {
        let dir = TempDir::new().unwrap();
        let shard = test_shard(&dir, 1, 10);
        shard.leader_change(11).unwrap();
        assert_eq!(shard.leader_disk_id(), DiskId(11));
    }
}
