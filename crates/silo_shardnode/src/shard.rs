//! One shard replica bound to one disk: its key namespace, lifecycle gate,
//! replicated info, and the client-facing blob/item operations that
//! propose through the shard's replication group.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};

use silo_proto::blob::{Blob, Item, Location, Slice};
use silo_proto::catalog::{Range, ShardUnit};
use silo_proto::codec::{self, put_bytes, read_bytes};
use silo_proto::ids::{ClusterId, DiskId, RouteVersion, Suid};
use silo_proto::rpc::{
    AllocSliceArgs, CreateBlobArgs, DeleteBlobArgs, GetBlobArgs, GetItemArgs, ListBlobArgs,
    ListBlobRet, ListItemArgs, ListItemRet, SealBlobArgs, ShardOpHeader, ShardStats,
};
use silo_proto::ApiError;
use silo_raft::ReplicationGroup;

use crate::kv::{KvStore, DATA_CF, INFO_CF};

/// The shard is in a destructive lifecycle transition and refuses reads
/// and writes.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("shard stopped writing")]
pub struct ShardStopWriting;

/// Raft operation codes replicated for shard mutations.
pub const RAFT_OP_INSERT_ITEM: u32 = 1;
pub const RAFT_OP_UPDATE_ITEM: u32 = 2;
pub const RAFT_OP_DELETE_ITEM: u32 = 3;
pub const RAFT_OP_INSERT_BLOB: u32 = 4;
pub const RAFT_OP_UPDATE_BLOB: u32 = 5;
pub const RAFT_OP_DELETE_BLOB: u32 = 6;

/// Result of applying one replicated record.
#[derive(Clone, Debug, Default)]
pub struct ApplyResult {
    pub blob: Option<Blob>,
}

pub(crate) const BLOB_RECORD_VERSION: u8 = 1;
pub(crate) const ITEM_RECORD_VERSION: u8 = 1;
pub(crate) const SHARD_INFO_RECORD_VERSION: u8 = 1;

const BLOB_KIND: u8 = b'b';
const ITEM_KIND: u8 = b'i';

/// Replication-group member context carrying the unit identity.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ShardMemberCtx {
    pub suid: Suid,
}

/// Key namespace of one shard inside the shared `data` column family.
#[derive(Clone, Debug)]
pub struct ShardKeys {
    shard_id_be: [u8; 4],
}

impl ShardKeys {
    pub fn new(suid: Suid) -> Self {
        Self {
            shard_id_be: suid.shard_id().0.to_be_bytes(),
        }
    }

    pub fn data_prefix(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5);
        out.push(b'd');
        out.extend_from_slice(&self.shard_id_be);
        out
    }

    pub fn data_max_prefix(&self) -> Vec<u8> {
        prefix_upper_bound(self.data_prefix())
    }

    pub fn blob_key(&self, name: &[u8]) -> Vec<u8> {
        self.data_key(BLOB_KIND, name)
    }

    pub fn item_key(&self, id: &[u8]) -> Vec<u8> {
        self.data_key(ITEM_KIND, id)
    }

    fn data_key(&self, kind: u8, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(6 + key.len());
        out.push(b'd');
        out.extend_from_slice(&self.shard_id_be);
        out.push(kind);
        out.extend_from_slice(key);
        out
    }

    /// Strip the namespace from a data key, returning the user key.
    pub fn user_key<'a>(&self, data_key: &'a [u8]) -> &'a [u8] {
        &data_key[6..]
    }

    /// Scan bounds for one record kind: `[first key, past-end)`.
    fn kind_range(&self, kind: u8) -> (Vec<u8>, Vec<u8>) {
        let start = self.data_key(kind, b"");
        let end = prefix_upper_bound(start.clone());
        (start, end)
    }

    pub fn blob_range(&self) -> (Vec<u8>, Vec<u8>) {
        self.kind_range(BLOB_KIND)
    }

    pub fn item_range(&self) -> (Vec<u8>, Vec<u8>) {
        self.kind_range(ITEM_KIND)
    }

    pub fn info_key(&self, suid: Suid) -> Vec<u8> {
        let mut out = Vec::with_capacity(9);
        out.push(b's');
        out.extend_from_slice(&suid.0.to_be_bytes());
        out
    }
}

/// Smallest key strictly greater than every key with `prefix`.
fn prefix_upper_bound(mut prefix: Vec<u8>) -> Vec<u8> {
    while let Some(last) = prefix.last_mut() {
        if *last < u8::MAX {
            *last += 1;
            return prefix;
        }
        prefix.pop();
    }
    prefix
}

/// Lifecycle gate: R/W paths hold shared guards, destructive transitions
/// drain them exclusively.
pub struct ShardState {
    stopped: AtomicBool,
    gate: Arc<RwLock<()>>,
}

impl Default for ShardState {
    fn default() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            gate: Arc::new(RwLock::new(())),
        }
    }
}

impl ShardState {
    pub async fn prep_rw_check(&self) -> Result<OwnedRwLockReadGuard<()>, ShardStopWriting> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ShardStopWriting);
        }
        let guard = Arc::clone(&self.gate).read_owned().await;
        if self.stopped.load(Ordering::Acquire) {
            return Err(ShardStopWriting);
        }
        Ok(guard)
    }

    /// Non-blocking variant for synchronous consensus callbacks. A held
    /// exclusive gate means the shard is stopping.
    pub fn prep_rw_check_sync(&self) -> Result<OwnedRwLockReadGuard<()>, ShardStopWriting> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ShardStopWriting);
        }
        Arc::clone(&self.gate)
            .try_read_owned()
            .map_err(|_| ShardStopWriting)
    }

    /// Mark the shard stopped and drain in-flight R/W guards.
    pub async fn stop_writing(&self) {
        self.stopped.store(true, Ordering::Release);
        let _drained = self.gate.write().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Replicated shard info guarded by one lock.
#[derive(Clone, Debug, Default)]
pub struct ShardInfoInner {
    pub range: Range,
    pub units: Vec<ShardUnit>,
    pub route_version: RouteVersion,
    pub leader: DiskId,
}

/// Persisted form of [`ShardInfoInner`] plus the durable applied index.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ShardInfoRecord {
    pub suid: Suid,
    pub range: Range,
    pub units: Vec<ShardUnit>,
    pub route_version: RouteVersion,
    pub applied_index: u64,
}

pub struct Shard {
    suid: Suid,
    disk_id: DiskId,
    cluster_id: ClusterId,
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) keys: ShardKeys,
    pub(crate) state: ShardState,
    pub(crate) info: StdRwLock<ShardInfoInner>,
    pub(crate) applied_index: AtomicU64,
    /// Set when a replicated member change removed this replica; the owner
    /// tears the local replication group down.
    pub(crate) raft_removed: AtomicBool,
    /// Seam for the external slice id allocator.
    slice_seq: AtomicU64,
}

impl Shard {
    pub fn new(
        suid: Suid,
        disk_id: DiskId,
        cluster_id: ClusterId,
        store: Arc<dyn KvStore>,
        range: Range,
        units: Vec<ShardUnit>,
        route_version: RouteVersion,
    ) -> Self {
        Self {
            suid,
            keys: ShardKeys::new(suid),
            disk_id,
            cluster_id,
            store,
            state: ShardState::default(),
            info: StdRwLock::new(ShardInfoInner {
                range,
                units,
                route_version,
                leader: DiskId(0),
            }),
            applied_index: AtomicU64::new(0),
            raft_removed: AtomicBool::new(false),
            slice_seq: AtomicU64::new(1),
        }
    }

    /// Rebuild a shard from its persisted info record.
    pub fn from_record(
        disk_id: DiskId,
        cluster_id: ClusterId,
        store: Arc<dyn KvStore>,
        record: ShardInfoRecord,
    ) -> Self {
        let shard = Self::new(
            record.suid,
            disk_id,
            cluster_id,
            store,
            record.range,
            record.units,
            record.route_version,
        );
        shard
            .applied_index
            .store(record.applied_index, Ordering::SeqCst);
        shard
    }

    pub fn suid(&self) -> Suid {
        self.suid
    }

    pub fn disk_id(&self) -> DiskId {
        self.disk_id
    }

    pub fn units(&self) -> Vec<ShardUnit> {
        self.info.read().expect("shard info lock poisoned").units.clone()
    }

    pub fn range(&self) -> Range {
        self.info.read().expect("shard info lock poisoned").range.clone()
    }

    pub fn route_version(&self) -> RouteVersion {
        self.info
            .read()
            .expect("shard info lock poisoned")
            .route_version
    }

    pub fn leader_disk_id(&self) -> DiskId {
        self.info.read().expect("shard info lock poisoned").leader
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::Acquire)
    }

    pub(crate) fn set_applied_index(&self, index: u64) {
        self.applied_index.store(index, Ordering::Release);
    }

    pub fn set_route_version(&self, version: RouteVersion) {
        self.info
            .write()
            .expect("shard info lock poisoned")
            .route_version = version;
    }

    pub(crate) fn next_slice(&self, size: u64, slice_size: u32) -> Slice {
        let slice_size = slice_size.max(1);
        let count = size.div_ceil(slice_size as u64).max(1) as u32;
        let min_slice_id = self
            .slice_seq
            .fetch_add(count as u64, Ordering::SeqCst);
        Slice {
            min_slice_id,
            vid: self.suid.shard_id().0,
            count,
            valid_size: 0,
        }
    }

    pub(crate) fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    /// Persist the shard info record, including the durable applied index.
    pub fn save_shard_info(&self, with_gate: bool) -> anyhow::Result<()> {
        let _guard = if with_gate {
            match self.state.prep_rw_check_sync() {
                Ok(guard) => Some(guard),
                Err(stop) => return Err(anyhow::Error::new(stop)),
            }
        } else {
            None
        };
        let record = {
            let info = self.info.read().expect("shard info lock poisoned");
            ShardInfoRecord {
                suid: self.suid,
                range: info.range.clone(),
                units: info.units.clone(),
                route_version: info.route_version,
                applied_index: self.applied_index(),
            }
        };
        let value = codec::encode_record(SHARD_INFO_RECORD_VERSION, &record)?;
        self.store
            .set(INFO_CF, &self.keys.info_key(self.suid), &value)
    }

    pub fn delete_shard_info(&self) -> anyhow::Result<()> {
        self.store.delete(INFO_CF, &self.keys.info_key(self.suid))
    }
}

/// Encode a replicated key/value payload.
pub(crate) fn encode_kv(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + key.len() + value.len());
    put_bytes(&mut out, key);
    put_bytes(&mut out, value);
    out
}

pub(crate) fn decode_kv(data: &[u8]) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    let mut offset = 0usize;
    let key = read_bytes(data, &mut offset)?;
    let value = read_bytes(data, &mut offset)?;
    Ok((key, value))
}

/// A shard plus its replication group, as handed out by the shard store.
#[derive(Clone)]
pub struct ShardHandler {
    pub(crate) shard: Arc<Shard>,
    pub(crate) group: Arc<dyn ReplicationGroup<Output = ApplyResult>>,
}

impl ShardHandler {
    pub fn shard(&self) -> &Arc<Shard> {
        &self.shard
    }

    pub fn suid(&self) -> Suid {
        self.shard.suid()
    }

    pub fn units(&self) -> Vec<ShardUnit> {
        self.shard.units()
    }

    pub fn route_version(&self) -> RouteVersion {
        self.shard.route_version()
    }

    fn check_header(&self, header: &ShardOpHeader, leader_required: bool) -> anyhow::Result<()> {
        anyhow::ensure!(header.suid == self.shard.suid(), ApiError::ShardDoesNotExist);
        anyhow::ensure!(
            header.route_version >= self.shard.route_version(),
            ApiError::ShardRouteVersionNeedUpdate
        );
        if leader_required {
            let leader = self.shard.leader_disk_id();
            anyhow::ensure!(leader.is_valid(), ApiError::ShardNoLeader);
            anyhow::ensure!(leader == self.shard.disk_id(), ApiError::ShardNodeNotLeader);
        }
        Ok(())
    }

    async fn propose(&self, op: u32, data: Vec<u8>) -> anyhow::Result<ApplyResult> {
        let _guard = self.shard.state.prep_rw_check().await?;
        self.group
            .propose(silo_raft::ProposalData { op, data })
            .await
    }

    pub async fn stats(&self, read_index: bool) -> anyhow::Result<ShardStats> {
        if read_index {
            self.group.read_index().await?;
        }
        let shard = &self.shard;
        Ok(ShardStats {
            suid: shard.suid(),
            applied_index: shard.applied_index(),
            leader_disk_id: shard.leader_disk_id(),
            range: shard.range(),
            route_version: shard.route_version(),
        })
    }

    pub async fn transfer_leader(&self, dest_disk_id: DiskId) -> anyhow::Result<()> {
        self.group.leader_transfer(dest_disk_id.0 as u64).await
    }

    pub async fn create_blob(&self, args: &CreateBlobArgs) -> anyhow::Result<Blob> {
        self.check_header(&args.header, true)?;
        let slice = self.shard.next_slice(args.size, args.slice_size);
        let blob = Blob {
            name: args.name.clone(),
            location: Location {
                cluster_id: self.shard.cluster_id(),
                code_mode: args.code_mode,
                size: args.size,
                slice_size: args.slice_size,
                crc: 0,
                slices: vec![slice],
            },
            sealed: false,
        };
        let key = self.shard.keys.blob_key(&args.name);
        let value = codec::encode_record(BLOB_RECORD_VERSION, &blob)?;
        let result = self.propose(RAFT_OP_INSERT_BLOB, encode_kv(&key, &value)).await?;
        result
            .blob
            .ok_or_else(|| anyhow::anyhow!("insert blob returned no record"))
    }

    pub async fn get_blob(&self, args: &GetBlobArgs) -> anyhow::Result<Blob> {
        self.check_header(&args.header, false)?;
        let _guard = self.shard.state.prep_rw_check().await?;
        let key = self.shard.keys.blob_key(&args.name);
        let value = self
            .shard
            .store
            .get(DATA_CF, &key)?
            .ok_or(ApiError::BlobNotFound)?;
        codec::decode_record(BLOB_RECORD_VERSION, &value)
    }

    pub async fn seal_blob(&self, args: &SealBlobArgs) -> anyhow::Result<()> {
        self.check_header(&args.header, true)?;
        let mut blob = self
            .get_blob(&GetBlobArgs {
                header: args.header.clone(),
                name: args.name.clone(),
            })
            .await?;
        if blob.sealed {
            // Sealing twice with the same content is a replayed request.
            anyhow::ensure!(
                blob.location.slices == args.slices && blob.location.size == args.size,
                ApiError::BlobAlreadySealed
            );
            return Ok(());
        }
        blob.location.size = args.size;
        blob.location.slices = args.slices.clone();
        blob.sealed = true;

        let key = self.shard.keys.blob_key(&args.name);
        let value = codec::encode_record(BLOB_RECORD_VERSION, &blob)?;
        self.propose(RAFT_OP_UPDATE_BLOB, encode_kv(&key, &value)).await?;
        Ok(())
    }

    pub async fn find_and_delete_blob(&self, args: &DeleteBlobArgs) -> anyhow::Result<Blob> {
        self.check_header(&args.header, true)?;
        let blob = self
            .get_blob(&GetBlobArgs {
                header: args.header.clone(),
                name: args.name.clone(),
            })
            .await?;
        let key = self.shard.keys.blob_key(&args.name);
        self.propose(RAFT_OP_DELETE_BLOB, key).await?;
        Ok(blob)
    }

    pub async fn alloc_slice(&self, args: &AllocSliceArgs) -> anyhow::Result<Vec<Slice>> {
        self.check_header(&args.header, true)?;
        let mut blob = self
            .get_blob(&GetBlobArgs {
                header: args.header.clone(),
                name: args.name.clone(),
            })
            .await?;
        anyhow::ensure!(!blob.sealed, ApiError::BlobAlreadySealed);
        if let Some(failed) = &args.failed_slice {
            blob.location.slices.retain(|s| s.min_slice_id != failed.min_slice_id);
        }
        let slice = self.shard.next_slice(args.size, blob.location.slice_size);
        blob.location.slices.push(slice);

        let key = self.shard.keys.blob_key(&args.name);
        let value = codec::encode_record(BLOB_RECORD_VERSION, &blob)?;
        self.propose(RAFT_OP_UPDATE_BLOB, encode_kv(&key, &value)).await?;
        Ok(vec![slice])
    }

    pub async fn list_blob(&self, args: &ListBlobArgs) -> anyhow::Result<ListBlobRet> {
        self.check_header(&args.header, false)?;
        let _guard = self.shard.state.prep_rw_check().await?;
        let keys = &self.shard.keys;
        let (kind_start, kind_end) = keys.blob_range();
        let start = if !args.marker.is_empty() {
            keys.blob_key(&args.marker)
        } else if !args.prefix.is_empty() {
            keys.blob_key(&args.prefix)
        } else {
            kind_start
        };
        let end = if args.prefix.is_empty() {
            kind_end
        } else {
            prefix_upper_bound(keys.blob_key(&args.prefix))
        };

        // One extra row decides whether a continuation marker is needed.
        let count = args.count as usize;
        let rows = self.shard.store.scan(DATA_CF, &start, &end, count + 1)?;
        let mut ret = ListBlobRet::default();
        for (_, value) in rows.iter().take(count) {
            ret.blobs.push(codec::decode_record(BLOB_RECORD_VERSION, value)?);
        }
        if rows.len() > count {
            ret.next_marker = keys.user_key(&rows[count].0).to_vec();
        }
        Ok(ret)
    }

    pub async fn insert_item(&self, header: &ShardOpHeader, item: &Item) -> anyhow::Result<()> {
        self.check_header(header, true)?;
        let key = self.shard.keys.item_key(&item.id);
        let value = codec::encode_record(ITEM_RECORD_VERSION, item)?;
        self.propose(RAFT_OP_INSERT_ITEM, encode_kv(&key, &value)).await?;
        Ok(())
    }

    pub async fn update_item(&self, header: &ShardOpHeader, item: &Item) -> anyhow::Result<()> {
        self.check_header(header, true)?;
        let key = self.shard.keys.item_key(&item.id);
        let value = codec::encode_record(ITEM_RECORD_VERSION, item)?;
        self.propose(RAFT_OP_UPDATE_ITEM, encode_kv(&key, &value)).await?;
        Ok(())
    }

    pub async fn delete_item(&self, header: &ShardOpHeader, id: &[u8]) -> anyhow::Result<()> {
        self.check_header(header, true)?;
        let key = self.shard.keys.item_key(id);
        self.propose(RAFT_OP_DELETE_ITEM, key).await?;
        Ok(())
    }

    pub async fn get_item(&self, args: &GetItemArgs) -> anyhow::Result<Item> {
        self.check_header(&args.header, false)?;
        let _guard = self.shard.state.prep_rw_check().await?;
        let key = self.shard.keys.item_key(&args.id);
        let value = self
            .shard
            .store
            .get(DATA_CF, &key)?
            .ok_or(ApiError::ItemNotFound)?;
        codec::decode_record(ITEM_RECORD_VERSION, &value)
    }

    pub async fn list_item(&self, args: &ListItemArgs) -> anyhow::Result<ListItemRet> {
        self.check_header(&args.header, false)?;
        let _guard = self.shard.state.prep_rw_check().await?;
        let keys = &self.shard.keys;
        let (kind_start, kind_end) = keys.item_range();
        let start = if !args.marker.is_empty() {
            keys.item_key(&args.marker)
        } else if !args.prefix.is_empty() {
            keys.item_key(&args.prefix)
        } else {
            kind_start
        };
        let end = if args.prefix.is_empty() {
            kind_end
        } else {
            prefix_upper_bound(keys.item_key(&args.prefix))
        };

        let count = args.count as usize;
        let rows = self.shard.store.scan(DATA_CF, &start, &end, count + 1)?;
        let mut ret = ListItemRet::default();
        for (_, value) in rows.iter().take(count) {
            ret.items.push(codec::decode_record(ITEM_RECORD_VERSION, value)?);
        }
        if rows.len() > count {
            ret.next_marker = keys.user_key(&rows[count].0).to_vec();
        }
        Ok(ret)
    }

    /// Flush buffered state down to the engine and persist shard info.
    pub async fn checkpoint(&self) -> anyhow::Result<()> {
        let _guard = self.shard.state.prep_rw_check().await?;
        self.shard.save_shard_info(false)?;
        self.shard.store.flush()
    }

    /// Verify the replica still belongs to the shard's unit list; a
    /// replica the catalog no longer lists is trash awaiting a clear task.
    pub async fn check_and_clear(&self) -> anyhow::Result<bool> {
        let units = self.shard.units();
        let listed = units.iter().any(|u| u.suid == self.shard.suid());
        if !listed {
            tracing::warn!(
                suid = %self.shard.suid(),
                disk_id = %self.shard.disk_id(),
                "replica no longer listed by its shard"
            );
        }
        Ok(listed)
    }
}
