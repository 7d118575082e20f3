//! Request and response argument structs for the shard-node and catalog
//! RPC surfaces. The transport itself lives outside this core; these types
//! define what crosses it.

use serde::{Deserialize, Serialize};

use crate::blob::{Blob, CodeMode, Item, Slice};
use crate::catalog::{Range, ShardTask, ShardUnit, ShardUnitInfo};
use crate::ids::{ClusterId, DiskId, RouteVersion, ShardId, SpaceId, Suid};

/// Header stamped on every shard-addressed operation. The shard node
/// validates `suid`, `disk_id` and `route_version` against its own state
/// before serving.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardOpHeader {
    pub space_id: SpaceId,
    pub disk_id: DiskId,
    pub suid: Suid,
    pub route_version: RouteVersion,
    pub shard_keys: Vec<Vec<u8>>,
}

/// Replica selection mode used when resolving a shard member.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GetShardMode {
    #[default]
    Leader,
    Random,
    Nearest,
}

/// Live state of one shard replica, answered by `/shard/stats`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStats {
    pub suid: Suid,
    pub applied_index: u64,
    pub leader_disk_id: DiskId,
    pub range: Range,
    pub route_version: RouteVersion,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AddShardArgs {
    pub disk_id: DiskId,
    pub suid: Suid,
    pub route_version: RouteVersion,
    pub range: Range,
    pub units: Vec<ShardUnit>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardUpdateType {
    AddMember = 1,
    RemoveMember = 2,
    UpdateMember = 3,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateShardArgs {
    pub disk_id: DiskId,
    pub suid: Suid,
    pub update_type: ShardUpdateType,
    pub unit: ShardUnit,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferShardLeaderArgs {
    pub disk_id: DiskId,
    pub suid: Suid,
    pub dest_disk_id: DiskId,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GetShardArgs {
    pub disk_id: DiskId,
    pub suid: Suid,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ListShardArgs {
    pub disk_id: DiskId,
    pub shard_id: ShardId,
    pub count: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListShardBaseInfo {
    pub suid: Suid,
    pub shard_id: ShardId,
    pub disk_id: DiskId,
    pub index: u32,
    pub epoch: u32,
    pub units: Vec<ShardUnit>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateBlobArgs {
    pub header: ShardOpHeader,
    pub name: Vec<u8>,
    pub code_mode: CodeMode,
    pub size: u64,
    pub slice_size: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetBlobArgs {
    pub header: ShardOpHeader,
    pub name: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealBlobArgs {
    pub header: ShardOpHeader,
    pub name: Vec<u8>,
    pub size: u64,
    pub slices: Vec<Slice>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteBlobArgs {
    pub header: ShardOpHeader,
    pub name: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocSliceArgs {
    pub header: ShardOpHeader,
    pub name: Vec<u8>,
    pub code_mode: CodeMode,
    pub size: u64,
    pub failed_slice: Option<Slice>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AllocSliceRet {
    pub slices: Vec<Slice>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListBlobArgs {
    pub header: ShardOpHeader,
    pub prefix: Vec<u8>,
    pub marker: Vec<u8>,
    pub count: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListBlobRet {
    pub blobs: Vec<Blob>,
    /// Empty means the addressed shard is exhausted.
    pub next_marker: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InsertItemArgs {
    pub header: ShardOpHeader,
    pub item: Item,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateItemArgs {
    pub header: ShardOpHeader,
    pub item: Item,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteItemArgs {
    pub header: ShardOpHeader,
    pub id: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetItemArgs {
    pub header: ShardOpHeader,
    pub id: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListItemArgs {
    pub header: ShardOpHeader,
    pub prefix: Vec<u8>,
    pub marker: Vec<u8>,
    pub count: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListItemRet {
    pub items: Vec<Item>,
    pub next_marker: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DBStatsArgs {
    pub disk_id: DiskId,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct DBStatsRet {
    pub used: u64,
    pub shard_count: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ShardReportArgs {
    pub shards: Vec<ShardUnitInfo>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ShardReportRet {
    pub tasks: Vec<ShardTask>,
}

/// Dispatcher-facing blob operations carry the cluster and optional
/// explicit shard keys on top of the wire arguments.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccessCreateBlobArgs {
    pub cluster_id: ClusterId,
    pub blob_name: Vec<u8>,
    pub shard_keys: Vec<Vec<u8>>,
    pub code_mode: CodeMode,
    pub size: u64,
    pub slice_size: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccessGetBlobArgs {
    pub cluster_id: ClusterId,
    pub blob_name: Vec<u8>,
    pub shard_keys: Vec<Vec<u8>>,
    pub mode: GetShardMode,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccessSealBlobArgs {
    pub cluster_id: ClusterId,
    pub blob_name: Vec<u8>,
    pub shard_keys: Vec<Vec<u8>>,
    pub size: u64,
    pub slices: Vec<Slice>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccessDeleteBlobArgs {
    pub cluster_id: ClusterId,
    pub blob_name: Vec<u8>,
    pub shard_keys: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccessAllocSliceArgs {
    pub cluster_id: ClusterId,
    pub blob_name: Vec<u8>,
    pub shard_keys: Vec<Vec<u8>>,
    pub code_mode: CodeMode,
    pub size: u64,
    pub fail_slice: Option<Slice>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccessListBlobArgs {
    pub cluster_id: ClusterId,
    pub shard_id: ShardId,
    pub prefix: Vec<u8>,
    pub marker: Vec<u8>,
    pub count: u64,
    pub mode: GetShardMode,
}
