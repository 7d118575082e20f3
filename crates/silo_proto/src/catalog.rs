//! Catalog-side descriptors: shard units, shards, spaces, route items and
//! background tasks issued to shard nodes.

use serde::{Deserialize, Serialize};

use crate::ids::{DiskId, RouteVersion, ShardId, SpaceId, Suid};
pub use crate::sharding::Range;

/// Lifecycle of a shard unit's hosting disk. Any status at or past
/// `Broken` marks the unit punished and excludes it from selection.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum ShardUnitStatus {
    #[default]
    Normal = 1,
    Eio = 2,
    Broken = 3,
    Repairing = 4,
    Repaired = 5,
}

impl ShardUnitStatus {
    pub fn is_punished(&self) -> bool {
        *self >= Self::Broken
    }

    /// The next status in the repair lifecycle, if any.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Normal => Some(Self::Eio),
            Self::Eio => Some(Self::Broken),
            Self::Broken => Some(Self::Repairing),
            Self::Repairing => Some(Self::Repaired),
            Self::Repaired => None,
        }
    }
}

/// One replica of a shard on one disk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardUnit {
    pub suid: Suid,
    pub disk_id: DiskId,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub learner: bool,
    #[serde(default)]
    pub status: ShardUnitStatus,
    #[serde(default)]
    pub route_version: RouteVersion,
}

/// Catalog view of one shard: its range, route stamp, leader hint and
/// replica units. `leader_disk_id == 0` denotes "in election"; the hint
/// is repaired from shard-node stats, never trusted blindly.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub shard_id: ShardId,
    pub range: Range,
    pub route_version: RouteVersion,
    pub leader_disk_id: DiskId,
    pub units: Vec<ShardUnit>,
}

impl ShardInfo {
    /// Check the structural invariants every catalog apply must preserve.
    pub fn check(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.units.is_empty(), "shard {} has no units", self.shard_id);
        for (i, unit) in self.units.iter().enumerate() {
            anyhow::ensure!(
                unit.suid.index() as usize == i,
                "shard {} unit {} carries index {}",
                self.shard_id,
                i,
                unit.suid.index()
            );
        }
        if self.leader_disk_id.is_valid() {
            anyhow::ensure!(
                self.units.iter().any(|u| u.disk_id == self.leader_disk_id),
                "shard {} leader disk {} not among units",
                self.shard_id,
                self.leader_disk_id
            );
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SpaceStatus {
    #[default]
    Normal = 1,
    Expired = 2,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FieldType {
    #[default]
    Bool = 1,
    Int = 2,
    Float = 3,
    String = 4,
    Bytes = 5,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum IndexOption {
    #[default]
    Null = 0,
    Indexed = 1,
}

/// Schema entry for one item field within a space.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub id: crate::blob::FieldId,
    pub name: String,
    pub field_type: FieldType,
    pub index_option: IndexOption,
}

/// A logical namespace whose shards share a schema.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub space_id: SpaceId,
    pub name: String,
    pub status: SpaceStatus,
    pub acc_key: String,
    pub sec_key: String,
    pub field_metas: Vec<FieldMeta>,
}

/// Kind of route mutation recorded in the route log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RouteUpdateType {
    AddShard = 1,
    UpdateShard = 2,
    ShardSplit = 3,
}

/// One entry of the append-only route log, consumed by access-layer
/// caches to invalidate stale shard views.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteItem {
    pub route_version: RouteVersion,
    pub update_type: RouteUpdateType,
    pub shard_id: ShardId,
}

/// Route items joined with current shard infos, as served to clients.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogChanges {
    pub route_version: RouteVersion,
    pub items: Vec<CatalogChangeItem>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogChangeItem {
    pub route_version: RouteVersion,
    pub update_type: RouteUpdateType,
    pub shard: ShardInfo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ShardTaskType {
    ClearShard = 1,
    SyncRouteVersion = 2,
    CheckAndClear = 3,
    Checkpoint = 4,
}

/// Background work the catalog hands back to a reporting shard node.
/// Nodes refuse tasks whose route version no longer matches their state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTask {
    pub task_type: ShardTaskType,
    pub disk_id: DiskId,
    pub suid: Suid,
    pub route_version: RouteVersion,
    pub old_route_version: RouteVersion,
}

/// Per-unit state a shard node reports to the catalog.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardUnitInfo {
    pub suid: Suid,
    pub disk_id: DiskId,
    pub applied_index: u64,
    pub leader_disk_id: DiskId,
    pub range: Range,
    pub route_version: RouteVersion,
}
