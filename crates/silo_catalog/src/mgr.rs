//! Catalog manager: striped in-memory shard/space maps loaded from the
//! catalog tables, a dirty overlay flushed on an interval, route-log
//! truncation, and the client-facing mutation and read surface.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, RwLock as StdRwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use silo_proto::catalog::{
    CatalogChangeItem, CatalogChanges, Range, RouteUpdateType, ShardInfo, ShardTask, ShardUnit,
    ShardUnitStatus, Space,
};
use silo_proto::ids::{ClusterId, DiskId, NodeId, RouteVersion, ShardId, SpaceId, Suid, SuidPrefix};
use silo_proto::rpc::{AddShardArgs, ShardReportArgs};
use silo_util::taskpool::TaskDistribution;

use crate::applier::{
    AdminUpdateShardArgs, AllocShardUnitArgs, CreateShardCtx, UpdateShardUnitArgs,
    INCREASE_EPOCH_INTERVAL, OPER_TYPE_ADMIN_UPDATE_SHARD, OPER_TYPE_ADMIN_UPDATE_SHARD_UNIT,
    OPER_TYPE_ALLOC_SHARD_UNIT, OPER_TYPE_CREATE_SHARD, OPER_TYPE_CREATE_SPACE,
    OPER_TYPE_INCREASE_SHARD_UNITS_EPOCH, OPER_TYPE_INIT_CREATE_SHARD, OPER_TYPE_SHARD_REPORT,
    OPER_TYPE_UPDATE_SHARD_UNIT, OPER_TYPE_UPDATE_SHARD_UNIT_STATUS,
};
use crate::route::RouteMgr;
use crate::tables::{CatalogTables, NodeRecord, ShardRecord, ShardUnitRecord};

/// Catalog manager configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub catalog_db_path: PathBuf,
    /// Interval between dirty-shard flushes, in seconds.
    #[serde(default = "default_flush_interval_s")]
    pub flush_interval_s: u64,
    /// Stripes of the in-memory shard map.
    #[serde(default = "default_shard_concurrent_map_num")]
    pub shard_concurrent_map_num: u32,
    /// Stripes of the in-memory space map.
    #[serde(default = "default_space_concurrent_map_num")]
    pub space_concurrent_map_num: u32,
    /// Width of the keyed apply task distribution.
    #[serde(default = "default_apply_concurrency")]
    pub apply_concurrency: u32,
    /// Shards to create at cluster bootstrap.
    #[serde(default = "default_init_shard_num")]
    pub init_shard_num: usize,
    /// Interval between bootstrap-completion checks, in seconds.
    #[serde(default = "default_check_init_shard_interval_s")]
    pub check_init_shard_interval_s: u64,
    /// Route-log items retained past the head.
    #[serde(default = "default_route_item_truncate_interval_num")]
    pub route_item_truncate_interval_num: u64,
    #[serde(default)]
    pub cluster_id: ClusterId,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub idc: Vec<String>,
    #[serde(default)]
    pub unavailable_idc: String,
}

fn default_flush_interval_s() -> u64 {
    600
}
fn default_shard_concurrent_map_num() -> u32 {
    32
}
fn default_space_concurrent_map_num() -> u32 {
    8
}
fn default_apply_concurrency() -> u32 {
    20
}
fn default_init_shard_num() -> usize {
    1
}
fn default_check_init_shard_interval_s() -> u64 {
    60
}
fn default_route_item_truncate_interval_num() -> u64 {
    50_000
}

impl CatalogConfig {
    pub fn new(catalog_db_path: PathBuf) -> Self {
        Self {
            catalog_db_path,
            flush_interval_s: default_flush_interval_s(),
            shard_concurrent_map_num: default_shard_concurrent_map_num(),
            space_concurrent_map_num: default_space_concurrent_map_num(),
            apply_concurrency: default_apply_concurrency(),
            init_shard_num: default_init_shard_num(),
            check_init_shard_interval_s: default_check_init_shard_interval_s(),
            route_item_truncate_interval_num: default_route_item_truncate_interval_num(),
            cluster_id: ClusterId(0),
            region: String::new(),
            idc: Vec::new(),
            unavailable_idc: String::new(),
        }
    }
}

/// Per-unit epoch bookkeeping: the current epoch plus the highest epoch
/// ever reserved for the slot.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnitEpoch {
    pub epoch: u32,
    pub next_epoch: u32,
}

/// One shard held by the catalog, with its epoch ledger.
pub struct ShardItem {
    pub shard_id: ShardId,
    state: StdRwLock<(ShardInfo, Vec<UnitEpoch>)>,
}

impl ShardItem {
    fn new(shard_id: ShardId, info: ShardInfo, epochs: Vec<UnitEpoch>) -> Self {
        Self {
            shard_id,
            state: StdRwLock::new((info, epochs)),
        }
    }

    pub fn info(&self) -> ShardInfo {
        self.state.read().expect("shard item lock poisoned").0.clone()
    }

    pub fn epochs(&self) -> Vec<UnitEpoch> {
        self.state.read().expect("shard item lock poisoned").1.clone()
    }

    /// Mutate info and epochs under one lock.
    pub fn with_mut<T>(
        &self,
        f: impl FnOnce(&mut ShardInfo, &mut Vec<UnitEpoch>) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut state = self.state.write().expect("shard item lock poisoned");
        let (info, epochs) = &mut *state;
        f(info, epochs)
    }
}

/// Striped shard map.
pub struct ConcurrentShards {
    stripes: Vec<StdRwLock<std::collections::HashMap<u32, Arc<ShardItem>>>>,
}

impl ConcurrentShards {
    fn new(stripes: u32) -> Self {
        Self {
            stripes: (0..stripes.max(1))
                .map(|_| StdRwLock::new(std::collections::HashMap::new()))
                .collect(),
        }
    }

    fn stripe(&self, shard_id: ShardId) -> &StdRwLock<std::collections::HashMap<u32, Arc<ShardItem>>> {
        &self.stripes[shard_id.0 as usize % self.stripes.len()]
    }

    pub fn get(&self, shard_id: ShardId) -> Option<Arc<ShardItem>> {
        self.stripe(shard_id)
            .read()
            .expect("shard stripe lock poisoned")
            .get(&shard_id.0)
            .cloned()
    }

    pub fn put(&self, shard_id: ShardId, info: ShardInfo, epochs: Vec<UnitEpoch>) {
        let item = Arc::new(ShardItem::new(shard_id, info, epochs));
        self.stripe(shard_id)
            .write()
            .expect("shard stripe lock poisoned")
            .insert(shard_id.0, item);
    }

    pub fn len(&self) -> usize {
        self.stripes
            .iter()
            .map(|s| s.read().expect("shard stripe lock poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<Arc<ShardItem>> {
        let mut out = Vec::new();
        for stripe in &self.stripes {
            out.extend(stripe.read().expect("shard stripe lock poisoned").values().cloned());
        }
        out.sort_by_key(|item| item.shard_id.0);
        out
    }
}

/// Space directory with a unique-name index.
pub struct ConcurrentSpaces {
    by_id: StdRwLock<std::collections::HashMap<u64, Arc<Space>>>,
    by_name: StdRwLock<std::collections::HashMap<String, SpaceId>>,
}

impl ConcurrentSpaces {
    fn new() -> Self {
        Self {
            by_id: StdRwLock::new(std::collections::HashMap::new()),
            by_name: StdRwLock::new(std::collections::HashMap::new()),
        }
    }

    pub fn get_by_id(&self, space_id: SpaceId) -> Option<Arc<Space>> {
        self.by_id
            .read()
            .expect("space lock poisoned")
            .get(&space_id.0)
            .cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Space>> {
        let space_id = *self.by_name.read().expect("space lock poisoned").get(name)?;
        self.get_by_id(space_id)
    }

    pub fn put(&self, space: Space) {
        self.by_name
            .write()
            .expect("space lock poisoned")
            .insert(space.name.clone(), space.space_id);
        self.by_id
            .write()
            .expect("space lock poisoned")
            .insert(space.space_id.0, Arc::new(space));
    }
}

/// Seam to the catalog's own consensus layer: mutations are proposed and
/// come back through [`CatalogMgr::apply`] on every replica.
#[async_trait]
pub trait CatalogReplicator: Send + Sync {
    async fn propose(&self, op_type: i32, data: Vec<u8>) -> anyhow::Result<Vec<ShardTask>>;
}

/// Loopback replicator: applies locally, for tests and single-replica use.
pub struct LoopbackReplicator {
    mgr: Weak<CatalogMgr>,
}

#[async_trait]
impl CatalogReplicator for LoopbackReplicator {
    async fn propose(&self, op_type: i32, data: Vec<u8>) -> anyhow::Result<Vec<ShardTask>> {
        let mgr = self
            .mgr
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("catalog manager is gone"))?;
        let mut out = mgr.apply(&[op_type], &[data]).await?;
        Ok(out.pop().unwrap_or_default())
    }
}

/// Seam to the disk manager: placement and host resolution.
pub trait DiskApi: Send + Sync {
    /// Pick disks (with hosts) for a new shard's units.
    fn alloc_shard_units(&self, count: usize) -> anyhow::Result<Vec<(DiskId, String)>>;
    fn disk_host(&self, disk_id: DiskId) -> anyhow::Result<String>;
}

/// Seam to shard nodes for materializing catalog decisions.
#[async_trait]
pub trait ShardNodeApi: Send + Sync {
    async fn add_shard(&self, host: &str, args: AddShardArgs) -> anyhow::Result<()>;
}

pub struct CatalogMgr {
    cfg: CatalogConfig,
    tables: Arc<CatalogTables>,
    all_shards: ConcurrentShards,
    all_spaces: ConcurrentSpaces,
    /// Registered storage nodes and the disk-to-node index derived from
    /// them, backing disk-to-host resolution.
    nodes: StdRwLock<std::collections::HashMap<u32, Arc<NodeRecord>>>,
    disk_nodes: StdRwLock<std::collections::HashMap<u32, u32>>,
    dirty: Mutex<HashSet<ShardId>>,
    route_mgr: RouteMgr,
    apply_pool: TaskDistribution,
    replicator: OnceLock<Arc<dyn CatalogReplicator>>,
    disk_api: Arc<dyn DiskApi>,
    shardnode_api: Arc<dyn ShardNodeApi>,
    close_tx: watch::Sender<bool>,
}

impl CatalogMgr {
    pub fn new(
        cfg: CatalogConfig,
        disk_api: Arc<dyn DiskApi>,
        shardnode_api: Arc<dyn ShardNodeApi>,
    ) -> anyhow::Result<Arc<Self>> {
        let tables = Arc::new(CatalogTables::open(&cfg.catalog_db_path)?);
        let route_mgr = RouteMgr::new(cfg.route_item_truncate_interval_num, Arc::clone(&tables));
        let (close_tx, _) = watch::channel(false);
        let mgr = Arc::new(Self {
            all_shards: ConcurrentShards::new(cfg.shard_concurrent_map_num),
            all_spaces: ConcurrentSpaces::new(),
            nodes: StdRwLock::new(std::collections::HashMap::new()),
            disk_nodes: StdRwLock::new(std::collections::HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            route_mgr,
            apply_pool: TaskDistribution::new(cfg.apply_concurrency as usize),
            replicator: OnceLock::new(),
            disk_api,
            shardnode_api,
            tables,
            close_tx,
            cfg,
        });
        mgr.load_data()?;
        Ok(mgr)
    }

    /// Bind the consensus layer. Must be called before mutations.
    pub fn set_replicator(&self, replicator: Arc<dyn CatalogReplicator>) {
        let _ = self.replicator.set(replicator);
    }

    /// Wire the loopback replicator, applying proposals in-process.
    pub fn set_loopback_replicator(self: &Arc<Self>) {
        self.set_replicator(Arc::new(LoopbackReplicator {
            mgr: Arc::downgrade(self),
        }));
    }

    fn replicator(&self) -> anyhow::Result<&Arc<dyn CatalogReplicator>> {
        self.replicator
            .get()
            .ok_or_else(|| anyhow::anyhow!("catalog replicator not set"))
    }

    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    // Accessors shared with the applier.

    pub(crate) fn tables(&self) -> &CatalogTables {
        &self.tables
    }

    pub(crate) fn shards(&self) -> &ConcurrentShards {
        &self.all_shards
    }

    pub(crate) fn spaces(&self) -> &ConcurrentSpaces {
        &self.all_spaces
    }

    pub(crate) fn route_mgr(&self) -> &RouteMgr {
        &self.route_mgr
    }

    pub(crate) fn apply_pool(&self) -> &TaskDistribution {
        &self.apply_pool
    }

    pub(crate) fn mark_dirty(&self, shard_id: ShardId) {
        self.dirty.lock().expect("dirty lock poisoned").insert(shard_id);
    }

    // Startup loading.

    fn load_data(&self) -> anyhow::Result<()> {
        // Nodes come first: shard units resolve their hosts through them.
        self.load_nodes()?;
        self.load_shards()?;
        self.load_spaces()?;
        self.route_mgr.load_route()?;
        // The route head can outrun the retained log tail.
        let newest = self
            .all_shards
            .list()
            .iter()
            .map(|item| item.info().route_version)
            .max()
            .unwrap_or_default();
        self.route_mgr.advance_head_to(newest);
        Ok(())
    }

    fn load_nodes(&self) -> anyhow::Result<()> {
        self.tables.range_node_record(|record| {
            self.index_node(Arc::new(record));
            Ok(())
        })
    }

    fn load_shards(&self) -> anyhow::Result<()> {
        self.tables.range_shard_record(|record: ShardRecord| {
            let mut units = Vec::with_capacity(record.suid_prefixes.len());
            let mut epochs = Vec::with_capacity(record.suid_prefixes.len());
            for prefix in &record.suid_prefixes {
                let unit = self
                    .tables
                    .get_shard_unit(*prefix)?
                    .ok_or_else(|| anyhow::anyhow!("missing unit record for {prefix}"))?;
                let host = self.disk_host(unit.disk_id).unwrap_or_default();
                units.push(ShardUnit {
                    suid: prefix.suid(unit.epoch),
                    disk_id: unit.disk_id,
                    host,
                    learner: unit.learner,
                    status: unit.status,
                    route_version: unit.route_version,
                });
                epochs.push(UnitEpoch {
                    epoch: unit.epoch,
                    next_epoch: unit.next_epoch,
                });
            }
            let info = ShardInfo {
                shard_id: record.shard_id,
                range: record.range,
                route_version: record.route_version,
                leader_disk_id: record.leader_disk_id,
                units,
            };
            self.all_shards.put(record.shard_id, info, epochs);
            Ok(())
        })
    }

    fn load_spaces(&self) -> anyhow::Result<()> {
        self.tables.range_space_record(|space| {
            self.all_spaces.put(space);
            Ok(())
        })
    }

    // Node directory.

    /// Register a storage node and the disks it hosts. Re-registration
    /// updates the host and keeps previously reported disks.
    pub fn register_node(&self, mut record: NodeRecord) -> anyhow::Result<()> {
        anyhow::ensure!(record.node_id.is_valid(), "node id must be valid");
        anyhow::ensure!(!record.host.is_empty(), "node host must not be empty");
        if let Some(existing) = self.tables.get_node(record.node_id)? {
            for disk_id in existing.disk_ids {
                if !record.disk_ids.contains(&disk_id) {
                    record.disk_ids.push(disk_id);
                }
            }
        }
        self.tables.put_node(&record)?;
        tracing::info!(node_id = %record.node_id, host = %record.host, "node registered");
        self.index_node(Arc::new(record));
        Ok(())
    }

    pub fn get_node_info(&self, node_id: NodeId) -> Option<Arc<NodeRecord>> {
        self.nodes
            .read()
            .expect("node map lock poisoned")
            .get(&node_id.0)
            .cloned()
    }

    /// Resolve a disk to its node's host. Falls back to the disk manager
    /// seam for disks no registered node has reported.
    pub fn disk_host(&self, disk_id: DiskId) -> anyhow::Result<String> {
        let node_id = self
            .disk_nodes
            .read()
            .expect("node map lock poisoned")
            .get(&disk_id.0)
            .copied();
        if let Some(node_id) = node_id {
            if let Some(node) = self.nodes.read().expect("node map lock poisoned").get(&node_id)
            {
                return Ok(node.host.clone());
            }
        }
        self.disk_api.disk_host(disk_id)
    }

    fn index_node(&self, record: Arc<NodeRecord>) {
        {
            let mut disk_nodes = self.disk_nodes.write().expect("node map lock poisoned");
            for disk_id in &record.disk_ids {
                disk_nodes.insert(disk_id.0, record.node_id.0);
            }
        }
        self.nodes
            .write()
            .expect("node map lock poisoned")
            .insert(record.node_id.0, record);
    }

    // Mutation surface.

    pub async fn create_space(&self, space: Space) -> anyhow::Result<()> {
        anyhow::ensure!(!space.name.is_empty(), "space name must not be empty");
        if let Some(existing) = self.all_spaces.get_by_name(&space.name) {
            anyhow::bail!("space name {} already taken by {}", space.name, existing.space_id);
        }
        let data = serde_json::to_vec(&space)?;
        self.replicator()?.propose(OPER_TYPE_CREATE_SPACE, data).await?;
        Ok(())
    }

    pub fn get_space(&self, space_id: SpaceId) -> Option<Arc<Space>> {
        self.all_spaces.get_by_id(space_id)
    }

    pub fn get_space_by_name(&self, name: &str) -> Option<Arc<Space>> {
        self.all_spaces.get_by_name(name)
    }

    /// Create one shard: allocate unit placements, replicate the create,
    /// then materialize units on their shard nodes.
    pub async fn create_shard(
        &self,
        shard_id: ShardId,
        range: Range,
        replica_count: usize,
    ) -> anyhow::Result<ShardInfo> {
        let placements = self.disk_api.alloc_shard_units(replica_count)?;
        anyhow::ensure!(!placements.is_empty(), "no disks available for shard units");

        let units = placements
            .iter()
            .enumerate()
            .map(|(index, (disk_id, host))| ShardUnit {
                suid: Suid::new(shard_id, index as u8, 1),
                disk_id: *disk_id,
                host: host.clone(),
                learner: false,
                status: ShardUnitStatus::Normal,
                route_version: RouteVersion(0),
            })
            .collect();
        let ctx = CreateShardCtx {
            shard_id,
            shard_info: ShardInfo {
                shard_id,
                range,
                route_version: RouteVersion(0),
                leader_disk_id: DiskId(0),
                units,
            },
        };
        let data = serde_json::to_vec(&ctx)?;
        self.replicator()?
            .propose(OPER_TYPE_INIT_CREATE_SHARD, data.clone())
            .await?;
        self.replicator()?.propose(OPER_TYPE_CREATE_SHARD, data).await?;

        let info = self
            .all_shards
            .get(shard_id)
            .ok_or_else(|| anyhow::anyhow!("shard {shard_id} missing after create"))?
            .info();
        for unit in &info.units {
            self.shardnode_api
                .add_shard(
                    &unit.host,
                    AddShardArgs {
                        disk_id: unit.disk_id,
                        suid: unit.suid,
                        route_version: info.route_version,
                        range: info.range.clone(),
                        units: info.units.clone(),
                    },
                )
                .await?;
        }
        Ok(info)
    }

    /// Create the bootstrap shards if they do not all exist yet, slicing
    /// the hash space evenly.
    pub async fn check_init_shards(&self, replica_count: usize) -> anyhow::Result<()> {
        let want = self.cfg.init_shard_num.max(1);
        let have = self.all_shards.len();
        if have >= want {
            return Ok(());
        }
        let step = u64::MAX / want as u64;
        for i in have..want {
            let shard_id = ShardId(i as u32 + 1);
            let min = step * i as u64;
            let max = if i + 1 == want { u64::MAX } else { step * (i as u64 + 1) };
            self.create_shard(shard_id, Range::new_hash(min, max), replica_count)
                .await?;
        }
        Ok(())
    }

    /// Reserve the next epoch for a replica slot, returning the suid a
    /// replacement unit must be minted with.
    pub async fn alloc_shard_unit(&self, suid_prefix: SuidPrefix) -> anyhow::Result<Suid> {
        let data = serde_json::to_vec(&AllocShardUnitArgs { suid_prefix })?;
        self.replicator()?
            .propose(OPER_TYPE_ALLOC_SHARD_UNIT, data)
            .await?;
        let item = self
            .all_shards
            .get(suid_prefix.shard_id())
            .ok_or_else(|| anyhow::anyhow!("shard {} not found", suid_prefix.shard_id()))?;
        let epochs = item.epochs();
        let index = suid_prefix.index() as usize;
        anyhow::ensure!(index < epochs.len(), "unit index out of range");
        Ok(suid_prefix.suid(epochs[index].next_epoch))
    }

    pub async fn update_shard_unit(&self, args: UpdateShardUnitArgs) -> anyhow::Result<()> {
        let data = serde_json::to_vec(&args)?;
        self.replicator()?
            .propose(OPER_TYPE_UPDATE_SHARD_UNIT, data)
            .await?;
        Ok(())
    }

    pub async fn update_shard_unit_status(
        &self,
        prefixes: Vec<SuidPrefix>,
    ) -> anyhow::Result<()> {
        let data = serde_json::to_vec(&prefixes)?;
        self.replicator()?
            .propose(OPER_TYPE_UPDATE_SHARD_UNIT_STATUS, data)
            .await?;
        Ok(())
    }

    /// Fold a shard-node report in and hand back the tasks it owes.
    pub async fn shard_report(&self, args: ShardReportArgs) -> anyhow::Result<Vec<ShardTask>> {
        let data = serde_json::to_vec(&args)?;
        self.replicator()?.propose(OPER_TYPE_SHARD_REPORT, data).await
    }

    /// Jump every unit's epoch by the restart interval, so epochs minted
    /// after a catalog restart stay ahead of anything granted before it.
    pub async fn increase_shard_units_epoch(&self) -> anyhow::Result<()> {
        for item in self.all_shards.list() {
            let (info, epochs) = (item.info(), item.epochs());
            let mut records = Vec::with_capacity(info.units.len());
            for (unit, epoch) in info.units.iter().zip(&epochs) {
                let jumped = epoch.epoch + INCREASE_EPOCH_INTERVAL;
                records.push(ShardUnitRecord {
                    suid_prefix: unit.suid.prefix(),
                    epoch: jumped,
                    next_epoch: epoch.next_epoch.max(jumped),
                    disk_id: unit.disk_id,
                    learner: unit.learner,
                    status: unit.status,
                    route_version: unit.route_version,
                });
            }
            let data = serde_json::to_vec(&records)?;
            self.replicator()?
                .propose(OPER_TYPE_INCREASE_SHARD_UNITS_EPOCH, data)
                .await?;
        }
        Ok(())
    }

    /// Operator override of shard-level fields, bypassing sequencing.
    pub async fn admin_update_shard(&self, args: AdminUpdateShardArgs) -> anyhow::Result<()> {
        let data = serde_json::to_vec(&args)?;
        self.replicator()?
            .propose(OPER_TYPE_ADMIN_UPDATE_SHARD, data)
            .await?;
        Ok(())
    }

    /// Operator override of one unit row, bypassing sequencing.
    pub async fn admin_update_shard_unit(&self, record: ShardUnitRecord) -> anyhow::Result<()> {
        let data = serde_json::to_vec(&record)?;
        self.replicator()?
            .propose(OPER_TYPE_ADMIN_UPDATE_SHARD_UNIT, data)
            .await?;
        Ok(())
    }

    // Read surface.

    pub fn get_shard_info(&self, shard_id: ShardId) -> Option<ShardInfo> {
        self.all_shards.get(shard_id).map(|item| item.info())
    }

    pub fn list_shard_infos(&self) -> Vec<ShardInfo> {
        self.all_shards.list().iter().map(|item| item.info()).collect()
    }

    pub fn get_route_version(&self) -> RouteVersion {
        self.route_mgr.get_route_version()
    }

    /// Route items since `from`, joined with current shard infos. A reader
    /// behind the retained tail gets the full view as add items.
    pub fn get_catalog_changes(&self, from: RouteVersion) -> anyhow::Result<CatalogChanges> {
        let head = self.route_mgr.get_route_version();
        let mut changes = CatalogChanges {
            route_version: head,
            items: Vec::new(),
        };
        match self.route_mgr.get_route_items(from) {
            Some(items) => {
                for item in items {
                    let Some(shard) = self.get_shard_info(item.shard_id) else {
                        continue;
                    };
                    changes.items.push(CatalogChangeItem {
                        route_version: item.route_version,
                        update_type: item.update_type,
                        shard,
                    });
                }
            }
            None => {
                // Too far behind: replay the whole directory.
                for shard in self.list_shard_infos() {
                    changes.items.push(CatalogChangeItem {
                        route_version: shard.route_version,
                        update_type: RouteUpdateType::AddShard,
                        shard,
                    });
                }
            }
        }
        Ok(changes)
    }

    // Background loops.

    /// Persist every shard mutated since the last flush.
    pub fn flush_dirty(&self) -> anyhow::Result<usize> {
        // Swap in a fresh dirty set so concurrent marks go to the next
        // flush round.
        let drained: Vec<ShardId> = {
            let mut dirty = self.dirty.lock().expect("dirty lock poisoned");
            std::mem::take(&mut *dirty).into_iter().collect()
        };
        for shard_id in &drained {
            let Some(item) = self.all_shards.get(*shard_id) else {
                continue;
            };
            let (info, epochs) = (item.info(), item.epochs());
            let mut prefixes = Vec::with_capacity(info.units.len());
            for (unit, epoch) in info.units.iter().zip(&epochs) {
                let prefix = unit.suid.prefix();
                self.tables.put_shard_unit(&ShardUnitRecord {
                    suid_prefix: prefix,
                    epoch: epoch.epoch,
                    next_epoch: epoch.next_epoch,
                    disk_id: unit.disk_id,
                    learner: unit.learner,
                    status: unit.status,
                    route_version: unit.route_version,
                })?;
                prefixes.push(prefix);
            }
            self.tables.put_shard(&ShardRecord {
                shard_id: *shard_id,
                range: info.range.clone(),
                route_version: info.route_version,
                leader_disk_id: info.leader_disk_id,
                suid_prefixes: prefixes,
            })?;
        }
        Ok(drained.len())
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.lock().expect("dirty lock poisoned").len()
    }
}

/// Route-log truncation cadence.
const ROUTE_TRUNCATE_INTERVAL_S: u64 = 60;

/// Start the flush and route-truncation loops.
pub fn spawn_loops(mgr: Arc<CatalogMgr>) {
    let mut close_rx = mgr.close_tx.subscribe();
    tokio::spawn(async move {
        let mut flush = tokio::time::interval(Duration::from_secs(mgr.cfg.flush_interval_s.max(1)));
        let mut route = tokio::time::interval(Duration::from_secs(ROUTE_TRUNCATE_INTERVAL_S));
        flush.tick().await;
        route.tick().await;
        loop {
            tokio::select! {
                _ = flush.tick() => {
                    match mgr.flush_dirty() {
                        Ok(flushed) if flushed > 0 => {
                            tracing::debug!(flushed, "catalog dirty flush");
                        }
                        Ok(_) => {}
                        Err(err) => tracing::warn!(error = ?err, "catalog flush failed"),
                    }
                }
                _ = route.tick() => {
                    if let Err(err) = mgr.route_mgr.truncate() {
                        tracing::warn!(error = ?err, "route truncation failed");
                    }
                }
                _ = close_rx.changed() => {
                    return;
                }
            }
        }
    });
}
