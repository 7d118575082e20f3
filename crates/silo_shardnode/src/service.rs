//! Shard-node service: disk registry, client-facing entry points with
//! argument validation, report/checkpoint loops and catalog task
//! execution.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use silo_proto::blob::{Blob, Item, MAX_KEY_SIZE};
use silo_proto::catalog::{ShardTask, ShardTaskType, ShardUnitInfo};
use silo_proto::ids::{DiskId, ShardId, Suid};
use silo_proto::rpc::{
    AddShardArgs, AllocSliceArgs, AllocSliceRet, CreateBlobArgs, DBStatsArgs, DBStatsRet,
    DeleteBlobArgs, DeleteItemArgs, GetBlobArgs, GetItemArgs, InsertItemArgs, ListBlobArgs,
    ListBlobRet, ListItemArgs, ListItemRet, ListShardArgs, ListShardBaseInfo, SealBlobArgs,
    ShardStats, TransferShardLeaderArgs, UpdateItemArgs, UpdateShardArgs,
};
use silo_proto::ApiError;

use crate::shard::ShardHandler;
use crate::store::ShardStore;

/// Seam to the catalog manager's report endpoint.
#[async_trait]
pub trait CatalogTransport: Send + Sync {
    /// Report per-unit state; the catalog answers with background tasks.
    async fn shard_report(&self, reports: Vec<ShardUnitInfo>) -> anyhow::Result<Vec<ShardTask>>;
}

/// Shard-node service configuration.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Interval between shard reports to the catalog, in seconds.
    #[serde(default = "default_report_interval_s")]
    pub report_interval_s: u64,
    /// Interval between shard checkpoints, in minutes.
    #[serde(default = "default_checkpoint_interval_m")]
    pub checkpoint_interval_m: u64,
    /// Interval between trash-shard sweeps, in hours.
    #[serde(default = "default_check_and_clear_interval_h")]
    pub shard_check_and_clear_interval_h: u64,
}

fn default_report_interval_s() -> u64 {
    60
}

fn default_checkpoint_interval_m() -> u64 {
    30
}

fn default_check_and_clear_interval_h() -> u64 {
    24
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            report_interval_s: default_report_interval_s(),
            checkpoint_interval_m: default_checkpoint_interval_m(),
            shard_check_and_clear_interval_h: default_check_and_clear_interval_h(),
        }
    }
}

pub struct NodeService {
    cfg: NodeConfig,
    disks: StdRwLock<HashMap<DiskId, Arc<ShardStore>>>,
    transport: Arc<dyn CatalogTransport>,
    close_tx: watch::Sender<bool>,
}

impl NodeService {
    pub fn new(cfg: NodeConfig, transport: Arc<dyn CatalogTransport>) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            cfg,
            disks: StdRwLock::new(HashMap::new()),
            transport,
            close_tx,
        }
    }

    pub fn add_disk(&self, store: Arc<ShardStore>) {
        self.disks
            .write()
            .expect("disk map lock poisoned")
            .insert(store.disk_id(), store);
    }

    pub fn get_disk(&self, disk_id: DiskId) -> anyhow::Result<Arc<ShardStore>> {
        self.disks
            .read()
            .expect("disk map lock poisoned")
            .get(&disk_id)
            .cloned()
            .ok_or_else(|| anyhow::Error::new(ApiError::ShardNodeDiskNotFound))
    }

    fn all_disks(&self) -> Vec<Arc<ShardStore>> {
        self.disks
            .read()
            .expect("disk map lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn get_shard(&self, disk_id: DiskId, suid: Suid) -> anyhow::Result<ShardHandler> {
        self.get_disk(disk_id)?.get_shard(suid)
    }

    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    // Shard management surface.

    pub fn add_shard(&self, args: &AddShardArgs) -> anyhow::Result<()> {
        let disk = self.get_disk(args.disk_id)?;
        disk.add_shard(
            args.suid,
            args.route_version,
            args.range.clone(),
            args.units.clone(),
        )
    }

    pub async fn update_shard(&self, args: &UpdateShardArgs) -> anyhow::Result<()> {
        let disk = self.get_disk(args.disk_id)?;
        disk.update_shard(args.suid, args.update_type, args.unit.clone())
            .await
    }

    pub async fn transfer_shard_leader(&self, args: &TransferShardLeaderArgs) -> anyhow::Result<()> {
        let shard = self.get_shard(args.disk_id, args.suid)?;
        shard.transfer_leader(args.dest_disk_id).await
    }

    pub async fn get_shard_stats(&self, disk_id: DiskId, suid: Suid) -> anyhow::Result<ShardStats> {
        let shard = self.get_shard(disk_id, suid)?;
        shard.stats(true).await
    }

    pub async fn get_shard_unit_info(
        &self,
        disk_id: DiskId,
        suid: Suid,
    ) -> anyhow::Result<ShardUnitInfo> {
        let stats = self.get_shard_stats(disk_id, suid).await?;
        Ok(ShardUnitInfo {
            suid,
            disk_id,
            applied_index: stats.applied_index,
            leader_disk_id: stats.leader_disk_id,
            range: stats.range,
            route_version: stats.route_version,
        })
    }

    pub fn db_stats(&self, args: &DBStatsArgs) -> anyhow::Result<DBStatsRet> {
        let disk = self.get_disk(args.disk_id)?;
        Ok(DBStatsRet {
            used: disk.disk_space(),
            shard_count: disk.shard_count() as u64,
        })
    }

    pub fn list_shards(&self, args: &ListShardArgs) -> anyhow::Result<Vec<ListShardBaseInfo>> {
        let disk = self.get_disk(args.disk_id)?;
        let mut out = Vec::new();
        let mut remaining = args.count;
        disk.range_shard_no_rw_check(|handler| {
            if remaining == 0 {
                return false;
            }
            let suid = handler.suid();
            if args.shard_id != ShardId(0) && suid.shard_id() != args.shard_id {
                return true;
            }
            out.push(ListShardBaseInfo {
                suid,
                shard_id: suid.shard_id(),
                disk_id: args.disk_id,
                index: suid.index() as u32,
                epoch: suid.epoch(),
                units: handler.units(),
            });
            if suid.shard_id() == args.shard_id {
                return false;
            }
            remaining -= 1;
            true
        });
        Ok(out)
    }

    // Blob surface.

    pub async fn create_blob(&self, args: &CreateBlobArgs) -> anyhow::Result<Blob> {
        anyhow::ensure!(!args.name.is_empty(), ApiError::IllegalArguments);
        anyhow::ensure!(args.name.len() <= MAX_KEY_SIZE, ApiError::KeySizeTooLarge);
        let shard = self.get_shard(args.header.disk_id, args.header.suid)?;
        shard.create_blob(args).await
    }

    pub async fn get_blob(&self, args: &GetBlobArgs) -> anyhow::Result<Blob> {
        let shard = self.get_shard(args.header.disk_id, args.header.suid)?;
        shard.get_blob(args).await
    }

    pub async fn seal_blob(&self, args: &SealBlobArgs) -> anyhow::Result<()> {
        let shard = self.get_shard(args.header.disk_id, args.header.suid)?;
        shard.seal_blob(args).await
    }

    pub async fn find_and_delete_blob(&self, args: &DeleteBlobArgs) -> anyhow::Result<Blob> {
        let shard = self.get_shard(args.header.disk_id, args.header.suid)?;
        shard.find_and_delete_blob(args).await
    }

    pub async fn alloc_slice(&self, args: &AllocSliceArgs) -> anyhow::Result<AllocSliceRet> {
        let shard = self.get_shard(args.header.disk_id, args.header.suid)?;
        let slices = shard.alloc_slice(args).await?;
        Ok(AllocSliceRet { slices })
    }

    pub async fn list_blob(&self, args: &ListBlobArgs) -> anyhow::Result<ListBlobRet> {
        let shard = self.get_shard(args.header.disk_id, args.header.suid)?;
        shard.list_blob(args).await
    }

    // Item surface.

    pub async fn insert_item(&self, args: &InsertItemArgs) -> anyhow::Result<()> {
        check_item(&args.item)?;
        let shard = self.get_shard(args.header.disk_id, args.header.suid)?;
        shard.insert_item(&args.header, &args.item).await
    }

    pub async fn update_item(&self, args: &UpdateItemArgs) -> anyhow::Result<()> {
        check_item(&args.item)?;
        let shard = self.get_shard(args.header.disk_id, args.header.suid)?;
        shard.update_item(&args.header, &args.item).await
    }

    pub async fn delete_item(&self, args: &DeleteItemArgs) -> anyhow::Result<()> {
        let shard = self.get_shard(args.header.disk_id, args.header.suid)?;
        shard.delete_item(&args.header, &args.id).await
    }

    pub async fn get_item(&self, args: &GetItemArgs) -> anyhow::Result<Item> {
        let shard = self.get_shard(args.header.disk_id, args.header.suid)?;
        shard.get_item(args).await
    }

    pub async fn list_item(&self, args: &ListItemArgs) -> anyhow::Result<ListItemRet> {
        let shard = self.get_shard(args.header.disk_id, args.header.suid)?;
        shard.list_item(args).await
    }

    // Reporting and catalog task execution.

    /// Collect per-unit state across all disks and execute the tasks the
    /// catalog answers with.
    pub async fn shard_reports(&self) -> anyhow::Result<()> {
        let mut reports = Vec::new();
        for disk in self.all_disks() {
            let mut shards = Vec::new();
            disk.range_shard_no_rw_check(|handler| {
                shards.push(handler.clone());
                true
            });
            for shard in shards {
                match shard.stats(false).await {
                    Ok(stats) => reports.push(ShardUnitInfo {
                        suid: stats.suid,
                        disk_id: disk.disk_id(),
                        applied_index: stats.applied_index,
                        leader_disk_id: stats.leader_disk_id,
                        range: stats.range,
                        route_version: stats.route_version,
                    }),
                    Err(err) => {
                        tracing::warn!(
                            suid = %shard.suid(),
                            error = ?err,
                            "get shard stats failed, reporting bare unit"
                        );
                        reports.push(ShardUnitInfo {
                            suid: shard.suid(),
                            disk_id: disk.disk_id(),
                            route_version: shard.route_version(),
                            ..Default::default()
                        });
                    }
                }
            }
        }

        let tasks = self.transport.shard_report(reports).await?;
        for task in tasks {
            if let Err(err) = self.execute_shard_task(&task).await {
                tracing::warn!(task = ?task, error = ?err, "execute shard task failed");
            }
        }
        Ok(())
    }

    /// Run one catalog task, refusing it when the shard's route version no
    /// longer matches the one the task was minted for.
    pub async fn execute_shard_task(&self, task: &ShardTask) -> anyhow::Result<()> {
        tracing::info!(task = ?task, "execute shard task");
        let disk = self.get_disk(task.disk_id)?;
        let shard = disk.get_shard_no_rw_check(task.suid)?;

        match task.task_type {
            ShardTaskType::ClearShard => {
                let current = shard.route_version();
                anyhow::ensure!(
                    current == task.route_version,
                    "route version not match, current: {}, task old: {}, task new: {}",
                    current,
                    task.old_route_version,
                    task.route_version
                );
                disk.delete_shard(task.suid, task.route_version).await
            }
            ShardTaskType::SyncRouteVersion => {
                let current = shard.route_version();
                anyhow::ensure!(
                    current < task.route_version,
                    "route version not match, current: {}, task old: {}, task new: {}",
                    current,
                    task.old_route_version,
                    task.route_version
                );
                disk.update_shard_route_version(task.suid, task.route_version)
            }
            ShardTaskType::CheckAndClear => {
                shard.check_and_clear().await.map(|_| ())
            }
            ShardTaskType::Checkpoint => shard.checkpoint().await,
        }
    }

    async fn checkpoint_all(&self) {
        for disk in self.all_disks() {
            let mut shards = Vec::new();
            disk.range_shard(|handler| {
                shards.push(handler.clone());
                true
            });
            for shard in shards {
                if let Err(err) = shard.checkpoint().await {
                    tracing::warn!(suid = %shard.suid(), error = ?err, "checkpoint failed");
                }
            }
        }
    }

    async fn check_and_clear_all(&self) {
        for disk in self.all_disks() {
            let mut shards = Vec::new();
            disk.range_shard(|handler| {
                shards.push(handler.clone());
                true
            });
            for shard in shards {
                if let Err(err) = shard.check_and_clear().await {
                    tracing::warn!(suid = %shard.suid(), error = ?err, "check and clear failed");
                }
            }
        }
    }
}

fn check_item(item: &Item) -> anyhow::Result<()> {
    anyhow::ensure!(!item.id.is_empty(), ApiError::ItemIdEmpty);
    anyhow::ensure!(item.id.len() <= MAX_KEY_SIZE, ApiError::KeySizeTooLarge);
    Ok(())
}

/// Start the report, checkpoint and trash-sweep loops.
pub fn spawn_loops(service: Arc<NodeService>) {
    let mut close_rx = service.close_tx.subscribe();
    tokio::spawn(async move {
        let report_base = Duration::from_secs(service.cfg.report_interval_s.max(1));
        let mut checkpoint = tokio::time::interval(Duration::from_secs(
            service.cfg.checkpoint_interval_m.max(1) * 60,
        ));
        let mut trash_check = tokio::time::interval(Duration::from_secs(
            service.cfg.shard_check_and_clear_interval_h.max(1) * 3600,
        ));
        checkpoint.tick().await;
        trash_check.tick().await;

        // Reports are staggered with jitter so nodes do not stampede the
        // catalog in lockstep.
        let mut report_at = tokio::time::Instant::now() + report_base;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(report_at) => {
                    if let Err(err) = service.shard_reports().await {
                        tracing::warn!(error = ?err, "shard report failed");
                    }
                    let jitter = rand::thread_rng().gen_range(0..20);
                    report_at = tokio::time::Instant::now()
                        + report_base
                        + Duration::from_secs(jitter);
                }
                _ = checkpoint.tick() => {
                    service.checkpoint_all().await;
                }
                _ = trash_check.tick() => {
                    service.check_and_clear_all().await;
                }
                _ = close_rx.changed() => {
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::FjallStore;
    use silo_proto::catalog::Range;
    use silo_proto::ids::{ClusterId, RouteVersion};
    use silo_proto::rpc::ShardOpHeader;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeCatalog {
        reports: Mutex<Vec<Vec<ShardUnitInfo>>>,
        tasks: Mutex<Vec<ShardTask>>,
    }

    #[async_trait]
    impl CatalogTransport for FakeCatalog {
        async fn shard_report(
            &self,
            reports: Vec<ShardUnitInfo>,
        ) -> anyhow::Result<Vec<ShardTask>> {
            self.reports.lock().unwrap().push(reports);
            Ok(self.tasks.lock().unwrap().drain(..).collect())
        }
    }

    fn suid(shard: u32) -> Suid {
        Suid::new(ShardId(shard), 0, 1)
    }

    fn service_with_one_shard() -> (TempDir, Arc<NodeService>, Arc<FakeCatalog>) {
        let dir = TempDir::new().unwrap();
        let kv = Arc::new(FjallStore::open(dir.path()).unwrap());
        let disk = Arc::new(ShardStore::with_local_groups(
            DiskId(10),
            ClusterId(1),
            kv,
        ));
        disk.add_shard(
            suid(1),
            RouteVersion(1),
            Range::new_hash(0, u64::MAX),
            vec![silo_proto::catalog::ShardUnit {
                suid: suid(1),
                disk_id: DiskId(10),
                ..Default::default()
            }],
        )
        .unwrap();

        let catalog = Arc::new(FakeCatalog::default());
        let service = Arc::new(NodeService::new(
            NodeConfig::default(),
            Arc::clone(&catalog) as Arc<dyn CatalogTransport>,
        ));
        service.add_disk(disk);
        (dir, service, catalog)
    }

    fn header(disk: u32, shard: u32) -> ShardOpHeader {
        ShardOpHeader {
            disk_id: DiskId(disk),
            suid: suid(shard),
            route_version: RouteVersion(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn missing_disk_is_wire_visible() {
        let (_dir, service, _) = service_with_one_shard();
        let err = service
            .get_blob(&GetBlobArgs {
                header: header(99, 1),
                name: b"blob".to_vec(),
            })
            .await
            .unwrap_err();
        assert_eq!(
            silo_proto::error::detect_code(&err),
            Some(ApiError::ShardNodeDiskNotFound)
        );
    }

    #[tokio::test]
    async fn item_validation_rejects_bad_ids() {
        let (_dir, service, _) = service_with_one_shard();
        let err = service
            .insert_item(&InsertItemArgs {
                header: header(10, 1),
                item: Item::default(),
            })
            .await
            .unwrap_err();
        assert_eq!(
            silo_proto::error::detect_code(&err),
            Some(ApiError::ItemIdEmpty)
        );

        let err = service
            .insert_item(&InsertItemArgs {
                header: header(10, 1),
                item: Item {
                    id: vec![0u8; MAX_KEY_SIZE + 1],
                    fields: Vec::new(),
                },
            })
            .await
            .unwrap_err();
        assert_eq!(
            silo_proto::error::detect_code(&err),
            Some(ApiError::KeySizeTooLarge)
        );
    }

    #[tokio::test]
    async fn reports_flow_to_catalog_and_tasks_execute() {
        let (_dir, service, catalog) = service_with_one_shard();
        catalog.tasks.lock().unwrap().push(ShardTask {
            task_type: ShardTaskType::SyncRouteVersion,
            disk_id: DiskId(10),
            suid: suid(1),
            route_version: RouteVersion(7),
            old_route_version: RouteVersion(1),
        });

        service.shard_reports().await.unwrap();

        let reports = catalog.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0][0].suid, suid(1));
        drop(reports);

        let shard = service.get_shard(DiskId(10), suid(1)).unwrap();
        assert_eq!(shard.route_version(), RouteVersion(7));
    }

    #[tokio::test]
    async fn stale_sync_route_version_task_is_refused() {
        let (_dir, service, _) = service_with_one_shard();
        let err = service
            .execute_shard_task(&ShardTask {
                task_type: ShardTaskType::SyncRouteVersion,
                disk_id: DiskId(10),
                suid: suid(1),
                route_version: RouteVersion(1),
                old_route_version: RouteVersion(0),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("route version not match"));
    }

    #[tokio::test]
    async fn clear_shard_task_checks_route_version() {
        let (_dir, service, _) = service_with_one_shard();
        let err = service
            .execute_shard_task(&ShardTask {
                task_type: ShardTaskType::ClearShard,
                disk_id: DiskId(10),
                suid: suid(1),
                route_version: RouteVersion(9),
                old_route_version: RouteVersion(1),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("route version not match"));

        service
            .execute_shard_task(&ShardTask {
                task_type: ShardTaskType::ClearShard,
                disk_id: DiskId(10),
                suid: suid(1),
                route_version: RouteVersion(1),
                old_route_version: RouteVersion(1),
            })
            .await
            .unwrap();
        assert!(service.get_shard(DiskId(10), suid(1)).is_err());
    }

    #[tokio::test]
    async fn list_shards_filters_and_bounds() {
        let (_dir, service, _) = service_with_one_shard();
        let disk = service.get_disk(DiskId(10)).unwrap();
        disk.add_shard(
            suid(2),
            RouteVersion(1),
            Range::new_hash(0, 10),
            vec![silo_proto::catalog::ShardUnit {
                suid: suid(2),
                disk_id: DiskId(10),
                ..Default::default()
            }],
        )
        .unwrap();

        let all = service
            .list_shards(&ListShardArgs {
                disk_id: DiskId(10),
                shard_id: ShardId(0),
                count: 10,
            })
            .unwrap();
        assert_eq!(all.len(), 2);

        let filtered = service
            .list_shards(&ListShardArgs {
                disk_id: DiskId(10),
                shard_id: ShardId(2),
                count: 10,
            })
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].shard_id, ShardId(2));
    }
}
