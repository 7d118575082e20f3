//! Dispatcher failure-handling and pagination tests against a scripted
//! in-memory shard-node client.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use silo_access::{AccessConfig, CatalogClient, Handler, ServiceDirectory, ShardController, ShardnodeClient};
use silo_proto::blob::{Blob, CodeMode, Item, Location};
use silo_proto::catalog::{
    CatalogChangeItem, CatalogChanges, Range, RouteUpdateType, ShardInfo, ShardUnit,
};
use silo_proto::ids::{ClusterId, DiskId, RouteVersion, ShardId, SpaceId, Suid};
use silo_proto::rpc::{
    AccessCreateBlobArgs, AccessGetBlobArgs, AccessListBlobArgs, AllocSliceArgs, AllocSliceRet,
    CreateBlobArgs, DeleteBlobArgs, DeleteItemArgs, GetBlobArgs, GetItemArgs, GetShardArgs,
    GetShardMode, InsertItemArgs, ListBlobArgs, ListBlobRet, ListItemArgs, ListItemRet,
    SealBlobArgs, ShardStats, UpdateItemArgs,
};
use silo_proto::sharding::ListBlobEncodeMarker;
use silo_proto::ApiError;

#[derive(Clone, Copy, PartialEq)]
enum Failure {
    NotLeader,
    DiskBroken,
    ConnRefused,
    RouteNeedUpdate,
}

#[derive(Default)]
struct MockShardnode {
    /// shard id -> blob name -> blob
    storage: Mutex<HashMap<u32, BTreeMap<Vec<u8>, Blob>>>,
    /// scripted failure per disk, applied to data operations
    failures: Mutex<HashMap<u32, Failure>>,
    /// leader per shard as reported by stats; `None` means in election
    leaders: Mutex<HashMap<u32, Option<u32>>>,
    ops_per_disk: Mutex<HashMap<u32, u32>>,
    stats_active: AtomicI32,
    stats_max_active: AtomicI32,
    stats_calls: AtomicU32,
}

impl MockShardnode {
    fn check_disk(&self, disk_id: DiskId) -> anyhow::Result<()> {
        *self
            .ops_per_disk
            .lock()
            .unwrap()
            .entry(disk_id.0)
            .or_insert(0) += 1;
        match self.failures.lock().unwrap().get(&disk_id.0) {
            Some(Failure::NotLeader) => Err(anyhow::Error::new(ApiError::ShardNodeNotLeader)),
            Some(Failure::DiskBroken) => Err(anyhow::Error::new(ApiError::DiskBroken)),
            Some(Failure::ConnRefused) => Err(anyhow::Error::new(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            ))
            .context("dial tcp: connect: connection refused")),
            Some(Failure::RouteNeedUpdate) => {
                Err(anyhow::Error::new(ApiError::ShardRouteVersionNeedUpdate))
            }
            None => Ok(()),
        }
    }

    fn put_blob(&self, shard_id: u32, name: &[u8], size: u64) {
        let blob = Blob {
            name: name.to_vec(),
            location: Location {
                size,
                ..Default::default()
            },
            sealed: false,
        };
        self.storage
            .lock()
            .unwrap()
            .entry(shard_id)
            .or_default()
            .insert(name.to_vec(), blob);
    }

    fn ops_on(&self, disk: u32) -> u32 {
        self.ops_per_disk.lock().unwrap().get(&disk).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ShardnodeClient for MockShardnode {
    async fn create_blob(&self, _host: &str, args: CreateBlobArgs) -> anyhow::Result<Blob> {
        self.check_disk(args.header.disk_id)?;
        let blob = Blob {
            name: args.name.clone(),
            location: Location {
                code_mode: args.code_mode,
                size: args.size,
                slice_size: args.slice_size,
                ..Default::default()
            },
            sealed: false,
        };
        let mut storage = self.storage.lock().unwrap();
        let shard = storage
            .entry(args.header.suid.shard_id().0)
            .or_default();
        Ok(shard.entry(args.name).or_insert(blob).clone())
    }

    async fn get_blob(&self, _host: &str, args: GetBlobArgs) -> anyhow::Result<Blob> {
        self.check_disk(args.header.disk_id)?;
        self.storage
            .lock()
            .unwrap()
            .get(&args.header.suid.shard_id().0)
            .and_then(|shard| shard.get(&args.name).cloned())
            .ok_or_else(|| anyhow::Error::new(ApiError::BlobNotFound))
    }

    async fn seal_blob(&self, _host: &str, args: SealBlobArgs) -> anyhow::Result<()> {
        self.check_disk(args.header.disk_id)?;
        let mut storage = self.storage.lock().unwrap();
        let blob = storage
            .get_mut(&args.header.suid.shard_id().0)
            .and_then(|shard| shard.get_mut(&args.name))
            .ok_or_else(|| anyhow::Error::new(ApiError::BlobNotFound))?;
        blob.sealed = true;
        blob.location.size = args.size;
        blob.location.slices = args.slices;
        Ok(())
    }

    async fn find_and_delete_blob(
        &self,
        _host: &str,
        args: DeleteBlobArgs,
    ) -> anyhow::Result<Blob> {
        self.check_disk(args.header.disk_id)?;
        self.storage
            .lock()
            .unwrap()
            .get_mut(&args.header.suid.shard_id().0)
            .and_then(|shard| shard.remove(&args.name))
            .ok_or_else(|| anyhow::Error::new(ApiError::BlobNotFound))
    }

    async fn alloc_slice(&self, _host: &str, args: AllocSliceArgs) -> anyhow::Result<AllocSliceRet> {
        self.check_disk(args.header.disk_id)?;
        Ok(AllocSliceRet::default())
    }

    async fn list_blob(&self, _host: &str, args: ListBlobArgs) -> anyhow::Result<ListBlobRet> {
        self.check_disk(args.header.disk_id)?;
        let storage = self.storage.lock().unwrap();
        let Some(shard) = storage.get(&args.header.suid.shard_id().0) else {
            return Ok(ListBlobRet::default());
        };
        let start = if args.marker.is_empty() {
            args.prefix.clone()
        } else {
            args.marker.clone()
        };
        let mut matching = shard
            .range(start..)
            .filter(|(name, _)| name.starts_with(&args.prefix))
            .map(|(_, blob)| blob.clone());

        let mut ret = ListBlobRet::default();
        for blob in matching.by_ref().take(args.count as usize) {
            ret.blobs.push(blob);
        }
        if let Some(next) = matching.next() {
            ret.next_marker = next.name;
        }
        Ok(ret)
    }

    async fn insert_item(&self, _host: &str, args: InsertItemArgs) -> anyhow::Result<()> {
        self.check_disk(args.header.disk_id)
    }

    async fn update_item(&self, _host: &str, args: UpdateItemArgs) -> anyhow::Result<()> {
        self.check_disk(args.header.disk_id)
    }

    async fn delete_item(&self, _host: &str, args: DeleteItemArgs) -> anyhow::Result<()> {
        self.check_disk(args.header.disk_id)
    }

    async fn get_item(&self, _host: &str, args: GetItemArgs) -> anyhow::Result<Item> {
        self.check_disk(args.header.disk_id)?;
        Ok(Item {
            id: args.id,
            fields: Vec::new(),
        })
    }

    async fn list_item(&self, _host: &str, args: ListItemArgs) -> anyhow::Result<ListItemRet> {
        self.check_disk(args.header.disk_id)?;
        Ok(ListItemRet::default())
    }

    async fn get_shard_stats(&self, _host: &str, args: GetShardArgs) -> anyhow::Result<ShardStats> {
        let active = self.stats_active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats_max_active.fetch_max(active, Ordering::SeqCst);
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        // Hold the slot briefly so overlapping recoveries are observable.
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.stats_active.fetch_sub(1, Ordering::SeqCst);

        let leader = self
            .leaders
            .lock()
            .unwrap()
            .get(&args.suid.shard_id().0)
            .copied()
            .flatten();
        Ok(ShardStats {
            suid: args.suid,
            applied_index: 1,
            leader_disk_id: DiskId(leader.unwrap_or(0)),
            range: Range::new_hash(0, u64::MAX),
            route_version: RouteVersion(1),
        })
    }
}

struct StaticCatalog {
    shards: Mutex<Vec<ShardInfo>>,
    calls: AtomicU32,
}

#[async_trait]
impl CatalogClient for StaticCatalog {
    async fn get_catalog_changes(&self, from: RouteVersion) -> anyhow::Result<CatalogChanges> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let shards = self.shards.lock().unwrap();
        let items = shards
            .iter()
            .filter(|s| s.route_version > from)
            .map(|shard| CatalogChangeItem {
                route_version: shard.route_version,
                update_type: RouteUpdateType::AddShard,
                shard: shard.clone(),
            })
            .collect();
        Ok(CatalogChanges {
            route_version: shards.iter().map(|s| s.route_version).max().unwrap_or_default(),
            items,
        })
    }
}

struct HostPerDisk;

impl ServiceDirectory for HostPerDisk {
    fn shardnode_host(&self, disk_id: DiskId) -> anyhow::Result<String> {
        Ok(format!("node-{disk_id}"))
    }
}

fn shard_info(id: u32, min: u64, max: u64, leader: u32, disks: [u32; 3]) -> ShardInfo {
    let units = disks
        .iter()
        .enumerate()
        .map(|(i, disk)| ShardUnit {
            suid: Suid::new(ShardId(id), i as u8, 1),
            disk_id: DiskId(*disk),
            route_version: RouteVersion(1),
            ..Default::default()
        })
        .collect();
    ShardInfo {
        shard_id: ShardId(id),
        range: Range::new_hash(min, max),
        route_version: RouteVersion(1),
        leader_disk_id: DiskId(leader),
        units,
    }
}

struct Env {
    handler: Arc<Handler>,
    node: Arc<MockShardnode>,
    catalog: Arc<StaticCatalog>,
}

async fn env_with_shards(shards: Vec<ShardInfo>) -> Env {
    let node = Arc::new(MockShardnode::default());
    let catalog = Arc::new(StaticCatalog {
        shards: Mutex::new(shards),
        calls: AtomicU32::new(0),
    });
    let cfg = AccessConfig {
        shardnode_retry_times: 3,
        shardnode_retry_interval_ms: 5,
        ..Default::default()
    };
    let handler = Arc::new(Handler::new(cfg, Arc::clone(&node) as Arc<dyn ShardnodeClient>));
    let controller = Arc::new(ShardController::new(
        ClusterId(1),
        SpaceId(1),
        Arc::clone(&catalog) as Arc<dyn CatalogClient>,
        Arc::new(HostPerDisk),
        Duration::from_secs(60),
    ));
    controller.update_route().await.unwrap();
    handler.add_cluster(controller);
    Env {
        handler,
        node,
        catalog,
    }
}

#[tokio::test]
async fn create_blob_recovers_from_stale_leader() {
    let env = env_with_shards(vec![shard_info(1, 0, u64::MAX, 10, [10, 11, 12])]).await;
    // Disk 10 lost leadership to disk 11 but the route cache still points
    // at it.
    env.node.failures.lock().unwrap().insert(10, Failure::NotLeader);
    env.node.leaders.lock().unwrap().insert(1, Some(11));

    let location = env
        .handler
        .create_blob(AccessCreateBlobArgs {
            cluster_id: ClusterId(1),
            blob_name: b"report.bin".to_vec(),
            size: 1024,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(location.size, 1024);

    // One refused write on the stale leader, then the repaired one.
    assert_eq!(env.node.ops_on(10), 1);
    assert_eq!(env.node.ops_on(11), 1);
    assert!(env
        .node
        .storage
        .lock()
        .unwrap()
        .get(&1)
        .unwrap()
        .contains_key(b"report.bin".as_slice()));
}

#[tokio::test]
async fn get_blob_survives_broken_follower() {
    let env = env_with_shards(vec![shard_info(1, 0, u64::MAX, 10, [10, 11, 12])]).await;
    env.node.put_blob(1, b"photo", 77);
    env.node.leaders.lock().unwrap().insert(1, Some(10));
    env.node.failures.lock().unwrap().insert(11, Failure::DiskBroken);

    // Run several reads: whenever disk 11 is selected it fails, gets
    // punished, and the retry lands on a healthy replica.
    for _ in 0..8 {
        let location = env
            .handler
            .get_blob(&AccessGetBlobArgs {
                cluster_id: ClusterId(1),
                blob_name: b"photo".to_vec(),
                mode: GetShardMode::Random,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(location.size, 77);
    }
    // Once punished, the broken disk stops being selected, so it saw at
    // most one data operation.
    assert!(env.node.ops_on(11) <= 1);
}

#[tokio::test]
async fn route_staleness_triggers_route_refresh() {
    let env = env_with_shards(vec![shard_info(1, 0, u64::MAX, 10, [10, 11, 12])]).await;
    env.node.put_blob(1, b"blob", 1);
    env.node.leaders.lock().unwrap().insert(1, Some(10));
    env.node
        .failures
        .lock()
        .unwrap()
        .insert(10, Failure::RouteNeedUpdate);
    env.catalog.shards.lock().unwrap()[0].route_version = RouteVersion(2);
    let calls_before = env.catalog.calls.load(Ordering::SeqCst);

    // Every stale-route rejection pulls fresh catalog changes; the error
    // keeps its wire code for the caller.
    let err = env
        .handler
        .get_blob(&AccessGetBlobArgs {
            cluster_id: ClusterId(1),
            blob_name: b"blob".to_vec(),
            mode: GetShardMode::Leader,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(
        silo_proto::error::detect_code(&err),
        Some(ApiError::ShardRouteVersionNeedUpdate)
    );
    assert!(env.catalog.calls.load(Ordering::SeqCst) > calls_before);

    // With the node healthy again the refreshed view serves the read.
    env.node.failures.lock().unwrap().clear();
    let location = env
        .handler
        .get_blob(&AccessGetBlobArgs {
            cluster_id: ClusterId(1),
            blob_name: b"blob".to_vec(),
            mode: GetShardMode::Leader,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(location.size, 1);
}

#[tokio::test]
async fn cross_shard_list_resumes_from_marker() {
    let mid = 1u64 << 63;
    let env = env_with_shards(vec![
        shard_info(1, 0, mid, 10, [10, 11, 12]),
        shard_info(2, mid, u64::MAX, 20, [20, 21, 22]),
    ])
    .await;
    for i in 1..=7u8 {
        env.node.put_blob(1, format!("p/{:02}", i).as_bytes(), i as u64);
        env.node.put_blob(2, format!("p/{:02}", i).as_bytes(), i as u64);
    }

    let first = env
        .handler
        .list_blob(&AccessListBlobArgs {
            cluster_id: ClusterId(1),
            shard_id: ShardId(0),
            prefix: b"p/".to_vec(),
            count: 10,
            mode: GetShardMode::Random,
            ..Default::default()
        })
        .await
        .unwrap();
    // Seven from the first shard, three from the second.
    assert_eq!(first.blobs.len(), 10);
    assert!(!first.next_marker.is_empty());

    let marker = ListBlobEncodeMarker::decode(&first.next_marker).unwrap();
    assert_eq!(marker.range, Range::new_hash(mid, u64::MAX));
    assert_eq!(marker.marker, b"p/04".to_vec());

    let second = env
        .handler
        .list_blob(&AccessListBlobArgs {
            cluster_id: ClusterId(1),
            shard_id: ShardId(0),
            prefix: b"p/".to_vec(),
            marker: first.next_marker.clone(),
            count: 10,
            mode: GetShardMode::Random,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(second.blobs.len(), 4);
    // Exact exhaustion ends with an empty marker.
    assert!(second.next_marker.is_empty());
}

#[tokio::test]
async fn list_exact_count_at_shard_boundary_resumes_cleanly() {
    let mid = 1u64 << 63;
    let env = env_with_shards(vec![
        shard_info(1, 0, mid, 10, [10, 11, 12]),
        shard_info(2, mid, u64::MAX, 20, [20, 21, 22]),
    ])
    .await;
    for i in 1..=3u8 {
        env.node.put_blob(1, format!("p/{:02}", i).as_bytes(), i as u64);
        env.node.put_blob(2, format!("q/{:02}", i).as_bytes(), i as u64);
    }

    // Count lands exactly on the first shard's end.
    let first = env
        .handler
        .list_blob(&AccessListBlobArgs {
            cluster_id: ClusterId(1),
            shard_id: ShardId(0),
            count: 3,
            mode: GetShardMode::Random,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(first.blobs.len(), 3);
    let marker = ListBlobEncodeMarker::decode(&first.next_marker).unwrap();
    assert_eq!(marker.range, Range::new_hash(mid, u64::MAX));
    assert!(marker.marker.is_empty());

    let second = env
        .handler
        .list_blob(&AccessListBlobArgs {
            cluster_id: ClusterId(1),
            shard_id: ShardId(0),
            marker: first.next_marker.clone(),
            count: 10,
            mode: GetShardMode::Random,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(second.blobs.len(), 3);
    assert!(second.next_marker.is_empty());
}

#[tokio::test]
async fn connection_refused_recovery_runs_once() {
    let env = env_with_shards(vec![shard_info(1, 0, u64::MAX, 10, [10, 11, 12])]).await;
    env.node.put_blob(1, b"blob", 9);
    env.node.failures.lock().unwrap().insert(10, Failure::ConnRefused);
    // The shard is in election for the whole first wave.
    env.node.leaders.lock().unwrap().insert(1, None);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let handler = Arc::clone(&env.handler);
        handles.push(tokio::spawn(async move {
            handler
                .get_blob(&AccessGetBlobArgs {
                    cluster_id: ClusterId(1),
                    blob_name: b"blob".to_vec(),
                    mode: GetShardMode::Leader,
                    ..Default::default()
                })
                .await
        }));
    }
    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(
            silo_proto::error::detect_code(&err),
            Some(ApiError::ConnectionRefused)
        );
    }
    // Leader-wait polls never overlapped: one recovery at a time.
    assert_eq!(env.node.stats_max_active.load(Ordering::SeqCst), 1);

    // Once the election settles, the next request finds the new leader.
    env.node.leaders.lock().unwrap().insert(1, Some(11));
    let location = env
        .handler
        .get_blob(&AccessGetBlobArgs {
            cluster_id: ClusterId(1),
            blob_name: b"blob".to_vec(),
            mode: GetShardMode::Leader,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(location.size, 9);
}

#[tokio::test]
async fn fix_create_blob_args_boundaries() {
    let env = env_with_shards(vec![shard_info(1, 0, u64::MAX, 10, [10, 11, 12])]).await;
    env.node.leaders.lock().unwrap().insert(1, Some(10));
    env.handler.set_max_blob_size(1 << 20);

    // Oversize is rejected outright.
    let err = env
        .handler
        .create_blob(AccessCreateBlobArgs {
            cluster_id: ClusterId(1),
            blob_name: b"huge".to_vec(),
            size: u64::MAX,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(
        silo_proto::error::detect_code(&err),
        Some(ApiError::AccessExceedSize)
    );

    // Invalid code mode is rejected.
    let err = env
        .handler
        .create_blob(AccessCreateBlobArgs {
            cluster_id: ClusterId(1),
            blob_name: b"bad-mode".to_vec(),
            size: 10,
            code_mode: CodeMode(200),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(
        silo_proto::error::detect_code(&err),
        Some(ApiError::IllegalArguments)
    );

    // Zero slice size and cluster are filled in; zero code mode selected
    // from the size table.
    let location = env
        .handler
        .create_blob(AccessCreateBlobArgs {
            cluster_id: ClusterId(0),
            blob_name: b"filled".to_vec(),
            size: 100,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(location.slice_size, 1 << 20);
    assert!(location.code_mode.is_valid());
}

#[tokio::test]
async fn item_ops_forward_to_owner_shard() {
    let env = env_with_shards(vec![shard_info(1, 0, u64::MAX, 10, [10, 11, 12])]).await;
    env.node.leaders.lock().unwrap().insert(1, Some(10));

    env.handler
        .insert_item(
            ClusterId(1),
            &[],
            Item {
                id: b"item-1".to_vec(),
                fields: Vec::new(),
            },
        )
        .await
        .unwrap();
    let item = env
        .handler
        .get_item(ClusterId(1), &[], b"item-1", GetShardMode::Leader)
        .await
        .unwrap();
    assert_eq!(item.id, b"item-1");
    // Mutations went to the leader disk.
    assert!(env.node.ops_on(10) >= 2);
}
