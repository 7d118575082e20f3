//! Cached per-cluster route view.
//!
//! The controller holds shards keyed by range boundary, built from the
//! catalog's route items. Replica selection honours punished disks and an
//! exclusion argument; stale views are repaired by `update_route` and by
//! folding shard-node stats back in.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

use silo_proto::catalog::{Range, RouteUpdateType, ShardInfo};
use silo_proto::ids::{ClusterId, DiskId, RouteVersion, ShardId, SpaceId, Suid};
use silo_proto::rpc::{GetShardMode, ShardStats};
use silo_proto::sharding::hash_shard_keys;
use silo_proto::ApiError;

use crate::client::CatalogClient;

/// Resolves disks to shard-node hosts.
pub trait ServiceDirectory: Send + Sync {
    fn shardnode_host(&self, disk_id: DiskId) -> anyhow::Result<String>;
}

/// Disks marked unavailable for a cool-down window after failures.
pub struct DiskPunisher {
    cool_down: Duration,
    punished: Mutex<HashMap<u32, Instant>>,
}

impl DiskPunisher {
    pub fn new(cool_down: Duration) -> Self {
        Self {
            cool_down,
            punished: Mutex::new(HashMap::new()),
        }
    }

    pub fn punish(&self, disk_id: DiskId, reason: &str) {
        tracing::warn!(disk_id = %disk_id, reason, "punishing shardnode disk");
        self.punished
            .lock()
            .expect("punisher lock poisoned")
            .insert(disk_id.0, Instant::now() + self.cool_down);
    }

    pub fn is_punished(&self, disk_id: DiskId) -> bool {
        let mut punished = self.punished.lock().expect("punisher lock poisoned");
        match punished.get(&disk_id.0) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                punished.remove(&disk_id.0);
                false
            }
            None => false,
        }
    }
}

/// The member a request resolved to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShardMember {
    pub suid: Suid,
    pub disk_id: DiskId,
    pub route_version: RouteVersion,
}

/// One cached shard.
#[derive(Clone, Debug)]
pub struct CachedShard {
    info: ShardInfo,
}

impl CachedShard {
    pub fn range(&self) -> &Range {
        &self.info.range
    }

    pub fn shard_id(&self) -> ShardId {
        self.info.shard_id
    }

    pub fn leader_disk_id(&self) -> DiskId {
        self.info.leader_disk_id
    }

    /// Select a replica. `Leader` requires the current leader; `Random`
    /// and `Nearest` pick any unit that is neither punished by status or
    /// cool-down nor the excluded disk.
    pub fn get_member(
        &self,
        punisher: &DiskPunisher,
        mode: GetShardMode,
        exclude_disk_id: DiskId,
    ) -> anyhow::Result<ShardMember> {
        match mode {
            GetShardMode::Leader => {
                let leader = self.info.leader_disk_id;
                anyhow::ensure!(leader.is_valid(), ApiError::ShardNoLeader);
                anyhow::ensure!(leader != exclude_disk_id, ApiError::ShardNoLeader);
                let unit = self
                    .info
                    .units
                    .iter()
                    .find(|u| u.disk_id == leader)
                    .ok_or(ApiError::ShardNoLeader)?;
                Ok(ShardMember {
                    suid: unit.suid,
                    disk_id: unit.disk_id,
                    route_version: self.info.route_version,
                })
            }
            GetShardMode::Random | GetShardMode::Nearest => {
                let candidates: Vec<&silo_proto::catalog::ShardUnit> = self
                    .info
                    .units
                    .iter()
                    .filter(|u| !u.learner)
                    .filter(|u| !u.status.is_punished())
                    .filter(|u| u.disk_id != exclude_disk_id)
                    .filter(|u| !punisher.is_punished(u.disk_id))
                    .collect();
                let unit = candidates
                    .choose(&mut rand::thread_rng())
                    .ok_or_else(|| anyhow::anyhow!("no selectable unit in shard {}", self.info.shard_id))?;
                Ok(ShardMember {
                    suid: unit.suid,
                    disk_id: unit.disk_id,
                    route_version: self.info.route_version,
                })
            }
        }
    }
}

/// Per-cluster shard route cache.
pub struct ShardController {
    cluster_id: ClusterId,
    space_id: SpaceId,
    catalog: Arc<dyn CatalogClient>,
    directory: Arc<dyn ServiceDirectory>,
    punisher: DiskPunisher,
    /// Shards ordered by range lower boundary.
    by_range: StdRwLock<BTreeMap<u64, Arc<CachedShard>>>,
    by_id: StdRwLock<HashMap<u32, Arc<CachedShard>>>,
    route_version: AtomicU64,
    update_lock: tokio::sync::Mutex<()>,
}

impl ShardController {
    pub fn new(
        cluster_id: ClusterId,
        space_id: SpaceId,
        catalog: Arc<dyn CatalogClient>,
        directory: Arc<dyn ServiceDirectory>,
        punish_cool_down: Duration,
    ) -> Self {
        Self {
            cluster_id,
            space_id,
            catalog,
            directory,
            punisher: DiskPunisher::new(punish_cool_down),
            by_range: StdRwLock::new(BTreeMap::new()),
            by_id: StdRwLock::new(HashMap::new()),
            route_version: AtomicU64::new(0),
            update_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn cluster_id(&self) -> ClusterId {
        self.cluster_id
    }

    pub fn space_id(&self) -> SpaceId {
        self.space_id
    }

    pub fn punisher(&self) -> &DiskPunisher {
        &self.punisher
    }

    pub fn directory(&self) -> &Arc<dyn ServiceDirectory> {
        &self.directory
    }

    pub fn route_version(&self) -> RouteVersion {
        RouteVersion(self.route_version.load(Ordering::SeqCst))
    }

    /// Pull route items past the cached version and fold them in.
    pub async fn update_route(&self) -> anyhow::Result<()> {
        let _guard = self.update_lock.lock().await;
        let from = self.route_version();
        let changes = self.catalog.get_catalog_changes(from).await?;
        {
            let mut by_range = self.by_range.write().expect("route cache lock poisoned");
            let mut by_id = self.by_id.write().expect("route cache lock poisoned");
            for item in changes.items {
                match item.update_type {
                    RouteUpdateType::AddShard
                    | RouteUpdateType::UpdateShard
                    | RouteUpdateType::ShardSplit => {
                        let shard = Arc::new(CachedShard { info: item.shard });
                        if let Some(old) = by_id.insert(shard.shard_id().0, Arc::clone(&shard)) {
                            by_range.remove(&old.range().min_boundary());
                        }
                        by_range.insert(shard.range().min_boundary(), shard);
                    }
                }
            }
        }
        self.route_version
            .fetch_max(changes.route_version.0, Ordering::SeqCst);
        tracing::debug!(
            cluster_id = %self.cluster_id,
            from = %from,
            to = %changes.route_version,
            "route view updated"
        );
        Ok(())
    }

    /// Fold fresh shard-node stats into the cached shard (leader repair).
    pub fn update_shard(&self, stats: &ShardStats) -> anyhow::Result<()> {
        let shard_id = stats.suid.shard_id();
        let by_id = self.by_id.read().expect("route cache lock poisoned");
        let cached = by_id
            .get(&shard_id.0)
            .ok_or(ApiError::ShardDoesNotExist)?;
        let mut info = cached.info.clone();
        info.leader_disk_id = stats.leader_disk_id;
        if stats.route_version > info.route_version {
            info.route_version = stats.route_version;
        }
        let updated = Arc::new(CachedShard { info });
        drop(by_id);

        let mut by_range = self.by_range.write().expect("route cache lock poisoned");
        let mut by_id = self.by_id.write().expect("route cache lock poisoned");
        by_range.insert(updated.range().min_boundary(), Arc::clone(&updated));
        by_id.insert(shard_id.0, updated);
        Ok(())
    }

    /// Shard owning the hashed shard keys.
    pub fn get_shard(&self, shard_keys: &[Vec<u8>]) -> anyhow::Result<Arc<CachedShard>> {
        let hash = hash_shard_keys(shard_keys);
        let by_range = self.by_range.read().expect("route cache lock poisoned");
        let shard = by_range
            .range(..=hash)
            .next_back()
            .map(|(_, shard)| Arc::clone(shard))
            .filter(|shard| shard.range().contains(hash))
            .ok_or(ApiError::ShardDoesNotExist)?;
        Ok(shard)
    }

    pub fn get_shard_by_id(&self, shard_id: ShardId) -> anyhow::Result<Arc<CachedShard>> {
        self.by_id
            .read()
            .expect("route cache lock poisoned")
            .get(&shard_id.0)
            .cloned()
            .ok_or_else(|| anyhow::Error::new(ApiError::ShardDoesNotExist))
    }

    pub fn get_first_shard(&self) -> anyhow::Result<Arc<CachedShard>> {
        self.by_range
            .read()
            .expect("route cache lock poisoned")
            .values()
            .next()
            .cloned()
            .ok_or_else(|| anyhow::Error::new(ApiError::ShardDoesNotExist))
    }

    /// Shard covering `range`'s lower boundary, for marker resumption.
    pub fn get_shard_by_range(&self, range: &Range) -> anyhow::Result<Arc<CachedShard>> {
        let min = range.min_boundary();
        let by_range = self.by_range.read().expect("route cache lock poisoned");
        by_range
            .range(..=min)
            .next_back()
            .map(|(_, shard)| Arc::clone(shard))
            .ok_or_else(|| anyhow::Error::new(ApiError::ShardDoesNotExist))
    }

    /// The shard after `range` in traversal order; `None` past the end.
    pub fn get_next_shard(&self, range: &Range) -> anyhow::Result<Option<Arc<CachedShard>>> {
        let min = range.min_boundary();
        let by_range = self.by_range.read().expect("route cache lock poisoned");
        Ok(by_range
            .range(min + 1..)
            .next()
            .map(|(_, shard)| Arc::clone(shard)))
    }

    pub fn shard_count(&self) -> usize {
        self.by_range.read().expect("route cache lock poisoned").len()
    }
}
