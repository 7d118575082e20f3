//! Per-disk shard collection: lookup by shard-unit id with lifecycle
//! gating, plus shard creation, replacement and deletion.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};

use silo_proto::catalog::{Range, ShardUnit};
use silo_proto::codec;
use silo_proto::ids::{ClusterId, DiskId, RouteVersion, Suid};
use silo_proto::rpc::ShardUpdateType;
use silo_proto::ApiError;
use silo_raft::{LocalGroup, Member, MemberChange, MemberChangeType, ReplicationGroup};

use crate::kv::{KvStore, INFO_CF};
use crate::shard::{
    ApplyResult, Shard, ShardHandler, ShardInfoRecord, ShardMemberCtx, ShardStopWriting,
    SHARD_INFO_RECORD_VERSION,
};

/// Builds the replication group for a freshly materialized shard. The
/// consensus layer is external; tests and single-replica deployments use
/// the loopback group.
pub type GroupBuilder =
    Box<dyn Fn(Arc<Shard>) -> Arc<dyn ReplicationGroup<Output = ApplyResult>> + Send + Sync>;

pub struct ShardStore {
    disk_id: DiskId,
    cluster_id: ClusterId,
    kv: Arc<dyn KvStore>,
    shards: StdRwLock<HashMap<Suid, ShardHandler>>,
    group_builder: GroupBuilder,
}

impl ShardStore {
    pub fn new(
        disk_id: DiskId,
        cluster_id: ClusterId,
        kv: Arc<dyn KvStore>,
        group_builder: GroupBuilder,
    ) -> Self {
        Self {
            disk_id,
            cluster_id,
            kv,
            shards: StdRwLock::new(HashMap::new()),
            group_builder,
        }
    }

    /// A store whose shards replicate through loopback groups.
    pub fn with_local_groups(
        disk_id: DiskId,
        cluster_id: ClusterId,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        let node_id = disk_id.0 as u64;
        Self::new(
            disk_id,
            cluster_id,
            kv,
            Box::new(move |shard| {
                let applied = shard.applied_index();
                let group = LocalGroup::new(shard, node_id);
                group.set_next_index(applied + 1);
                Arc::new(group) as Arc<dyn ReplicationGroup<Output = ApplyResult>>
            }),
        )
    }

    pub fn disk_id(&self) -> DiskId {
        self.disk_id
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().expect("shard map lock poisoned").len()
    }

    pub fn disk_space(&self) -> u64 {
        self.kv.disk_space()
    }

    /// Rebuild every shard from its persisted info record.
    pub fn load(&self) -> anyhow::Result<()> {
        let records = self.kv.scan(INFO_CF, b"s", b"t", usize::MAX)?;
        for (_, value) in records {
            let record: ShardInfoRecord = codec::decode_record(SHARD_INFO_RECORD_VERSION, &value)?;
            let shard = Arc::new(Shard::from_record(
                self.disk_id,
                self.cluster_id,
                Arc::clone(&self.kv),
                record,
            ));
            self.insert_handler(shard)?;
        }
        Ok(())
    }

    fn insert_handler(&self, shard: Arc<Shard>) -> anyhow::Result<ShardHandler> {
        let group = (self.group_builder)(Arc::clone(&shard));
        let handler = ShardHandler { shard, group };
        self.shards
            .write()
            .expect("shard map lock poisoned")
            .insert(handler.suid(), handler.clone());
        Ok(handler)
    }

    /// Materialize a shard on this disk. Adding an already-present suid is
    /// a no-op.
    pub fn add_shard(
        &self,
        suid: Suid,
        route_version: RouteVersion,
        range: Range,
        units: Vec<ShardUnit>,
    ) -> anyhow::Result<()> {
        if self
            .shards
            .read()
            .expect("shard map lock poisoned")
            .contains_key(&suid)
        {
            return Ok(());
        }
        let shard = Arc::new(Shard::new(
            suid,
            self.disk_id,
            self.cluster_id,
            Arc::clone(&self.kv),
            range,
            units,
            route_version,
        ));
        shard.save_shard_info(false)?;
        self.insert_handler(shard)?;
        tracing::info!(suid = %suid, disk_id = %self.disk_id, "shard added");
        Ok(())
    }

    /// Apply a unit replacement through the shard's replication group.
    pub async fn update_shard(
        &self,
        suid: Suid,
        update_type: ShardUpdateType,
        unit: ShardUnit,
    ) -> anyhow::Result<()> {
        let handler = self.get_shard(suid)?;
        let change = match update_type {
            ShardUpdateType::AddMember => MemberChange {
                change_type: MemberChangeType::AddMember,
                member: Member {
                    node_id: unit.disk_id.0 as u64,
                    learner: unit.learner,
                    context: serde_json::to_vec(&ShardMemberCtx { suid: unit.suid })?,
                },
            },
            ShardUpdateType::UpdateMember => MemberChange {
                change_type: MemberChangeType::AddMember,
                member: Member {
                    node_id: unit.disk_id.0 as u64,
                    learner: unit.learner,
                    context: Vec::new(),
                },
            },
            ShardUpdateType::RemoveMember => MemberChange {
                change_type: MemberChangeType::RemoveMember,
                member: Member {
                    node_id: unit.disk_id.0 as u64,
                    ..Default::default()
                },
            },
        };
        handler.group.member_change(change).await?;

        if handler
            .shard
            .raft_removed
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            // The replicated change removed this replica.
            handler.group.remove().await?;
        }
        Ok(())
    }

    /// Tear a shard down. Refused when the task's route version does not
    /// match the shard's; deleting an absent shard succeeds.
    pub async fn delete_shard(&self, suid: Suid, route_version: RouteVersion) -> anyhow::Result<()> {
        let handler = {
            let shards = self.shards.read().expect("shard map lock poisoned");
            match shards.get(&suid) {
                Some(handler) => handler.clone(),
                None => return Ok(()),
            }
        };

        let current = handler.shard.route_version();
        anyhow::ensure!(
            current == route_version,
            "route version not match, current: {current}, task: {route_version}"
        );

        handler.shard.state.stop_writing().await;
        handler.group.remove().await?;
        handler.shard.store.delete_range(
            crate::kv::DATA_CF,
            &handler.shard.keys.data_prefix(),
            &handler.shard.keys.data_max_prefix(),
        )?;
        handler.shard.delete_shard_info()?;
        self.shards
            .write()
            .expect("shard map lock poisoned")
            .remove(&suid);
        tracing::info!(suid = %suid, disk_id = %self.disk_id, "shard deleted");
        Ok(())
    }

    pub fn get_shard(&self, suid: Suid) -> anyhow::Result<ShardHandler> {
        let shards = self.shards.read().expect("shard map lock poisoned");
        let handler = shards.get(&suid).ok_or(ApiError::ShardDoesNotExist)?;
        anyhow::ensure!(!handler.shard.state.is_stopped(), ShardStopWriting);
        Ok(handler.clone())
    }

    /// Lookup that ignores the shard lifecycle, used by task execution.
    pub fn get_shard_no_rw_check(&self, suid: Suid) -> anyhow::Result<ShardHandler> {
        let shards = self.shards.read().expect("shard map lock poisoned");
        Ok(shards
            .get(&suid)
            .cloned()
            .ok_or(ApiError::ShardDoesNotExist)?)
    }

    /// Visit serving shards until `visit` returns `false`.
    pub fn range_shard(&self, mut visit: impl FnMut(&ShardHandler) -> bool) {
        let shards: Vec<ShardHandler> = {
            let map = self.shards.read().expect("shard map lock poisoned");
            map.values().cloned().collect()
        };
        for handler in shards {
            if handler.shard.state.is_stopped() {
                continue;
            }
            if !visit(&handler) {
                return;
            }
        }
    }

    /// Visit all shards regardless of lifecycle.
    pub fn range_shard_no_rw_check(&self, mut visit: impl FnMut(&ShardHandler) -> bool) {
        let shards: Vec<ShardHandler> = {
            let map = self.shards.read().expect("shard map lock poisoned");
            map.values().cloned().collect()
        };
        for handler in shards {
            if !visit(&handler) {
                return;
            }
        }
    }

    pub fn update_shard_route_version(
        &self,
        suid: Suid,
        route_version: RouteVersion,
    ) -> anyhow::Result<()> {
        let handler = self.get_shard_no_rw_check(suid)?;
        handler.shard.set_route_version(route_version);
        handler.shard.save_shard_info(false)
    }
}
