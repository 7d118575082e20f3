//! Replicated catalog operations.
//!
//! Each operation carries a stable opcode and a JSON payload. A batch
//! decodes in order; apply work is distributed so operations on the same
//! shard serialize while distinct shards apply in parallel. Decode errors
//! and unknown opcodes fail the whole batch.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use silo_proto::catalog::{
    RouteItem, RouteUpdateType, ShardInfo, ShardTask, ShardTaskType, ShardUnitStatus, Space,
};
use silo_proto::ids::{DiskId, ShardId, Suid, SuidPrefix};
use silo_proto::rpc::ShardReportArgs;

use crate::mgr::{CatalogMgr, UnitEpoch};
use crate::tables::ShardUnitRecord;

pub const OPER_TYPE_CREATE_SPACE: i32 = 1;
pub const OPER_TYPE_INIT_CREATE_SHARD: i32 = 2;
pub const OPER_TYPE_INCREASE_SHARD_UNITS_EPOCH: i32 = 3;
pub const OPER_TYPE_CREATE_SHARD: i32 = 4;
pub const OPER_TYPE_UPDATE_SHARD_UNIT: i32 = 5;
pub const OPER_TYPE_UPDATE_SHARD_UNIT_STATUS: i32 = 6;
pub const OPER_TYPE_SHARD_REPORT: i32 = 7;
pub const OPER_TYPE_ALLOC_SHARD_UNIT: i32 = 8;
pub const OPER_TYPE_ADMIN_UPDATE_SHARD: i32 = 9;
pub const OPER_TYPE_ADMIN_UPDATE_SHARD_UNIT: i32 = 10;

/// Epoch jump applied by `IncreaseShardUnitsEpoch` so epochs minted after
/// a catalog restart stay ahead of anything handed out before it.
pub const INCREASE_EPOCH_INTERVAL: u32 = 10;

/// Payload of `InitCreateShard` and `CreateShard`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateShardCtx {
    pub shard_id: ShardId,
    pub shard_info: ShardInfo,
}

/// Payload of `UpdateShardUnit`: replace the unit in `old_suid`'s slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateShardUnitArgs {
    pub new_disk_id: DiskId,
    pub new_suid: Suid,
    pub old_suid: Suid,
    pub new_is_learner: bool,
    pub old_is_learner: bool,
}

/// Payload of `AllocShardUnit`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocShardUnitArgs {
    pub suid_prefix: SuidPrefix,
}

/// Payload of `AdminUpdateShard`: operator override of shard-level fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminUpdateShardArgs {
    pub shard_id: ShardId,
    pub leader_disk_id: DiskId,
}

enum Decoded {
    CreateSpace(Space),
    InitCreateShard(CreateShardCtx),
    IncreaseShardUnitsEpoch(Vec<ShardUnitRecord>),
    CreateShard(CreateShardCtx),
    UpdateShardUnit(UpdateShardUnitArgs),
    UpdateShardUnitStatus(Vec<SuidPrefix>),
    ShardReport(ShardReportArgs),
    AllocShardUnit(AllocShardUnitArgs),
    AdminUpdateShard(AdminUpdateShardArgs),
    AdminUpdateShardUnit(ShardUnitRecord),
}

impl Decoded {
    fn parse(op_type: i32, data: &[u8]) -> anyhow::Result<Self> {
        let decoded = match op_type {
            OPER_TYPE_CREATE_SPACE => Self::CreateSpace(serde_json::from_slice(data)?),
            OPER_TYPE_INIT_CREATE_SHARD => Self::InitCreateShard(serde_json::from_slice(data)?),
            OPER_TYPE_INCREASE_SHARD_UNITS_EPOCH => {
                Self::IncreaseShardUnitsEpoch(serde_json::from_slice(data)?)
            }
            OPER_TYPE_CREATE_SHARD => Self::CreateShard(serde_json::from_slice(data)?),
            OPER_TYPE_UPDATE_SHARD_UNIT => Self::UpdateShardUnit(serde_json::from_slice(data)?),
            OPER_TYPE_UPDATE_SHARD_UNIT_STATUS => {
                Self::UpdateShardUnitStatus(serde_json::from_slice(data)?)
            }
            OPER_TYPE_SHARD_REPORT => Self::ShardReport(serde_json::from_slice(data)?),
            OPER_TYPE_ALLOC_SHARD_UNIT => Self::AllocShardUnit(serde_json::from_slice(data)?),
            OPER_TYPE_ADMIN_UPDATE_SHARD => Self::AdminUpdateShard(serde_json::from_slice(data)?),
            OPER_TYPE_ADMIN_UPDATE_SHARD_UNIT => {
                Self::AdminUpdateShardUnit(serde_json::from_slice(data)?)
            }
            other => anyhow::bail!("unknown catalog operation type {other}"),
        };
        Ok(decoded)
    }

    /// Distribution key: operations on the same shard must serialize.
    fn key(&self) -> usize {
        match self {
            Self::CreateSpace(space) => space.space_id.0 as usize,
            Self::InitCreateShard(ctx) | Self::CreateShard(ctx) => ctx.shard_id.0 as usize,
            Self::IncreaseShardUnitsEpoch(records) => records
                .first()
                .map(|r| r.suid_prefix.shard_id().0 as usize)
                .unwrap_or(0),
            Self::UpdateShardUnit(args) => args.old_suid.shard_id().0 as usize,
            Self::UpdateShardUnitStatus(prefixes) => prefixes
                .first()
                .map(|p| p.shard_id().0 as usize)
                .unwrap_or(0),
            // Reports fold into many shards; serialize them on one worker.
            Self::ShardReport(_) => 0,
            Self::AllocShardUnit(args) => args.suid_prefix.shard_id().0 as usize,
            Self::AdminUpdateShard(args) => args.shard_id.0 as usize,
            Self::AdminUpdateShardUnit(record) => record.suid_prefix.shard_id().0 as usize,
        }
    }
}

impl CatalogMgr {
    /// Apply one replicated batch. Returns the shard tasks produced per
    /// operation (empty for everything but `ShardReport`).
    pub async fn apply(
        self: &Arc<Self>,
        op_types: &[i32],
        datas: &[Vec<u8>],
    ) -> anyhow::Result<Vec<Vec<ShardTask>>> {
        anyhow::ensure!(
            op_types.len() == datas.len(),
            "op/data length mismatch: {} vs {}",
            op_types.len(),
            datas.len()
        );

        let mut decoded = Vec::with_capacity(op_types.len());
        for (op_type, data) in op_types.iter().zip(datas) {
            decoded.push(Decoded::parse(*op_type, data)?);
        }

        let results: Arc<Mutex<Vec<anyhow::Result<Vec<ShardTask>>>>> = Arc::new(Mutex::new(
            (0..decoded.len()).map(|_| Ok(Vec::new())).collect(),
        ));
        let mut dones = Vec::with_capacity(decoded.len());
        for (i, op) in decoded.into_iter().enumerate() {
            let key = op.key();
            let mgr = Arc::clone(self);
            let results = Arc::clone(&results);
            dones.push(self.apply_pool().run(key, move || {
                let result = mgr.apply_one(op);
                results.lock().expect("apply results lock poisoned")[i] = result;
            }));
        }
        for done in dones {
            let _ = done.await;
        }

        let mut out = Vec::with_capacity(op_types.len());
        let mut results = results.lock().expect("apply results lock poisoned");
        for slot in results.iter_mut() {
            out.push(std::mem::replace(slot, Ok(Vec::new()))?);
        }
        Ok(out)
    }

    fn apply_one(&self, op: Decoded) -> anyhow::Result<Vec<ShardTask>> {
        match op {
            Decoded::CreateSpace(space) => self.apply_create_space(space).map(|_| Vec::new()),
            Decoded::InitCreateShard(ctx) => self.apply_init_create_shard(ctx).map(|_| Vec::new()),
            Decoded::IncreaseShardUnitsEpoch(records) => self
                .apply_increase_shard_units_epoch(records)
                .map(|_| Vec::new()),
            Decoded::CreateShard(ctx) => self.apply_create_shard(ctx).map(|_| Vec::new()),
            Decoded::UpdateShardUnit(args) => {
                self.apply_update_shard_unit(args).map(|_| Vec::new())
            }
            Decoded::UpdateShardUnitStatus(prefixes) => self
                .apply_update_shard_unit_status(prefixes)
                .map(|_| Vec::new()),
            Decoded::ShardReport(args) => self.apply_shard_report(args),
            Decoded::AllocShardUnit(args) => {
                self.apply_alloc_shard_unit(args).map(|_| Vec::new())
            }
            Decoded::AdminUpdateShard(args) => {
                self.apply_admin_update_shard(args).map(|_| Vec::new())
            }
            Decoded::AdminUpdateShardUnit(record) => {
                self.apply_admin_update_shard_unit(record).map(|_| Vec::new())
            }
        }
    }

    fn apply_create_space(&self, space: Space) -> anyhow::Result<()> {
        if self.spaces().get_by_id(space.space_id).is_some() {
            // Replayed create.
            return Ok(());
        }
        if let Some(existing) = self.spaces().get_by_name(&space.name) {
            anyhow::ensure!(
                existing.space_id == space.space_id,
                "space name {} already taken by {}",
                space.name,
                existing.space_id
            );
            return Ok(());
        }
        self.tables().put_space(&space)?;
        self.spaces().put(space);
        Ok(())
    }

    fn apply_init_create_shard(&self, ctx: CreateShardCtx) -> anyhow::Result<()> {
        ctx.shard_info.check()?;
        for unit in &ctx.shard_info.units {
            self.tables().put_transited_unit(&ShardUnitRecord {
                suid_prefix: unit.suid.prefix(),
                epoch: unit.suid.epoch(),
                next_epoch: unit.suid.epoch(),
                disk_id: unit.disk_id,
                learner: unit.learner,
                status: ShardUnitStatus::Normal,
                route_version: ctx.shard_info.route_version,
            })?;
        }
        Ok(())
    }

    fn apply_create_shard(&self, ctx: CreateShardCtx) -> anyhow::Result<()> {
        if self.shards().get(ctx.shard_id).is_some() {
            // Replayed create.
            return Ok(());
        }
        let mut info = ctx.shard_info;
        info.check()?;
        let route_version = self.route_mgr().next_route_version();
        info.route_version = route_version;

        let mut prefixes = Vec::with_capacity(info.units.len());
        for unit in &mut info.units {
            unit.route_version = route_version;
            let prefix = unit.suid.prefix();
            self.tables().put_shard_unit(&ShardUnitRecord {
                suid_prefix: prefix,
                epoch: unit.suid.epoch(),
                next_epoch: unit.suid.epoch(),
                disk_id: unit.disk_id,
                learner: unit.learner,
                status: unit.status,
                route_version,
            })?;
            self.tables().delete_transited_unit(prefix)?;
            prefixes.push(prefix);
        }
        self.tables().put_shard(&crate::tables::ShardRecord {
            shard_id: ctx.shard_id,
            range: info.range.clone(),
            route_version,
            leader_disk_id: info.leader_disk_id,
            suid_prefixes: prefixes,
        })?;
        self.route_mgr().insert_route_items(&[RouteItem {
            route_version,
            update_type: RouteUpdateType::AddShard,
            shard_id: ctx.shard_id,
        }])?;

        let epochs = info
            .units
            .iter()
            .map(|u| UnitEpoch {
                epoch: u.suid.epoch(),
                next_epoch: u.suid.epoch(),
            })
            .collect();
        self.shards().put(ctx.shard_id, info, epochs);
        Ok(())
    }

    fn apply_increase_shard_units_epoch(
        &self,
        records: Vec<ShardUnitRecord>,
    ) -> anyhow::Result<()> {
        for record in records {
            let item = self
                .shards()
                .get(record.suid_prefix.shard_id())
                .ok_or_else(|| {
                    anyhow::anyhow!("shard {} not found", record.suid_prefix.shard_id())
                })?;
            let index = record.suid_prefix.index() as usize;
            item.with_mut(|info, epochs| {
                anyhow::ensure!(index < info.units.len(), "unit index {index} out of range");
                anyhow::ensure!(
                    record.epoch > epochs[index].epoch,
                    "epoch must increase: {} -> {}",
                    epochs[index].epoch,
                    record.epoch
                );
                epochs[index].epoch = record.epoch;
                epochs[index].next_epoch = epochs[index].next_epoch.max(record.epoch);
                info.units[index].suid = record.suid_prefix.suid(record.epoch);
                Ok(())
            })?;
            self.tables().put_shard_unit(&record)?;
        }
        Ok(())
    }

    fn apply_update_shard_unit(&self, args: UpdateShardUnitArgs) -> anyhow::Result<()> {
        let shard_id = args.old_suid.shard_id();
        let item = self
            .shards()
            .get(shard_id)
            .ok_or_else(|| anyhow::anyhow!("shard {shard_id} not found"))?;
        let index = args.old_suid.index() as usize;
        let prefix = args.old_suid.prefix();
        anyhow::ensure!(
            prefix == args.new_suid.prefix(),
            "unit replacement cannot move slots: {} -> {}",
            args.old_suid,
            args.new_suid
        );

        // The durable reservation taken by AllocShardUnit must cover the
        // replacement epoch; completion consumes it below.
        let reserved = self
            .tables()
            .get_transited_unit(prefix)?
            .ok_or_else(|| anyhow::anyhow!("no epoch reserved for slot {prefix}"))?;
        anyhow::ensure!(
            reserved.next_epoch == args.new_suid.epoch(),
            "new suid epoch {} was not the reserved {}",
            args.new_suid.epoch(),
            reserved.next_epoch
        );

        let host = self.disk_host(args.new_disk_id).unwrap_or_default();
        let route_version = self.route_mgr().next_route_version();
        let record = item.with_mut(|info, epochs| {
            anyhow::ensure!(index < info.units.len(), "unit index {index} out of range");
            // Out-of-order replacement: the slot has moved past this epoch.
            anyhow::ensure!(
                epochs[index].epoch == args.old_suid.epoch(),
                "old suid epoch {} does not match current {}",
                args.old_suid.epoch(),
                epochs[index].epoch
            );
            anyhow::ensure!(
                args.new_suid.epoch() == epochs[index].next_epoch,
                "new suid epoch {} was not the allocated {}",
                args.new_suid.epoch(),
                epochs[index].next_epoch
            );

            epochs[index].epoch = args.new_suid.epoch();
            let unit = &mut info.units[index];
            unit.suid = args.new_suid;
            unit.disk_id = args.new_disk_id;
            unit.learner = args.new_is_learner;
            unit.status = ShardUnitStatus::Normal;
            unit.host = host.clone();
            unit.route_version = route_version;
            info.route_version = route_version;
            Ok(ShardUnitRecord {
                suid_prefix: prefix,
                epoch: args.new_suid.epoch(),
                next_epoch: epochs[index].next_epoch,
                disk_id: args.new_disk_id,
                learner: args.new_is_learner,
                status: ShardUnitStatus::Normal,
                route_version,
            })
        })?;

        self.tables().put_shard_unit(&record)?;
        self.tables().delete_transited_unit(prefix)?;
        self.route_mgr().insert_route_items(&[RouteItem {
            route_version,
            update_type: RouteUpdateType::UpdateShard,
            shard_id,
        }])?;
        self.mark_dirty(shard_id);
        Ok(())
    }

    fn apply_update_shard_unit_status(&self, prefixes: Vec<SuidPrefix>) -> anyhow::Result<()> {
        for prefix in prefixes {
            let item = self
                .shards()
                .get(prefix.shard_id())
                .ok_or_else(|| anyhow::anyhow!("shard {} not found", prefix.shard_id()))?;
            let index = prefix.index() as usize;
            let record = item.with_mut(|info, epochs| {
                anyhow::ensure!(index < info.units.len(), "unit index {index} out of range");
                let unit = &mut info.units[index];
                let Some(next) = unit.status.next() else {
                    // Terminal status: replayed advance.
                    return Ok(None);
                };
                unit.status = next;
                Ok(Some(ShardUnitRecord {
                    suid_prefix: prefix,
                    epoch: epochs[index].epoch,
                    next_epoch: epochs[index].next_epoch,
                    disk_id: unit.disk_id,
                    learner: unit.learner,
                    status: next,
                    route_version: unit.route_version,
                }))
            })?;
            if let Some(record) = record {
                self.tables().put_shard_unit(&record)?;
                self.mark_dirty(prefix.shard_id());
            }
        }
        Ok(())
    }

    fn apply_shard_report(&self, args: ShardReportArgs) -> anyhow::Result<Vec<ShardTask>> {
        let mut tasks = Vec::new();
        for reported in args.shards {
            let shard_id = reported.suid.shard_id();
            let Some(item) = self.shards().get(shard_id) else {
                tracing::warn!(suid = %reported.suid, "report for unknown shard");
                continue;
            };

            let (current_epoch, shard_route_version, leader_updated) =
                item.with_mut(|info, epochs| {
                    let index = reported.suid.index() as usize;
                    if index >= info.units.len() {
                        return Ok((0, info.route_version, false));
                    }
                    let mut updated = false;
                    // Reports repair the leader hint only; everything else
                    // is owned by replicated unit updates.
                    if reported.leader_disk_id.is_valid()
                        && info.leader_disk_id != reported.leader_disk_id
                    {
                        info.leader_disk_id = reported.leader_disk_id;
                        updated = true;
                    }
                    Ok((epochs[index].epoch, info.route_version, updated))
                })?;
            if leader_updated {
                self.mark_dirty(shard_id);
            }

            if reported.suid.epoch() < current_epoch {
                // The reporting unit was replaced; its data is trash.
                tasks.push(ShardTask {
                    task_type: ShardTaskType::ClearShard,
                    disk_id: reported.disk_id,
                    suid: reported.suid,
                    route_version: reported.route_version,
                    old_route_version: reported.route_version,
                });
                continue;
            }
            if reported.route_version < shard_route_version {
                tasks.push(ShardTask {
                    task_type: ShardTaskType::SyncRouteVersion,
                    disk_id: reported.disk_id,
                    suid: reported.suid,
                    route_version: shard_route_version,
                    old_route_version: reported.route_version,
                });
            }
        }
        Ok(tasks)
    }

    fn apply_alloc_shard_unit(&self, args: AllocShardUnitArgs) -> anyhow::Result<()> {
        let prefix = args.suid_prefix;
        let item = self
            .shards()
            .get(prefix.shard_id())
            .ok_or_else(|| anyhow::anyhow!("shard {} not found", prefix.shard_id()))?;
        let index = prefix.index() as usize;
        let record = item.with_mut(|info, epochs| {
            anyhow::ensure!(index < info.units.len(), "unit index {index} out of range");
            let next = epochs[index].epoch.max(epochs[index].next_epoch) + 1;
            epochs[index].next_epoch = next;
            let unit = &info.units[index];
            Ok(ShardUnitRecord {
                suid_prefix: prefix,
                epoch: epochs[index].epoch,
                next_epoch: next,
                disk_id: unit.disk_id,
                learner: unit.learner,
                status: unit.status,
                route_version: unit.route_version,
            })
        })?;
        self.tables().put_shard_unit(&record)?;
        self.tables().put_transited_unit(&record)?;
        Ok(())
    }

    fn apply_admin_update_shard(&self, args: AdminUpdateShardArgs) -> anyhow::Result<()> {
        let item = self
            .shards()
            .get(args.shard_id)
            .ok_or_else(|| anyhow::anyhow!("shard {} not found", args.shard_id))?;
        item.with_mut(|info, _| {
            info.leader_disk_id = args.leader_disk_id;
            Ok(())
        })?;
        self.mark_dirty(args.shard_id);
        Ok(())
    }

    fn apply_admin_update_shard_unit(&self, record: ShardUnitRecord) -> anyhow::Result<()> {
        let item = self
            .shards()
            .get(record.suid_prefix.shard_id())
            .ok_or_else(|| {
                anyhow::anyhow!("shard {} not found", record.suid_prefix.shard_id())
            })?;
        let index = record.suid_prefix.index() as usize;
        item.with_mut(|info, epochs| {
            anyhow::ensure!(index < info.units.len(), "unit index {index} out of range");
            epochs[index].epoch = record.epoch;
            epochs[index].next_epoch = record.next_epoch;
            let unit = &mut info.units[index];
            unit.suid = record.suid_prefix.suid(record.epoch);
            unit.disk_id = record.disk_id;
            unit.learner = record.learner;
            unit.status = record.status;
            Ok(())
        })?;
        self.tables().put_shard_unit(&record)?;
        self.mark_dirty(record.suid_prefix.shard_id());
        Ok(())
    }
}
