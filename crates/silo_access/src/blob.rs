//! Blob operations and the failure-repair path.
//!
//! Every operation resolves a replica through the cached route view,
//! sends the request with exponential backoff, and on failure classifies
//! the error code into one of: punish the disk, refresh routes, repair
//! the leader, or wait out an election.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use silo_proto::blob::{CodeModePolicy, Location};
use silo_proto::error::detect_code;
use silo_proto::ids::{ClusterId, DiskId, ShardId, Suid};
use silo_proto::rpc::{
    AccessAllocSliceArgs, AccessCreateBlobArgs, AccessDeleteBlobArgs, AccessGetBlobArgs,
    AccessListBlobArgs, AccessSealBlobArgs, AllocSliceArgs, AllocSliceRet, CreateBlobArgs,
    DeleteBlobArgs, GetBlobArgs, GetShardArgs, GetShardMode, ListBlobArgs, ListBlobRet,
    SealBlobArgs, ShardOpHeader, ShardStats,
};
use silo_proto::sharding::ListBlobEncodeMarker;
use silo_proto::ApiError;
use silo_util::retry::ExponentialBackoff;
use silo_util::singleflight::Group;

use crate::client::ShardnodeClient;
use crate::controller::{CachedShard, ShardController};

/// Dispatcher configuration.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Leader-wait poll attempts.
    #[serde(default = "default_shardnode_retry_times")]
    pub shardnode_retry_times: u32,
    /// Sleep between leader-wait polls, in milliseconds.
    #[serde(default = "default_shardnode_retry_interval_ms")]
    pub shardnode_retry_interval_ms: u64,
    /// Largest accepted blob size.
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,
    /// Default slice size filled into create requests.
    #[serde(default = "default_max_blob_size")]
    pub max_blob_size: u32,
}

fn default_shardnode_retry_times() -> u32 {
    3
}
fn default_shardnode_retry_interval_ms() -> u64 {
    500
}
fn default_max_object_size() -> u64 {
    5 * (1 << 30)
}
fn default_max_blob_size() -> u32 {
    1 << 22
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            shardnode_retry_times: default_shardnode_retry_times(),
            shardnode_retry_interval_ms: default_shardnode_retry_interval_ms(),
            max_object_size: default_max_object_size(),
            max_blob_size: default_max_blob_size(),
        }
    }
}

pub struct Handler {
    cfg: AccessConfig,
    max_blob_size: AtomicU32,
    code_modes: CodeModePolicy,
    clusters: StdRwLock<HashMap<u32, Arc<ShardController>>>,
    pub(crate) client: Arc<dyn ShardnodeClient>,
    group_run: Group,
}

pub(crate) struct PunishArgs {
    pub header: ShardOpHeader,
    pub cluster_id: ClusterId,
    pub host: String,
    pub mode: GetShardMode,
    pub err: anyhow::Error,
}

impl Handler {
    pub fn new(cfg: AccessConfig, client: Arc<dyn ShardnodeClient>) -> Self {
        Self {
            max_blob_size: AtomicU32::new(cfg.max_blob_size),
            cfg,
            code_modes: CodeModePolicy::default(),
            clusters: StdRwLock::new(HashMap::new()),
            client,
            group_run: Group::new(),
        }
    }

    pub fn add_cluster(&self, controller: Arc<ShardController>) {
        self.clusters
            .write()
            .expect("cluster map lock poisoned")
            .insert(controller.cluster_id().0, controller);
    }

    pub fn set_max_blob_size(&self, size: u32) {
        self.max_blob_size.store(size, Ordering::SeqCst);
    }

    pub(crate) fn get_shard_controller(
        &self,
        cluster_id: ClusterId,
    ) -> anyhow::Result<Arc<ShardController>> {
        self.clusters
            .read()
            .expect("cluster map lock poisoned")
            .get(&cluster_id.0)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no shard controller for cluster {cluster_id}"))
    }

    fn choose_cluster(&self) -> anyhow::Result<ClusterId> {
        let clusters = self.clusters.read().expect("cluster map lock poisoned");
        clusters
            .keys()
            .min()
            .map(|id| ClusterId(*id))
            .ok_or_else(|| anyhow::anyhow!("no clusters registered"))
    }

    pub async fn create_blob(&self, mut args: AccessCreateBlobArgs) -> anyhow::Result<Location> {
        self.fix_create_blob_args(&mut args)?;

        let blob = ExponentialBackoff::new(3, 200)
            .rupt_on(|| async {
                let (header, host) = match self
                    .resolve(
                        args.cluster_id,
                        &args.blob_name,
                        GetShardMode::Leader,
                        &args.shard_keys,
                    )
                    .await
                {
                    Ok(resolved) => resolved,
                    Err(err) => return (true, Err(err)),
                };
                match self
                    .client
                    .create_blob(
                        &host,
                        CreateBlobArgs {
                            header: header.clone(),
                            name: args.blob_name.clone(),
                            code_mode: args.code_mode,
                            size: args.size,
                            slice_size: args.slice_size,
                        },
                    )
                    .await
                {
                    Ok(blob) => (true, Ok(blob)),
                    Err(err) => {
                        self.punish_and_update(&PunishArgs {
                            header,
                            cluster_id: args.cluster_id,
                            host,
                            mode: GetShardMode::Leader,
                            err,
                        })
                        .await
                    }
                }
            })
            .await
            .inspect_err(|err| {
                tracing::warn!(name = ?args.blob_name, error = ?err, "create blob failed");
            })?;
        Ok(blob.location)
    }

    pub async fn get_blob(&self, args: &AccessGetBlobArgs) -> anyhow::Result<Location> {
        let blob = ExponentialBackoff::new(3, 200)
            .rupt_on(|| async {
                let (header, host) = match self
                    .resolve(args.cluster_id, &args.blob_name, args.mode, &args.shard_keys)
                    .await
                {
                    Ok(resolved) => resolved,
                    Err(err) => return (true, Err(err)),
                };
                match self
                    .client
                    .get_blob(
                        &host,
                        GetBlobArgs {
                            header: header.clone(),
                            name: args.blob_name.clone(),
                        },
                    )
                    .await
                {
                    Ok(blob) => (true, Ok(blob)),
                    Err(err) => {
                        self.punish_and_update(&PunishArgs {
                            header,
                            cluster_id: args.cluster_id,
                            host,
                            mode: args.mode,
                            err,
                        })
                        .await
                    }
                }
            })
            .await
            .inspect_err(|err| {
                tracing::warn!(name = ?args.blob_name, error = ?err, "get blob failed");
            })?;
        Ok(blob.location)
    }

    pub async fn seal_blob(&self, args: &AccessSealBlobArgs) -> anyhow::Result<()> {
        ExponentialBackoff::new(3, 200)
            .rupt_on(|| async {
                let (header, host) = match self
                    .resolve(
                        args.cluster_id,
                        &args.blob_name,
                        GetShardMode::Leader,
                        &args.shard_keys,
                    )
                    .await
                {
                    Ok(resolved) => resolved,
                    Err(err) => return (true, Err(err)),
                };
                match self
                    .client
                    .seal_blob(
                        &host,
                        SealBlobArgs {
                            header: header.clone(),
                            name: args.blob_name.clone(),
                            size: args.size,
                            slices: args.slices.clone(),
                        },
                    )
                    .await
                {
                    Ok(()) => (true, Ok(())),
                    Err(err) => {
                        self.punish_and_update(&PunishArgs {
                            header,
                            cluster_id: args.cluster_id,
                            host,
                            mode: GetShardMode::Leader,
                            err,
                        })
                        .await
                    }
                }
            })
            .await
            .inspect_err(|err| {
                tracing::warn!(name = ?args.blob_name, error = ?err, "seal blob failed");
            })
    }

    /// Find the blob, delete its metadata and hand back the location so
    /// the caller can release payload space.
    pub async fn delete_blob(&self, args: &AccessDeleteBlobArgs) -> anyhow::Result<Location> {
        let blob = ExponentialBackoff::new(3, 200)
            .rupt_on(|| async {
                let (header, host) = match self
                    .resolve(
                        args.cluster_id,
                        &args.blob_name,
                        GetShardMode::Leader,
                        &args.shard_keys,
                    )
                    .await
                {
                    Ok(resolved) => resolved,
                    Err(err) => return (true, Err(err)),
                };
                match self
                    .client
                    .find_and_delete_blob(
                        &host,
                        DeleteBlobArgs {
                            header: header.clone(),
                            name: args.blob_name.clone(),
                        },
                    )
                    .await
                {
                    Ok(blob) => (true, Ok(blob)),
                    Err(err) => {
                        self.punish_and_update(&PunishArgs {
                            header,
                            cluster_id: args.cluster_id,
                            host,
                            mode: GetShardMode::Leader,
                            err,
                        })
                        .await
                    }
                }
            })
            .await
            .inspect_err(|err| {
                tracing::warn!(name = ?args.blob_name, error = ?err, "delete blob failed");
            })?;
        Ok(blob.location)
    }

    pub async fn alloc_slice(&self, args: &AccessAllocSliceArgs) -> anyhow::Result<AllocSliceRet> {
        ExponentialBackoff::new(3, 200)
            .rupt_on(|| async {
                let (header, host) = match self
                    .resolve(
                        args.cluster_id,
                        &args.blob_name,
                        GetShardMode::Leader,
                        &args.shard_keys,
                    )
                    .await
                {
                    Ok(resolved) => resolved,
                    Err(err) => return (true, Err(err)),
                };
                match self
                    .client
                    .alloc_slice(
                        &host,
                        AllocSliceArgs {
                            header: header.clone(),
                            name: args.blob_name.clone(),
                            code_mode: args.code_mode,
                            size: args.size,
                            failed_slice: args.fail_slice,
                        },
                    )
                    .await
                {
                    Ok(ret) => (true, Ok(ret)),
                    Err(err) => {
                        self.punish_and_update(&PunishArgs {
                            header,
                            cluster_id: args.cluster_id,
                            host,
                            mode: GetShardMode::Leader,
                            err,
                        })
                        .await
                    }
                }
            })
            .await
            .inspect_err(|err| {
                tracing::warn!(name = ?args.blob_name, error = ?err, "alloc slice failed");
            })
    }

    pub async fn list_blob(&self, args: &AccessListBlobArgs) -> anyhow::Result<ListBlobRet> {
        if args.shard_id != ShardId(0) {
            return self.list_specific_shard(args).await;
        }
        self.list_many_shards(args).await
    }

    async fn list_specific_shard(&self, args: &AccessListBlobArgs) -> anyhow::Result<ListBlobRet> {
        let ctrl = self.get_shard_controller(args.cluster_id)?;
        ExponentialBackoff::new(3, 200)
            .rupt_on(|| async {
                let shard = match ctrl.get_shard_by_id(args.shard_id) {
                    Ok(shard) => shard,
                    Err(err) => return (true, Err(err)),
                };
                let header = match self.header_for_shard(&ctrl, &shard, args.mode, Vec::new()) {
                    Ok(header) => header,
                    Err(err) => return (true, Err(err)),
                };
                let (ret, interrupt) = self
                    .list_single_shard_enough(
                        args.cluster_id,
                        header,
                        &args.prefix,
                        &args.marker,
                        args.count,
                        args.mode,
                    )
                    .await;
                match ret {
                    Ok(page) => (true, Ok(page)),
                    Err(err) => (interrupt, Err(err)),
                }
            })
            .await
    }

    async fn list_many_shards(&self, args: &AccessListBlobArgs) -> anyhow::Result<ListBlobRet> {
        let ctrl = self.get_shard_controller(args.cluster_id)?;

        let mut all = ListBlobRet::default();
        let mut shard: Arc<CachedShard>;
        if args.marker.is_empty() {
            shard = ctrl.get_first_shard()?;
        } else {
            let union = ListBlobEncodeMarker::decode(&args.marker)
                .map_err(|err| anyhow::anyhow!("fail to decode marker: {err}"))?;
            all.next_marker = union.marker;
            shard = ctrl.get_shard_by_range(&union.range)?;
            tracing::debug!(
                range = %union.range,
                marker = ?all.next_marker,
                "resuming cross-shard list"
            );
        }

        let mut last_range = shard.range().clone();
        let mut count = args.count as i64;
        while count > 0 {
            let marker = all.next_marker.clone();
            let page = ExponentialBackoff::new(3, 200)
                .rupt_on(|| async {
                    let header =
                        match self.header_for_shard(&ctrl, &shard, args.mode, Vec::new()) {
                            Ok(header) => header,
                            Err(err) => return (true, Err(err)),
                        };
                    let (ret, interrupt) = self
                        .list_single_shard_enough(
                            args.cluster_id,
                            header,
                            &args.prefix,
                            &marker,
                            count as u64,
                            args.mode,
                        )
                        .await;
                    match ret {
                        Ok(page) => (true, Ok(page)),
                        Err(err) => (interrupt, Err(err)),
                    }
                })
                .await?;

            count -= page.blobs.len() as i64;
            all.blobs.extend(page.blobs);
            all.next_marker = page.next_marker;
            if all.next_marker.is_empty() {
                match ctrl.get_next_shard(&last_range)? {
                    Some(next) => {
                        last_range = next.range().clone();
                        shard = next;
                    }
                    None => {
                        // Past the last shard.
                        last_range = silo_proto::catalog::Range::none();
                        break;
                    }
                }
            }
        }

        // Fully exhausted: no continuation marker.
        if all.next_marker.is_empty() && last_range.is_none() {
            return Ok(all);
        }
        all.next_marker = ListBlobEncodeMarker {
            range: last_range,
            marker: std::mem::take(&mut all.next_marker),
        }
        .encode();
        Ok(all)
    }

    async fn list_single_shard_enough(
        &self,
        cluster_id: ClusterId,
        header: ShardOpHeader,
        prefix: &[u8],
        marker: &[u8],
        count: u64,
        mode: GetShardMode,
    ) -> (anyhow::Result<ListBlobRet>, bool) {
        let host = match self.get_shard_host(cluster_id, header.disk_id) {
            Ok(host) => host,
            Err(err) => return (Err(err), true),
        };
        match self
            .client
            .list_blob(
                &host,
                ListBlobArgs {
                    header: header.clone(),
                    prefix: prefix.to_vec(),
                    marker: marker.to_vec(),
                    count,
                },
            )
            .await
        {
            Ok(ret) => (Ok(ret), true),
            Err(err) => {
                let (interrupt, err) = self
                    .punish_and_update_raw(&PunishArgs {
                        header,
                        cluster_id,
                        host,
                        mode,
                        err,
                    })
                    .await;
                (Err(err), interrupt)
            }
        }
    }

    /// Complete and validate create arguments.
    pub fn fix_create_blob_args(&self, args: &mut AccessCreateBlobArgs) -> anyhow::Result<()> {
        anyhow::ensure!(
            args.size <= self.cfg.max_object_size,
            ApiError::AccessExceedSize
        );
        if args.slice_size == 0 {
            args.slice_size = self.max_blob_size.load(Ordering::SeqCst);
            tracing::debug!(slice_size = args.slice_size, "filled slice size");
        }
        if args.code_mode.0 == 0 {
            args.code_mode = self.code_modes.select(args.size);
            tracing::debug!(code_mode = args.code_mode.0, "selected code mode");
        }
        anyhow::ensure!(args.code_mode.is_valid(), ApiError::IllegalArguments);
        if args.cluster_id.0 == 0 {
            args.cluster_id = self.choose_cluster()?;
            tracing::debug!(cluster_id = %args.cluster_id, "chose cluster");
        }
        Ok(())
    }

    // Resolution helpers.

    pub(crate) async fn resolve(
        &self,
        cluster_id: ClusterId,
        blob_name: &[u8],
        mode: GetShardMode,
        shard_keys: &[Vec<u8>],
    ) -> anyhow::Result<(ShardOpHeader, String)> {
        let ctrl = self.get_shard_controller(cluster_id)?;
        let keys = if shard_keys.is_empty() {
            vec![blob_name.to_vec()]
        } else {
            shard_keys.to_vec()
        };
        let shard = ctrl.get_shard(&keys)?;
        let header = self.header_for_shard(&ctrl, &shard, mode, keys)?;
        let host = self.get_shard_host(cluster_id, header.disk_id)?;
        Ok((header, host))
    }

    fn header_for_shard(
        &self,
        ctrl: &ShardController,
        shard: &CachedShard,
        mode: GetShardMode,
        shard_keys: Vec<Vec<u8>>,
    ) -> anyhow::Result<ShardOpHeader> {
        let member = shard.get_member(ctrl.punisher(), mode, DiskId(0))?;
        Ok(ShardOpHeader {
            space_id: ctrl.space_id(),
            disk_id: member.disk_id,
            suid: member.suid,
            route_version: member.route_version,
            shard_keys,
        })
    }

    pub(crate) fn get_shard_host(
        &self,
        cluster_id: ClusterId,
        disk_id: DiskId,
    ) -> anyhow::Result<String> {
        let ctrl = self.get_shard_controller(cluster_id)?;
        ctrl.directory().shardnode_host(disk_id)
    }

    // Failure repair.

    /// Classify a shard-node failure and repair state. The flattened
    /// variant returns the error to propagate; `interrupt` tells the
    /// caller's retry loop whether to stop.
    pub(crate) async fn punish_and_update<T>(
        &self,
        args: &PunishArgs,
    ) -> (bool, anyhow::Result<T>) {
        let (interrupt, err) = self.punish_and_update_raw(args).await;
        (interrupt, Err(err))
    }

    async fn punish_and_update_raw(&self, args: &PunishArgs) -> (bool, anyhow::Error) {
        let Ok(ctrl) = self.get_shard_controller(args.cluster_id) else {
            return (false, anyhow::anyhow!("no controller for {}", args.cluster_id));
        };

        match detect_code(&args.err) {
            // The addressed disk is broken but not yet repaired. Followers
            // just get replaced by reselection; a broken leader means an
            // election we should wait out.
            Some(ApiError::DiskBroken) => {
                ctrl.punisher().punish(args.header.disk_id, "Broken");
                if args.mode == GetShardMode::Leader {
                    if let Err(err) = self
                        .wait_shardnode_next_leader(&ctrl, args.header.suid, args.header.disk_id)
                        .await
                    {
                        tracing::warn!(
                            cluster_id = %args.cluster_id,
                            error = ?err,
                            "fail to wait next shardnode leader"
                        );
                    }
                }
                (false, clone_err(&args.err))
            }
            // The disk was repaired and removed from the node: routes are
            // stale on top of the disk being gone.
            Some(ApiError::ShardNodeDiskNotFound) => {
                ctrl.punisher().punish(args.header.disk_id, "NotFound");
                if let Err(err) = ctrl.update_route().await {
                    tracing::warn!(
                        cluster_id = %args.cluster_id,
                        error = ?err,
                        "fail to update shard route"
                    );
                }
                (false, clone_err(&args.err))
            }
            Some(ApiError::ShardDoesNotExist) | Some(ApiError::ShardRouteVersionNeedUpdate) => {
                if let Err(err) = ctrl.update_route().await {
                    tracing::warn!(
                        cluster_id = %args.cluster_id,
                        error = ?err,
                        "fail to update shard route"
                    );
                }
                (false, clone_err(&args.err))
            }
            Some(ApiError::ShardNodeNotLeader) => {
                if let Err(err) = self.update_shard(&ctrl, args).await {
                    tracing::warn!(
                        cluster_id = %args.cluster_id,
                        error = ?err,
                        "fail to update shard"
                    );
                }
                (false, clone_err(&args.err))
            }
            _ => {
                if error_connection_refused(&args.err) {
                    tracing::warn!(
                        host = %args.host,
                        disk_id = %args.header.disk_id,
                        "shardnode connection refused"
                    );
                    // One recovery per dead disk; concurrent observers join
                    // the in-flight run.
                    let key = format!("shardnode-leader-{}", args.header.disk_id);
                    self.group_run
                        .do_once(&key, || async {
                            ctrl.punisher().punish(args.header.disk_id, "Refused");
                            if let Err(err) = self
                                .wait_shardnode_next_leader(
                                    &ctrl,
                                    args.header.suid,
                                    args.header.disk_id,
                                )
                                .await
                            {
                                tracing::warn!(
                                    cluster_id = %args.cluster_id,
                                    error = ?err,
                                    "fail to wait next shardnode leader"
                                );
                            }
                        })
                        .await;
                    return (false, anyhow::Error::new(ApiError::ConnectionRefused));
                }
                // Unclassified: the node may be restarting, retry as-is.
                (false, clone_err(&args.err))
            }
        }
    }

    async fn update_shard(&self, ctrl: &ShardController, args: &PunishArgs) -> anyhow::Result<()> {
        let stats = self
            .get_leader_shard_info(
                &args.host,
                args.header.disk_id,
                args.header.suid,
                DiskId(0),
            )
            .await?;
        ctrl.update_shard(&stats)
    }

    /// Poll replicas (excluding the bad disk) until one answers with a
    /// settled leader, then fold it into the route cache.
    pub(crate) async fn wait_shardnode_next_leader(
        &self,
        ctrl: &ShardController,
        suid: Suid,
        bad_disk: DiskId,
    ) -> anyhow::Result<()> {
        let shard = ctrl.get_shard_by_id(suid.shard_id())?;
        let member = shard.get_member(ctrl.punisher(), GetShardMode::Random, bad_disk)?;
        let host = ctrl.directory().shardnode_host(member.disk_id)?;
        let stats = self
            .get_leader_shard_info(&host, member.disk_id, member.suid, bad_disk)
            .await?;
        ctrl.update_shard(&stats)
    }

    async fn get_leader_shard_info(
        &self,
        host: &str,
        disk_id: DiskId,
        suid: Suid,
        bad_disk: DiskId,
    ) -> anyhow::Result<ShardStats> {
        for _ in 0..self.cfg.shardnode_retry_times {
            let stats = match self
                .client
                .get_shard_stats(host, GetShardArgs { disk_id, suid })
                .await
            {
                Ok(stats) => stats,
                Err(err) => {
                    if detect_code(&err) == Some(ApiError::ShardNoLeader) {
                        tracing::warn!(host, disk_id = %disk_id, suid = %suid, "shard is in election");
                        tokio::time::sleep(Duration::from_millis(
                            self.cfg.shardnode_retry_interval_ms,
                        ))
                        .await;
                        continue;
                    }
                    return Err(err);
                }
            };

            // Leader 0 means the election has not settled; the bad disk as
            // leader means it has not noticed its peer died yet.
            if !stats.leader_disk_id.is_valid() || stats.leader_disk_id == bad_disk {
                tracing::warn!(host, disk_id = %disk_id, suid = %suid, bad_disk = %bad_disk, "shard is in election");
                tokio::time::sleep(Duration::from_millis(self.cfg.shardnode_retry_interval_ms))
                    .await;
                continue;
            }
            return Ok(stats);
        }
        Err(anyhow::Error::new(ApiError::ShardNoLeader))
    }
}

/// Preserve the original message and wire code across the retry loop.
fn clone_err(err: &anyhow::Error) -> anyhow::Error {
    match detect_code(err) {
        Some(code) => anyhow::Error::new(code).context(err.to_string()),
        None => anyhow::anyhow!("{err}"),
    }
}

/// Whether the failure is a refused connection (dead process or host).
pub(crate) fn error_connection_refused(err: &anyhow::Error) -> bool {
    if err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .any(|io| io.kind() == std::io::ErrorKind::ConnectionRefused)
    {
        return true;
    }
    err.to_string().to_lowercase().contains("connection refused")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_refused_detection() {
        let io = anyhow::Error::new(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
            .context("dial tcp 127.0.0.1:9100");
        assert!(error_connection_refused(&io));

        let text = anyhow::anyhow!("dial tcp 127.0.0.1:9100: connect: connection refused");
        assert!(error_connection_refused(&text));

        let other = anyhow::anyhow!("timeout");
        assert!(!error_connection_refused(&other));
    }

    #[test]
    fn clone_err_keeps_wire_code() {
        let err = anyhow::Error::new(ApiError::ShardNodeNotLeader).context("create failed");
        let cloned = clone_err(&err);
        assert_eq!(detect_code(&cloned), Some(ApiError::ShardNodeNotLeader));
    }
}
