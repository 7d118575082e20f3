//! Item operations: resolved like blob operations, forwarded to the
//! shard node owning the item's shard key.

use silo_proto::blob::Item;
use silo_proto::ids::ClusterId;
use silo_proto::rpc::{
    DeleteItemArgs, GetItemArgs, GetShardMode, InsertItemArgs, ListItemArgs, ListItemRet,
    UpdateItemArgs,
};
use silo_util::retry::ExponentialBackoff;

use crate::blob::{Handler, PunishArgs};

impl Handler {
    pub async fn insert_item(
        &self,
        cluster_id: ClusterId,
        shard_keys: &[Vec<u8>],
        item: Item,
    ) -> anyhow::Result<()> {
        ExponentialBackoff::new(3, 200)
            .rupt_on(|| async {
                let (header, host) = match self
                    .resolve(cluster_id, &item.id, GetShardMode::Leader, shard_keys)
                    .await
                {
                    Ok(resolved) => resolved,
                    Err(err) => return (true, Err(err)),
                };
                match self
                    .client
                    .insert_item(
                        &host,
                        InsertItemArgs {
                            header: header.clone(),
                            item: item.clone(),
                        },
                    )
                    .await
                {
                    Ok(()) => (true, Ok(())),
                    Err(err) => {
                        self.punish_and_update(&PunishArgs {
                            header,
                            cluster_id,
                            host,
                            mode: GetShardMode::Leader,
                            err,
                        })
                        .await
                    }
                }
            })
            .await
    }

    pub async fn update_item(
        &self,
        cluster_id: ClusterId,
        shard_keys: &[Vec<u8>],
        item: Item,
    ) -> anyhow::Result<()> {
        ExponentialBackoff::new(3, 200)
            .rupt_on(|| async {
                let (header, host) = match self
                    .resolve(cluster_id, &item.id, GetShardMode::Leader, shard_keys)
                    .await
                {
                    Ok(resolved) => resolved,
                    Err(err) => return (true, Err(err)),
                };
                match self
                    .client
                    .update_item(
                        &host,
                        UpdateItemArgs {
                            header: header.clone(),
                            item: item.clone(),
                        },
                    )
                    .await
                {
                    Ok(()) => (true, Ok(())),
                    Err(err) => {
                        self.punish_and_update(&PunishArgs {
                            header,
                            cluster_id,
                            host,
                            mode: GetShardMode::Leader,
                            err,
                        })
                        .await
                    }
                }
            })
            .await
    }

    pub async fn delete_item(
        &self,
        cluster_id: ClusterId,
        shard_keys: &[Vec<u8>],
        id: &[u8],
    ) -> anyhow::Result<()> {
        ExponentialBackoff::new(3, 200)
            .rupt_on(|| async {
                let (header, host) = match self
                    .resolve(cluster_id, id, GetShardMode::Leader, shard_keys)
                    .await
                {
                    Ok(resolved) => resolved,
                    Err(err) => return (true, Err(err)),
                };
                match self
                    .client
                    .delete_item(
                        &host,
                        DeleteItemArgs {
                            header: header.clone(),
                            id: id.to_vec(),
                        },
                    )
                    .await
                {
                    Ok(()) => (true, Ok(())),
                    Err(err) => {
                        self.punish_and_update(&PunishArgs {
                            header,
                            cluster_id,
                            host,
                            mode: GetShardMode::Leader,
                            err,
                        })
                        .await
                    }
                }
            })
            .await
    }

    pub async fn get_item(
        &self,
        cluster_id: ClusterId,
        shard_keys: &[Vec<u8>],
        id: &[u8],
        mode: GetShardMode,
    ) -> anyhow::Result<Item> {
        ExponentialBackoff::new(3, 200)
            .rupt_on(|| async {
                let (header, host) = match self.resolve(cluster_id, id, mode, shard_keys).await {
                    Ok(resolved) => resolved,
                    Err(err) => return (true, Err(err)),
                };
                match self
                    .client
                    .get_item(
                        &host,
                        GetItemArgs {
                            header: header.clone(),
                            id: id.to_vec(),
                        },
                    )
                    .await
                {
                    Ok(item) => (true, Ok(item)),
                    Err(err) => {
                        self.punish_and_update(&PunishArgs {
                            header,
                            cluster_id,
                            host,
                            mode,
                            err,
                        })
                        .await
                    }
                }
            })
            .await
    }

    pub async fn list_item(
        &self,
        cluster_id: ClusterId,
        shard_keys: &[Vec<u8>],
        prefix: &[u8],
        marker: &[u8],
        count: u64,
        mode: GetShardMode,
    ) -> anyhow::Result<ListItemRet> {
        ExponentialBackoff::new(3, 200)
            .rupt_on(|| async {
                let (header, host) = match self
                    .resolve(cluster_id, prefix, mode, shard_keys)
                    .await
                {
                    Ok(resolved) => resolved,
                    Err(err) => return (true, Err(err)),
                };
                match self
                    .client
                    .list_item(
                        &host,
                        ListItemArgs {
                            header: header.clone(),
                            prefix: prefix.to_vec(),
                            marker: marker.to_vec(),
                            count,
                        },
                    )
                    .await
                {
                    Ok(ret) => (true, Ok(ret)),
                    Err(err) => {
                        self.punish_and_update(&PunishArgs {
                            header,
                            cluster_id,
                            host,
                            mode,
                            err,
                        })
                        .await
                    }
                }
            })
            .await
    }
}
