//! Client seams to remote services. The RPC transport itself lives
//! outside this core; implementations route these calls over it.

use async_trait::async_trait;

use silo_proto::blob::{Blob, Item};
use silo_proto::catalog::CatalogChanges;
use silo_proto::ids::RouteVersion;
use silo_proto::rpc::{
    AllocSliceArgs, AllocSliceRet, CreateBlobArgs, DeleteBlobArgs, DeleteItemArgs, GetBlobArgs,
    GetItemArgs, GetShardArgs, InsertItemArgs, ListBlobArgs, ListBlobRet, ListItemArgs,
    ListItemRet, SealBlobArgs, ShardStats, UpdateItemArgs,
};

/// Shard-node RPC surface as seen by the dispatcher.
#[async_trait]
pub trait ShardnodeClient: Send + Sync {
    async fn create_blob(&self, host: &str, args: CreateBlobArgs) -> anyhow::Result<Blob>;
    async fn get_blob(&self, host: &str, args: GetBlobArgs) -> anyhow::Result<Blob>;
    async fn seal_blob(&self, host: &str, args: SealBlobArgs) -> anyhow::Result<()>;
    async fn find_and_delete_blob(&self, host: &str, args: DeleteBlobArgs)
        -> anyhow::Result<Blob>;
    async fn alloc_slice(&self, host: &str, args: AllocSliceArgs) -> anyhow::Result<AllocSliceRet>;
    async fn list_blob(&self, host: &str, args: ListBlobArgs) -> anyhow::Result<ListBlobRet>;

    async fn insert_item(&self, host: &str, args: InsertItemArgs) -> anyhow::Result<()>;
    async fn update_item(&self, host: &str, args: UpdateItemArgs) -> anyhow::Result<()>;
    async fn delete_item(&self, host: &str, args: DeleteItemArgs) -> anyhow::Result<()>;
    async fn get_item(&self, host: &str, args: GetItemArgs) -> anyhow::Result<Item>;
    async fn list_item(&self, host: &str, args: ListItemArgs) -> anyhow::Result<ListItemRet>;

    async fn get_shard_stats(&self, host: &str, args: GetShardArgs) -> anyhow::Result<ShardStats>;
}

/// Catalog read surface consumed by the route cache.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn get_catalog_changes(&self, from: RouteVersion) -> anyhow::Result<CatalogChanges>;
}
