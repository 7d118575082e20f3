//! Cluster-wide catalog: the authoritative directory of shards, shard
//! units and spaces, replicated through its own operation log, plus the
//! append-only route log access-layer caches consume.

pub mod applier;
pub mod mgr;
pub mod route;
pub mod tables;

pub use mgr::{CatalogConfig, CatalogMgr, CatalogReplicator, DiskApi, ShardNodeApi};
