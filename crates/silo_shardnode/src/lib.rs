//! Shard-node storage core: per-disk shard stores, replicated shard state
//! machines over an embedded KV engine, and the node service loops that
//! report to the catalog and execute its tasks.

pub mod kv;
pub mod service;
pub mod shard;
pub mod shard_sm;
pub mod store;

pub use kv::{FjallStore, KvStore};
pub use shard::{Shard, ShardHandler, ShardStopWriting};
pub use store::ShardStore;
