//! Access-layer dispatcher: resolves blob names to shard replicas through
//! a cached route view, sends shard-node requests with retry, and repairs
//! routing and leader state from classified failures.

pub mod blob;
pub mod client;
pub mod controller;
pub mod item;

pub use blob::{AccessConfig, Handler};
pub use client::{CatalogClient, ShardnodeClient};
pub use controller::{DiskPunisher, ServiceDirectory, ShardController};
