//! Shared protocol types for the silo metadata-serving core.
//!
//! This crate carries the identifiers, data model, wire argument structs,
//! error codes and binary codec helpers shared by the shard node, the
//! catalog manager and the access-layer dispatcher.

pub mod blob;
pub mod catalog;
pub mod codec;
pub mod error;
pub mod ids;
pub mod rpc;
pub mod sharding;

pub use error::ApiError;
pub use ids::{ClusterId, DiskId, NodeId, RouteVersion, ShardId, SpaceId, Suid, SuidPrefix};
