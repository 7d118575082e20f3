//! Wire-visible error codes.
//!
//! The dispatcher classifies shard-node failures by these codes to decide
//! between punishing a disk, refreshing routes and waiting out an election.

use thiserror::Error;

/// Errors that cross the RPC boundary with a stable status code.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("disk is broken")]
    DiskBroken,
    #[error("shard node disk not found")]
    ShardNodeDiskNotFound,
    #[error("shard does not exist")]
    ShardDoesNotExist,
    #[error("shard route version need update")]
    ShardRouteVersionNeedUpdate,
    #[error("shard node is not the leader")]
    ShardNodeNotLeader,
    #[error("shard has no leader")]
    ShardNoLeader,
    #[error("item id is empty")]
    ItemIdEmpty,
    #[error("key size too large")]
    KeySizeTooLarge,
    #[error("access exceed max object size")]
    AccessExceedSize,
    #[error("illegal arguments")]
    IllegalArguments,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("blob not found")]
    BlobNotFound,
    #[error("blob already sealed")]
    BlobAlreadySealed,
    #[error("item not found")]
    ItemNotFound,
    #[error("space does not exist")]
    SpaceDoesNotExist,
}

impl ApiError {
    /// Wire status code, HTTP-shaped like the rest of the storage tier.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ItemIdEmpty
            | Self::KeySizeTooLarge
            | Self::AccessExceedSize
            | Self::IllegalArguments => 400,
            Self::BlobNotFound | Self::ItemNotFound | Self::SpaceDoesNotExist => 404,
            Self::BlobAlreadySealed => 409,
            Self::DiskBroken => 555,
            Self::ShardNodeDiskNotFound => 556,
            Self::ShardDoesNotExist => 557,
            Self::ShardRouteVersionNeedUpdate => 558,
            Self::ShardNodeNotLeader => 559,
            Self::ShardNoLeader => 560,
            Self::ConnectionRefused => 561,
        }
    }
}

/// Pull the wire code out of a propagated error chain, if one is there.
pub fn detect_code(err: &anyhow::Error) -> Option<ApiError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ApiError>())
        .cloned()
}
