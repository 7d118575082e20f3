//! Cluster-wide opaque identifiers and the packed shard-unit id.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident, $inner:ty) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
            Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            pub const fn is_valid(&self) -> bool {
                self.0 != 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<$inner> for $name {
            fn from(v: $inner) -> Self {
                Self(v)
            }
        }
    };
}

id_type!(
    /// Cluster identifier.
    ClusterId,
    u32
);
id_type!(
    /// Space (logical namespace) identifier.
    SpaceId,
    u64
);
id_type!(
    /// Shard identifier; a shard is one partition of the key space.
    ShardId,
    u32
);
id_type!(
    /// Disk identifier; one disk hosts many shard units.
    DiskId,
    u32
);
id_type!(
    /// Storage node identifier.
    NodeId,
    u32
);

/// Monotonically increasing cluster-wide stamp on route-affecting mutations.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RouteVersion(pub u64);

impl RouteVersion {
    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for RouteVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

const INDEX_BITS: u32 = 8;
const EPOCH_BITS: u32 = 24;
const MAX_INDEX: u32 = (1 << INDEX_BITS) - 1;
const MAX_EPOCH: u32 = (1 << EPOCH_BITS) - 1;

/// Packed shard-unit id: `(ShardID << 32) | (Index << 24) | Epoch`.
///
/// Index is the replica slot within the shard; Epoch increments strictly on
/// every replacement of the unit in that slot.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Suid(pub u64);

impl Suid {
    pub fn new(shard_id: ShardId, index: u8, epoch: u32) -> Self {
        debug_assert!(epoch <= MAX_EPOCH, "epoch overflows 24 bits");
        Self(
            ((shard_id.0 as u64) << 32)
                | ((index as u64) << EPOCH_BITS)
                | (epoch & MAX_EPOCH) as u64,
        )
    }

    pub const fn shard_id(&self) -> ShardId {
        ShardId((self.0 >> 32) as u32)
    }

    pub const fn index(&self) -> u8 {
        ((self.0 >> EPOCH_BITS) as u32 & MAX_INDEX) as u8
    }

    pub const fn epoch(&self) -> u32 {
        (self.0 & MAX_EPOCH as u64) as u32
    }

    /// The slot identity across epochs.
    pub const fn prefix(&self) -> SuidPrefix {
        SuidPrefix(self.0 & !(MAX_EPOCH as u64))
    }

    pub const fn is_valid(&self) -> bool {
        self.shard_id().0 != 0
    }
}

impl fmt::Display for Suid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.shard_id().0,
            self.index(),
            self.epoch()
        )
    }
}

/// `(ShardID, Index)` — identifies a replica slot across epochs.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SuidPrefix(pub u64);

impl SuidPrefix {
    pub fn new(shard_id: ShardId, index: u8) -> Self {
        Suid::new(shard_id, index, 0).prefix()
    }

    pub const fn shard_id(&self) -> ShardId {
        Suid(self.0).shard_id()
    }

    pub const fn index(&self) -> u8 {
        Suid(self.0).index()
    }

    /// Rebuild the full unit id at a given epoch.
    pub const fn suid(&self, epoch: u32) -> Suid {
        Suid(self.0 | (epoch & MAX_EPOCH) as u64)
    }
}

impl fmt::Display for SuidPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.shard_id().0, self.index())
    }
}
