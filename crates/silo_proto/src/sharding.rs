//! Hash-range descriptors used to partition the key space across shards.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::codec::{put_bytes, read_bytes, read_u64, read_u8};

/// Range type tag. `None` (0) is the past-end sentinel used by cross-shard
/// traversal markers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RangeType {
    #[default]
    None = 0,
    Hash = 1,
}

impl RangeType {
    pub fn from_u8(v: u8) -> anyhow::Result<Self> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Hash),
            other => anyhow::bail!("unknown range type {other}"),
        }
    }
}

/// One `[min, max)` interval over the hashed key space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubRange {
    pub min: u64,
    pub max: u64,
}

impl SubRange {
    pub const fn contains(&self, hash: u64) -> bool {
        self.min <= hash && hash < self.max
    }
}

/// A shard's slice of the hashed key space.
///
/// Ranges are end-exclusive; a range whose type is [`RangeType::None`]
/// represents "past the last shard".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    #[serde(rename = "type")]
    pub range_type: RangeType,
    pub subs: Vec<SubRange>,
}

impl Range {
    pub fn new_hash(min: u64, max: u64) -> Self {
        Self {
            range_type: RangeType::Hash,
            subs: vec![SubRange { min, max }],
        }
    }

    /// The past-end sentinel.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_none(&self) -> bool {
        self.range_type == RangeType::None
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.range_type == RangeType::Hash && self.subs.iter().any(|s| s.contains(hash))
    }

    /// Lower boundary used for ordered traversal across shards.
    pub fn min_boundary(&self) -> u64 {
        self.subs.first().map(|s| s.min).unwrap_or(0)
    }

    pub fn max_boundary(&self) -> u64 {
        self.subs.iter().map(|s| s.max).max().unwrap_or(0)
    }

    /// Binary encoding used inside opaque list markers.
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        out.push(self.range_type as u8);
        out.push(self.subs.len() as u8);
        for sub in &self.subs {
            out.extend_from_slice(&sub.min.to_be_bytes());
            out.extend_from_slice(&sub.max.to_be_bytes());
        }
    }

    pub fn decode_from(data: &[u8], offset: &mut usize) -> anyhow::Result<Self> {
        let range_type = RangeType::from_u8(read_u8(data, offset)?)?;
        let count = read_u8(data, offset)? as usize;
        let mut subs = Vec::with_capacity(count);
        for _ in 0..count {
            let min = read_u64(data, offset)?;
            let max = read_u64(data, offset)?;
            subs.push(SubRange { min, max });
        }
        Ok(Self { range_type, subs })
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.range_type {
            RangeType::None => write!(f, "[none]"),
            RangeType::Hash => {
                write!(f, "[")?;
                for (i, sub) in self.subs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}..{}", sub.min, sub.max)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Hash one key for shard selection.
pub fn hash_key(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Fold a set of shard keys into one routing hash. All operations that
/// address the same shard keys land on the same shard.
pub fn hash_shard_keys(keys: &[Vec<u8>]) -> u64 {
    let mut out = 0u64;
    for key in keys {
        out = out.wrapping_add(hash_key(key));
    }
    out
}

/// Opaque continuation marker for cross-shard listing: the next expected
/// shard range plus the in-shard resume key. Encoded as a one-byte
/// discriminant followed by the payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListBlobEncodeMarker {
    pub range: Range,
    pub marker: Vec<u8>,
}

const MARKER_TAG_RESUME: u8 = 1;

impl ListBlobEncodeMarker {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 16 * self.subs_len() + 4 + self.marker.len());
        out.push(MARKER_TAG_RESUME);
        self.range.encode_to(&mut out);
        put_bytes(&mut out, &self.marker);
        out
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let tag = read_u8(data, &mut offset)?;
        anyhow::ensure!(tag == MARKER_TAG_RESUME, "unknown list marker tag {tag}");
        let range = Range::decode_from(data, &mut offset)?;
        let marker = read_bytes(data, &mut offset)?;
        Ok(Self { range, marker })
    }

    fn subs_len(&self) -> usize {
        self.range.subs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_is_end_exclusive() {
        let range = Range::new_hash(100, 200);
        assert!(range.contains(100));
        assert!(range.contains(199));
        assert!(!range.contains(200));
        assert!(!range.contains(99));
        assert!(!Range::none().contains(0));
    }

    #[test]
    fn shard_key_hash_is_stable() {
        let keys = vec![b"blob-a".to_vec(), b"blob-b".to_vec()];
        assert_eq!(hash_shard_keys(&keys), hash_shard_keys(&keys.clone()));
        assert_ne!(
            hash_shard_keys(&[b"blob-a".to_vec()]),
            hash_shard_keys(&[b"blob-b".to_vec()])
        );
    }

    #[test]
    fn marker_round_trip() {
        let marker = ListBlobEncodeMarker {
            range: Range::new_hash(7, 19),
            marker: b"p/04".to_vec(),
        };
        let decoded = ListBlobEncodeMarker::decode(&marker.encode()).unwrap();
        assert_eq!(decoded, marker);

        let end = ListBlobEncodeMarker {
            range: Range::none(),
            marker: Vec::new(),
        };
        let decoded = ListBlobEncodeMarker::decode(&end.encode()).unwrap();
        assert!(decoded.range.is_none());
        assert!(decoded.marker.is_empty());
    }
}
