//! Persisted catalog tables over fjall partitions.
//!
//! Every record value starts with a format-version byte followed by a
//! self-describing body; keys are big-endian ids so range loads return
//! records in key order.

use std::path::Path;
use std::sync::Arc;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};

use silo_proto::catalog::{Range, RouteItem, ShardUnitStatus, Space};
use silo_proto::codec;
use silo_proto::ids::{DiskId, NodeId, RouteVersion, ShardId, SpaceId, SuidPrefix};

const SHARD_RECORD_VERSION: u8 = 1;
const SHARD_UNIT_RECORD_VERSION: u8 = 1;
const SPACE_RECORD_VERSION: u8 = 1;
const ROUTE_RECORD_VERSION: u8 = 1;
const NODE_RECORD_VERSION: u8 = 1;

/// Persisted shard row; unit details live in the shard-unit table, keyed
/// by the suid prefixes recorded here.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub shard_id: ShardId,
    pub range: Range,
    pub route_version: RouteVersion,
    pub leader_disk_id: DiskId,
    pub suid_prefixes: Vec<SuidPrefix>,
}

/// Persisted shard-unit row. `epoch` is the unit's current epoch;
/// `next_epoch` is the highest epoch ever reserved for the slot, so
/// replacements mint strictly increasing epochs across restarts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardUnitRecord {
    pub suid_prefix: SuidPrefix,
    pub epoch: u32,
    pub next_epoch: u32,
    pub disk_id: DiskId,
    pub learner: bool,
    pub status: ShardUnitStatus,
    pub route_version: RouteVersion,
}

/// Storage-node row used to resolve disks to hosts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub host: String,
    pub disk_ids: Vec<DiskId>,
}

pub struct CatalogTables {
    _keyspace: Arc<Keyspace>,
    shard: PartitionHandle,
    shard_unit: PartitionHandle,
    space: PartitionHandle,
    route: PartitionHandle,
    transited: PartitionHandle,
    node: PartitionHandle,
}

impl CatalogTables {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let keyspace = Arc::new(Config::new(path).open()?);
        let open = |name: &str| -> anyhow::Result<PartitionHandle> {
            Ok(keyspace.open_partition(name, PartitionCreateOptions::default())?)
        };
        Ok(Self {
            shard: open("shard")?,
            shard_unit: open("shard_unit")?,
            space: open("space")?,
            route: open("route")?,
            transited: open("transited")?,
            node: open("node")?,
            _keyspace: keyspace,
        })
    }

    // Shard table.

    pub fn put_shard(&self, record: &ShardRecord) -> anyhow::Result<()> {
        let value = codec::encode_record(SHARD_RECORD_VERSION, record)?;
        self.shard.insert(record.shard_id.0.to_be_bytes(), value)?;
        Ok(())
    }

    pub fn get_shard(&self, shard_id: ShardId) -> anyhow::Result<Option<ShardRecord>> {
        match self.shard.get(shard_id.0.to_be_bytes())? {
            Some(value) => Ok(Some(codec::decode_record(SHARD_RECORD_VERSION, &value)?)),
            None => Ok(None),
        }
    }

    pub fn delete_shard(&self, shard_id: ShardId) -> anyhow::Result<()> {
        self.shard.remove(shard_id.0.to_be_bytes())?;
        Ok(())
    }

    /// Visit every shard record in key order.
    pub fn range_shard_record(
        &self,
        mut visit: impl FnMut(ShardRecord) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        for entry in self.shard.iter() {
            let (_, value) = entry?;
            visit(codec::decode_record(SHARD_RECORD_VERSION, &value)?)?;
        }
        Ok(())
    }

    // Shard-unit table.

    pub fn put_shard_unit(&self, record: &ShardUnitRecord) -> anyhow::Result<()> {
        let value = codec::encode_record(SHARD_UNIT_RECORD_VERSION, record)?;
        self.shard_unit
            .insert(record.suid_prefix.0.to_be_bytes(), value)?;
        Ok(())
    }

    /// Current unit row for a replica slot.
    pub fn get_shard_unit(&self, prefix: SuidPrefix) -> anyhow::Result<Option<ShardUnitRecord>> {
        match self.shard_unit.get(prefix.0.to_be_bytes())? {
            Some(value) => Ok(Some(codec::decode_record(SHARD_UNIT_RECORD_VERSION, &value)?)),
            None => Ok(None),
        }
    }

    pub fn delete_shard_unit(&self, prefix: SuidPrefix) -> anyhow::Result<()> {
        self.shard_unit.remove(prefix.0.to_be_bytes())?;
        Ok(())
    }

    // Transited table: reservations taken while a unit is replaced.

    pub fn put_transited_unit(&self, record: &ShardUnitRecord) -> anyhow::Result<()> {
        let value = codec::encode_record(SHARD_UNIT_RECORD_VERSION, record)?;
        self.transited
            .insert(record.suid_prefix.0.to_be_bytes(), value)?;
        Ok(())
    }

    pub fn get_transited_unit(
        &self,
        prefix: SuidPrefix,
    ) -> anyhow::Result<Option<ShardUnitRecord>> {
        match self.transited.get(prefix.0.to_be_bytes())? {
            Some(value) => Ok(Some(codec::decode_record(SHARD_UNIT_RECORD_VERSION, &value)?)),
            None => Ok(None),
        }
    }

    pub fn delete_transited_unit(&self, prefix: SuidPrefix) -> anyhow::Result<()> {
        self.transited.remove(prefix.0.to_be_bytes())?;
        Ok(())
    }

    // Space table.

    pub fn put_space(&self, space: &Space) -> anyhow::Result<()> {
        let value = codec::encode_record(SPACE_RECORD_VERSION, space)?;
        self.space.insert(space.space_id.0.to_be_bytes(), value)?;
        Ok(())
    }

    pub fn get_space(&self, space_id: SpaceId) -> anyhow::Result<Option<Space>> {
        match self.space.get(space_id.0.to_be_bytes())? {
            Some(value) => Ok(Some(codec::decode_record(SPACE_RECORD_VERSION, &value)?)),
            None => Ok(None),
        }
    }

    pub fn range_space_record(
        &self,
        mut visit: impl FnMut(Space) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        for entry in self.space.iter() {
            let (_, value) = entry?;
            visit(codec::decode_record(SPACE_RECORD_VERSION, &value)?)?;
        }
        Ok(())
    }

    // Route table.

    pub fn put_route_item(&self, item: &RouteItem) -> anyhow::Result<()> {
        let value = codec::encode_record(ROUTE_RECORD_VERSION, item)?;
        self.route.insert(item.route_version.0.to_be_bytes(), value)?;
        Ok(())
    }

    pub fn delete_route_item(&self, version: RouteVersion) -> anyhow::Result<()> {
        self.route.remove(version.0.to_be_bytes())?;
        Ok(())
    }

    pub fn range_route_record(
        &self,
        mut visit: impl FnMut(RouteItem) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        for entry in self.route.iter() {
            let (_, value) = entry?;
            visit(codec::decode_record(ROUTE_RECORD_VERSION, &value)?)?;
        }
        Ok(())
    }

    // Node table.

    pub fn put_node(&self, record: &NodeRecord) -> anyhow::Result<()> {
        let value = codec::encode_record(NODE_RECORD_VERSION, record)?;
        self.node.insert(record.node_id.0.to_be_bytes(), value)?;
        Ok(())
    }

    pub fn get_node(&self, node_id: NodeId) -> anyhow::Result<Option<NodeRecord>> {
        match self.node.get(node_id.0.to_be_bytes())? {
            Some(value) => Ok(Some(codec::decode_record(NODE_RECORD_VERSION, &value)?)),
            None => Ok(None),
        }
    }

    pub fn range_node_record(
        &self,
        mut visit: impl FnMut(NodeRecord) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        for entry in self.node.iter() {
            let (_, value) = entry?;
            visit(codec::decode_record(NODE_RECORD_VERSION, &value)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_proto::catalog::RouteUpdateType;
    use tempfile::TempDir;

    fn open_tables() -> (TempDir, CatalogTables) {
        let dir = TempDir::new().unwrap();
        let tables = CatalogTables::open(dir.path()).unwrap();
        (dir, tables)
    }

    #[test]
    fn shard_records_load_in_key_order() {
        let (_dir, tables) = open_tables();
        for id in [3u32, 1, 2] {
            tables
                .put_shard(&ShardRecord {
                    shard_id: ShardId(id),
                    ..Default::default()
                })
                .unwrap();
        }
        let mut seen = Vec::new();
        tables
            .range_shard_record(|record| {
                seen.push(record.shard_id.0);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn shard_unit_round_trip_by_prefix() {
        let (_dir, tables) = open_tables();
        let prefix = SuidPrefix::new(ShardId(4), 2);
        let record = ShardUnitRecord {
            suid_prefix: prefix,
            epoch: 3,
            next_epoch: 5,
            disk_id: DiskId(9),
            learner: false,
            status: ShardUnitStatus::Normal,
            route_version: RouteVersion(7),
        };
        tables.put_shard_unit(&record).unwrap();
        assert_eq!(tables.get_shard_unit(prefix).unwrap(), Some(record));
        assert_eq!(
            tables.get_shard_unit(SuidPrefix::new(ShardId(4), 3)).unwrap(),
            None
        );
    }

    #[test]
    fn transited_units_are_separate_from_current() {
        let (_dir, tables) = open_tables();
        let prefix = SuidPrefix::new(ShardId(1), 0);
        tables
            .put_transited_unit(&ShardUnitRecord {
                suid_prefix: prefix,
                epoch: 2,
                ..Default::default()
            })
            .unwrap();
        assert!(tables.get_shard_unit(prefix).unwrap().is_none());
        assert!(tables.get_transited_unit(prefix).unwrap().is_some());
        tables.delete_transited_unit(prefix).unwrap();
        assert!(tables.get_transited_unit(prefix).unwrap().is_none());
    }

    #[test]
    fn route_records_ordered_by_version() {
        let (_dir, tables) = open_tables();
        for version in [5u64, 2, 9] {
            tables
                .put_route_item(&RouteItem {
                    route_version: RouteVersion(version),
                    update_type: RouteUpdateType::AddShard,
                    shard_id: ShardId(1),
                })
                .unwrap();
        }
        let mut seen = Vec::new();
        tables
            .range_route_record(|item| {
                seen.push(item.route_version.0);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![2, 5, 9]);
    }

    #[test]
    fn unknown_version_tag_is_rejected() {
        let (_dir, tables) = open_tables();
        tables
            .shard
            .insert(1u32.to_be_bytes(), vec![9u8, b'{', b'}'])
            .unwrap();
        assert!(tables.get_shard(ShardId(1)).is_err());
    }
}
