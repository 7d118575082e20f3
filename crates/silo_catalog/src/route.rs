//! Append-only route log.
//!
//! Every route-affecting catalog mutation appends one item stamped with
//! the new route version. Access-layer caches pull items they have not
//! seen; truncation keeps a bounded tail so long-gone clients reload the
//! full view instead.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use silo_proto::catalog::RouteItem;
use silo_proto::ids::RouteVersion;

use crate::tables::CatalogTables;

pub struct RouteMgr {
    truncate_interval_num: u64,
    tables: Arc<CatalogTables>,
    items: Mutex<BTreeMap<u64, RouteItem>>,
    head: AtomicU64,
}

impl RouteMgr {
    pub fn new(truncate_interval_num: u64, tables: Arc<CatalogTables>) -> Self {
        Self {
            truncate_interval_num: truncate_interval_num.max(1),
            tables,
            items: Mutex::new(BTreeMap::new()),
            head: AtomicU64::new(0),
        }
    }

    /// Rebuild the in-memory log from persisted items.
    pub fn load_route(&self) -> anyhow::Result<()> {
        let mut items = self.items.lock().expect("route lock poisoned");
        items.clear();
        let mut head = 0u64;
        self.tables.range_route_record(|item| {
            head = head.max(item.route_version.0);
            items.insert(item.route_version.0, item);
            Ok(())
        })?;
        self.head.store(head, Ordering::SeqCst);
        Ok(())
    }

    pub fn get_route_version(&self) -> RouteVersion {
        RouteVersion(self.head.load(Ordering::SeqCst))
    }

    /// Reserve the next route version. Called inside the catalog apply, so
    /// every replica assigns the same stamps.
    pub fn next_route_version(&self) -> RouteVersion {
        RouteVersion(self.head.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Restore the head counter on load when the log tail was truncated
    /// past the newest persisted item.
    pub fn advance_head_to(&self, version: RouteVersion) {
        self.head.fetch_max(version.0, Ordering::SeqCst);
    }

    /// Append items produced by one catalog apply; shares its consensus
    /// batch, so persistence happens before the apply reports success.
    pub fn insert_route_items(&self, new_items: &[RouteItem]) -> anyhow::Result<()> {
        let mut items = self.items.lock().expect("route lock poisoned");
        for item in new_items {
            self.tables.put_route_item(item)?;
            items.insert(item.route_version.0, item.clone());
        }
        Ok(())
    }

    /// Items after `from`, oldest first. `None` means `from` predates the
    /// retained tail and the caller must reload the full catalog.
    pub fn get_route_items(&self, from: RouteVersion) -> Option<Vec<RouteItem>> {
        let items = self.items.lock().expect("route lock poisoned");
        if let Some((&oldest, _)) = items.iter().next() {
            // A gap between the caller's version and the retained tail
            // cannot be repaired incrementally.
            if from.0 + 1 < oldest {
                return None;
            }
        }
        Some(
            items
                .range(from.0 + 1..)
                .map(|(_, item)| item.clone())
                .collect(),
        )
    }

    /// Drop items older than head minus the retention interval.
    pub fn truncate(&self) -> anyhow::Result<usize> {
        let head = self.head.load(Ordering::SeqCst);
        let floor = head.saturating_sub(self.truncate_interval_num);
        let mut items = self.items.lock().expect("route lock poisoned");
        let stale: Vec<u64> = items.range(..floor).map(|(&v, _)| v).collect();
        for version in &stale {
            self.tables.delete_route_item(RouteVersion(*version))?;
            items.remove(version);
        }
        if !stale.is_empty() {
            tracing::debug!(removed = stale.len(), floor, "route log truncated");
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_proto::catalog::RouteUpdateType;
    use silo_proto::ids::ShardId;
    use tempfile::TempDir;

    fn route_mgr(interval: u64) -> (TempDir, RouteMgr) {
        let dir = TempDir::new().unwrap();
        let tables = Arc::new(CatalogTables::open(dir.path()).unwrap());
        (dir, RouteMgr::new(interval, tables))
    }

    fn item(mgr: &RouteMgr) -> RouteItem {
        RouteItem {
            route_version: mgr.next_route_version(),
            update_type: RouteUpdateType::UpdateShard,
            shard_id: ShardId(1),
        }
    }

    #[test]
    fn versions_are_monotonic_and_persisted() {
        let (dir, mgr) = route_mgr(100);
        let items: Vec<RouteItem> = (0..5).map(|_| item(&mgr)).collect();
        mgr.insert_route_items(&items).unwrap();
        assert_eq!(mgr.get_route_version(), RouteVersion(5));

        // Reload from disk.
        let tables = Arc::new(CatalogTables::open(dir.path()).unwrap());
        let reloaded = RouteMgr::new(100, tables);
        reloaded.load_route().unwrap();
        assert_eq!(reloaded.get_route_version(), RouteVersion(5));
        assert_eq!(reloaded.get_route_items(RouteVersion(2)).unwrap().len(), 3);
    }

    #[test]
    fn truncation_keeps_recent_tail() {
        let (_dir, mgr) = route_mgr(3);
        let items: Vec<RouteItem> = (0..10).map(|_| item(&mgr)).collect();
        mgr.insert_route_items(&items).unwrap();

        let removed = mgr.truncate().unwrap();
        assert_eq!(removed, 6);
        // Nothing at or above head - interval was removed.
        let tail = mgr.get_route_items(RouteVersion(6)).unwrap();
        assert_eq!(tail.len(), 4);
        assert_eq!(tail[0].route_version, RouteVersion(7));

        // A reader below the retained tail must reload the full view.
        assert!(mgr.get_route_items(RouteVersion(2)).is_none());
    }

    #[test]
    fn reader_at_tail_boundary_gets_increments() {
        let (_dir, mgr) = route_mgr(3);
        let items: Vec<RouteItem> = (0..10).map(|_| item(&mgr)).collect();
        mgr.insert_route_items(&items).unwrap();
        mgr.truncate().unwrap();

        // Oldest retained is 7; a reader at 6 can still catch up.
        assert_eq!(mgr.get_route_items(RouteVersion(6)).unwrap().len(), 4);

        // A reader that is fully current sees nothing new.
        assert_eq!(mgr.get_route_items(RouteVersion(10)).unwrap().len(), 0);
    }
}
