//! Ordered index of a space's partitions keyed by start slot.
//!
//! Reads vastly outnumber writes (every routed request does a lookup), so the
//! index is an `im::OrdMap`: readers clone the root in O(1) under a short read
//! lock and iterate their own snapshot, writers replace an entry under the
//! write lock. A scan therefore sees either the old or the new entry, never a
//! mix, and never blocks a writer while it iterates.

use super::partition::Partition;
use crate::core::SlotId;
use im::OrdMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Default)]
pub struct PartitionTree {
    entries: RwLock<OrdMap<SlotId, Arc<Partition>>>,
}

impl PartitionTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> OrdMap<SlotId, Arc<Partition>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Inserts `partition`, replacing any entry with the same start slot.
    /// Returns the replaced entry.
    pub fn update(&self, partition: Arc<Partition>) -> Option<Arc<Partition>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(partition.start_slot(), partition)
    }

    pub fn remove(&self, start_slot: SlotId) -> Option<Arc<Partition>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(&start_slot)
    }

    /// Up to `limit` partitions with `start_slot >= pivot`, ascending.
    pub fn ascend_scan(&self, pivot: SlotId, limit: usize) -> Vec<Arc<Partition>> {
        if limit == 0 {
            return Vec::new();
        }
        self.snapshot()
            .range(pivot..)
            .take(limit)
            .map(|(_, partition)| Arc::clone(partition))
            .collect()
    }

    /// The partition whose range contains `slot`.
    pub fn find_by_slot(&self, slot: SlotId) -> Option<Arc<Partition>> {
        self.snapshot()
            .range(..=slot)
            .next_back()
            .map(|(_, partition)| Arc::clone(partition))
            .filter(|partition| partition.contains_slot(slot))
    }

    pub fn all(&self) -> Vec<Arc<Partition>> {
        self.snapshot().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PartitionMeta, PartitionStatus, Version};
    use crate::topo::PartitionTopo;

    fn partition(id: u64, start: SlotId, end: SlotId) -> Arc<Partition> {
        Arc::new(Partition::from_topo(PartitionTopo::new(
            PartitionMeta {
                id,
                db_id: 1,
                space_id: 1,
                start_slot: start,
                end_slot: end,
                replicas: Vec::new(),
                status: PartitionStatus::Serving,
            },
            Version(id),
        )))
    }

    fn tree_of(ranges: &[(SlotId, SlotId)]) -> PartitionTree {
        let tree = PartitionTree::new();
        for (i, (start, end)) in ranges.iter().enumerate() {
            tree.update(partition(i as u64 + 1, *start, *end));
        }
        tree
    }

    #[test]
    fn test_ascend_scan_respects_pivot_and_limit() {
        let tree = tree_of(&[(512, 768), (0, 256), (768, 1024), (256, 512)]);

        let starts: Vec<_> = tree.ascend_scan(0, 10).iter().map(|p| p.start_slot()).collect();
        assert_eq!(starts, vec![0, 256, 512, 768]);

        let starts: Vec<_> = tree.ascend_scan(300, 1).iter().map(|p| p.start_slot()).collect();
        assert_eq!(starts, vec![512]);

        assert!(tree.ascend_scan(769, 10).is_empty());
        assert!(tree.ascend_scan(0, 0).is_empty());
    }

    #[test]
    fn test_paging_visits_every_partition_once() {
        let ranges: Vec<_> = (0..37).map(|i| (i * 10, i * 10 + 10)).collect();
        let tree = tree_of(&ranges);

        let mut seen = Vec::new();
        let mut pivot = 0;
        loop {
            let page = tree.ascend_scan(pivot, 5);
            if page.is_empty() {
                break;
            }
            pivot = page.last().unwrap().start_slot() + 1;
            seen.extend(page.iter().map(|p| p.id()));
        }
        assert_eq!(seen.len(), 37);
        seen.dedup();
        assert_eq!(seen.len(), 37);
    }

    #[test]
    fn test_update_replaces_same_start_slot() {
        let tree = tree_of(&[(0, 512), (512, 1024)]);
        let replaced = tree.update(partition(99, 512, 1024)).unwrap();
        assert_eq!(replaced.id(), 2);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.ascend_scan(512, 1)[0].id(), 99);
    }

    #[test]
    fn test_find_by_slot_routes_into_half_open_ranges() {
        let tree = tree_of(&[(0, 256), (256, 512)]);
        assert_eq!(tree.find_by_slot(0).unwrap().start_slot(), 0);
        assert_eq!(tree.find_by_slot(255).unwrap().start_slot(), 0);
        assert_eq!(tree.find_by_slot(256).unwrap().start_slot(), 256);
        assert!(tree.find_by_slot(512).is_none());
        assert!(PartitionTree::new().find_by_slot(3).is_none());
    }

    #[test]
    fn test_scan_snapshot_is_not_torn_by_concurrent_updates() {
        let tree = Arc::new(tree_of(&[(0, 100), (100, 200), (200, 300)]));
        let writer = {
            let tree = Arc::clone(&tree);
            std::thread::spawn(move || {
                for round in 0..500u64 {
                    tree.update(partition(1000 + round, 100, 200));
                }
            })
        };
        for _ in 0..500 {
            let scan = tree.ascend_scan(0, 10);
            assert_eq!(scan.len(), 3);
            assert_eq!(scan[1].start_slot(), 100);
            assert_eq!(scan[1].end_slot(), 200);
        }
        writer.join().unwrap();
        assert_eq!(tree.len(), 3);
    }
}
