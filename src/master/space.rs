use super::cache::{CacheEntry, NamedCache};
use super::guarded::Guarded;
use super::id_generator::IdGenerator;
use super::partition::{Partition, split_slots};
use super::partition_tree::PartitionTree;
use crate::core::{
    DbId, DbMeta, KeyPolicy, MetaError, PartitionId, PartitionMeta, PartitionStatus, ReplicaMeta,
    Result, SlotId, SpaceId, SpaceMeta, SpaceStatus, Version,
};
use crate::topo::{PartitionTopo, SpaceTopo, TopoServer};
use std::sync::Arc;
use tracing::{error, info, warn};

/// How a new space is keyed and split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPolicy {
    pub key: String,
    pub function: String,
    /// Number of initial partitions.
    pub number: u32,
}

impl PartitionPolicy {
    pub fn new(key: impl Into<String>, function: impl Into<String>, number: u32) -> Self {
        Self {
            key: key.into(),
            function: function.into(),
            number,
        }
    }

    pub fn key_policy(&self) -> KeyPolicy {
        KeyPolicy::new(self.key.clone(), self.function.clone())
    }
}

/// A sharded collection and its partition index.
pub struct Space {
    id: SpaceId,
    db_id: DbId,
    record: Guarded<SpaceMeta>,
    partitions: PartitionTree,
}

pub type SpaceCache = NamedCache<Space>;

impl Space {
    /// A space that has not been persisted yet, with a fresh id.
    pub fn new(
        ids: &dyn IdGenerator,
        db: &DbMeta,
        name: &str,
        policy: &PartitionPolicy,
        slot_count: u32,
    ) -> Result<Self> {
        let id = ids.gen_id().map_err(|err| {
            error!(db = %db.name, space = name, error = %err, "failed to allocate space id");
            err
        })?;
        let meta = SpaceMeta {
            id,
            name: name.to_string(),
            db_id: db.id,
            db_name: db.name.clone(),
            key_policy: policy.key_policy(),
            status: SpaceStatus::Initializing,
            slot_count,
        };
        Ok(Self::from_topo(SpaceTopo::new(meta, Version::default())))
    }

    pub fn from_topo(topo: SpaceTopo) -> Self {
        Self {
            id: topo.meta.id,
            db_id: topo.meta.db_id,
            record: Guarded::new(topo),
            partitions: PartitionTree::new(),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn db_id(&self) -> DbId {
        self.db_id
    }

    pub fn name(&self) -> String {
        self.record.read(|record| record.meta.name.clone())
    }

    pub fn status(&self) -> SpaceStatus {
        self.record.read(|record| record.meta.status)
    }

    pub fn slot_count(&self) -> u32 {
        self.record.read(|record| record.meta.slot_count)
    }

    pub fn version(&self) -> Version {
        self.record.read(|record| record.version)
    }

    pub fn meta(&self) -> SpaceMeta {
        self.record.read(|record| record.meta.clone())
    }

    pub fn topo(&self) -> SpaceTopo {
        self.record.snapshot()
    }

    /// Lays out `partition_count` partitions over `[0, slot_count)`, each with
    /// a fresh id and one replica per entry of `replica_nodes`.
    pub fn build_partitions(
        &self,
        ids: &dyn IdGenerator,
        partition_count: u32,
        replica_nodes: &[String],
    ) -> Result<Vec<PartitionMeta>> {
        let ranges = split_slots(self.slot_count(), partition_count)?;
        let mut partitions = Vec::with_capacity(ranges.len());
        for (start_slot, end_slot) in ranges {
            let id = ids.gen_id()?;
            let replicas = replica_nodes
                .iter()
                .map(|node| {
                    ids.gen_id().map(|replica_id| ReplicaMeta {
                        id: replica_id,
                        partition_id: id,
                        node_addr: node.clone(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            partitions.push(PartitionMeta {
                id,
                db_id: self.db_id,
                space_id: self.id,
                start_slot,
                end_slot,
                replicas,
                status: PartitionStatus::Creating,
            });
        }
        Ok(partitions)
    }

    /// Persists the space together with `partitions` in one transaction,
    /// then indexes the partitions.
    pub async fn add(&self, topo: &TopoServer, partitions: Vec<PartitionMeta>) -> Result<Vec<Arc<Partition>>> {
        check_coverage(self.slot_count(), &partitions)?;
        let (space, created) = self
            .record
            .replace(|current| async move { topo.add_space(&current.meta, &partitions).await })
            .await
            .map_err(|err| {
                error!(space_id = self.id, error = %err, "failed to persist space");
                err
            })?;

        let created: Vec<_> = created
            .into_iter()
            .map(|partition| Arc::new(Partition::from_topo(partition)))
            .collect();
        for partition in &created {
            self.partitions.update(Arc::clone(partition));
        }
        info!(
            space = %space.meta.name,
            space_id = self.id,
            partitions = created.len(),
            version = %space.version,
            "space persisted"
        );
        Ok(created)
    }

    /// Applies `change` to the space record through a versioned update.
    pub async fn update<F>(&self, topo: &TopoServer, change: F) -> Result<SpaceTopo>
    where
        F: FnOnce(&mut SpaceMeta) -> Result<()>,
    {
        self.record
            .update(change, |proposed| async move { topo.update_space(&proposed).await })
            .await
            .map_err(|err| {
                error!(space_id = self.id, error = %err, "failed to update space");
                err
            })
    }

    /// Renames the space in the store, then moves it to `new_name` in
    /// `cache` and in memory in one step as seen by cache readers.
    pub async fn rename(
        &self,
        topo: &TopoServer,
        cache: &SpaceCache,
        new_name: &str,
    ) -> Result<SpaceTopo> {
        let guard = self.record.lock().await;
        cache.check_rename(self.id, new_name)?;
        let mut proposed = guard.current();
        proposed.meta.name = new_name.to_string();
        proposed.version = topo.update_space(&proposed).await.map_err(|err| {
            error!(space_id = self.id, new_name, error = %err, "failed to rename space");
            err
        })?;
        cache
            .rename_with(self.id, new_name, || guard.install(proposed.clone()))
            .map_err(|err| {
                error!(space_id = self.id, new_name, error = %err, "space renamed in store but not in cache");
                err
            })?;
        Ok(proposed)
    }

    pub async fn set_status(&self, topo: &TopoServer, status: SpaceStatus) -> Result<SpaceTopo> {
        self.update(topo, |meta| {
            meta.status = status;
            Ok(())
        })
        .await
    }

    /// Deletes the space record and the records of its indexed partitions in
    /// one transaction. Returns the partitions that were deleted.
    pub async fn erase(&self, topo: &TopoServer) -> Result<Vec<Arc<Partition>>> {
        let partitions = self.partitions.all();
        let partition_topos: Vec<PartitionTopo> =
            partitions.iter().map(|partition| partition.topo()).collect();
        self.record
            .erase(|current| async move {
                topo.delete_space_with_partitions(&current, &partition_topos)
                    .await
            })
            .await
            .map_err(|err| {
                error!(space_id = self.id, error = %err, "failed to erase space");
                err
            })?;
        Ok(partitions)
    }

    /// Indexes a partition that already exists in the store.
    pub fn put_partition(&self, partition: Arc<Partition>) -> Option<Arc<Partition>> {
        if partition.space_id() != self.id {
            warn!(
                space_id = self.id,
                partition_id = partition.id(),
                owner = partition.space_id(),
                "indexing partition of another space"
            );
        }
        self.partitions.update(partition)
    }

    pub fn partition(&self, partition_id: PartitionId) -> Option<Arc<Partition>> {
        self.partitions
            .all()
            .into_iter()
            .find(|partition| partition.id() == partition_id)
    }

    pub fn partitions(&self) -> Vec<Arc<Partition>> {
        self.partitions.all()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn ascend_scan_partition(&self, pivot: SlotId, limit: usize) -> Vec<Arc<Partition>> {
        self.partitions.ascend_scan(pivot, limit)
    }

    pub fn find_partition_by_slot(&self, slot: SlotId) -> Option<Arc<Partition>> {
        self.partitions.find_by_slot(slot)
    }
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("id", &self.id)
            .field("db_id", &self.db_id)
            .field("name", &self.name())
            .field("partitions", &self.partitions.len())
            .finish()
    }
}

impl CacheEntry for Space {
    const KIND: &'static str = "space";

    fn entry_id(&self) -> u64 {
        self.id
    }

    fn entry_name(&self) -> String {
        self.name()
    }
}

impl NamedCache<Space> {
    /// Reads every space record and returns unindexed space objects. The
    /// cache itself is not touched.
    pub async fn recovery(topo: &TopoServer) -> Result<Vec<Arc<Space>>> {
        let spaces = topo.get_all_spaces().await.map_err(|err| {
            error!(error = %err, "space recovery scan failed");
            err
        })?;
        Ok(spaces
            .into_iter()
            .map(|space| Arc::new(Space::from_topo(space)))
            .collect())
    }
}

/// Partitions must tile `[0, slot_count)` without gaps or overlap.
fn check_coverage(slot_count: u32, partitions: &[PartitionMeta]) -> Result<()> {
    let mut ranges: Vec<_> = partitions
        .iter()
        .map(|p| (p.start_slot, p.end_slot))
        .collect();
    ranges.sort_unstable();
    let mut next = 0;
    for (start, end) in ranges {
        if start != next || end <= start {
            return Err(MetaError::InvalidArgument(format!(
                "partition [{}, {}) breaks slot coverage at {}",
                start, end, next
            )));
        }
        next = end;
    }
    if next != slot_count {
        return Err(MetaError::InvalidArgument(format!(
            "partitions cover [0, {}) instead of [0, {})",
            next, slot_count
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::id_generator::SequenceIdGenerator;
    use crate::topo::{FaultPlan, MemoryTopoBackend};

    fn db() -> DbMeta {
        DbMeta {
            id: 100,
            name: "d1".to_string(),
        }
    }

    fn setup() -> (MemoryTopoBackend, TopoServer, SequenceIdGenerator) {
        let backend = MemoryTopoBackend::new();
        let topo = TopoServer::new(Arc::new(backend.clone()));
        (backend, topo, SequenceIdGenerator::new())
    }

    #[tokio::test]
    async fn test_add_persists_and_indexes() {
        let (_, topo, ids) = setup();
        let space = Space::new(&ids, &db(), "s1", &PartitionPolicy::new("uid", "hash", 4), 1024).unwrap();
        let partitions = space.build_partitions(&ids, 4, &[]).unwrap();
        let created = space.add(&topo, partitions).await.unwrap();

        assert_eq!(created.len(), 4);
        assert!(space.version() > Version::default());
        assert_eq!(topo.get_space(100, space.id()).await.unwrap(), space.topo());
        let starts: Vec<_> = space
            .ascend_scan_partition(0, 10)
            .iter()
            .map(|p| (p.start_slot(), p.end_slot()))
            .collect();
        assert_eq!(starts, vec![(0, 256), (256, 512), (512, 768), (768, 1024)]);
        assert_eq!(space.find_partition_by_slot(600).unwrap().start_slot(), 512);
    }

    #[tokio::test]
    async fn test_failed_add_leaves_space_unpersisted() {
        let (backend, topo, ids) = setup();
        let space = Space::new(&ids, &db(), "s1", &PartitionPolicy::new("uid", "hash", 4), 1024).unwrap();
        let partitions = space.build_partitions(&ids, 4, &[]).unwrap();
        backend
            .set_faults(FaultPlan {
                fail_txn_at_op: Some(3),
                ..FaultPlan::default()
            })
            .unwrap();

        assert!(space.add(&topo, partitions).await.is_err());
        assert_eq!(backend.record_count(), 0);
        assert_eq!(space.version(), Version::default());
        assert_eq!(space.partition_count(), 0);
    }

    #[tokio::test]
    async fn test_gapped_layout_rejected() {
        let (backend, topo, ids) = setup();
        let space = Space::new(&ids, &db(), "s1", &PartitionPolicy::new("uid", "hash", 2), 100).unwrap();
        let mut partitions = space.build_partitions(&ids, 2, &[]).unwrap();
        partitions[1].start_slot += 1;
        let err = space.add(&topo, partitions).await.unwrap_err();
        assert!(matches!(err, MetaError::InvalidArgument(_)));
        assert_eq!(backend.record_count(), 0);
    }

    #[tokio::test]
    async fn test_rename_and_erase() {
        let (backend, topo, ids) = setup();
        let space = Arc::new(Space::new(&ids, &db(), "s1", &PartitionPolicy::new("uid", "hash", 2), 64).unwrap());
        let partitions = space.build_partitions(&ids, 2, &["n1:1".to_string()]).unwrap();
        space.add(&topo, partitions).await.unwrap();

        let cache = SpaceCache::new();
        cache.add(Arc::clone(&space)).unwrap();
        space.rename(&topo, &cache, "s2").await.unwrap();
        assert_eq!(space.name(), "s2");
        assert_eq!(cache.find_by_name("s2").unwrap().unwrap().id(), space.id());
        cache.verify().unwrap();
        assert_eq!(topo.get_space(100, space.id()).await.unwrap().meta.name, "s2");

        let removed = space.erase(&topo).await.unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(backend.record_count(), 0);
    }

    #[tokio::test]
    async fn test_recovery_returns_fresh_objects() {
        let (_, topo, ids) = setup();
        let space = Space::new(&ids, &db(), "s1", &PartitionPolicy::new("uid", "hash", 1), 8).unwrap();
        space.add(&topo, space.build_partitions(&ids, 1, &[]).unwrap()).await.unwrap();

        let first = SpaceCache::recovery(&topo).await.unwrap();
        let second = SpaceCache::recovery(&topo).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].topo(), second[0].topo());
        assert!(!Arc::ptr_eq(&first[0], &second[0]));
    }
}
