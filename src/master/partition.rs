use super::guarded::Guarded;
use crate::core::{
    DbId, MetaError, PartitionId, PartitionMeta, PartitionStatus, ReplicaId, ReplicaMeta, Result,
    SlotId, SpaceId, Version,
};
use crate::topo::{PartitionTopo, TopoServer};
use tracing::{error, info};

/// A slot-range shard and its replica set.
///
/// Identity and slot range never change after creation; replicas and status
/// are changed through versioned updates of the partition record.
pub struct Partition {
    id: PartitionId,
    db_id: DbId,
    space_id: SpaceId,
    start_slot: SlotId,
    end_slot: SlotId,
    record: Guarded<PartitionMeta>,
}

impl Partition {
    pub fn from_topo(topo: PartitionTopo) -> Self {
        Self {
            id: topo.meta.id,
            db_id: topo.meta.db_id,
            space_id: topo.meta.space_id,
            start_slot: topo.meta.start_slot,
            end_slot: topo.meta.end_slot,
            record: Guarded::new(topo),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn db_id(&self) -> DbId {
        self.db_id
    }

    pub fn space_id(&self) -> SpaceId {
        self.space_id
    }

    pub fn start_slot(&self) -> SlotId {
        self.start_slot
    }

    pub fn end_slot(&self) -> SlotId {
        self.end_slot
    }

    pub fn contains_slot(&self, slot: SlotId) -> bool {
        slot >= self.start_slot && slot < self.end_slot
    }

    pub fn topo(&self) -> PartitionTopo {
        self.record.snapshot()
    }

    pub fn meta(&self) -> PartitionMeta {
        self.record.read(|record| record.meta.clone())
    }

    pub fn version(&self) -> Version {
        self.record.read(|record| record.version)
    }

    pub fn status(&self) -> PartitionStatus {
        self.record.read(|record| record.meta.status)
    }

    pub fn replicas(&self) -> Vec<ReplicaMeta> {
        self.record.read(|record| record.meta.replicas.clone())
    }

    pub fn replica(&self, replica_id: ReplicaId) -> Option<ReplicaMeta> {
        self.record
            .read(|record| record.meta.replica(replica_id).cloned())
    }

    /// Records `replica` as a member. A second replica on the same node, or
    /// a reused replica id, is rejected before anything is written.
    pub async fn add_replica(&self, topo: &TopoServer, replica: ReplicaMeta) -> Result<PartitionTopo> {
        let partition_id = self.id;
        let replica_id = replica.id;
        let node_addr = replica.node_addr.clone();
        let updated = self
            .record
            .update(
                move |meta| {
                    if replica.partition_id != meta.id {
                        return Err(MetaError::InvalidArgument(format!(
                            "replica {} belongs to partition {}, not {}",
                            replica.id, replica.partition_id, meta.id
                        )));
                    }
                    if meta.replica(replica.id).is_some() {
                        return Err(MetaError::AlreadyExists(format!(
                            "replica {} of partition {}",
                            replica.id, meta.id
                        )));
                    }
                    if meta.replicas.iter().any(|r| r.node_addr == replica.node_addr) {
                        return Err(MetaError::AlreadyExists(format!(
                            "partition {} already has a replica on {}",
                            meta.id, replica.node_addr
                        )));
                    }
                    meta.replicas.push(replica);
                    Ok(())
                },
                |proposed| async move { topo.update_partition(&proposed).await },
            )
            .await
            .map_err(|err| {
                error!(partition_id, replica_id, error = %err, "failed to record replica");
                err
            })?;
        info!(partition_id, replica_id, node = %node_addr, version = %updated.version, "replica recorded");
        Ok(updated)
    }

    /// Drops a replica from the member list and returns it.
    pub async fn remove_replica(&self, topo: &TopoServer, replica_id: ReplicaId) -> Result<ReplicaMeta> {
        let removed = self.replica(replica_id).ok_or_else(|| {
            MetaError::NotFound(format!("replica {} of partition {}", replica_id, self.id))
        })?;
        self.record
            .update(
                |meta| {
                    let before = meta.replicas.len();
                    meta.replicas.retain(|r| r.id != replica_id);
                    if meta.replicas.len() == before {
                        return Err(MetaError::NotFound(format!(
                            "replica {} of partition {}",
                            replica_id, meta.id
                        )));
                    }
                    Ok(())
                },
                |proposed| async move { topo.update_partition(&proposed).await },
            )
            .await
            .map_err(|err| {
                error!(partition_id = self.id, replica_id, error = %err, "failed to drop replica");
                err
            })?;
        Ok(removed)
    }

    pub async fn set_status(&self, topo: &TopoServer, status: PartitionStatus) -> Result<PartitionTopo> {
        self.record
            .update(
                |meta| {
                    meta.status = status;
                    Ok(())
                },
                |proposed| async move { topo.update_partition(&proposed).await },
            )
            .await
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("id", &self.id)
            .field("space_id", &self.space_id)
            .field("slots", &(self.start_slot..self.end_slot))
            .field("version", &self.version())
            .finish()
    }
}

/// Splits `[0, slot_count)` into `partition_count` contiguous half-open
/// ranges. The first `slot_count % partition_count` ranges get one extra slot.
pub fn split_slots(slot_count: u32, partition_count: u32) -> Result<Vec<(SlotId, SlotId)>> {
    if partition_count == 0 || partition_count > slot_count {
        return Err(MetaError::InvalidArgument(format!(
            "cannot split {} slots into {} partitions",
            slot_count, partition_count
        )));
    }
    let base = slot_count / partition_count;
    let extra = slot_count % partition_count;
    let mut ranges = Vec::with_capacity(partition_count as usize);
    let mut start = 0;
    for i in 0..partition_count {
        let len = base + u32::from(i < extra);
        ranges.push((start, start + len));
        start += len;
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topo::{MemoryTopoBackend, TopoBackend, codec, paths};
    use std::sync::Arc;

    async fn stored_partition(topo: &TopoServer) -> Partition {
        let meta = PartitionMeta {
            id: 7,
            db_id: 1,
            space_id: 2,
            start_slot: 0,
            end_slot: 256,
            replicas: Vec::new(),
            status: PartitionStatus::Creating,
        };
        let version = topo
            .backend()
            .create(&paths::partition_path(7), codec::encode(&meta).unwrap())
            .await
            .unwrap();
        Partition::from_topo(PartitionTopo::new(meta, version))
    }

    fn replica(id: ReplicaId, addr: &str) -> ReplicaMeta {
        ReplicaMeta {
            id,
            partition_id: 7,
            node_addr: addr.to_string(),
        }
    }

    #[test]
    fn test_split_slots_spreads_remainder() {
        assert_eq!(
            split_slots(1024, 4).unwrap(),
            vec![(0, 256), (256, 512), (512, 768), (768, 1024)]
        );
        assert_eq!(split_slots(10, 3).unwrap(), vec![(0, 4), (4, 7), (7, 10)]);
        assert!(split_slots(3, 4).is_err());
        assert!(split_slots(3, 0).is_err());
    }

    #[tokio::test]
    async fn test_add_and_remove_replica_persist_first() {
        let topo = TopoServer::new(Arc::new(MemoryTopoBackend::new()));
        let partition = stored_partition(&topo).await;
        let before = partition.version();

        partition.add_replica(&topo, replica(1, "n1:9000")).await.unwrap();
        assert!(partition.version() > before);
        assert_eq!(topo.get_partition(7).await.unwrap(), partition.topo());

        let removed = partition.remove_replica(&topo, 1).await.unwrap();
        assert_eq!(removed.node_addr, "n1:9000");
        assert!(topo.get_partition(7).await.unwrap().meta.replicas.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_replica_rejected_without_write() {
        let topo = TopoServer::new(Arc::new(MemoryTopoBackend::new()));
        let partition = stored_partition(&topo).await;
        partition.add_replica(&topo, replica(1, "n1:9000")).await.unwrap();
        let version = partition.version();

        let err = partition
            .add_replica(&topo, replica(2, "n1:9000"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::AlreadyExists(_)));
        assert_eq!(topo.get_partition(7).await.unwrap().version, version);
    }

    #[tokio::test]
    async fn test_stale_record_conflicts_and_keeps_memory() {
        let topo = TopoServer::new(Arc::new(MemoryTopoBackend::new()));
        let partition = stored_partition(&topo).await;

        let mut other = topo.get_partition(7).await.unwrap();
        other.meta.status = PartitionStatus::Serving;
        topo.update_partition(&other).await.unwrap();

        let err = partition
            .add_replica(&topo, replica(1, "n1:9000"))
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::VersionConflict { .. }));
        assert!(partition.replicas().is_empty());
        assert_eq!(partition.status(), PartitionStatus::Creating);
    }
}
