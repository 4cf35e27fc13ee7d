use super::{PartitionTopo, TopoServer, TopoWatch, paths};
use crate::core::{PartitionId, PartitionMeta, Result, Version};

impl TopoServer {
    pub async fn get_all_partitions(&self) -> Result<Vec<PartitionTopo>> {
        self.get_all_records(paths::PARTITIONS_PATH, paths::PARTITION_TOPO_FILE)
            .await
    }

    pub async fn get_partition(&self, partition_id: PartitionId) -> Result<PartitionTopo> {
        self.get_record(&paths::partition_path(partition_id)).await
    }

    pub async fn update_partition(&self, partition: &PartitionTopo) -> Result<Version> {
        self.update_record(&paths::partition_path(partition.meta.id), partition)
            .await
    }

    pub async fn delete_partition(&self, partition: &PartitionTopo) -> Result<()> {
        self.delete_record(&paths::partition_path(partition.meta.id), partition.version)
            .await
    }

    pub async fn watch_partition(&self, partition_id: PartitionId) -> Result<TopoWatch<PartitionMeta>> {
        self.watch_record(paths::partition_path(partition_id)).await
    }
}
