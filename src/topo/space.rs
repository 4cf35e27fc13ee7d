use super::{PartitionTopo, SpaceTopo, TopoServer, TopoWatch, TxnOp, codec, created_version, paths};
use crate::core::{DbId, MetaError, PartitionMeta, Result, SpaceId, SpaceMeta, Version};
use tracing::error;

impl TopoServer {
    pub async fn get_all_spaces(&self) -> Result<Vec<SpaceTopo>> {
        self.get_all_records(paths::SPACES_PATH, paths::SPACE_TOPO_FILE)
            .await
    }

    pub async fn get_space(&self, db_id: DbId, space_id: SpaceId) -> Result<SpaceTopo> {
        self.get_record(&paths::space_path(db_id, space_id)).await
    }

    /// Creates a space and all of its partitions in one transaction.
    ///
    /// Either every record becomes visible or none does. Results come back in
    /// the order of `partitions`.
    pub async fn add_space(
        &self,
        space: &SpaceMeta,
        partitions: &[PartitionMeta],
    ) -> Result<(SpaceTopo, Vec<PartitionTopo>)> {
        if partitions.is_empty() {
            return Err(MetaError::InvalidArgument(format!(
                "space '{}' must be created with at least one partition",
                space.name
            )));
        }

        let mut ops = Vec::with_capacity(partitions.len() + 1);
        ops.push(TxnOp::Create {
            path: paths::space_path(space.db_id, space.id),
            contents: codec::encode(space)?,
        });
        for partition in partitions {
            ops.push(TxnOp::Create {
                path: paths::partition_path(partition.id),
                contents: codec::encode(partition)?,
            });
        }

        let results = self.commit(ops).await.map_err(|err| {
            error!(space = %space.name, error = %err, "space creation transaction failed");
            err
        })?;

        let space_topo = SpaceTopo::new(space.clone(), created_version(&results[0])?);
        let partition_topos = partitions
            .iter()
            .zip(&results[1..])
            .map(|(partition, result)| {
                created_version(result).map(|version| PartitionTopo::new(partition.clone(), version))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok((space_topo, partition_topos))
    }

    pub async fn update_space(&self, space: &SpaceTopo) -> Result<Version> {
        self.update_record(&paths::space_path(space.meta.db_id, space.meta.id), space)
            .await
    }

    pub async fn delete_space(&self, space: &SpaceTopo) -> Result<()> {
        self.delete_record(
            &paths::space_path(space.meta.db_id, space.meta.id),
            space.version,
        )
        .await
    }

    /// Deletes a space record together with the given partition records in a
    /// single transaction. Every delete is checked against its version.
    pub async fn delete_space_with_partitions(
        &self,
        space: &SpaceTopo,
        partitions: &[PartitionTopo],
    ) -> Result<()> {
        if partitions.is_empty() {
            return self.delete_space(space).await;
        }
        let mut ops = Vec::with_capacity(partitions.len() + 1);
        ops.push(TxnOp::Delete {
            path: paths::space_path(space.meta.db_id, space.meta.id),
            expected: space.version,
        });
        ops.extend(partitions.iter().map(|partition| TxnOp::Delete {
            path: paths::partition_path(partition.meta.id),
            expected: partition.version,
        }));
        self.commit(ops).await.map(|_| ()).map_err(|err| {
            error!(space = %space.meta.name, error = %err, "space deletion transaction failed");
            err
        })
    }

    pub async fn watch_space(&self, db_id: DbId, space_id: SpaceId) -> Result<TopoWatch<SpaceMeta>> {
        self.watch_record(paths::space_path(db_id, space_id)).await
    }
}
