//! Metadata domain objects, their caches and the `Master` that ties them to
//! the topology store and the replica dispatcher.

pub mod cache;
pub mod db;
mod guarded;
pub mod id_generator;
pub mod partition;
pub mod partition_tree;
pub mod space;

pub use cache::{CacheEntry, NamedCache};
pub use db::{Db, DbCache};
pub use id_generator::{IdGenerator, SequenceIdGenerator};
pub use partition::{Partition, split_slots};
pub use partition_tree::PartitionTree;
pub use space::{PartitionPolicy, Space, SpaceCache};

use crate::config::MasterConfig;
use crate::core::{
    MetaError, PartitionId, PartitionStatus, ReplicaId, ReplicaMeta, Result, SlotId, SpaceStatus,
};
use crate::dispatch::ReplicaDispatcher;
use crate::topo::{PartitionTopo, SpaceTopo, TopoServer};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// What `Master::recover` loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub dbs: usize,
    pub spaces: usize,
    pub partitions: usize,
    /// Space and partition records whose parent record is gone.
    pub orphans: usize,
}

/// Administrative entry point over the metadata of one cluster.
pub struct Master {
    config: MasterConfig,
    topo: TopoServer,
    ids: Arc<dyn IdGenerator>,
    dispatcher: Arc<dyn ReplicaDispatcher>,
    dbs: DbCache,
    /// Serializes DB creation, renames and deletion.
    db_admin: Mutex<()>,
}

impl Master {
    pub fn new(
        config: MasterConfig,
        topo: TopoServer,
        ids: Arc<dyn IdGenerator>,
        dispatcher: Arc<dyn ReplicaDispatcher>,
    ) -> Result<Self> {
        config.validate().map_err(MetaError::Config)?;
        Ok(Self {
            config,
            topo,
            ids,
            dispatcher,
            dbs: DbCache::new(),
            db_admin: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn topo(&self) -> &TopoServer {
        &self.topo
    }

    pub fn dbs(&self) -> &DbCache {
        &self.dbs
    }

    /// Rebuilds every cache and partition index from the store.
    ///
    /// DBs are loaded first, then spaces into their DB, then partitions into
    /// their space. The caches are swapped in only once everything loaded.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let _admin = self.db_admin.lock().await;
        let dbs = DbCache::recovery(&self.topo).await?;
        let spaces = SpaceCache::recovery(&self.topo).await?;
        let partitions = self.topo.get_all_partitions().await.map_err(|err| {
            error!(error = %err, "partition recovery scan failed");
            err
        })?;

        let mut report = RecoveryReport {
            dbs: dbs.len(),
            ..RecoveryReport::default()
        };
        let dbs_by_id: HashMap<_, _> = dbs.iter().map(|db| (db.id(), Arc::clone(db))).collect();

        let mut spaces_by_id = HashMap::new();
        for space in spaces {
            let Some(db) = dbs_by_id.get(&space.db_id()) else {
                warn!(space_id = space.id(), db_id = space.db_id(), "skipping space of unknown db");
                report.orphans += 1;
                continue;
            };
            db.spaces().add(Arc::clone(&space))?;
            spaces_by_id.insert(space.id(), space);
            report.spaces += 1;
        }

        for partition in partitions {
            let Some(space) = spaces_by_id.get(&partition.meta.space_id) else {
                warn!(
                    partition_id = partition.meta.id,
                    space_id = partition.meta.space_id,
                    "skipping partition of unknown space"
                );
                report.orphans += 1;
                continue;
            };
            space.put_partition(Arc::new(Partition::from_topo(partition)));
            report.partitions += 1;
        }

        self.dbs.restore(dbs)?;
        info!(
            dbs = report.dbs,
            spaces = report.spaces,
            partitions = report.partitions,
            orphans = report.orphans,
            "metadata recovered"
        );
        Ok(report)
    }

    pub fn find_db(&self, name: &str) -> Result<Arc<Db>> {
        self.dbs
            .find_by_name(name)?
            .ok_or_else(|| MetaError::NotFound(format!("db '{}'", name)))
    }

    pub fn all_dbs(&self) -> Vec<Arc<Db>> {
        self.dbs.all()
    }

    pub async fn create_db(&self, name: &str) -> Result<Arc<Db>> {
        if name.is_empty() {
            return Err(MetaError::InvalidArgument("db name cannot be empty".to_string()));
        }
        let _admin = self.db_admin.lock().await;
        if self.dbs.contains_name(name) {
            return Err(MetaError::AlreadyExists(format!("db '{}'", name)));
        }
        let db = Arc::new(Db::new(self.ids.as_ref(), name)?);
        db.persist(&self.topo).await?;
        if let Err(err) = self.dbs.add(Arc::clone(&db)) {
            // Rejected by the cache; withdraw our record.
            if let Err(cleanup) = db.erase(&self.topo).await {
                error!(db = name, error = %cleanup, "failed to withdraw duplicate db record");
            }
            return Err(err);
        }
        info!(db = name, db_id = db.id(), "db created");
        Ok(db)
    }

    pub async fn rename_db(&self, name: &str, new_name: &str) -> Result<Arc<Db>> {
        if new_name.is_empty() {
            return Err(MetaError::InvalidArgument("db name cannot be empty".to_string()));
        }
        let _admin = self.db_admin.lock().await;
        let db = self.find_db(name)?;
        db.rename(&self.topo, &self.dbs, new_name).await?;
        info!(db = name, new_name, db_id = db.id(), "db renamed");
        Ok(db)
    }

    /// Deletes an empty DB. A DB that still has spaces is `NotEmpty`.
    pub async fn delete_db(&self, name: &str) -> Result<()> {
        let _admin = self.db_admin.lock().await;
        let db = self.find_db(name)?;
        let _spaces = db.lock_spaces().await;
        if !db.spaces().is_empty() {
            return Err(MetaError::NotEmpty(format!(
                "db '{}' still has {} spaces",
                name,
                db.spaces().len()
            )));
        }
        db.erase(&self.topo).await?;
        self.dbs.delete(&db);
        info!(db = name, db_id = db.id(), "db deleted");
        Ok(())
    }

    /// Fails when `db` was deleted after it was looked up.
    fn ensure_registered(&self, db: &Arc<Db>) -> Result<()> {
        match self.dbs.find_by_id(db.id()) {
            Some(current) if Arc::ptr_eq(&current, db) => Ok(()),
            _ => Err(MetaError::NotFound(format!("db id {}", db.id()))),
        }
    }

    pub fn find_space(&self, db_name: &str, space_name: &str) -> Result<Arc<Space>> {
        self.find_db(db_name)?
            .spaces()
            .find_by_name(space_name)?
            .ok_or_else(|| MetaError::NotFound(format!("space '{}.{}'", db_name, space_name)))
    }

    /// Creates a space with `policy.number` partitions (the configured default
    /// when zero), each replicated on every address in `replica_nodes`.
    ///
    /// The space and its partitions are written in one transaction and only
    /// registered in memory afterwards. Nodes are not contacted; see
    /// [`Master::dispatch_space_partitions`].
    pub async fn create_space(
        &self,
        db_name: &str,
        space_name: &str,
        policy: &PartitionPolicy,
        replica_nodes: &[String],
    ) -> Result<Arc<Space>> {
        if space_name.is_empty() {
            return Err(MetaError::InvalidArgument("space name cannot be empty".to_string()));
        }
        let db = self.find_db(db_name)?;
        let _spaces = db.lock_spaces().await;
        self.ensure_registered(&db)?;
        if db.spaces().contains_name(space_name) {
            return Err(MetaError::AlreadyExists(format!("space '{}.{}'", db_name, space_name)));
        }

        let partition_count = match policy.number {
            0 => self.config.space.partition_count,
            n => n,
        };
        let ids = self.ids.as_ref();
        let space = Arc::new(Space::new(
            ids,
            &db.meta(),
            space_name,
            policy,
            self.config.space.slot_count,
        )?);
        let partitions = space.build_partitions(ids, partition_count, replica_nodes)?;
        space.add(&self.topo, partitions).await?;

        if let Err(err) = db.spaces().add(Arc::clone(&space)) {
            if let Err(cleanup) = space.erase(&self.topo).await {
                error!(space = space_name, error = %cleanup, "failed to withdraw duplicate space records");
            }
            return Err(err);
        }
        info!(
            db = db_name,
            space = space_name,
            space_id = space.id(),
            partitions = partition_count,
            "space created"
        );
        Ok(space)
    }

    pub async fn rename_space(&self, db_name: &str, name: &str, new_name: &str) -> Result<Arc<Space>> {
        if new_name.is_empty() {
            return Err(MetaError::InvalidArgument("space name cannot be empty".to_string()));
        }
        let db = self.find_db(db_name)?;
        let _spaces = db.lock_spaces().await;
        self.ensure_registered(&db)?;
        let space = db
            .spaces()
            .find_by_name(name)?
            .ok_or_else(|| MetaError::NotFound(format!("space '{}.{}'", db_name, name)))?;
        space.rename(&self.topo, db.spaces(), new_name).await?;
        info!(db = db_name, space = name, new_name, space_id = space.id(), "space renamed");
        Ok(space)
    }

    pub async fn update_space_status(
        &self,
        db_name: &str,
        space_name: &str,
        status: SpaceStatus,
    ) -> Result<SpaceTopo> {
        self.find_space(db_name, space_name)?
            .set_status(&self.topo, status)
            .await
    }

    /// Deletes a space and its partitions from the store and the caches,
    /// then asks every hosting node to drop its partitions. Node failures are
    /// logged and do not fail the call.
    pub async fn delete_space(&self, db_name: &str, space_name: &str) -> Result<()> {
        let db = self.find_db(db_name)?;
        let spaces_guard = db.lock_spaces().await;
        self.ensure_registered(&db)?;
        let space = db
            .spaces()
            .find_by_name(space_name)?
            .ok_or_else(|| MetaError::NotFound(format!("space '{}.{}'", db_name, space_name)))?;

        let partitions = space.erase(&self.topo).await?;
        db.spaces().delete(&space);
        drop(spaces_guard);
        info!(db = db_name, space = space_name, space_id = space.id(), "space deleted");

        let calls = partitions.iter().flat_map(|partition| {
            partition.replicas().into_iter().map(move |replica| {
                let dispatcher = Arc::clone(&self.dispatcher);
                let partition_id = partition.id();
                async move {
                    let result = dispatcher
                        .delete_partition(&replica.node_addr, partition_id)
                        .await;
                    (replica, result)
                }
            })
        });
        for (replica, result) in join_all(calls).await {
            if let Err(err) = result {
                warn!(
                    partition_id = replica.partition_id,
                    node = %replica.node_addr,
                    error = %err,
                    "node did not drop partition of deleted space"
                );
            }
        }
        Ok(())
    }

    pub fn ascend_scan_partition(
        &self,
        db_name: &str,
        space_name: &str,
        pivot: SlotId,
        limit: usize,
    ) -> Result<Vec<Arc<Partition>>> {
        Ok(self
            .find_space(db_name, space_name)?
            .ascend_scan_partition(pivot, limit))
    }

    /// The partition serving `slot`.
    pub fn route(&self, db_name: &str, space_name: &str, slot: SlotId) -> Result<Arc<Partition>> {
        let space = self.find_space(db_name, space_name)?;
        space.find_partition_by_slot(slot).ok_or_else(|| {
            MetaError::NotFound(format!(
                "no partition of '{}.{}' holds slot {}",
                db_name, space_name, slot
            ))
        })
    }

    fn find_partition(
        &self,
        db_name: &str,
        space_name: &str,
        partition_id: PartitionId,
    ) -> Result<Arc<Partition>> {
        self.find_space(db_name, space_name)?
            .partition(partition_id)
            .ok_or_else(|| MetaError::NotFound(format!("partition {}", partition_id)))
    }

    /// Records a new replica of a partition on `node_addr` and tells that
    /// node to start it. If the node call fails the record is withdrawn and
    /// the node error is returned.
    pub async fn add_replica(
        &self,
        db_name: &str,
        space_name: &str,
        partition_id: PartitionId,
        node_addr: &str,
    ) -> Result<ReplicaMeta> {
        let partition = self.find_partition(db_name, space_name, partition_id)?;
        let replica = ReplicaMeta {
            id: self.ids.gen_id()?,
            partition_id,
            node_addr: node_addr.to_string(),
        };
        partition.add_replica(&self.topo, replica.clone()).await?;

        if let Err(err) = self
            .dispatcher
            .add_replica(node_addr, partition_id, replica.id)
            .await
        {
            if let Err(rollback) = partition.remove_replica(&self.topo, replica.id).await {
                error!(
                    partition_id,
                    replica_id = replica.id,
                    error = %rollback,
                    "failed to withdraw replica after node rejected it"
                );
            }
            return Err(err);
        }
        Ok(replica)
    }

    /// Tells the hosting node to drop a replica, then removes it from the
    /// partition record.
    pub async fn remove_replica(
        &self,
        db_name: &str,
        space_name: &str,
        partition_id: PartitionId,
        replica_id: ReplicaId,
    ) -> Result<ReplicaMeta> {
        let partition = self.find_partition(db_name, space_name, partition_id)?;
        let replica = partition.replica(replica_id).ok_or_else(|| {
            MetaError::NotFound(format!("replica {} of partition {}", replica_id, partition_id))
        })?;
        self.dispatcher
            .remove_replica(&replica.node_addr, partition_id, replica_id)
            .await?;
        partition.remove_replica(&self.topo, replica_id).await
    }

    /// Sends `create_partition` for every replica of a space. When every node
    /// accepts, partitions move to `Serving` and the space to `Ready`.
    /// Otherwise the first node error is returned and statuses are untouched.
    pub async fn dispatch_space_partitions(&self, db_name: &str, space_name: &str) -> Result<usize> {
        let space = self.find_space(db_name, space_name)?;
        let partitions = space.partitions();

        let calls = partitions.iter().flat_map(|partition| {
            let meta = partition.meta();
            meta.replicas.clone().into_iter().map(move |replica| {
                let dispatcher = Arc::clone(&self.dispatcher);
                let meta = meta.clone();
                async move { dispatcher.create_partition(&replica.node_addr, &meta).await }
            })
        });
        let results = join_all(calls).await;
        let dispatched = results.len();
        if let Some(err) = results.into_iter().find_map(|result| result.err()) {
            error!(space = space_name, error = %err, "partition dispatch incomplete");
            return Err(err);
        }

        for partition in &partitions {
            if partition.status() != PartitionStatus::Serving {
                partition.set_status(&self.topo, PartitionStatus::Serving).await?;
            }
        }
        if space.status() != SpaceStatus::Ready {
            space.set_status(&self.topo, SpaceStatus::Ready).await?;
        }
        info!(space = space_name, calls = dispatched, "space partitions dispatched");
        Ok(dispatched)
    }

    /// Current records of every partition of a space, ascending by slot.
    pub fn partition_topos(&self, db_name: &str, space_name: &str) -> Result<Vec<PartitionTopo>> {
        Ok(self
            .find_space(db_name, space_name)?
            .partitions()
            .iter()
            .map(|partition| partition.topo())
            .collect())
    }

    pub async fn close(&self) {
        self.dispatcher.close().await;
    }
}
