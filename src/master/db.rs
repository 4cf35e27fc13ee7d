use super::cache::{CacheEntry, NamedCache};
use super::guarded::Guarded;
use super::id_generator::IdGenerator;
use super::space::SpaceCache;
use crate::core::{DbId, DbMeta, Result, Version};
use crate::topo::{DbTopo, TopoServer};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info};

/// A logical database and the spaces registered under it.
pub struct Db {
    id: DbId,
    record: Guarded<DbMeta>,
    spaces: SpaceCache,
    /// Serializes changes to the set of spaces and their names.
    space_admin: Mutex<()>,
}

pub type DbCache = NamedCache<Db>;

impl Db {
    /// A DB that has not been persisted yet, with a fresh id.
    pub fn new(ids: &dyn IdGenerator, name: &str) -> Result<Self> {
        let id = ids.gen_id().map_err(|err| {
            error!(db = name, error = %err, "failed to allocate db id");
            err
        })?;
        let meta = DbMeta {
            id,
            name: name.to_string(),
        };
        Ok(Self::from_topo(DbTopo::new(meta, Version::default())))
    }

    pub fn from_topo(topo: DbTopo) -> Self {
        Self {
            id: topo.meta.id,
            record: Guarded::new(topo),
            spaces: SpaceCache::new(),
            space_admin: Mutex::new(()),
        }
    }

    pub fn id(&self) -> DbId {
        self.id
    }

    pub fn name(&self) -> String {
        self.record.read(|record| record.meta.name.clone())
    }

    pub fn version(&self) -> Version {
        self.record.read(|record| record.version)
    }

    pub fn meta(&self) -> DbMeta {
        self.record.read(|record| record.meta.clone())
    }

    pub fn topo(&self) -> DbTopo {
        self.record.snapshot()
    }

    pub fn spaces(&self) -> &SpaceCache {
        &self.spaces
    }

    /// Held across check, persist and registration of space creation,
    /// renames and deletion, and by DB deletion.
    pub(crate) async fn lock_spaces(&self) -> MutexGuard<'_, ()> {
        self.space_admin.lock().await
    }

    /// Creates the DB record.
    pub async fn persist(&self, topo: &TopoServer) -> Result<DbTopo> {
        let (created, ()) = self
            .record
            .replace(|current| async move {
                let created = topo.add_db(&current.meta).await?;
                Ok((created, ()))
            })
            .await
            .map_err(|err| {
                error!(db_id = self.id, error = %err, "failed to persist db");
                err
            })?;
        info!(db = %created.meta.name, db_id = self.id, version = %created.version, "db persisted");
        Ok(created)
    }

    /// Renames the DB in the store, then moves it to `new_name` in `cache`
    /// and in memory in one step as seen by cache readers.
    pub async fn rename(&self, topo: &TopoServer, cache: &DbCache, new_name: &str) -> Result<DbTopo> {
        let guard = self.record.lock().await;
        cache.check_rename(self.id, new_name)?;
        let mut proposed = guard.current();
        proposed.meta.name = new_name.to_string();
        proposed.version = topo.update_db(&proposed).await.map_err(|err| {
            error!(db_id = self.id, new_name, error = %err, "failed to rename db");
            err
        })?;
        cache
            .rename_with(self.id, new_name, || guard.install(proposed.clone()))
            .map_err(|err| {
                error!(db_id = self.id, new_name, error = %err, "db renamed in store but not in cache");
                err
            })?;
        Ok(proposed)
    }

    pub async fn erase(&self, topo: &TopoServer) -> Result<()> {
        self.record
            .erase(|current| async move { topo.delete_db(&current).await })
            .await
            .map_err(|err| {
                error!(db_id = self.id, error = %err, "failed to erase db");
                err
            })
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("spaces", &self.spaces.len())
            .finish()
    }
}

impl CacheEntry for Db {
    const KIND: &'static str = "db";

    fn entry_id(&self) -> u64 {
        self.id
    }

    fn entry_name(&self) -> String {
        self.name()
    }
}

impl NamedCache<Db> {
    /// Reads every DB record and returns DB objects with empty space caches.
    /// The cache itself is not touched.
    pub async fn recovery(topo: &TopoServer) -> Result<Vec<Arc<Db>>> {
        let dbs = topo.get_all_dbs().await.map_err(|err| {
            error!(error = %err, "db recovery scan failed");
            err
        })?;
        Ok(dbs.into_iter().map(|db| Arc::new(Db::from_topo(db))).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MetaError;
    use crate::master::id_generator::SequenceIdGenerator;
    use crate::topo::MemoryTopoBackend;

    #[tokio::test]
    async fn test_persist_rename_erase() {
        let topo = TopoServer::new(Arc::new(MemoryTopoBackend::new()));
        let ids = SequenceIdGenerator::new();
        let db = Arc::new(Db::new(&ids, "d1").unwrap());
        let cache = DbCache::new();

        db.persist(&topo).await.unwrap();
        assert!(matches!(db.persist(&topo).await, Err(MetaError::AlreadyExists(_))));
        cache.add(Arc::clone(&db)).unwrap();

        db.rename(&topo, &cache, "d2").await.unwrap();
        assert_eq!(db.name(), "d2");
        assert!(cache.find_by_name("d1").unwrap().is_none());
        assert_eq!(cache.find_by_name("d2").unwrap().unwrap().id(), db.id());
        assert_eq!(topo.get_db(db.id()).await.unwrap(), db.topo());

        db.erase(&topo).await.unwrap();
        assert!(topo.get_db(db.id()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stale_rename_keeps_old_name() {
        let topo = TopoServer::new(Arc::new(MemoryTopoBackend::new()));
        let ids = SequenceIdGenerator::new();
        let db = Arc::new(Db::new(&ids, "d1").unwrap());
        let cache = DbCache::new();
        db.persist(&topo).await.unwrap();
        cache.add(Arc::clone(&db)).unwrap();

        let mut other = topo.get_db(db.id()).await.unwrap();
        other.meta.name = "elsewhere".to_string();
        topo.update_db(&other).await.unwrap();

        let err = db.rename(&topo, &cache, "d2").await.unwrap_err();
        assert!(matches!(err, MetaError::VersionConflict { .. }));
        assert_eq!(db.name(), "d1");
        assert!(cache.find_by_name("d1").unwrap().is_some());
        assert!(!cache.contains_name("d2"));
    }

    #[tokio::test]
    async fn test_recovery_is_repeatable() {
        let topo = TopoServer::new(Arc::new(MemoryTopoBackend::new()));
        let ids = SequenceIdGenerator::new();
        for name in ["a", "b", "c"] {
            Db::new(&ids, name).unwrap().persist(&topo).await.unwrap();
        }

        let first = DbCache::recovery(&topo).await.unwrap();
        let second = DbCache::recovery(&topo).await.unwrap();
        let topos = |dbs: &[Arc<Db>]| dbs.iter().map(|db| db.topo()).collect::<Vec<_>>();
        assert_eq!(topos(&first), topos(&second));
        assert_eq!(first.len(), 3);
    }
}
