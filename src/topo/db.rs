use super::{DbTopo, TopoServer, TopoWatch, paths};
use crate::core::{DbId, DbMeta, Result, Version};

impl TopoServer {
    pub async fn get_all_dbs(&self) -> Result<Vec<DbTopo>> {
        self.get_all_records(paths::DBS_PATH, paths::DB_TOPO_FILE)
            .await
    }

    pub async fn get_db(&self, db_id: DbId) -> Result<DbTopo> {
        self.get_record(&paths::db_path(db_id)).await
    }

    pub async fn add_db(&self, db: &DbMeta) -> Result<DbTopo> {
        let version = self.create_record(&paths::db_path(db.id), db).await?;
        Ok(DbTopo::new(db.clone(), version))
    }

    /// Writes `db.meta` if the stored version still equals `db.version`.
    pub async fn update_db(&self, db: &DbTopo) -> Result<Version> {
        self.update_record(&paths::db_path(db.meta.id), db).await
    }

    pub async fn delete_db(&self, db: &DbTopo) -> Result<()> {
        self.delete_record(&paths::db_path(db.meta.id), db.version)
            .await
    }

    pub async fn watch_db(&self, db_id: DbId) -> Result<TopoWatch<DbMeta>> {
        self.watch_record(paths::db_path(db_id)).await
    }
}
