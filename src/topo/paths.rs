use crate::core::{DbId, PartitionId, SpaceId};

pub const DBS_PATH: &str = "/dbs";
pub const SPACES_PATH: &str = "/spaces";
pub const PARTITIONS_PATH: &str = "/partitions";

pub const DB_TOPO_FILE: &str = "Db";
pub const SPACE_TOPO_FILE: &str = "Space";
pub const PARTITION_TOPO_FILE: &str = "Partition";

pub fn join(dir: &str, child: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), child)
}

pub fn db_path(db_id: DbId) -> String {
    join(&join(DBS_PATH, &db_id.to_string()), DB_TOPO_FILE)
}

/// Spaces are keyed by `{db_id}-{space_id}` so that a listing of the space
/// root already tells which DB each space belongs to.
pub fn space_dir_name(db_id: DbId, space_id: SpaceId) -> String {
    format!("{}-{}", db_id, space_id)
}

pub fn space_path(db_id: DbId, space_id: SpaceId) -> String {
    join(&join(SPACES_PATH, &space_dir_name(db_id, space_id)), SPACE_TOPO_FILE)
}

pub fn partition_path(partition_id: PartitionId) -> String {
    join(&join(PARTITIONS_PATH, &partition_id.to_string()), PARTITION_TOPO_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_paths() {
        assert_eq!(db_path(7), "/dbs/7/Db");
        assert_eq!(space_path(7, 12), "/spaces/7-12/Space");
        assert_eq!(partition_path(40), "/partitions/40/Partition");
        assert_eq!(join("/spaces/", "1-2"), "/spaces/1-2");
    }
}
