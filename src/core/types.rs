use serde::{Deserialize, Serialize};
use std::fmt;

pub type DbId = u64;
pub type SpaceId = u64;
pub type PartitionId = u64;
pub type ReplicaId = u64;
pub type SlotId = u32;

/// Per-record version assigned by the topology backend.
///
/// Strictly increasing for a given path; only meaningful when handed back to
/// the backend as the expected version of an update or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Version(pub u64);

impl Version {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbMeta {
    pub id: DbId,
    pub name: String,
}

/// How input records are mapped onto slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPolicy {
    pub key_field: String,
    pub key_func: String,
}

impl KeyPolicy {
    pub fn new(key_field: impl Into<String>, key_func: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
            key_func: key_func.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Default)]
pub enum SpaceStatus {
    #[default]
    Initializing,
    Ready,
    Deleting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceMeta {
    pub id: SpaceId,
    pub name: String,
    pub db_id: DbId,
    pub db_name: String,
    pub key_policy: KeyPolicy,
    pub status: SpaceStatus,
    pub slot_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Default)]
pub enum PartitionStatus {
    #[default]
    Creating,
    Serving,
    Deleting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaMeta {
    pub id: ReplicaId,
    pub partition_id: PartitionId,
    pub node_addr: String,
}

/// A shard owning the half-open slot range `[start_slot, end_slot)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub id: PartitionId,
    pub db_id: DbId,
    pub space_id: SpaceId,
    pub start_slot: SlotId,
    pub end_slot: SlotId,
    #[serde(default)]
    pub replicas: Vec<ReplicaMeta>,
    pub status: PartitionStatus,
}

impl PartitionMeta {
    pub fn contains_slot(&self, slot: SlotId) -> bool {
        slot >= self.start_slot && slot < self.end_slot
    }

    pub fn replica(&self, replica_id: ReplicaId) -> Option<&ReplicaMeta> {
        self.replicas.iter().find(|r| r.id == replica_id)
    }

    pub fn slot_len(&self) -> u32 {
        self.end_slot.saturating_sub(self.start_slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(start: SlotId, end: SlotId) -> PartitionMeta {
        PartitionMeta {
            id: 1,
            db_id: 1,
            space_id: 1,
            start_slot: start,
            end_slot: end,
            replicas: Vec::new(),
            status: PartitionStatus::Creating,
        }
    }

    #[test]
    fn test_slot_range_is_half_open() {
        let p = partition(256, 512);
        assert!(!p.contains_slot(255));
        assert!(p.contains_slot(256));
        assert!(p.contains_slot(511));
        assert!(!p.contains_slot(512));
        assert_eq!(p.slot_len(), 256);
    }

    #[test]
    fn test_version_ordering() {
        assert!(Version(3) > Version(2));
        assert_eq!(Version(7).to_string(), "v7");
    }
}
