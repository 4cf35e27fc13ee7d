pub mod error;
pub mod types;

pub use error::{MetaError, Result};
pub use types::{
    DbId, DbMeta, KeyPolicy, PartitionId, PartitionMeta, PartitionStatus, ReplicaId, ReplicaMeta,
    SlotId, SpaceId, SpaceMeta, SpaceStatus, Version,
};
