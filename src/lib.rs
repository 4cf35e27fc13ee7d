// ============================================================================
// shardmaster: metadata control plane for a sharded cluster
// ============================================================================

pub mod config;
pub mod core;
pub mod dispatch;
pub mod master;
pub mod topo;

// Re-export main types for convenience
pub use config::MasterConfig;
pub use core::{
    DbId, DbMeta, KeyPolicy, MetaError, PartitionId, PartitionMeta, PartitionStatus, ReplicaId,
    ReplicaMeta, Result, SlotId, SpaceId, SpaceMeta, SpaceStatus, Version,
};

// Re-export the store, domain and dispatch entry points
pub use dispatch::{
    DispatcherHolder, MemoryNodeService, NodeServer, ReplicaDispatcher, TcpConnector,
    ZoneRpcClient, global_dispatcher,
};
pub use master::{
    Db, DbCache, IdGenerator, Master, Partition, PartitionPolicy, PartitionTree,
    RecoveryReport, SequenceIdGenerator, Space, SpaceCache,
};
pub use topo::{MemoryTopoBackend, TopoBackend, TopoServer, TopoWatch, Versioned};
