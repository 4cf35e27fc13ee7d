//! Replica lifecycle dispatcher: turns metadata changes into commands on the
//! serving nodes.

pub mod client;
pub mod pool;
pub mod proto;
pub mod server;
pub mod singleton;
pub mod transport;

pub use client::ZoneRpcClient;
pub use pool::{NodeClient, NodeClientPool, PoolStats};
pub use proto::{
    NodeRequest, NodeResponse, ReplicaChangeType, RequestEnvelope, RequestHeader, ResponseCode,
    ResponseHeader,
};
pub use server::{HostedPartition, MemoryNodeService, NodeServer, NodeService};
pub use singleton::{DispatcherHolder, global_dispatcher};
pub use transport::{NodeConnector, NodeTransport, TcpConnector, TcpNodeTransport, TransportError};

use crate::core::{PartitionId, PartitionMeta, ReplicaId, Result};
use async_trait::async_trait;

/// Commands sent to the node hosting (or about to host) a partition.
///
/// Implementations do not retry. Callers cannot tell a transport failure from
/// an application-level rejection: both are `RpcInvocationFailed`.
#[async_trait]
pub trait ReplicaDispatcher: Send + Sync {
    async fn create_partition(&self, addr: &str, partition: &PartitionMeta) -> Result<()>;

    async fn delete_partition(&self, addr: &str, partition_id: PartitionId) -> Result<()>;

    async fn add_replica(&self, addr: &str, partition_id: PartitionId, replica_id: ReplicaId) -> Result<()>;

    async fn remove_replica(
        &self,
        addr: &str,
        partition_id: PartitionId,
        replica_id: ReplicaId,
    ) -> Result<()>;

    async fn close(&self);
}
