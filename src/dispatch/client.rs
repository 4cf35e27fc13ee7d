use super::ReplicaDispatcher;
use super::pool::{NodeClientPool, PoolStats};
use super::proto::{NodeRequest, ReplicaChangeType, RequestEnvelope, RequestHeader};
use super::transport::NodeConnector;
use crate::config::MasterConfig;
use crate::core::{MetaError, PartitionId, PartitionMeta, ReplicaId, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info};

/// Dispatcher that talks to serving nodes through a pooled transport.
///
/// Every call is bounded by the configured request timeout. Transport
/// failures, timeouts and non-OK response codes all come back as
/// `RpcInvocationFailed`; failing to obtain a client is `ClientUnavailable`.
pub struct ZoneRpcClient {
    cluster_id: String,
    request_timeout: Duration,
    pool: NodeClientPool,
}

impl ZoneRpcClient {
    pub fn new(config: &MasterConfig, connector: Arc<dyn NodeConnector>) -> Result<Self> {
        config.validate().map_err(MetaError::Config)?;
        Ok(Self {
            cluster_id: config.cluster.cluster_id.clone(),
            request_timeout: config.rpc.request_timeout,
            pool: NodeClientPool::new(connector, config.rpc.max_clients, config.rpc.idle_timeout),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn pool_stats(&self) -> Result<PoolStats> {
        self.pool.stats()
    }

    async fn invoke(&self, addr: &str, request: NodeRequest) -> Result<()> {
        let client = self.pool.get(addr).map_err(|err| {
            error!(addr, error = %err, "fail to get rpc client handle from pool");
            err
        })?;

        let op = request.name();
        let envelope = RequestEnvelope {
            header: RequestHeader::new(self.cluster_id.clone()),
            request,
        };

        match timeout(self.request_timeout, client.call(&envelope)).await {
            Err(_) => {
                error!(addr, op, timeout = ?self.request_timeout, "rpc invoke timed out");
                Err(MetaError::RpcInvocationFailed(format!(
                    "{} to {} timed out after {:?}",
                    op, addr, self.request_timeout
                )))
            }
            Ok(Err(err)) => {
                error!(addr, op, error = %err, "rpc invoke failed");
                Err(MetaError::RpcInvocationFailed(format!("{} to {}: {}", op, addr, err)))
            }
            Ok(Ok(response)) if response.is_ok() => Ok(()),
            Ok(Ok(response)) => {
                error!(addr, op, header = ?response.header, "rpc response not ok");
                Err(MetaError::RpcInvocationFailed(format!(
                    "{} to {} answered {:?}: {}",
                    op, addr, response.header.code, response.header.message
                )))
            }
        }
    }
}

#[async_trait]
impl ReplicaDispatcher for ZoneRpcClient {
    async fn create_partition(&self, addr: &str, partition: &PartitionMeta) -> Result<()> {
        info!(addr, partition_id = partition.id, "create partition");
        self.invoke(
            addr,
            NodeRequest::CreatePartition {
                partition: partition.clone(),
            },
        )
        .await
    }

    async fn delete_partition(&self, addr: &str, partition_id: PartitionId) -> Result<()> {
        info!(addr, partition_id, "delete partition");
        self.invoke(addr, NodeRequest::DeletePartition { partition_id })
            .await
    }

    async fn add_replica(&self, addr: &str, partition_id: PartitionId, replica_id: ReplicaId) -> Result<()> {
        info!(addr, partition_id, replica_id, "add replica");
        self.invoke(
            addr,
            NodeRequest::ChangeReplica {
                change: ReplicaChangeType::Add,
                partition_id,
                replica_id,
            },
        )
        .await
    }

    async fn remove_replica(
        &self,
        addr: &str,
        partition_id: PartitionId,
        replica_id: ReplicaId,
    ) -> Result<()> {
        info!(addr, partition_id, replica_id, "remove replica");
        self.invoke(
            addr,
            NodeRequest::ChangeReplica {
                change: ReplicaChangeType::Remove,
                partition_id,
                replica_id,
            },
        )
        .await
    }

    async fn close(&self) {
        if let Err(err) = self.pool.close() {
            error!(error = %err, "failed to close node client pool");
        }
        info!("zone rpc client closed");
    }
}
