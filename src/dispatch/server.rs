//! Node side of the lifecycle protocol.
//!
//! `NodeServer` accepts connections and feeds each request line to a
//! `NodeService`. `MemoryNodeService` keeps hosted partitions and replicas in
//! memory; it stands in for a serving node in tests and local bootstraps.

use super::proto::{NodeRequest, NodeResponse, ReplicaChangeType, RequestEnvelope, ResponseCode};
use crate::core::{MetaError, PartitionId, PartitionMeta, ReplicaId, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[async_trait]
pub trait NodeService: Send + Sync {
    async fn handle(&self, envelope: RequestEnvelope) -> NodeResponse;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedPartition {
    pub meta: PartitionMeta,
    pub replicas: BTreeSet<ReplicaId>,
}

/// In-memory node. Create and delete are idempotent; replica changes on an
/// unknown partition answer `NotFound`.
#[derive(Default)]
pub struct MemoryNodeService {
    cluster_id: Option<String>,
    partitions: Mutex<HashMap<PartitionId, HostedPartition>>,
}

impl MemoryNodeService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects requests stamped with any other cluster id.
    pub fn for_cluster(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: Some(cluster_id.into()),
            partitions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn hosted(&self, partition_id: PartitionId) -> Option<HostedPartition> {
        self.partitions.lock().await.get(&partition_id).cloned()
    }

    pub async fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<_> = self.partitions.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[async_trait]
impl NodeService for MemoryNodeService {
    async fn handle(&self, envelope: RequestEnvelope) -> NodeResponse {
        if let Some(cluster_id) = &self.cluster_id {
            if cluster_id != &envelope.header.cluster_id {
                return NodeResponse::with_code(
                    ResponseCode::ClusterMismatch,
                    format!("node belongs to cluster '{}'", cluster_id),
                );
            }
        }

        let mut partitions = self.partitions.lock().await;
        match envelope.request {
            NodeRequest::CreatePartition { partition } => {
                partitions
                    .entry(partition.id)
                    .or_insert_with(|| HostedPartition {
                        meta: partition,
                        replicas: BTreeSet::new(),
                    });
                NodeResponse::ok()
            }
            NodeRequest::DeletePartition { partition_id } => {
                partitions.remove(&partition_id);
                NodeResponse::ok()
            }
            NodeRequest::ChangeReplica {
                change,
                partition_id,
                replica_id,
            } => match partitions.get_mut(&partition_id) {
                None => NodeResponse::with_code(
                    ResponseCode::NotFound,
                    format!("partition {} is not hosted here", partition_id),
                ),
                Some(hosted) => {
                    match change {
                        ReplicaChangeType::Add => hosted.replicas.insert(replica_id),
                        ReplicaChangeType::Remove => hosted.replicas.remove(&replica_id),
                    };
                    NodeResponse::ok()
                }
            },
        }
    }
}

/// Accept loop serving one `NodeService`.
pub struct NodeServer {
    local_addr: SocketAddr,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl NodeServer {
    pub async fn bind(addr: &str, service: Arc<dyn NodeService>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| MetaError::InvalidArgument(format!("bind {}: {}", addr, err)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| MetaError::InvalidArgument(format!("local addr: {}", err)))?;
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let join_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "node connection accepted");
                            tokio::spawn(serve_connection(stream, Arc::clone(&service)));
                        }
                        Err(err) => warn!(error = %err, "node accept failed"),
                    },
                }
            }
        });

        info!(%local_addr, "node server listening");
        Ok(Self {
            local_addr,
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections. Connections already open keep being
    /// served until their peer hangs up.
    pub async fn shutdown(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.await;
        }
    }
}

impl Drop for NodeServer {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

async fn serve_connection(stream: TcpStream, service: Arc<dyn NodeService>) {
    let mut stream = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match stream.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "node connection read failed");
                break;
            }
        }

        let response = match serde_json::from_str::<RequestEnvelope>(line.trim_end()) {
            Ok(envelope) => service.handle(envelope).await,
            Err(err) => NodeResponse::with_code(ResponseCode::Rejected, err.to_string()),
        };
        let mut reply = match serde_json::to_vec(&response) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "failed to encode node response");
                break;
            }
        };
        reply.push(b'\n');
        if let Err(err) = stream.get_mut().write_all(&reply).await {
            debug!(error = %err, "node connection write failed");
            break;
        }
    }
}
