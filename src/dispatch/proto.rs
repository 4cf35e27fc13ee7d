//! Messages exchanged between the master and serving nodes.
//!
//! One JSON document per line in each direction.

use crate::core::{PartitionId, PartitionMeta, ReplicaId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub cluster_id: String,
    pub request_id: String,
}

impl RequestHeader {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            request_id: Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaChangeType {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum NodeRequest {
    CreatePartition {
        partition: PartitionMeta,
    },
    DeletePartition {
        partition_id: PartitionId,
    },
    ChangeReplica {
        change: ReplicaChangeType,
        partition_id: PartitionId,
        replica_id: ReplicaId,
    },
}

impl NodeRequest {
    pub fn name(&self) -> &'static str {
        match self {
            NodeRequest::CreatePartition { .. } => "CreatePartition",
            NodeRequest::DeletePartition { .. } => "DeletePartition",
            NodeRequest::ChangeReplica {
                change: ReplicaChangeType::Add,
                ..
            } => "ChangeReplica(add)",
            NodeRequest::ChangeReplica {
                change: ReplicaChangeType::Remove,
                ..
            } => "ChangeReplica(remove)",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub header: RequestHeader,
    pub request: NodeRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseCode {
    Ok,
    NotFound,
    ClusterMismatch,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub code: ResponseCode,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResponse {
    pub header: ResponseHeader,
}

impl NodeResponse {
    pub fn ok() -> Self {
        Self::with_code(ResponseCode::Ok, "")
    }

    pub fn with_code(code: ResponseCode, message: impl Into<String>) -> Self {
        Self {
            header: ResponseHeader {
                code,
                message: message.into(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.header.code == ResponseCode::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let envelope = RequestEnvelope {
            header: RequestHeader {
                cluster_id: "c1".to_string(),
                request_id: "r1".to_string(),
            },
            request: NodeRequest::ChangeReplica {
                change: ReplicaChangeType::Add,
                partition_id: 4,
                replica_id: 9,
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["request"]["op"], "change_replica");
        assert_eq!(json["request"]["change"], "Add");
        assert_eq!(envelope.request.name(), "ChangeReplica(add)");
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = RequestHeader::new("c1");
        let b = RequestHeader::new("c1");
        assert_ne!(a.request_id, b.request_id);
    }
}
