use crate::core::{Result, Version};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Raw contents of a record together with its backend version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub contents: Vec<u8>,
    pub version: Version,
}

/// One operation of an atomic multi-path transaction.
#[derive(Debug, Clone)]
pub enum TxnOp {
    Create {
        path: String,
        contents: Vec<u8>,
    },
    Update {
        path: String,
        contents: Vec<u8>,
        expected: Version,
    },
    Delete {
        path: String,
        expected: Version,
    },
}

impl TxnOp {
    pub fn path(&self) -> &str {
        match self {
            TxnOp::Create { path, .. } | TxnOp::Update { path, .. } | TxnOp::Delete { path, .. } => {
                path
            }
        }
    }
}

/// Per-operation outcome of a committed transaction, in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOpResult {
    Create { version: Version },
    Update { version: Version },
    Delete,
}

impl TxnOpResult {
    pub fn version(&self) -> Option<Version> {
        match self {
            TxnOpResult::Create { version } | TxnOpResult::Update { version } => Some(*version),
            TxnOpResult::Delete => None,
        }
    }
}

/// Stops a backend watch. After it runs the backend drops its sender, so the
/// paired receiver yields whatever is buffered and then `None`.
pub type BackendWatchCancel = Box<dyn FnOnce() + Send>;

/// Backend half of a watch subscription.
///
/// The backend side is unbounded so that delivering a notification never
/// blocks a writer; bounding happens in the relay placed in front of consumers.
pub struct BackendWatch {
    pub changes: mpsc::UnboundedReceiver<Result<RawRecord>>,
    pub cancel: BackendWatchCancel,
}

/// Versioned hierarchical key/value store backing the topology server.
///
/// Implementations must provide per-path strictly increasing versions and
/// all-or-nothing `commit`. None of the methods retry; connectivity problems
/// are reported as `MetaError::BackendUnavailable`.
#[async_trait]
pub trait TopoBackend: Send + Sync {
    async fn get(&self, path: &str) -> Result<RawRecord>;

    async fn create(&self, path: &str, contents: Vec<u8>) -> Result<Version>;

    async fn update(&self, path: &str, contents: Vec<u8>, expected: Version) -> Result<Version>;

    async fn delete(&self, path: &str, expected: Version) -> Result<()>;

    /// Immediate children of `path`, sorted. Empty when nothing lives below it.
    async fn list_dir(&self, path: &str) -> Result<Vec<String>>;

    async fn commit(&self, ops: Vec<TxnOp>) -> Result<Vec<TxnOpResult>>;

    /// Current value plus a stream of later values. A delete of the watched
    /// record is delivered as a terminal `NotFound` error.
    async fn watch(&self, path: &str) -> Result<(RawRecord, BackendWatch)>;
}
