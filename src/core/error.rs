use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetaError {
    #[error("Node '{0}' not found")]
    NotFound(String),

    #[error("Node '{0}' already exists")]
    AlreadyExists(String),

    #[error("Version conflict on '{path}': expected {expected}, actual {actual}")]
    VersionConflict {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Transaction returned {actual} results for {expected} operations")]
    TransactionSizeMismatch { expected: usize, actual: usize },

    #[error("Topology backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Rpc client unavailable for '{0}'")]
    ClientUnavailable(String),

    #[error("Rpc invocation failed: {0}")]
    RpcInvocationFailed(String),

    #[error("Id generation failed: {0}")]
    IdGenerationFailed(String),

    #[error("Internal inconsistency: {0}")]
    InternalInconsistency(String),

    #[error("'{0}' is not empty")]
    NotEmpty(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl MetaError {
    /// Transient failures a caller may retry after backoff (or, for
    /// `VersionConflict`, after re-reading the record).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MetaError::BackendUnavailable(_)
                | MetaError::ClientUnavailable(_)
                | MetaError::VersionConflict { .. }
                | MetaError::RpcInvocationFailed(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MetaError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, MetaError>;

impl<T> From<std::sync::PoisonError<T>> for MetaError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for MetaError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for MetaError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for MetaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
