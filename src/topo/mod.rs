//! Versioned topology store.
//!
//! `TopoServer` is the typed face of a `TopoBackend`: it knows where each
//! kind of record lives, encodes and decodes them, checks transaction results
//! and wraps backend watches in a relay. It never retries; every failure goes
//! straight back to the caller.

pub mod backend;
pub mod codec;
pub mod memory;
pub mod paths;
pub mod watch;

mod db;
mod partition;
mod space;

pub use backend::{BackendWatch, RawRecord, TopoBackend, TxnOp, TxnOpResult};
pub use memory::{FaultPlan, MemoryTopoBackend};
pub use watch::{TopoWatch, WATCH_CHANNEL_CAPACITY, WatchCancel, WatchEvent};

use crate::core::{DbMeta, MetaError, PartitionMeta, Result, SpaceMeta, Version};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, error};

/// A decoded record and the backend version it was read or written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub meta: T,
    pub version: Version,
}

impl<T> Versioned<T> {
    pub fn new(meta: T, version: Version) -> Self {
        Self { meta, version }
    }
}

pub type DbTopo = Versioned<DbMeta>;
pub type SpaceTopo = Versioned<SpaceMeta>;
pub type PartitionTopo = Versioned<PartitionMeta>;

#[derive(Clone)]
pub struct TopoServer {
    backend: Arc<dyn TopoBackend>,
}

impl TopoServer {
    pub fn new(backend: Arc<dyn TopoBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn TopoBackend> {
        &self.backend
    }

    async fn get_record<T: DeserializeOwned>(&self, path: &str) -> Result<Versioned<T>> {
        let raw = self.backend.get(path).await?;
        let meta = codec::decode(&raw.contents).map_err(|err| {
            error!(path, error = %err, "failed to decode topology record");
            err
        })?;
        Ok(Versioned::new(meta, raw.version))
    }

    /// Reads `{root}/{child}/{file}` for every child of `root`. Children that
    /// vanish between the listing and the read are skipped.
    async fn get_all_records<T: DeserializeOwned>(
        &self,
        root: &str,
        file: &str,
    ) -> Result<Vec<Versioned<T>>> {
        let children = self.backend.list_dir(root).await?;
        let mut records = Vec::with_capacity(children.len());
        for child in children {
            let path = paths::join(&paths::join(root, &child), file);
            match self.get_record(&path).await {
                Ok(record) => records.push(record),
                Err(MetaError::NotFound(_)) => {
                    debug!(path = %path, "record removed during scan");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(records)
    }

    async fn create_record<T: Serialize>(&self, path: &str, meta: &T) -> Result<Version> {
        let contents = codec::encode(meta)?;
        self.backend.create(path, contents).await
    }

    async fn update_record<T: Serialize>(&self, path: &str, record: &Versioned<T>) -> Result<Version> {
        let contents = codec::encode(&record.meta)?;
        self.backend.update(path, contents, record.version).await
    }

    async fn delete_record(&self, path: &str, version: Version) -> Result<()> {
        self.backend.delete(path, version).await
    }

    /// Commits `ops` and insists on one result per operation.
    ///
    /// A short or long result list means the backend broke its all-or-nothing
    /// promise; that is reported as `TransactionSizeMismatch` and never
    /// retried here.
    pub async fn commit(&self, ops: Vec<TxnOp>) -> Result<Vec<TxnOpResult>> {
        let expected = ops.len();
        let results = self.backend.commit(ops).await?;
        if results.len() != expected {
            error!(
                expected,
                actual = results.len(),
                "transaction result count does not match submitted operations"
            );
            return Err(MetaError::TransactionSizeMismatch {
                expected,
                actual: results.len(),
            });
        }
        Ok(results)
    }

    async fn watch_record<T>(&self, path: String) -> Result<TopoWatch<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (current, backend_watch) = self.backend.watch(&path).await?;
        let (current, backend_watch) =
            watch::decode_initial::<T>(&path, current, backend_watch).await?;
        Ok(watch::spawn_relay(path, current, backend_watch))
    }
}

fn created_version(result: &TxnOpResult) -> Result<Version> {
    match result {
        TxnOpResult::Create { version } => Ok(*version),
        other => Err(MetaError::InternalInconsistency(format!(
            "expected create result, got {:?}",
            other
        ))),
    }
}
