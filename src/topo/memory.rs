//! In-process topology backend.
//!
//! Keeps every record in one ordered map guarded by a mutex, hands out
//! versions from a single revision counter (so versions are strictly
//! increasing per path and globally), and fans change notifications out to
//! watchers. Fault hooks let tests simulate an unreachable backend or a
//! transaction that dies halfway.

use super::backend::{BackendWatch, RawRecord, TopoBackend, TxnOp, TxnOpResult};
use crate::core::{MetaError, Result, Version};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

type WatchSender = mpsc::UnboundedSender<Result<RawRecord>>;

#[derive(Debug, Clone)]
struct StoredNode {
    contents: Vec<u8>,
    version: Version,
}

#[derive(Default)]
struct BackendState {
    nodes: BTreeMap<String, StoredNode>,
    watchers: HashMap<String, Vec<(u64, WatchSender)>>,
    revision: u64,
    next_watch_id: u64,
}

impl BackendState {
    fn next_version(&mut self) -> Version {
        self.revision += 1;
        Version(self.revision)
    }

    fn notify_changed(&mut self, path: &str, node: &StoredNode) {
        if let Some(watchers) = self.watchers.get_mut(path) {
            let record = RawRecord {
                contents: node.contents.clone(),
                version: node.version,
            };
            watchers.retain(|(_, tx)| tx.send(Ok(record.clone())).is_ok());
        }
    }

    fn notify_deleted(&mut self, path: &str) {
        if let Some(watchers) = self.watchers.remove(path) {
            for (_, tx) in watchers {
                let _ = tx.send(Err(MetaError::NotFound(path.to_string())));
            }
        }
    }

    fn check_version(path: &str, node: Option<&StoredNode>, expected: Version) -> Result<()> {
        let node = node.ok_or_else(|| MetaError::NotFound(path.to_string()))?;
        if node.version != expected {
            return Err(MetaError::VersionConflict {
                path: path.to_string(),
                expected: expected.as_u64(),
                actual: node.version.as_u64(),
            });
        }
        Ok(())
    }
}

/// Knobs for simulating backend trouble.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Every call fails with `BackendUnavailable`.
    pub unavailable: bool,
    /// The next transaction fails while processing the operation at this index;
    /// nothing from that transaction is applied. Cleared once it fires.
    pub fail_txn_at_op: Option<usize>,
    /// Committed transactions report at most this many results.
    pub truncate_txn_results: Option<usize>,
}

#[derive(Clone, Default)]
pub struct MemoryTopoBackend {
    state: Arc<Mutex<BackendState>>,
    faults: Arc<Mutex<FaultPlan>>,
}

impl MemoryTopoBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_faults(&self, plan: FaultPlan) -> Result<()> {
        *self.faults.lock()? = plan;
        Ok(())
    }

    pub fn set_unavailable(&self, unavailable: bool) -> Result<()> {
        self.faults.lock()?.unavailable = unavailable;
        Ok(())
    }

    /// Number of live watch registrations on `path`.
    pub fn watcher_count(&self, path: &str) -> usize {
        self.state
            .lock()
            .map(|state| state.watchers.get(path).map(Vec::len).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().map(|state| state.nodes.len()).unwrap_or(0)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.faults.lock()?.unavailable {
            return Err(MetaError::BackendUnavailable(
                "memory backend marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TopoBackend for MemoryTopoBackend {
    async fn get(&self, path: &str) -> Result<RawRecord> {
        self.ensure_available()?;
        let state = self.state.lock()?;
        state
            .nodes
            .get(path)
            .map(|node| RawRecord {
                contents: node.contents.clone(),
                version: node.version,
            })
            .ok_or_else(|| MetaError::NotFound(path.to_string()))
    }

    async fn create(&self, path: &str, contents: Vec<u8>) -> Result<Version> {
        self.ensure_available()?;
        let mut state = self.state.lock()?;
        if state.nodes.contains_key(path) {
            return Err(MetaError::AlreadyExists(path.to_string()));
        }
        let node = StoredNode {
            contents,
            version: state.next_version(),
        };
        state.nodes.insert(path.to_string(), node.clone());
        state.notify_changed(path, &node);
        Ok(node.version)
    }

    async fn update(&self, path: &str, contents: Vec<u8>, expected: Version) -> Result<Version> {
        self.ensure_available()?;
        let mut state = self.state.lock()?;
        BackendState::check_version(path, state.nodes.get(path), expected)?;
        let node = StoredNode {
            contents,
            version: state.next_version(),
        };
        state.nodes.insert(path.to_string(), node.clone());
        state.notify_changed(path, &node);
        Ok(node.version)
    }

    async fn delete(&self, path: &str, expected: Version) -> Result<()> {
        self.ensure_available()?;
        let mut state = self.state.lock()?;
        BackendState::check_version(path, state.nodes.get(path), expected)?;
        state.nodes.remove(path);
        state.notify_deleted(path);
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let state = self.state.lock()?;
        let children: BTreeSet<String> = state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| key[prefix.len()..].split('/').next().map(str::to_string))
            .filter(|child| !child.is_empty())
            .collect();
        Ok(children.into_iter().collect())
    }

    async fn commit(&self, ops: Vec<TxnOp>) -> Result<Vec<TxnOpResult>> {
        self.ensure_available()?;
        let (fail_at, truncate) = {
            let mut faults = self.faults.lock()?;
            (faults.fail_txn_at_op.take(), faults.truncate_txn_results)
        };

        let mut state = self.state.lock()?;

        // Validate every op against a staged overlay first; nothing touches
        // `state.nodes` until the whole batch is known to succeed.
        let mut staged: BTreeMap<String, Option<StoredNode>> = BTreeMap::new();
        let mut revision = state.revision;
        let mut results = Vec::with_capacity(ops.len());
        for (index, op) in ops.into_iter().enumerate() {
            if fail_at == Some(index) {
                debug!(index, "injected transaction failure");
                return Err(MetaError::BackendUnavailable(format!(
                    "injected failure at transaction op {}",
                    index
                )));
            }
            let path = op.path().to_string();
            let current = match staged.get(&path) {
                Some(entry) => entry.clone(),
                None => state.nodes.get(&path).cloned(),
            };
            match op {
                TxnOp::Create { contents, .. } => {
                    if current.is_some() {
                        return Err(MetaError::AlreadyExists(path));
                    }
                    revision += 1;
                    let version = Version(revision);
                    staged.insert(path, Some(StoredNode { contents, version }));
                    results.push(TxnOpResult::Create { version });
                }
                TxnOp::Update {
                    contents, expected, ..
                } => {
                    BackendState::check_version(&path, current.as_ref(), expected)?;
                    revision += 1;
                    let version = Version(revision);
                    staged.insert(path, Some(StoredNode { contents, version }));
                    results.push(TxnOpResult::Update { version });
                }
                TxnOp::Delete { expected, .. } => {
                    BackendState::check_version(&path, current.as_ref(), expected)?;
                    staged.insert(path, None);
                    results.push(TxnOpResult::Delete);
                }
            }
        }

        state.revision = revision;
        for (path, entry) in staged {
            match entry {
                Some(node) => {
                    state.nodes.insert(path.clone(), node.clone());
                    state.notify_changed(&path, &node);
                }
                None => {
                    state.nodes.remove(&path);
                    state.notify_deleted(&path);
                }
            }
        }

        if let Some(limit) = truncate {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn watch(&self, path: &str) -> Result<(RawRecord, BackendWatch)> {
        self.ensure_available()?;
        let mut state = self.state.lock()?;
        let current = state
            .nodes
            .get(path)
            .map(|node| RawRecord {
                contents: node.contents.clone(),
                version: node.version,
            })
            .ok_or_else(|| MetaError::NotFound(path.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        state.next_watch_id += 1;
        let watch_id = state.next_watch_id;
        state
            .watchers
            .entry(path.to_string())
            .or_default()
            .push((watch_id, tx));

        let shared = Arc::clone(&self.state);
        let watched = path.to_string();
        let cancel = Box::new(move || {
            if let Ok(mut state) = shared.lock() {
                if let Some(watchers) = state.watchers.get_mut(&watched) {
                    watchers.retain(|(id, _)| *id != watch_id);
                    if watchers.is_empty() {
                        state.watchers.remove(&watched);
                    }
                }
            }
        });

        Ok((
            current,
            BackendWatch {
                changes: rx,
                cancel,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_requires_current_version() {
        let backend = MemoryTopoBackend::new();
        let v1 = backend.create("/a/x", b"1".to_vec()).await.unwrap();
        let v2 = backend.update("/a/x", b"2".to_vec(), v1).await.unwrap();
        assert!(v2 > v1);

        let err = backend.update("/a/x", b"3".to_vec(), v1).await.unwrap_err();
        assert!(matches!(err, MetaError::VersionConflict { .. }));
        assert_eq!(backend.get("/a/x").await.unwrap().contents, b"2".to_vec());
    }

    #[tokio::test]
    async fn test_create_rejects_occupied_path() {
        let backend = MemoryTopoBackend::new();
        backend.create("/a", b"1".to_vec()).await.unwrap();
        let err = backend.create("/a", b"1".to_vec()).await.unwrap_err();
        assert_eq!(err, MetaError::AlreadyExists("/a".to_string()));
    }

    #[tokio::test]
    async fn test_list_dir_returns_immediate_children() {
        let backend = MemoryTopoBackend::new();
        backend.create("/spaces/1-2/Space", vec![]).await.unwrap();
        backend.create("/spaces/1-3/Space", vec![]).await.unwrap();
        backend.create("/spacesx/9/Space", vec![]).await.unwrap();
        assert_eq!(backend.list_dir("/spaces").await.unwrap(), vec!["1-2", "1-3"]);
        assert!(backend.list_dir("/dbs").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_transaction_applies_nothing() {
        let backend = MemoryTopoBackend::new();
        backend.create("/b", b"old".to_vec()).await.unwrap();

        let ops = vec![
            TxnOp::Create {
                path: "/a".to_string(),
                contents: vec![],
            },
            TxnOp::Create {
                path: "/b".to_string(),
                contents: vec![],
            },
        ];
        let err = backend.commit(ops).await.unwrap_err();
        assert!(matches!(err, MetaError::AlreadyExists(_)));
        assert!(backend.get("/a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let backend = MemoryTopoBackend::new();
        backend.set_unavailable(true).unwrap();
        let err = backend.get("/a").await.unwrap_err();
        assert!(matches!(err, MetaError::BackendUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_watch_cancel_closes_backend_stream() {
        let backend = MemoryTopoBackend::new();
        let v1 = backend.create("/w", b"1".to_vec()).await.unwrap();
        let (current, mut watch) = backend.watch("/w").await.unwrap();
        assert_eq!(current.version, v1);
        assert_eq!(backend.watcher_count("/w"), 1);

        backend.update("/w", b"2".to_vec(), v1).await.unwrap();
        (watch.cancel)();
        assert_eq!(backend.watcher_count("/w"), 0);

        let buffered = watch.changes.recv().await.unwrap().unwrap();
        assert_eq!(buffered.contents, b"2".to_vec());
        assert!(watch.changes.recv().await.is_none());
    }
}
