//! Watch relay: turns a raw backend subscription into a typed, bounded stream.
//!
//! Each subscription gets one background task. It decodes backend
//! notifications and forwards them to the consumer through a channel of
//! `WATCH_CHANNEL_CAPACITY` entries. The first error (backend-reported or a
//! decode failure) is forwarded as a terminal event, after which the stream
//! closes.

use super::backend::{BackendWatch, BackendWatchCancel, RawRecord};
use super::codec;
use super::Versioned;
use crate::core::Result;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

pub const WATCH_CHANNEL_CAPACITY: usize = 10;

pub type WatchEvent<T> = Result<Versioned<T>>;

/// A live subscription: the value at subscription time, the change stream and
/// the handle that stops it.
pub struct TopoWatch<T> {
    pub current: Versioned<T>,
    pub changes: mpsc::Receiver<WatchEvent<T>>,
    pub cancel: WatchCancel,
}

struct CancelState {
    stop_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Cancels a watch relay.
///
/// Cloneable and safe to call from any task. `cancel` is idempotent and does
/// not return before the relay task has exited; after that the change stream
/// yields at most what was already buffered and then `None`. Dropping every
/// clone also stops the relay, without waiting for it.
#[derive(Clone)]
pub struct WatchCancel {
    state: Arc<CancelState>,
}

impl WatchCancel {
    pub async fn cancel(&self) {
        if let Ok(mut stop_tx) = self.state.stop_tx.lock() {
            if let Some(stop_tx) = stop_tx.take() {
                let _ = stop_tx.send(());
            }
        }

        // Held across the join so a concurrent caller also waits for the exit.
        let mut join_handle = self.state.join_handle.lock().await;
        if let Some(handle) = join_handle.take() {
            if let Err(err) = handle.await {
                error!(error = %err, "watch relay task failed");
            }
        }
    }

    pub async fn is_finished(&self) -> bool {
        self.state
            .join_handle
            .lock()
            .await
            .as_ref()
            .map(JoinHandle::is_finished)
            .unwrap_or(true)
    }
}

/// Decodes the initial value; on failure the backend watch is cancelled and
/// drained before the error is returned.
pub(crate) async fn decode_initial<T: DeserializeOwned>(
    path: &str,
    current: RawRecord,
    backend_watch: BackendWatch,
) -> Result<(Versioned<T>, BackendWatch)> {
    match codec::decode::<T>(&current.contents) {
        Ok(meta) => Ok((
            Versioned {
                meta,
                version: current.version,
            },
            backend_watch,
        )),
        Err(err) => {
            error!(path, error = %err, "failed to decode watched record");
            let BackendWatch {
                mut changes,
                cancel,
            } = backend_watch;
            cancel();
            while changes.recv().await.is_some() {}
            Err(err)
        }
    }
}

pub(crate) fn spawn_relay<T>(
    path: String,
    current: Versioned<T>,
    backend_watch: BackendWatch,
) -> TopoWatch<T>
where
    T: DeserializeOwned + Send + 'static,
{
    let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
    let (stop_tx, stop_rx) = oneshot::channel();
    let join_handle = tokio::spawn(relay(path, backend_watch, tx, stop_rx));

    TopoWatch {
        current,
        changes: rx,
        cancel: WatchCancel {
            state: Arc::new(CancelState {
                stop_tx: std::sync::Mutex::new(Some(stop_tx)),
                join_handle: Mutex::new(Some(join_handle)),
            }),
        },
    }
}

async fn relay<T>(
    path: String,
    backend_watch: BackendWatch,
    tx: mpsc::Sender<WatchEvent<T>>,
    mut stop_rx: oneshot::Receiver<()>,
) where
    T: DeserializeOwned + Send + 'static,
{
    let BackendWatch {
        mut changes,
        cancel,
    } = backend_watch;

    loop {
        let next = tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            next = changes.recv() => next,
        };
        let Some(next) = next else {
            break;
        };

        let (event, terminal) = match next {
            Ok(raw) => match codec::decode::<T>(&raw.contents) {
                Ok(meta) => (
                    Ok(Versioned {
                        meta,
                        version: raw.version,
                    }),
                    false,
                ),
                Err(err) => {
                    error!(path = %path, error = %err, "failed to decode watch notification");
                    (Err(err), true)
                }
            },
            Err(err) => {
                debug!(path = %path, error = %err, "watch ended by backend");
                (Err(err), true)
            }
        };

        if !forward(&tx, &mut stop_rx, event).await || terminal {
            break;
        }
    }

    stop_backend(cancel, &mut changes).await;
    debug!(path = %path, "watch relay stopped");
}

/// Sends one event, giving up if the relay is stopped while the consumer's
/// buffer is full. Returns false when the relay should exit.
async fn forward<T>(
    tx: &mpsc::Sender<WatchEvent<T>>,
    stop_rx: &mut oneshot::Receiver<()>,
    event: WatchEvent<T>,
) -> bool {
    tokio::select! {
        biased;
        _ = stop_rx => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

async fn stop_backend(
    cancel: BackendWatchCancel,
    changes: &mut mpsc::UnboundedReceiver<Result<RawRecord>>,
) {
    cancel();
    while changes.recv().await.is_some() {}
}

