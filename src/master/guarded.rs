use crate::core::{Result, Version};
use crate::topo::Versioned;
use std::future::Future;
use std::sync::{PoisonError, RwLock};
use tokio::sync::{Mutex, MutexGuard};

/// Mutable view of one persisted record.
///
/// Writers queue on `writer` for the whole persist-then-apply sequence;
/// `state` is only locked for the final swap, so readers never wait on the
/// store and never see a value the store has not accepted.
pub(crate) struct Guarded<T> {
    state: RwLock<Versioned<T>>,
    writer: Mutex<()>,
}

impl<T: Clone> Guarded<T> {
    pub(crate) fn new(record: Versioned<T>) -> Self {
        Self {
            state: RwLock::new(record),
            writer: Mutex::new(()),
        }
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&Versioned<T>) -> R) -> R {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    pub(crate) fn snapshot(&self) -> Versioned<T> {
        self.read(Clone::clone)
    }

    /// Holds off other writers until the returned guard is dropped.
    pub(crate) async fn lock(&self) -> WriteGuard<'_, T> {
        WriteGuard {
            state: &self.state,
            _writer: self.writer.lock().await,
        }
    }

    /// Applies `change` to a copy of the record, hands the copy to `persist`
    /// and installs it with the returned version once `persist` succeeds.
    pub(crate) async fn update<C, P, Fut>(&self, change: C, persist: P) -> Result<Versioned<T>>
    where
        C: FnOnce(&mut T) -> Result<()>,
        P: FnOnce(Versioned<T>) -> Fut,
        Fut: Future<Output = Result<Version>>,
    {
        let guard = self.lock().await;
        let mut proposed = guard.current();
        change(&mut proposed.meta)?;
        proposed.version = persist(proposed.clone()).await?;
        guard.install(proposed.clone());
        Ok(proposed)
    }

    /// Runs `persist` on the current record while holding off other writers,
    /// then installs the record it returns. Anything else `persist` produces
    /// is handed back to the caller.
    pub(crate) async fn replace<R, P, Fut>(&self, persist: P) -> Result<(Versioned<T>, R)>
    where
        P: FnOnce(Versioned<T>) -> Fut,
        Fut: Future<Output = Result<(Versioned<T>, R)>>,
    {
        let guard = self.lock().await;
        let (next, extra) = persist(guard.current()).await?;
        guard.install(next.clone());
        Ok((next, extra))
    }

    /// Runs a delete against the current record while holding off writers.
    pub(crate) async fn erase<P, Fut>(&self, persist: P) -> Result<()>
    where
        P: FnOnce(Versioned<T>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let guard = self.lock().await;
        persist(guard.current()).await
    }
}

/// Exclusive write access to a [`Guarded`] record.
pub(crate) struct WriteGuard<'a, T> {
    state: &'a RwLock<Versioned<T>>,
    _writer: MutexGuard<'a, ()>,
}

impl<T: Clone> WriteGuard<'_, T> {
    pub(crate) fn current(&self) -> Versioned<T> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn install(&self, next: Versioned<T>) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = next;
    }
}
