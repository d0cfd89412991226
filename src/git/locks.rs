//! In-process per-repository locks.
//!
//! Creation and push on the same repository are serialised; different
//! repositories never contend.  Entries are dropped from the map once the
//! last holder and waiter are gone, so the map only ever holds repositories
//! with work in flight.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

#[derive(Debug, Clone, Default)]
pub struct RepoLocks {
    inner: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Held lock on one repository.  Releases (and prunes the map entry) on drop.
pub struct RepoLockGuard {
    key: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: &str) -> RepoLockGuard {
        let mutex = self
            .inner
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        trace!(%key, "repo lock acquired");
        RepoLockGuard {
            key: key.to_string(),
            locks: Arc::clone(&self.inner),
            guard: Some(guard),
        }
    }

    /// Number of repositories with a holder or waiter.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Drop for RepoLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left means nobody is waiting.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
        trace!(key = %self.key, "repo lock released");
    }
}
