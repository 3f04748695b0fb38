// Overlap mutexes: one live key per task while a run is in flight

use crate::errors::StoreError;
use crate::store::KeyValueStore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

/// Store key for a task's overlap mutex. Hashing keeps the key stable
/// across hosts and free of characters a backend might reject.
pub fn mutex_name(task_name: &str) -> String {
    let digest = Sha256::digest(task_name.as_bytes());
    format!("task-{}", hex::encode(digest))
}

/// Mutex guarding a single task against overlapping runs.
///
/// Acquisition is a single atomic `set_if_absent`, so concurrent schedulers
/// sharing the store agree on exactly one owner. The TTL is a backstop: if
/// the owning process dies without releasing, the key expires on its own.
pub struct TaskMutex {
    store: Arc<dyn KeyValueStore>,
    key: String,
    ttl: Duration,
}

impl TaskMutex {
    pub fn new(store: Arc<dyn KeyValueStore>, task_name: &str, expires_after: Duration) -> Self {
        Self {
            store,
            key: mutex_name(task_name),
            ttl: expires_after,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Try to claim the mutex. Returns a guard when this caller won, `None`
    /// when another run already holds it.
    pub async fn acquire(&self) -> Result<Option<OverlapGuard>, StoreError> {
        let claimed = self.store.set_if_absent(&self.key, true, self.ttl).await?;
        if claimed {
            debug!(key = %self.key, ttl_seconds = self.ttl.as_secs(), "overlap mutex acquired");
            Ok(Some(OverlapGuard {
                store: self.store.clone(),
                key: self.key.clone(),
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Whether a run currently holds the mutex.
    pub async fn exists(&self) -> Result<bool, StoreError> {
        self.store.exists(&self.key).await
    }

    /// Force-release the mutex without owning a guard. Operator escape
    /// hatch for a mutex left behind by a crashed host.
    pub async fn remove(&self) -> Result<(), StoreError> {
        self.store.delete(&self.key).await
    }
}

/// Proof of mutex ownership. `release` returns the mutex eagerly; dropping
/// an unreleased guard (panic, early return) schedules the release instead,
/// and the TTL covers the case where even that cannot run.
pub struct OverlapGuard {
    store: Arc<dyn KeyValueStore>,
    key: String,
    released: bool,
}

impl OverlapGuard {
    pub async fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        let result = self.store.delete(&self.key).await;
        if result.is_ok() {
            debug!(key = %self.key, "overlap mutex released");
        }
        result
    }
}

impl Drop for OverlapGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = self.store.clone();
        let key = self.key.clone();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.delete(&key).await {
                        warn!(key = %key, error = %e, "failed to release overlap mutex on drop");
                    }
                });
            }
            Err(_) => {
                warn!(key = %key, "no runtime to release overlap mutex; ttl will reclaim it");
            }
        }
    }
}
