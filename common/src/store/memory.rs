// In-process store backend, primarily for single-host runs and tests

use crate::clock::{Clock, SystemClock};
use crate::errors::StoreError;
use crate::store::{ttl_to_secs, KeyValueStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Entry {
    value: bool,
    expires_at: DateTime<Utc>,
}

/// HashMap-backed store with lazy expiry. Coordination only works between
/// tasks sharing this process, which is exactly the single-server case.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn expires_at(&self, ttl: Duration) -> DateTime<Utc> {
        self.clock.now_utc() + chrono::Duration::seconds(ttl_to_secs(ttl) as i64)
    }

    fn is_live(&self, entry: &Entry) -> bool {
        entry.expires_at > self.clock.now_utc()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<bool>, StoreError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if self.is_live(entry) => Ok(Some(entry.value)),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: bool, ttl: Duration) -> Result<(), StoreError> {
        let entry = Entry {
            value,
            expires_at: self.expires_at(ttl),
        };
        self.entries.lock().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: bool,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(key) {
            if self.is_live(existing) {
                return Ok(false);
            }
        }
        let entry = Entry {
            value,
            expires_at: self.expires_at(ttl),
        };
        entries.insert(key.to_string(), entry);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}
