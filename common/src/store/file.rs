// Directory-backed store for fleets sharing a network filesystem

use crate::clock::{Clock, SystemClock};
use crate::errors::StoreError;
use crate::store::{ttl_to_secs, KeyValueStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    key: String,
    value: bool,
    expires_at: DateTime<Utc>,
}

/// One JSON file per key, named by the key's SHA-256 so arbitrary key text
/// never reaches the filesystem.
///
/// Writes go to a temp file first. `set` publishes with an atomic rename;
/// `set_if_absent` publishes with `hard_link`, which fails when the target
/// exists, so a concurrent claimer never observes a half-written entry.
/// Reclaiming an expired entry is remove-then-link, so two hosts racing over
/// a key that has already expired can both claim it; live entries cannot be
/// stolen this way.
pub struct FileStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FileStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::with_clock(root, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(
        root: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StoreError::FileSystem(format!("create {}: {}", root.display(), e)))?;
        Ok(Self { root, clock })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.root.join(format!("{}.json", hex::encode(digest)))
    }

    fn tmp_path(&self, entry_path: &Path) -> PathBuf {
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let name = entry_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.root
            .join(format!("{}.{}.{}.tmp", name, std::process::id(), seq))
    }

    fn encode(&self, key: &str, value: bool, ttl: Duration) -> Result<Vec<u8>, StoreError> {
        let entry = FileEntry {
            key: key.to_string(),
            value,
            expires_at: self.clock.now_utc()
                + chrono::Duration::seconds(ttl_to_secs(ttl) as i64),
        };
        Ok(serde_json::to_vec(&entry)?)
    }

    async fn write_tmp(&self, entry_path: &Path, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let tmp = self.tmp_path(entry_path);
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StoreError::FileSystem(format!("write {}: {}", tmp.display(), e)))?;
        Ok(tmp)
    }

    /// Reads the entry for `key`, evicting it when expired or unreadable.
    /// Unreadable entries are treated as absent rather than fatal: every
    /// published file was written whole, so garbage means something outside
    /// the store touched it.
    async fn read_live(&self, key: &str) -> Result<Option<FileEntry>, StoreError> {
        let path = self.entry_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::FileSystem(format!(
                    "read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let entry: FileEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, path = %path.display(), error = %e, "removing unreadable store entry");
                self.remove_path(&path).await?;
                return Ok(None);
            }
        };

        if entry.expires_at <= self.clock.now_utc() {
            self.remove_path(&path).await?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn remove_path(&self, path: &Path) -> Result<(), StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::FileSystem(format!(
                "remove {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.read_live(key).await?.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<bool>, StoreError> {
        Ok(self.read_live(key).await?.map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: bool, ttl: Duration) -> Result<(), StoreError> {
        let path = self.entry_path(key);
        let bytes = self.encode(key, value, ttl)?;
        let tmp = self.write_tmp(&path, &bytes).await?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::FileSystem(format!("rename {}: {}", path.display(), e)))
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: bool,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let path = self.entry_path(key);

        // Two passes: the first may evict an expired entry, the second
        // settles whoever won the reclaim race.
        for _ in 0..2 {
            if self.read_live(key).await?.is_some() {
                return Ok(false);
            }

            let bytes = self.encode(key, value, ttl)?;
            let tmp = self.write_tmp(&path, &bytes).await?;
            let linked = tokio::fs::hard_link(&tmp, &path).await;
            self.remove_path(&tmp).await?;

            match linked {
                Ok(()) => return Ok(true),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(StoreError::FileSystem(format!(
                        "link {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
        Ok(false)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.remove_path(&self.entry_path(key)).await
    }
}
