// Shared key/value store used for overlap mutexes and server arbitration

use crate::errors::StoreError;
use async_trait::async_trait;
use std::time::Duration;

pub mod file;
pub mod memory;
pub mod redis;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Keys live for roughly a century when callers ask for "forever".
const MAX_TTL_SECS: u64 = 100 * 365 * 86_400;

/// Expiring key/value store shared by every host running the scheduler.
///
/// All coordination state (overlap mutexes, per-minute server claims) goes
/// through this interface, so any backend that honors TTLs and atomic
/// `set_if_absent` can coordinate a fleet.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Whether a live (non-expired) entry exists for `key`.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// The stored value for `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<bool>, StoreError>;

    /// Write `value` under `key`, replacing any existing entry, expiring
    /// after `ttl`.
    async fn set(&self, key: &str, value: bool, ttl: Duration) -> Result<(), StoreError>;

    /// Write `value` under `key` only if no live entry exists. Returns
    /// whether this call claimed the key. Expired entries count as absent.
    async fn set_if_absent(&self, key: &str, value: bool, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Remove the entry for `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// TTLs are stored with whole-second resolution; sub-second requests round
/// up so a short TTL never becomes instant expiry.
pub(crate) fn ttl_to_secs(ttl: Duration) -> u64 {
    let mut secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs = secs.saturating_add(1);
    }
    secs.clamp(1, MAX_TTL_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_rounds_subseconds_up() {
        assert_eq!(ttl_to_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_to_secs(Duration::from_millis(1_200)), 2);
        assert_eq!(ttl_to_secs(Duration::from_secs(60)), 60);
    }

    #[test]
    fn test_ttl_never_zero_and_bounded() {
        assert_eq!(ttl_to_secs(Duration::from_secs(0)), 1);
        assert_eq!(ttl_to_secs(Duration::from_secs(u64::MAX)), MAX_TTL_SECS);
    }
}
