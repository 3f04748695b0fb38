// Redis store backend for multi-host deployments

use crate::errors::StoreError;
use crate::store::{ttl_to_secs, KeyValueStore};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::info;

/// Store backend on a shared Redis. `set_if_absent` maps to `SET NX EX`,
/// so claims are atomic on the server and TTLs are enforced there too.
pub struct RedisStore {
    manager: ConnectionManager,
    key_prefix: String,
}

fn namespaced(prefix: &str, key: &str) -> String {
    format!("{}{}", prefix, key)
}

fn encode(value: bool) -> u8 {
    u8::from(value)
}

impl RedisStore {
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::ConnectionFailed(format!("invalid redis url: {e}")))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;
        info!(key_prefix, "connected to redis store");
        Ok(Self {
            manager,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn prefixed(&self, key: &str) -> String {
        namespaced(&self.key_prefix, key)
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::ConnectionFailed(format!(
                "unexpected ping reply: {pong}"
            )))
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let found: bool = conn.exists(self.prefixed(key)).await?;
        Ok(found)
    }

    async fn get(&self, key: &str) -> Result<Option<bool>, StoreError> {
        let mut conn = self.manager.clone();
        let raw: Option<u8> = conn.get(self.prefixed(key)).await?;
        Ok(raw.map(|v| v != 0))
    }

    async fn set(&self, key: &str, value: bool, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .set_ex(self.prefixed(key), encode(value), ttl_to_secs(ttl))
            .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: bool,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.prefixed(key))
            .arg(encode(value))
            .arg("NX")
            .arg("EX")
            .arg(ttl_to_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(self.prefixed(key)).await?;
        Ok(())
    }
}
