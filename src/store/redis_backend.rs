use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};

use crate::store::{ResultBackend, StoreError};

/// Plain `SET key value EX ttl`; Redis handles expiry.
pub struct RedisResultBackend {
    manager: ConnectionManager,
}

impl RedisResultBackend {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl ResultBackend for RedisResultBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: () = conn.set_ex(key, value, ttl_secs(ttl)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }
}
