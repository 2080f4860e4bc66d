use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};

use crate::queue::{QueueBackend, QueueError};

/// Redis list used as a queue: producers `LPUSH`, consumers `RPOP`.
///
/// `RPOP` is atomic on the server, so a payload can only ever be handed to
/// one consumer no matter how many workers poll the same key.
pub struct RedisQueueBackend {
    manager: ConnectionManager,
    key: String,
}

impl RedisQueueBackend {
    pub fn new(manager: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            manager,
            key: queue_key(key_prefix),
        }
    }
}

pub fn queue_key(key_prefix: &str) -> String {
    format!("{key_prefix}:queue")
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn push(&self, payload: String) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.lpush(&self.key, payload).await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<String>, QueueError> {
        let mut conn = self.manager.clone();
        let payload: Option<String> = conn.rpop(&self.key, None).await?;
        Ok(payload)
    }
}
