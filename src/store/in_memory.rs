use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use crate::store::{ResultBackend, StoreError};

struct Entry {
    value: String,
    expires_at: Instant,
}

/// Process-local store with lazy expiry on read and a sweep on write.
pub struct InMemoryResultBackend {
    entries: DashMap<String, Entry>,
}

impl InMemoryResultBackend {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn sweep(&self, now: Instant) {
        self.entries.retain(|_, entry| entry.expires_at > now);
    }
}

#[async_trait]
impl ResultBackend for InMemoryResultBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        self.sweep(now);
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key)
            && entry.expires_at > now
        {
            return Ok(Some(entry.value.clone()));
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::InMemoryResultBackend;
    use crate::store::ResultBackend;

    #[tokio::test(start_paused = true)]
    async fn writes_sweep_expired_entries() {
        let backend = InMemoryResultBackend::new();
        backend
            .put("a", "1".to_string(), Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        backend
            .put("b", "2".to_string(), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(backend.len(), 1);
        assert_eq!(backend.get("a").await.unwrap(), None);
        assert_eq!(backend.get("b").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = InMemoryResultBackend::new();
        backend
            .put("a", "1".to_string(), Duration::from_secs(10))
            .await
            .unwrap();
        backend.delete("a").await.unwrap();
        backend.delete("a").await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), None);
    }
}
