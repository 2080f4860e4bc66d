use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::queue::{QueueBackend, QueueError};

/// Process-local queue; jobs are gone when the process exits.
pub struct InMemoryQueueBackend {
    entries: Mutex<VecDeque<String>>,
}

impl InMemoryQueueBackend {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn push(&self, payload: String) -> Result<(), QueueError> {
        self.entries.lock().await.push_back(payload);
        Ok(())
    }

    async fn pop(&self) -> Result<Option<String>, QueueError> {
        Ok(self.entries.lock().await.pop_front())
    }
}
