pub mod in_memory;
pub mod redis_backend;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Job;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Raw FIFO storage for serialized jobs.
///
/// Implementations must hand every pushed payload to exactly one `pop` caller,
/// even when many producers and consumers race on the same queue.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn push(&self, payload: String) -> Result<(), QueueError>;

    /// Returns `None` straight away when nothing is queued.
    async fn pop(&self) -> Result<Option<String>, QueueError>;
}

/// A payload taken off the queue.
#[derive(Debug)]
pub enum Dequeued {
    Job(Job),
    Malformed { payload: String, reason: String },
}

#[derive(Clone)]
pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
}

impl JobQueue {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)?;
        self.backend.push(payload).await
    }

    pub async fn dequeue(&self) -> Result<Option<Dequeued>, QueueError> {
        let Some(payload) = self.backend.pop().await? else {
            return Ok(None);
        };
        Ok(Some(decode(payload)))
    }
}

fn decode(payload: String) -> Dequeued {
    match serde_json::from_str::<Job>(&payload) {
        Ok(job) => Dequeued::Job(job),
        Err(err) => Dequeued::Malformed {
            payload,
            reason: err.to_string(),
        },
    }
}
