pub mod in_memory;
pub mod redis_backend;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{JobResult, JobStatus, JobView};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("stored value is not valid: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// String key-value storage where every key carries its own expiry.
///
/// An expired key must read exactly like a key that was never written.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Removing a key that does not exist is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct ResultStore {
    backend: Arc<dyn ResultBackend>,
    key_prefix: String,
    ttl: Duration,
}

impl ResultStore {
    pub fn new(backend: Arc<dyn ResultBackend>, key_prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            backend,
            key_prefix: key_prefix.into(),
            ttl,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn result_key(&self, job_id: &Uuid) -> String {
        format!("{}:result:{}", self.key_prefix, job_id)
    }

    fn claim_key(&self, job_id: &Uuid) -> String {
        format!("{}:claim:{}", self.key_prefix, job_id)
    }

    /// Writes the terminal outcome of a job and drops its claim marker. The
    /// TTL starts now.
    pub async fn write_result(&self, job_id: &Uuid, result: &JobResult) -> Result<(), StoreError> {
        let value = serde_json::to_string(result)?;
        self.backend
            .put(&self.result_key(job_id), value, self.ttl)
            .await?;

        // The result is already durable; a stale marker is bounded by its TTL.
        if let Err(err) = self.backend.delete(&self.claim_key(job_id)).await {
            tracing::warn!(%job_id, error = %err, "failed to clear claim marker");
        }
        Ok(())
    }

    /// Records that a worker picked the job up. The marker expires on its own
    /// so a crashed worker leaves the job reading as `pending` again. It never
    /// outlives the result TTL.
    pub async fn mark_claimed(
        &self,
        job_id: &Uuid,
        worker: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.backend
            .put(&self.claim_key(job_id), worker.to_string(), ttl.min(self.ttl))
            .await
    }

    pub async fn lookup(&self, job_id: Uuid) -> Result<JobView, StoreError> {
        if let Some(raw) = self.backend.get(&self.result_key(&job_id)).await? {
            let result: JobResult = serde_json::from_str(&raw)?;
            return Ok(JobView::from_result(job_id, result));
        }

        if self.backend.get(&self.claim_key(&job_id)).await?.is_some() {
            return Ok(JobView::without_result(job_id, JobStatus::Running));
        }

        Ok(JobView::without_result(job_id, JobStatus::Pending))
    }
}
