use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures_util::FutureExt;
use tokio::{sync::watch, task::JoinHandle};
use uuid::Uuid;

use crate::{
    config::WorkerConfig,
    metrics::MetricsRegistry,
    models::{Job, JobResult},
    queue::{Dequeued, JobQueue},
    sandbox::SandboxExecutor,
    store::ResultStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Processing(Uuid),
}

/// What a single dequeue attempt amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cycle {
    Empty,
    Processed(Uuid),
    Discarded,
    QueueFault,
}

/// Everything a worker talks to. Cheap to clone; shared by a pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: JobQueue,
    pub store: ResultStore,
    pub executor: Arc<SandboxExecutor>,
    pub metrics: Arc<MetricsRegistry>,
    pub config: WorkerConfig,
    pub claim_ttl: Duration,
}

pub struct Worker {
    name: String,
    queue: JobQueue,
    store: ResultStore,
    executor: Arc<SandboxExecutor>,
    metrics: Arc<MetricsRegistry>,
    config: WorkerConfig,
    claim_ttl: Duration,
    state: WorkerState,
}

impl Worker {
    pub fn new(worker_id: usize, ctx: WorkerContext) -> Self {
        Self {
            name: format!("worker-{worker_id}"),
            queue: ctx.queue,
            store: ctx.store,
            executor: ctx.executor,
            metrics: ctx.metrics,
            config: ctx.config,
            claim_ttl: ctx.claim_ttl,
            state: WorkerState::Idle,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Runs until `shutdown` flips to true. An in-flight job is always
    /// finished and its result written before the loop checks again.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            worker = %self.name,
            sandbox = self.executor.backend_name(),
            queue = self.queue.backend_name(),
            "worker started and waiting for jobs"
        );

        while !*shutdown.borrow() {
            let pause = match self.poll_once().await {
                Cycle::Processed(_) | Cycle::Discarded => continue,
                Cycle::Empty => self.config.poll_interval,
                Cycle::QueueFault => self.config.error_backoff,
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!(worker = %self.name, state = ?self.state(), "worker stopped");
    }

    /// One dequeue-process-write cycle.
    pub async fn poll_once(&mut self) -> Cycle {
        let dequeued = match self.queue.dequeue().await {
            Ok(Some(dequeued)) => dequeued,
            Ok(None) => return Cycle::Empty,
            Err(err) => {
                self.metrics.queue_fault();
                tracing::error!(worker = %self.name, error = %err, "dequeue failed");
                return Cycle::QueueFault;
            }
        };

        match dequeued {
            Dequeued::Job(job) => {
                let job_id = job.job_id;
                self.process(job).await;
                Cycle::Processed(job_id)
            }
            Dequeued::Malformed { payload, reason } => {
                self.metrics.malformed();
                tracing::error!(
                    worker = %self.name,
                    reason = %reason,
                    payload = %truncate_for_log(&payload),
                    "discarding invalid job payload"
                );
                Cycle::Discarded
            }
        }
    }

    async fn process(&mut self, job: Job) {
        self.state = WorkerState::Processing(job.job_id);
        self.metrics.claimed();
        tracing::info!(worker = %self.name, job_id = %job.job_id, "picked job");

        if let Err(err) = self
            .store
            .mark_claimed(&job.job_id, &self.name, self.claim_ttl)
            .await
        {
            tracing::warn!(job_id = %job.job_id, error = %err, "failed to write claim marker");
        }

        let session = AssertUnwindSafe(self.executor.execute(&job))
            .catch_unwind()
            .await;

        let result = match session {
            Ok(session) => {
                if !session.cleaned_up {
                    self.metrics.cleanup_failed();
                }
                session.result
            }
            Err(_) => {
                tracing::error!(worker = %self.name, job_id = %job.job_id, "sandbox executor panicked");
                JobResult::error("sandbox executor crashed", 0)
            }
        };

        debug_assert!(result.status.is_terminal());
        self.metrics.finished(result.status);
        match self.store.write_result(&job.job_id, &result).await {
            Ok(()) => tracing::info!(
                worker = %self.name,
                job_id = %job.job_id,
                status = result.status.as_str(),
                duration_ms = result.duration_ms,
                "job finished"
            ),
            Err(err) => {
                self.metrics.store_write_failed();
                tracing::error!(
                    worker = %self.name,
                    job_id = %job.job_id,
                    status = result.status.as_str(),
                    error = %err,
                    "failed to store job result"
                );
            }
        }

        self.state = WorkerState::Idle;
    }
}

fn truncate_for_log(payload: &str) -> &str {
    match payload.char_indices().nth(200) {
        Some((idx, _)) => &payload[..idx],
        None => payload,
    }
}

pub fn spawn_worker_pool(
    workers: usize,
    ctx: WorkerContext,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|worker_id| {
            let worker = Worker::new(worker_id, ctx.clone());
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}
