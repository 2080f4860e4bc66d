use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::JobStatus;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    submitted_total: AtomicU64,
    claimed_total: AtomicU64,
    done_total: AtomicU64,
    timed_out_total: AtomicU64,
    errored_total: AtomicU64,
    malformed_total: AtomicU64,
    queue_faults_total: AtomicU64,
    store_write_failures_total: AtomicU64,
    cleanup_failures_total: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) {
        self.submitted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn claimed(&self) {
        self.claimed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finished(&self, status: JobStatus) {
        let counter = match status {
            JobStatus::Done => &self.done_total,
            JobStatus::Timeout => &self.timed_out_total,
            JobStatus::Error => &self.errored_total,
            JobStatus::Pending | JobStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed(&self) {
        self.malformed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_fault(&self) {
        self.queue_faults_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn store_write_failed(&self) {
        self.store_write_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cleanup_failed(&self) {
        self.cleanup_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# TYPE sandbox_jobs_submitted_total counter\n",
                "sandbox_jobs_submitted_total {}\n",
                "# TYPE sandbox_jobs_claimed_total counter\n",
                "sandbox_jobs_claimed_total {}\n",
                "# TYPE sandbox_jobs_finished_total counter\n",
                "sandbox_jobs_finished_total{{status=\"done\"}} {}\n",
                "sandbox_jobs_finished_total{{status=\"timeout\"}} {}\n",
                "sandbox_jobs_finished_total{{status=\"error\"}} {}\n",
                "# TYPE sandbox_jobs_malformed_total counter\n",
                "sandbox_jobs_malformed_total {}\n",
                "# TYPE sandbox_queue_faults_total counter\n",
                "sandbox_queue_faults_total {}\n",
                "# TYPE sandbox_store_write_failures_total counter\n",
                "sandbox_store_write_failures_total {}\n",
                "# TYPE sandbox_cleanup_failures_total counter\n",
                "sandbox_cleanup_failures_total {}\n"
            ),
            self.submitted_total.load(Ordering::Relaxed),
            self.claimed_total.load(Ordering::Relaxed),
            self.done_total.load(Ordering::Relaxed),
            self.timed_out_total.load(Ordering::Relaxed),
            self.errored_total.load(Ordering::Relaxed),
            self.malformed_total.load(Ordering::Relaxed),
            self.queue_faults_total.load(Ordering::Relaxed),
            self.store_write_failures_total.load(Ordering::Relaxed),
            self.cleanup_failures_total.load(Ordering::Relaxed),
        )
    }
}
