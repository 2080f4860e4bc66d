use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed message stored for runs that hit the wall-clock timeout.
pub const TIMEOUT_MESSAGE: &str = "Execution timed out";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: Uuid,
    pub code: String,
}

impl Job {
    pub fn new(code: String) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Timeout,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Timeout | Self::Error)
    }
}

/// Terminal outcome of a job as written to the result store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub status: JobStatus,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl JobResult {
    pub fn done(output: String, exit_code: i64, duration_ms: u64) -> Self {
        Self {
            status: JobStatus::Done,
            output,
            exit_code: Some(exit_code),
            duration_ms,
            completed_at: Utc::now(),
        }
    }

    pub fn timeout(duration_ms: u64) -> Self {
        Self {
            status: JobStatus::Timeout,
            output: TIMEOUT_MESSAGE.to_string(),
            exit_code: None,
            duration_ms,
            completed_at: Utc::now(),
        }
    }

    pub fn error(message: impl std::fmt::Display, duration_ms: u64) -> Self {
        Self {
            status: JobStatus::Error,
            output: format!("Error: {message}"),
            exit_code: None,
            duration_ms,
            completed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    pub memory_mb: u64,
    pub cpu_quota_us: i64,
    pub cpu_period_us: i64,
    pub pids_limit: i64,
    pub timeout_ms: u64,
    pub max_output_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_mb: 128,
            cpu_quota_us: 50_000,
            cpu_period_us: 100_000,
            pids_limit: 32,
            timeout_ms: 5_000,
            max_output_bytes: 64 * 1024,
        }
    }
}

impl SandboxLimits {
    pub fn normalized(mut self) -> Self {
        self.memory_mb = self.memory_mb.clamp(32, 4096);
        self.cpu_period_us = self.cpu_period_us.clamp(1_000, 1_000_000);
        self.cpu_quota_us = self.cpu_quota_us.clamp(1_000, self.cpu_period_us * 4);
        self.pids_limit = self.pids_limit.clamp(1, 256);
        self.timeout_ms = self.timeout_ms.clamp(50, 120_000);
        self.max_output_bytes = self.max_output_bytes.clamp(1024, 4 * 1024 * 1024);
        self
    }

    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// What a caller sees when polling a job id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobView {
    pub fn without_result(job_id: Uuid, status: JobStatus) -> Self {
        Self {
            job_id,
            status,
            output: None,
            exit_code: None,
            duration_ms: None,
            completed_at: None,
        }
    }

    pub fn from_result(job_id: Uuid, result: JobResult) -> Self {
        Self {
            job_id,
            status: result.status,
            output: Some(result.output),
            exit_code: result.exit_code,
            duration_ms: Some(result.duration_ms),
            completed_at: Some(result.completed_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_limits_to_safe_bounds() {
        let normalized = SandboxLimits {
            memory_mb: 1,
            cpu_quota_us: 10_000_000,
            cpu_period_us: 100_000,
            pids_limit: 999,
            timeout_ms: 1,
            max_output_bytes: 99_000_000,
        }
        .normalized();

        assert_eq!(normalized.memory_mb, 32);
        assert_eq!(normalized.cpu_quota_us, 400_000);
        assert_eq!(normalized.pids_limit, 256);
        assert_eq!(normalized.timeout_ms, 50);
        assert_eq!(normalized.max_output_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn default_limits_match_reference_values() {
        let limits = SandboxLimits::default();
        assert_eq!(limits.memory_bytes(), 128 * 1024 * 1024);
        assert_eq!(limits.timeout().as_secs(), 5);
        assert_eq!(limits, limits.clone().normalized());
    }

    #[test]
    fn job_payload_uses_camel_case_fields() {
        let job = Job::new("print(1)".to_string());
        let raw = serde_json::to_value(&job).unwrap();
        assert_eq!(raw["code"], "print(1)");
        assert_eq!(raw["jobId"], job.job_id.to_string());
    }

    #[test]
    fn timeout_result_carries_fixed_message() {
        let result = JobResult::timeout(5_000);
        assert_eq!(result.status, JobStatus::Timeout);
        assert_eq!(result.output, TIMEOUT_MESSAGE);
        assert!(result.exit_code.is_none());
    }

    #[test]
    fn pending_view_omits_result_fields() {
        let view = JobView::without_result(Uuid::new_v4(), JobStatus::Pending);
        let raw = serde_json::to_value(&view).unwrap();
        assert_eq!(raw["status"], "pending");
        assert!(raw.get("output").is_none());
        assert!(raw.get("completedAt").is_none());
    }

    #[test]
    fn only_finished_states_are_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Timeout.is_terminal());
        assert!(JobStatus::Error.is_terminal());
    }
}
