use anyhow::{Context, Result, anyhow};
use std::{
    env,
    net::SocketAddr,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use crate::models::SandboxLimits;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_addr: SocketAddr,
    pub run_mode: RunMode,
    pub worker_count: usize,
    pub backend: BackendConfig,
    pub result_ttl: Duration,
    pub worker: WorkerConfig,
    pub max_code_bytes: usize,
    pub sandbox: SandboxConfig,
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Api,
    Worker,
    All,
}

impl RunMode {
    pub fn runs_api(&self) -> bool {
        matches!(self, Self::Api | Self::All)
    }

    pub fn runs_workers(&self) -> bool {
        matches!(self, Self::Worker | Self::All)
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "api" => Ok(Self::Api),
            "worker" => Ok(Self::Worker),
            "all" => Ok(Self::All),
            _ => Err(format!("unsupported RUN_MODE: {s}")),
        }
    }
}

/// Where the job queue and result store live.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    InMemory,
    Redis { url: String, key_prefix: String },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub claim_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub backend: SandboxBackendKind,
    pub image: String,
    pub interpreter: String,
    pub user: String,
    pub limits: SandboxLimits,
    pub scratch_dir: PathBuf,
    pub cleanup_retries: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SandboxBackendKind {
    #[default]
    Docker,
    Process,
}

impl FromStr for SandboxBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "process" => Ok(Self::Process),
            _ => Err(format!("unsupported sandbox backend: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "compact" | "pretty" | "text" => Ok(Self::Compact),
            _ => Err(format!("unsupported LOG_FORMAT: {s}")),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so tests don't have to
    /// touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let bind_addr = var("BIND_ADDR", "0.0.0.0:3001")
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let run_mode = var("RUN_MODE", "all")
            .parse::<RunMode>()
            .map_err(|e| anyhow!(e))?;

        let backend = match var("QUEUE_BACKEND", "memory").to_ascii_lowercase().as_str() {
            "memory" | "in_memory" => BackendConfig::InMemory,
            "redis" => BackendConfig::Redis {
                url: var("REDIS_URL", "redis://127.0.0.1:6379"),
                key_prefix: var("REDIS_KEY_PREFIX", "sandbox"),
            },
            other => return Err(anyhow!("unsupported QUEUE_BACKEND: {other}")),
        };

        if matches!(backend, BackendConfig::InMemory) && run_mode != RunMode::All {
            return Err(anyhow!(
                "QUEUE_BACKEND=memory only works with RUN_MODE=all; use redis to split api and workers"
            ));
        }

        let limits = SandboxLimits {
            memory_mb: parse_env(&lookup, "SANDBOX_MEMORY_MB", 128u64),
            cpu_quota_us: parse_env(&lookup, "SANDBOX_CPU_QUOTA", 50_000i64),
            cpu_period_us: parse_env(&lookup, "SANDBOX_CPU_PERIOD", 100_000i64),
            pids_limit: parse_env(&lookup, "SANDBOX_PIDS_LIMIT", 32i64),
            timeout_ms: parse_env(&lookup, "SANDBOX_TIMEOUT_MS", 5_000u64),
            max_output_bytes: parse_env(&lookup, "SANDBOX_MAX_OUTPUT_BYTES", 64 * 1024usize),
        }
        .normalized();

        let sandbox = SandboxConfig {
            backend: var("SANDBOX_BACKEND", "docker")
                .parse::<SandboxBackendKind>()
                .map_err(|e| anyhow!(e))?,
            image: var("SANDBOX_IMAGE", "python:3.11-slim"),
            interpreter: var("SANDBOX_INTERPRETER", "python"),
            user: var("SANDBOX_USER", "1000:1000"),
            limits,
            scratch_dir: lookup("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(env::temp_dir),
            cleanup_retries: parse_env(&lookup, "CLEANUP_RETRIES", 3u32).max(1),
        };

        let worker = WorkerConfig {
            poll_interval: Duration::from_millis(parse_env(&lookup, "POLL_INTERVAL_MS", 500u64).max(10)),
            error_backoff: Duration::from_millis(parse_env(&lookup, "ERROR_BACKOFF_MS", 1_000u64).max(10)),
            claim_grace: Duration::from_secs(30),
        };

        Ok(Self {
            bind_addr,
            run_mode,
            worker_count: parse_env(&lookup, "WORKER_COUNT", 1usize).max(1),
            backend,
            result_ttl: Duration::from_secs(parse_env(&lookup, "RESULT_TTL_SECS", 300u64).max(1)),
            worker,
            max_code_bytes: parse_env(&lookup, "MAX_CODE_BYTES", 1_048_576usize).max(1),
            sandbox,
            log_level: var("LOG_LEVEL", "info"),
            log_format: var("LOG_FORMAT", "json")
                .parse::<LogFormat>()
                .map_err(|e| anyhow!(e))?,
        })
    }

    /// How long a claim marker should outlive the sandbox timeout, capped at
    /// the result TTL.
    pub fn claim_ttl(&self) -> Duration {
        (self.sandbox.limits.timeout() + self.worker.claim_grace).min(self.result_ttl)
    }
}

fn parse_env<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<EngineConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_reference_deployment() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.run_mode, RunMode::All);
        assert!(matches!(cfg.backend, BackendConfig::InMemory));
        assert_eq!(cfg.result_ttl, Duration::from_secs(300));
        assert_eq!(cfg.worker.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.sandbox.backend, SandboxBackendKind::Docker);
        assert_eq!(cfg.sandbox.image, "python:3.11-slim");
        assert_eq!(cfg.sandbox.user, "1000:1000");
        assert_eq!(cfg.sandbox.limits, SandboxLimits::default());
        assert_eq!(cfg.claim_ttl(), Duration::from_secs(35));
    }

    #[test]
    fn redis_backend_reads_url_and_prefix() {
        let cfg = config_from(&[
            ("QUEUE_BACKEND", "redis"),
            ("REDIS_URL", "redis://cache:6379"),
            ("REDIS_KEY_PREFIX", "runner"),
            ("RUN_MODE", "worker"),
        ])
        .unwrap();
        match cfg.backend {
            BackendConfig::Redis { url, key_prefix } => {
                assert_eq!(url, "redis://cache:6379");
                assert_eq!(key_prefix, "runner");
            }
            other => panic!("unexpected backend {other:?}"),
        }
        assert!(cfg.run_mode.runs_workers());
        assert!(!cfg.run_mode.runs_api());
    }

    #[test]
    fn memory_backend_requires_single_process() {
        let err = config_from(&[("RUN_MODE", "api")]).unwrap_err();
        assert!(err.to_string().contains("RUN_MODE=all"));
    }

    #[test]
    fn claim_ttl_is_capped_by_result_ttl() {
        let cfg = config_from(&[("RESULT_TTL_SECS", "10")]).unwrap();
        assert_eq!(cfg.claim_ttl(), Duration::from_secs(10));
    }

    #[test]
    fn rejects_unknown_sandbox_backend() {
        assert!(config_from(&[("SANDBOX_BACKEND", "firecracker")]).is_err());
    }

    #[test]
    fn unparseable_numbers_fall_back_to_defaults() {
        let cfg = config_from(&[("SANDBOX_TIMEOUT_MS", "soon"), ("WORKER_COUNT", "0")]).unwrap();
        assert_eq!(cfg.sandbox.limits.timeout_ms, 5_000);
        assert_eq!(cfg.worker_count, 1);
    }
}
