mod docker;
mod output;
mod process;
mod workspace;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    config::{SandboxBackendKind, SandboxConfig},
    models::{Job, JobResult, SandboxLimits},
};

pub use docker::{ContainerTemplate, DockerSandbox};
pub use output::{CapturedOutput, OutputBuffer};
pub use process::ProcessSandbox;
pub use workspace::{RemoveDir, ScratchWorkspace, remove_dir_all};

pub const OOM_MARKER: &str = "\n[killed: memory limit exceeded]";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to prepare scratch workspace: {0}")]
    Workspace(#[from] std::io::Error),
    #[error("sandbox runtime unavailable: {0}")]
    Unavailable(String),
    #[error("sandbox image unavailable: {0}")]
    Image(String),
    #[error("failed to create sandbox: {0}")]
    Create(String),
    #[error("failed to start sandbox: {0}")]
    Start(String),
    #[error("failed waiting for sandbox: {0}")]
    Wait(String),
    #[error("failed to collect sandbox output: {0}")]
    Logs(String),
}

/// How a sandbox run ended, before it is turned into a stored result.
#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        output: CapturedOutput,
        exit_code: i64,
        oom_killed: bool,
    },
    TimedOut,
}

/// An isolation runtime able to run one script in one throwaway environment.
///
/// `run` owns the environment it creates and must tear it down before
/// returning, whatever the outcome. The scratch directory belongs to the
/// caller.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// One-off warm-up at worker start.
    async fn prepare(&self) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn run(
        &self,
        job_id: Uuid,
        script: &Path,
        limits: &SandboxLimits,
    ) -> Result<RunOutcome, SandboxError>;
}

pub struct SandboxFactory;

impl SandboxFactory {
    pub fn from_config(config: &SandboxConfig) -> Result<Arc<dyn SandboxBackend>, SandboxError> {
        match config.backend {
            SandboxBackendKind::Docker => Ok(Arc::new(DockerSandbox::connect(
                ContainerTemplate::from_config(config),
            )?)),
            SandboxBackendKind::Process => {
                tracing::warn!(
                    "process sandbox backend selected; submissions run directly on the host without containment"
                );
                Ok(Arc::new(ProcessSandbox::new(config.interpreter.clone())))
            }
        }
    }
}

/// Result of one session plus whether its scratch space was reclaimed.
#[derive(Debug)]
pub struct SessionOutcome {
    pub result: JobResult,
    pub cleaned_up: bool,
}

/// Drives one job through materialize, execute, capture and cleanup.
pub struct SandboxExecutor {
    backend: Arc<dyn SandboxBackend>,
    limits: SandboxLimits,
    scratch_dir: PathBuf,
    cleanup_retries: u32,
    remove_dir: RemoveDir,
}

impl SandboxExecutor {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        limits: SandboxLimits,
        scratch_dir: PathBuf,
        cleanup_retries: u32,
    ) -> Self {
        Self {
            backend,
            limits,
            scratch_dir,
            cleanup_retries,
            remove_dir: remove_dir_all(),
        }
    }

    #[cfg(test)]
    pub fn with_remover(mut self, remove_dir: RemoveDir) -> Self {
        self.remove_dir = remove_dir;
        self
    }

    pub fn from_config(backend: Arc<dyn SandboxBackend>, config: &SandboxConfig) -> Self {
        Self::new(
            backend,
            config.limits.clone(),
            config.scratch_dir.clone(),
            config.cleanup_retries,
        )
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn prepare(&self) -> Result<(), SandboxError> {
        self.backend.prepare().await
    }

    pub async fn execute(&self, job: &Job) -> SessionOutcome {
        let started = Instant::now();

        let workspace = match ScratchWorkspace::create(&self.scratch_dir, &job.code).await {
            Ok(workspace) => workspace,
            Err(err) => {
                let err = SandboxError::Workspace(err);
                tracing::error!(job_id = %job.job_id, error = %err, "scratch workspace setup failed");
                return SessionOutcome {
                    result: JobResult::error(err, elapsed_ms(started)),
                    cleaned_up: true,
                };
            }
        };

        let outcome = self
            .backend
            .run(job.job_id, workspace.script_path(), &self.limits)
            .await;
        let duration_ms = elapsed_ms(started);

        let result = match outcome {
            Ok(RunOutcome::Completed {
                output,
                exit_code,
                oom_killed,
            }) => {
                let mut text = output.render();
                if oom_killed {
                    text.push_str(OOM_MARKER);
                }
                JobResult::done(text, exit_code, duration_ms)
            }
            Ok(RunOutcome::TimedOut) => JobResult::timeout(duration_ms),
            Err(err) => {
                tracing::warn!(
                    job_id = %job.job_id,
                    backend = self.backend.name(),
                    error = %err,
                    "sandbox run failed"
                );
                JobResult::error(err, duration_ms)
            }
        };

        let scratch = workspace.dir().to_path_buf();
        let cleaned_up = match workspace
            .close_with(self.cleanup_retries, &self.remove_dir)
            .await {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(
                    job_id = %job.job_id,
                    path = %scratch.display(),
                    error = %err,
                    "scratch workspace leaked after retries"
                );
                false
            }
        };

        SessionOutcome { result, cleaned_up }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
