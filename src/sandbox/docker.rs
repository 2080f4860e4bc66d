use std::{collections::HashMap, path::Path};

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
        LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions,
        WaitContainerOptions,
    },
    errors::Error as DockerError,
    image::CreateImageOptions,
    models::HostConfig,
};
use futures_util::StreamExt;
use uuid::Uuid;

use crate::{
    config::SandboxConfig,
    models::SandboxLimits,
    sandbox::{CapturedOutput, OutputBuffer, RunOutcome, SandboxBackend, SandboxError},
};

const CONTAINER_SCRIPT_PATH: &str = "/code/script.py";

/// Static part of every sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerTemplate {
    pub image: String,
    pub interpreter: String,
    pub user: String,
}

impl ContainerTemplate {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            image: config.image.clone(),
            interpreter: config.interpreter.clone(),
            user: config.user.clone(),
        }
    }

    /// Container spec for one run: no network, capped memory/CPU/pids, no
    /// capabilities, unprivileged user, read-only rootfs, script mounted
    /// read-only, nothing attached to stdin.
    pub fn config(&self, script: &Path, limits: &SandboxLimits) -> Config<String> {
        let memory = limits.memory_bytes();
        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{CONTAINER_SCRIPT_PATH}:ro",
                script.display()
            )]),
            network_mode: Some("none".to_string()),
            memory: Some(memory),
            memory_swap: Some(memory),
            cpu_quota: Some(limits.cpu_quota_us),
            cpu_period: Some(limits.cpu_period_us),
            pids_limit: Some(limits.pids_limit),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_string(),
                "rw,noexec,nosuid,size=16m".to_string(),
            )])),
            auto_remove: Some(false),
            ..Default::default()
        };

        Config {
            image: Some(self.image.clone()),
            cmd: Some(vec![
                self.interpreter.clone(),
                CONTAINER_SCRIPT_PATH.to_string(),
            ]),
            user: Some(self.user.clone()),
            working_dir: Some("/tmp".to_string()),
            env: Some(vec!["PYTHONDONTWRITEBYTECODE=1".to_string()]),
            tty: Some(false),
            open_stdin: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

pub struct DockerSandbox {
    docker: Docker,
    template: ContainerTemplate,
}

impl DockerSandbox {
    pub fn connect(template: ContainerTemplate) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Unavailable(e.to_string()))?;
        Ok(Self { docker, template })
    }

    async fn ensure_image(&self) -> Result<(), SandboxError> {
        if self.docker.inspect_image(&self.template.image).await.is_ok() {
            return Ok(());
        }

        tracing::info!(image = %self.template.image, "pulling sandbox image");
        let options = Some(CreateImageOptions {
            from_image: self.template.image.as_str(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| SandboxError::Image(e.to_string()))?;
        }
        Ok(())
    }

    /// Start, wait, collect. The caller removes the container afterwards.
    async fn drive(&self, id: &str, limits: &SandboxLimits) -> Result<RunOutcome, SandboxError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Start(e.to_string()))?;

        let waited = tokio::time::timeout(limits.timeout(), self.wait_exit(id)).await;
        let exit_code = match waited {
            Ok(code) => code?,
            Err(_) => {
                if let Err(err) = self
                    .docker
                    .kill_container(id, None::<KillContainerOptions<String>>)
                    .await
                {
                    tracing::debug!(container = %id, error = %err, "kill after timeout failed");
                }
                return Ok(RunOutcome::TimedOut);
            }
        };

        let output = self.collect_logs(id, limits.max_output_bytes).await?;
        let oom_killed = self.was_oom_killed(id).await;

        Ok(RunOutcome::Completed {
            output,
            exit_code,
            oom_killed,
        })
    }

    async fn wait_exit(&self, id: &str) -> Result<i64, SandboxError> {
        let mut stream = self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit status as an error
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(err)) => Err(SandboxError::Wait(err.to_string())),
            None => Err(SandboxError::Wait(
                "wait stream ended without an exit status".to_string(),
            )),
        }
    }

    async fn collect_logs(
        &self,
        id: &str,
        limit: usize,
    ) -> Result<CapturedOutput, SandboxError> {
        let mut buffer = OutputBuffer::new(limit);
        let mut logs = self.docker.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: false,
                ..Default::default()
            }),
        );
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message })
                | Ok(LogOutput::StdErr { message })
                | Ok(LogOutput::Console { message }) => buffer.push(&message),
                Ok(LogOutput::StdIn { .. }) => {}
                Err(err) => return Err(SandboxError::Logs(err.to_string())),
            }
        }
        Ok(buffer.finish())
    }

    async fn was_oom_killed(&self, id: &str) -> bool {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info
                .state
                .and_then(|state| state.oom_killed)
                .unwrap_or(false),
            Err(err) => {
                tracing::debug!(container = %id, error = %err, "inspect after exit failed");
                false
            }
        }
    }

    async fn remove(&self, id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        if let Err(err) = self.docker.remove_container(id, Some(options)).await {
            tracing::error!(container = %id, error = %err, "failed to remove sandbox container");
        }
    }
}

#[async_trait]
impl SandboxBackend for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn prepare(&self) -> Result<(), SandboxError> {
        self.docker
            .ping()
            .await
            .map_err(|e| SandboxError::Unavailable(e.to_string()))?;
        self.ensure_image().await
    }

    async fn run(
        &self,
        job_id: Uuid,
        script: &Path,
        limits: &SandboxLimits,
    ) -> Result<RunOutcome, SandboxError> {
        let name = format!("codesandbox-{}", job_id.as_simple());
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                self.template.config(script, limits),
            )
            .await
            .map_err(|e| SandboxError::Create(e.to_string()))?;

        tracing::debug!(%job_id, container = %created.id, "sandbox container created");
        let outcome = self.drive(&created.id, limits).await;
        self.remove(&created.id).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Arc};

    use super::{CONTAINER_SCRIPT_PATH, ContainerTemplate, DockerSandbox};
    use crate::{
        models::{Job, JobStatus, SandboxLimits, TIMEOUT_MESSAGE},
        sandbox::{SandboxBackend, SandboxExecutor},
    };

    fn template() -> ContainerTemplate {
        ContainerTemplate {
            image: "python:3.11-slim".to_string(),
            interpreter: "python".to_string(),
            user: "1000:1000".to_string(),
        }
    }

    #[test]
    fn container_is_locked_down() {
        let config = template().config(
            Path::new("/tmp/codesandbox-abc/script.py"),
            &SandboxLimits::default(),
        );
        let host = config.host_config.clone().unwrap();

        assert_eq!(config.network_disabled, Some(true));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.memory, Some(128 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.cpu_quota, Some(50_000));
        assert_eq!(host.cpu_period, Some(100_000));
        assert_eq!(host.pids_limit, Some(32));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(host.security_opt, Some(vec!["no-new-privileges".to_string()]));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(config.user.as_deref(), Some("1000:1000"));
        assert_eq!(config.open_stdin, Some(false));
        assert_eq!(config.tty, Some(false));
    }

    #[test]
    fn script_is_mounted_read_only() {
        let config = template().config(
            Path::new("/tmp/codesandbox-abc/script.py"),
            &SandboxLimits::default(),
        );
        let binds = config.host_config.unwrap().binds.unwrap();
        assert_eq!(
            binds,
            vec![format!("/tmp/codesandbox-abc/script.py:{CONTAINER_SCRIPT_PATH}:ro")]
        );
        assert_eq!(
            config.cmd,
            Some(vec!["python".to_string(), CONTAINER_SCRIPT_PATH.to_string()])
        );
    }

    #[test]
    fn limits_flow_into_host_config() {
        let limits = SandboxLimits {
            memory_mb: 256,
            pids_limit: 64,
            ..SandboxLimits::default()
        };
        let host = template()
            .config(Path::new("/s/script.py"), &limits)
            .host_config
            .unwrap();
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.pids_limit, Some(64));
    }

    #[tokio::test]
    #[ignore = "needs a local Docker daemon and the python:3.11-slim image"]
    async fn isolation_holds_against_a_real_daemon() {
        let sandbox = DockerSandbox::connect(template()).unwrap();
        sandbox.prepare().await.unwrap();
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(
            Arc::new(sandbox),
            SandboxLimits::default(),
            root.path().to_path_buf(),
            3,
        );

        let hello = executor
            .execute(&Job::new("print(\"Hello, World!\")\n".to_string()))
            .await;
        assert_eq!(hello.result.status, JobStatus::Done);
        assert_eq!(hello.result.output, "Hello, World!\n");
        assert_eq!(hello.result.exit_code, Some(0));

        let spin = executor
            .execute(&Job::new("while True: pass\n".to_string()))
            .await;
        assert_eq!(spin.result.status, JobStatus::Timeout);
        assert_eq!(spin.result.output, TIMEOUT_MESSAGE);

        let network = executor
            .execute(&Job::new(
                "import socket\nsocket.create_connection((\"1.1.1.1\", 53), timeout=2)\n"
                    .to_string(),
            ))
            .await;
        assert_eq!(network.result.status, JobStatus::Done);
        assert_ne!(network.result.exit_code, Some(0));
        assert!(network.result.output.contains("OSError"), "{}", network.result.output);

        let hog = executor
            .execute(&Job::new("x = bytearray(512 * 1024 * 1024)\n".to_string()))
            .await;
        assert_eq!(hog.result.status, JobStatus::Done);
        assert_ne!(hog.result.exit_code, Some(0));

        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }
}
