use std::{path::Path, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::oneshot,
};
use uuid::Uuid;

use crate::{
    models::SandboxLimits,
    sandbox::{CapturedOutput, OutputBuffer, RunOutcome, SandboxBackend, SandboxError},
};

const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// How long the pipes may keep producing once the script itself has exited.
const DRAIN_WINDOW: Duration = Duration::from_millis(250);

/// Runs the script as a plain child process of the worker.
///
/// Only the timeout, output cap, empty environment and closed stdin apply
/// here; memory, CPU, process count and network are not contained. Meant for
/// local development and tests.
///
/// The child leads its own process group so anything it forks is killed with
/// it once the script exits or times out.
pub struct ProcessSandbox {
    interpreter: String,
}

impl ProcessSandbox {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

#[async_trait]
impl SandboxBackend for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run(
        &self,
        job_id: Uuid,
        script: &Path,
        limits: &SandboxLimits,
    ) -> Result<RunOutcome, SandboxError> {
        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(script)
            .env_clear()
            .env("PATH", SAFE_PATH)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = script.parent() {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Start(format!("{}: {e}", self.interpreter)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Start("missing stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Start("missing stderr pipe".to_string()))?;

        let group = child.id();
        let (exited_tx, exited_rx) = oneshot::channel();
        let pumping = tokio::spawn(pump(stdout, stderr, limits.max_output_bytes, exited_rx));

        // Completion is the script's own exit, not EOF on its pipes.
        let waited = tokio::time::timeout(limits.timeout(), child.wait()).await;
        match waited {
            Ok(Ok(status)) => {
                let _ = exited_tx.send(());
                kill_process_group(group, job_id);
                let output = pumping
                    .await
                    .map_err(|e| SandboxError::Logs(e.to_string()))?;
                Ok(RunOutcome::Completed {
                    output,
                    exit_code: status.code().map(i64::from).unwrap_or(-1),
                    oom_killed: false,
                })
            }
            Ok(Err(err)) => {
                kill_process_group(group, job_id);
                pumping.abort();
                Err(SandboxError::Wait(err.to_string()))
            }
            Err(_) => {
                kill_process_group(group, job_id);
                if let Err(err) = child.kill().await {
                    tracing::warn!(%job_id, error = %err, "failed to kill timed out process");
                }
                pumping.abort();
                Ok(RunOutcome::TimedOut)
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_group(group: Option<u32>, job_id: Uuid) {
    use nix::{
        errno::Errno,
        sys::signal::{Signal, killpg},
        unistd::Pid,
    };

    let Some(group) = group.and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(group), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => {
            tracing::warn!(%job_id, group, error = %err, "failed to kill sandbox process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_group: Option<u32>, _job_id: Uuid) {}

/// Reads both pipes into one buffer in arrival order until both close, or
/// until `DRAIN_WINDOW` after `exited` fires.
async fn pump<O, E>(
    mut stdout: O,
    mut stderr: E,
    limit: usize,
    exited: oneshot::Receiver<()>,
) -> CapturedOutput
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut buffer = OutputBuffer::new(limit);
    let mut out_chunk = [0u8; 4096];
    let mut err_chunk = [0u8; 4096];
    let mut out_open = true;
    let mut err_open = true;

    let drain = async {
        let _ = exited.await;
        tokio::time::sleep(DRAIN_WINDOW).await;
    };
    tokio::pin!(drain);

    while out_open || err_open {
        tokio::select! {
            _ = &mut drain => break,
            read = stdout.read(&mut out_chunk), if out_open => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => buffer.push(&out_chunk[..n]),
            },
            read = stderr.read(&mut err_chunk), if err_open => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => buffer.push(&err_chunk[..n]),
            },
        }
    }
    buffer.finish()
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        time::{Duration, Instant},
    };

    use uuid::Uuid;

    use super::ProcessSandbox;
    use crate::{
        models::{Job, JobStatus, SandboxLimits, TIMEOUT_MESSAGE},
        sandbox::{RunOutcome, SandboxBackend, SandboxError, SandboxExecutor, ScratchWorkspace},
    };

    fn limits(timeout_ms: u64) -> SandboxLimits {
        SandboxLimits {
            timeout_ms,
            ..SandboxLimits::default()
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr_together() {
        let root = tempfile::tempdir().unwrap();
        let ws = ScratchWorkspace::create(root.path(), "echo 'Hello, World!'\necho oops >&2\nexit 3\n")
            .await
            .unwrap();

        let outcome = ProcessSandbox::new("sh")
            .run(Uuid::new_v4(), ws.script_path(), &limits(5_000))
            .await
            .unwrap();

        match outcome {
            RunOutcome::Completed { output, exit_code, .. } => {
                let text = output.render();
                assert!(text.contains("Hello, World!\n"));
                assert!(text.contains("oops\n"));
                assert_eq!(exit_code, 3);
            }
            RunOutcome::TimedOut => panic!("should not time out"),
        }
    }

    #[tokio::test]
    async fn runaway_script_times_out_promptly() {
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(
            std::sync::Arc::new(ProcessSandbox::new("sh")),
            limits(300),
            root.path().to_path_buf(),
            3,
        );

        let started = Instant::now();
        let session = executor
            .execute(&Job::new("while true; do :; done\n".to_string()))
            .await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(session.result.status, JobStatus::Timeout);
        assert_eq!(session.result.output, TIMEOUT_MESSAGE);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    /// Zombies count as dead: an orphan may wait a while for its reaper.
    #[cfg(target_os = "linux")]
    fn process_alive(pid: &str) -> bool {
        let Ok(stat) = std::fs::read_to_string(Path::new("/proc").join(pid).join("stat")) else {
            return false;
        };
        let state = stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next());
        !matches!(state, None | Some('Z') | Some('X'))
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn exit_is_completion_even_with_background_child() {
        let root = tempfile::tempdir().unwrap();
        let pid_file = root.path().join("bg.pid");
        let script = format!(
            "echo hi\nsleep 30 &\necho $! > {}\nexit 0\n",
            pid_file.display()
        );
        let ws = ScratchWorkspace::create(root.path(), &script).await.unwrap();

        let started = Instant::now();
        let outcome = ProcessSandbox::new("sh")
            .run(Uuid::new_v4(), ws.script_path(), &limits(2_000))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        let RunOutcome::Completed { output, exit_code, .. } = outcome else {
            panic!("script exited straight away and must not time out");
        };
        assert_eq!(exit_code, 0);
        assert_eq!(output.render(), "hi\n");

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let pid = pid.trim();
        let deadline = Instant::now() + Duration::from_secs(2);
        while process_alive(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!process_alive(pid), "background child {pid} survived the run");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn timeout_kills_the_whole_process_group() {
        let root = tempfile::tempdir().unwrap();
        let pid_file = root.path().join("bg.pid");
        let script = format!(
            "sleep 30 &\necho $! > {}\nwhile true; do :; done\n",
            pid_file.display()
        );
        let ws = ScratchWorkspace::create(root.path(), &script).await.unwrap();

        let outcome = ProcessSandbox::new("sh")
            .run(Uuid::new_v4(), ws.script_path(), &limits(300))
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::TimedOut));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let pid = pid.trim();
        let deadline = Instant::now() + Duration::from_secs(2);
        while process_alive(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!process_alive(pid), "background child {pid} survived the timeout");
    }

    #[tokio::test]
    async fn missing_interpreter_fails_to_start() {
        let root = tempfile::tempdir().unwrap();
        let ws = ScratchWorkspace::create(root.path(), "print(1)").await.unwrap();
        let err = ProcessSandbox::new("/nonexistent/interpreter")
            .run(Uuid::new_v4(), ws.script_path(), &limits(1_000))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Start(_)));
    }

    #[tokio::test]
    async fn start_failure_leaves_no_scratch() {
        let root = tempfile::tempdir().unwrap();
        let executor = SandboxExecutor::new(
            std::sync::Arc::new(ProcessSandbox::new("/nonexistent/interpreter")),
            limits(1_000),
            root.path().to_path_buf(),
            3,
        );
        let session = executor.execute(&Job::new("print(1)".to_string())).await;
        assert_eq!(session.result.status, JobStatus::Error);
        assert!(session.cleaned_up);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn child_gets_an_empty_environment() {
        let root = tempfile::tempdir().unwrap();
        let ws = ScratchWorkspace::create(root.path(), "echo \"home=${HOME:-unset}\"\n")
            .await
            .unwrap();
        let outcome = ProcessSandbox::new("sh")
            .run(Uuid::new_v4(), ws.script_path(), &limits(5_000))
            .await
            .unwrap();
        let RunOutcome::Completed { output, .. } = outcome else {
            panic!("should complete");
        };
        assert_eq!(output.render(), "home=unset\n");
    }
}
