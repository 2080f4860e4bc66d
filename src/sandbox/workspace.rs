use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use futures_util::{FutureExt, future::BoxFuture};
use tempfile::TempDir;

pub const SCRIPT_NAME: &str = "script.py";
const SCRATCH_PREFIX: &str = "codesandbox-";

/// Recursive directory removal, swappable so cleanup faults can be staged.
pub type RemoveDir = Arc<dyn Fn(PathBuf) -> BoxFuture<'static, io::Result<()>> + Send + Sync>;

pub fn remove_dir_all() -> RemoveDir {
    Arc::new(|path: PathBuf| tokio::fs::remove_dir_all(path).boxed())
}

/// Uniquely named scratch directory holding the submitted source.
///
/// `close_with` removes it with retries. If the owner never gets that far (an
/// early return, a panic) the inner `TempDir` still removes it on drop.
pub struct ScratchWorkspace {
    dir: TempDir,
    script: PathBuf,
}

impl ScratchWorkspace {
    pub async fn create(root: &Path, code: &str) -> io::Result<Self> {
        tokio::fs::create_dir_all(root).await?;
        let dir = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(root)?;

        let script = dir.path().join(SCRIPT_NAME);
        tokio::fs::write(&script, code.as_bytes()).await?;
        set_read_only(&script).await?;

        Ok(Self { dir, script })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn script_path(&self) -> &Path {
        &self.script
    }

    pub async fn close_with(self, attempts: u32, remove: &RemoveDir) -> io::Result<()> {
        remove_with_retries(self.dir.path(), attempts, |path| remove(path)).await
    }
}

/// Calls `remove` up to `attempts` times with a linear backoff. A missing
/// directory counts as removed.
async fn remove_with_retries<F, Fut>(path: &Path, attempts: u32, mut remove: F) -> io::Result<()>
where
    F: FnMut(PathBuf) -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match remove(path.to_path_buf()).await {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    attempt,
                    error = %err,
                    "scratch cleanup failed"
                );
                last_err = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::other("scratch cleanup did not run")))
}

#[cfg(unix)]
async fn set_read_only(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o444)).await
}

#[cfg(not(unix))]
async fn set_read_only(path: &Path) -> io::Result<()> {
    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_readonly(true);
    tokio::fs::set_permissions(path, perms).await
}
