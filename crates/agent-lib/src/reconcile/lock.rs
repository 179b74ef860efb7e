//! Node-wide mutual exclusion
//!
//! An exclusive advisory lock on a well-known path keeps two agent
//! invocations from mutating the config tree concurrently. Acquisition
//! retries once a second up to a cap, then the caller exits with the
//! already-running code.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub struct AppLock {
    file: File,
    path: PathBuf,
}

impl AppLock {
    /// Try to acquire the lock, retrying every `retry_interval` for up to
    /// `timeout`. Returns `None` when another holder kept it the whole time.
    pub async fn acquire(
        path: &Path,
        retry_interval: Duration,
        timeout: Duration,
    ) -> Result<Option<AppLock>> {
        let start = tokio::time::Instant::now();
        loop {
            let file = File::options()
                .create(true)
                .read(true)
                .write(true)
                .open(path)
                .with_context(|| format!("opening lock file {}", path.display()))?;
            match file.try_lock_exclusive() {
                Ok(()) => {
                    info!(path = %path.display(), "acquired app lock");
                    return Ok(Some(AppLock { file, path: path.to_path_buf() }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Ok(None);
                    }
                    debug!(path = %path.display(), "lock held elsewhere, retrying");
                    tokio::time::sleep(retry_interval).await;
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("locking {}", path.display()));
                }
            }
        }
    }
}

impl Drop for AppLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "unlocking app lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_is_mutually_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.lock");

        let first = AppLock::acquire(&path, Duration::from_millis(10), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(first.is_some());

        // a second acquisition times out while the first is held
        let second = AppLock::acquire(&path, Duration::from_millis(10), Duration::from_millis(80))
            .await
            .unwrap();
        assert!(second.is_none());

        drop(first);
        let third = AppLock::acquire(&path, Duration::from_millis(10), Duration::from_millis(80))
            .await
            .unwrap();
        assert!(third.is_some());
    }
}
