//! Cross-process exclusion for operations that mutate the deployment.
//!
//! An update and a rollback worker must never write the tracked items at the same
//! time. Both take an exclusive OS lock on `{backup_dir}/.upkeep.lock` for their
//! whole duration. The lock is released when the guard is dropped or the process
//! exits; the lock file itself stays in place.

use crate::core::error::UpdateError;
use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_retry::strategy::ExponentialBackoff;
use tracing::debug;

pub(crate) const LOCK_FILE_NAME: &str = ".upkeep.lock";

const STARTING_BACKOFF_DELAY_MS: u64 = 10;
const MAX_BACKOFF_DELAY_MS: u64 = 500;

#[derive(Debug)]
pub(crate) struct UpdateLock {
    _file: Arc<File>,
    path: PathBuf,
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        debug!("Released {}", self.path.display());
    }
}

impl UpdateLock {
    /// Single attempt; fails immediately when another process holds the lock.
    pub(crate) async fn acquire(dir: &Path) -> Result<Self, UpdateError> {
        Self::acquire_with_timeout(dir, Duration::ZERO).await
    }

    /// Retries with exponential backoff (10ms doubling up to 500ms) until `timeout` elapses.
    pub(crate) async fn acquire_with_timeout(
        dir: &Path,
        timeout: Duration,
    ) -> Result<Self, UpdateError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(UpdateError::fs(dir))?;
        let path = dir.join(LOCK_FILE_NAME);

        let open_path = path.clone();
        let file = tokio::task::spawn_blocking(move || {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&open_path)
        })
        .await
        .map_err(|e| UpdateError::TaskFailed(format!("lock task: {e}")))?
        .map_err(UpdateError::fs(&path))?;
        let file = Arc::new(file);

        let start = Instant::now();
        let backoff = ExponentialBackoff::from_millis(STARTING_BACKOFF_DELAY_MS)
            .max_delay(Duration::from_millis(MAX_BACKOFF_DELAY_MS));

        for delay in backoff {
            let candidate = Arc::clone(&file);
            let locked = tokio::task::spawn_blocking(move || candidate.try_lock_exclusive())
                .await
                .map_err(|e| UpdateError::TaskFailed(format!("lock task: {e}")))?;

            match locked {
                Ok(true) => {
                    debug!(
                        "Acquired {} after {}ms",
                        path.display(),
                        start.elapsed().as_millis()
                    );
                    return Ok(Self { _file: file, path });
                }
                Ok(false) | Err(_) => {
                    let remaining = timeout.saturating_sub(start.elapsed());
                    if remaining.is_zero() {
                        break;
                    }
                    tokio::time::sleep(delay.min(remaining)).await;
                }
            }
        }

        Err(UpdateError::UpdateInProgress(format!(
            "{} is held by another process",
            path.display()
        )))
    }
}
