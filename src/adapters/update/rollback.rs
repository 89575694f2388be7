use crate::adapters::update::backup::MANIFEST_FILE_NAME;
use crate::adapters::update::catalog::BackupCatalog;
use crate::adapters::update::extractor::unpack_tar_gz;
use crate::adapters::update::installer::{
    CopyFilter, FsItemInstaller, ItemInstaller, path_exists, remove_path,
};
use crate::adapters::update::lock::UpdateLock;
use crate::core::error::UpdateError;
use crate::core::types::{BackupManifest, ItemFailure, RestoreReport, RollbackStatus};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub(crate) const WORKER_SUBCOMMAND: &str = "rollback-worker";
pub(crate) const ROLLBACK_EXTRACT_DIR: &str = "rollback_extract";

/// How long a worker waits for a concurrent update to release the deployment.
pub(crate) const WORKER_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Program and leading arguments used to start the detached worker.
/// The worker arguments of [`RestoreRequest::to_args`] are appended.
#[derive(Debug, Clone)]
pub(crate) struct WorkerLauncher {
    program: PathBuf,
    leading_args: Vec<OsString>,
}

impl WorkerLauncher {
    pub(crate) fn new(program: impl Into<PathBuf>, leading_args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            leading_args,
        }
    }

    /// Re-executes the running binary with its hidden worker subcommand.
    pub(crate) fn current_exe(config_path: Option<&Path>) -> Result<Self, UpdateError> {
        let program = std::env::current_exe()
            .map_err(|e| UpdateError::RollbackFailed(format!("cannot locate own executable: {e}")))?;
        let mut leading_args = Vec::new();
        if let Some(path) = config_path {
            leading_args.push(OsString::from("--config"));
            leading_args.push(path.as_os_str().to_owned());
        }
        leading_args.push(OsString::from(WORKER_SUBCOMMAND));
        Ok(Self::new(program, leading_args))
    }
}

/// Everything a worker needs, passed as plain values at spawn time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RestoreRequest {
    pub archive: PathBuf,
    pub deployment_root: PathBuf,
    pub scratch_root: PathBuf,
    /// Restored when the archive's manifest cannot be read.
    pub fallback_items: Vec<String>,
}

impl RestoreRequest {
    pub(crate) fn to_args(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("--archive"),
            self.archive.as_os_str().to_owned(),
            OsString::from("--deployment-root"),
            self.deployment_root.as_os_str().to_owned(),
            OsString::from("--scratch-root"),
            self.scratch_root.as_os_str().to_owned(),
        ];
        for item in &self.fallback_items {
            args.push(OsString::from("--item"));
            args.push(OsString::from(item));
        }
        args
    }
}

/// Restores a backup through a separate OS process so the restore survives the
/// caller's own code being replaced underneath it.
#[derive(Debug, Clone)]
pub(crate) struct RollbackExecutor {
    launcher: WorkerLauncher,
    deployment_root: PathBuf,
    scratch_root: PathBuf,
    backup_dir: PathBuf,
    tracked_items: Vec<String>,
    grace_period: Duration,
    log_file: Option<PathBuf>,
}

impl RollbackExecutor {
    pub(crate) fn new(
        launcher: WorkerLauncher,
        deployment_root: PathBuf,
        scratch_root: PathBuf,
        backup_dir: PathBuf,
        tracked_items: Vec<String>,
        grace_period: Duration,
        log_file: Option<PathBuf>,
    ) -> Self {
        Self {
            launcher,
            deployment_root,
            scratch_root,
            backup_dir,
            tracked_items,
            grace_period,
            log_file,
        }
    }

    pub(crate) async fn rollback(&self, backup_path: &Path) -> Result<RollbackStatus, UpdateError> {
        if !BackupCatalog::is_backup(backup_path) {
            return Err(UpdateError::RollbackFailed(format!(
                "{} is not an existing backup archive",
                backup_path.display()
            )));
        }
        let archive = tokio::fs::canonicalize(backup_path)
            .await
            .map_err(UpdateError::fs(backup_path))?;

        // fail fast while an update holds the deployment; the worker takes the lock itself
        drop(UpdateLock::acquire(&self.backup_dir).await?);

        let request = RestoreRequest {
            archive,
            deployment_root: self.deployment_root.clone(),
            scratch_root: self.scratch_root.clone(),
            fallback_items: self.tracked_items.clone(),
        };
        let mut child = self.spawn(&request)?;
        let pid = child.id().unwrap_or_default();
        info!(
            "Rollback worker {} started for {}",
            pid,
            request.archive.display()
        );

        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                info!("Rollback worker {} finished within the grace period", pid);
                Ok(RollbackStatus::Completed)
            }
            Ok(Ok(status)) => {
                error!("Rollback worker {} failed: {}", pid, status);
                Err(UpdateError::RollbackFailed(format!("worker exited with {status}")))
            }
            Ok(Err(e)) => Err(UpdateError::RollbackFailed(format!(
                "waiting for worker {pid}: {e}"
            ))),
            Err(_) => {
                info!("Rollback worker {} still running in the background", pid);
                Ok(RollbackStatus::Started)
            }
        }
    }

    fn spawn(&self, request: &RestoreRequest) -> Result<tokio::process::Child, UpdateError> {
        let mut command = tokio::process::Command::new(&self.launcher.program);
        command
            .args(&self.launcher.leading_args)
            .args(request.to_args())
            .stdin(Stdio::null());

        match &self.log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(UpdateError::fs(parent))?;
                }
                let log = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(UpdateError::fs(path))?;
                let log_err = log.try_clone().map_err(UpdateError::fs(path))?;
                command.stdout(log).stderr(log_err);
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        // own process group: a signal aimed at the caller must not reach the worker
        #[cfg(unix)]
        command.process_group(0);

        command.spawn().map_err(|e| {
            UpdateError::RollbackFailed(format!(
                "cannot start worker {}: {e}",
                self.launcher.program.display()
            ))
        })
    }
}

/// Body of the worker process. Holds the update lock for the whole restore and
/// fails if any item could not be restored.
pub(crate) async fn run_worker(
    request: RestoreRequest,
    lock_timeout: Duration,
) -> Result<RestoreReport, UpdateError> {
    let lock_dir = request
        .archive
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| UpdateError::RollbackFailed("archive has no parent directory".into()))?;
    let _lock = UpdateLock::acquire_with_timeout(&lock_dir, lock_timeout).await?;

    let report = tokio::task::spawn_blocking(move || restore_from_archive(&request))
        .await
        .map_err(|e| UpdateError::TaskFailed(format!("restore task: {e}")))??;

    if report.failed.is_empty() {
        Ok(report)
    } else {
        Err(UpdateError::RollbackFailed(
            report
                .failed
                .iter()
                .map(|f| format!("{}: {}", f.item, f.reason))
                .collect::<Vec<_>>()
                .join("; "),
        ))
    }
}

/// Extracts the archive into the scratch root and copies each recorded item back
/// over the deployment. No safety copy is taken.
pub(crate) fn restore_from_archive(request: &RestoreRequest) -> Result<RestoreReport, UpdateError> {
    let extract_dir = request.scratch_root.join(ROLLBACK_EXTRACT_DIR);
    remove_path(&extract_dir)
        .and_then(|_| fs::create_dir_all(&extract_dir))
        .map_err(UpdateError::fs(&extract_dir))?;

    info!(
        "Restoring {} into {}",
        request.archive.display(),
        request.deployment_root.display()
    );
    let result =
        unpack_tar_gz(&request.archive, &extract_dir).map(|_| restore_items(&extract_dir, request));

    if let Err(e) = remove_path(&extract_dir) {
        warn!("Could not remove {}: {}", extract_dir.display(), e);
    }
    result
}

fn restore_items(extract_dir: &Path, request: &RestoreRequest) -> RestoreReport {
    let manifest = read_manifest(&extract_dir.join(MANIFEST_FILE_NAME));
    let items = match &manifest {
        Some(manifest) => manifest.items.clone(),
        None => {
            warn!("Backup manifest unreadable, restoring every tracked item found in the archive");
            request
                .fallback_items
                .iter()
                .filter(|item| path_exists(&extract_dir.join(item)))
                .cloned()
                .collect()
        }
    };

    let installer = FsItemInstaller::new(CopyFilter::none());
    let mut report = RestoreReport {
        version: manifest.map(|m| m.version),
        ..RestoreReport::default()
    };

    for item in items {
        if !is_plain_relative(&item) {
            report.failed.push(ItemFailure {
                reason: "not a path inside the deployment".to_string(),
                item,
            });
            continue;
        }
        let source = extract_dir.join(&item);
        if !path_exists(&source) {
            report.failed.push(ItemFailure {
                reason: "missing from the backup archive".to_string(),
                item,
            });
            continue;
        }
        let target = request.deployment_root.join(&item);
        match installer.replace(&item, &source, &target) {
            Ok(files) => {
                debug!("Restored '{}' ({} files)", item, files);
                report.restored.push(item);
            }
            Err(e) => {
                error!("Restoring '{}' failed: {}", item, e);
                report.failed.push(ItemFailure {
                    item,
                    reason: e.to_string(),
                });
            }
        }
    }

    info!(
        "Restored {} item(s) of version {}, {} failed",
        report.restored.len(),
        report.version.as_deref().unwrap_or("unknown"),
        report.failed.len()
    );
    report
}

fn read_manifest(path: &Path) -> Option<BackupManifest> {
    let bytes = fs::read(path)
        .inspect_err(|e| warn!("Cannot read {}: {}", path.display(), e))
        .ok()?;
    serde_json::from_slice(&bytes)
        .inspect_err(|e| warn!("Cannot parse {}: {}", path.display(), e))
        .ok()
}

fn is_plain_relative(item: &str) -> bool {
    let path = Path::new(item);
    !item.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::update::backup::BackupArchiver;
    use crate::adapters::update::tests::{deployment_digests, write_package, write_tar_gz};
    use crate::config::models::DeploymentConfig;
    use crate::core::version::VersionResolver;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        live: PathBuf,
        scratch: PathBuf,
        backups: PathBuf,
        tracked: Vec<String>,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let live = tmp.path().join("app");
        let scratch = tmp.path().join("scratch");
        let backups = tmp.path().join("backups");
        write_package(&live, "3.0.0");
        Fixture {
            live,
            scratch,
            backups,
            tracked: DeploymentConfig::default().tracked_items,
            _tmp: tmp,
        }
    }

    async fn capture(f: &Fixture) -> PathBuf {
        let config = DeploymentConfig {
            root: f.live.clone(),
            ..DeploymentConfig::default()
        };
        BackupArchiver::new(
            f.live.clone(),
            f.backups.clone(),
            f.scratch.clone(),
            f.tracked.clone(),
            VersionResolver::new(&config).unwrap(),
        )
        .capture()
        .await
        .unwrap()
        .path
    }

    fn request(f: &Fixture, archive: PathBuf) -> RestoreRequest {
        RestoreRequest {
            archive,
            deployment_root: f.live.clone(),
            scratch_root: f.scratch.clone(),
            fallback_items: f.tracked.clone(),
        }
    }

    fn executor(f: &Fixture, script: &str, grace: Duration) -> RollbackExecutor {
        RollbackExecutor::new(
            WorkerLauncher::new(
                "sh",
                vec![OsString::from("-c"), OsString::from(script), OsString::from("worker")],
            ),
            f.live.clone(),
            f.scratch.clone(),
            f.backups.clone(),
            f.tracked.clone(),
            grace,
            None,
        )
    }

    #[tokio::test]
    async fn restore_reproduces_backed_up_content() {
        let f = fixture();
        let before = deployment_digests(&f.live, &f.tracked);
        let archive = capture(&f).await;

        write_package(&f.live, "3.1.0");
        fs::write(f.live.join("backend/added_later.py"), "new").unwrap();
        fs::remove_file(f.live.join("requirements.txt")).unwrap();
        assert_ne!(deployment_digests(&f.live, &f.tracked), before);

        let report = restore_from_archive(&request(&f, archive)).unwrap();

        assert_eq!(report.version.as_deref(), Some("3.0.0"));
        assert!(report.failed.is_empty());
        assert_eq!(deployment_digests(&f.live, &f.tracked), before);
        assert!(!f.scratch.join(ROLLBACK_EXTRACT_DIR).exists());
    }

    #[tokio::test]
    async fn unreadable_manifest_falls_back_to_tracked_items() {
        let f = fixture();
        fs::create_dir_all(&f.backups).unwrap();
        let archive = f.backups.join("backup_2.0.0_20240101_000000.tar.gz");
        write_tar_gz(
            &archive,
            &[
                ("Dockerfile", "FROM old"),
                ("frontend/index.html", "old page"),
                (MANIFEST_FILE_NAME, "{ not json"),
            ],
        );

        let report = restore_from_archive(&request(&f, archive)).unwrap();

        assert_eq!(report.version, None);
        assert_eq!(report.restored, vec!["frontend", "Dockerfile"]);
        assert_eq!(fs::read_to_string(f.live.join("Dockerfile")).unwrap(), "FROM old");
        assert!(f.live.join("backend/main.py").is_file());
    }

    #[tokio::test]
    async fn manifest_items_outside_the_deployment_are_refused() {
        let f = fixture();
        fs::create_dir_all(&f.backups).unwrap();
        let archive = f.backups.join("backup_2.0.0_20240101_000000.tar.gz");
        let manifest = serde_json::json!({
            "version": "2.0.0",
            "timestamp": "20240101_000000",
            "created_at": "2024-01-01T00:00:00+00:00",
            "items": ["../escape", "Dockerfile"],
            "backup_filename": "backup_2.0.0_20240101_000000.tar.gz",
        })
        .to_string();
        write_tar_gz(&archive, &[("Dockerfile", "FROM old"), (MANIFEST_FILE_NAME, &manifest)]);

        let result = run_worker(request(&f, archive), Duration::ZERO).await;

        assert_matches!(result, Err(UpdateError::RollbackFailed(msg)) if msg.contains("../escape"));
        assert_eq!(fs::read_to_string(f.live.join("Dockerfile")).unwrap(), "FROM old");
    }

    #[tokio::test]
    async fn worker_waits_for_lock_holder() {
        let f = fixture();
        let archive = capture(&f).await;
        let _held = UpdateLock::acquire(&f.backups).await.unwrap();

        assert_matches!(
            run_worker(request(&f, archive), Duration::from_millis(50)).await,
            Err(UpdateError::UpdateInProgress(_))
        );
    }

    #[tokio::test]
    async fn rejects_paths_that_are_not_backups() {
        let f = fixture();
        let executor = executor(&f, "exit 0", Duration::from_secs(1));

        assert_matches!(
            executor.rollback(&f.backups.join("backup_3.0.0_20240101_000000.tar.gz")).await,
            Err(UpdateError::RollbackFailed(_))
        );
        assert_matches!(
            executor.rollback(&f.live.join("Dockerfile")).await,
            Err(UpdateError::RollbackFailed(_))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reports_completed_when_worker_finishes_in_grace_period() {
        let f = fixture();
        let archive = capture(&f).await;
        let status = executor(&f, "exit 0", Duration::from_secs(5))
            .rollback(&archive)
            .await
            .unwrap();
        assert_eq!(status, RollbackStatus::Completed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reports_started_when_worker_outlives_grace_period() {
        let f = fixture();
        let archive = capture(&f).await;
        let status = executor(&f, "sleep 2", Duration::from_millis(100))
            .rollback(&archive)
            .await
            .unwrap();
        assert_eq!(status, RollbackStatus::Started);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_failure_within_grace_period_is_an_error() {
        let f = fixture();
        let archive = capture(&f).await;
        assert_matches!(
            executor(&f, "exit 3", Duration::from_secs(5)).rollback(&archive).await,
            Err(UpdateError::RollbackFailed(_))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn worker_receives_plain_value_arguments() {
        let f = fixture();
        let archive = capture(&f).await;
        let out = f.scratch.join("args.txt");
        fs::create_dir_all(&f.scratch).unwrap();
        let script = format!("printf '%s\\n' \"$@\" > '{}'", out.display());

        executor(&f, &script, Duration::from_secs(5))
            .rollback(&archive)
            .await
            .unwrap();

        let args = fs::read_to_string(&out).unwrap();
        let archive = fs::canonicalize(&archive).unwrap();
        assert!(args.starts_with(&format!("--archive\n{}\n", archive.display())));
        assert!(args.contains("--deployment-root\n"));
        assert!(args.contains("--item\nbackend\n"));
    }
}
