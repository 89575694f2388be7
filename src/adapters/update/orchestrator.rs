use crate::adapters::update::applier::AtomicApplier;
use crate::adapters::update::backup::BackupArchiver;
use crate::adapters::update::catalog::BackupCatalog;
use crate::adapters::update::extractor::PackageExtractor;
use crate::adapters::update::fetcher::PackageFetcher;
use crate::adapters::update::installer::{CopyFilter, FsItemInstaller, ItemInstaller, remove_path};
use crate::adapters::update::lock::UpdateLock;
use crate::adapters::update::rollback::{RollbackExecutor, WorkerLauncher};
use crate::adapters::update::validator::UpdateValidator;
use crate::config::models::AppConfig;
use crate::core::error::{ConfigError, UpdateError};
use crate::core::types::{
    BackupInfo, RollbackStatus, UpdateCheck, UpdateResult, UpdateStage, VersionInfo,
};
use crate::core::version::VersionResolver;
use crate::ports::{ReleaseSourcePort, UpdateManagerPort};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

const DOWNLOAD_DIR: &str = "downloads";
const EXTRACT_DIR: &str = "extracted";
const SNAPSHOT_DIR: &str = "temp_backup";

/// Drives `check -> backup -> download -> extract -> validate -> apply -> cleanup`.
pub(crate) struct UpdateOrchestrator {
    release_source: Arc<dyn ReleaseSourcePort>,
    fetcher: PackageFetcher,
    versions: VersionResolver,
    validator: UpdateValidator,
    archiver: BackupArchiver,
    catalog: BackupCatalog,
    applier: AtomicApplier,
    rollback: RollbackExecutor,
    scratch_dir: PathBuf,
    backup_dir: PathBuf,
}

/// What a successful pipeline run amounts to.
enum Outcome {
    AlreadyCurrent { latest: String },
    Updated { version: String },
}

impl UpdateOrchestrator {
    pub(crate) fn new(
        config: &AppConfig,
        release_source: Arc<dyn ReleaseSourcePort>,
        fetcher: PackageFetcher,
        launcher: WorkerLauncher,
    ) -> Result<Self, ConfigError> {
        let deployment = &config.deployment;
        if let Some(conflict) = config.scratch_layout_conflict() {
            return Err(ConfigError::InvalidValue {
                field: "deployment.scratch_dir".to_string(),
                message: conflict,
            });
        }
        let invalid_pattern = |e: regex::Error| ConfigError::InvalidValue {
            field: "deployment.version_pattern".to_string(),
            message: e.to_string(),
        };
        let versions = VersionResolver::new(deployment).map_err(invalid_pattern)?;
        let validator =
            UpdateValidator::new(&config.validation, deployment).map_err(invalid_pattern)?;

        let installer: Arc<dyn ItemInstaller> =
            Arc::new(FsItemInstaller::new(CopyFilter::from_config(deployment)));
        let applier = AtomicApplier::new(
            deployment.root.clone(),
            deployment.tracked_items.clone(),
            validator.clone(),
            installer,
        );
        let archiver = BackupArchiver::new(
            deployment.root.clone(),
            config.backup.dir.clone(),
            deployment.scratch_dir.clone(),
            deployment.tracked_items.clone(),
            versions.clone(),
        );
        let rollback = RollbackExecutor::new(
            launcher,
            deployment.root.clone(),
            deployment.scratch_dir.clone(),
            config.backup.dir.clone(),
            deployment.tracked_items.clone(),
            config.rollback.grace_period,
            config.rollback.log_file.clone(),
        );

        Ok(Self {
            release_source,
            fetcher,
            versions,
            validator,
            archiver,
            catalog: BackupCatalog::new(config.backup.dir.clone()),
            applier,
            rollback,
            scratch_dir: deployment.scratch_dir.clone(),
            backup_dir: config.backup.dir.clone(),
        })
    }

    fn enter(stage: &mut UpdateStage, next: UpdateStage) {
        *stage = next;
        info!("Update stage: {}", next);
    }

    async fn run_pipeline(
        &self,
        from_version: &str,
        stage: &mut UpdateStage,
        backup_path: &mut Option<PathBuf>,
    ) -> Result<Outcome, UpdateError> {
        Self::enter(stage, UpdateStage::Checking);
        let latest = self.release_source.latest(false).await?;
        if !VersionResolver::is_newer(from_version, &latest.version) {
            info!(
                "Deployment runs {}, latest release is {}; nothing to do",
                from_version, latest.version
            );
            return Ok(Outcome::AlreadyCurrent {
                latest: latest.version,
            });
        }
        info!("Updating {} -> {}", from_version, latest.version);

        Self::enter(stage, UpdateStage::BackingUp);
        let backup = self.archiver.capture().await?;
        info!("Backup stored at {}", backup.path.display());
        *backup_path = Some(backup.path);

        Self::enter(stage, UpdateStage::Downloading);
        let release = self.release_source.by_tag(&latest.version).await?;
        let archive = self
            .fetcher
            .download(&release, &self.scratch_dir.join(DOWNLOAD_DIR))
            .await?;

        Self::enter(stage, UpdateStage::Extracting);
        let project_root =
            PackageExtractor::extract(&archive, &self.scratch_dir.join(EXTRACT_DIR)).await?;

        Self::enter(stage, UpdateStage::Validating);
        let package_version = self
            .validator
            .check(&project_root)
            .map_err(UpdateError::ValidationFailed)?;
        if package_version != release.version {
            warn!(
                "Package declares version {} but release is tagged {}",
                package_version, release.tag_name
            );
        }

        Self::enter(stage, UpdateStage::Applying);
        let report = self
            .applier
            .apply(&project_root, &self.scratch_dir.join(SNAPSHOT_DIR))
            .await?;
        debug!("Replaced items: {:?}", report.replaced);

        Ok(Outcome::Updated {
            version: self.versions.current().await,
        })
    }

    /// Best effort; a leftover scratch directory never fails an attempt.
    /// With `keep_snapshot` the safety copy survives for manual recovery.
    async fn cleanup_scratch(&self, keep_snapshot: bool) {
        let scratch = self.scratch_dir.clone();
        let removed = tokio::task::spawn_blocking(move || {
            if keep_snapshot {
                remove_all_except(&scratch, SNAPSHOT_DIR)
            } else {
                remove_path(&scratch)
            }
        })
        .await;
        match removed {
            Ok(Ok(())) => debug!("Removed scratch directory {}", self.scratch_dir.display()),
            Ok(Err(e)) => warn!(
                "Could not remove scratch directory {}: {}",
                self.scratch_dir.display(),
                e
            ),
            Err(e) => warn!("Scratch cleanup task failed: {}", e),
        }
    }
}

fn remove_all_except(dir: &Path, keep: &str) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_name() != keep {
            remove_path(&entry.path())?;
        }
    }
    Ok(())
}

#[async_trait]
impl UpdateManagerPort for UpdateOrchestrator {
    async fn version_info(&self) -> VersionInfo {
        let current_version = self.versions.current().await;
        match self.release_source.latest(false).await {
            Ok(release) => VersionInfo {
                current_version,
                latest_version: Some(release.version),
                latest_error: None,
            },
            Err(e) => {
                warn!("Latest version unavailable: {}", e);
                VersionInfo {
                    current_version,
                    latest_version: None,
                    latest_error: Some(e.to_string()),
                }
            }
        }
    }

    async fn check_update(&self, force_refresh: bool) -> Result<UpdateCheck, UpdateError> {
        let current_version = self.versions.current().await;
        let release = self.release_source.latest(force_refresh).await?;
        let has_update = VersionResolver::is_newer(&current_version, &release.version);
        info!(
            "Current {}, latest {}, update available: {}",
            current_version, release.version, has_update
        );
        Ok(UpdateCheck {
            current_version,
            latest_version: release.version.clone(),
            has_update,
            release,
        })
    }

    async fn execute_update(&self) -> UpdateResult {
        let started = Instant::now();
        let from_version = self.versions.current().await;
        let mut stage = UpdateStage::Idle;
        let mut backup_path = None;

        // the scratch directory belongs to whoever holds the lock, so a rejected
        // attempt must return before cleanup
        let _lock = match UpdateLock::acquire(&self.backup_dir).await {
            Ok(lock) => lock,
            Err(e) => {
                warn!("Update rejected: {}", e);
                return UpdateResult {
                    success: false,
                    message: format!("Update not started: {e}"),
                    version: from_version.clone(),
                    from_version,
                    stage: UpdateStage::Failed,
                    failed_stage: Some(stage),
                    duration: started.elapsed(),
                    backup_path,
                };
            }
        };

        let outcome = self
            .run_pipeline(&from_version, &mut stage, &mut backup_path)
            .await;

        let failed_stage = stage;
        if outcome.is_ok() {
            Self::enter(&mut stage, UpdateStage::CleaningUp);
        }
        let keep_snapshot = matches!(outcome, Err(UpdateError::RestoreFailed { .. }));
        self.cleanup_scratch(keep_snapshot).await;

        let (success, message, version, failed_stage) = match outcome {
            Ok(Outcome::AlreadyCurrent { latest }) => (
                true,
                format!("Already up to date ({from_version}, latest {latest})"),
                from_version.clone(),
                None,
            ),
            Ok(Outcome::Updated { version }) => (
                true,
                format!("Updated from {from_version} to {version}"),
                version,
                None,
            ),
            Err(e) => {
                error!("Update failed while {}: {}", failed_stage, e);
                let mut message = format!("Update failed while {failed_stage}: {e}");
                if keep_snapshot {
                    let snapshot = self.scratch_dir.join(SNAPSHOT_DIR);
                    error!("Safety copy kept at {} for manual recovery", snapshot.display());
                    message.push_str(&format!(
                        "; safety copy kept at {}",
                        snapshot.display()
                    ));
                }
                (
                    false,
                    message,
                    self.versions.current().await,
                    Some(failed_stage),
                )
            }
        };
        let stage = if success {
            UpdateStage::Done
        } else {
            UpdateStage::Failed
        };
        info!("Update stage: {}", stage);

        UpdateResult {
            success,
            message,
            from_version,
            version,
            stage,
            failed_stage,
            duration: started.elapsed(),
            backup_path,
        }
    }

    async fn list_backups(&self) -> Result<Vec<BackupInfo>, UpdateError> {
        self.catalog.list().await
    }

    async fn rollback(&self, backup_path: &Path) -> Result<RollbackStatus, UpdateError> {
        info!("Rollback to {} requested", backup_path.display());
        self.rollback.rollback(backup_path).await
    }
}
