use crate::adapters::update::installer::{
    CopyFilter, ItemInstaller, copy_tree, path_exists, remove_path,
};
use crate::adapters::update::validator::UpdateValidator;
use crate::core::error::UpdateError;
use crate::core::types::{ApplyReport, ItemFailure};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Replaces the live deployment with an extracted package, all or nothing.
///
/// Every tracked item that exists is first copied to an uncompressed snapshot.
/// The overwrite then visits every item and collects failures. If any item
/// failed, the snapshot is restored over all tracked items and items the
/// attempt created are removed again, so the deployment matches its state
/// before the call.
#[derive(Clone)]
pub(crate) struct AtomicApplier {
    deployment_root: PathBuf,
    tracked_items: Vec<String>,
    validator: UpdateValidator,
    installer: Arc<dyn ItemInstaller>,
}

impl AtomicApplier {
    pub(crate) fn new(
        deployment_root: PathBuf,
        tracked_items: Vec<String>,
        validator: UpdateValidator,
        installer: Arc<dyn ItemInstaller>,
    ) -> Self {
        Self {
            deployment_root,
            tracked_items,
            validator,
            installer,
        }
    }

    /// Applies `project_root` using `snapshot_dir` as the safety copy location.
    pub(crate) async fn apply(
        &self,
        project_root: &Path,
        snapshot_dir: &Path,
    ) -> Result<ApplyReport, UpdateError> {
        let applier = self.clone();
        let project_root = project_root.to_path_buf();
        let snapshot_dir = snapshot_dir.to_path_buf();
        tokio::task::spawn_blocking(move || applier.apply_blocking(&project_root, &snapshot_dir))
            .await
            .map_err(|e| UpdateError::TaskFailed(format!("apply task: {e}")))?
    }

    pub(crate) fn apply_blocking(
        &self,
        project_root: &Path,
        snapshot_dir: &Path,
    ) -> Result<ApplyReport, UpdateError> {
        if let Err(problem) = self.validator.check(project_root) {
            error!("Refusing to apply invalid package: {}", problem);
            return Err(UpdateError::ValidationFailed(problem));
        }

        info!("Apply phase 1/4: staging safety copy in {}", snapshot_dir.display());
        let pre_existing = self.stage(snapshot_dir)?;

        info!("Apply phase 2/4: verifying safety copy");
        if let Some(missing) = pre_existing
            .iter()
            .find(|item| !path_exists(&snapshot_dir.join(item)))
        {
            self.discard_snapshot(snapshot_dir);
            return Err(UpdateError::StagingFailed(format!(
                "'{missing}' is missing from the safety copy"
            )));
        }

        info!("Apply phase 3/4: overwriting deployment items");
        let (report, failures) = self.overwrite(project_root);

        info!("Apply phase 4/4: deciding outcome");
        if failures.is_empty() {
            self.discard_snapshot(snapshot_dir);
            info!(
                "Applied {} items ({} files)",
                report.replaced.len(),
                report.files_copied
            );
            return Ok(report);
        }

        error!(
            "{} item(s) failed to update, restoring previous state: {:?}",
            failures.len(),
            failures.iter().map(|f| f.item.as_str()).collect::<Vec<_>>()
        );
        let restore_failures = self.restore(snapshot_dir, &pre_existing);
        if restore_failures.is_empty() {
            self.discard_snapshot(snapshot_dir);
            info!("Deployment restored to its state before the update");
            return Err(UpdateError::ApplyFailed { failures });
        }

        error!(
            "Restoring from {} failed; the safety copy is kept for manual recovery",
            snapshot_dir.display()
        );
        Err(UpdateError::RestoreFailed {
            apply: join_failures(&failures),
            restore: join_failures(&restore_failures),
        })
    }

    /// Copies every existing tracked item into the snapshot. Returns the items copied.
    fn stage(&self, snapshot_dir: &Path) -> Result<Vec<String>, UpdateError> {
        let staging_failed = |what: String| {
            self.discard_snapshot(snapshot_dir);
            UpdateError::StagingFailed(what)
        };

        remove_path(snapshot_dir)
            .and_then(|_| std::fs::create_dir_all(snapshot_dir))
            .map_err(|e| staging_failed(format!("{}: {e}", snapshot_dir.display())))?;

        let mut staged = Vec::new();
        for item in &self.tracked_items {
            let live = self.deployment_root.join(item);
            if !path_exists(&live) {
                debug!("'{}' does not exist, nothing to stage", item);
                continue;
            }
            copy_tree(&live, &snapshot_dir.join(item), &CopyFilter::none())
                .map_err(|e| staging_failed(format!("'{item}': {e}")))?;
            debug!("Staged '{}'", item);
            staged.push(item.clone());
        }
        Ok(staged)
    }

    fn overwrite(&self, project_root: &Path) -> (ApplyReport, Vec<ItemFailure>) {
        let mut report = ApplyReport::default();
        let mut failures = Vec::new();

        for item in &self.tracked_items {
            let replacement = project_root.join(item);
            if !path_exists(&replacement) {
                debug!("Package does not provide '{}', leaving it as is", item);
                continue;
            }
            let live = self.deployment_root.join(item);
            match self.installer.replace(item, &replacement, &live) {
                Ok(files) => {
                    info!("Updated '{}' ({} files)", item, files);
                    report.replaced.push(item.clone());
                    report.files_copied += files;
                }
                Err(e) => {
                    error!("Updating '{}' failed: {}", item, e);
                    failures.push(ItemFailure {
                        item: item.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        (report, failures)
    }

    fn restore(&self, snapshot_dir: &Path, pre_existing: &[String]) -> Vec<ItemFailure> {
        let mut failures = Vec::new();
        for item in &self.tracked_items {
            let live = self.deployment_root.join(item);
            let result = if pre_existing.contains(item) {
                remove_path(&live)
                    .and_then(|_| copy_tree(&snapshot_dir.join(item), &live, &CopyFilter::none()))
                    .map(|_| ())
            } else {
                remove_path(&live)
            };
            match result {
                Ok(()) => debug!("Restored '{}'", item),
                Err(e) => {
                    error!("Restoring '{}' failed: {}", item, e);
                    failures.push(ItemFailure {
                        item: item.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        failures
    }

    fn discard_snapshot(&self, snapshot_dir: &Path) {
        if let Err(e) = remove_path(snapshot_dir) {
            warn!(
                "Could not remove safety copy {}: {}",
                snapshot_dir.display(),
                e
            );
        }
    }
}

fn join_failures(failures: &[ItemFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.item, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}
