use crate::adapters::update::installer::{CopyFilter, copy_tree, path_exists, remove_path};
use crate::core::error::UpdateError;
use crate::core::types::{BackupArchive, BackupManifest};
use crate::core::version::VersionResolver;
use chrono::Local;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub(crate) const MANIFEST_FILE_NAME: &str = "backup_metadata.json";
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Captures the tracked deployment items into `backup_{version}_{timestamp}.tar.gz`.
#[derive(Debug, Clone)]
pub(crate) struct BackupArchiver {
    deployment_root: PathBuf,
    backup_dir: PathBuf,
    scratch_dir: PathBuf,
    tracked_items: Vec<String>,
    versions: VersionResolver,
}

impl BackupArchiver {
    pub(crate) fn new(
        deployment_root: PathBuf,
        backup_dir: PathBuf,
        scratch_dir: PathBuf,
        tracked_items: Vec<String>,
        versions: VersionResolver,
    ) -> Self {
        Self {
            deployment_root,
            backup_dir,
            scratch_dir,
            tracked_items,
            versions,
        }
    }

    pub(crate) async fn capture(&self) -> Result<BackupArchive, UpdateError> {
        let version = self.versions.current().await;
        info!("Creating backup of version {}", version);
        let archiver = self.clone();
        tokio::task::spawn_blocking(move || archiver.capture_blocking(&version))
            .await
            .map_err(|e| UpdateError::TaskFailed(format!("backup task: {e}")))?
    }

    pub(crate) fn capture_blocking(&self, version: &str) -> Result<BackupArchive, UpdateError> {
        fs::create_dir_all(&self.backup_dir).map_err(UpdateError::fs(&self.backup_dir))?;

        let (timestamp, file_name, path) = self.reserve_name(version);
        let staging = self.scratch_dir.join(format!("backup_{timestamp}"));

        let result = self.build(version, &timestamp, &file_name, &path, &staging);
        if let Err(e) = remove_path(&staging) {
            warn!("Could not remove backup staging {}: {}", staging.display(), e);
        }
        result
    }

    /// Picks a file name that does not exist yet, waiting for the next second if needed.
    fn reserve_name(&self, version: &str) -> (String, String, PathBuf) {
        let safe_version = version.replace(['/', '\\'], "-");
        loop {
            let now = Local::now();
            let timestamp = now.format(TIMESTAMP_FORMAT).to_string();
            let file_name = format!("backup_{safe_version}_{timestamp}.tar.gz");
            let path = self.backup_dir.join(&file_name);
            if !path_exists(&path) {
                return (timestamp, file_name, path);
            }
            let wait_ms = 1000 - u64::from(now.timestamp_subsec_millis().min(999));
            debug!("{} already exists, waiting {}ms", file_name, wait_ms);
            std::thread::sleep(Duration::from_millis(wait_ms + 5));
        }
    }

    fn build(
        &self,
        version: &str,
        timestamp: &str,
        file_name: &str,
        path: &Path,
        staging: &Path,
    ) -> Result<BackupArchive, UpdateError> {
        remove_path(staging)
            .and_then(|_| fs::create_dir_all(staging))
            .map_err(|e| UpdateError::BackupFailed(format!("staging {}: {e}", staging.display())))?;

        let mut items = Vec::new();
        for item in &self.tracked_items {
            let source = self.deployment_root.join(item);
            if !path_exists(&source) {
                debug!("'{}' not present, not backed up", item);
                continue;
            }
            copy_tree(&source, &staging.join(item), &CopyFilter::none())
                .map_err(|e| UpdateError::BackupFailed(format!("copying '{item}': {e}")))?;
            items.push(item.clone());
        }

        let manifest = BackupManifest {
            version: version.to_string(),
            timestamp: timestamp.to_string(),
            created_at: Local::now().to_rfc3339(),
            items,
            backup_filename: file_name.to_string(),
        };
        let manifest_json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| UpdateError::BackupFailed(format!("manifest: {e}")))?;
        fs::write(staging.join(MANIFEST_FILE_NAME), manifest_json)
            .map_err(|e| UpdateError::BackupFailed(format!("manifest: {e}")))?;

        let partial = self.backup_dir.join(format!(".{file_name}.partial"));
        if let Err(e) = write_tar_gz(staging, &partial) {
            let _ = fs::remove_file(&partial);
            return Err(UpdateError::BackupFailed(format!(
                "writing {}: {e}",
                partial.display()
            )));
        }
        if let Err(e) = fs::rename(&partial, path) {
            let _ = fs::remove_file(&partial);
            return Err(UpdateError::BackupFailed(format!(
                "finalizing {}: {e}",
                path.display()
            )));
        }

        let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        info!(
            "Backup {} created: {} items, {:.2} MB",
            path.display(),
            manifest.items.len(),
            size as f64 / 1024.0 / 1024.0
        );

        Ok(BackupArchive {
            path: path.to_path_buf(),
            manifest,
        })
    }
}

/// Compresses the top-level entries of `source_dir` into a gzip tarball without a wrapping folder.
fn write_tar_gz(source_dir: &Path, archive: &Path) -> std::io::Result<()> {
    let file = File::create(archive)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut entries = fs::read_dir(source_dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name();
        if entry.file_type()?.is_dir() {
            builder.append_dir_all(&name, entry.path())?;
        } else {
            builder.append_path_with_name(entry.path(), &name)?;
        }
    }

    let mut writer = builder.into_inner()?.finish()?;
    writer.flush()?;
    writer.get_ref().sync_all()
}
