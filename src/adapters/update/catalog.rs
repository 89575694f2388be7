use crate::adapters::update::backup::TIMESTAMP_FORMAT;
use crate::core::error::UpdateError;
use crate::core::types::BackupInfo;
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const NAME_PREFIX: &str = "backup_";
const NAME_SUFFIX: &str = ".tar.gz";
/// `YYYYMMDD_HHMMSS`
const TIMESTAMP_LEN: usize = 15;

/// Lists the backups in one directory, newest first, using only file names and sizes.
#[derive(Debug, Clone)]
pub(crate) struct BackupCatalog {
    backup_dir: PathBuf,
}

impl BackupCatalog {
    pub(crate) fn new(backup_dir: PathBuf) -> Self {
        Self { backup_dir }
    }

    /// Whether `file_name` follows the `backup_{version}_{YYYYMMDD_HHMMSS}.tar.gz` convention.
    pub(crate) fn matches(file_name: &str) -> bool {
        Self::parse(file_name).is_some()
    }

    /// Version and timestamp encoded in a backup file name.
    pub(crate) fn parse(file_name: &str) -> Option<(String, NaiveDateTime)> {
        let stem = file_name
            .strip_prefix(NAME_PREFIX)?
            .strip_suffix(NAME_SUFFIX)?;
        let split = stem.len().checked_sub(TIMESTAMP_LEN + 1)?;
        let (version, rest) = stem.split_at_checked(split)?;
        let raw_timestamp = rest.strip_prefix('_')?;
        if version.is_empty()
            || !raw_timestamp
                .chars()
                .enumerate()
                .all(|(i, c)| if i == 8 { c == '_' } else { c.is_ascii_digit() })
        {
            return None;
        }
        let timestamp = NaiveDateTime::parse_from_str(raw_timestamp, TIMESTAMP_FORMAT).ok()?;
        Some((version.to_string(), timestamp))
    }

    pub(crate) async fn list(&self) -> Result<Vec<BackupInfo>, UpdateError> {
        let mut entries = match tokio::fs::read_dir(&self.backup_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Backup directory {} does not exist", self.backup_dir.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(UpdateError::fs(&self.backup_dir)(e)),
        };

        let mut backups = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(UpdateError::fs(&self.backup_dir))?
        {
            let filename = entry.file_name().to_string_lossy().to_string();
            let Some((version, timestamp)) = Self::parse(&filename) else {
                continue;
            };
            let size = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta.len(),
                Ok(_) => continue,
                Err(e) => {
                    warn!("Skipping backup {}: {}", filename, e);
                    continue;
                }
            };
            backups.push(BackupInfo {
                path: entry.path(),
                filename,
                version,
                timestamp,
                size,
            });
        }

        backups.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.filename.cmp(&a.filename))
        });
        Ok(backups)
    }

    /// Whether `path` names an existing, conventionally named backup file.
    pub(crate) fn is_backup(path: &Path) -> bool {
        path.is_file()
            && path
                .file_name()
                .is_some_and(|name| Self::matches(&name.to_string_lossy()))
    }
}
