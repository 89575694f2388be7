use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ReleaseAsset {
    pub name: String,
    pub download_url: String,
}

/// One published release as reported by the release API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ReleaseDescriptor {
    /// Tag exactly as published, e.g. `v3.1.0`.
    pub tag_name: String,
    /// Tag with the leading `v` removed.
    pub version: String,
    pub name: String,
    pub body: String,
    pub html_url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub assets: Vec<ReleaseAsset>,
}

impl ReleaseDescriptor {
    pub(crate) fn asset_named(&self, name: &str) -> Option<&ReleaseAsset> {
        self.assets.iter().find(|a| a.name == name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct VersionInfo {
    pub current_version: String,
    pub latest_version: Option<String>,
    pub latest_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct UpdateCheck {
    pub current_version: String,
    pub latest_version: String,
    pub has_update: bool,
    pub release: ReleaseDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum UpdateStage {
    Idle,
    Checking,
    BackingUp,
    Downloading,
    Extracting,
    Validating,
    Applying,
    CleaningUp,
    Done,
    Failed,
}

impl fmt::Display for UpdateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdateStage::Idle => "idle",
            UpdateStage::Checking => "checking",
            UpdateStage::BackingUp => "backing_up",
            UpdateStage::Downloading => "downloading",
            UpdateStage::Extracting => "extracting",
            UpdateStage::Validating => "validating",
            UpdateStage::Applying => "applying",
            UpdateStage::CleaningUp => "cleaning_up",
            UpdateStage::Done => "done",
            UpdateStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct UpdateResult {
    pub success: bool,
    pub message: String,
    pub from_version: String,
    /// Version the deployment runs after the attempt.
    pub version: String,
    pub stage: UpdateStage,
    pub failed_stage: Option<UpdateStage>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub backup_path: Option<PathBuf>,
}

/// Contents of `backup_metadata.json` at the top of every backup archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct BackupManifest {
    pub version: String,
    pub timestamp: String,
    pub created_at: String,
    pub items: Vec<String>,
    pub backup_filename: String,
}

#[derive(Debug, Clone)]
pub(crate) struct BackupArchive {
    pub path: PathBuf,
    pub manifest: BackupManifest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct BackupInfo {
    pub filename: String,
    pub path: PathBuf,
    pub version: String,
    #[serde(serialize_with = "serialize_backup_timestamp")]
    pub timestamp: NaiveDateTime,
    pub size: u64,
}

pub(crate) const BACKUP_TIMESTAMP_DISPLAY: &str = "%Y-%m-%d %H:%M:%S";

fn serialize_backup_timestamp<S: Serializer>(
    timestamp: &NaiveDateTime,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&timestamp.format(BACKUP_TIMESTAMP_DISPLAY))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum RollbackStatus {
    Started,
    Completed,
}

impl fmt::Display for RollbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackStatus::Started => f.write_str("rollback started"),
            RollbackStatus::Completed => f.write_str("rollback completed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct ItemFailure {
    pub item: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct ApplyReport {
    pub replaced: Vec<String>,
    pub files_copied: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub(crate) struct RestoreReport {
    pub version: Option<String>,
    pub restored: Vec<String>,
    pub failed: Vec<ItemFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum MessageLevel {
    Info,
    Warning,
    Error,
}
