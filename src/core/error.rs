use crate::core::types::ItemFailure;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write configuration file {path}: {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to deserialize configuration from {path}: {source}")]
    Deserialize {
        path: PathBuf,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Failed to serialize configuration: {0}")]
    Serialize(Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Release service unavailable after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<UpdateError>,
    },
    #[error("Release API rejected the configured credentials")]
    BadCredentials,
    #[error("Release API rate limited: {0}")]
    RateLimited(String),
    #[error("Release API denied access: {0}")]
    Forbidden(String),
    #[error("Release or repository not found: {0}")]
    NotFound(String),
    #[error("Unexpected HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },
    #[error("Malformed release API response: {0}")]
    InvalidResponse(String),
    #[error("Download failed: {0}")]
    DownloadFailed(String),
    #[error("Checksum mismatch for {path}: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("Corrupt archive {path}: {details}")]
    CorruptArchive { path: PathBuf, details: String },
    #[error("Unsupported archive format: {0}")]
    UnsupportedArchive(PathBuf),
    #[error("Archive {0} extracted to nothing")]
    EmptyArchive(PathBuf),
    #[error("Update package failed validation: {0}")]
    ValidationFailed(String),
    #[error("Could not stage a safety copy of the deployment: {0}")]
    StagingFailed(String),
    #[error("Update apply failed and was rolled back: {}", format_failures(.failures))]
    ApplyFailed { failures: Vec<ItemFailure> },
    #[error("Update apply failed ({apply}) and restoring the previous state also failed: {restore}")]
    RestoreFailed { apply: String, restore: String },
    #[error("Backup failed: {0}")]
    BackupFailed(String),
    #[error("Rollback failed: {0}")]
    RollbackFailed(String),
    #[error("Another update or rollback is in progress: {0}")]
    UpdateInProgress(String),
    #[error("File system error at {path}: {source}")]
    FileSystem {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl UpdateError {
    pub(crate) fn fs(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> UpdateError {
        let path = path.into();
        move |source| UpdateError::FileSystem { path, source }
    }

    /// Failures worth another attempt: connection, timeout and TLS trouble, interrupted bodies and 5xx.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            UpdateError::Network(e) => {
                e.is_connect() || e.is_timeout() || e.is_request() || e.is_body()
            }
            UpdateError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

fn format_failures(failures: &[ItemFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.item, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Update(#[from] UpdateError),
    #[error("Failed to render output: {0}")]
    Render(#[from] serde_json::Error),
}
