use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub release_source: ReleaseSourceConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub rollback: RollbackConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cli: CliConfig,
}

impl AppConfig {
    /// The scratch directory is wiped after every attempt, so it must not hold
    /// the backups or the deployment, nor live inside the backup directory.
    pub fn scratch_layout_conflict(&self) -> Option<String> {
        let scratch = absolute(&self.deployment.scratch_dir);
        let backups = absolute(&self.backup.dir);
        let root = absolute(&self.deployment.root);

        if backups.starts_with(&scratch) {
            Some(format!(
                "{} would delete backup directory {} on cleanup",
                scratch.display(),
                backups.display()
            ))
        } else if scratch.starts_with(&backups) {
            Some(format!(
                "{} lies inside backup directory {}",
                scratch.display(),
                backups.display()
            ))
        } else if root.starts_with(&scratch) {
            Some(format!(
                "{} would delete deployment root {} on cleanup",
                scratch.display(),
                root.display()
            ))
        } else {
            None
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// The live deployment the engine manages and the items it replaces.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeploymentConfig {
    #[serde(default = "default_deployment_root")]
    pub root: PathBuf,
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    #[serde(default = "default_tracked_items")]
    pub tracked_items: Vec<String>,
    /// Path of the version descriptor, relative to the deployment root.
    #[serde(default = "default_version_file")]
    pub version_file: String,
    /// Regex with one capture group holding the version string.
    #[serde(default = "default_version_pattern")]
    pub version_pattern: String,
    #[serde(default = "default_fallback_version")]
    pub fallback_version: String,
    #[serde(default = "default_skip_file_suffixes")]
    pub skip_file_suffixes: Vec<String>,
    #[serde(default = "default_skip_dir_names")]
    pub skip_dir_names: Vec<String>,
}
fn default_deployment_root() -> PathBuf {
    PathBuf::from("/app")
}
fn default_scratch_dir() -> PathBuf {
    PathBuf::from("/app/temp_update")
}
fn default_tracked_items() -> Vec<String> {
    [
        "backend",
        "frontend",
        "Dockerfile",
        "docker-compose.yml",
        "requirements.txt",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_version_file() -> String {
    "backend/core/version.py".to_string()
}
fn default_version_pattern() -> String {
    r#"__version__\s*=\s*["']([^"']+)["']"#.to_string()
}
fn default_fallback_version() -> String {
    "3.0.0".to_string()
}
fn default_skip_file_suffixes() -> Vec<String> {
    vec![".pyc".to_string()]
}
fn default_skip_dir_names() -> Vec<String> {
    vec!["__pycache__".to_string()]
}
impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            root: default_deployment_root(),
            scratch_dir: default_scratch_dir(),
            tracked_items: default_tracked_items(),
            version_file: default_version_file(),
            version_pattern: default_version_pattern(),
            fallback_version: default_fallback_version(),
            skip_file_suffixes: default_skip_file_suffixes(),
            skip_dir_names: default_skip_dir_names(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReleaseSourceConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    pub token: Option<String>,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_cache_ttl")]
    pub cache_ttl: Duration,
}
fn default_api_base() -> String {
    "https://api.github.com/repos/YunJian101/Random-Pictures".to_string()
}
fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}
fn default_user_agent() -> String {
    format!("upkeep/{}", env!("CARGO_PKG_VERSION"))
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_cache_ttl() -> Duration {
    Duration::from_secs(300)
}
impl Default for ReleaseSourceConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            token: None,
            token_env: default_token_env(),
            user_agent: default_user_agent(),
            request_timeout: default_request_timeout(),
            cache_ttl: default_cache_ttl(),
        }
    }
}

impl ReleaseSourceConfig {
    /// Explicit token first, then the configured environment variable. Empty values count as unset.
    pub fn resolve_token(&self) -> Option<String> {
        let present = |t: &String| !t.trim().is_empty();
        self.token
            .clone()
            .filter(present)
            .or_else(|| std::env::var(&self.token_env).ok().filter(present))
    }

    pub fn validate(&self) -> Result<(), url::ParseError> {
        Url::parse(&self.api_base).map(|_| ())
    }

    /// `api_base` joined with a relative path, without losing the repo segments of the base.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.api_base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay() -> Duration {
    Duration::from_secs(2)
}
fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}
impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumPolicy {
    /// Log a mismatch and keep going.
    #[default]
    Warn,
    /// Refuse the package on mismatch.
    Reject,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DownloadConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub checksum_policy: ChecksumPolicy,
}
fn default_chunk_size() -> usize {
    8192
}
impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            checksum_policy: ChecksumPolicy::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ValidationConfig {
    #[serde(default = "default_required_files")]
    pub required_files: Vec<String>,
    #[serde(default = "default_required_dirs")]
    pub required_dirs: Vec<String>,
}
fn default_required_files() -> Vec<String> {
    vec![
        "backend/main.py".to_string(),
        "backend/core/version.py".to_string(),
    ]
}
fn default_required_dirs() -> Vec<String> {
    vec!["backend".to_string(), "frontend".to_string()]
}
impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            required_files: default_required_files(),
            required_dirs: default_required_dirs(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    #[serde(default = "default_backup_dir")]
    pub dir: PathBuf,
}
fn default_backup_dir() -> PathBuf {
    PathBuf::from("/app/backups")
}
impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: default_backup_dir(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RollbackConfig {
    #[serde(with = "humantime_serde", default = "default_grace_period")]
    pub grace_period: Duration,
    pub log_file: Option<PathBuf>,
}
fn default_grace_period() -> Duration {
    Duration::from_secs(1)
}
impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
            log_file: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> LogFormat {
    LogFormat::Compact
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct CliConfig {
    #[serde(default = "default_true")]
    pub enable_colors: bool,
}
fn default_true() -> bool {
    true
}
impl Default for CliConfig {
    fn default() -> Self {
        Self {
            enable_colors: default_true(),
        }
    }
}
