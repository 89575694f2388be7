use crate::config::models::AppConfig;
use crate::core::error::{ConfigError, UpdateError};
use crate::core::types::{
    BackupInfo, ReleaseDescriptor, RollbackStatus, UpdateCheck, UpdateResult, VersionInfo,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub(crate) trait ConfigurationStore: Send + Sync {
    fn load_app_config_file(&self, path: &Path) -> Result<AppConfig, ConfigError>;
    fn save_app_config_file(&self, config: &AppConfig, path: &Path) -> Result<(), ConfigError>;
    fn get_default_config_path(&self) -> Result<PathBuf, ConfigError>;
}

/// Remote release metadata.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub(crate) trait ReleaseSourcePort: Send + Sync {
    /// Latest published release. Served from cache unless `force_refresh` is set.
    async fn latest(&self, force_refresh: bool) -> Result<ReleaseDescriptor, UpdateError>;
    /// Release for a version, with or without the leading `v`.
    async fn by_tag(&self, tag: &str) -> Result<ReleaseDescriptor, UpdateError>;
}

/// The administrative operations exposed to callers that already passed authorization.
#[async_trait]
pub(crate) trait UpdateManagerPort: Send + Sync {
    async fn version_info(&self) -> VersionInfo;
    async fn check_update(&self, force_refresh: bool) -> Result<UpdateCheck, UpdateError>;
    async fn execute_update(&self) -> UpdateResult;
    async fn list_backups(&self) -> Result<Vec<BackupInfo>, UpdateError>;
    async fn rollback(&self, backup_path: &Path) -> Result<RollbackStatus, UpdateError>;
}
