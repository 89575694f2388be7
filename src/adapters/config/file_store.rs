use crate::config::DEFAULT_CONFIG_FILE_NAME;
use crate::config::models::AppConfig;
use crate::core::error::ConfigError;
use crate::ports::ConfigurationStore;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub(crate) struct TomlFileConfigAdapter {
    base_path: PathBuf,
}

impl TomlFileConfigAdapter {
    pub(crate) fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn read_toml_file<T: DeserializeOwned>(&self, file_path: &Path) -> Result<T, ConfigError> {
        debug!("Reading TOML file: {:?}", file_path);
        let content = fs::read_to_string(file_path).map_err(|e| ConfigError::ReadFile {
            path: file_path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Deserialize {
            path: file_path.to_path_buf(),
            source: Box::new(e),
        })
    }

    fn write_toml_file<T: Serialize>(&self, data: &T, file_path: &Path) -> Result<(), ConfigError> {
        debug!("Writing TOML file: {:?}", file_path);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let content =
            toml::to_string_pretty(data).map_err(|e| ConfigError::Serialize(Box::new(e)))?;
        fs::write(file_path, content).map_err(|e| ConfigError::WriteFile {
            path: file_path.to_path_buf(),
            source: e,
        })
    }

    fn validate(config: &AppConfig) -> Result<(), ConfigError> {
        config
            .release_source
            .validate()
            .map_err(|e| ConfigError::InvalidValue {
                field: "release_source.api_base".to_string(),
                message: e.to_string(),
            })?;
        regex::Regex::new(&config.deployment.version_pattern).map_err(|e| {
            ConfigError::InvalidValue {
                field: "deployment.version_pattern".to_string(),
                message: e.to_string(),
            }
        })?;
        if let Some(conflict) = config.scratch_layout_conflict() {
            return Err(ConfigError::InvalidValue {
                field: "deployment.scratch_dir".to_string(),
                message: conflict,
            });
        }
        if config.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry.max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if config.download.chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "download.chunk_size".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

impl ConfigurationStore for TomlFileConfigAdapter {
    fn load_app_config_file(&self, path: &Path) -> Result<AppConfig, ConfigError> {
        let config = if path.exists() {
            info!("Loading configuration from {:?}", path);
            self.read_toml_file(path)?
        } else {
            info!("No configuration file at {:?}, using defaults", path);
            AppConfig::default()
        };
        Self::validate(&config)?;
        Ok(config)
    }

    fn save_app_config_file(&self, config: &AppConfig, path: &Path) -> Result<(), ConfigError> {
        Self::validate(config)?;
        self.write_toml_file(config, path)?;
        info!("Configuration written to {:?}", path);
        Ok(())
    }

    fn get_default_config_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.base_path.join(DEFAULT_CONFIG_FILE_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[test]
    fn missing_file_loads_defaults() {
        let dir = TempDir::new().unwrap();
        let store = TomlFileConfigAdapter::new(dir.path().to_path_buf());
        let path = store.get_default_config_path().unwrap();

        let config = store.load_app_config_file(&path).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = TempDir::new().unwrap();
        let store = TomlFileConfigAdapter::new(dir.path().to_path_buf());
        let path = dir.path().join("nested").join(DEFAULT_CONFIG_FILE_NAME);

        let mut config = AppConfig::default();
        config.deployment.root = dir.path().join("app");
        config.retry.max_attempts = 2;
        store.save_app_config_file(&config, &path).unwrap();

        assert_eq!(store.load_app_config_file(&path).unwrap(), config);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = TomlFileConfigAdapter::new(dir.path().to_path_buf());
        let path = dir.path().join(DEFAULT_CONFIG_FILE_NAME);

        fs::write(&path, "[retry]\nmax_attempts = 0\n").unwrap();
        assert_matches!(
            store.load_app_config_file(&path),
            Err(ConfigError::InvalidValue { field, .. }) if field == "retry.max_attempts"
        );

        fs::write(&path, "[deployment]\nversion_pattern = \"(unclosed\"\n").unwrap();
        assert_matches!(
            store.load_app_config_file(&path),
            Err(ConfigError::InvalidValue { field, .. }) if field == "deployment.version_pattern"
        );

        fs::write(
            &path,
            "[deployment]\nscratch_dir = \"/var/lib/upkeep\"\n\n[backup]\ndir = \"/var/lib/upkeep/backups\"\n",
        )
        .unwrap();
        assert_matches!(
            store.load_app_config_file(&path),
            Err(ConfigError::InvalidValue { field, .. }) if field == "deployment.scratch_dir"
        );

        fs::write(&path, "[retry\n").unwrap();
        assert_matches!(
            store.load_app_config_file(&path),
            Err(ConfigError::Deserialize { .. })
        );
    }
}
