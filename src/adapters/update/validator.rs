use crate::config::models::{DeploymentConfig, ValidationConfig};
use crate::core::version::extract_version;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Checks that an extracted package has the shape of an installable deployment.
#[derive(Debug, Clone)]
pub(crate) struct UpdateValidator {
    required_files: Vec<String>,
    required_dirs: Vec<String>,
    version_file: String,
    version_pattern: Regex,
}

impl UpdateValidator {
    pub(crate) fn new(
        validation: &ValidationConfig,
        deployment: &DeploymentConfig,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            required_files: validation.required_files.clone(),
            required_dirs: validation.required_dirs.clone(),
            version_file: deployment.version_file.clone(),
            version_pattern: Regex::new(&deployment.version_pattern)?,
        })
    }

    /// Never fails; every unmet requirement is logged and yields `false`.
    pub(crate) fn validate(&self, project_root: &Path) -> bool {
        match self.check(project_root) {
            Ok(version) => {
                info!(
                    "Package at {} passed validation (version {})",
                    project_root.display(),
                    version
                );
                true
            }
            Err(problem) => {
                error!("Package validation failed: {}", problem);
                false
            }
        }
    }

    /// The version declared by a valid package, or a description of the first unmet requirement.
    pub(crate) fn check(&self, project_root: &Path) -> Result<String, String> {
        let missing: Vec<&str> = self
            .required_files
            .iter()
            .filter(|f| !project_root.join(f).is_file())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(format!("missing required files: {}", missing.join(", ")));
        }

        for dir in &self.required_dirs {
            if !project_root.join(dir).is_dir() {
                return Err(format!("required directory '{dir}' is missing or not a directory"));
            }
        }

        let version_path: PathBuf = project_root.join(&self.version_file);
        let content = std::fs::read_to_string(&version_path)
            .map_err(|e| format!("cannot read {}: {e}", version_path.display()))?;
        extract_version(&self.version_pattern, &content).ok_or_else(|| {
            format!(
                "{} has no recognizable version assignment",
                self.version_file
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::update::tests::write_package;
    use tempfile::TempDir;

    fn validator() -> UpdateValidator {
        UpdateValidator::new(&ValidationConfig::default(), &DeploymentConfig::default()).unwrap()
    }

    #[test]
    fn complete_package_is_valid() {
        let dir = TempDir::new().unwrap();
        write_package(dir.path(), "3.1.0");
        assert!(validator().validate(dir.path()));
        assert_eq!(validator().check(dir.path()).unwrap(), "3.1.0");
    }

    #[test]
    fn missing_entry_point_fails() {
        let dir = TempDir::new().unwrap();
        write_package(dir.path(), "3.1.0");
        std::fs::remove_file(dir.path().join("backend/main.py")).unwrap();

        assert!(!validator().validate(dir.path()));
        assert!(validator().check(dir.path()).unwrap_err().contains("backend/main.py"));
    }

    #[test]
    fn missing_frontend_directory_fails() {
        let dir = TempDir::new().unwrap();
        write_package(dir.path(), "3.1.0");
        std::fs::remove_dir_all(dir.path().join("frontend")).unwrap();
        std::fs::write(dir.path().join("frontend"), "not a dir").unwrap();

        assert!(!validator().validate(dir.path()));
    }

    #[test]
    fn version_file_without_assignment_fails() {
        let dir = TempDir::new().unwrap();
        write_package(dir.path(), "3.1.0");
        std::fs::write(dir.path().join("backend/core/version.py"), "VERSION = '3.1.0'\n").unwrap();

        assert!(!validator().validate(dir.path()));
    }

    #[test]
    fn nonexistent_root_is_invalid_not_an_error() {
        assert!(!validator().validate(Path::new("/definitely/not/here")));
    }
}
