use crate::config::models::DeploymentConfig;
use std::fs;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// Files and directories left out when copying a package into place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CopyFilter {
    skip_file_suffixes: Vec<String>,
    skip_dir_names: Vec<String>,
}

impl CopyFilter {
    /// Copies everything.
    pub(crate) fn none() -> Self {
        Self::default()
    }

    pub(crate) fn from_config(config: &DeploymentConfig) -> Self {
        Self {
            skip_file_suffixes: config.skip_file_suffixes.clone(),
            skip_dir_names: config.skip_dir_names.clone(),
        }
    }

    fn skips_dir(&self, name: &str) -> bool {
        self.skip_dir_names.iter().any(|d| d == name)
    }

    fn skips_file(&self, name: &str) -> bool {
        self.skip_file_suffixes.iter().any(|s| name.ends_with(s.as_str()))
    }
}

/// Replaces one deployment item with a new copy. Blocking.
pub(crate) trait ItemInstaller: Send + Sync {
    /// Deletes `target` (file or whole directory) and copies `source` into its place.
    /// Returns the number of files written.
    fn replace(&self, item: &str, source: &Path, target: &Path) -> io::Result<usize>;
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FsItemInstaller {
    filter: CopyFilter,
}

impl FsItemInstaller {
    pub(crate) fn new(filter: CopyFilter) -> Self {
        Self { filter }
    }
}

impl ItemInstaller for FsItemInstaller {
    fn replace(&self, _item: &str, source: &Path, target: &Path) -> io::Result<usize> {
        remove_path(target)?;
        copy_tree(source, target, &self.filter)
    }
}

/// Removes a file, symlink or directory tree. A missing path is not an error.
pub(crate) fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub(crate) fn path_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Copies a file or walks a directory file by file. Returns the number of files copied.
pub(crate) fn copy_tree(source: &Path, target: &Path, filter: &CopyFilter) -> io::Result<usize> {
    let meta = fs::symlink_metadata(source)?;
    if !meta.is_dir() {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        copy_entry(source, target, &meta)?;
        return Ok(1);
    }

    fs::create_dir_all(target)?;
    let mut copied = 0;
    let walker = WalkDir::new(source)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir() && filter.skips_dir(&e.file_name().to_string_lossy()))
        });

    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let destination = target.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination)?;
            continue;
        }
        if filter.skips_file(&entry.file_name().to_string_lossy()) {
            continue;
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        let meta = entry.path().symlink_metadata()?;
        copy_entry(entry.path(), &destination, &meta)?;
        copied += 1;
    }
    Ok(copied)
}

fn copy_entry(source: &Path, target: &Path, meta: &fs::Metadata) -> io::Result<()> {
    #[cfg(unix)]
    if meta.file_type().is_symlink() {
        let link = fs::read_link(source)?;
        remove_path(target)?;
        return std::os::unix::fs::symlink(link, target);
    }
    let _ = meta;
    fs::copy(source, target).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn replaces_directory_and_skips_compiled_caches() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("new/backend");
        let target = dir.path().join("live/backend");

        fs::create_dir_all(source.join("core/__pycache__")).unwrap();
        fs::write(source.join("main.py"), "new").unwrap();
        fs::write(source.join("core/version.py"), "__version__ = '2'").unwrap();
        fs::write(source.join("core/__pycache__/version.cpython-311.pyc"), "bytecode").unwrap();
        fs::write(source.join("stale.pyc"), "bytecode").unwrap();

        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("obsolete.py"), "old").unwrap();

        let installer = FsItemInstaller::new(CopyFilter::from_config(&DeploymentConfig::default()));
        let copied = installer.replace("backend", &source, &target).unwrap();

        assert_eq!(copied, 2);
        assert_eq!(fs::read_to_string(target.join("main.py")).unwrap(), "new");
        assert!(!target.join("obsolete.py").exists());
        assert!(!target.join("stale.pyc").exists());
        assert!(!target.join("core/__pycache__").exists());
    }

    #[test]
    fn replaces_single_file() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("Dockerfile.new");
        let target = dir.path().join("Dockerfile");
        fs::write(&source, "FROM new").unwrap();
        fs::write(&target, "FROM old").unwrap();

        let copied = FsItemInstaller::default()
            .replace("Dockerfile", &source, &target)
            .unwrap();
        assert_eq!(copied, 1);
        assert_eq!(fs::read_to_string(&target).unwrap(), "FROM new");
    }

    #[test]
    fn unfiltered_copy_keeps_everything() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("src");
        fs::create_dir_all(source.join("__pycache__")).unwrap();
        fs::create_dir_all(source.join("empty")).unwrap();
        fs::write(source.join("__pycache__/a.pyc"), "x").unwrap();

        let target = dir.path().join("dst");
        assert_eq!(copy_tree(&source, &target, &CopyFilter::none()).unwrap(), 1);
        assert!(target.join("__pycache__/a.pyc").is_file());
        assert!(target.join("empty").is_dir());
    }

    #[test]
    fn removing_missing_path_is_ok() {
        let dir = TempDir::new().unwrap();
        assert!(remove_path(&dir.path().join("nothing")).is_ok());
    }
}
