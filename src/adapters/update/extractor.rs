use crate::core::error::UpdateError;
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArchiveFormat {
    Zip,
    TarGz,
}

impl ArchiveFormat {
    pub(crate) fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else {
            None
        }
    }
}

/// Unpacks a downloaded package and finds its project root.
pub(crate) struct PackageExtractor;

impl PackageExtractor {
    /// Extracts `archive` into `dest` on a blocking worker and returns the project root.
    pub(crate) async fn extract(archive: &Path, dest: &Path) -> Result<PathBuf, UpdateError> {
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract_archive(&archive, &dest))
            .await
            .map_err(|e| UpdateError::TaskFailed(format!("extraction task: {e}")))?
    }
}

pub(crate) fn extract_archive(archive: &Path, dest: &Path) -> Result<PathBuf, UpdateError> {
    let format =
        ArchiveFormat::detect(archive).ok_or_else(|| UpdateError::UnsupportedArchive(archive.to_path_buf()))?;

    fs::create_dir_all(dest).map_err(UpdateError::fs(dest))?;
    info!("Extracting {} into {}", archive.display(), dest.display());

    match format {
        ArchiveFormat::TarGz => unpack_tar_gz(archive, dest)?,
        ArchiveFormat::Zip => unpack_zip(archive, dest)?,
    }

    project_root(archive, dest)
}

pub(crate) fn unpack_tar_gz(archive: &Path, dest: &Path) -> Result<(), UpdateError> {
    let file = File::open(archive).map_err(UpdateError::fs(archive))?;
    let decoder = flate2::read::GzDecoder::new(BufReader::new(file));
    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);
    tar.unpack(dest).map_err(|e| classify_io(archive, dest, e))
}

fn unpack_zip(archive: &Path, dest: &Path) -> Result<(), UpdateError> {
    let file = File::open(archive).map_err(UpdateError::fs(archive))?;
    let mut zip = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| classify_zip(archive, dest, e))?;
    debug!("Zip archive holds {} entries", zip.len());
    zip.extract(dest).map_err(|e| classify_zip(archive, dest, e))
}

/// Single top-level directory => that directory, otherwise the extraction directory itself.
fn project_root(archive: &Path, dest: &Path) -> Result<PathBuf, UpdateError> {
    let entries = fs::read_dir(dest)
        .map_err(UpdateError::fs(dest))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(UpdateError::fs(dest))?;

    match entries.as_slice() {
        [] => Err(UpdateError::EmptyArchive(archive.to_path_buf())),
        [only] if only.path().is_dir() => {
            info!("Project root: {}", only.path().display());
            Ok(only.path())
        }
        _ => {
            info!("Using extraction directory as project root");
            Ok(dest.to_path_buf())
        }
    }
}

fn classify_io(archive: &Path, dest: &Path, e: std::io::Error) -> UpdateError {
    match e.kind() {
        ErrorKind::PermissionDenied | ErrorKind::AlreadyExists | ErrorKind::NotFound => {
            UpdateError::FileSystem {
                path: dest.to_path_buf(),
                source: e,
            }
        }
        _ => UpdateError::CorruptArchive {
            path: archive.to_path_buf(),
            details: e.to_string(),
        },
    }
}

fn classify_zip(archive: &Path, dest: &Path, e: zip::result::ZipError) -> UpdateError {
    match e {
        zip::result::ZipError::Io(io) => classify_io(archive, dest, io),
        other => UpdateError::CorruptArchive {
            path: archive.to_path_buf(),
            details: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::update::tests::{write_tar_gz, write_zip};
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[test]
    fn detects_formats_by_extension() {
        assert_eq!(ArchiveFormat::detect(Path::new("a/site.tar.gz")), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect(Path::new("site.TGZ")), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect(Path::new("site.zip")), Some(ArchiveFormat::Zip));
        assert_eq!(ArchiveFormat::detect(Path::new("site.rar")), None);
    }

    #[tokio::test]
    async fn single_wrapping_directory_becomes_project_root() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("site.tar.gz");
        write_tar_gz(
            &archive,
            &[
                ("acme-site-abc123/backend/main.py", "print('hi')"),
                ("acme-site-abc123/frontend/index.html", "<html/>"),
            ],
        );

        let dest = dir.path().join("extracted");
        let root = PackageExtractor::extract(&archive, &dest).await.unwrap();
        assert_eq!(root, dest.join("acme-site-abc123"));
        assert!(root.join("backend/main.py").is_file());
    }

    #[tokio::test]
    async fn flat_layout_uses_extraction_directory() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("site.zip");
        write_zip(
            &archive,
            &[("backend/main.py", "print('hi')"), ("Dockerfile", "FROM scratch")],
        );

        let dest = dir.path().join("extracted");
        let root = PackageExtractor::extract(&archive, &dest).await.unwrap();
        assert_eq!(root, dest);
        assert!(root.join("Dockerfile").is_file());
    }

    #[tokio::test]
    async fn corrupt_archives_are_classified() {
        let dir = TempDir::new().unwrap();
        let tarball = dir.path().join("broken.tar.gz");
        std::fs::write(&tarball, b"this is not gzip data at all").unwrap();
        assert_matches!(
            PackageExtractor::extract(&tarball, &dir.path().join("a")).await,
            Err(UpdateError::CorruptArchive { .. })
        );

        let zip = dir.path().join("broken.zip");
        std::fs::write(&zip, b"PK but not really").unwrap();
        assert_matches!(
            PackageExtractor::extract(&zip, &dir.path().join("b")).await,
            Err(UpdateError::CorruptArchive { .. })
        );
    }

    #[tokio::test]
    async fn empty_archive_is_reported() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("empty.tar.gz");
        write_tar_gz(&archive, &[]);
        assert_matches!(
            PackageExtractor::extract(&archive, &dir.path().join("out")).await,
            Err(UpdateError::EmptyArchive(_))
        );
    }

    #[tokio::test]
    async fn unknown_extension_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("site.rar");
        std::fs::write(&archive, b"rar").unwrap();
        assert_matches!(
            PackageExtractor::extract(&archive, &dir.path().join("out")).await,
            Err(UpdateError::UnsupportedArchive(_))
        );
    }
}
