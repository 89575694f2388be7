use super::test_utils::*;
use crate::adapters::update::applier::AtomicApplier;
use crate::adapters::update::backup::BackupArchiver;
use crate::adapters::update::catalog::BackupCatalog;
use crate::adapters::update::extractor::PackageExtractor;
use crate::adapters::update::installer::{CopyFilter, FsItemInstaller};
use crate::adapters::update::rollback::{RestoreRequest, run_worker};
use crate::adapters::update::validator::UpdateValidator;
use crate::config::models::{DeploymentConfig, ValidationConfig};
use crate::core::version::VersionResolver;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

/// Backup of 3.0.0, apply 3.1.0, then restore the backup through the worker body.
#[tokio::test]
async fn rollback_restores_recorded_content_after_an_update() {
    let tmp = create_test_dir();
    let config = DeploymentConfig {
        root: tmp.path().join("app"),
        scratch_dir: tmp.path().join("scratch"),
        ..DeploymentConfig::default()
    };
    let backup_dir = tmp.path().join("backups");
    write_package(&config.root, "3.0.0");
    fs::write(config.root.join("docker-compose.yml"), "services: {}\n").unwrap();
    let before = deployment_digests(&config.root, &config.tracked_items);

    let versions = VersionResolver::new(&config).unwrap();
    let backup = BackupArchiver::new(
        config.root.clone(),
        backup_dir.clone(),
        config.scratch_dir.clone(),
        config.tracked_items.clone(),
        versions.clone(),
    )
    .capture()
    .await
    .unwrap();

    let package_dir = tmp.path().join("package");
    write_package(&package_dir, "3.1.0");
    fs::write(package_dir.join("frontend/gallery.js"), "render()").unwrap();
    let tarball = tmp.path().join("site-3.1.0.tar.gz");
    tar_directory(&package_dir, &tarball, "acme-site-3.1.0");
    let project_root = PackageExtractor::extract(&tarball, &config.scratch_dir.join("extracted"))
        .await
        .unwrap();

    let validator = UpdateValidator::new(&ValidationConfig::default(), &config).unwrap();
    AtomicApplier::new(
        config.root.clone(),
        config.tracked_items.clone(),
        validator,
        Arc::new(FsItemInstaller::new(CopyFilter::from_config(&config))),
    )
    .apply(&project_root, &config.scratch_dir.join("temp_backup"))
    .await
    .unwrap();
    assert_eq!(versions.current().await, "3.1.0");
    assert!(config.root.join("frontend/gallery.js").is_file());

    let listed = BackupCatalog::new(backup_dir.clone()).list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].path, backup.path);

    let report = run_worker(
        RestoreRequest {
            archive: listed[0].path.clone(),
            deployment_root: config.root.clone(),
            scratch_root: config.scratch_dir.clone(),
            fallback_items: config.tracked_items.clone(),
        },
        Duration::from_secs(1),
    )
    .await
    .unwrap();

    assert_eq!(report.version.as_deref(), Some("3.0.0"));
    assert_eq!(report.restored, backup.manifest.items);
    assert_eq!(versions.current().await, "3.0.0");
    assert_eq!(deployment_digests(&config.root, &config.tracked_items), before);
    assert!(!config.root.join("frontend/gallery.js").exists());
}
