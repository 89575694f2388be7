use crate::adapters::update::checksum::{digests_match, parse_checksum_file, sha256_file};
use crate::adapters::update::release_source::{GITHUB_ACCEPT, classify_status};
use crate::adapters::update::retry::with_backoff;
use crate::config::models::{ChecksumPolicy, DownloadConfig, ReleaseSourceConfig, RetryConfig};
use crate::core::error::UpdateError;
use crate::core::types::ReleaseDescriptor;
use reqwest::Client;
use reqwest::header::{ACCEPT, USER_AGENT};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

const ARCHIVE_EXTENSIONS: [&str; 3] = [".tar.gz", ".tgz", ".zip"];

/// What to download for a release and how to verify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DownloadPlan {
    pub url: String,
    pub file_name: String,
    pub checksum_url: Option<String>,
}

/// First archive asset wins; without one, the source tarball of the tag is used.
pub(crate) fn select_download(
    config: &ReleaseSourceConfig,
    release: &ReleaseDescriptor,
) -> DownloadPlan {
    let archive = release.assets.iter().find(|asset| {
        let name = asset.name.to_lowercase();
        ARCHIVE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
    });

    match archive {
        Some(asset) => {
            let checksum_url = release
                .asset_named(&format!("{}.sha256", asset.name))
                .map(|a| a.download_url.clone());
            DownloadPlan {
                url: asset.download_url.clone(),
                file_name: asset.name.clone(),
                checksum_url,
            }
        }
        None => DownloadPlan {
            url: config.endpoint(&format!("tarball/{}", release.tag_name)),
            file_name: format!("{}.tar.gz", release.version),
            checksum_url: None,
        },
    }
}

pub(crate) struct PackageFetcher {
    config: ReleaseSourceConfig,
    download: DownloadConfig,
    retry: RetryConfig,
    http_client: Client,
    token: Option<String>,
}

impl PackageFetcher {
    pub(crate) fn new(
        config: ReleaseSourceConfig,
        download: DownloadConfig,
        retry: RetryConfig,
        http_client: Client,
    ) -> Self {
        let token = config.resolve_token();
        Self {
            config,
            download,
            retry,
            http_client,
            token,
        }
    }

    /// Downloads the release package into `dest_dir` and returns the archive path.
    pub(crate) async fn download(
        &self,
        release: &ReleaseDescriptor,
        dest_dir: &Path,
    ) -> Result<PathBuf, UpdateError> {
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(UpdateError::fs(dest_dir))?;

        let plan = select_download(&self.config, release);
        let file_name = Path::new(&plan.file_name)
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| {
                UpdateError::DownloadFailed(format!("unusable asset name '{}'", plan.file_name))
            })?;
        let target = dest_dir.join(file_name);

        info!("Downloading {} from {}", plan.file_name, plan.url);
        let what = format!("download {}", plan.file_name);
        let authenticated =
            with_backoff(&self.retry, &what, || self.download_once(&plan.url, &target, true))
                .await;

        if let Err(primary) = authenticated {
            warn!(
                "Download of {} failed ({}), trying once without credentials",
                plan.url, primary
            );
            self.download_once(&plan.url, &target, false)
                .await
                .map_err(|fallback| {
                    UpdateError::DownloadFailed(format!(
                        "{primary}; unauthenticated fallback: {fallback}"
                    ))
                })?;
        }

        if let Some(checksum_url) = &plan.checksum_url {
            self.verify_checksum(&target, checksum_url).await?;
        }

        Ok(target)
    }

    async fn download_once(
        &self,
        url: &str,
        target: &Path,
        authenticated: bool,
    ) -> Result<u64, UpdateError> {
        let mut request = self
            .http_client
            .get(url)
            .header(USER_AGENT, &self.config.user_agent)
            .header(ACCEPT, GITHUB_ACCEPT);
        if authenticated {
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
        }

        let mut response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &headers, &body, url));
        }

        let total = response.content_length().filter(|t| *t > 0);
        if let Some(total) = total {
            info!("Package size: {} bytes", total);
        }

        let file = tokio::fs::File::create(target)
            .await
            .map_err(UpdateError::fs(target))?;
        let mut writer = BufWriter::with_capacity(self.download.chunk_size, file);
        let mut downloaded: u64 = 0;
        let mut next_mark: u64 = 20;

        while let Some(chunk) = response.chunk().await? {
            writer
                .write_all(&chunk)
                .await
                .map_err(UpdateError::fs(target))?;
            downloaded += chunk.len() as u64;

            if let Some(total) = total {
                let percent = downloaded.saturating_mul(100) / total;
                if percent >= next_mark {
                    info!("Download progress: {}%", percent.min(100));
                    next_mark = (percent / 20 + 1) * 20;
                }
            }
        }
        writer.flush().await.map_err(UpdateError::fs(target))?;

        info!("Downloaded {} bytes to {}", downloaded, target.display());
        Ok(downloaded)
    }

    async fn fetch_expected_digest(&self, url: &str) -> Result<Option<String>, UpdateError> {
        let mut request = self
            .http_client
            .get(url)
            .header(USER_AGENT, &self.config.user_agent);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &headers, &body, url));
        }
        let content = response.text().await?;
        Ok(parse_checksum_file(&content))
    }

    async fn verify_checksum(&self, archive: &Path, checksum_url: &str) -> Result<(), UpdateError> {
        info!("Verifying package checksum");
        let expected = match self.fetch_expected_digest(checksum_url).await {
            Ok(Some(digest)) => digest,
            Ok(None) => {
                return self.checksum_unavailable(format!(
                    "no SHA-256 digest found in {checksum_url}"
                ));
            }
            Err(e) => {
                return self.checksum_unavailable(format!(
                    "could not fetch {checksum_url}: {e}"
                ));
            }
        };

        let path = archive.to_path_buf();
        let actual = tokio::task::spawn_blocking(move || sha256_file(&path))
            .await
            .map_err(|e| UpdateError::TaskFailed(format!("checksum task: {e}")))??;
        debug!("Package SHA-256: {}", actual);

        if digests_match(&expected, &actual) {
            info!("Checksum verified");
            return Ok(());
        }

        match self.download.checksum_policy {
            ChecksumPolicy::Warn => {
                warn!(
                    "Checksum mismatch for {}: expected {}, computed {}. Continuing",
                    archive.display(),
                    expected,
                    actual
                );
                Ok(())
            }
            ChecksumPolicy::Reject => Err(UpdateError::ChecksumMismatch {
                path: archive.to_path_buf(),
                expected,
                actual,
            }),
        }
    }

    fn checksum_unavailable(&self, reason: String) -> Result<(), UpdateError> {
        match self.download.checksum_policy {
            ChecksumPolicy::Warn => {
                warn!("Skipping checksum verification: {}", reason);
                Ok(())
            }
            ChecksumPolicy::Reject => Err(UpdateError::DownloadFailed(reason)),
        }
    }
}
