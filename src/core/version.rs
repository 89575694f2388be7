use crate::config::models::DeploymentConfig;
use regex::Regex;
use std::cmp::Ordering;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Reads the deployed version and orders version strings.
///
/// Ordering is tolerant: versions are split on `.` and `-`, numeric segments
/// compare as integers and any other segment is reduced to the sum of its
/// character codes. The shorter sequence is padded with zeros. The result is
/// a total order for arbitrary input, so comparison never fails.
#[derive(Debug, Clone)]
pub(crate) struct VersionResolver {
    version_file: PathBuf,
    pattern: Regex,
    fallback: String,
}

impl VersionResolver {
    pub(crate) fn new(config: &DeploymentConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            version_file: config.root.join(&config.version_file),
            pattern: Regex::new(&config.version_pattern)?,
            fallback: config.fallback_version.clone(),
        })
    }

    /// Version of the live deployment, or the configured fallback when it cannot be read.
    pub(crate) async fn current(&self) -> String {
        match tokio::fs::read_to_string(&self.version_file).await {
            Ok(content) => match self.extract(&content) {
                Some(version) => {
                    debug!(
                        "Current version {} read from {}",
                        version,
                        self.version_file.display()
                    );
                    version
                }
                None => {
                    warn!(
                        "No version assignment found in {}, assuming {}",
                        self.version_file.display(),
                        self.fallback
                    );
                    self.fallback.clone()
                }
            },
            Err(e) => {
                warn!(
                    "Cannot read version file {}: {}. Assuming {}",
                    self.version_file.display(),
                    e,
                    self.fallback
                );
                self.fallback.clone()
            }
        }
    }

    fn extract(&self, content: &str) -> Option<String> {
        extract_version(&self.pattern, content)
    }

    pub(crate) fn compare(a: &str, b: &str) -> Ordering {
        let left = normalize(a);
        let right = normalize(b);
        let len = left.len().max(right.len());
        let padded = |v: &[u128], i: usize| v.get(i).copied().unwrap_or(0);

        (0..len)
            .map(|i| padded(&left, i).cmp(&padded(&right, i)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    /// True when `latest` orders strictly after `current`.
    pub(crate) fn is_newer(current: &str, latest: &str) -> bool {
        Self::compare(current, latest) == Ordering::Less
    }
}

pub(crate) fn extract_version(pattern: &Regex, content: &str) -> Option<String> {
    pattern
        .captures(content)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|v| !v.is_empty())
}

fn normalize(version: &str) -> Vec<u128> {
    version
        .to_lowercase()
        .split(['.', '-'])
        .map(|segment| {
            if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
                segment.parse::<u128>().unwrap_or(u128::MAX)
            } else {
                segment.chars().map(|c| c as u128).sum()
            }
        })
        .collect()
}
