use crate::adapters::update::retry::with_backoff;
use crate::config::models::{ReleaseSourceConfig, RetryConfig};
use crate::core::error::UpdateError;
use crate::core::ttl_cache::TtlCache;
use crate::core::types::{ReleaseAsset, ReleaseDescriptor};
use crate::ports::ReleaseSourcePort;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, HeaderMap, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

pub(crate) const GITHUB_ACCEPT: &str = "application/vnd.github.v3+json";

pub(crate) type ReleaseCache = Arc<Mutex<TtlCache<ReleaseDescriptor>>>;

pub(crate) fn new_release_cache(config: &ReleaseSourceConfig) -> ReleaseCache {
    Arc::new(Mutex::new(TtlCache::new(config.cache_ttl)))
}

pub(crate) fn build_http_client(config: &ReleaseSourceConfig) -> Result<Client, UpdateError> {
    Client::builder()
        .timeout(config.request_timeout)
        .build()
        .map_err(UpdateError::Network)
}

#[derive(Debug, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    assets: Vec<GitHubAsset>,
}

#[derive(Debug, Deserialize)]
struct GitHubAsset {
    name: String,
    browser_download_url: String,
}

impl From<GitHubRelease> for ReleaseDescriptor {
    fn from(release: GitHubRelease) -> Self {
        Self {
            version: release.tag_name.trim_start_matches(['v', 'V']).to_string(),
            tag_name: release.tag_name,
            name: release.name.unwrap_or_default(),
            body: release.body.unwrap_or_default(),
            html_url: release.html_url.unwrap_or_default(),
            published_at: release.published_at,
            assets: release
                .assets
                .into_iter()
                .map(|a| ReleaseAsset {
                    name: a.name,
                    download_url: a.browser_download_url,
                })
                .collect(),
        }
    }
}

/// Maps a non-success status from the release API onto the error taxonomy.
pub(crate) fn classify_status(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    url: &str,
) -> UpdateError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());

    match status {
        StatusCode::UNAUTHORIZED => UpdateError::BadCredentials,
        StatusCode::TOO_MANY_REQUESTS => UpdateError::RateLimited(message),
        StatusCode::FORBIDDEN => {
            let quota_spent = headers
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.trim() == "0");
            if quota_spent || message.to_lowercase().contains("rate limit") {
                UpdateError::RateLimited(message)
            } else {
                UpdateError::Forbidden(message)
            }
        }
        StatusCode::NOT_FOUND => UpdateError::NotFound(url.to_string()),
        _ => UpdateError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
        },
    }
}

pub(crate) struct GitHubReleaseSource {
    config: ReleaseSourceConfig,
    retry: RetryConfig,
    http_client: Client,
    token: Option<String>,
    cache: ReleaseCache,
}

impl GitHubReleaseSource {
    pub(crate) fn new(
        config: ReleaseSourceConfig,
        retry: RetryConfig,
        http_client: Client,
        cache: ReleaseCache,
    ) -> Self {
        let token = config.resolve_token();
        Self {
            config,
            retry,
            http_client,
            token,
            cache,
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<ReleaseDescriptor, UpdateError> {
        let mut request = self
            .http_client
            .get(url)
            .header(USER_AGENT, &self.config.user_agent)
            .header(ACCEPT, GITHUB_ACCEPT);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        debug!("Release API answered {} for {}", status, url);

        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            let err = classify_status(status, &headers, &body, url);
            error!("Release API request to {} failed: {}", url, err);
            return Err(err);
        }

        let release: GitHubRelease = response
            .json()
            .await
            .map_err(|e| UpdateError::InvalidResponse(format!("{url}: {e}")))?;
        Ok(release.into())
    }

    async fn fetch(&self, url: &str) -> Result<ReleaseDescriptor, UpdateError> {
        let what = format!("GET {url}");
        with_backoff(&self.retry, &what, || self.fetch_once(url)).await
    }
}

#[async_trait]
impl ReleaseSourcePort for GitHubReleaseSource {
    async fn latest(&self, force_refresh: bool) -> Result<ReleaseDescriptor, UpdateError> {
        let url = self.config.endpoint("releases/latest");
        let mut cache = self.cache.lock().await;
        if !force_refresh && cache.get(Instant::now()).is_some() {
            debug!("Serving latest release from cache");
        }
        let release = cache
            .get_or_refresh(Instant::now(), force_refresh, || self.fetch(&url))
            .await?;
        info!("Latest release: {} ({})", release.version, release.tag_name);
        Ok(release)
    }

    async fn by_tag(&self, tag: &str) -> Result<ReleaseDescriptor, UpdateError> {
        let version = tag.trim_start_matches(['v', 'V']);
        let url = self.config.endpoint(&format!("releases/tags/v{version}"));
        self.fetch(&url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use httpmock::prelude::*;
    use std::time::Duration;

    fn source_for(server: &MockServer, token: Option<&str>) -> GitHubReleaseSource {
        let config = ReleaseSourceConfig {
            api_base: server.url("/repos/acme/site"),
            token: token.map(str::to_string),
            token_env: "UPKEEP_TEST_TOKEN_THAT_IS_NEVER_SET".to_string(),
            request_timeout: Duration::from_secs(5),
            ..ReleaseSourceConfig::default()
        };
        let retry = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
        };
        let client = build_http_client(&config).unwrap();
        let cache = new_release_cache(&config);
        GitHubReleaseSource::new(config, retry, client, cache)
    }

    fn release_json(tag: &str) -> serde_json::Value {
        serde_json::json!({
            "tag_name": tag,
            "name": format!("Release {tag}"),
            "body": "* fixed things",
            "html_url": format!("https://example.test/releases/{tag}"),
            "published_at": "2024-05-01T10:00:00Z",
            "assets": [
                {"name": "site.tar.gz", "browser_download_url": "https://example.test/site.tar.gz"}
            ]
        })
    }

    #[tokio::test]
    async fn latest_parses_descriptor_and_sends_headers() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/repos/acme/site/releases/latest")
                    .header("Accept", GITHUB_ACCEPT)
                    .header("Authorization", "Bearer s3cret")
                    .header_exists("User-Agent");
                then.status(200).json_body(release_json("v3.1.0"));
            })
            .await;

        let source = source_for(&server, Some("s3cret"));
        let release = source.latest(false).await.unwrap();

        mock.assert_async().await;
        assert_eq!(release.tag_name, "v3.1.0");
        assert_eq!(release.version, "3.1.0");
        assert_eq!(release.body, "* fixed things");
        assert!(release.published_at.is_some());
        assert_eq!(release.assets.len(), 1);
    }

    #[tokio::test]
    async fn latest_is_cached_until_forced() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/acme/site/releases/latest");
                then.status(200).json_body(release_json("v1.3.0"));
            })
            .await;

        let source = source_for(&server, None);
        source.latest(false).await.unwrap();
        source.latest(false).await.unwrap();
        assert_eq!(mock.hits_async().await, 1);

        source.latest(true).await.unwrap();
        assert_eq!(mock.hits_async().await, 2);
    }

    #[tokio::test]
    async fn by_tag_requests_v_prefixed_tag() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/acme/site/releases/tags/v2.0.1");
                then.status(200).json_body(release_json("v2.0.1"));
            })
            .await;

        let source = source_for(&server, None);
        assert_eq!(source.by_tag("2.0.1").await.unwrap().version, "2.0.1");
        assert_eq!(source.by_tag("v2.0.1").await.unwrap().version, "2.0.1");
        assert_eq!(mock.hits_async().await, 2);
    }

    #[tokio::test]
    async fn unauthorized_is_fatal_bad_credentials() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/acme/site/releases/latest");
                then.status(401).json_body(serde_json::json!({"message": "Bad credentials"}));
            })
            .await;

        let source = source_for(&server, Some("expired"));
        assert_matches!(source.latest(false).await, Err(UpdateError::BadCredentials));
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn forbidden_with_rate_limit_message_is_rate_limited() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/acme/site/releases/latest");
                then.status(403).json_body(serde_json::json!({
                    "message": "API rate limit exceeded for 10.0.0.1."
                }));
            })
            .await;

        let source = source_for(&server, None);
        assert_matches!(
            source.latest(false).await,
            Err(UpdateError::RateLimited(msg)) if msg.contains("rate limit exceeded")
        );
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn missing_release_is_not_found() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/acme/site/releases/tags/v9.9.9");
                then.status(404).json_body(serde_json::json!({"message": "Not Found"}));
            })
            .await;

        let source = source_for(&server, None);
        assert_matches!(source.by_tag("9.9.9").await, Err(UpdateError::NotFound(_)));
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_exhausted() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/acme/site/releases/latest");
                then.status(502);
            })
            .await;

        let source = source_for(&server, None);
        assert_matches!(
            source.latest(false).await,
            Err(UpdateError::RetriesExhausted { attempts: 3, .. })
        );
        assert_eq!(mock.hits_async().await, 3);
    }

    #[tokio::test]
    async fn refused_connections_are_retried_then_exhausted() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = ReleaseSourceConfig {
            api_base: format!("http://127.0.0.1:{port}/repos/acme/site"),
            token_env: "UPKEEP_TEST_TOKEN_THAT_IS_NEVER_SET".to_string(),
            request_timeout: Duration::from_secs(5),
            ..ReleaseSourceConfig::default()
        };
        let retry = RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
        };
        let client = build_http_client(&config).unwrap();
        let cache = new_release_cache(&config);
        let releases = GitHubReleaseSource::new(config, retry, client, cache);

        assert_matches!(
            releases.latest(true).await,
            Err(UpdateError::RetriesExhausted { attempts: 2, source })
                if matches!(*source, UpdateError::Network(ref e) if e.is_connect())
        );
    }

    #[test]
    fn forbidden_without_rate_limit_is_plain_forbidden() {
        let err = classify_status(
            StatusCode::FORBIDDEN,
            &HeaderMap::new(),
            r#"{"message":"Resource not accessible by integration"}"#,
            "http://localhost",
        );
        assert_matches!(err, UpdateError::Forbidden(_));

        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", "0".parse().unwrap());
        let err = classify_status(StatusCode::FORBIDDEN, &headers, "", "http://localhost");
        assert_matches!(err, UpdateError::RateLimited(_));
    }
}
