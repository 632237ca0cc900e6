//! Document fetching via a render API + raw-page archive for gridrates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gridrates-fetch";

/// Bodies shorter than this are treated as equivalent to a fetch failure.
pub const MIN_DOCUMENT_BYTES: usize = 2_000;

/// How the render API should produce the document.
///
/// The comparison pages build their tables client-side, so browser
/// rendering is the primary mode; the plain response is the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderMode {
    Browser,
    PlainHttp,
}

impl RenderMode {
    pub fn alternate(self) -> RenderMode {
        match self {
            RenderMode::Browser => RenderMode::PlainHttp,
            RenderMode::PlainHttp => RenderMode::Browser,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("render api returned no document for {url}")]
    EmptyDocument { url: String },
    #[error("render api response malformed: {0}")]
    MalformedResponse(String),
}

/// External collaborator that turns a target URL into raw document text.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(
        &self,
        target_slug: &str,
        url: &str,
        mode: RenderMode,
    ) -> Result<String, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RenderApiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtractRequest<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    browser_html: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    http_response_body: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractResponse {
    #[serde(default)]
    browser_html: Option<String>,
    /// Base64 of the raw response body in plain-HTTP mode.
    #[serde(default)]
    http_response_body: Option<String>,
}

/// Client for a Zyte-style extraction endpoint that can return either
/// browser-rendered HTML or the plain HTTP response body.
#[derive(Debug)]
pub struct RenderApiFetcher {
    client: reqwest::Client,
    endpoint: String,
    auth_header: String,
    backoff: BackoffPolicy,
}

impl RenderApiFetcher {
    pub fn new(config: RenderApiConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        let auth_header = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(format!("{}:", config.api_key))
        );

        Ok(Self {
            client,
            endpoint: config.endpoint,
            auth_header,
            backoff: config.backoff,
        })
    }

    fn decode_response(mode: RenderMode, resp: ExtractResponse, url: &str) -> Result<String, FetchError> {
        let text = match mode {
            RenderMode::Browser => resp.browser_html,
            RenderMode::PlainHttp => match resp.http_response_body {
                Some(encoded) => Some(
                    base64::engine::general_purpose::STANDARD
                        .decode(encoded.as_bytes())
                        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                        // some deployments return the body as plain text
                        .unwrap_or(encoded),
                ),
                None => None,
            },
        };
        match text {
            Some(text) if !text.is_empty() => Ok(text),
            _ => Err(FetchError::EmptyDocument {
                url: url.to_string(),
            }),
        }
    }
}

#[async_trait]
impl DocumentFetcher for RenderApiFetcher {
    async fn fetch(
        &self,
        target_slug: &str,
        url: &str,
        mode: RenderMode,
    ) -> Result<String, FetchError> {
        let span = info_span!("render_fetch", target_slug, url, ?mode);
        let _guard = span.enter();

        let request = ExtractRequest {
            url,
            browser_html: matches!(mode, RenderMode::Browser).then_some(true),
            http_response_body: matches!(mode, RenderMode::PlainHttp).then_some(true),
        };

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self
                .client
                .post(&self.endpoint)
                .header(reqwest::header::AUTHORIZATION, &self.auth_header)
                .json(&request)
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let parsed: ExtractResponse = resp
                            .json()
                            .await
                            .map_err(|e| FetchError::MalformedResponse(e.to_string()))?;
                        return Self::decode_response(mode, parsed, url);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of fetched pages, kept for extraction debugging.
///
/// Pages are written even when undersized so a bad run leaves something to
/// inspect. Writes are atomic (temp file + rename) and content-deduplicated.
#[derive(Debug, Clone)]
pub struct RawPageStore {
    root: PathBuf,
}

impl RawPageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        target_slug: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(target_slug)
            .join(format!("{content_hash}.html"))
    }

    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        target_slug: &str,
        text: &str,
    ) -> anyhow::Result<ArchivedPage> {
        let bytes = text.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(fetched_at, target_slug, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(ArchivedPage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("archive path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(ArchivedPage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ArchivedPage {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp archive {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn page_hashing_is_stable() {
        let hash = RawPageStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_writes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = RawPageStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-08-03T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_page(fetched_at, "aep-ohio", "<html>same</html>")
            .await
            .expect("first store");
        let second = store
            .store_page(fetched_at, "aep-ohio", "<html>same</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn render_mode_fallback_flips_strategy() {
        assert_eq!(RenderMode::Browser.alternate(), RenderMode::PlainHttp);
        assert_eq!(RenderMode::PlainHttp.alternate(), RenderMode::Browser);
    }

    #[test]
    fn plain_http_body_decodes_base64_or_passes_through() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("<html>ok</html>");
        let resp = ExtractResponse {
            browser_html: None,
            http_response_body: Some(encoded),
        };
        let text = RenderApiFetcher::decode_response(RenderMode::PlainHttp, resp, "http://x")
            .expect("decoded");
        assert_eq!(text, "<html>ok</html>");

        let resp = ExtractResponse {
            browser_html: None,
            http_response_body: Some("<html>plain</html>".to_string()),
        };
        let text = RenderApiFetcher::decode_response(RenderMode::PlainHttp, resp, "http://x")
            .expect("plain");
        assert_eq!(text, "<html>plain</html>");
    }
}
