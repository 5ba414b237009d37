use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::model::VideoMetadata;
use crate::youtube::model::{ErrorEnvelope, VideoListResponse};

pub mod model;

const YOUTUBE_API_BASE: &str = "https://www.googleapis.com/";
const VIDEO_PARTS: &str = "snippet,statistics,contentDetails,topicDetails";

/// How a metadata call failed, as far as the caller needs to know.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// Network trouble, timeouts, 5xx, short-term rate limiting.
    #[error("transient API failure: {0}")]
    Transient(String),
    /// The provider's own daily quota is spent.
    #[error("provider quota exhausted: {0}")]
    QuotaExhausted(String),
    /// Bad or missing key, malformed request.
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("invalid API response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }
}

/// Batch lookup of video metadata. Ids that no longer resolve are simply
/// missing from the result.
#[async_trait]
pub trait VideoMetadataService: Send + Sync {
    async fn fetch_videos(&self, ids: &[String]) -> Result<Vec<VideoMetadata>, ApiError>;
}

#[derive(Clone)]
pub struct YoutubeClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for YoutubeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YoutubeClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl YoutubeClient {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(YOUTUBE_API_BASE).context("invalid default YouTube URL")?;
        Self::with_base_url(api_key, base_url, timeout)
    }

    pub fn with_base_url(api_key: String, base_url: Url, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent("watchlog/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let timeout = Duration::from_secs(cfg.youtube.timeout_seconds);
        match cfg.youtube.base_url.as_deref() {
            Some(base) => {
                let base_url = Url::parse(base).context("invalid youtube.base_url")?;
                Self::with_base_url(cfg.youtube.api_key.clone(), base_url, timeout)
            }
            None => Self::new(cfg.youtube.api_key.clone(), timeout),
        }
    }

    pub fn build_request(&self, ids: &[String]) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("youtube/v3/videos")
            .context("invalid YouTube base URL")?;
        let id_list = ids.join(",");
        let max_results = ids.len().to_string();
        self.http
            .get(endpoint)
            .query(&[
                ("part", VIDEO_PARTS),
                ("id", id_list.as_str()),
                ("maxResults", max_results.as_str()),
                ("key", self.api_key.as_str()),
            ])
            .build()
            .context("failed to build YouTube request")
    }
}

#[async_trait]
impl VideoMetadataService for YoutubeClient {
    async fn fetch_videos(&self, ids: &[String]) -> Result<Vec<VideoMetadata>, ApiError> {
        let request = self
            .build_request(ids)
            .map_err(|e| ApiError::Rejected(format!("{e:#}")))?;
        debug!(batch = ids.len(), "requesting video metadata");

        let res = self.http.execute(request).await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Transient(format!("request timed out: {e}"))
            } else {
                ApiError::Transient(format!("failed to reach YouTube: {e}"))
            }
        })?;

        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| ApiError::Transient(format!("failed to read response: {e}")))?;
        if !status.is_success() {
            let err = classify_failure(status, &body);
            warn!(%status, error = %err, "YouTube API error");
            return Err(err);
        }

        let payload: VideoListResponse =
            serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(payload.items.into_iter().map(VideoMetadata::from).collect())
    }
}

/// Map a non-success response to an [`ApiError`].
pub fn classify_failure(status: StatusCode, body: &str) -> ApiError {
    let (message, reasons) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(env) => (
            env.error.message,
            env.error
                .errors
                .into_iter()
                .map(|e| e.reason)
                .collect::<Vec<_>>(),
        ),
        Err(_) => (body.trim().to_string(), Vec::new()),
    };
    let detail = format!("{status}: {message}");
    let has = |r: &str| reasons.iter().any(|x| x == r);

    if has("quotaExceeded") || has("dailyLimitExceeded") {
        return ApiError::QuotaExhausted(detail);
    }
    if status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
        || has("rateLimitExceeded")
        || has("userRateLimitExceeded")
        || has("backendError")
    {
        return ApiError::Transient(detail);
    }
    ApiError::Rejected(detail)
}
