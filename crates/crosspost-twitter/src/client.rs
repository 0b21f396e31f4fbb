//! Twitter/X API v2 client.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Client, Proxy, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::{TweetLookup, TweetRef, TwitterError};

/// Public API endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.twitter.com";

/// Seconds added to the advertised reset time before retrying.
pub const RATE_LIMIT_GRACE_SECS: i64 = 3;

const MEDIA_FIELDS: &[(&str, &str)] = &[
    ("expansions", "attachments.media_keys"),
    ("media.fields", "type,url,variants,alt_text"),
];

/// Connection settings.
#[derive(Debug, Clone)]
pub struct TwitterConfig {
    pub bearer_token: String,
    pub api_base: String,
    /// Route API and media traffic through this proxy.
    pub proxy_url: Option<String>,
}

impl TwitterConfig {
    pub fn new(bearer_token: impl Into<String>) -> Self {
        Self {
            bearer_token: bearer_token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            proxy_url: None,
        }
    }
}

/// Client for the Twitter/X API.
pub struct TwitterClient {
    http: Client,
    api_base: String,
    bearer_token: String,
}

impl TwitterClient {
    pub fn new(config: TwitterConfig) -> Result<Self, TwitterError> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60));
        if let Some(proxy) = config.proxy_url.as_deref().filter(|p| !p.is_empty()) {
            builder = builder.proxy(Proxy::all(proxy)?);
        }

        Ok(Self {
            http: builder.build()?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token,
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Look up a tweet with its media expanded.
    pub async fn lookup(&self, tweet: &TweetRef) -> Result<TweetLookup, TwitterError> {
        let url = format!("{}/2/tweets/{}", self.api_base, tweet.id);
        debug!(tweet_id = %tweet.id, "looking up tweet");

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.bearer_token)
            .query(MEDIA_FIELDS)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_at = rate_limit_retry_at(response.headers(), Utc::now());
            warn!(tweet_id = %tweet.id, %retry_at, "Twitter/X rate limit reached");
            return Err(TwitterError::RateLimited { retry_at });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|e| format!("failed to read response: {e}"));
            return Err(TwitterError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Stream `url` into a new file at `dest`.
    pub async fn download_to(&self, url: &str, dest: &Path) -> Result<u64, TwitterError> {
        let mut response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TwitterError::Api {
                status: status.as_u16(),
                message: format!("media download returned {status}"),
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(url, bytes = written, path = %dest.display(), "media downloaded");
        Ok(written)
    }
}

/// When to retry after a 429.
///
/// Prefers `x-rate-limit-reset` (epoch seconds), then `Retry-After`
/// (seconds from now), then now. The grace period is always added.
pub fn rate_limit_retry_at(headers: &HeaderMap, now: DateTime<Utc>) -> DateTime<Utc> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<i64>().ok())
    };

    let base = header("x-rate-limit-reset")
        .and_then(|reset| DateTime::from_timestamp(reset, 0))
        .or_else(|| header("retry-after").map(|secs| now + chrono::Duration::seconds(secs)))
        .unwrap_or(now);

    base + chrono::Duration::seconds(RATE_LIMIT_GRACE_SECS)
}
