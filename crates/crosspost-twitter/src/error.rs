//! Error types for the Twitter/X client.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur when talking to Twitter/X.
#[derive(Debug, Error)]
pub enum TwitterError {
    /// The link does not point at a status.
    #[error("not a Twitter/X status link: {0}")]
    InvalidLink(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Writing a download failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Rate limited until `retry_at`, grace period included.
    #[error("rate limited until {retry_at}")]
    RateLimited { retry_at: DateTime<Utc> },

    /// Non-success response from the API.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The tweet could not be returned.
    #[error("tweet unavailable: {0}")]
    Unavailable(String),

    /// An attachment has no downloadable URL.
    #[error("unsupported media: {0}")]
    UnsupportedMedia(String),
}
