//! Error types for the Telegram client.

use thiserror::Error;

/// Errors that can occur when calling the Bot API.
#[derive(Debug, Error)]
pub enum TelegramError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading a file to upload failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Flood control. Retry after the given number of seconds.
    #[error("rate limited (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    /// The Bot API answered `ok: false`.
    #[error("Bot API error {code}: {description}")]
    Api { code: i64, description: String },

    /// The response could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}
