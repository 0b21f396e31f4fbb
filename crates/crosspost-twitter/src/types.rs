//! Twitter/X API v2 response types.

use serde::Deserialize;

/// Response from `GET /2/tweets/{id}` with media expansions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TweetLookup {
    pub data: Option<Tweet>,
    #[serde(default)]
    pub includes: Includes,
    #[serde(default)]
    pub errors: Vec<TweetProblem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Tweet {
    pub id: String,
    #[serde(default)]
    pub text: String,
    pub attachments: Option<Attachments>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Attachments {
    #[serde(default)]
    pub media_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Includes {
    #[serde(default)]
    pub media: Vec<Media>,
}

/// An expanded media object.
#[derive(Debug, Clone, Deserialize)]
pub struct Media {
    pub media_key: String,
    /// `photo`, `video` or `animated_gif`.
    #[serde(rename = "type")]
    pub kind: String,
    pub url: Option<String>,
    #[serde(default)]
    pub variants: Vec<MediaVariant>,
    pub alt_text: Option<String>,
}

/// One encoding of a video.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaVariant {
    pub url: String,
    pub content_type: String,
    pub bit_rate: Option<u64>,
}

/// Partial error entry returned alongside (or instead of) data.
#[derive(Debug, Clone, Deserialize)]
pub struct TweetProblem {
    pub title: Option<String>,
    pub detail: Option<String>,
}

impl TweetProblem {
    pub fn describe(&self) -> String {
        self.detail
            .clone()
            .or_else(|| self.title.clone())
            .unwrap_or_else(|| "unknown error".to_string())
    }
}
