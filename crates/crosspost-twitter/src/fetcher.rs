//! `MediaFetcher` implementation for Twitter/X.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crosspost_queue::{
    DownloadError, FetchOutcome, FetchedPost, MediaFetcher, MediaItem, MediaKind, VideoVariant,
    VideoVariants,
};
use regex::Regex;
use tracing::{instrument, warn};

use crate::{Media, TweetLookup, TweetRef, TwitterClient, TwitterError};

impl TwitterClient {
    async fn fetch_post(&self, post_url: &str) -> Result<FetchedPost, TwitterError> {
        let tweet_ref = TweetRef::parse(post_url)?;
        let lookup = self.lookup(&tweet_ref).await?;
        let items = resolve_media(&lookup)?;
        let videos = video_variants(&lookup);

        let tweet = lookup.data.ok_or_else(|| {
            let reason = lookup
                .errors
                .first()
                .map(|problem| problem.describe())
                .unwrap_or_else(|| "response has no data".to_string());
            TwitterError::Unavailable(reason)
        })?;

        Ok(FetchedPost {
            items,
            source_text: tweet.text,
            videos,
        })
    }
}

#[async_trait]
impl MediaFetcher for TwitterClient {
    #[instrument(skip(self))]
    async fn fetch(&self, post_url: &str) -> FetchOutcome {
        match self.fetch_post(post_url).await {
            Ok(post) => FetchOutcome::Fetched(post),
            Err(TwitterError::RateLimited { retry_at }) => FetchOutcome::RateLimited {
                retry_at,
                message: rate_limit_message(retry_at, Utc::now()),
            },
            Err(e) => {
                warn!(error = %e, "tweet fetch failed");
                FetchOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn download(&self, item: &MediaItem, dest: &Path) -> Result<(), DownloadError> {
        self.download_to(&item.source_url, dest)
            .await
            .map(|_| ())
            .map_err(|e| {
                warn!(url = %item.source_url, error = %e, "media download failed");
                DownloadError::new(e.to_string())
            })
    }
}

/// Video encodings are served from paths like `/vid/avc1/1280x720/clip.mp4`.
static RESOLUTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(\d{2,5})x(\d{2,5})/").unwrap());

/// Expanded media of the looked-up tweet, in attachment order.
///
/// Keys without a matching expansion are skipped.
fn attached(lookup: &TweetLookup) -> Vec<&Media> {
    let Some(keys) = lookup
        .data
        .as_ref()
        .and_then(|tweet| tweet.attachments.as_ref())
        .map(|attachments| &attachments.media_keys)
    else {
        return Vec::new();
    };

    let by_key: HashMap<&str, &Media> = lookup
        .includes
        .media
        .iter()
        .map(|media| (media.media_key.as_str(), media))
        .collect();

    keys.iter()
        .filter_map(|key| by_key.get(key.as_str()).copied())
        .collect()
}

/// Attachments of the looked-up tweet, in attachment order.
pub fn resolve_media(lookup: &TweetLookup) -> Result<Vec<MediaItem>, TwitterError> {
    attached(lookup).into_iter().map(to_item).collect()
}

/// Every encoding of every video or GIF attachment, in API order.
pub fn video_variants(lookup: &TweetLookup) -> Vec<VideoVariants> {
    attached(lookup)
        .into_iter()
        .enumerate()
        .filter(|(_, media)| !media.variants.is_empty())
        .map(|(index, media)| VideoVariants {
            media_index: index + 1,
            options: media
                .variants
                .iter()
                .map(|variant| VideoVariant {
                    url: variant.url.clone(),
                    content_type: variant.content_type.clone(),
                    bit_rate: variant.bit_rate,
                    resolution: resolution(&variant.url),
                })
                .collect(),
        })
        .collect()
}

fn resolution(url: &str) -> Option<(u32, u32)> {
    let caps = RESOLUTION_RE.captures(url)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

fn to_item(media: &Media) -> Result<MediaItem, TwitterError> {
    let (kind, source_url) = match media.kind.as_str() {
        "photo" => {
            let url = media.url.clone().ok_or_else(|| {
                TwitterError::UnsupportedMedia(format!("photo {} has no url", media.media_key))
            })?;
            (MediaKind::Photo, url)
        }
        "video" | "animated_gif" => {
            let best = media
                .variants
                .iter()
                .filter(|variant| variant.content_type == "video/mp4")
                .max_by_key(|variant| variant.bit_rate.unwrap_or(0))
                .ok_or_else(|| {
                    TwitterError::UnsupportedMedia(format!(
                        "{} {} has no mp4 variant",
                        media.kind, media.media_key
                    ))
                })?;
            (MediaKind::Video, best.url.clone())
        }
        other => {
            return Err(TwitterError::UnsupportedMedia(format!(
                "unknown media type {other}"
            )));
        }
    };

    Ok(MediaItem {
        kind,
        source_url,
        alt_text: media.alt_text.clone(),
    })
}

fn rate_limit_message(retry_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let wait_ms = (retry_at - now).num_milliseconds();
    if wait_ms <= 0 {
        return "Twitter/X rate limit reached, try again later.".to_string();
    }
    let secs = ((wait_ms + 999) / 1000).max(1);
    format!("Twitter/X rate limit reached, retrying in {secs} seconds.")
}
