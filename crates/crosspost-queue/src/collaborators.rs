//! Seams between the queue and the outside world.
//!
//! The executor only talks to these traits, so the Twitter and Telegram
//! adapters live in their own crates and tests can script every outcome.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{JobError, JobId, RequesterId, StatusSummary};

/// Most media items a single publish call accepts.
pub const MEDIA_BATCH_LIMIT: usize = 10;

/// Kind of an attachment on the source post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    /// File extension used for the scratch copy.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Photo => "jpg",
            Self::Video => "mp4",
        }
    }
}

/// A remote attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub kind: MediaKind,
    pub source_url: String,
    pub alt_text: Option<String>,
}

/// One encoding a video is offered in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoVariant {
    pub url: String,
    pub content_type: String,
    /// Bits per second, when the source reports it.
    pub bit_rate: Option<u64>,
    /// `(width, height)`, when the source reveals it.
    pub resolution: Option<(u32, u32)>,
}

/// Every encoding of one video attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoVariants {
    /// 1-based position of the video among the post's attachments.
    pub media_index: usize,
    pub options: Vec<VideoVariant>,
}

/// A resolved source post.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedPost {
    pub items: Vec<MediaItem>,
    /// Body text of the post, used for quoting.
    pub source_text: String,
    /// Encodings of the post's videos. Empty for photo-only posts.
    pub videos: Vec<VideoVariants>,
}

/// Result of resolving a source post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched(FetchedPost),
    /// The source is throttling us until `retry_at`.
    RateLimited {
        retry_at: DateTime<Utc>,
        message: String,
    },
    Failed {
        reason: String,
    },
}

/// A downloaded attachment ready to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    pub kind: MediaKind,
    pub path: PathBuf,
}

/// Result of one publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// The destination is throttling us until `retry_at`.
    RateLimited {
        retry_at: DateTime<Utc>,
    },
    Failed {
        reason: String,
    },
}

/// A media download that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct DownloadError {
    pub reason: String,
}

impl DownloadError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A notification that could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Resolves source posts and downloads their media.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, post_url: &str) -> FetchOutcome;

    /// Write `item` to `dest`.
    async fn download(&self, item: &MediaItem, dest: &Path) -> Result<(), DownloadError>;
}

/// Posts media to the destination channel.
#[async_trait]
pub trait ChannelPublisher: Send + Sync {
    /// Publish one batch of at most [`MEDIA_BATCH_LIMIT`] items.
    ///
    /// The caption belongs on the first item. An empty batch with a caption
    /// is a text-only post.
    async fn publish(&self, media: &[LocalMedia], caption: Option<&str>) -> PublishOutcome;
}

/// Tells requesters what happened to their jobs.
///
/// Callers treat every error as non-fatal.
#[async_trait]
pub trait UserNotifier: Send + Sync {
    async fn notify_rate_limited(
        &self,
        requester: RequesterId,
        retry_at: DateTime<Utc>,
        message: &str,
    ) -> Result<(), NotifyError>;

    async fn notify_retry_scheduled(
        &self,
        requester: RequesterId,
        attempt: u32,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<(), NotifyError>;

    /// Best effort. Lists the encodings each video of the post comes in.
    async fn notify_video_variants(
        &self,
        requester: RequesterId,
        videos: &[VideoVariants],
    ) -> Result<(), NotifyError>;

    async fn notify_queue_cleared(
        &self,
        requester: RequesterId,
        count: usize,
    ) -> Result<(), NotifyError>;

    async fn notify_queue_status(
        &self,
        requester: RequesterId,
        summary: &[StatusSummary],
    ) -> Result<(), NotifyError>;

    /// Sent only when nobody in this process is awaiting the job.
    async fn notify_published(
        &self,
        requester: RequesterId,
        job_id: JobId,
    ) -> Result<(), NotifyError>;

    /// Sent only when nobody in this process is awaiting the job.
    async fn notify_failed(
        &self,
        requester: RequesterId,
        job_id: JobId,
        error: &JobError,
    ) -> Result<(), NotifyError>;
}

/// Scratch files for downloaded media.
#[async_trait]
pub trait ScratchStorage: Send + Sync {
    /// A fresh, unused path with the given extension.
    fn allocate(&self, extension: &str) -> PathBuf;

    /// Remove `paths`, ignoring ones that do not exist. Never fails.
    async fn release(&self, paths: &[PathBuf]);
}
