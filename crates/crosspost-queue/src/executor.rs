//! Runs a single job and decides what happens to it next.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, instrument};

use crate::{
    CaptionOptions, ChannelPublisher, FetchOutcome, Job, JobError, LocalMedia, MEDIA_BATCH_LIMIT,
    MediaFetcher, PublishOutcome, RetryPolicy, ScratchStorage, VideoVariants, compose_caption,
};

/// Executor behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Fail posts without attachments instead of publishing text only.
    pub require_media: bool,
    pub caption: CaptionOptions,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            require_media: true,
            caption: CaptionOptions::default(),
        }
    }
}

/// What one attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Published,
    RateLimited {
        retry_at: DateTime<Utc>,
        message: String,
    },
    Failed(JobError),
}

/// Everything one attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub outcome: ExecutionOutcome,
    /// Encodings of the post's videos. Empty unless the fetch succeeded.
    pub videos: Vec<VideoVariants>,
}

/// What the scheduler does with a job after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Complete,
    /// Rate limited. Retry budget untouched.
    Defer {
        retry_at: DateTime<Utc>,
        delay_ms: i64,
        message: String,
    },
    /// Transient failure. Consumes one attempt.
    Retry {
        retry_at: DateTime<Utc>,
        delay_ms: i64,
        /// Number of the upcoming attempt, starting at 1.
        attempt: u32,
        max_attempts: u32,
        error: JobError,
    },
    Fail {
        error: JobError,
    },
}

impl Disposition {
    /// Map an attempt's outcome to the next store transition.
    pub fn decide(
        job: &Job,
        outcome: ExecutionOutcome,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        match outcome {
            ExecutionOutcome::Published => Self::Complete,
            ExecutionOutcome::RateLimited { retry_at, message } => Self::Defer {
                retry_at,
                delay_ms: (retry_at - now).num_milliseconds().max(0),
                message,
            },
            ExecutionOutcome::Failed(error) if error.is_permanent() => Self::Fail { error },
            ExecutionOutcome::Failed(error) if policy.is_exhausted(job) => Self::Fail { error },
            ExecutionOutcome::Failed(error) => {
                let delay = policy.next_delay(job);
                Self::Retry {
                    retry_at: now + delay,
                    delay_ms: delay.num_milliseconds(),
                    attempt: job.retry_count + 2,
                    max_attempts: policy.max_attempts,
                    error,
                }
            }
        }
    }

    /// Delay carried by a deferral or retry.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Defer { delay_ms, .. } | Self::Retry { delay_ms, .. } => {
                Some(Duration::milliseconds(*delay_ms))
            }
            Self::Complete | Self::Fail { .. } => None,
        }
    }
}

/// Fetches, downloads and publishes one job.
pub struct JobExecutor {
    fetcher: Arc<dyn MediaFetcher>,
    publisher: Arc<dyn ChannelPublisher>,
    scratch: Arc<dyn ScratchStorage>,
    config: ExecutorConfig,
}

impl JobExecutor {
    pub fn new(
        fetcher: Arc<dyn MediaFetcher>,
        publisher: Arc<dyn ChannelPublisher>,
        scratch: Arc<dyn ScratchStorage>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            fetcher,
            publisher,
            scratch,
            config,
        }
    }

    /// Run one attempt. Scratch files are released on every path.
    #[instrument(skip(self, job), fields(job_id = job.id, retry_count = job.retry_count))]
    pub async fn execute(&self, job: &Job) -> Execution {
        let mut scratch = Vec::new();
        let mut videos = Vec::new();
        let outcome = self.attempt(job, &mut scratch, &mut videos).await;
        if !scratch.is_empty() {
            self.scratch.release(&scratch).await;
        }
        Execution { outcome, videos }
    }

    async fn attempt(
        &self,
        job: &Job,
        scratch: &mut Vec<PathBuf>,
        videos: &mut Vec<VideoVariants>,
    ) -> ExecutionOutcome {
        let mut post = match self.fetcher.fetch(&job.payload.post_url).await {
            FetchOutcome::Fetched(post) => post,
            FetchOutcome::RateLimited { retry_at, message } => {
                return ExecutionOutcome::RateLimited { retry_at, message };
            }
            FetchOutcome::Failed { reason } => {
                return ExecutionOutcome::Failed(JobError::Fetch(reason));
            }
        };
        videos.append(&mut post.videos);

        if post.items.is_empty() && self.config.require_media {
            return ExecutionOutcome::Failed(JobError::NoMedia);
        }

        let mut media = Vec::with_capacity(post.items.len());
        for item in &post.items {
            let path = self.scratch.allocate(item.kind.extension());
            scratch.push(path.clone());
            if let Err(e) = self.fetcher.download(item, &path).await {
                return ExecutionOutcome::Failed(JobError::Download(e.reason));
            }
            media.push(LocalMedia {
                kind: item.kind,
                path,
            });
        }
        debug!(items = media.len(), "media downloaded");

        let caption = compose_caption(&job.payload, &post.source_text, &self.config.caption);
        let caption = (!caption.is_empty()).then_some(caption);

        if media.is_empty() {
            return self.publish_batch(&[], caption.as_deref()).await;
        }
        for (index, batch) in media.chunks(MEDIA_BATCH_LIMIT).enumerate() {
            let batch_caption = if index == 0 { caption.as_deref() } else { None };
            match self.publish_batch(batch, batch_caption).await {
                ExecutionOutcome::Published => {}
                other => return other,
            }
        }
        ExecutionOutcome::Published
    }

    async fn publish_batch(&self, batch: &[LocalMedia], caption: Option<&str>) -> ExecutionOutcome {
        match self.publisher.publish(batch, caption).await {
            PublishOutcome::Published => ExecutionOutcome::Published,
            PublishOutcome::RateLimited { retry_at } => ExecutionOutcome::RateLimited {
                retry_at,
                message: "destination channel rate limit".to_string(),
            },
            PublishOutcome::Failed { reason } => {
                ExecutionOutcome::Failed(JobError::Publish(reason))
            }
        }
    }
}
