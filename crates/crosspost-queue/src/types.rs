//! Queue types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::QueueError;

/// Row identifier assigned by the store. Strictly increasing in insertion order.
pub type JobId = i64;

/// Identifier of the user who submitted a job. Zero means nobody to notify.
pub type RequesterId = i64;

/// What a job publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishPayload {
    /// Link to the source post.
    pub post_url: String,
    /// Caption text supplied by the requester, possibly empty.
    pub user_text: String,
}

impl PublishPayload {
    pub fn new(post_url: impl Into<String>, user_text: impl Into<String>) -> Self {
        Self {
            post_url: post_url.into(),
            user_text: user_text.into(),
        }
    }

    /// Reject payloads that could never be executed.
    pub fn validate(&self) -> Result<(), QueueError> {
        let url = self.post_url.trim();
        if url.is_empty() {
            return Err(QueueError::InvalidPayload("post link is empty".into()));
        }
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(QueueError::InvalidPayload(format!(
                "post link is not an http(s) URL: {url}"
            )));
        }
        if url.chars().any(char::is_whitespace) {
            return Err(QueueError::InvalidPayload(format!(
                "post link contains whitespace: {url}"
            )));
        }
        Ok(())
    }
}

/// Lifecycle state of a queued job.
///
/// Finished jobs are deleted, so only live states exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `available_at` and a free executor.
    #[default]
    Pending,
    /// Reserved by the executor.
    Processing,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status string that is not one of the live job states.
#[derive(Debug, Error)]
#[error("unknown job status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// A job as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Store-assigned identifier.
    pub id: JobId,
    /// Who to notify about this job.
    pub requester_id: RequesterId,
    /// What to publish.
    pub payload: PublishPayload,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Earliest moment the job may be reserved.
    pub available_at: DateTime<Utc>,
    /// Transient failures so far. Rate-limit deferrals are not counted.
    pub retry_count: u32,
    /// Delay applied by the most recent reschedule or deferral, in milliseconds.
    pub last_delay_ms: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A job that has not been inserted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub requester_id: RequesterId,
    pub payload: PublishPayload,
    pub available_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_delay_ms: i64,
}

impl NewJob {
    /// A fresh job with no retry history.
    pub fn new(
        requester_id: RequesterId,
        payload: PublishPayload,
        available_at: DateTime<Utc>,
    ) -> Self {
        Self {
            requester_id,
            payload,
            available_at,
            retry_count: 0,
            last_delay_ms: 0,
        }
    }

    /// Carry over retry state, e.g. when importing jobs from another store.
    pub fn with_retry_state(mut self, retry_count: u32, last_delay_ms: i64) -> Self {
        self.retry_count = retry_count;
        self.last_delay_ms = last_delay_ms;
        self
    }
}

/// Aggregate view of one status group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub status: JobStatus,
    pub count: u64,
    /// Earliest `available_at` in the group.
    pub next_available_at: Option<DateTime<Utc>>,
    /// Highest `retry_count` in the group.
    pub max_retry_count: u32,
}

/// Linear backoff policy for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts a job gets, the first included, before it fails
    /// permanently. `retry_count` therefore never exceeds `max_attempts - 1`.
    pub max_attempts: u32,
    /// Added to the previous delay on every reschedule.
    pub increment: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            increment: Duration::seconds(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after a transient failure.
    pub fn next_delay(&self, job: &Job) -> Duration {
        Duration::milliseconds(job.last_delay_ms.max(0)) + self.increment
    }

    /// Whether the attempt that just failed was the job's last one.
    pub fn is_exhausted(&self, job: &Job) -> bool {
        job.retry_count.saturating_add(1) >= self.max_attempts
    }
}
