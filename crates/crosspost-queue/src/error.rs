//! Error types for the publish queue.

use thiserror::Error;

/// Errors raised by the queue infrastructure itself.
#[derive(Debug, Error)]
pub enum QueueError {
    /// SQLite rejected a statement or the database file is unusable.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Creating the database directory failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The submitted payload can never be executed.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The scheduler stopped after an unrecoverable storage failure.
    #[error("scheduler halted: {0}")]
    Halted(String),
}

/// Why a single job did not publish.
///
/// Delivered to the submitter through [`crate::PendingPublish`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The source post has no photo or video attachments.
    #[error("post has no media attachments")]
    NoMedia,

    /// The fetcher could not resolve the post.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// A media item could not be downloaded to scratch storage.
    #[error("download failed: {0}")]
    Download(String),

    /// The destination channel rejected the publication.
    #[error("publish failed: {0}")]
    Publish(String),

    /// The job was removed by a queue clear before it finished.
    #[error("job was removed when the queue was cleared")]
    Cleared,

    /// The scheduler stopped before the job could finish.
    #[error("scheduler halted: {0}")]
    Halted(String),

    /// The outcome is no longer tracked in this process.
    #[error("job outcome is no longer tracked")]
    Detached,
}

impl JobError {
    /// Whether retrying the job cannot change the outcome.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::NoMedia)
    }
}
