//! Durable publish queue for crosspost.
//!
//! This crate provides a single-flight publish pipeline that:
//! - Persists jobs in SQLite so they survive crashes and restarts
//! - Executes at most one job at a time, in `(available_at, id)` order
//! - Retries transient failures with linear backoff
//! - Defers rate-limited jobs without consuming their retry budget
//! - Routes each job's outcome back to the task that submitted it

mod caption;
mod clock;
mod collaborators;
mod error;
mod executor;
mod router;
mod scheduler;
mod store;
mod types;
mod wake;

pub use caption::{CaptionOptions, compose_caption, escape_markdown_v2};
pub use clock::{Clock, SystemClock, TokioClock};
pub use collaborators::{
    ChannelPublisher, DownloadError, FetchOutcome, FetchedPost, LocalMedia, MEDIA_BATCH_LIMIT,
    MediaFetcher, MediaItem, MediaKind, NotifyError, PublishOutcome, ScratchStorage, UserNotifier,
    VideoVariant, VideoVariants,
};
pub use error::{JobError, QueueError};
pub use executor::{Disposition, Execution, ExecutionOutcome, ExecutorConfig, JobExecutor};
pub use router::{PendingPublish, ResultRouter};
pub use scheduler::{LoopState, Scheduler, SchedulerParts};
pub use store::JobStore;
pub use types::{
    Job, JobId, JobStatus, NewJob, PublishPayload, RequesterId, RetryPolicy, StatusSummary,
};
pub use wake::WakeTimer;
