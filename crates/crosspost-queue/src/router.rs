//! Delivers job outcomes to waiting submitters and the notifier.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    Job, JobError, JobId, NotifyError, QueueError, RequesterId, StatusSummary, UserNotifier,
    VideoVariants,
};

/// How long a single notification may take before it is abandoned.
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

type Waiter = oneshot::Sender<Result<(), JobError>>;

/// Handle returned by [`crate::Scheduler::submit`].
///
/// Resolves once the job publishes or fails permanently. Deferrals and
/// retries do not resolve it.
#[derive(Debug)]
pub struct PendingPublish {
    job_id: JobId,
    rx: oneshot::Receiver<Result<(), JobError>>,
}

impl PendingPublish {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Wait for the job's final outcome.
    pub async fn wait(self) -> Result<(), JobError> {
        self.rx.await.unwrap_or(Err(JobError::Detached))
    }
}

/// Maps job ids to their waiters.
///
/// Waiters live only in memory. A job recovered after a restart has none,
/// so its outcome goes to the notifier instead.
pub struct ResultRouter {
    waiters: Mutex<HashMap<JobId, Waiter>>,
    notifier: Arc<dyn UserNotifier>,
    timeout: Duration,
}

impl ResultRouter {
    pub fn new(notifier: Arc<dyn UserNotifier>) -> Self {
        Self::with_timeout(notifier, NOTIFY_TIMEOUT)
    }

    pub fn with_timeout(notifier: Arc<dyn UserNotifier>, timeout: Duration) -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            notifier,
            timeout,
        }
    }

    fn waiters(&self) -> MutexGuard<'_, HashMap<JobId, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `enqueue` and register a waiter for the id it returns.
    ///
    /// The waiter map stays locked across the insert, so an outcome for the
    /// new id cannot be routed before its waiter exists.
    pub fn register_with<F>(&self, enqueue: F) -> Result<PendingPublish, QueueError>
    where
        F: FnOnce() -> Result<JobId, QueueError>,
    {
        let mut waiters = self.waiters();
        let job_id = enqueue()?;
        let (tx, rx) = oneshot::channel();
        waiters.insert(job_id, tx);
        Ok(PendingPublish { job_id, rx })
    }

    /// Run `clear` and reject every waiter with [`JobError::Cleared`].
    ///
    /// Like [`Self::register_with`], the map stays locked across the delete.
    /// A concurrent submit therefore lands either before it, and is removed
    /// and rejected, or after it, and keeps both its row and its waiter.
    pub fn clear_with<F>(&self, clear: F) -> Result<usize, QueueError>
    where
        F: FnOnce() -> Result<usize, QueueError>,
    {
        let (count, drained) = {
            let mut waiters = self.waiters();
            let count = clear()?;
            let drained: Vec<Waiter> = waiters.drain().map(|(_, tx)| tx).collect();
            (count, drained)
        };
        debug!(count, waiters = drained.len(), "queue cleared, rejecting waiters");
        for tx in drained {
            let _ = tx.send(Err(JobError::Cleared));
        }
        Ok(count)
    }

    fn take(&self, job_id: JobId) -> Option<Waiter> {
        self.waiters().remove(&job_id)
    }

    /// Number of submitters still waiting.
    pub fn waiting(&self) -> usize {
        self.waiters().len()
    }

    /// The job published.
    pub async fn resolve(&self, job: &Job) {
        if let Some(tx) = self.take(job.id)
            && tx.send(Ok(())).is_ok()
        {
            return;
        }
        self.notify("published", job.requester_id, async {
            self.notifier.notify_published(job.requester_id, job.id).await
        })
        .await;
    }

    /// The job failed permanently.
    pub async fn reject(&self, job: &Job, error: JobError) {
        if let Some(tx) = self.take(job.id)
            && tx.send(Err(error.clone())).is_ok()
        {
            return;
        }
        self.notify("failed", job.requester_id, async {
            self.notifier
                .notify_failed(job.requester_id, job.id, &error)
                .await
        })
        .await;
    }

    /// The job was deferred by a rate limit.
    pub async fn rate_limited(&self, job: &Job, retry_at: DateTime<Utc>, message: &str) {
        self.notify("rate_limited", job.requester_id, async {
            self.notifier
                .notify_rate_limited(job.requester_id, retry_at, message)
                .await
        })
        .await;
    }

    /// The job was rescheduled after a transient failure.
    pub async fn retry_scheduled(
        &self,
        job: &Job,
        attempt: u32,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) {
        self.notify("retry_scheduled", job.requester_id, async {
            self.notifier
                .notify_retry_scheduled(job.requester_id, attempt, max_attempts, retry_at)
                .await
        })
        .await;
    }

    /// The job's post was fetched and carries videos.
    pub async fn video_variants(&self, job: &Job, videos: &[VideoVariants]) {
        self.notify("video_variants", job.requester_id, async {
            self.notifier
                .notify_video_variants(job.requester_id, videos)
                .await
        })
        .await;
    }

    /// Tell `requester` how many jobs a clear removed.
    pub async fn queue_cleared(&self, requester: RequesterId, count: usize) {
        self.notify("queue_cleared", requester, async {
            self.notifier.notify_queue_cleared(requester, count).await
        })
        .await;
    }

    pub async fn queue_status(&self, requester: RequesterId, summary: &[StatusSummary]) {
        self.notify("queue_status", requester, async {
            self.notifier.notify_queue_status(requester, summary).await
        })
        .await;
    }

    /// Reject every waiter with `error`.
    pub fn reject_all(&self, error: JobError) {
        let waiters: Vec<_> = self.waiters().drain().collect();
        debug!(count = waiters.len(), error = %error, "rejecting all waiters");
        for (_, tx) in waiters {
            let _ = tx.send(Err(error.clone()));
        }
    }

    async fn notify<F>(&self, kind: &'static str, requester: RequesterId, send: F)
    where
        F: Future<Output = Result<(), NotifyError>>,
    {
        match tokio::time::timeout(self.timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(kind, requester, error = %e, "notification failed"),
            Err(_) => warn!(
                kind,
                requester,
                timeout_secs = self.timeout.as_secs(),
                "notification timed out"
            ),
        }
    }
}
