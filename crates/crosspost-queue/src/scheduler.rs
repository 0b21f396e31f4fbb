//! Single-flight scheduler over the job store.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::{
    Clock, Disposition, Execution, Job, JobError, JobExecutor, JobStore, NewJob, PendingPublish,
    PublishPayload, QueueError, RequesterId, ResultRouter, RetryPolicy, StatusSummary,
    UserNotifier, WakeTimer,
};

/// Observable state of the drain loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Nothing eligible. A wake timer may be armed.
    Idle,
    /// Reserving or executing jobs.
    Running,
    /// Shut down. No further jobs start.
    Stopped,
    /// A store operation failed. No further jobs start.
    Halted,
}

/// Everything a scheduler is built from.
pub struct SchedulerParts {
    pub store: Arc<JobStore>,
    pub executor: JobExecutor,
    pub notifier: Arc<dyn UserNotifier>,
    pub policy: RetryPolicy,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct Control {
    running: bool,
    rekick: bool,
    stopping: bool,
    halted: Option<String>,
}

struct Inner {
    store: Arc<JobStore>,
    executor: JobExecutor,
    router: ResultRouter,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    wake: WakeTimer,
    control: Mutex<Control>,
    state: watch::Sender<LoopState>,
}

impl Inner {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drives jobs through the executor one at a time.
///
/// Cheap to clone. Every clone drives the same loop.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(parts: SchedulerParts) -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            inner: Arc::new(Inner {
                store: parts.store,
                executor: parts.executor,
                router: ResultRouter::new(parts.notifier),
                wake: WakeTimer::new(Arc::clone(&parts.clock)),
                policy: parts.policy,
                clock: parts.clock,
                control: Mutex::new(Control::default()),
                state,
            }),
        }
    }

    /// Begin draining whatever the store already holds.
    pub fn start(&self) {
        info!(
            max_attempts = self.inner.policy.max_attempts,
            retry_increment_secs = self.inner.policy.increment.num_seconds(),
            "scheduler started"
        );
        self.kick();
    }

    /// Queue a publication and return a handle to its outcome.
    pub fn submit(
        &self,
        requester_id: RequesterId,
        payload: PublishPayload,
        available_at: Option<DateTime<Utc>>,
    ) -> Result<PendingPublish, QueueError> {
        if let Some(reason) = self.inner.control().halted.clone() {
            return Err(QueueError::Halted(reason));
        }
        payload.validate()?;

        let available_at = available_at.unwrap_or_else(|| self.inner.clock.now());
        let job = NewJob::new(requester_id, payload, available_at);
        let pending = self
            .inner
            .router
            .register_with(|| self.inner.store.enqueue(&job))?;

        info!(
            job_id = pending.job_id(),
            requester_id,
            %available_at,
            "publish job queued"
        );
        self.kick();
        Ok(pending)
    }

    /// Delete every job, reject every waiter, and tell `requester`.
    pub async fn clear_queue(&self, requester: RequesterId) -> Result<usize, QueueError> {
        let store = &self.inner.store;
        let count = self.inner.router.clear_with(|| store.clear_all())?;
        info!(count, requester, "queue cleared");
        // A submit that raced the clear may own the wake being cancelled.
        self.inner.wake.cancel();
        self.kick();
        self.inner.router.queue_cleared(requester, count).await;
        Ok(count)
    }

    /// Per-status summary, also sent to `requester`.
    pub async fn queue_status(
        &self,
        requester: RequesterId,
    ) -> Result<Vec<StatusSummary>, QueueError> {
        let summary = self.inner.store.status_summary()?;
        self.inner.router.queue_status(requester, &summary).await;
        Ok(summary)
    }

    /// Subscribe to drain loop state changes.
    pub fn state(&self) -> watch::Receiver<LoopState> {
        self.inner.state.subscribe()
    }

    /// Due time of the pending wake-up, if one is armed.
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.inner.wake.deadline()
    }

    /// Stop starting jobs and wait for the in-flight one to settle.
    pub async fn shutdown(&self) {
        let running = {
            let mut control = self.inner.control();
            control.stopping = true;
            if !control.running && control.halted.is_none() {
                self.inner.state.send_replace(LoopState::Stopped);
            }
            control.running
        };
        self.inner.wake.cancel();

        if running {
            let mut state = self.state();
            let _ = state
                .wait_for(|s| matches!(s, LoopState::Stopped | LoopState::Halted))
                .await;
        }
        info!("scheduler stopped");
    }

    /// Schedule a drain pass. Never runs two passes at once.
    ///
    /// A kick during a pass makes the pass re-check the store before it
    /// goes idle, so no wake-up is lost.
    pub fn kick(&self) {
        {
            let mut control = self.inner.control();
            if control.stopping || control.halted.is_some() {
                return;
            }
            if control.running {
                control.rekick = true;
                return;
            }
            control.running = true;
            self.inner.state.send_replace(LoopState::Running);
        }

        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.drain().await });
    }

    async fn drain(&self) {
        loop {
            self.inner.control().rekick = false;
            let result = self.drain_pass().await;

            let mut control = self.inner.control();
            if let Err(e) = result {
                let reason = e.to_string();
                control.running = false;
                control.halted = Some(reason.clone());
                self.inner.state.send_replace(LoopState::Halted);
                drop(control);
                self.halt(reason);
                return;
            }
            if control.rekick && !control.stopping {
                continue;
            }
            control.running = false;
            let state = if control.stopping {
                LoopState::Stopped
            } else {
                LoopState::Idle
            };
            self.inner.state.send_replace(state);
            return;
        }
    }

    /// Execute eligible jobs until none remain, then arm the wake timer.
    async fn drain_pass(&self) -> Result<(), QueueError> {
        loop {
            if self.inner.control().stopping {
                return Ok(());
            }
            let now = self.inner.clock.now();
            let Some(job) = self.inner.store.reserve_next(now)? else {
                break;
            };
            self.process(job).await?;
        }

        if let Some(next) = self.inner.store.peek_next_available_at()? {
            self.arm_wake(next);
        }
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = job.id, requester_id = job.requester_id))]
    async fn process(&self, job: Job) -> Result<(), QueueError> {
        info!(retry_count = job.retry_count, post_url = %job.payload.post_url, "executing publish job");
        let Execution { outcome, videos } = self.inner.executor.execute(&job).await;
        let now = self.inner.clock.now();
        let store = &self.inner.store;
        let router = &self.inner.router;

        // Only the first attempt reports encodings; retries fetch the same post.
        if job.retry_count == 0 && !videos.is_empty() {
            router.video_variants(&job, &videos).await;
        }

        match Disposition::decide(&job, outcome, &self.inner.policy, now) {
            Disposition::Complete => {
                store.complete(job.id)?;
                info!("publish job completed");
                router.resolve(&job).await;
            }
            Disposition::Defer {
                retry_at,
                delay_ms,
                message,
            } => {
                if store.defer(job.id, retry_at, delay_ms)? {
                    warn!(%retry_at, delay_ms, message = %message, "rate limited, job deferred");
                    self.arm_wake(retry_at);
                    router.rate_limited(&job, retry_at, &message).await;
                }
            }
            Disposition::Retry {
                retry_at,
                delay_ms,
                attempt,
                max_attempts,
                error,
            } => {
                if store.reschedule(job.id, retry_at, delay_ms)? {
                    warn!(
                        %retry_at,
                        attempt,
                        max_attempts,
                        error = %error,
                        "publish job failed, scheduled retry"
                    );
                    self.arm_wake(retry_at);
                    router
                        .retry_scheduled(&job, attempt, max_attempts, retry_at)
                        .await;
                }
            }
            Disposition::Fail { error } => {
                if store.fail(job.id)? {
                    error!(error = %error, "publish job failed permanently");
                    router.reject(&job, error).await;
                }
            }
        }
        Ok(())
    }

    fn arm_wake(&self, at: DateTime<Utc>) {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.wake.arm(at, move || {
            if let Some(inner) = inner.upgrade() {
                Scheduler { inner }.kick();
            }
        });
    }

    fn halt(&self, reason: String) {
        error!(reason = %reason, "job store failed, scheduler halted");
        self.inner.wake.cancel();
        self.inner.router.reject_all(JobError::Halted(reason));
    }

    /// Resolves once the scheduler halts, with the reason.
    pub async fn halted(&self) -> String {
        let mut state = self.state();
        let _ = state.wait_for(|s| *s == LoopState::Halted).await;
        self.inner
            .control()
            .halted
            .clone()
            .unwrap_or_else(|| "scheduler dropped".to_string())
    }
}
