//! End-to-end scheduler behaviour against scripted collaborators.
//!
//! Every test runs on a paused tokio clock, so backoff and wake-ups are
//! instant but still ordered exactly as they would be in real time.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use pretty_assertions::assert_eq;

use crosspost_queue::{
    ChannelPublisher, Clock, DownloadError, ExecutorConfig, FetchOutcome, FetchedPost, JobError,
    JobExecutor, JobId, JobStatus, JobStore, LocalMedia, LoopState, MediaFetcher, MediaItem,
    MediaKind, NewJob, NotifyError, PublishOutcome, PublishPayload, QueueError, RequesterId,
    RetryPolicy, Scheduler, SchedulerParts, ScratchStorage, StatusSummary, TokioClock,
    UserNotifier, VideoVariant, VideoVariants,
};

// === Fakes ===

fn photo(n: usize) -> MediaItem {
    MediaItem {
        kind: MediaKind::Photo,
        source_url: format!("https://pbs.example/{n}.jpg"),
        alt_text: None,
    }
}

fn post_with(items: usize) -> FetchOutcome {
    FetchOutcome::Fetched(FetchedPost {
        items: (0..items).map(photo).collect(),
        source_text: "source text".to_string(),
        videos: Vec::new(),
    })
}

fn video_post() -> FetchOutcome {
    FetchOutcome::Fetched(FetchedPost {
        items: vec![MediaItem {
            kind: MediaKind::Video,
            source_url: "https://video.example/720/clip.mp4".to_string(),
            alt_text: None,
        }],
        source_text: String::new(),
        videos: vec![VideoVariants {
            media_index: 1,
            options: vec![VideoVariant {
                url: "https://video.example/720/clip.mp4".to_string(),
                content_type: "video/mp4".to_string(),
                bit_rate: Some(2_176_000),
                resolution: Some((1280, 720)),
            }],
        }],
    })
}

fn transient() -> FetchOutcome {
    FetchOutcome::Failed {
        reason: "connection reset".to_string(),
    }
}

#[derive(Default)]
struct ScriptedFetcher {
    script: Mutex<VecDeque<FetchOutcome>>,
    fetched: Mutex<Vec<String>>,
    fail_downloads: bool,
}

impl ScriptedFetcher {
    fn with(script: impl IntoIterator<Item = FetchOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaFetcher for ScriptedFetcher {
    async fn fetch(&self, post_url: &str) -> FetchOutcome {
        self.fetched.lock().unwrap().push(post_url.to_string());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| post_with(1))
    }

    async fn download(&self, _item: &MediaItem, _dest: &Path) -> Result<(), DownloadError> {
        if self.fail_downloads {
            Err(DownloadError::new("404 Not Found"))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
struct RecordingPublisher {
    script: Mutex<VecDeque<PublishOutcome>>,
    calls: Mutex<Vec<(Vec<LocalMedia>, Option<String>)>>,
    latency: Option<StdDuration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingPublisher {
    fn with(script: impl IntoIterator<Item = PublishOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<(Vec<LocalMedia>, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelPublisher for RecordingPublisher {
    async fn publish(&self, media: &[LocalMedia], caption: Option<&str>) -> PublishOutcome {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.calls
            .lock()
            .unwrap()
            .push((media.to_vec(), caption.map(str::to_string)));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PublishOutcome::Published)
    }
}

#[derive(Default)]
struct RecordingScratch {
    allocated: AtomicUsize,
    released: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl ScratchStorage for RecordingScratch {
    fn allocate(&self, extension: &str) -> PathBuf {
        let n = self.allocated.fetch_add(1, Ordering::SeqCst);
        PathBuf::from(format!("/scratch/{n}.{extension}"))
    }

    async fn release(&self, paths: &[PathBuf]) {
        self.released.lock().unwrap().extend_from_slice(paths);
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    RateLimited {
        requester: RequesterId,
        retry_at: DateTime<Utc>,
    },
    Retry {
        requester: RequesterId,
        attempt: u32,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    },
    Videos {
        requester: RequesterId,
        videos: Vec<VideoVariants>,
    },
    Cleared {
        requester: RequesterId,
        count: usize,
    },
    Status {
        requester: RequesterId,
        summary: Vec<StatusSummary>,
    },
    Published {
        requester: RequesterId,
        job_id: JobId,
    },
    Failed {
        requester: RequesterId,
        job_id: JobId,
        error: JobError,
    },
}

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<Event>>,
}

impl RecordingNotifier {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: Event) -> Result<(), NotifyError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[async_trait]
impl UserNotifier for RecordingNotifier {
    async fn notify_rate_limited(
        &self,
        requester: RequesterId,
        retry_at: DateTime<Utc>,
        _message: &str,
    ) -> Result<(), NotifyError> {
        self.record(Event::RateLimited {
            requester,
            retry_at,
        })
    }

    async fn notify_retry_scheduled(
        &self,
        requester: RequesterId,
        attempt: u32,
        max_attempts: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<(), NotifyError> {
        self.record(Event::Retry {
            requester,
            attempt,
            max_attempts,
            retry_at,
        })
    }

    async fn notify_video_variants(
        &self,
        requester: RequesterId,
        videos: &[VideoVariants],
    ) -> Result<(), NotifyError> {
        self.record(Event::Videos {
            requester,
            videos: videos.to_vec(),
        })
    }

    async fn notify_queue_cleared(
        &self,
        requester: RequesterId,
        count: usize,
    ) -> Result<(), NotifyError> {
        self.record(Event::Cleared { requester, count })
    }

    async fn notify_queue_status(
        &self,
        requester: RequesterId,
        summary: &[StatusSummary],
    ) -> Result<(), NotifyError> {
        self.record(Event::Status {
            requester,
            summary: summary.to_vec(),
        })
    }

    async fn notify_published(
        &self,
        requester: RequesterId,
        job_id: JobId,
    ) -> Result<(), NotifyError> {
        self.record(Event::Published { requester, job_id })
    }

    async fn notify_failed(
        &self,
        requester: RequesterId,
        job_id: JobId,
        error: &JobError,
    ) -> Result<(), NotifyError> {
        self.record(Event::Failed {
            requester,
            job_id,
            error: error.clone(),
        })
    }
}

struct Harness {
    scheduler: Scheduler,
    store: Arc<JobStore>,
    clock: TokioClock,
    fetcher: Arc<ScriptedFetcher>,
    publisher: Arc<RecordingPublisher>,
    scratch: Arc<RecordingScratch>,
    notifier: Arc<RecordingNotifier>,
}

struct Setup {
    store: JobStore,
    policy: RetryPolicy,
    config: ExecutorConfig,
    fetcher: ScriptedFetcher,
    publisher: RecordingPublisher,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            store: JobStore::open_in_memory().unwrap(),
            policy: RetryPolicy::default(),
            config: ExecutorConfig::default(),
            fetcher: ScriptedFetcher::default(),
            publisher: RecordingPublisher::default(),
        }
    }
}

impl Setup {
    fn build(self) -> Harness {
        let store = Arc::new(self.store);
        let clock = TokioClock::new();
        let fetcher = Arc::new(self.fetcher);
        let publisher = Arc::new(self.publisher);
        let scratch = Arc::new(RecordingScratch::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let executor = JobExecutor::new(
            fetcher.clone(),
            publisher.clone(),
            scratch.clone(),
            self.config,
        );
        let scheduler = Scheduler::new(SchedulerParts {
            store: Arc::clone(&store),
            executor,
            notifier: notifier.clone(),
            policy: self.policy,
            clock: Arc::new(clock),
        });

        Harness {
            scheduler,
            store,
            clock,
            fetcher,
            publisher,
            scratch,
            notifier,
        }
    }
}

/// Wait for the drain pass started by the last submit to go idle.
async fn settle(scheduler: &Scheduler) {
    let mut state = scheduler.state();
    state
        .wait_for(|s| *s == LoopState::Idle)
        .await
        .unwrap();
}

fn payload(n: u32) -> PublishPayload {
    PublishPayload::new(format!("https://x.com/user/status/{n}"), "caption")
}

// === Unit Tests ===

#[tokio::test(start_paused = true)]
async fn test_publishes_and_resolves_waiter() {
    let h = Setup {
        fetcher: ScriptedFetcher::with([post_with(2)]),
        ..Setup::default()
    }
    .build();

    let pending = h.scheduler.submit(7, payload(1), None).unwrap();
    assert_eq!(pending.wait().await, Ok(()));

    let calls = h.publisher.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0.len(), 2);
    assert!(calls[0].1.as_deref().unwrap().starts_with("caption"));
    assert_eq!(h.scratch.released.lock().unwrap().len(), 2);
    assert!(h.store.is_empty().unwrap());
    assert!(h.notifier.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_exhaust_attempts() {
    let h = Setup {
        fetcher: ScriptedFetcher::with([transient(), transient(), transient()]),
        ..Setup::default()
    }
    .build();

    let pending = h.scheduler.submit(7, payload(1), None).unwrap();
    assert_eq!(
        pending.wait().await,
        Err(JobError::Fetch("connection reset".to_string()))
    );

    assert_eq!(h.fetcher.fetched().len(), 3);
    assert!(h.store.is_empty().unwrap());

    let retries: Vec<(u32, DateTime<Utc>)> = h
        .notifier
        .events()
        .into_iter()
        .filter_map(|event| match event {
            Event::Retry {
                attempt, retry_at, max_attempts, ..
            } => {
                assert_eq!(max_attempts, 3);
                Some((attempt, retry_at))
            }
            _ => None,
        })
        .collect();
    assert_eq!(retries.iter().map(|(a, _)| *a).collect::<Vec<_>>(), vec![2, 3]);

    // Second delay is one increment longer than the first.
    let gap = retries[1].1 - retries[0].1;
    assert!(gap >= Duration::seconds(20) && gap < Duration::seconds(21));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_does_not_consume_attempts() {
    let h = Setup {
        policy: RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        },
        ..Setup::default()
    }
    .build();

    let limited = |secs| FetchOutcome::RateLimited {
        retry_at: h.clock.now() + Duration::seconds(secs),
        message: "too many requests".to_string(),
    };
    h.fetcher
        .script
        .lock()
        .unwrap()
        .extend([limited(60), limited(120), transient(), post_with(1)]);

    let pending = h.scheduler.submit(7, payload(1), None).unwrap();
    assert_eq!(pending.wait().await, Ok(()));

    let events = h.notifier.events();
    let rate_limited = events
        .iter()
        .filter(|e| matches!(e, Event::RateLimited { .. }))
        .count();
    let retries = events
        .iter()
        .filter(|e| matches!(e, Event::Retry { .. }))
        .count();
    assert_eq!(rate_limited, 2);
    assert_eq!(retries, 1);
    assert_eq!(h.fetcher.fetched().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_jobs_run_in_available_at_order() {
    let h = Setup::default().build();
    let now = h.clock.now();

    let late = h
        .scheduler
        .submit(1, payload(1), Some(now + Duration::seconds(10)))
        .unwrap();
    let middle = h
        .scheduler
        .submit(1, payload(2), Some(now + Duration::seconds(5)))
        .unwrap();
    let early = h.scheduler.submit(1, payload(3), Some(now)).unwrap();

    assert_eq!(early.wait().await, Ok(()));
    assert_eq!(middle.wait().await, Ok(()));
    assert_eq!(late.wait().await, Ok(()));

    assert_eq!(
        h.fetcher.fetched(),
        vec![
            payload(3).post_url,
            payload(2).post_url,
            payload(1).post_url
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_job_in_flight() {
    let h = Setup {
        publisher: RecordingPublisher {
            latency: Some(StdDuration::from_secs(1)),
            ..RecordingPublisher::default()
        },
        ..Setup::default()
    }
    .build();

    let handles: Vec<_> = (1..=4)
        .map(|n| h.scheduler.submit(1, payload(n), None).unwrap())
        .collect();
    for handle in handles {
        assert_eq!(handle.wait().await, Ok(()));
    }

    assert_eq!(h.publisher.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(h.publisher.calls().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_post_without_media_fails_permanently() {
    let h = Setup {
        fetcher: ScriptedFetcher::with([post_with(0)]),
        ..Setup::default()
    }
    .build();

    let pending = h.scheduler.submit(7, payload(1), None).unwrap();
    assert_eq!(pending.wait().await, Err(JobError::NoMedia));
    assert_eq!(h.fetcher.fetched().len(), 1);
    assert!(h.publisher.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_post_without_media_publishes_text_when_allowed() {
    let h = Setup {
        fetcher: ScriptedFetcher::with([post_with(0)]),
        config: ExecutorConfig {
            require_media: false,
            ..ExecutorConfig::default()
        },
        ..Setup::default()
    }
    .build();

    let pending = h.scheduler.submit(7, payload(1), None).unwrap();
    assert_eq!(pending.wait().await, Ok(()));

    let calls = h.publisher.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].0.is_empty());
    assert!(calls[0].1.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_large_album_is_published_in_batches() {
    let h = Setup {
        fetcher: ScriptedFetcher::with([post_with(12)]),
        ..Setup::default()
    }
    .build();

    let pending = h.scheduler.submit(7, payload(1), None).unwrap();
    assert_eq!(pending.wait().await, Ok(()));

    let calls = h.publisher.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0.len(), 10);
    assert!(calls[0].1.is_some());
    assert_eq!(calls[1].0.len(), 2);
    assert_eq!(calls[1].1, None);
    assert_eq!(h.scratch.released.lock().unwrap().len(), 12);
}

#[tokio::test(start_paused = true)]
async fn test_download_failure_releases_scratch() {
    let h = Setup {
        fetcher: ScriptedFetcher {
            fail_downloads: true,
            ..ScriptedFetcher::with([post_with(3)])
        },
        policy: RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        },
        ..Setup::default()
    }
    .build();

    let pending = h.scheduler.submit(7, payload(1), None).unwrap();
    assert_eq!(
        pending.wait().await,
        Err(JobError::Download("404 Not Found".to_string()))
    );
    assert_eq!(
        *h.scratch.released.lock().unwrap(),
        vec![PathBuf::from("/scratch/0.jpg")]
    );
}

#[tokio::test(start_paused = true)]
async fn test_publish_failure_is_retried() {
    let h = Setup {
        publisher: RecordingPublisher::with([PublishOutcome::Failed {
            reason: "Bad Gateway".to_string(),
        }]),
        ..Setup::default()
    }
    .build();

    let pending = h.scheduler.submit(7, payload(1), None).unwrap();
    assert_eq!(pending.wait().await, Ok(()));
    assert_eq!(h.publisher.calls().len(), 2);
    assert!(matches!(
        h.notifier.events().as_slice(),
        [Event::Retry { attempt: 2, .. }]
    ));
}

#[tokio::test(start_paused = true)]
async fn test_destination_rate_limit_defers_job() {
    let h = Setup::default().build();
    let retry_at = h.clock.now() + Duration::seconds(30);
    h.publisher
        .script
        .lock()
        .unwrap()
        .push_back(PublishOutcome::RateLimited { retry_at });

    let pending = h.scheduler.submit(7, payload(1), None).unwrap();
    assert_eq!(pending.wait().await, Ok(()));
    assert_eq!(
        h.notifier.events(),
        vec![Event::RateLimited {
            requester: 7,
            retry_at
        }]
    );
    assert!(h.clock.now() >= retry_at);
}

#[tokio::test(start_paused = true)]
async fn test_clear_queue_rejects_waiters() {
    let h = Setup::default().build();
    let later = h.clock.now() + Duration::seconds(60);

    let first = h.scheduler.submit(1, payload(1), Some(later)).unwrap();
    let second = h.scheduler.submit(2, payload(2), Some(later)).unwrap();
    settle(&h.scheduler).await;
    assert!(h.scheduler.next_wake().is_some());

    assert_eq!(h.scheduler.clear_queue(5).await.unwrap(), 2);
    assert_eq!(first.wait().await, Err(JobError::Cleared));
    assert_eq!(second.wait().await, Err(JobError::Cleared));
    assert!(h.store.is_empty().unwrap());
    assert_eq!(h.scheduler.next_wake(), None);
    assert_eq!(
        h.notifier.events(),
        vec![Event::Cleared {
            requester: 5,
            count: 2
        }]
    );
    assert!(h.fetcher.fetched().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_queue_status_is_returned_and_notified() {
    let h = Setup::default().build();
    let later = h.clock.now() + Duration::seconds(60);
    h.scheduler.submit(1, payload(1), Some(later)).unwrap();
    h.scheduler.submit(1, payload(2), Some(later)).unwrap();

    let summary = h.scheduler.queue_status(9).await.unwrap();
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].status, JobStatus::Pending);
    assert_eq!(summary[0].count, 2);
    assert_eq!(
        h.notifier.events(),
        vec![Event::Status {
            requester: 9,
            summary
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_submit_rejects_invalid_payload() {
    let h = Setup::default().build();
    let result = h
        .scheduler
        .submit(1, PublishPayload::new("not a link", ""), None);
    assert!(matches!(result, Err(QueueError::InvalidPayload(_))));
    assert!(h.store.is_empty().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_recovered_job_reports_through_notifier() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.sqlite");

    let job_id = {
        let store = JobStore::open(&path).unwrap();
        let id = store
            .enqueue(&NewJob::new(42, payload(1), Utc::now()))
            .unwrap();
        store.reserve_next(Utc::now()).unwrap().unwrap();
        id
    };

    let h = Setup {
        store: JobStore::open(&path).unwrap(),
        ..Setup::default()
    }
    .build();
    h.scheduler.start();

    tokio::time::timeout(StdDuration::from_secs(60), async {
        while h.notifier.events().is_empty() {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(
        h.notifier.events(),
        vec![Event::Published {
            requester: 42,
            job_id
        }]
    );
    assert!(h.store.is_empty().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_pending_work() {
    let h = Setup::default().build();
    let later = h.clock.now() + Duration::seconds(30);
    let _pending = h.scheduler.submit(1, payload(1), Some(later)).unwrap();
    settle(&h.scheduler).await;

    h.scheduler.shutdown().await;
    tokio::time::sleep(StdDuration::from_secs(60)).await;

    assert!(h.fetcher.fetched().is_empty());
    assert_eq!(*h.scheduler.state().borrow(), LoopState::Stopped);
    assert_eq!(h.store.len().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_waiter_falls_back_to_notifier() {
    let h = Setup {
        fetcher: ScriptedFetcher::with([post_with(0)]),
        ..Setup::default()
    }
    .build();

    let pending = h.scheduler.submit(3, payload(1), None).unwrap();
    let job_id = pending.job_id();
    drop(pending);

    tokio::time::timeout(StdDuration::from_secs(60), async {
        while h.notifier.events().is_empty() {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(
        h.notifier.events(),
        vec![Event::Failed {
            requester: 3,
            job_id,
            error: JobError::NoMedia
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_video_variants_reported_once_before_outcome() {
    let h = Setup {
        fetcher: ScriptedFetcher::with([video_post(), video_post()]),
        publisher: RecordingPublisher::with([PublishOutcome::Failed {
            reason: "Request Entity Too Large".to_string(),
        }]),
        ..Setup::default()
    }
    .build();

    let pending = h.scheduler.submit(7, payload(1), None).unwrap();
    assert_eq!(pending.wait().await, Ok(()));

    let FetchOutcome::Fetched(post) = video_post() else {
        unreachable!();
    };
    let events = h.notifier.events();
    assert_eq!(events.len(), 2);
    assert_eq!(
        events[0],
        Event::Videos {
            requester: 7,
            videos: post.videos
        }
    );
    assert!(matches!(events[1], Event::Retry { attempt: 2, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_failed_fetch_reports_no_video_variants() {
    let h = Setup {
        fetcher: ScriptedFetcher::with([transient()]),
        policy: RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        },
        ..Setup::default()
    }
    .build();

    let pending = h.scheduler.submit(7, payload(1), None).unwrap();
    assert!(pending.wait().await.is_err());
    assert!(
        !h.notifier
            .events()
            .iter()
            .any(|e| matches!(e, Event::Videos { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_clear_rearms_wake_for_jobs_submitted_after_it() {
    let h = Setup::default().build();
    let later = h.clock.now() + Duration::seconds(60);

    let _cleared = h.scheduler.submit(1, payload(1), Some(later)).unwrap();
    settle(&h.scheduler).await;
    h.scheduler.clear_queue(5).await.unwrap();

    let kept = h.scheduler.submit(1, payload(2), Some(later)).unwrap();
    settle(&h.scheduler).await;
    let queued = h.store.get(kept.job_id()).unwrap().unwrap();
    assert_eq!(h.scheduler.next_wake(), Some(queued.available_at));
    assert_eq!(kept.wait().await, Ok(()));
    assert_eq!(h.fetcher.fetched(), vec![payload(2).post_url]);
}

/// Outcome of `pending` if it has already been delivered.
async fn delivered(pending: crosspost_queue::PendingPublish) -> Option<Result<(), JobError>> {
    tokio::time::timeout(StdDuration::ZERO, tokio::task::unconstrained(pending.wait()))
        .await
        .ok()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clear_racing_submits_only_rejects_removed_jobs() {
    let h = Setup::default().build();

    for round in 0..500u32 {
        let later = h.clock.now() + Duration::days(1);
        let submits: Vec<_> = (0..4)
            .map(|n| {
                let scheduler = h.scheduler.clone();
                tokio::spawn(async move {
                    scheduler
                        .submit(1, payload(round * 4 + n), Some(later))
                        .unwrap()
                })
            })
            .collect();
        let clear = {
            let scheduler = h.scheduler.clone();
            tokio::spawn(async move { scheduler.clear_queue(5).await.unwrap() })
        };
        let removed = clear.await.unwrap();

        let mut survivors = 0;
        for submit in submits {
            let pending = submit.await.unwrap();
            let job_id = pending.job_id();
            let queued = h.store.get(job_id).unwrap().is_some();
            let outcome = delivered(pending).await;
            if queued {
                survivors += 1;
                assert_eq!(outcome, None, "round {round}: job {job_id} is queued but resolved");
            } else {
                assert_eq!(
                    outcome,
                    Some(Err(JobError::Cleared)),
                    "round {round}: job {job_id} was removed"
                );
            }
        }
        assert_eq!(removed + survivors, 4, "round {round}");

        settle(&h.scheduler).await;
        if survivors > 0 {
            assert!(h.scheduler.next_wake().is_some(), "round {round}: survivors have no wake");
        }
        h.scheduler.clear_queue(5).await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_store_failure_halts_scheduler() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.sqlite");
    let h = Setup {
        store: JobStore::open(&path).unwrap(),
        ..Setup::default()
    }
    .build();

    let later = h.clock.now() + Duration::seconds(30);
    let pending = h.scheduler.submit(1, payload(1), Some(later)).unwrap();
    settle(&h.scheduler).await;

    rusqlite::Connection::open(&path)
        .unwrap()
        .execute("DROP TABLE publish_post_queue", [])
        .unwrap();

    let reason = tokio::time::timeout(StdDuration::from_secs(60), h.scheduler.halted())
        .await
        .unwrap();
    assert!(reason.contains("publish_post_queue"), "{reason}");
    assert_eq!(*h.scheduler.state().borrow(), LoopState::Halted);
    assert_eq!(pending.wait().await, Err(JobError::Halted(reason.clone())));
    assert!(h.fetcher.fetched().is_empty());

    let err = h.scheduler.submit(1, payload(2), None).unwrap_err();
    assert!(matches!(err, QueueError::Halted(r) if r == reason));
    assert_eq!(h.scheduler.next_wake(), None);
}
