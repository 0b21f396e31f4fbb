//! SQLite-backed job store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, info, warn};

use crate::{Job, JobId, JobStatus, NewJob, PublishPayload, QueueError, StatusSummary};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS publish_post_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        requester_id INTEGER NOT NULL,
        post_url TEXT NOT NULL,
        user_text TEXT NOT NULL,
        status TEXT NOT NULL,
        available_at INTEGER NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_delay_ms INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_publish_post_queue_status_available
        ON publish_post_queue(status, available_at);
";

const JOB_COLUMNS: &str = "id, requester_id, post_url, user_text, status, available_at, \
                           retry_count, last_delay_ms, created_at, updated_at";

/// Durable job queue.
///
/// Timestamps are stored as epoch milliseconds. Every mutation is a single
/// statement or an immediate transaction, so it is atomic on its own.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Open or create the queue database, then recover interrupted jobs.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self::init(conn)?;

        info!(path = %path.display(), "job store opened");
        Ok(store)
    }

    /// An in-memory store, lost when dropped.
    pub fn open_in_memory() -> Result<Self, QueueError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, QueueError> {
        conn.execute_batch(SCHEMA)?;
        let store = Self {
            conn: Mutex::new(conn),
        };

        let recovered = store.recover_interrupted(Utc::now())?;
        if recovered > 0 {
            warn!(recovered, "reset interrupted jobs to pending");
        }

        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Return every `processing` job to `pending`, eligible at `now`.
    ///
    /// Retry counters are left alone.
    pub fn recover_interrupted(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let now = now.timestamp_millis();
        let count = self.conn().execute(
            "UPDATE publish_post_queue
             SET status = 'pending', available_at = ?1, updated_at = ?1
             WHERE status = 'processing'",
            params![now],
        )?;
        Ok(count)
    }

    /// Insert a pending job and return its id.
    pub fn enqueue(&self, job: &NewJob) -> Result<JobId, QueueError> {
        let now = Utc::now().timestamp_millis();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO publish_post_queue
             (requester_id, post_url, user_text, status, available_at, retry_count,
              last_delay_ms, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7, ?7)",
            params![
                job.requester_id,
                job.payload.post_url,
                job.payload.user_text,
                job.available_at.timestamp_millis(),
                job.retry_count,
                job.last_delay_ms,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();

        debug!(job_id = id, available_at = %job.available_at, "job inserted");
        Ok(id)
    }

    /// Atomically claim the next eligible job.
    ///
    /// Picks the pending job with the smallest `(available_at, id)` whose
    /// `available_at` is not after `now`, and marks it `processing`.
    pub fn reserve_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, QueueError> {
        let now_ms = now.timestamp_millis();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = tx
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM publish_post_queue
                     WHERE status = 'pending' AND available_at <= ?1
                     ORDER BY available_at ASC, id ASC
                     LIMIT 1"
                ),
                params![now_ms],
                row_to_job,
            )
            .optional()?;

        let Some(mut job) = job else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE publish_post_queue SET status = 'processing', updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![job.id, now_ms],
        )?;
        tx.commit()?;

        job.status = JobStatus::Processing;
        job.updated_at = millis_to_datetime(9, now_ms)?;
        Ok(Some(job))
    }

    /// Earliest `available_at` among pending jobs.
    pub fn peek_next_available_at(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
        let ms: Option<i64> = self.conn().query_row(
            "SELECT MIN(available_at) FROM publish_post_queue WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(ms.map(|ms| millis_to_datetime(0, ms)).transpose()?)
    }

    // =========================================================================
    // Outcomes
    // =========================================================================

    /// Return a processing job to pending after a transient failure.
    ///
    /// Increments `retry_count`. `available_at` never moves earlier than it
    /// already is. Returns false if the job is no longer processing.
    pub fn reschedule(
        &self,
        id: JobId,
        available_at: DateTime<Utc>,
        delay_ms: i64,
    ) -> Result<bool, QueueError> {
        let changed = self.conn().execute(
            "UPDATE publish_post_queue
             SET status = 'pending',
                 available_at = MAX(available_at, ?2),
                 last_delay_ms = ?3,
                 retry_count = retry_count + 1,
                 updated_at = ?4
             WHERE id = ?1 AND status = 'processing'",
            params![
                id,
                available_at.timestamp_millis(),
                delay_ms,
                Utc::now().timestamp_millis()
            ],
        )?;
        self.report_missing(id, changed, "reschedule");
        Ok(changed > 0)
    }

    /// Return a processing job to pending after a rate limit.
    ///
    /// Same as [`Self::reschedule`] but keeps `retry_count`.
    pub fn defer(
        &self,
        id: JobId,
        available_at: DateTime<Utc>,
        delay_ms: i64,
    ) -> Result<bool, QueueError> {
        let changed = self.conn().execute(
            "UPDATE publish_post_queue
             SET status = 'pending',
                 available_at = MAX(available_at, ?2),
                 last_delay_ms = ?3,
                 updated_at = ?4
             WHERE id = ?1 AND status = 'processing'",
            params![
                id,
                available_at.timestamp_millis(),
                delay_ms,
                Utc::now().timestamp_millis()
            ],
        )?;
        self.report_missing(id, changed, "defer");
        Ok(changed > 0)
    }

    /// Delete a job that published.
    pub fn complete(&self, id: JobId) -> Result<bool, QueueError> {
        self.delete(id, "complete")
    }

    /// Delete a job that failed permanently.
    pub fn fail(&self, id: JobId) -> Result<bool, QueueError> {
        self.delete(id, "fail")
    }

    fn delete(&self, id: JobId, op: &'static str) -> Result<bool, QueueError> {
        let changed = self
            .conn()
            .execute("DELETE FROM publish_post_queue WHERE id = ?1", params![id])?;
        self.report_missing(id, changed, op);
        Ok(changed > 0)
    }

    fn report_missing(&self, id: JobId, changed: usize, op: &'static str) {
        if changed == 0 {
            debug!(job_id = id, op, "job no longer in flight, nothing to update");
        }
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Delete every pending and processing job. Returns how many were removed.
    pub fn clear_all(&self) -> Result<usize, QueueError> {
        let count = self.conn().execute(
            "DELETE FROM publish_post_queue WHERE status IN ('pending', 'processing')",
            [],
        )?;
        info!(count, "queue cleared");
        Ok(count)
    }

    /// Per-status counts, earliest availability, and highest retry count.
    pub fn status_summary(&self) -> Result<Vec<StatusSummary>, QueueError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*), MIN(available_at), MAX(retry_count)
             FROM publish_post_queue
             GROUP BY status
             ORDER BY status",
        )?;

        let rows = stmt
            .query_map([], |row| {
                let status = parse_status(row, 0)?;
                let count: i64 = row.get(1)?;
                let next: Option<i64> = row.get(2)?;
                Ok(StatusSummary {
                    status,
                    count: u64::try_from(count).unwrap_or_default(),
                    next_available_at: next.map(|ms| millis_to_datetime(2, ms)).transpose()?,
                    max_retry_count: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Look up a single job.
    pub fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let job = self
            .conn()
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM publish_post_queue WHERE id = ?1"),
                params![id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Number of live jobs.
    pub fn len(&self) -> Result<usize, QueueError> {
        let count: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM publish_post_queue", [], |row| {
                    row.get(0)
                })?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        requester_id: row.get(1)?,
        payload: PublishPayload {
            post_url: row.get(2)?,
            user_text: row.get(3)?,
        },
        status: parse_status(row, 4)?,
        available_at: millis_to_datetime(5, row.get(5)?)?,
        retry_count: row.get(6)?,
        last_delay_ms: row.get(7)?,
        created_at: millis_to_datetime(8, row.get(8)?)?,
        updated_at: millis_to_datetime(9, row.get(9)?)?,
    })
}

fn parse_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<JobStatus> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn millis_to_datetime(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}
