//! Job Store
//!
//! SQLite persistence for ingestion jobs. The claim is the sole
//! concurrency-control point across worker processes: a conditional
//! update on `status = 'pending'` that affects zero rows means
//! another worker won the race.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use super::{Job, JobStatus, Platform, MAX_RETRIES};
use crate::core::{CoreError, CoreResult};

/// Error message written by the stuck-job reset
const STUCK_RESET_MESSAGE: &str = "Reset: worker abandoned this job";

// =============================================================================
// Job Store
// =============================================================================

/// SQLite store for jobs
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Creates a new job store at the specified path
    pub fn create<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CoreError::Storage(format!("Failed to create job store: {}", e)))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Opens an existing job store
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CoreError::Storage(format!("Failed to open job store: {}", e)))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Creates an in-memory store (for testing)
    pub fn in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::Storage(format!("Failed to create in-memory store: {}", e)))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                url TEXT NOT NULL,
                platform TEXT NOT NULL,
                custom_instruction TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                progress INTEGER NOT NULL DEFAULT 0,
                current_step TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                worker_id TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                saved_at TEXT,
                transcript TEXT,
                summary TEXT,
                key_points TEXT NOT NULL DEFAULT '[]',
                tags TEXT NOT NULL DEFAULT '[]',
                video_title TEXT,
                thumbnail_url TEXT,
                duration_secs REAL,
                saved_page_id TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(user_id);
            "#,
        )
        .map_err(|e| CoreError::Storage(format!("Failed to initialize job schema: {}", e)))?;

        Ok(())
    }

    /// Inserts a new job
    pub fn create_job(&self, job: &Job) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO jobs (
                id, user_id, url, platform, custom_instruction, status, progress,
                current_step, retry_count, worker_id, error_message, created_at,
                started_at, completed_at, saved_at, transcript, summary,
                key_points, tags, video_title, thumbnail_url, duration_secs, saved_page_id
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23
            )
            "#,
            params![
                job.id,
                job.user_id,
                job.url,
                job.platform.to_string(),
                job.custom_instruction,
                job.status.to_string(),
                job.progress,
                job.current_step,
                job.retry_count,
                job.worker_id,
                job.error_message,
                job.created_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.completed_at.map(|t| t.to_rfc3339()),
                job.saved_at.map(|t| t.to_rfc3339()),
                job.transcript,
                job.summary,
                serde_json::to_string(&job.key_points)?,
                serde_json::to_string(&job.tags)?,
                job.video_title,
                job.thumbnail_url,
                job.duration_secs,
                job.saved_page_id,
            ],
        )?;
        Ok(())
    }

    /// Fetches a job by id
    pub fn get_job(&self, job_id: &str) -> CoreResult<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![job_id],
                map_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Lists an owner's jobs, newest first
    pub fn list_jobs(&self, user_id: &str) -> CoreResult<Vec<Job>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs WHERE user_id = ?1 ORDER BY created_at DESC",
            JOB_COLUMNS
        ))?;

        let rows = stmt.query_map(params![user_id], map_job)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Claims the oldest pending job for a worker.
    ///
    /// Selects the oldest pending row, then conditionally updates it
    /// to `downloading` only if it is still pending. Zero rows
    /// affected means another worker won the race; the caller gets
    /// `None` rather than a retry on the same row.
    pub fn claim_next(&self, worker_id: &str) -> CoreResult<Option<Job>> {
        let candidate: Option<String> = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT id FROM jobs WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?
        };

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        let updated = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                r#"
                UPDATE jobs
                SET status = 'downloading', worker_id = ?1, started_at = ?2, error_message = NULL
                WHERE id = ?3 AND status = 'pending'
                "#,
                params![worker_id, Utc::now().to_rfc3339(), job_id],
            )?
        };

        if updated == 0 {
            // Lost the race to another worker.
            return Ok(None);
        }

        self.get_job(&job_id)
    }

    /// Updates a job's status
    pub fn set_status(&self, job_id: &str, status: JobStatus) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE jobs SET status = ?1 WHERE id = ?2",
            params![status.to_string(), job_id],
        )?;
        if updated == 0 {
            return Err(CoreError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    /// Persists progress and the current step label
    pub fn update_progress(&self, job_id: &str, progress: u8, step: &str) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET progress = ?1, current_step = ?2 WHERE id = ?3",
            params![progress.min(100), step, job_id],
        )?;
        Ok(())
    }

    /// Persists best-effort video metadata
    pub fn set_video_metadata(
        &self,
        job_id: &str,
        title: Option<&str>,
        thumbnail_url: Option<&str>,
        duration_secs: Option<f64>,
    ) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            UPDATE jobs SET
                video_title = COALESCE(?1, video_title),
                thumbnail_url = COALESCE(?2, thumbnail_url),
                duration_secs = COALESCE(?3, duration_secs)
            WHERE id = ?4
            "#,
            params![title, thumbnail_url, duration_secs, job_id],
        )?;
        Ok(())
    }

    /// Persists the transcript
    pub fn set_transcript(&self, job_id: &str, transcript: &str) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET transcript = ?1 WHERE id = ?2",
            params![transcript, job_id],
        )?;
        Ok(())
    }

    /// Persists the summary
    pub fn set_summary(&self, job_id: &str, summary: &str) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET summary = ?1 WHERE id = ?2",
            params![summary, job_id],
        )?;
        Ok(())
    }

    /// Persists key points and tags
    pub fn set_enrichment(
        &self,
        job_id: &str,
        key_points: &[String],
        tags: &[String],
    ) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET key_points = ?1, tags = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(key_points)?,
                serde_json::to_string(tags)?,
                job_id
            ],
        )?;
        Ok(())
    }

    /// Marks a job's pipeline complete
    pub fn mark_ready(&self, job_id: &str) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            UPDATE jobs SET status = 'ready', progress = 100, current_step = NULL, completed_at = ?1
            WHERE id = ?2
            "#,
            params![Utc::now().to_rfc3339(), job_id],
        )?;
        Ok(())
    }

    /// Records a failure: re-queues the job while the retry budget
    /// lasts, fails it terminally otherwise. Returns the resulting
    /// status.
    pub fn fail_job(&self, job_id: &str, error: &str) -> CoreResult<JobStatus> {
        let conn = self.conn.lock().unwrap();

        let retry_count: u32 = conn
            .query_row(
                "SELECT retry_count FROM jobs WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| CoreError::JobNotFound(job_id.to_string()))?;

        let new_count = retry_count + 1;
        let status = if new_count < MAX_RETRIES {
            JobStatus::Pending
        } else {
            JobStatus::Failed
        };

        conn.execute(
            r#"
            UPDATE jobs
            SET status = ?1, retry_count = ?2, error_message = ?3, worker_id = NULL
            WHERE id = ?4
            "#,
            params![status.to_string(), new_count, error, job_id],
        )?;

        Ok(status)
    }

    /// Transitions a ready job to saved with the created page id.
    /// Conditional on `status = 'ready'` so a job cannot be saved
    /// twice or from the wrong state.
    pub fn mark_saved(&self, job_id: &str, page_id: &str) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            r#"
            UPDATE jobs SET status = 'saved', saved_at = ?1, saved_page_id = ?2
            WHERE id = ?3 AND status = 'ready'
            "#,
            params![Utc::now().to_rfc3339(), page_id, job_id],
        )?;

        if updated == 0 {
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM jobs WHERE id = ?1",
                    params![job_id],
                    |row| row.get(0),
                )
                .optional()?;
            return match status {
                Some(s) => Err(CoreError::InvalidJobStatus(s)),
                None => Err(CoreError::JobNotFound(job_id.to_string())),
            };
        }
        Ok(())
    }

    /// Moves all of an owner's non-terminal jobs to `failed`. Escape
    /// hatch for claims abandoned by crashed workers.
    pub fn reset_stuck_jobs(&self, user_id: &str) -> CoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            r#"
            UPDATE jobs SET status = 'failed', error_message = ?1, worker_id = NULL
            WHERE user_id = ?2 AND status NOT IN ('saved', 'failed')
            "#,
            params![STUCK_RESET_MESSAGE, user_id],
        )?;

        if updated > 0 {
            info!(user_id, count = updated, "Reset stuck jobs");
        }
        Ok(updated)
    }
}

// =============================================================================
// Row Mapping
// =============================================================================

const JOB_COLUMNS: &str = "id, user_id, url, platform, custom_instruction, status, progress, \
    current_step, retry_count, worker_id, error_message, created_at, started_at, completed_at, \
    saved_at, transcript, summary, key_points, tags, video_title, thumbnail_url, duration_secs, \
    saved_page_id";

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn map_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let platform: String = row.get(3)?;
    let status: String = row.get(5)?;
    let key_points: String = row.get(17)?;
    let tags: String = row.get(18)?;

    Ok(Job {
        id: row.get(0)?,
        user_id: row.get(1)?,
        url: row.get(2)?,
        platform: match platform.as_str() {
            "instagram" => Platform::Instagram,
            _ => Platform::Youtube,
        },
        custom_instruction: row.get(4)?,
        status: status.parse().unwrap_or_default(),
        progress: row.get(6)?,
        current_step: row.get(7)?,
        retry_count: row.get(8)?,
        worker_id: row.get(9)?,
        error_message: row.get(10)?,
        created_at: parse_time(row.get(11)?).unwrap_or_default(),
        started_at: parse_time(row.get(12)?),
        completed_at: parse_time(row.get(13)?),
        saved_at: parse_time(row.get(14)?),
        transcript: row.get(15)?,
        summary: row.get(16)?,
        key_points: serde_json::from_str(&key_points).unwrap_or_default(),
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        video_title: row.get(19)?,
        thumbnail_url: row.get(20)?,
        duration_secs: row.get(21)?,
        saved_page_id: row.get(22)?,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_job(user_id: &str) -> Job {
        Job::new(user_id, "https://youtu.be/abc").unwrap()
    }

    #[test]
    fn test_create_and_get_job() {
        let store = JobStore::in_memory().unwrap();
        let job = pending_job("user-1");
        store.create_job(&job).unwrap();

        let loaded = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.platform, Platform::Youtube);
    }

    #[test]
    fn test_claim_oldest_pending() {
        let store = JobStore::in_memory().unwrap();
        let mut older = pending_job("user-1");
        older.created_at = Utc::now() - chrono::Duration::minutes(5);
        let newer = pending_job("user-1");
        store.create_job(&newer).unwrap();
        store.create_job(&older).unwrap();

        let claimed = store.claim_next("worker-1").unwrap().unwrap();
        assert_eq!(claimed.id, older.id);
        assert_eq!(claimed.status, JobStatus::Downloading);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
        assert!(claimed.started_at.is_some());
    }

    #[test]
    fn test_claim_exclusivity() {
        let store = JobStore::in_memory().unwrap();
        let job = pending_job("user-1");
        store.create_job(&job).unwrap();

        // First claim wins; the second observes no pending job.
        assert!(store.claim_next("worker-1").unwrap().is_some());
        assert!(store.claim_next("worker-2").unwrap().is_none());
    }

    #[test]
    fn test_claim_conditional_on_pending() {
        let store = JobStore::in_memory().unwrap();
        let job = pending_job("user-1");
        store.create_job(&job).unwrap();

        // Simulate another worker flipping the row between the select
        // and the update by moving it out of pending first.
        store.set_status(&job.id, JobStatus::Transcribing).unwrap();
        assert!(store.claim_next("worker-1").unwrap().is_none());
    }

    #[test]
    fn test_fail_job_requeues_until_budget_spent() {
        let store = JobStore::in_memory().unwrap();
        let job = pending_job("user-1");
        store.create_job(&job).unwrap();

        // Failures 1 and 2 re-queue; failure 3 is terminal.
        assert_eq!(store.fail_job(&job.id, "boom").unwrap(), JobStatus::Pending);
        assert_eq!(store.fail_job(&job.id, "boom").unwrap(), JobStatus::Pending);
        assert_eq!(store.fail_job(&job.id, "boom").unwrap(), JobStatus::Failed);

        let loaded = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(loaded.retry_count, 3);
        assert_eq!(loaded.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_mark_saved_requires_ready() {
        let store = JobStore::in_memory().unwrap();
        let job = pending_job("user-1");
        store.create_job(&job).unwrap();

        assert!(matches!(
            store.mark_saved(&job.id, "page-1"),
            Err(CoreError::InvalidJobStatus(_))
        ));

        store.mark_ready(&job.id).unwrap();
        store.mark_saved(&job.id, "page-1").unwrap();

        let loaded = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Saved);
        assert_eq!(loaded.saved_page_id.as_deref(), Some("page-1"));
        assert!(loaded.saved_at.is_some());

        // Saving twice is rejected.
        assert!(store.mark_saved(&job.id, "page-2").is_err());
    }

    #[test]
    fn test_outputs_persisted() {
        let store = JobStore::in_memory().unwrap();
        let job = pending_job("user-1");
        store.create_job(&job).unwrap();

        store.set_transcript(&job.id, "the transcript").unwrap();
        store.set_summary(&job.id, "## Summary").unwrap();
        store
            .set_enrichment(
                &job.id,
                &["point one".to_string()],
                &["rust".to_string(), "video".to_string()],
            )
            .unwrap();
        store
            .set_video_metadata(&job.id, Some("Title"), None, Some(120.0))
            .unwrap();
        store.update_progress(&job.id, 80, "Summarizing").unwrap();

        let loaded = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(loaded.transcript.as_deref(), Some("the transcript"));
        assert_eq!(loaded.summary.as_deref(), Some("## Summary"));
        assert_eq!(loaded.key_points, vec!["point one"]);
        assert_eq!(loaded.tags, vec!["rust", "video"]);
        assert_eq!(loaded.video_title.as_deref(), Some("Title"));
        assert_eq!(loaded.duration_secs, Some(120.0));
        assert_eq!(loaded.progress, 80);
        assert_eq!(loaded.current_step.as_deref(), Some("Summarizing"));
    }

    #[test]
    fn test_reset_stuck_jobs_scoped_to_owner() {
        let store = JobStore::in_memory().unwrap();

        let mine = pending_job("user-1");
        store.create_job(&mine).unwrap();
        store.set_status(&mine.id, JobStatus::Transcribing).unwrap();

        let done = pending_job("user-1");
        store.create_job(&done).unwrap();
        store.mark_ready(&done.id).unwrap();
        store.mark_saved(&done.id, "page-1").unwrap();

        let theirs = pending_job("user-2");
        store.create_job(&theirs).unwrap();
        store.set_status(&theirs.id, JobStatus::Summarizing).unwrap();

        let reset = store.reset_stuck_jobs("user-1").unwrap();
        assert_eq!(reset, 1);

        assert_eq!(
            store.get_job(&mine.id).unwrap().unwrap().status,
            JobStatus::Failed
        );
        // Saved jobs and other owners' jobs are untouched.
        assert_eq!(
            store.get_job(&done.id).unwrap().unwrap().status,
            JobStatus::Saved
        );
        assert_eq!(
            store.get_job(&theirs.id).unwrap().unwrap().status,
            JobStatus::Summarizing
        );
    }
}
