//! Local job substrate.
//!
//! The engines only need two things from a job system: a way to hand off a
//! deferred per-blob copy, and somewhere to checkpoint cursors. This module
//! provides both on top of the worker's SQLite state database, with
//! at-least-once execution of queued copies and per-job status + counters.

use std::time::Duration;

use async_trait::async_trait;
use blobmigrator_common::{BlobRef, MigrateError, MigrationCounters, Result, ShardCursor};
use chrono::Utc;
use rand::Rng;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{store_err, Db};
use crate::migrator::Migrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    MigrateAll,
    CopyBlob,
    ScrubMappings,
    ScrubMappedBlobs,
    ScrubAllBlobs,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::MigrateAll => "migrate_all",
            JobKind::CopyBlob => "copy_blob",
            JobKind::ScrubMappings => "scrub_mappings",
            JobKind::ScrubMappedBlobs => "scrub_mapped_blobs",
            JobKind::ScrubAllBlobs => "scrub_all_blobs",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobState {
    fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(MigrateError::Store(format!("unknown job state {:?}", other))),
        }
    }
}

/// Aggregate status of one job, as reported to operators.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub kind: String,
    pub state: JobState,
    pub attempts: u32,
    pub params: serde_json::Value,
    pub counters: serde_json::Value,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A deferred copy of one large blob.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyBlobJob {
    pub blob: BlobRef,
    pub bucket: String,
}

impl CopyBlobJob {
    pub fn to_params(&self) -> serde_json::Value {
        let blob = match &self.blob {
            BlobRef::Raw(id) => serde_json::Value::String(id.clone()),
            BlobRef::Descriptor(d) => serde_json::to_value(d).unwrap_or(serde_json::Value::Null),
        };
        serde_json::json!({ "blob": blob, "bucket": self.bucket })
    }

    pub fn from_params(params: &serde_json::Value) -> Result<Self> {
        let blob = params
            .get("blob")
            .ok_or_else(|| MigrateError::Validation("copy job has no blob".into()))?;
        let bucket = params
            .get("bucket")
            .and_then(|v| v.as_str())
            .ok_or_else(|| MigrateError::Validation("copy job has no bucket".into()))?;
        Ok(Self {
            blob: BlobRef::from_value(blob)?,
            bucket: bucket.to_string(),
        })
    }
}

/// Hand-off point for copies too large to run inline.
#[async_trait]
pub trait JobSubstrate: Send + Sync {
    /// Schedule a copy; returns the job id.
    async fn schedule(&self, job: &CopyBlobJob) -> Result<String>;
}

/// Where a running copy persists its read cursor.
pub trait CursorCheckpoint: Send + Sync {
    fn load(&self) -> Result<Option<ShardCursor>>;
    fn save(&self, cursor: &ShardCursor) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Checkpoint for inline copies, which are never resumed.
pub struct NoCheckpoint;

impl CursorCheckpoint for NoCheckpoint {
    fn load(&self) -> Result<Option<ShardCursor>> {
        Ok(None)
    }

    fn save(&self, _cursor: &ShardCursor) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        Ok(())
    }
}

/// Enumeration progress of one shard of a sharded job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCheckpoint {
    pub last_id: Option<String>,
    pub done: bool,
    #[serde(default)]
    pub counters: MigrationCounters,
    /// Records removed so far, for scrubbing jobs.
    #[serde(default)]
    pub deleted: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct JobQueue {
    db: Db,
    max_attempts: u32,
}

impl JobQueue {
    pub fn open(db: Db, max_attempts: u32) -> Result<Self> {
        {
            let conn = db.lock()?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS jobs (
                    job_id      TEXT PRIMARY KEY,
                    kind        TEXT NOT NULL,
                    params      TEXT NOT NULL,
                    state       TEXT NOT NULL,
                    attempts    INTEGER NOT NULL DEFAULT 0,
                    counters    TEXT,
                    error       TEXT,
                    created_at  TEXT NOT NULL,
                    updated_at  TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_queue ON jobs (kind, state, created_at);

                CREATE TABLE IF NOT EXISTS shard_checkpoints (
                    job_id      TEXT NOT NULL,
                    shard       INTEGER NOT NULL,
                    checkpoint  TEXT NOT NULL,
                    PRIMARY KEY (job_id, shard)
                );

                CREATE TABLE IF NOT EXISTS copy_cursors (
                    job_id      TEXT PRIMARY KEY,
                    cursor      TEXT NOT NULL
                );",
            )
            .map_err(store_err)?;
        }
        Ok(Self { db, max_attempts: max_attempts.max(1) })
    }

    /// Insert a job in the `queued` state.
    pub fn create(&self, kind: JobKind, params: &serde_json::Value) -> Result<String> {
        let job_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO jobs (job_id, kind, params, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![job_id, kind.as_str(), params.to_string(), JobState::Queued.as_str(), now],
        )
        .map_err(store_err)?;
        Ok(job_id)
    }

    /// Move a job to `running` and count the attempt. Returns the attempt number.
    pub fn start_attempt(&self, job_id: &str) -> Result<u32> {
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE jobs SET state = ?2, attempts = attempts + 1, updated_at = ?3 WHERE job_id = ?1",
            params![job_id, JobState::Running.as_str(), Utc::now().to_rfc3339()],
        )
        .map_err(store_err)?;
        let attempts: i64 = conn
            .query_row("SELECT attempts FROM jobs WHERE job_id = ?1", params![job_id], |row| row.get(0))
            .map_err(store_err)?;
        Ok(attempts as u32)
    }

    fn set_state(&self, job_id: &str, state: JobState, error: Option<&str>) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE jobs SET state = ?2, error = ?3, updated_at = ?4 WHERE job_id = ?1",
            params![job_id, state.as_str(), error, Utc::now().to_rfc3339()],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn complete(&self, job_id: &str) -> Result<()> {
        self.set_state(job_id, JobState::Completed, None)
    }

    pub fn requeue(&self, job_id: &str, error: &str) -> Result<()> {
        self.set_state(job_id, JobState::Queued, Some(error))
    }

    pub fn fail(&self, job_id: &str, error: &str) -> Result<()> {
        self.set_state(job_id, JobState::Failed, Some(error))
    }

    pub fn set_counters<T: Serialize>(&self, job_id: &str, counters: &T) -> Result<()> {
        let json = serde_json::to_string(counters).map_err(|e| MigrateError::Store(e.to_string()))?;
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE jobs SET counters = ?2, updated_at = ?3 WHERE job_id = ?1",
            params![job_id, json, Utc::now().to_rfc3339()],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let conn = self.db.lock()?;
        let row = conn
            .query_row(
                "SELECT job_id, kind, state, attempts, params, counters, error, created_at, updated_at
                 FROM jobs WHERE job_id = ?1",
                params![job_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()
            .map_err(store_err)?;

        let Some((job_id, kind, state, attempts, params, counters, error, created_at, updated_at)) = row else {
            return Ok(None);
        };
        Ok(Some(JobStatus {
            job_id,
            kind,
            state: JobState::parse(&state)?,
            attempts: attempts as u32,
            params: serde_json::from_str(&params).unwrap_or(serde_json::Value::Null),
            counters: counters
                .and_then(|c| serde_json::from_str(&c).ok())
                .unwrap_or_else(|| serde_json::json!({})),
            error,
            created_at,
            updated_at,
        }))
    }

    /// Oldest queued job of `kind`, with its parameters.
    pub fn next_queued(&self, kind: JobKind) -> Result<Option<(String, serde_json::Value)>> {
        let conn = self.db.lock()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT job_id, params FROM jobs WHERE kind = ?1 AND state = ?2
                 ORDER BY created_at, rowid LIMIT 1",
                params![kind.as_str(), JobState::Queued.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(store_err)?;
        row.map(|(id, params)| {
            serde_json::from_str(&params)
                .map(|p| (id, p))
                .map_err(|e| MigrateError::Store(format!("bad job params: {e}")))
        })
        .transpose()
    }

    pub fn load_shard(&self, job_id: &str, shard: u32) -> Result<ShardCheckpoint> {
        let conn = self.db.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT checkpoint FROM shard_checkpoints WHERE job_id = ?1 AND shard = ?2",
                params![job_id, shard],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        match json {
            Some(j) => serde_json::from_str(&j).map_err(|e| MigrateError::Store(format!("bad checkpoint: {e}"))),
            None => Ok(ShardCheckpoint::default()),
        }
    }

    pub fn save_shard(&self, job_id: &str, shard: u32, checkpoint: &ShardCheckpoint) -> Result<()> {
        let json = serde_json::to_string(checkpoint).map_err(|e| MigrateError::Store(e.to_string()))?;
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO shard_checkpoints (job_id, shard, checkpoint) VALUES (?1, ?2, ?3)",
            params![job_id, shard, json],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn cursor(&self, job_id: &str) -> JobCursor {
        JobCursor { db: self.db.clone(), job_id: job_id.to_string() }
    }

    /// Put jobs of `kind` that a killed or interrupted worker left in the
    /// `running` state back on the queue. Jobs whose attempt budget is
    /// already spent are failed instead. Returns `(requeued, failed)`.
    ///
    /// Only valid while no other worker is draining the same database.
    pub fn recover_interrupted(&self, kind: JobKind) -> Result<(u64, u64)> {
        let now = Utc::now().to_rfc3339();
        let conn = self.db.lock()?;
        let requeued = conn
            .execute(
                "UPDATE jobs SET state = ?2, error = 'interrupted', updated_at = ?3
                 WHERE kind = ?1 AND state = ?4 AND attempts < ?5",
                params![
                    kind.as_str(),
                    JobState::Queued.as_str(),
                    now,
                    JobState::Running.as_str(),
                    self.max_attempts
                ],
            )
            .map_err(store_err)?;
        let failed = conn
            .execute(
                "UPDATE jobs SET state = ?2, error = 'interrupted', updated_at = ?3
                 WHERE kind = ?1 AND state = ?4",
                params![kind.as_str(), JobState::Failed.as_str(), now, JobState::Running.as_str()],
            )
            .map_err(store_err)?;
        Ok((requeued as u64, failed as u64))
    }

    /// Run queued copy jobs until none are left.
    ///
    /// Copies interrupted by an earlier crash are picked up first and
    /// continue from their saved cursor. A failed attempt is re-queued until
    /// the attempt budget is spent; re-running a copy is safe because the
    /// migrator re-checks the mapping store first.
    pub async fn drain(&self, migrator: &Migrator) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let (requeued, abandoned) = self.recover_interrupted(JobKind::CopyBlob)?;
        if requeued > 0 || abandoned > 0 {
            warn!(requeued, abandoned, "Recovered interrupted copy jobs");
        }
        report.failed += abandoned;
        while let Some((job_id, params)) = self.next_queued(JobKind::CopyBlob)? {
            let attempt = self.start_attempt(&job_id)?;
            let result = match CopyBlobJob::from_params(&params) {
                Ok(job) => migrator.run_copy_job(&job, &self.cursor(&job_id)).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(entry) => {
                    let counters = serde_json::json!({
                        "copied": u64::from(entry.is_some()),
                        "skipped": u64::from(entry.is_none()),
                    });
                    self.set_counters(&job_id, &counters)?;
                    self.complete(&job_id)?;
                    report.completed += 1;
                }
                Err(e) if is_retryable(&e) && attempt < self.max_attempts => {
                    warn!(job_id = %job_id, attempt, error = %e, "Copy job failed, re-queueing");
                    self.requeue(&job_id, &e.to_string())?;
                    backoff(attempt).await;
                }
                Err(e) => {
                    error!(job_id = %job_id, attempt, error = %e, "Copy job failed");
                    self.fail(&job_id, &e.to_string())?;
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl JobSubstrate for JobQueue {
    async fn schedule(&self, job: &CopyBlobJob) -> Result<String> {
        let job_id = self.create(JobKind::CopyBlob, &job.to_params())?;
        info!(job_id = %job_id, blob_id = %job.blob.id(), "Scheduled deferred copy");
        Ok(job_id)
    }
}

pub struct JobCursor {
    db: Db,
    job_id: String,
}

impl CursorCheckpoint for JobCursor {
    fn load(&self) -> Result<Option<ShardCursor>> {
        let conn = self.db.lock()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT cursor FROM copy_cursors WHERE job_id = ?1",
                params![self.job_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        json.map(|j| ShardCursor::from_json(&j)).transpose()
    }

    fn save(&self, cursor: &ShardCursor) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO copy_cursors (job_id, cursor) VALUES (?1, ?2)",
            params![self.job_id, cursor.to_json()],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = self.db.lock()?;
        conn.execute("DELETE FROM copy_cursors WHERE job_id = ?1", params![self.job_id])
            .map_err(store_err)?;
        Ok(())
    }
}

/// Failures worth another attempt. Contract violations never are.
pub fn is_retryable(e: &MigrateError) -> bool {
    matches!(
        e,
        MigrateError::Transfer { .. } | MigrateError::Store(_) | MigrateError::Io(_)
    )
}

/// Exponential backoff with jitter: 200ms, 400ms, ... capped at 5s.
pub(crate) async fn backoff(attempt: u32) {
    let base = 200u64.saturating_mul(1 << attempt.saturating_sub(1).min(5)).min(5000);
    let jitter = rand::thread_rng().gen_range(0..100);
    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobmigrator_common::BlobDescriptor;

    fn queue() -> JobQueue {
        JobQueue::open(Db::open_in_memory().unwrap(), 3).unwrap()
    }

    #[test]
    fn test_copy_job_params_roundtrip_shapes() {
        let d = BlobDescriptor {
            id: "abc".into(),
            size: 10,
            content_type: Some("text/plain".into()),
            filename: None,
        };
        let job = CopyBlobJob { blob: BlobRef::Descriptor(d), bucket: "my-bucket".into() };
        assert_eq!(CopyBlobJob::from_params(&job.to_params()).unwrap(), job);

        let raw = CopyBlobJob { blob: BlobRef::Raw("abc".into()), bucket: "my-bucket".into() };
        assert_eq!(CopyBlobJob::from_params(&raw.to_params()).unwrap(), raw);
    }

    #[test]
    fn test_copy_job_rejects_bad_blob_shape() {
        let params = serde_json::json!({ "blob": 123, "bucket": "my-bucket" });
        assert!(matches!(CopyBlobJob::from_params(&params), Err(MigrateError::TypeMismatch(_))));
        let params = serde_json::json!({ "bucket": "my-bucket" });
        assert!(matches!(CopyBlobJob::from_params(&params), Err(MigrateError::Validation(_))));
    }

    #[test]
    fn test_job_lifecycle() {
        let q = queue();
        let id = q.create(JobKind::MigrateAll, &serde_json::json!({"bucket": "b"})).unwrap();
        let status = q.status(&id).unwrap().unwrap();
        assert_eq!(status.state, JobState::Queued);
        assert_eq!(status.kind, "migrate_all");
        assert_eq!(status.params["bucket"], "b");

        assert_eq!(q.start_attempt(&id).unwrap(), 1);
        let mut counters = MigrationCounters::default();
        counters.considered = 3;
        q.set_counters(&id, &counters).unwrap();
        q.complete(&id).unwrap();

        let status = q.status(&id).unwrap().unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.attempts, 1);
        assert_eq!(status.counters["considered"], 3);
        assert!(q.status("nope").unwrap().is_none());
    }

    #[test]
    fn test_next_queued_is_fifo_per_kind() {
        let q = queue();
        let a = q.create(JobKind::CopyBlob, &serde_json::json!({"n": 1})).unwrap();
        let _other = q.create(JobKind::ScrubMappings, &serde_json::json!({})).unwrap();
        let b = q.create(JobKind::CopyBlob, &serde_json::json!({"n": 2})).unwrap();

        let (first, params) = q.next_queued(JobKind::CopyBlob).unwrap().unwrap();
        assert!(first == a || first == b);
        assert!(params.get("n").is_some());
        q.start_attempt(&first).unwrap();
        let (second, _) = q.next_queued(JobKind::CopyBlob).unwrap().unwrap();
        assert_ne!(first, second);
        q.start_attempt(&second).unwrap();
        assert!(q.next_queued(JobKind::CopyBlob).unwrap().is_none());
    }

    #[test]
    fn test_shard_checkpoints() {
        let q = queue();
        assert_eq!(q.load_shard("job", 3).unwrap(), ShardCheckpoint::default());
        let cp = ShardCheckpoint {
            last_id: Some("abc".into()),
            done: false,
            counters: MigrationCounters { considered: 1, ..Default::default() },
            deleted: 0,
        };
        q.save_shard("job", 3, &cp).unwrap();
        assert_eq!(q.load_shard("job", 3).unwrap(), cp);
        assert_eq!(q.load_shard("job", 4).unwrap(), ShardCheckpoint::default());
    }

    #[test]
    fn test_job_cursor_persistence() {
        let q = queue();
        let cursor = q.cursor("job-1");
        assert!(cursor.load().unwrap().is_none());
        let c = ShardCursor { source_id: "abc".into(), current_offset: 5, end_offset: 9 };
        cursor.save(&c).unwrap();
        assert_eq!(q.cursor("job-1").load().unwrap(), Some(c));
        cursor.clear().unwrap();
        assert!(cursor.load().unwrap().is_none());
    }

    #[test]
    fn test_recover_interrupted_jobs() {
        let q = queue();
        let fresh = q.create(JobKind::CopyBlob, &serde_json::json!({"n": 1})).unwrap();
        let spent = q.create(JobKind::CopyBlob, &serde_json::json!({"n": 2})).unwrap();
        let scrub = q.create(JobKind::ScrubMappings, &serde_json::json!({})).unwrap();
        q.start_attempt(&fresh).unwrap();
        q.start_attempt(&scrub).unwrap();
        for _ in 0..3 {
            q.start_attempt(&spent).unwrap();
        }

        assert_eq!(q.recover_interrupted(JobKind::CopyBlob).unwrap(), (1, 1));

        let status = q.status(&fresh).unwrap().unwrap();
        assert_eq!(status.state, JobState::Queued);
        assert_eq!(status.error.as_deref(), Some("interrupted"));
        assert_eq!(q.status(&spent).unwrap().unwrap().state, JobState::Failed);
        // Other kinds are left alone.
        assert_eq!(q.status(&scrub).unwrap().unwrap().state, JobState::Running);
        assert_eq!(q.recover_interrupted(JobKind::CopyBlob).unwrap(), (0, 0));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable(&MigrateError::transfer("a", anyhow::anyhow!("x"))));
        assert!(is_retryable(&MigrateError::Store("busy".into())));
        assert!(!is_retryable(&MigrateError::Validation("x".into())));
        assert!(!is_retryable(&MigrateError::TypeMismatch("x".into())));
        assert!(!is_retryable(&MigrateError::Configuration("x".into())));
    }
}
