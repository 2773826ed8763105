//! Sharded, resumable drive over the whole source population.
//!
//! Each shard walks its slice of the keyspace page by page and checkpoints
//! the last id it finished after every page. A crashed or cancelled run is
//! picked up with [`ShardCoordinator::resume`]; blobs on the interrupted
//! page are simply offered to the migrator again, which skips the ones it
//! already copied.

use std::future::Future;

use blobmigrator_common::{
    BlobDescriptor, BlobRef, MigrateError, MigrationCounters, MigrationOutcome, Partition, Result,
};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::jobs::{backoff, is_retryable, JobKind, JobQueue, JobState};
use crate::migrator::Migrator;

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub job_id: String,
    pub counters: MigrationCounters,
}

#[derive(Clone)]
pub struct ShardCoordinator {
    migrator: Migrator,
    jobs: JobQueue,
}

impl ShardCoordinator {
    pub fn new(migrator: Migrator, jobs: JobQueue) -> Self {
        Self { migrator, jobs }
    }

    /// Start a new migration of every source blob into `bucket`.
    pub async fn run(&self, bucket: &str) -> Result<RunReport> {
        self.migrator.destination().validate_container_name(bucket)?;
        let shard_count = self.migrator.config().shard_count;
        let params = serde_json::json!({ "bucket": bucket, "shard_count": shard_count });
        let job_id = self.jobs.create(JobKind::MigrateAll, &params)?;
        info!(job_id = %job_id, bucket = %bucket, shard_count, "Starting migration");
        self.execute(&job_id, bucket, shard_count).await
    }

    /// Continue an interrupted migration from its shard checkpoints.
    pub async fn resume(&self, job_id: &str) -> Result<RunReport> {
        let status = self
            .jobs
            .status(job_id)?
            .ok_or_else(|| MigrateError::NotFound(format!("job {}", job_id)))?;
        if status.kind != JobKind::MigrateAll.as_str() {
            return Err(MigrateError::Validation(format!(
                "job {} is a {} job, not a migration",
                job_id, status.kind
            )));
        }
        if status.state == JobState::Completed {
            let counters = serde_json::from_value(status.counters).unwrap_or_default();
            return Ok(RunReport { job_id: job_id.to_string(), counters });
        }

        let bucket = status
            .params
            .get("bucket")
            .and_then(|b| b.as_str())
            .ok_or_else(|| MigrateError::Validation(format!("job {} has no bucket", job_id)))?
            .to_string();
        // Keep the original split; checkpoints are per shard index.
        let shard_count = status
            .params
            .get("shard_count")
            .and_then(|n| n.as_u64())
            .map(|n| n as u32)
            .unwrap_or(self.migrator.config().shard_count);

        info!(job_id = %job_id, bucket = %bucket, "Resuming migration");
        self.execute(job_id, &bucket, shard_count).await
    }

    async fn execute(&self, job_id: &str, bucket: &str, shard_count: u32) -> Result<RunReport> {
        self.jobs.start_attempt(job_id)?;

        let results = for_each_shard(shard_count, |partition| {
            let this = self.clone();
            let job_id = job_id.to_string();
            let bucket = bucket.to_string();
            async move { this.migrate_shard(&job_id, partition, &bucket).await }
        })
        .await;

        let mut counters = MigrationCounters::default();
        let mut first_error = None;
        for (shard, result) in results {
            match result {
                Ok(c) => counters.merge(&c),
                Err(e) => {
                    error!(job_id = %job_id, shard, error = %e, "Shard failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        self.jobs.set_counters(job_id, &counters)?;

        if let Some(e) = first_error {
            self.jobs.fail(job_id, &e.to_string())?;
            return Err(e);
        }
        self.jobs.complete(job_id)?;
        info!(
            job_id = %job_id,
            considered = counters.considered,
            migrated_inline = counters.migrated_inline,
            migrated_deferred = counters.migrated_deferred,
            skipped_already_migrated = counters.skipped_already_migrated,
            failed = counters.failed,
            "Migration finished"
        );
        Ok(RunReport { job_id: job_id.to_string(), counters })
    }

    async fn migrate_shard(&self, job_id: &str, partition: Partition, bucket: &str) -> Result<MigrationCounters> {
        let shard = partition.index;
        let mut checkpoint = self.jobs.load_shard(job_id, shard)?;
        if checkpoint.done {
            return Ok(checkpoint.counters);
        }
        info!(job_id = %job_id, shard, after = ?checkpoint.last_id, "Shard started");

        let page_size = self.migrator.config().page_size;
        loop {
            let page = self
                .migrator
                .source()
                .list_partition(partition, checkpoint.last_id.as_deref(), page_size)
                .await
                .map_err(|e| MigrateError::transfer(format!("shard {}", shard), e))?;

            for descriptor in &page.items {
                match self.migrate_with_retry(descriptor, bucket).await {
                    Ok(outcome) => checkpoint.counters.record(outcome),
                    Err(e) if e.is_skippable() => {
                        warn!(blob_id = %descriptor.id, shard, "Blob vanished, skipping");
                        checkpoint.counters.record_not_found();
                    }
                    Err(e) if is_retryable(&e) => {
                        error!(blob_id = %descriptor.id, shard, error = %e, "Blob failed");
                        checkpoint.counters.record_failure();
                    }
                    Err(e) => return Err(e),
                }
            }

            match page.next_after {
                Some(after) => checkpoint.last_id = Some(after),
                None => checkpoint.done = true,
            }
            self.jobs.save_shard(job_id, shard, &checkpoint)?;
            if checkpoint.done {
                break;
            }
        }

        info!(job_id = %job_id, shard, considered = checkpoint.counters.considered, "Shard finished");
        Ok(checkpoint.counters)
    }

    /// Re-invoke `migrate_one` on transient failures; safe because a blob
    /// that made it into the mapping store is skipped on the next call.
    async fn migrate_with_retry(&self, descriptor: &BlobDescriptor, bucket: &str) -> Result<MigrationOutcome> {
        let max_attempts = self.migrator.config().max_attempts.max(1);
        let blob = BlobRef::Descriptor(descriptor.clone());
        let mut attempt = 1;
        loop {
            match self.migrator.migrate_one(&blob, bucket).await {
                Err(e) if is_retryable(&e) && attempt < max_attempts => {
                    warn!(blob_id = %descriptor.id, attempt, error = %e, "Retrying blob");
                    backoff(attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Run one task per partition concurrently and collect `(shard, result)`
/// pairs in shard order.
pub(crate) async fn for_each_shard<T, F, Fut>(shard_count: u32, run: F) -> Vec<(u32, Result<T>)>
where
    T: Send + 'static,
    F: Fn(Partition) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for partition in Partition::all(shard_count) {
        let task = run(partition);
        set.spawn(async move { (partition.index, task.await) });
    }

    let mut results = Vec::with_capacity(shard_count as usize);
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => results.push((u32::MAX, Err(MigrateError::Store(format!("shard task failed: {e}"))))),
        }
    }
    results.sort_by_key(|(shard, _)| *shard);
    results
}
