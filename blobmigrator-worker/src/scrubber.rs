//! Post-migration cleanup.
//!
//! Every operation here deletes data permanently and refuses to run unless
//! the caller passes `confirmed = true`. None of them is ever triggered by
//! the migration path.

use std::sync::Arc;

use blobmigrator_common::store::SourceStore;
use blobmigrator_common::{MigrateError, Partition, Result};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::coordinator::for_each_shard;
use crate::jobs::{JobKind, JobQueue};
use crate::mapping::MappingStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScrubReport {
    pub job_id: String,
    pub deleted: u64,
}

#[derive(Clone)]
pub struct Scrubber {
    source: Arc<dyn SourceStore>,
    mappings: MappingStore,
    jobs: JobQueue,
    shard_count: u32,
    page_size: usize,
}

impl Scrubber {
    pub fn new(
        source: Arc<dyn SourceStore>,
        mappings: MappingStore,
        jobs: JobQueue,
        shard_count: u32,
        page_size: usize,
    ) -> Self {
        Self {
            source,
            mappings,
            jobs,
            shard_count: shard_count.max(1),
            page_size: page_size.max(1),
        }
    }

    /// Delete every mapping entry.
    ///
    /// Irreversible. Mapping entries are the only record of what has been
    /// migrated; once they are gone a later migration run copies every blob
    /// again. Do not run this while another migration round may be needed.
    pub async fn scrub_mappings(&self, confirmed: bool) -> Result<ScrubReport> {
        self.run(JobKind::ScrubMappings, confirmed, |this, partition, job_id| async move {
            this.scrub_mapping_shard(&job_id, partition).await
        })
        .await
    }

    /// Delete the source blobs that have a mapping entry.
    ///
    /// Irreversible. Only blobs recorded as migrated are touched; the
    /// mapping entries themselves are kept.
    pub async fn scrub_mapped_source_blobs(&self, confirmed: bool) -> Result<ScrubReport> {
        self.run(JobKind::ScrubMappedBlobs, confirmed, |this, partition, job_id| async move {
            this.scrub_mapped_blob_shard(&job_id, partition).await
        })
        .await
    }

    /// Delete EVERY source blob, migrated or not.
    ///
    /// Irreversible and strictly more destructive than
    /// [`Scrubber::scrub_mapped_source_blobs`]: blobs that were never copied
    /// are lost for good.
    pub async fn scrub_all_source_blobs(&self, confirmed: bool) -> Result<ScrubReport> {
        self.run(JobKind::ScrubAllBlobs, confirmed, |this, partition, job_id| async move {
            this.scrub_all_blob_shard(&job_id, partition).await
        })
        .await
    }

    async fn run<F, Fut>(&self, kind: JobKind, confirmed: bool, shard: F) -> Result<ScrubReport>
    where
        F: Fn(Scrubber, Partition, String) -> Fut,
        Fut: std::future::Future<Output = Result<u64>> + Send + 'static,
    {
        if !confirmed {
            warn!(kind = kind.as_str(), "Scrub not confirmed, nothing deleted");
            return Err(MigrateError::Validation("not confirmed".into()));
        }

        let params = serde_json::json!({ "shard_count": self.shard_count });
        let job_id = self.jobs.create(kind, &params)?;
        self.jobs.start_attempt(&job_id)?;
        info!(job_id = %job_id, kind = kind.as_str(), shard_count = self.shard_count, "Starting scrub");

        let results = for_each_shard(self.shard_count, |partition| {
            shard(self.clone(), partition, job_id.clone())
        })
        .await;

        let mut deleted = 0;
        let mut first_error = None;
        for (shard, result) in results {
            match result {
                Ok(n) => deleted += n,
                Err(e) => {
                    error!(job_id = %job_id, shard, error = %e, "Scrub shard failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        self.jobs.set_counters(&job_id, &serde_json::json!({ "deleted": deleted }))?;

        if let Some(e) = first_error {
            self.jobs.fail(&job_id, &e.to_string())?;
            return Err(e);
        }
        self.jobs.complete(&job_id)?;
        info!(job_id = %job_id, kind = kind.as_str(), deleted, "Scrub finished");
        Ok(ScrubReport { job_id, deleted })
    }

    async fn scrub_mapping_shard(&self, job_id: &str, partition: Partition) -> Result<u64> {
        let mut checkpoint = self.jobs.load_shard(job_id, partition.index)?;
        while !checkpoint.done {
            let (entries, next) =
                self.mappings
                    .page_partition(partition, checkpoint.last_id.as_deref(), self.page_size)?;
            for entry in entries {
                if self.mappings.delete(&entry.old_id)? {
                    checkpoint.deleted += 1;
                }
            }
            advance(&mut checkpoint, next);
            self.jobs.save_shard(job_id, partition.index, &checkpoint)?;
        }
        Ok(checkpoint.deleted)
    }

    async fn scrub_mapped_blob_shard(&self, job_id: &str, partition: Partition) -> Result<u64> {
        let mut checkpoint = self.jobs.load_shard(job_id, partition.index)?;
        while !checkpoint.done {
            let (entries, next) =
                self.mappings
                    .page_partition(partition, checkpoint.last_id.as_deref(), self.page_size)?;
            for entry in entries {
                if self.delete_source(&entry.old_id).await? {
                    checkpoint.deleted += 1;
                }
            }
            advance(&mut checkpoint, next);
            self.jobs.save_shard(job_id, partition.index, &checkpoint)?;
        }
        Ok(checkpoint.deleted)
    }

    async fn scrub_all_blob_shard(&self, job_id: &str, partition: Partition) -> Result<u64> {
        let mut checkpoint = self.jobs.load_shard(job_id, partition.index)?;
        while !checkpoint.done {
            let page = self
                .source
                .list_partition(partition, checkpoint.last_id.as_deref(), self.page_size)
                .await
                .map_err(|e| MigrateError::transfer(format!("shard {}", partition.index), e))?;
            for descriptor in page.items {
                if self.delete_source(&descriptor.id).await? {
                    checkpoint.deleted += 1;
                }
            }
            advance(&mut checkpoint, page.next_after);
            self.jobs.save_shard(job_id, partition.index, &checkpoint)?;
        }
        Ok(checkpoint.deleted)
    }

    async fn delete_source(&self, id: &str) -> Result<bool> {
        let deleted = self
            .source
            .delete(id)
            .await
            .map_err(|e| MigrateError::transfer(id, e))?;
        if deleted {
            debug!(blob_id = %id, "Deleted source blob");
        }
        Ok(deleted)
    }
}

fn advance(checkpoint: &mut crate::jobs::ShardCheckpoint, next: Option<String>) {
    match next {
        Some(after) => checkpoint.last_id = Some(after),
        None => checkpoint.done = true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::jobs::JobState;
    use crate::testing::MemorySource;
    use blobmigrator_common::store::encoded_native_id;

    struct Harness {
        source: Arc<MemorySource>,
        mappings: MappingStore,
        queue: JobQueue,
        scrubber: Scrubber,
    }

    fn harness() -> Harness {
        let db = Db::open_in_memory().unwrap();
        let mappings = MappingStore::open(db.clone(), "_blobmigrator_BlobKeyMapping").unwrap();
        let queue = JobQueue::open(db, 3).unwrap();
        let source = Arc::new(MemorySource::default());
        let scrubber = Scrubber::new(source.clone(), mappings.clone(), queue.clone(), 4, 3);
        Harness { source, mappings, queue, scrubber }
    }

    /// Ten source blobs, the first six of them mapped.
    fn populate(h: &Harness) {
        for i in 0..10 {
            let id = format!("blob-{:02}", i);
            h.source.insert(&id, b"data", None, None);
            if i < 6 {
                h.mappings.put(&id, &format!("/b/{}", id), encoded_native_id).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_unconfirmed_scrubs_delete_nothing() {
        let h = harness();
        populate(&h);

        for result in [
            h.scrubber.scrub_mappings(false).await,
            h.scrubber.scrub_mapped_source_blobs(false).await,
            h.scrubber.scrub_all_source_blobs(false).await,
        ] {
            match result {
                Err(MigrateError::Validation(msg)) => assert_eq!(msg, "not confirmed"),
                other => panic!("expected rejection, got {:?}", other),
            }
        }
        assert_eq!(h.mappings.count().unwrap(), 6);
        assert_eq!(h.source.len(), 10);
    }

    #[tokio::test]
    async fn test_scrub_mappings() {
        let h = harness();
        populate(&h);

        let report = h.scrubber.scrub_mappings(true).await.unwrap();
        assert_eq!(report.deleted, 6);
        assert_eq!(h.mappings.count().unwrap(), 0);
        assert_eq!(h.source.len(), 10);

        let status = h.queue.status(&report.job_id).unwrap().unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.kind, "scrub_mappings");
        assert_eq!(status.counters["deleted"], 6);
    }

    #[tokio::test]
    async fn test_scrub_mapped_blobs_keeps_unmapped_and_mappings() {
        let h = harness();
        populate(&h);

        let report = h.scrubber.scrub_mapped_source_blobs(true).await.unwrap();
        assert_eq!(report.deleted, 6);
        assert_eq!(h.source.len(), 4);
        assert_eq!(h.mappings.count().unwrap(), 6);
        let remaining: Vec<String> = h.source.blobs.lock().unwrap().keys().cloned().collect();
        assert_eq!(remaining, vec!["blob-06", "blob-07", "blob-08", "blob-09"]);

        // Second pass finds nothing left to delete.
        let again = h.scrubber.scrub_mapped_source_blobs(true).await.unwrap();
        assert_eq!(again.deleted, 0);
        assert_ne!(again.job_id, report.job_id);
    }

    #[tokio::test]
    async fn test_scrub_all_blobs() {
        let h = harness();
        populate(&h);

        let report = h.scrubber.scrub_all_source_blobs(true).await.unwrap();
        assert_eq!(report.deleted, 10);
        assert_eq!(h.source.len(), 0);
        assert_eq!(h.mappings.count().unwrap(), 6);
    }
}
