//! Per-blob migration: routing, transfer and the mapping write.

use std::sync::Arc;

use blobmigrator_common::naming::{build_destination_path, content_disposition, normalize_root};
use blobmigrator_common::store::{write_all, DestinationStore, SourceStore, WriteOptions, SIMULATED_ARTIFACT_PREFIX};
use blobmigrator_common::{
    BlobDescriptor, BlobRef, MappingEntry, MigrateError, MigrationOutcome, Result, ShardCursor,
};
use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MigratorConfig;
use crate::jobs::{CopyBlobJob, CursorCheckpoint, JobSubstrate, NoCheckpoint};
use crate::mapping::MappingStore;
use crate::reader::ChunkReader;

#[derive(Clone)]
pub struct Migrator {
    config: Arc<MigratorConfig>,
    source: Arc<dyn SourceStore>,
    destination: Arc<dyn DestinationStore>,
    mappings: MappingStore,
    jobs: Arc<dyn JobSubstrate>,
}

impl Migrator {
    pub fn new(
        config: Arc<MigratorConfig>,
        source: Arc<dyn SourceStore>,
        destination: Arc<dyn DestinationStore>,
        mappings: MappingStore,
        jobs: Arc<dyn JobSubstrate>,
    ) -> Self {
        Self { config, source, destination, mappings, jobs }
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    pub fn source(&self) -> &Arc<dyn SourceStore> {
        &self.source
    }

    pub fn destination(&self) -> &Arc<dyn DestinationStore> {
        &self.destination
    }

    pub fn mappings(&self) -> &MappingStore {
        &self.mappings
    }

    /// Absolute destination path (`/<bucket>/<root>/...`) for a blob.
    pub fn destination_path_for(&self, descriptor: &BlobDescriptor, bucket: &str) -> Result<String> {
        if !bucket.is_empty() {
            self.destination.validate_container_name(bucket)?;
        }
        build_destination_path(
            &descriptor.id,
            descriptor.filename.as_deref(),
            Some(self.config.destination_root_folder.as_str()),
            Some(bucket),
            true,
            true,
        )
    }

    /// Migrate one blob into `bucket`.
    ///
    /// The mapping store is consulted exactly once, before any transfer work.
    /// Blobs at or below `inline_transfer_max_bytes` are copied here; larger
    /// ones are handed to the job substrate.
    pub async fn migrate_one(&self, blob: &BlobRef, bucket: &str) -> Result<MigrationOutcome> {
        let id = blob.id();
        if id.is_empty() {
            return Err(MigrateError::Validation("blob id is required".into()));
        }

        if self.config.simulation && id.starts_with(SIMULATED_ARTIFACT_PREFIX) {
            debug!(blob_id = %id, "Skipping simulated destination artifact");
            return Ok(MigrationOutcome::SkippedSimulatedArtifact);
        }

        if self.mappings.exists(id)? {
            debug!(blob_id = %id, "Already migrated");
            return Ok(MigrationOutcome::SkippedAlreadyMigrated);
        }

        let descriptor = match blob {
            BlobRef::Descriptor(d) => d.clone(),
            BlobRef::Raw(id) => self.describe(id).await?,
        };

        if descriptor.size <= self.config.inline_transfer_max_bytes {
            self.transfer(&descriptor, bucket, &NoCheckpoint).await?;
            Ok(MigrationOutcome::MigratedInline)
        } else {
            // Fail fast on a bad bucket instead of in the deferred job.
            self.destination_path_for(&descriptor, bucket)?;
            let size = descriptor.size;
            let job = CopyBlobJob {
                blob: BlobRef::Descriptor(descriptor),
                bucket: bucket.to_string(),
            };
            let job_id = self.jobs.schedule(&job).await?;
            info!(blob_id = %id, size, job_id = %job_id, "Deferred large blob");
            Ok(MigrationOutcome::MigratedViaDeferredJob)
        }
    }

    /// Body of a deferred copy job.
    ///
    /// Returns `None` when there was nothing to do: the blob was migrated by
    /// an earlier attempt, or it has vanished from the source.
    pub async fn run_copy_job(
        &self,
        job: &CopyBlobJob,
        checkpoint: &dyn CursorCheckpoint,
    ) -> Result<Option<MappingEntry>> {
        let id = job.blob.id();
        if self.mappings.exists(id)? {
            debug!(blob_id = %id, "Deferred copy already done");
            checkpoint.clear()?;
            return Ok(None);
        }

        let descriptor = match &job.blob {
            BlobRef::Descriptor(d) => d.clone(),
            BlobRef::Raw(id) => match self.describe(id).await {
                Ok(d) => d,
                Err(e) if e.is_skippable() => {
                    warn!(blob_id = %id, "Blob vanished before deferred copy");
                    checkpoint.clear()?;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            },
        };

        match self.transfer(&descriptor, &job.bucket, checkpoint).await {
            Ok(entry) => Ok(Some(entry)),
            Err(e) if e.is_skippable() => {
                warn!(blob_id = %id, "Blob vanished during deferred copy");
                checkpoint.clear()?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn describe(&self, id: &str) -> Result<BlobDescriptor> {
        self.source
            .get(id)
            .await
            .map_err(|e| MigrateError::transfer(id, e))?
            .ok_or_else(|| MigrateError::NotFound(id.to_string()))
    }

    /// Copy one blob and record its mapping. Shared by the inline and
    /// deferred paths so both enforce the same argument checks.
    async fn transfer(
        &self,
        descriptor: &BlobDescriptor,
        bucket: &str,
        checkpoint: &dyn CursorCheckpoint,
    ) -> Result<MappingEntry> {
        if descriptor.id.is_empty() {
            return Err(MigrateError::Validation("blob id is required".into()));
        }
        let path = self.destination_path_for(descriptor, bucket)?;
        let options = WriteOptions {
            content_type: descriptor.content_type.clone(),
            content_disposition: content_disposition(descriptor.filename.as_deref()),
            content_length: Some(descriptor.size),
        };
        let fail = |e: anyhow::Error| MigrateError::transfer(&descriptor.id, e);

        let resumed = match checkpoint.load()? {
            Some(cursor) if cursor.source_id == descriptor.id && cursor.current_offset > 0 => self
                .destination
                .resume(&path, &options, cursor.current_offset)
                .await
                .map_err(fail)?
                .map(|writer| (cursor, writer)),
            _ => None,
        };
        let (cursor, mut writer) = match resumed {
            Some((cursor, writer)) => {
                info!(blob_id = %descriptor.id, offset = cursor.current_offset, "Resuming copy");
                (cursor, writer)
            }
            None => (
                ShardCursor::for_blob(descriptor),
                self.destination.open(&path, &options).await.map_err(fail)?,
            ),
        };

        let mut reader = ChunkReader::new(self.source.clone(), cursor, self.config.buffer_size);
        while let Some((_, chunk)) = reader.next_chunk().await? {
            writer.write(chunk).await.map_err(fail)?;
            checkpoint.save(reader.cursor())?;
        }

        if writer.written() != descriptor.size {
            return Err(fail(anyhow::anyhow!(
                "copied {} bytes, expected {}",
                writer.written(),
                descriptor.size
            )));
        }
        writer.close().await.map_err(fail)?;

        let entry = self
            .mappings
            .put(&descriptor.id, &path, |p| self.destination.derive_native_id(p))?;
        checkpoint.clear()?;
        Ok(entry)
    }

    /// Write and remove a one-byte object under the bucket's root folder.
    pub async fn probe_writable(&self, bucket: &str) -> Result<()> {
        self.destination.validate_container_name(bucket)?;
        let root = normalize_root(Some(self.config.destination_root_folder.as_str()));
        let name = format!("test-to-see-if-writable-{}.txt", Uuid::new_v4());
        let path = if root.is_empty() {
            format!("/{}/{}", bucket, name)
        } else {
            format!("/{}/{}/{}", bucket, root, name)
        };
        let options = WriteOptions {
            content_type: Some("text/plain".into()),
            content_disposition: None,
            content_length: Some(1),
        };
        write_all(self.destination.as_ref(), &path, &options, Bytes::from_static(b"1"))
            .await
            .map_err(|e| MigrateError::transfer(&path, e))?;
        self.destination
            .delete(&path)
            .await
            .map_err(|e| MigrateError::transfer(&path, e))?;
        debug!(bucket = %bucket, "Destination is writable");
        Ok(())
    }
}
