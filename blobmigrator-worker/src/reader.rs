//! Chunked, resumable reader over a single source blob.
//!
//! Memory use is bounded by `buffer_size` no matter how large the blob is.
//! The cursor can be taken out between any two chunks, serialized, and fed
//! to a fresh reader that continues at exactly the same byte.

use std::sync::Arc;

use blobmigrator_common::store::{BlobReader, SourceStore};
use blobmigrator_common::{BlobDescriptor, MigrateError, Result, ShardCursor};
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tracing::debug;

pub struct ChunkReader {
    source: Arc<dyn SourceStore>,
    cursor: ShardCursor,
    buffer_size: usize,
    stream: Option<BlobReader>,
    finished: bool,
}

impl ChunkReader {
    pub fn new(source: Arc<dyn SourceStore>, cursor: ShardCursor, buffer_size: usize) -> Self {
        Self {
            source,
            cursor,
            buffer_size: buffer_size.max(1),
            stream: None,
            finished: false,
        }
    }

    /// Input split for one blob: always a single cursor over the whole
    /// object. Interior ranges cannot be appended independently.
    pub fn split(descriptor: &BlobDescriptor) -> Vec<ShardCursor> {
        vec![ShardCursor::for_blob(descriptor)]
    }

    /// Current resume point.
    pub fn cursor(&self) -> &ShardCursor {
        &self.cursor
    }

    /// Next `(offset, chunk)`, or `None` at end of stream.
    ///
    /// End of stream is reached when the offset passes the declared end
    /// offset or a read returns no bytes. A blob that no longer exists when
    /// it is opened is reported as `NotFound`.
    pub async fn next_chunk(&mut self) -> Result<Option<(u64, Bytes)>> {
        if self.finished || self.cursor.is_exhausted() {
            return Ok(None);
        }

        if self.stream.is_none() {
            let id = &self.cursor.source_id;
            let stream = match self.source.open_for_read(id, self.cursor.current_offset).await {
                Ok(stream) => stream,
                Err(e) => return Err(open_failure(self.source.as_ref(), id, e).await),
            };
            self.stream = Some(stream);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        let mut buf = BytesMut::with_capacity(self.buffer_size);
        while buf.len() < self.buffer_size {
            let remaining = (self.buffer_size - buf.len()) as u64;
            let n = (&mut **stream)
                .take(remaining)
                .read_buf(&mut buf)
                .await
                .map_err(|e| MigrateError::transfer(&self.cursor.source_id, e.into()))?;
            if n == 0 {
                break;
            }
        }

        if buf.is_empty() {
            self.finished = true;
            self.stream = None;
            return Ok(None);
        }

        let offset = self.cursor.current_offset;
        self.cursor.current_offset += buf.len() as u64;
        debug!(
            blob_id = %self.cursor.source_id,
            offset,
            len = buf.len(),
            "Read chunk"
        );
        Ok(Some((offset, buf.freeze())))
    }
}

/// `NotFound` if the blob is gone, otherwise a transfer failure.
async fn open_failure(source: &dyn SourceStore, id: &str, e: anyhow::Error) -> MigrateError {
    match source.get(id).await {
        Ok(None) => MigrateError::NotFound(id.to_string()),
        _ => MigrateError::transfer(id, e),
    }
}
