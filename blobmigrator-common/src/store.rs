//! Traits implemented by the source and destination store adapters.
//!
//! The engines own routing, idempotency and bookkeeping; an adapter is
//! responsible only for raw object I/O against one kind of store.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::blob::BlobDescriptor;
use crate::error::Result;
use crate::naming;
use crate::partition::Partition;

/// Id prefix of objects that a simulated destination re-exposes as source
/// blobs. Native ids produced by [`encoded_native_id`] carry it too.
pub const SIMULATED_ARTIFACT_PREFIX: &str = "encoded_gs_file:";

pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// A page of a partitioned listing.
#[derive(Debug, Default)]
pub struct Page {
    pub items: Vec<BlobDescriptor>,
    /// Resume point for the next call; `None` once the keyspace is exhausted.
    pub next_after: Option<String>,
}

/// The legacy store blobs are migrated out of.
#[async_trait::async_trait]
pub trait SourceStore: Send + Sync {
    /// Descriptors with id strictly greater than `after`, sorted by id.
    async fn list_page(&self, after: Option<&str>, limit: usize) -> anyhow::Result<Vec<BlobDescriptor>>;

    /// Look up one descriptor. `Ok(None)` when the blob does not exist.
    async fn get(&self, id: &str) -> anyhow::Result<Option<BlobDescriptor>>;

    /// Open the blob's bytes starting at `offset`.
    async fn open_for_read(&self, id: &str, offset: u64) -> anyhow::Result<BlobReader>;

    /// Delete a blob. Returns false if it was already gone.
    async fn delete(&self, id: &str) -> anyhow::Result<bool>;

    /// One page of the blobs owned by `partition`.
    ///
    /// The default scans the full keyspace and filters; stores with native
    /// range enumeration should override it.
    async fn list_partition(
        &self,
        partition: Partition,
        after: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Page> {
        let scanned = self.list_page(after, limit).await?;
        let next_after = if scanned.len() < limit {
            None
        } else {
            scanned.last().map(|d| d.id.clone())
        };
        let items = scanned.into_iter().filter(|d| partition.contains(&d.id)).collect();
        Ok(Page { items, next_after })
    }
}

/// Headers applied when an object is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
    /// Total object size, when known up front.
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// An object being written. Nothing is visible at the path until `close`
/// returns successfully.
#[async_trait::async_trait]
pub trait ObjectWriter: Send {
    async fn write(&mut self, chunk: Bytes) -> anyhow::Result<()>;

    /// Bytes accepted so far.
    fn written(&self) -> u64;

    async fn close(self: Box<Self>) -> anyhow::Result<()>;
}

/// The object store blobs are migrated into. Paths are `/<bucket>/<object>`.
#[async_trait::async_trait]
pub trait DestinationStore: Send + Sync {
    async fn open(&self, path: &str, options: &WriteOptions) -> anyhow::Result<Box<dyn ObjectWriter>>;

    /// Reopen a partially written object at `offset`. `Ok(None)` means the
    /// adapter cannot resume and the caller must start over.
    async fn resume(
        &self,
        _path: &str,
        _options: &WriteOptions,
        _offset: u64,
    ) -> anyhow::Result<Option<Box<dyn ObjectWriter>>> {
        Ok(None)
    }

    async fn delete(&self, path: &str) -> anyhow::Result<()>;

    async fn stat(&self, path: &str) -> anyhow::Result<Option<ObjectStat>>;

    fn validate_container_name(&self, name: &str) -> Result<()> {
        naming::validate_bucket_name(name)
    }

    fn derive_native_id(&self, path: &str) -> String {
        encoded_native_id(path)
    }
}

/// `encoded_gs_file:` followed by the URL-safe base64 of the object path.
pub fn encoded_native_id(path: &str) -> String {
    format!("{}{}", SIMULATED_ARTIFACT_PREFIX, URL_SAFE.encode(path.as_bytes()))
}

/// Convenience for adapters that receive whole-object bodies.
pub async fn write_all(
    store: &dyn DestinationStore,
    path: &str,
    options: &WriteOptions,
    data: Bytes,
) -> anyhow::Result<()> {
    let mut writer = store.open(path, options).await?;
    writer.write(data).await?;
    writer.close().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_native_id() {
        let id = encoded_native_id("/my-bucket/root/abc");
        assert!(id.starts_with(SIMULATED_ARTIFACT_PREFIX));
        assert_eq!(id, encoded_native_id("/my-bucket/root/abc"));
        assert_ne!(id, encoded_native_id("/my-bucket/root/abd"));
        let encoded = id.trim_start_matches(SIMULATED_ARTIFACT_PREFIX);
        assert_eq!(URL_SAFE.decode(encoded).unwrap(), b"/my-bucket/root/abc");
    }
}
