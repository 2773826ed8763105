//! Legacy content store laid out as a flat directory.
//!
//! Each blob is the file `<root>/<id>`. An optional sidecar
//! `<root>/<id>.info.json` holds `content_type` and `filename`; without a
//! content type the type is guessed from the filename.
//!
//! Listing works from a sorted snapshot of the directory taken when a walk
//! starts (`after == None`), so later pages cost a binary search instead of
//! a fresh directory scan. Blobs added after a walk started are picked up by
//! the next one.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use async_trait::async_trait;
use blobmigrator_common::store::{BlobReader, Page, SourceStore};
use blobmigrator_common::{BlobDescriptor, Partition};
use serde::Deserialize;
use tokio::io::AsyncSeekExt;
use tracing::debug;
use walkdir::WalkDir;

const INFO_SUFFIX: &str = ".info.json";

pub struct DirectorySource {
    root: PathBuf,
    snapshot: Mutex<Option<Arc<Vec<String>>>>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobInfo {
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    filename: Option<String>,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            snapshot: Mutex::new(None),
        }
    }

    fn blob_path(&self, id: &str) -> anyhow::Result<PathBuf> {
        if id.is_empty() || id == "." || id == ".." || id.contains('/') || id.contains('\\') {
            bail!("invalid blob id {:?}", id);
        }
        Ok(self.root.join(id))
    }

    fn info_path(&self, id: &str) -> anyhow::Result<PathBuf> {
        self.blob_path(&format!("{}{}", id, INFO_SUFFIX))
    }

    async fn read_info(&self, id: &str) -> anyhow::Result<BlobInfo> {
        let path = self.info_path(id)?;
        match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("Corrupt blob info {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BlobInfo::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn describe(&self, id: &str, size: u64) -> anyhow::Result<BlobDescriptor> {
        let info = self.read_info(id).await?;
        let content_type = info.content_type.or_else(|| {
            info.filename
                .as_deref()
                .and_then(|f| mime_guess::from_path(f).first())
                .map(|m| m.essence_str().to_string())
        });
        Ok(BlobDescriptor {
            id: id.to_string(),
            size,
            content_type,
            filename: info.filename,
        })
    }

    /// Descriptor for `id`, or `None` if the blob was removed since the
    /// snapshot was taken.
    async fn describe_if_present(&self, id: &str) -> anyhow::Result<Option<BlobDescriptor>> {
        match file_size(&self.blob_path(id)?).await? {
            Some(size) => Ok(Some(self.describe(id, size).await?)),
            None => Ok(None),
        }
    }

    /// Sorted blob ids. A new walk rescans the directory; continuing walks
    /// reuse the last scan.
    async fn ids(&self, rescan: bool) -> anyhow::Result<Arc<Vec<String>>> {
        if !rescan {
            if let Some(ids) = self.cached_ids()? {
                return Ok(ids);
            }
        }
        let root = self.root.clone();
        let ids = tokio::task::spawn_blocking(move || scan_ids(&root))
            .await
            .context("Directory scan task failed")??;
        let ids = Arc::new(ids);
        *self.lock_snapshot()? = Some(ids.clone());
        debug!(root = %self.root.display(), count = ids.len(), "Scanned source directory");
        Ok(ids)
    }

    fn cached_ids(&self) -> anyhow::Result<Option<Arc<Vec<String>>>> {
        Ok(self.lock_snapshot()?.clone())
    }

    fn lock_snapshot(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Option<Arc<Vec<String>>>>> {
        self.snapshot
            .lock()
            .map_err(|_| anyhow::anyhow!("source snapshot lock poisoned"))
    }
}

fn scan_ids(root: &Path) -> anyhow::Result<Vec<String>> {
    let mut ids = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to read {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if name.ends_with(INFO_SUFFIX) {
            continue;
        }
        ids.push(name.to_string());
    }
    Ok(ids)
}

/// Index of the first id strictly greater than `after`.
fn start_after(ids: &[String], after: Option<&str>) -> usize {
    match after {
        Some(a) => ids.partition_point(|id| id.as_str() <= a),
        None => 0,
    }
}

async fn file_size(path: &Path) -> anyhow::Result<Option<u64>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    }
}

#[async_trait]
impl SourceStore for DirectorySource {
    async fn list_page(&self, after: Option<&str>, limit: usize) -> anyhow::Result<Vec<BlobDescriptor>> {
        let ids = self.ids(after.is_none()).await?;
        let mut page = Vec::with_capacity(limit);
        for id in &ids[start_after(&ids, after)..] {
            if page.len() >= limit {
                break;
            }
            if let Some(d) = self.describe_if_present(id).await? {
                page.push(d);
            }
        }
        Ok(page)
    }

    /// Only ids owned by `partition` are stat'ed and described; `limit`
    /// bounds the number of owned blobs returned.
    async fn list_partition(
        &self,
        partition: Partition,
        after: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Page> {
        let ids = self.ids(after.is_none()).await?;
        let mut remaining = ids[start_after(&ids, after)..].iter();
        let mut items = Vec::new();
        let mut last = None;
        for id in remaining.by_ref() {
            last = Some(id);
            if !partition.contains(id) {
                continue;
            }
            if let Some(d) = self.describe_if_present(id).await? {
                items.push(d);
            }
            if items.len() >= limit {
                break;
            }
        }
        let next_after = if remaining.len() > 0 { last.cloned() } else { None };
        Ok(Page { items, next_after })
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<BlobDescriptor>> {
        let Ok(path) = self.blob_path(id) else {
            return Ok(None);
        };
        match file_size(&path).await? {
            Some(size) => Ok(Some(self.describe(id, size).await?)),
            None => Ok(None),
        }
    }

    async fn open_for_read(&self, id: &str, offset: u64) -> anyhow::Result<BlobReader> {
        let path = self.blob_path(id)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        Ok(Box::new(file))
    }

    async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let path = self.blob_path(id)?;
        let existed = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        };
        match tokio::fs::remove_file(self.info_path(id)?).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("Failed to delete blob info"),
        }
        debug!(blob_id = %id, existed, "Source delete complete");
        Ok(existed)
    }
}
