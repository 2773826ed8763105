//! Local directory destination.
//!
//! Objects live at `<base>/<bucket>/<object>`. Writes go to a `.partial`
//! file next to the target and are renamed into place after fsync, so a
//! reader never sees a half-written object. Headers are kept in a
//! `.meta.json` sidecar.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use blobmigrator_common::store::{DestinationStore, ObjectStat, ObjectWriter, WriteOptions};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

pub struct DirectoryDestination {
    base_path: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ObjectMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_disposition: Option<String>,
}

impl DirectoryDestination {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self { base_path: base_path.into() }
    }

    /// Map an object path under the base directory. Empty, `.` and `..`
    /// segments are rejected so nothing escapes the base.
    fn full_path(&self, path: &str) -> anyhow::Result<PathBuf> {
        let relative = path.trim_start_matches('/');
        if relative.is_empty()
            || relative
                .split('/')
                .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            anyhow::bail!("invalid object path {:?}", path);
        }
        Ok(self.base_path.join(relative))
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(suffix);
    PathBuf::from(s)
}

fn partial_path(dest: &Path) -> PathBuf {
    with_suffix(dest, ".partial")
}

fn meta_path(dest: &Path) -> PathBuf {
    with_suffix(dest, ".meta.json")
}

async fn remove_if_exists(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

struct DirectoryWriter {
    key: String,
    dest: PathBuf,
    partial: PathBuf,
    file: tokio::fs::File,
    written: u64,
    meta: ObjectMeta,
}

#[async_trait]
impl ObjectWriter for DirectoryWriter {
    async fn write(&mut self, chunk: Bytes) -> anyhow::Result<()> {
        self.file
            .write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write {}", self.partial.display()))?;
        // Bytes must be on disk before the caller checkpoints past them.
        self.file.flush().await.context("Failed to flush object")?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    fn written(&self) -> u64 {
        self.written
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        let DirectoryWriter { key, dest, partial, mut file, written, meta } = *self;
        file.flush().await.context("Failed to flush object")?;
        file.sync_all().await.context("fsync failed")?;
        drop(file);

        let meta_json = serde_json::to_vec(&meta).context("Failed to encode object metadata")?;
        tokio::fs::write(meta_path(&dest), meta_json)
            .await
            .context("Failed to write object metadata")?;

        // Atomic rename
        tokio::fs::rename(&partial, &dest)
            .await
            .context("Atomic rename failed")?;

        debug!(path = %key, bytes = written, "Directory write complete");
        Ok(())
    }
}

#[async_trait]
impl DestinationStore for DirectoryDestination {
    async fn open(&self, path: &str, options: &WriteOptions) -> anyhow::Result<Box<dyn ObjectWriter>> {
        let dest = self.full_path(path)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create parent directory")?;
        }
        let partial = partial_path(&dest);
        let file = tokio::fs::File::create(&partial)
            .await
            .with_context(|| format!("Failed to create {}", partial.display()))?;

        Ok(Box::new(DirectoryWriter {
            key: path.to_string(),
            dest,
            partial,
            file,
            written: 0,
            meta: ObjectMeta {
                content_type: options.content_type.clone(),
                content_disposition: options.content_disposition.clone(),
            },
        }))
    }

    /// Continue a `.partial` file left by an interrupted copy. Bytes past
    /// `offset` were never checkpointed and are cut off.
    async fn resume(
        &self,
        path: &str,
        options: &WriteOptions,
        offset: u64,
    ) -> anyhow::Result<Option<Box<dyn ObjectWriter>>> {
        let dest = self.full_path(path)?;
        let partial = partial_path(&dest);
        let len = match tokio::fs::metadata(&partial).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("Failed to stat partial object"),
        };
        if len < offset {
            return Ok(None);
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&partial)
            .await
            .with_context(|| format!("Failed to reopen {}", partial.display()))?;
        file.set_len(offset).await.context("Failed to truncate partial object")?;
        file.seek(SeekFrom::Start(offset)).await?;

        debug!(path = %path, offset, "Resuming partial object");
        Ok(Some(Box::new(DirectoryWriter {
            key: path.to_string(),
            dest,
            partial,
            file,
            written: offset,
            meta: ObjectMeta {
                content_type: options.content_type.clone(),
                content_disposition: options.content_disposition.clone(),
            },
        })))
    }

    async fn delete(&self, path: &str) -> anyhow::Result<()> {
        let dest = self.full_path(path)?;
        remove_if_exists(&dest).await?;
        remove_if_exists(&meta_path(&dest)).await?;
        remove_if_exists(&partial_path(&dest)).await?;
        debug!(path = %path, "Directory delete complete");
        Ok(())
    }

    async fn stat(&self, path: &str) -> anyhow::Result<Option<ObjectStat>> {
        let dest = self.full_path(path)?;
        let size = match tokio::fs::metadata(&dest).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", dest.display())),
        };

        let meta: ObjectMeta = match tokio::fs::read(meta_path(&dest)).await {
            Ok(raw) => serde_json::from_slice(&raw).context("Corrupt object metadata")?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ObjectMeta::default(),
            Err(e) => return Err(e).context("Failed to read object metadata"),
        };

        let mut headers = BTreeMap::new();
        if let Some(cd) = meta.content_disposition {
            headers.insert("content-disposition".to_string(), cd);
        }
        Ok(Some(ObjectStat {
            size,
            content_type: meta.content_type,
            headers,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobmigrator_common::store::write_all;

    fn options() -> WriteOptions {
        WriteOptions {
            content_type: Some("text/plain".into()),
            content_disposition: Some("attachment; filename=a.txt".into()),
            content_length: None,
        }
    }

    #[tokio::test]
    async fn test_write_stat_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryDestination::new(dir.path());

        let mut writer = store.open("/bucket/root/ab/abc", &options()).await.unwrap();
        writer.write(Bytes::from("hello ")).await.unwrap();
        writer.write(Bytes::from("world")).await.unwrap();
        assert_eq!(writer.written(), 11);
        // Not visible before close.
        assert!(store.stat("/bucket/root/ab/abc").await.unwrap().is_none());
        writer.close().await.unwrap();

        let on_disk = std::fs::read(dir.path().join("bucket/root/ab/abc")).unwrap();
        assert_eq!(on_disk, b"hello world");
        assert!(!dir.path().join("bucket/root/ab/abc.partial").exists());

        let stat = store.stat("/bucket/root/ab/abc").await.unwrap().unwrap();
        assert_eq!(stat.size, 11);
        assert_eq!(stat.content_type.as_deref(), Some("text/plain"));
        assert_eq!(
            stat.headers.get("content-disposition").map(String::as_str),
            Some("attachment; filename=a.txt")
        );

        store.delete("/bucket/root/ab/abc").await.unwrap();
        assert!(store.stat("/bucket/root/ab/abc").await.unwrap().is_none());
        assert!(!dir.path().join("bucket/root/ab/abc.meta.json").exists());
        // Deleting twice is fine.
        store.delete("/bucket/root/ab/abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_no_headers_when_options_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryDestination::new(dir.path());
        write_all(&store, "/bucket/x", &WriteOptions::default(), Bytes::from("x"))
            .await
            .unwrap();
        let stat = store.stat("/bucket/x").await.unwrap().unwrap();
        assert_eq!(stat.content_type, None);
        assert!(stat.headers.is_empty());
    }

    #[tokio::test]
    async fn test_resume_truncates_to_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryDestination::new(dir.path());

        let mut writer = store.open("/bucket/big", &options()).await.unwrap();
        writer.write(Bytes::from("0123456789")).await.unwrap();
        // Simulate a crash: drop without close, checkpoint said 6 bytes.
        drop(writer);

        let mut writer = store.resume("/bucket/big", &options(), 6).await.unwrap().unwrap();
        assert_eq!(writer.written(), 6);
        writer.write(Bytes::from("6789ab")).await.unwrap();
        writer.close().await.unwrap();

        let on_disk = std::fs::read(dir.path().join("bucket/big")).unwrap();
        assert_eq!(on_disk, b"0123456789ab");
    }

    #[tokio::test]
    async fn test_resume_without_partial_starts_over() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryDestination::new(dir.path());
        assert!(store.resume("/bucket/none", &options(), 4).await.unwrap().is_none());

        let mut writer = store.open("/bucket/short", &options()).await.unwrap();
        writer.write(Bytes::from("ab")).await.unwrap();
        drop(writer);
        assert!(store.resume("/bucket/short", &options(), 4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_parent_segments_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryDestination::new(dir.path());
        for path in ["/../../etc/passwd", "/bucket/../x", "/bucket/./x", "/bucket//x", "/"] {
            assert!(
                write_all(&store, path, &WriteOptions::default(), Bytes::from("x")).await.is_err(),
                "path {:?}",
                path
            );
        }
        assert!(store.stat("/bucket/../x").await.is_err());
        assert!(store.delete("/../x").await.is_err());
    }

    #[tokio::test]
    async fn test_dots_inside_names_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryDestination::new(dir.path());
        write_all(&store, "/bucket/a..b.txt", &WriteOptions::default(), Bytes::from("first"))
            .await
            .unwrap();
        write_all(&store, "/bucket/ab.txt", &WriteOptions::default(), Bytes::from("second"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("bucket/a..b.txt")).unwrap(), b"first");
        assert_eq!(std::fs::read(dir.path().join("bucket/ab.txt")).unwrap(), b"second");
    }
}
