//! In-memory stores shared by the worker's unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use blobmigrator_common::store::{BlobReader, DestinationStore, ObjectStat, ObjectWriter, SourceStore, WriteOptions};
use blobmigrator_common::BlobDescriptor;
use bytes::Bytes;

#[derive(Default)]
pub struct MemorySource {
    pub blobs: Mutex<BTreeMap<String, (BlobDescriptor, Vec<u8>)>>,
    pub opens: Mutex<u32>,
    /// Remove the blob when it is opened, as if deleted right after listing.
    pub vanish_on_read: AtomicBool,
    /// Fail every open while leaving the blob in place.
    pub unreadable: AtomicBool,
}

impl MemorySource {
    pub fn insert(&self, id: &str, data: &[u8], content_type: Option<&str>, filename: Option<&str>) -> BlobDescriptor {
        let d = BlobDescriptor {
            id: id.to_string(),
            size: data.len() as u64,
            content_type: content_type.map(str::to_string),
            filename: filename.map(str::to_string),
        };
        self.blobs.lock().unwrap().insert(id.to_string(), (d.clone(), data.to_vec()));
        d
    }

    pub fn set_vanish_on_read(&self, vanish: bool) {
        self.vanish_on_read.store(vanish, Ordering::SeqCst);
    }

    pub fn set_unreadable(&self, unreadable: bool) {
        self.unreadable.store(unreadable, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> u32 {
        *self.opens.lock().unwrap()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl SourceStore for MemorySource {
    async fn list_page(&self, after: Option<&str>, limit: usize) -> anyhow::Result<Vec<BlobDescriptor>> {
        let blobs = self.blobs.lock().unwrap();
        Ok(blobs
            .values()
            .filter(|(d, _)| after.map_or(true, |a| d.id.as_str() > a))
            .take(limit)
            .map(|(d, _)| d.clone())
            .collect())
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<BlobDescriptor>> {
        Ok(self.blobs.lock().unwrap().get(id).map(|(d, _)| d.clone()))
    }

    async fn open_for_read(&self, id: &str, offset: u64) -> anyhow::Result<BlobReader> {
        *self.opens.lock().unwrap() += 1;
        if self.unreadable.load(Ordering::SeqCst) {
            anyhow::bail!("simulated read failure for {}", id);
        }
        if self.vanish_on_read.load(Ordering::SeqCst) {
            self.blobs.lock().unwrap().remove(id);
        }
        let data = self
            .blobs
            .lock()
            .unwrap()
            .get(id)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| anyhow::anyhow!("no blob {}", id))?;
        let start = (offset as usize).min(data.len());
        Ok(Box::new(std::io::Cursor::new(data[start..].to_vec())))
    }

    async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        Ok(self.blobs.lock().unwrap().remove(id).is_some())
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub options: WriteOptions,
}

#[derive(Default)]
pub struct MemoryDestination {
    pub objects: Arc<Mutex<HashMap<String, StoredObject>>>,
    pub opens: Mutex<u32>,
    pub fail_writes: AtomicBool,
}

impl MemoryDestination {
    pub fn object(&self, path: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    pub fn open_count(&self) -> u32 {
        *self.opens.lock().unwrap()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }
}

struct MemoryWriter {
    path: String,
    buf: Vec<u8>,
    options: WriteOptions,
    objects: Arc<Mutex<HashMap<String, StoredObject>>>,
    fail: bool,
}

#[async_trait::async_trait]
impl ObjectWriter for MemoryWriter {
    async fn write(&mut self, chunk: Bytes) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("simulated write failure");
        }
        self.buf.extend_from_slice(&chunk);
        Ok(())
    }

    fn written(&self) -> u64 {
        self.buf.len() as u64
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("simulated close failure");
        }
        let MemoryWriter { path, buf, options, objects, .. } = *self;
        objects.lock().unwrap().insert(path, StoredObject { data: buf, options });
        Ok(())
    }
}

#[async_trait::async_trait]
impl DestinationStore for MemoryDestination {
    async fn open(&self, path: &str, options: &WriteOptions) -> anyhow::Result<Box<dyn ObjectWriter>> {
        *self.opens.lock().unwrap() += 1;
        Ok(Box::new(MemoryWriter {
            path: path.to_string(),
            buf: Vec::new(),
            options: options.clone(),
            objects: self.objects.clone(),
            fail: self.fail_writes.load(Ordering::SeqCst),
        }))
    }

    async fn delete(&self, path: &str) -> anyhow::Result<()> {
        self.objects.lock().unwrap().remove(path);
        Ok(())
    }

    async fn stat(&self, path: &str) -> anyhow::Result<Option<ObjectStat>> {
        Ok(self.object(path).map(|o| {
            let mut headers = BTreeMap::new();
            if let Some(cd) = o.options.content_disposition {
                headers.insert("content-disposition".to_string(), cd);
            }
            ObjectStat {
                size: o.data.len() as u64,
                content_type: o.options.content_type,
                headers,
            }
        }))
    }
}
