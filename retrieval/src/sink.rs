use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use job_store::SinkLocation;

use crate::error::{Result, RetrievalError};

/// Durable target for reassembled bytes.
///
/// `put` is a streamed write and must be called in ascending offset order
/// with no gaps; the reorder buffer upstream guarantees this per archive.
/// `finalize` makes the object durable and returns an opaque reference.
#[async_trait]
pub trait ObjectSink: Send + Sync {
    async fn put(&self, location: &SinkLocation, offset: u64, data: Bytes) -> Result<()>;

    async fn put_whole(&self, location: &SinkLocation, data: Bytes) -> Result<()>;

    async fn finalize(&self, location: &SinkLocation) -> Result<String>;
}

/// In-memory sink for tests and the demo path. Rejects out-of-order or
/// gapped writes, which turns any ordering bug upstream into a hard test
/// failure.
#[derive(Default)]
pub struct MemoryObjectSink {
    inner: Mutex<MemorySinkState>,
}

#[derive(Default)]
struct MemorySinkState {
    objects: HashMap<String, Vec<u8>>,
    finalized: HashSet<String>,
    write_log: Vec<(String, u64, usize)>,
}

impl MemoryObjectSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn object_key(location: &SinkLocation) -> String {
        format!("{}/{}", location.bucket, location.key)
    }

    /// Full object content, if any writes happened.
    pub fn object(&self, location: &SinkLocation) -> Option<Bytes> {
        let state = self.inner.lock().unwrap();
        state.objects.get(&Self::object_key(location)).map(|v| Bytes::from(v.clone()))
    }

    pub fn is_finalized(&self, location: &SinkLocation) -> bool {
        let state = self.inner.lock().unwrap();
        state.finalized.contains(&Self::object_key(location))
    }

    /// Offsets written to this object, in call order.
    pub fn write_offsets(&self, location: &SinkLocation) -> Vec<u64> {
        let key = Self::object_key(location);
        let state = self.inner.lock().unwrap();
        state
            .write_log
            .iter()
            .filter(|(k, _, _)| *k == key)
            .map(|(_, offset, _)| *offset)
            .collect()
    }
}

#[async_trait]
impl ObjectSink for MemoryObjectSink {
    async fn put(&self, location: &SinkLocation, offset: u64, data: Bytes) -> Result<()> {
        let key = Self::object_key(location);
        let mut state = self.inner.lock().unwrap();
        let object = state.objects.entry(key.clone()).or_default();
        if offset == 0 && !object.is_empty() {
            // A restarted transfer overwrites from the beginning.
            object.clear();
        } else if offset != object.len() as u64 {
            return Err(RetrievalError::Sink(format!(
                "out-of-order write to {key}: offset {offset}, object length {}",
                object.len()
            )));
        }
        object.extend_from_slice(&data);
        state.write_log.push((key, offset, data.len()));
        Ok(())
    }

    async fn put_whole(&self, location: &SinkLocation, data: Bytes) -> Result<()> {
        let key = Self::object_key(location);
        let mut state = self.inner.lock().unwrap();
        let len = data.len();
        state.objects.insert(key.clone(), data.to_vec());
        state.write_log.push((key, 0, len));
        Ok(())
    }

    async fn finalize(&self, location: &SinkLocation) -> Result<String> {
        let key = Self::object_key(location);
        let mut state = self.inner.lock().unwrap();
        if !state.objects.contains_key(&key) {
            return Err(RetrievalError::Sink(format!("finalize of never-written object {key}")));
        }
        state.finalized.insert(key.clone());
        Ok(format!("mem://{key}"))
    }
}
