use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use job_store::SinkLocation;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, RetrievalError};
use crate::sink::ObjectSink;

/// Reorder buffer between concurrent chunk fetches and the ordered sink.
///
/// Chunks complete in arbitrary order; the sink sees writes strictly by
/// ascending byte offset. A chunk whose predecessor has not landed yet is
/// parked in the buffer and flushed as soon as the gap closes.
pub struct ArchiveAssembler {
    sink: Arc<dyn ObjectSink>,
    location: SinkLocation,
    total_size: u64,
    inner: Mutex<AssemblerState>,
}

struct AssemblerState {
    next_offset: u64,
    pending: BTreeMap<u64, Bytes>,
}

impl ArchiveAssembler {
    pub fn new(sink: Arc<dyn ObjectSink>, location: SinkLocation, total_size: u64) -> Self {
        Self {
            sink,
            location,
            total_size,
            inner: Mutex::new(AssemblerState {
                next_offset: 0,
                pending: BTreeMap::new(),
            }),
        }
    }

    /// Hands one completed chunk to the buffer and flushes every chunk that
    /// is now contiguous with the write frontier. The lock is held across
    /// sink writes, which is what serializes them per archive.
    pub async fn accept(&self, offset: u64, data: Bytes) -> Result<()> {
        let mut state = self.inner.lock().await;
        if offset < state.next_offset {
            return Err(RetrievalError::Internal(format!(
                "chunk at offset {offset} overlaps already-written data (frontier {})",
                state.next_offset
            )));
        }
        state.pending.insert(offset, data);

        loop {
            let frontier = state.next_offset;
            let Some(chunk) = state.pending.remove(&frontier) else {
                break;
            };
            let len = chunk.len() as u64;
            self.sink.put(&self.location, frontier, chunk).await?;
            state.next_offset = frontier + len;
            debug!(location = %self.location, frontier = state.next_offset, "flushed chunk");
        }
        Ok(())
    }

    /// Verifies that every byte of the archive has been written through.
    pub async fn finish(&self) -> Result<()> {
        let state = self.inner.lock().await;
        if !state.pending.is_empty() || state.next_offset != self.total_size {
            return Err(RetrievalError::Internal(format!(
                "incomplete archive {}: wrote {} of {} bytes with {} chunks parked",
                self.location,
                state.next_offset,
                self.total_size,
                state.pending.len()
            )));
        }
        Ok(())
    }
}
