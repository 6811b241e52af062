//! StreamManager - owns every open stream
//!
//! The id-to-stream map is the only shared structure here: open/close take the
//! write lock, lookups take the read lock and clone the `Arc<Stream>` out, so
//! no lock is ever held across a blocking read or write.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use super::config::StreamConfig;
use super::pipe::{Stream, StreamMode};
use crate::domain::StreamId;
use crate::error::{BrokerError, BrokerResult};

/// Registry of open streams
pub struct StreamManager {
    config: StreamConfig,
    streams: RwLock<HashMap<StreamId, Arc<Stream>>>,
    opened_total: AtomicU64,
}

impl StreamManager {
    pub fn new(config: StreamConfig) -> Self {
        debug!(?config, "StreamManager::new: called");
        Self {
            config,
            streams: RwLock::new(HashMap::new()),
            opened_total: AtomicU64::new(0),
        }
    }

    /// Open a new stream; `size_hint` of 0 uses the configured default capacity
    pub fn open(&self, mode: StreamMode, size_hint: usize) -> StreamId {
        let capacity = self.config.capacity_for(size_hint);
        let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);

        let mut id = StreamId::generate();
        while streams.contains_key(&id) {
            id = StreamId::generate();
        }

        streams.insert(id.clone(), Arc::new(Stream::new(id.clone(), mode, capacity)));
        self.opened_total.fetch_add(1, Ordering::Relaxed);
        debug!(%id, ?mode, capacity, "StreamManager::open: opened");
        id
    }

    /// Look up an open stream
    pub fn get(&self, id: &StreamId) -> BrokerResult<Arc<Stream>> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        streams
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("stream {}", id)))
    }

    /// Write to a stream, returning the number of bytes accepted
    pub async fn write(&self, id: &StreamId, bytes: &[u8]) -> BrokerResult<usize> {
        self.get(id)?.write(bytes).await
    }

    /// Read up to `max_bytes` from a stream; empty means end-of-stream
    pub async fn read(&self, id: &StreamId, max_bytes: usize) -> BrokerResult<Vec<u8>> {
        self.get(id)?.read(max_bytes).await
    }

    /// Mark the write side of a stream finished
    pub fn finish(&self, id: &StreamId) -> BrokerResult<()> {
        self.get(id)?.finish();
        Ok(())
    }

    /// Close and forget a stream; idempotent
    ///
    /// Returns whether the id referred to an open stream.
    pub fn close(&self, id: &StreamId) -> bool {
        let removed = {
            let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
            streams.remove(id)
        };

        match removed {
            Some(stream) => {
                stream.close();
                debug!(%id, "StreamManager::close: closed");
                true
            }
            None => {
                debug!(%id, "StreamManager::close: not open");
                false
            }
        }
    }

    /// Close every open stream
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<Stream>> = {
            let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
            streams.drain().map(|(_, s)| s).collect()
        };

        for stream in &drained {
            stream.close();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Closed all open streams");
        }
        drained.len()
    }

    pub fn open_count(&self) -> usize {
        self.streams.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn opened_total(&self) -> u64 {
        self.opened_total.load(Ordering::Relaxed)
    }
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new(StreamConfig::default())
    }
}
