//! A single bounded byte stream
//!
//! One reader and one writer may use a stream concurrently. The buffer is
//! bounded by the stream's capacity: writers wait for space, readers wait for
//! data. `finish` ends the write side (readers drain, then see EOF); `close`
//! releases the stream and wakes anybody still blocked on it.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::domain::StreamId;
use crate::error::{BrokerError, BrokerResult};

/// Direction of a stream from its creator's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamMode {
    /// Creator reads, the peer writes
    Read,
    /// Creator writes, the peer reads
    Write,
    ReadWrite,
}

#[derive(Debug, Default)]
struct StreamState {
    buffer: VecDeque<u8>,
    finished: bool,
    closed: bool,
}

/// Bounded single-producer/single-consumer byte stream
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    mode: StreamMode,
    capacity: usize,
    state: Mutex<StreamState>,
    readable: Notify,
    writable: Notify,
}

impl Stream {
    pub(crate) fn new(id: StreamId, mode: StreamMode, capacity: usize) -> Self {
        Self {
            id,
            mode,
            capacity: capacity.max(1),
            state: Mutex::new(StreamState::default()),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).closed
    }

    /// Bytes currently buffered
    pub fn buffered(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).buffer.len()
    }

    /// Write as much of `bytes` as fits, waiting while the buffer is full
    ///
    /// Returns the number of bytes accepted (at least one unless `bytes` is empty).
    pub async fn write(&self, bytes: &[u8]) -> BrokerResult<usize> {
        loop {
            let space_available = self.writable.notified();
            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.closed || state.finished {
                    return Err(BrokerError::Closed(self.id.clone()));
                }
                if bytes.is_empty() {
                    return Ok(0);
                }

                let space = self.capacity - state.buffer.len();
                if space > 0 {
                    let n = space.min(bytes.len());
                    state.buffer.extend(&bytes[..n]);
                    self.readable.notify_one();
                    return Ok(n);
                }
            }
            space_available.await;
        }
    }

    /// Write all of `bytes`, waiting for space as needed
    pub async fn write_all(&self, mut bytes: &[u8]) -> BrokerResult<()> {
        while !bytes.is_empty() {
            let n = self.write(bytes).await?;
            bytes = &bytes[n..];
        }
        Ok(())
    }

    /// Read up to `max_bytes`, waiting while the buffer is empty
    ///
    /// An empty result means end-of-stream: the writer finished and the buffer
    /// drained, or the stream was closed while this read was blocked.
    pub async fn read(&self, max_bytes: usize) -> BrokerResult<Vec<u8>> {
        let mut waited = false;
        loop {
            let data_available = self.readable.notified();
            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.closed {
                    if waited {
                        return Ok(Vec::new());
                    }
                    return Err(BrokerError::Closed(self.id.clone()));
                }
                if !state.buffer.is_empty() || max_bytes == 0 {
                    let n = max_bytes.min(state.buffer.len());
                    let data: Vec<u8> = state.buffer.drain(..n).collect();
                    self.writable.notify_one();
                    return Ok(data);
                }
                if state.finished {
                    return Ok(Vec::new());
                }
            }
            waited = true;
            data_available.await;
        }
    }

    /// Read until end-of-stream
    pub async fn read_to_end(&self) -> BrokerResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read(self.capacity).await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    /// End the write side; buffered bytes stay readable
    pub fn finish(&self) {
        debug!(id = %self.id, "Stream::finish: called");
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.finished = true;
        self.readable.notify_waiters();
        self.readable.notify_one();
    }

    /// Release the stream; idempotent. Returns whether this call closed it.
    pub(crate) fn close(&self) -> bool {
        debug!(id = %self.id, "Stream::close: called");
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return false;
        }
        state.closed = true;
        state.buffer.clear();
        drop(state);

        self.readable.notify_waiters();
        self.readable.notify_one();
        self.writable.notify_waiters();
        self.writable.notify_one();
        true
    }
}
