//! The byte-oriented queue facade and its configuration surface.
//!
//! [`HyperQueue`] is a thin projection of the ring engine: opaque byte
//! payloads in, opaque byte payloads out, no serialization. Layers that
//! move typed values encode to bytes first and hand the result here.

use serde_derive::{Deserialize, Serialize};

use crate::errors::HyperQError;
use crate::ring::{RingHandle, MAX_CAPACITY};
use crate::segment;

/// Default queue capacity when a config does not specify one.
pub const DEFAULT_CAPACITY: u64 = 1 << 20;

/// Configuration for opening a queue. Loadable from TOML through serde;
/// use [`QueueConfig::builder`] when constructing in code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Segment name, at most 30 bytes, optional leading `/`. When absent a
    /// unique name is synthesized and exposed via [`HyperQueue::name`].
    pub name: Option<String>,
    /// Requested capacity in bytes; the creator rounds it up to a whole
    /// number of pages.
    pub capacity: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            name: None,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl QueueConfig {
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct QueueConfigBuilder {
    name: Option<String>,
    capacity: Option<u64>,
}

impl QueueConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn capacity(mut self, capacity: u64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Validate and produce the config. Name syntax and capacity bounds are
    /// checked here so binaries fail before touching the kernel namespace.
    pub fn build(self) -> Result<QueueConfig, HyperQError> {
        if let Some(name) = &self.name {
            segment::normalize_name(name)?;
        }
        let capacity = self.capacity.unwrap_or(DEFAULT_CAPACITY);
        if capacity == 0 {
            return Err(HyperQError::invalid("capacity must be greater than zero"));
        }
        if capacity > MAX_CAPACITY as u64 {
            return Err(HyperQError::invalid(format!(
                "capacity {} exceeds the maximum of {} bytes",
                capacity, MAX_CAPACITY
            )));
        }
        Ok(QueueConfig {
            name: self.name,
            capacity,
        })
    }
}

/// A handle to a named, bounded, multi-producer multi-consumer byte queue
/// in shared memory.
///
/// The first `HyperQueue` opened under a name creates the segment; later
/// ones attach to it. Handles may be shared across threads, and any number
/// of processes may open the same name. `put` and `get` block; dropping the
/// last handle anywhere removes the segment from the kernel namespace.
pub struct HyperQueue {
    ring: RingHandle,
}

impl HyperQueue {
    /// Open the queue described by `config`.
    pub fn open(config: &QueueConfig) -> Result<HyperQueue, HyperQError> {
        let ring = RingHandle::open(config.capacity, config.name.as_deref())?;
        Ok(HyperQueue { ring })
    }

    /// Open an anonymous queue of the given capacity. The synthesized name
    /// is available through [`HyperQueue::name`] for other processes.
    pub fn with_capacity(capacity: u64) -> Result<HyperQueue, HyperQError> {
        let ring = RingHandle::open(capacity, None)?;
        Ok(HyperQueue { ring })
    }

    /// Enqueue a message, blocking while the queue cannot fit it.
    pub fn put(&self, data: &[u8]) -> Result<(), HyperQError> {
        self.ring.put(data)
    }

    /// Dequeue the oldest message, blocking while the queue is empty.
    pub fn get(&self) -> Result<Vec<u8>, HyperQError> {
        self.ring.get()
    }

    /// Whether the queue holds no messages right now. A snapshot only;
    /// another handle may enqueue immediately after this returns.
    pub fn empty(&self) -> Result<bool, HyperQError> {
        self.ring.empty()
    }

    /// Whether not even a one-byte message would fit right now.
    pub fn full(&self) -> Result<bool, HyperQError> {
        self.ring.full()
    }

    /// Bytes currently stored, including the 4-byte frame per message.
    pub fn size(&self) -> Result<u64, HyperQError> {
        self.ring.size()
    }

    /// Discard all stored messages and wake blocked producers.
    pub fn clear(&self) -> Result<(), HyperQError> {
        self.ring.clear()
    }

    /// The normalized segment name, without the leading `/`.
    pub fn name(&self) -> &str {
        self.ring.name()
    }

    /// The fixed byte capacity after page rounding.
    pub fn capacity(&self) -> u64 {
        self.ring.capacity() as u64
    }
}
