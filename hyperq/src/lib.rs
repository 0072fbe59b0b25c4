//! A bounded, multi-producer multi-consumer FIFO byte queue living in named
//! POSIX shared memory, so that independent processes (and threads within
//! them) exchange variable-length messages without a kernel transfer per
//! message.
//!
//! # Overview
//! The storage for a queue is a shared-memory segment addressed by name
//! (visible under `/dev/shm` on Linux). The first handle opened under a
//! name creates and initializes the segment; later handles attach to it.
//! Producers and consumers in any attached process coordinate through a
//! process-shared mutex and two condition variables embedded in the
//! segment's header.
//!
//! Key components:
//! - [`HyperQueue`]: the byte-oriented handle with blocking `put`/`get`,
//!   snapshot introspection and `clear`.
//! - [`QueueConfig`]: name and capacity, buildable in code via
//!   [`QueueConfig::builder`] or loadable from TOML via serde.
//! - [`HyperQError`]: the error surface for every fallible operation.
//!
//! # Layout and the doubled mapping
//! Each segment is one header page followed by the capacity region, and
//! the capacity region is mapped twice back to back over the same physical
//! pages. A message is a 4-byte little-endian length prefix followed by
//! its payload; because of the second mapping, a frame that wraps the
//! logical end of the ring is still a single contiguous copy in and a
//! single contiguous copy out. Capacities are whole pages; the creator
//! rounds the requested size up.
//!
//! # Concurrency model
//! Every mutating operation and every introspection runs under the single
//! segment mutex, so all observers see a consistent point-in-time state.
//! `put` blocks while the framed message does not fit and `get` blocks
//! while the queue is empty; both suspensions release the mutex atomically
//! via the embedded condition variables. FIFO order is over commits: the
//! order in which producers finish `put` is the order consumers receive.
//!
//! # Lifecycle
//! The segment header carries an atomic count of live handles across all
//! processes. Dropping a handle decrements it; the handle that observes
//! the drop to zero destroys the embedded primitives and unlinks the name,
//! no matter which process created the segment. If every process dies
//! abruptly the name persists; [`force_unlink`] removes such a stale
//! segment.
//!
//! ```no_run
//! use hyperq::{HyperQueue, QueueConfig};
//!
//! # fn main() -> Result<(), hyperq::HyperQError> {
//! let config = QueueConfig::builder().name("sensor-frames").capacity(1 << 20).build()?;
//! let queue = HyperQueue::open(&config)?;
//! queue.put(b"temperature: 25.5")?;
//! let frame = queue.get()?;
//! assert_eq!(frame, b"temperature: 25.5");
//! # Ok(())
//! # }
//! ```
//!
//! POSIX only: named shared memory, `MAP_SHARED` file-backed mappings and
//! process-shared pthread primitives are load-bearing here.

pub mod errors;
mod queue;
mod ring;
mod segment;
mod sync;

pub use errors::HyperQError;
pub use queue::{HyperQueue, QueueConfig, QueueConfigBuilder, DEFAULT_CAPACITY};
pub use ring::MAX_CAPACITY;

/// Remove a named segment from the kernel namespace without attaching.
///
/// Intended for operators cleaning up after a fleet that died abruptly,
/// where the refcounted teardown never ran. Returns whether a segment by
/// that name existed. Handles still mapping the old segment keep working
/// against the now-anonymous memory; new opens under the name create a
/// fresh queue.
pub fn force_unlink(name: &str) -> Result<bool, HyperQError> {
    let (kernel_name, _) = segment::normalize_name(name)?;
    segment::force_unlink(&kernel_name)
}

#[cfg(test)]
mod tests;
