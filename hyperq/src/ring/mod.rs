//! The ring engine: header layout, refcounted handle lifecycle and the
//! blocking enqueue/dequeue algorithms.
//!
//! All queue state lives in the segment's header page. Mutations of
//! `head`/`tail`/`count` and of the buffer happen only under the embedded
//! process-shared mutex; `refcount` is the single field touched outside it,
//! always via atomic acq-rel increments and decrements. Messages are framed
//! as a 4-byte little-endian length followed by the payload, and thanks to
//! the doubled capacity mapping a frame is always one contiguous copy even
//! when it wraps the logical end of the ring.

use std::process;
use std::ptr::{self, addr_of_mut, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::errors::HyperQError;
use crate::segment::{self, Segment, HEADER_SIZE};
use crate::sync::{SharedCondvar, SharedMutex};

/// Identifies an initialized HyperQ segment header.
const RING_MAGIC: u32 = 0x4851_5931;

/// Upper bound on a queue's byte capacity.
pub const MAX_CAPACITY: usize = 1 << 30;

/// Bytes of framing in front of every payload.
const FRAME_LEN: usize = 4;

/// How long an attacher spins for the creator to publish the magic.
const MAGIC_TIMEOUT: Duration = Duration::from_millis(100);
const MAGIC_POLL: Duration = Duration::from_millis(1);

static NAME_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Fixed-layout header at offset 0 of the segment.
///
/// `magic` is written last by the creator with release ordering and read
/// with acquire ordering by attachers, publishing every other field. The
/// pthread primitives are initialized in place with the process-shared
/// attribute and never move for the life of the segment.
#[repr(C)]
struct Header {
    magic: AtomicU32,
    _pad: u32,
    capacity: u64,
    head: u64,
    tail: u64,
    count: u64,
    refcount: AtomicU32,
    _pad2: u32,
    mutex: libc::pthread_mutex_t,
    not_full: libc::pthread_cond_t,
    not_empty: libc::pthread_cond_t,
}

const _: () = assert!(std::mem::size_of::<Header>() <= HEADER_SIZE);

/// A per-process handle onto a named ring.
///
/// Construction creates or attaches the segment; every live handle holds
/// one unit of the shared `refcount`, and the handle that drops it to zero
/// destroys the embedded primitives and unlinks the kernel name.
pub(crate) struct RingHandle {
    segment: Segment,
    hdr: NonNull<Header>,
    data: NonNull<u8>,
    mutex: SharedMutex,
    not_full: SharedCondvar,
    not_empty: SharedCondvar,
    name: String,
    capacity: usize,
}

// SAFETY: every mutation of the shared state is serialized by the embedded
// process-shared mutex, and refcount is atomic. The raw pointers only ever
// target the segment mapping, which outlives the handle.
unsafe impl Send for RingHandle {}
unsafe impl Sync for RingHandle {}

impl RingHandle {
    /// Open the named ring, creating the segment when the name is free and
    /// attaching otherwise. A missing name is synthesized from the process
    /// id so it stays unique and within the name length limit.
    pub(crate) fn open(requested_capacity: u64, name: Option<&str>) -> Result<RingHandle, HyperQError> {
        let capacity = validate_capacity(requested_capacity)?;
        let (kernel_name, display_name) = match name {
            Some(n) => segment::normalize_name(n)?,
            None => {
                let synthesized =
                    format!("hq-{}-{}", process::id(), NAME_COUNTER.fetch_add(1, Ordering::Relaxed));
                segment::normalize_name(&synthesized)?
            }
        };

        let mut segment = Segment::create_or_attach(&kernel_name, capacity)?;
        // SAFETY: both pointers derive from the segment's mapping base,
        // which mmap never returns as null.
        let hdr = unsafe { NonNull::new_unchecked(segment.header_ptr() as *mut Header) };
        let data = unsafe { NonNull::new_unchecked(segment.data_ptr()) };

        let (mutex, not_full, not_empty) = if segment.created() {
            match unsafe { init_header(hdr, segment.capacity()) } {
                Ok(primitives) => {
                    tracing::debug!(
                        name = %display_name,
                        capacity = segment.capacity(),
                        "created queue segment"
                    );
                    primitives
                }
                Err(e) => {
                    segment.request_unlink();
                    return Err(e);
                }
            }
        } else {
            let primitives = unsafe { attach_header(hdr, &segment, &display_name)? };
            tracing::debug!(name = %display_name, "attached to queue segment");
            primitives
        };

        let capacity = segment.capacity();
        Ok(RingHandle {
            segment,
            hdr,
            data,
            mutex,
            not_full,
            not_empty,
            name: display_name,
            capacity,
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Block until the framed message fits, then commit it.
    pub(crate) fn put(&self, data: &[u8]) -> Result<(), HyperQError> {
        if data.is_empty() {
            return Err(HyperQError::invalid("cannot enqueue an empty message"));
        }
        let need = FRAME_LEN + data.len();
        if need > self.capacity {
            return Err(HyperQError::MessageTooLarge {
                len: data.len(),
                capacity: self.capacity,
            });
        }

        let hdr = self.hdr.as_ptr();
        let guard = self.mutex.lock()?;
        unsafe {
            while (*hdr).count + need as u64 > self.capacity as u64 {
                self.not_full.wait(&guard)?;
            }

            let tail = (*hdr).tail as usize;
            let frame = (data.len() as u32).to_le_bytes();
            let dst = self.data.as_ptr().add(tail);
            // One contiguous store each, even across the logical boundary.
            ptr::copy_nonoverlapping(frame.as_ptr(), dst, FRAME_LEN);
            ptr::copy_nonoverlapping(data.as_ptr(), dst.add(FRAME_LEN), data.len());

            (*hdr).tail = (tail as u64 + need as u64) % self.capacity as u64;
            (*hdr).count += need as u64;
        }
        self.not_empty.signal();
        drop(guard);
        Ok(())
    }

    /// Block until a message is available, then return it and advance.
    pub(crate) fn get(&self) -> Result<Vec<u8>, HyperQError> {
        let hdr = self.hdr.as_ptr();
        let guard = self.mutex.lock()?;
        let message = unsafe {
            while (*hdr).count == 0 {
                self.not_empty.wait(&guard)?;
            }

            let head = (*hdr).head as usize;
            let src = self.data.as_ptr().add(head);
            let mut frame = [0u8; FRAME_LEN];
            ptr::copy_nonoverlapping(src, frame.as_mut_ptr(), FRAME_LEN);
            let len = u32::from_le_bytes(frame) as usize;

            let need = FRAME_LEN + len;
            if need as u64 > (*hdr).count || need > self.capacity {
                return Err(HyperQError::CorruptState(format!(
                    "length prefix {} at head {} overruns live data ({} bytes stored)",
                    len,
                    head,
                    (*hdr).count
                )));
            }

            let mut out = vec![0u8; len];
            ptr::copy_nonoverlapping(src.add(FRAME_LEN), out.as_mut_ptr(), len);

            (*hdr).head = (head as u64 + need as u64) % self.capacity as u64;
            (*hdr).count -= need as u64;
            out
        };
        self.not_full.signal();
        drop(guard);
        Ok(message)
    }

    pub(crate) fn empty(&self) -> Result<bool, HyperQError> {
        let _guard = self.mutex.lock()?;
        Ok(unsafe { (*self.hdr.as_ptr()).count == 0 })
    }

    /// Full means not even a one-byte message would fit right now.
    pub(crate) fn full(&self) -> Result<bool, HyperQError> {
        let _guard = self.mutex.lock()?;
        Ok(unsafe { (*self.hdr.as_ptr()).count + (FRAME_LEN as u64 + 1) > self.capacity as u64 })
    }

    /// Bytes currently stored, frames included.
    pub(crate) fn size(&self) -> Result<u64, HyperQError> {
        let _guard = self.mutex.lock()?;
        Ok(unsafe { (*self.hdr.as_ptr()).count })
    }

    /// Drop every stored message and wake all blocked producers.
    pub(crate) fn clear(&self) -> Result<(), HyperQError> {
        let hdr = self.hdr.as_ptr();
        let guard = self.mutex.lock()?;
        unsafe {
            (*hdr).head = 0;
            (*hdr).tail = 0;
            (*hdr).count = 0;
        }
        self.not_full.broadcast();
        drop(guard);
        Ok(())
    }
}

impl Drop for RingHandle {
    fn drop(&mut self) {
        let refcount = unsafe { &(*self.hdr.as_ptr()).refcount };
        let previous = refcount.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            // Last handle out tears the segment down for everyone.
            unsafe {
                self.mutex.destroy();
                self.not_full.destroy();
                self.not_empty.destroy();
            }
            self.segment.request_unlink();
            tracing::debug!(name = %self.name, "last handle detached, unlinking segment");
        } else {
            tracing::debug!(name = %self.name, remaining = previous - 1, "handle detached");
        }
    }
}

fn validate_capacity(requested: u64) -> Result<usize, HyperQError> {
    if requested == 0 {
        return Err(HyperQError::invalid("capacity must be greater than zero"));
    }
    if requested > MAX_CAPACITY as u64 {
        return Err(HyperQError::invalid(format!(
            "capacity {} exceeds the maximum of {} bytes",
            requested, MAX_CAPACITY
        )));
    }
    let page = segment::page_size() as u64;
    let rounded = requested.div_ceil(page) * page;
    Ok(rounded as usize)
}

/// Creator-side header setup. Every field is written before the magic is
/// published with release ordering.
unsafe fn init_header(
    hdr: NonNull<Header>,
    capacity: usize,
) -> Result<(SharedMutex, SharedCondvar, SharedCondvar), HyperQError> {
    let hdr = hdr.as_ptr();
    (*hdr).capacity = capacity as u64;
    (*hdr).head = 0;
    (*hdr).tail = 0;
    (*hdr).count = 0;
    (*hdr).refcount.store(1, Ordering::Relaxed);

    let mutex = SharedMutex::init_at(addr_of_mut!((*hdr).mutex))?;
    let not_full = SharedCondvar::init_at(addr_of_mut!((*hdr).not_full))?;
    let not_empty = SharedCondvar::init_at(addr_of_mut!((*hdr).not_empty))?;

    (*hdr).magic.store(RING_MAGIC, Ordering::Release);
    Ok((mutex, not_full, not_empty))
}

/// Attacher-side header adoption: spin for the magic within a bounded
/// window (the segment can exist before its creator finishes writing the
/// header), cross-check the capacity against the mapping, then join the
/// refcount.
unsafe fn attach_header(
    hdr: NonNull<Header>,
    segment: &Segment,
    display_name: &str,
) -> Result<(SharedMutex, SharedCondvar, SharedCondvar), HyperQError> {
    let hdr = hdr.as_ptr();
    let deadline = Instant::now() + MAGIC_TIMEOUT;
    while (*hdr).magic.load(Ordering::Acquire) != RING_MAGIC {
        if Instant::now() >= deadline {
            return Err(HyperQError::NotInitialized {
                name: display_name.to_string(),
            });
        }
        thread::sleep(MAGIC_POLL);
    }

    if (*hdr).capacity != segment.capacity() as u64 {
        return Err(HyperQError::CorruptState(format!(
            "header capacity {} disagrees with segment size-derived capacity {}",
            (*hdr).capacity,
            segment.capacity()
        )));
    }

    (*hdr).refcount.fetch_add(1, Ordering::AcqRel);

    let mutex = SharedMutex::from_raw(addr_of_mut!((*hdr).mutex));
    let not_full = SharedCondvar::from_raw(addr_of_mut!((*hdr).not_full));
    let not_empty = SharedCondvar::from_raw(addr_of_mut!((*hdr).not_empty));
    Ok((mutex, not_full, not_empty))
}
