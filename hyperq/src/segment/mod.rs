//! Named POSIX shared-memory segments with a doubled capacity mapping.
//!
//! A segment is laid out as one header page followed by the capacity region.
//! The capacity region is mapped twice at adjacent virtual addresses over
//! the same file offset, so a read or write of up to `capacity` bytes
//! starting anywhere inside the first mapping is always contiguous even
//! when the ring position wraps. The trick is a reserve-then-replace dance:
//! an anonymous `PROT_NONE` reservation pins the whole address range, then
//! three `MAP_FIXED` shared mappings overwrite it in place.

use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, mmap_anonymous, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::{fstat, Mode};
use nix::unistd::ftruncate;

use crate::errors::HyperQError;

/// One page. The capacity region must start at a page-aligned file offset,
/// and a page comfortably holds every header field plus the embedded
/// pthread primitives.
pub(crate) const HEADER_SIZE: usize = 4096;

/// Longest accepted user-supplied segment name, in bytes.
pub(crate) const NAME_MAX: usize = 30;

/// How long an attacher waits for the creator to size and publish the
/// segment before giving up.
const INIT_TIMEOUT: Duration = Duration::from_millis(100);
const INIT_POLL: Duration = Duration::from_millis(1);

pub(crate) fn page_size() -> usize {
    // sysconf(_SC_PAGESIZE) cannot fail on any supported platform.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Split a user-supplied name into the kernel form (leading slash) and the
/// display form (no slash). Rejects empty names, names over [`NAME_MAX`]
/// bytes and names with interior slashes.
pub(crate) fn normalize_name(user: &str) -> Result<(String, String), HyperQError> {
    if user.len() > NAME_MAX {
        return Err(HyperQError::invalid(format!(
            "segment name '{}' exceeds {} bytes",
            user, NAME_MAX
        )));
    }
    let display = user.strip_prefix('/').unwrap_or(user);
    if display.is_empty() {
        return Err(HyperQError::invalid("segment name must not be empty"));
    }
    if display.contains('/') {
        return Err(HyperQError::invalid(format!(
            "segment name '{}' must not contain interior '/'",
            user
        )));
    }
    Ok((format!("/{}", display), display.to_string()))
}

/// Remove a named segment from the kernel namespace regardless of state.
/// Returns whether a segment by that name existed.
pub(crate) fn force_unlink(kernel_name: &str) -> Result<bool, HyperQError> {
    match shm_unlink(kernel_name) {
        Ok(()) => Ok(true),
        Err(Errno::ENOENT) => Ok(false),
        Err(e) => Err(HyperQError::os("shm_unlink", e)),
    }
}

/// A mapped segment: the header page plus the doubled capacity region.
///
/// Dropping unmaps the whole reserved range. The name is unlinked on drop
/// only after [`Segment::request_unlink`], which the handle layer calls for
/// the last detacher and for a creator whose initialization failed.
pub(crate) struct Segment {
    base: NonNull<libc::c_void>,
    total_len: usize,
    capacity: usize,
    kernel_name: String,
    created: bool,
    unlink_on_drop: bool,
}

impl Segment {
    /// Open the named segment, creating it when absent.
    ///
    /// `capacity` must already be validated and page-rounded by the caller;
    /// it only applies when this call ends up creating the segment. When
    /// attaching, the real capacity is recovered from the object size.
    pub(crate) fn create_or_attach(kernel_name: &str, capacity: usize) -> Result<Segment, HyperQError> {
        let (fd, created) = match shm_open(
            kernel_name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        ) {
            Ok(fd) => (fd, true),
            Err(Errno::EEXIST) => {
                let fd = shm_open(kernel_name, OFlag::O_RDWR, Mode::empty())
                    .map_err(|e| HyperQError::os("shm_open", e))?;
                (fd, false)
            }
            Err(e) => return Err(HyperQError::os("shm_open", e)),
        };

        let capacity = if created {
            if let Err(e) = ftruncate(&fd, (HEADER_SIZE + capacity) as libc::off_t) {
                let _ = shm_unlink(kernel_name);
                return Err(HyperQError::os("ftruncate", e));
            }
            capacity
        } else {
            wait_for_size(&fd, kernel_name)?
        };

        let total_len = HEADER_SIZE + 2 * capacity;
        let base = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(total_len).unwrap(),
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|e| {
            if created {
                let _ = shm_unlink(kernel_name);
            }
            match e {
                Errno::ENOMEM => HyperQError::os("mmap (address space reservation)", e),
                e => HyperQError::os("mmap", e),
            }
        })?;

        // Replace the reservation: header page at offset 0, then the
        // capacity region twice, both backed by the same file offset.
        let mappings = [
            (0usize, HEADER_SIZE, 0usize),
            (HEADER_SIZE, capacity, HEADER_SIZE),
            (HEADER_SIZE + capacity, capacity, HEADER_SIZE),
        ];
        for (region_off, len, file_off) in mappings {
            let addr = NonZeroUsize::new(base.as_ptr() as usize + region_off).unwrap();
            let mapped = unsafe {
                mmap(
                    Some(addr),
                    NonZeroUsize::new(len).unwrap(),
                    ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                    MapFlags::MAP_SHARED | MapFlags::MAP_FIXED,
                    &fd,
                    file_off as libc::off_t,
                )
            };
            if let Err(e) = mapped {
                unsafe {
                    let _ = munmap(base, total_len);
                }
                if created {
                    let _ = shm_unlink(kernel_name);
                }
                return Err(HyperQError::os("mmap", e));
            }
        }

        // The mappings keep the object alive; the descriptor is not needed
        // past this point and must not leak into spawned children.
        drop(fd);

        Ok(Segment {
            base,
            total_len,
            capacity,
            kernel_name: kernel_name.to_string(),
            created,
            unlink_on_drop: false,
        })
    }

    pub(crate) fn created(&self) -> bool {
        self.created
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn header_ptr(&self) -> *mut u8 {
        self.base.as_ptr() as *mut u8
    }

    pub(crate) fn data_ptr(&self) -> *mut u8 {
        unsafe { (self.base.as_ptr() as *mut u8).add(HEADER_SIZE) }
    }

    /// Unlink the kernel name when this mapping goes away.
    pub(crate) fn request_unlink(&mut self) {
        self.unlink_on_drop = true;
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base, self.total_len);
        }
        if self.unlink_on_drop {
            let _ = shm_unlink(self.kernel_name.as_str());
        }
    }
}

/// Poll the object size until the creator's `ftruncate` lands. The creator
/// sizes the object in a single call, so any size covering the header is
/// the final one.
fn wait_for_size(fd: &OwnedFd, kernel_name: &str) -> Result<usize, HyperQError> {
    let deadline = Instant::now() + INIT_TIMEOUT;
    loop {
        let stat = fstat(fd.as_raw_fd()).map_err(|e| HyperQError::os("fstat", e))?;
        let size = stat.st_size as usize;
        if size >= HEADER_SIZE + page_size() {
            return Ok(size - HEADER_SIZE);
        }
        if Instant::now() >= deadline {
            return Err(HyperQError::NotInitialized {
                name: kernel_name.trim_start_matches('/').to_string(),
            });
        }
        thread::sleep(INIT_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static TEST_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn unique_name() -> String {
        format!(
            "hqseg-{}-{}",
            process::id(),
            TEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
        )
    }

    #[test]
    fn normalize_accepts_with_and_without_slash() {
        let (kernel, display) = normalize_name("abc").unwrap();
        assert_eq!(kernel, "/abc");
        assert_eq!(display, "abc");
        let (kernel, display) = normalize_name("/abc").unwrap();
        assert_eq!(kernel, "/abc");
        assert_eq!(display, "abc");
    }

    #[test]
    fn normalize_rejects_bad_names() {
        assert!(normalize_name("").is_err());
        assert!(normalize_name("/").is_err());
        assert!(normalize_name("a/b").is_err());
        assert!(normalize_name(&"x".repeat(NAME_MAX + 1)).is_err());
        assert!(normalize_name(&"x".repeat(NAME_MAX)).is_ok());
    }

    #[test]
    fn create_then_attach_shares_pages() {
        let name = unique_name();
        let (kernel, _) = normalize_name(&name).unwrap();
        let capacity = page_size();

        let mut creator = Segment::create_or_attach(&kernel, capacity).unwrap();
        assert!(creator.created());
        assert_eq!(creator.capacity(), capacity);

        let attacher = Segment::create_or_attach(&kernel, capacity).unwrap();
        assert!(!attacher.created());
        assert_eq!(attacher.capacity(), capacity);

        unsafe {
            creator.data_ptr().write(0xAB);
            assert_eq!(attacher.data_ptr().read(), 0xAB);
        }

        creator.request_unlink();
        drop(attacher);
        drop(creator);
    }

    #[test]
    fn second_mapping_aliases_first() {
        let name = unique_name();
        let (kernel, _) = normalize_name(&name).unwrap();
        let capacity = page_size();

        let mut segment = Segment::create_or_attach(&kernel, capacity).unwrap();
        unsafe {
            let data = segment.data_ptr();
            data.add(capacity - 1).write(0x5A);
            assert_eq!(data.add(2 * capacity - 1).read(), 0x5A);

            // And the other direction: a store through the alias shows up
            // in the canonical mapping.
            data.add(capacity + 3).write(0x77);
            assert_eq!(data.add(3).read(), 0x77);
        }
        segment.request_unlink();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unlink_removes_kernel_name() {
        let name = unique_name();
        let (kernel, display) = normalize_name(&name).unwrap();
        let mut segment = Segment::create_or_attach(&kernel, page_size()).unwrap();

        let shm_path = format!("/dev/shm/{}", display);
        assert!(std::path::Path::new(&shm_path).exists());

        segment.request_unlink();
        drop(segment);
        assert!(!std::path::Path::new(&shm_path).exists());
    }

    #[test]
    fn attach_to_missing_name_fails() {
        let name = unique_name();
        let (kernel, _) = normalize_name(&name).unwrap();
        // O_CREAT is always passed, so probe through force_unlink instead.
        assert_eq!(force_unlink(&kernel).unwrap(), false);
    }
}
