//! Process-shared pthread primitives placed inside the shared segment.
//!
//! The mutex and condition variables live in memory mapped by several
//! processes at once, so they are initialized in place with the
//! `PTHREAD_PROCESS_SHARED` attribute and never copied or moved after
//! placement. The wrappers here hold only a raw pointer into the segment;
//! whoever owns the mapping owns their lifetime.

use std::mem::MaybeUninit;

use nix::errno::Errno;

use crate::errors::HyperQError;

fn check(op: &'static str, rc: libc::c_int) -> Result<(), HyperQError> {
    if rc == 0 {
        Ok(())
    } else {
        Err(HyperQError::os(op, Errno::from_raw(rc)))
    }
}

/// A `pthread_mutex_t` embedded in shared memory.
///
/// On Linux the mutex is also marked robust, so a lock owner dying does not
/// wedge the queue forever; the next acquirer observes [`HyperQError::OwnerDied`].
pub(crate) struct SharedMutex {
    raw: *mut libc::pthread_mutex_t,
}

impl SharedMutex {
    /// Initialize the mutex at `raw` with the process-shared attribute.
    ///
    /// # Safety
    /// `raw` must point to writable memory large enough for a
    /// `pthread_mutex_t` that no other thread or process is using yet.
    pub(crate) unsafe fn init_at(raw: *mut libc::pthread_mutex_t) -> Result<SharedMutex, HyperQError> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check("pthread_mutexattr_init", libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;

        let mut rc = libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        let mut op = "pthread_mutexattr_setpshared";
        #[cfg(target_os = "linux")]
        if rc == 0 {
            rc = libc::pthread_mutexattr_setrobust(attr.as_mut_ptr(), libc::PTHREAD_MUTEX_ROBUST);
            op = "pthread_mutexattr_setrobust";
        }
        if rc == 0 {
            rc = libc::pthread_mutex_init(raw, attr.as_ptr());
            op = "pthread_mutex_init";
        }
        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        check(op, rc)?;
        Ok(SharedMutex { raw })
    }

    /// Wrap a mutex some other process already initialized.
    ///
    /// # Safety
    /// `raw` must point to a live, initialized process-shared mutex.
    pub(crate) unsafe fn from_raw(raw: *mut libc::pthread_mutex_t) -> SharedMutex {
        SharedMutex { raw }
    }

    pub(crate) fn lock(&self) -> Result<SharedMutexGuard<'_>, HyperQError> {
        let rc = unsafe { libc::pthread_mutex_lock(self.raw) };
        match rc {
            0 => Ok(SharedMutexGuard { mutex: self }),
            libc::EOWNERDEAD => {
                // The dead owner may have left head/tail/count mid-update.
                // Mark the mutex usable again and report to the caller.
                unsafe {
                    #[cfg(target_os = "linux")]
                    libc::pthread_mutex_consistent(self.raw);
                    libc::pthread_mutex_unlock(self.raw);
                }
                Err(HyperQError::OwnerDied)
            }
            rc => Err(HyperQError::os("pthread_mutex_lock", Errno::from_raw(rc))),
        }
    }

    /// # Safety
    /// Only the last detacher may destroy, and only with no waiters left.
    pub(crate) unsafe fn destroy(&self) {
        libc::pthread_mutex_destroy(self.raw);
    }
}

pub(crate) struct SharedMutexGuard<'a> {
    mutex: &'a SharedMutex,
}

impl SharedMutexGuard<'_> {
    fn mutex_ptr(&self) -> *mut libc::pthread_mutex_t {
        self.mutex.raw
    }
}

impl Drop for SharedMutexGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.mutex.raw);
        }
    }
}

/// A `pthread_cond_t` embedded in shared memory next to its mutex.
pub(crate) struct SharedCondvar {
    raw: *mut libc::pthread_cond_t,
}

impl SharedCondvar {
    /// # Safety
    /// Same contract as [`SharedMutex::init_at`].
    pub(crate) unsafe fn init_at(raw: *mut libc::pthread_cond_t) -> Result<SharedCondvar, HyperQError> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        check("pthread_condattr_init", libc::pthread_condattr_init(attr.as_mut_ptr()))?;

        let mut rc = libc::pthread_condattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        let mut op = "pthread_condattr_setpshared";
        if rc == 0 {
            rc = libc::pthread_cond_init(raw, attr.as_ptr());
            op = "pthread_cond_init";
        }
        libc::pthread_condattr_destroy(attr.as_mut_ptr());
        check(op, rc)?;
        Ok(SharedCondvar { raw })
    }

    /// # Safety
    /// `raw` must point to a live, initialized process-shared condvar.
    pub(crate) unsafe fn from_raw(raw: *mut libc::pthread_cond_t) -> SharedCondvar {
        SharedCondvar { raw }
    }

    /// Atomically release the guarded mutex and sleep until signaled.
    /// The mutex is re-acquired before this returns.
    pub(crate) fn wait(&self, guard: &SharedMutexGuard<'_>) -> Result<(), HyperQError> {
        let rc = unsafe { libc::pthread_cond_wait(self.raw, guard.mutex_ptr()) };
        match rc {
            0 => Ok(()),
            libc::EOWNERDEAD => {
                unsafe {
                    #[cfg(target_os = "linux")]
                    libc::pthread_mutex_consistent(guard.mutex_ptr());
                }
                // The guard still owns the lock and will unlock on drop.
                Err(HyperQError::OwnerDied)
            }
            rc => Err(HyperQError::os("pthread_cond_wait", Errno::from_raw(rc))),
        }
    }

    pub(crate) fn signal(&self) {
        unsafe {
            libc::pthread_cond_signal(self.raw);
        }
    }

    pub(crate) fn broadcast(&self) {
        unsafe {
            libc::pthread_cond_broadcast(self.raw);
        }
    }

    /// # Safety
    /// Same contract as [`SharedMutex::destroy`].
    pub(crate) unsafe fn destroy(&self) {
        libc::pthread_cond_destroy(self.raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    // Heap-backed storage standing in for the shared segment. The primitives
    // stay valid as long as the boxes are alive, even if the harness moves.
    struct Harness {
        _mutex_cell: Box<libc::pthread_mutex_t>,
        _cond_cell: Box<libc::pthread_cond_t>,
        mutex: SharedMutex,
        cond: SharedCondvar,
        value: std::cell::UnsafeCell<u64>,
    }

    unsafe impl Send for Harness {}
    unsafe impl Sync for Harness {}

    impl Harness {
        fn new() -> Harness {
            let mut mutex_cell: Box<libc::pthread_mutex_t> = Box::new(unsafe { mem::zeroed() });
            let mut cond_cell: Box<libc::pthread_cond_t> = Box::new(unsafe { mem::zeroed() });
            let mutex = unsafe { SharedMutex::init_at(&mut *mutex_cell).unwrap() };
            let cond = unsafe { SharedCondvar::init_at(&mut *cond_cell).unwrap() };
            Harness {
                _mutex_cell: mutex_cell,
                _cond_cell: cond_cell,
                mutex,
                cond,
                value: std::cell::UnsafeCell::new(0),
            }
        }
    }

    #[test]
    fn lock_serializes_counter_updates() {
        let harness = Arc::new(Harness::new());
        let threads = 8;
        let per_thread = 1000u64;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let harness = Arc::clone(&harness);
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        let guard = harness.mutex.lock().unwrap();
                        unsafe {
                            *harness.value.get() += 1;
                        }
                        drop(guard);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let guard = harness.mutex.lock().unwrap();
        assert_eq!(unsafe { *harness.value.get() }, threads as u64 * per_thread);
        drop(guard);
    }

    #[test]
    fn wait_wakes_on_signal() {
        let harness = Arc::new(Harness::new());

        let waiter = {
            let harness = Arc::clone(&harness);
            thread::spawn(move || {
                let guard = harness.mutex.lock().unwrap();
                while unsafe { *harness.value.get() } == 0 {
                    harness.cond.wait(&guard).unwrap();
                }
                unsafe { *harness.value.get() }
            })
        };

        thread::sleep(Duration::from_millis(50));
        {
            let _guard = harness.mutex.lock().unwrap();
            unsafe {
                *harness.value.get() = 7;
            }
            harness.cond.signal();
        }
        assert_eq!(waiter.join().unwrap(), 7);
    }

    #[test]
    fn broadcast_wakes_every_waiter() {
        let harness = Arc::new(Harness::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let harness = Arc::clone(&harness);
                thread::spawn(move || {
                    let guard = harness.mutex.lock().unwrap();
                    while unsafe { *harness.value.get() } == 0 {
                        harness.cond.wait(&guard).unwrap();
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        {
            let _guard = harness.mutex.lock().unwrap();
            unsafe {
                *harness.value.get() = 1;
            }
            harness.cond.broadcast();
        }
        for w in waiters {
            w.join().unwrap();
        }
    }
}
