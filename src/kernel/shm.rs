//! Process-shared memory objects.
//!
//! A [`SynchronizedObject`] is an anonymous `MAP_SHARED` mapping holding a
//! process-shared POSIX semaphore header followed by one value of `T`. The
//! mapping survives `fork()`, so every worker forked after creation sees the
//! same bytes and the same lock.
//!
//! All `unsafe` for the mapping is concentrated here.

use crate::config::types::{Result, StateManagerError};
use log::{debug, error};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Types that may live in a mapping shared between processes.
///
/// # Safety
/// Implementors must be `#[repr(C)]`, contain no pointers, references or
/// heap-owning fields, and must not rely on `Drop`.
pub unsafe trait ShmSafe: Default {}

#[repr(C)]
struct SyncHeader {
    lock: libc::sem_t,
}

/// Shared buffer that every worker process can lock and read/write.
pub struct SynchronizedObject<T: ShmSafe> {
    base: NonNull<u8>,
    len: usize,
    data_offset: usize,
    _marker: PhantomData<T>,
}

// SAFETY: access to `T` is serialised by the process-shared semaphore; the
// mapping itself is plain memory with no thread affinity.
unsafe impl<T: ShmSafe + Send> Send for SynchronizedObject<T> {}
unsafe impl<T: ShmSafe + Send> Sync for SynchronizedObject<T> {}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

impl<T: ShmSafe> SynchronizedObject<T> {
    /// Map a fresh shared region and initialise `T::default()` in place.
    pub fn new() -> Result<Self> {
        let data_offset = round_up(
            std::mem::size_of::<SyncHeader>(),
            std::mem::align_of::<T>().max(16),
        );
        let len = data_offset + std::mem::size_of::<T>();

        // SAFETY: anonymous mapping, no fd, kernel chooses the address.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(StateManagerError::SharedMemory(format!(
                "mmap({} bytes) failed: {}",
                len,
                std::io::Error::last_os_error()
            )));
        }
        let base = NonNull::new(addr as *mut u8).ok_or_else(|| {
            StateManagerError::SharedMemory("mmap returned a null mapping".to_string())
        })?;

        // SAFETY: the header sits at offset 0 of a fresh mapping of `len` bytes;
        // pshared=1 makes the semaphore usable across fork().
        let rc = unsafe { libc::sem_init(base.as_ptr() as *mut libc::sem_t, 1, 1) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: unmapping the region we just created.
            unsafe { libc::munmap(addr, len) };
            return Err(StateManagerError::Semaphore(format!("sem_init failed: {}", err)));
        }

        // SAFETY: data_offset is aligned for T and inside the mapping.
        unsafe {
            std::ptr::write(base.as_ptr().add(data_offset) as *mut T, T::default());
        }

        debug!(
            "Mapped shared object of {} bytes ({} payload)",
            len,
            std::mem::size_of::<T>()
        );

        Ok(Self {
            base,
            len,
            data_offset,
            _marker: PhantomData,
        })
    }

    fn header(&self) -> *mut libc::sem_t {
        self.base.as_ptr() as *mut libc::sem_t
    }

    fn data(&self) -> *mut T {
        // SAFETY: offset computed at construction, within the mapping.
        unsafe { self.base.as_ptr().add(self.data_offset) as *mut T }
    }

    /// Block until the segment lock is held.
    pub fn acquire(&self) -> SegmentGuard<'_, T> {
        loop {
            // SAFETY: header initialised by sem_init in new().
            let rc = unsafe { libc::sem_wait(self.header()) };
            if rc == 0 {
                return SegmentGuard::new(self);
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            error!("sem_wait on shared segment failed: {}", err);
            panic!("shared segment semaphore is unusable: {}", err);
        }
    }

    /// Non-blocking variant of [`acquire`](Self::acquire); `None` when another
    /// process holds the lock.
    pub fn try_acquire(&self) -> Option<SegmentGuard<'_, T>> {
        loop {
            // SAFETY: header initialised by sem_init in new().
            let rc = unsafe { libc::sem_trywait(self.header()) };
            if rc == 0 {
                return Some(SegmentGuard::new(self));
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return None,
                _ => {
                    error!("sem_trywait on shared segment failed: {}", err);
                    panic!("shared segment semaphore is unusable: {}", err);
                }
            }
        }
    }

    fn release(&self) {
        // SAFETY: only called from SegmentGuard::drop, which owns one unit.
        let rc = unsafe { libc::sem_post(self.header()) };
        if rc != 0 {
            error!(
                "sem_post on shared segment failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

impl<T: ShmSafe> Drop for SynchronizedObject<T> {
    fn drop(&mut self) {
        // The semaphore is not destroyed: other processes may still use it.
        // SAFETY: base/len describe the mapping created in new().
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

impl<T: ShmSafe> fmt::Debug for SynchronizedObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizedObject")
            .field("len", &self.len)
            .field("data_offset", &self.data_offset)
            .finish()
    }
}

/// RAII proof that the segment lock is held; releases on drop.
pub struct SegmentGuard<'a, T: ShmSafe> {
    object: &'a SynchronizedObject<T>,
    // The unlock must happen in the process that took the lock.
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ShmSafe> SegmentGuard<'a, T> {
    fn new(object: &'a SynchronizedObject<T>) -> Self {
        Self {
            object,
            _not_send: PhantomData,
        }
    }

    /// Explicit release, same as dropping the guard.
    pub fn release(self) {}
}

impl<T: ShmSafe> Deref for SegmentGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the semaphore grants exclusive access while the guard lives.
        unsafe { &*self.object.data() }
    }
}

impl<T: ShmSafe> DerefMut for SegmentGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above.
        unsafe { &mut *self.object.data() }
    }
}

impl<T: ShmSafe> Drop for SegmentGuard<'_, T> {
    fn drop(&mut self) {
        self.object.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[repr(C)]
    #[derive(Default)]
    struct Tally {
        hits: u64,
        slots: [u32; 4],
    }

    unsafe impl ShmSafe for Tally {}

    #[test]
    fn test_fresh_object_is_default() {
        let obj = SynchronizedObject::<Tally>::new().unwrap();
        let guard = obj.acquire();
        assert_eq!(guard.hits, 0);
        assert_eq!(guard.slots, [0; 4]);
    }

    #[test]
    fn test_try_acquire_fails_while_held() {
        let obj = SynchronizedObject::<Tally>::new().unwrap();
        let guard = obj.acquire();
        assert!(obj.try_acquire().is_none());
        guard.release();
        assert!(obj.try_acquire().is_some());
    }

    #[test]
    fn test_writes_visible_to_next_holder() {
        let obj = SynchronizedObject::<Tally>::new().unwrap();
        {
            let mut guard = obj.acquire();
            guard.hits = 7;
            guard.slots[2] = 3;
        }
        let guard = obj.acquire();
        assert_eq!(guard.hits, 7);
        assert_eq!(guard.slots[2], 3);
    }

    #[test]
    fn test_lock_serialises_threads() {
        let obj = Arc::new(SynchronizedObject::<Tally>::new().unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let obj = Arc::clone(&obj);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut guard = obj.acquire();
                        let current = guard.hits;
                        std::thread::yield_now();
                        guard.hits = current + 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(obj.acquire().hits, 4000);
    }
}
