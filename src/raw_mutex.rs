// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// A `pthread_mutex_t` embedded directly at a fixed offset inside a larger
// shared-memory region, rather than behind its own named segment. The shared
// state in `state.rs` needs on the order of a thousand independent locks
// (one per account, one per room, plus the table/chat/txn locks); opening
// that many separate named shm segments would multiply `shm_open` calls for
// no benefit once everything already lives in one mapping. Lock/unlock
// semantics (process-shared, robust, EOWNERDEAD recovery) mirror the
// reference implementation's own mutex handling.

use std::cell::UnsafeCell;
use std::io;
use std::mem::MaybeUninit;

#[cfg(not(target_os = "macos"))]
const EOWNERDEAD: i32 = libc::EOWNERDEAD;

#[cfg(not(target_os = "macos"))]
extern "C" {
    fn pthread_mutexattr_setrobust(
        attr: *mut libc::pthread_mutexattr_t,
        robustness: libc::c_int,
    ) -> libc::c_int;
    fn pthread_mutex_consistent(mutex: *mut libc::pthread_mutex_t) -> libc::c_int;
}

#[cfg(not(target_os = "macos"))]
const PTHREAD_MUTEX_ROBUST: libc::c_int = 1;

/// An in-place, process-shared, robust mutex. Must live inside memory mapped
/// `MAP_SHARED` by every process that touches it; `init_process_shared` is
/// called exactly once, by whichever process performs first-time shared-state
/// initialization.
#[repr(transparent)]
pub struct RawMutex {
    inner: UnsafeCell<MaybeUninit<libc::pthread_mutex_t>>,
}

// Safety: the mutex is designed for concurrent cross-process access; callers
// serialize access to the data it guards through lock()/unlock().
unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    fn ptr(&self) -> *mut libc::pthread_mutex_t {
        self.inner.get() as *mut libc::pthread_mutex_t
    }

    /// Initialize the mutex attributes (`PTHREAD_PROCESS_SHARED` +, where
    /// available, `PTHREAD_MUTEX_ROBUST`) and construct it in place. Must be
    /// called exactly once per mutex, before any process calls `lock`.
    pub fn init_process_shared(&self) -> io::Result<()> {
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            let mut eno = libc::pthread_mutexattr_init(&mut attr);
            if eno != 0 {
                return Err(io::Error::from_raw_os_error(eno));
            }

            eno = libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            if eno != 0 {
                libc::pthread_mutexattr_destroy(&mut attr);
                return Err(io::Error::from_raw_os_error(eno));
            }

            #[cfg(not(target_os = "macos"))]
            {
                eno = pthread_mutexattr_setrobust(&mut attr, PTHREAD_MUTEX_ROBUST);
                if eno != 0 {
                    libc::pthread_mutexattr_destroy(&mut attr);
                    return Err(io::Error::from_raw_os_error(eno));
                }
            }

            eno = libc::pthread_mutex_init(self.ptr(), &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            if eno != 0 {
                return Err(io::Error::from_raw_os_error(eno));
            }
        }
        Ok(())
    }

    /// Lock the mutex (blocking), returning a RAII guard. Handles
    /// `EOWNERDEAD` from a robust mutex by marking it consistent and
    /// proceeding — a worker that died mid-critical-section does not wedge
    /// the remaining workers.
    pub fn lock(&self) -> io::Result<RawMutexGuard<'_>> {
        loop {
            let eno = unsafe { libc::pthread_mutex_lock(self.ptr()) };
            match eno {
                0 => return Ok(RawMutexGuard { mtx: self }),
                #[cfg(not(target_os = "macos"))]
                EOWNERDEAD => {
                    let eno2 = unsafe { pthread_mutex_consistent(self.ptr()) };
                    if eno2 != 0 {
                        return Err(io::Error::from_raw_os_error(eno2));
                    }
                    return Ok(RawMutexGuard { mtx: self });
                }
                libc::EINTR => continue,
                _ => return Err(io::Error::from_raw_os_error(eno)),
            }
        }
    }

    fn unlock(&self) {
        unsafe {
            libc::pthread_mutex_unlock(self.ptr());
        }
    }
}

impl Drop for RawMutex {
    fn drop(&mut self) {
        // Deliberately not calling pthread_mutex_destroy: on macOS the
        // backing page may be recycled to a different mapping after munmap,
        // and destroy would scribble over whatever now lives at that
        // address. munmap (performed by the owning ShmHandle) is sufficient.
    }
}

/// RAII guard returned by `RawMutex::lock`; unlocks on drop.
pub struct RawMutexGuard<'a> {
    mtx: &'a RawMutex,
}

impl Drop for RawMutexGuard<'_> {
    fn drop(&mut self) {
        self.mtx.unlock();
    }
}
