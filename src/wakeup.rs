// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-worker wakeup primitive: an eventfd counter on Linux, a pipe pair
// elsewhere. Created once by the supervisor before forking; every worker
// inherits both ends across fork and uses them only to nudge each other's
// event loop — the chat-ring cursor, not the wakeup count, is the
// authoritative source of new events, so coalesced or spurious wakeups are
// harmless.

use std::io;
use std::os::fd::RawFd;

#[cfg(target_os = "linux")]
pub struct Wakeup {
    fd: RawFd,
}

#[cfg(target_os = "linux")]
impl Wakeup {
    pub fn create() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn read_fd(&self) -> RawFd {
        self.fd
    }

    /// Add 1 to the eventfd counter, waking any worker blocked in epoll.
    pub fn notify(&self) -> io::Result<()> {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::WouldBlock {
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drain the counter back to zero. Safe to call even if nothing is
    /// pending (returns immediately on EAGAIN).
    pub fn drain(&self) -> io::Result<()> {
        let mut buf: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd,
                &mut buf as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::WouldBlock {
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Drop for Wakeup {
    fn drop(&mut self) {
        #[cfg(target_os = "linux")]
        unsafe {
            libc::close(self.fd);
        }
        #[cfg(not(target_os = "linux"))]
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub struct Wakeup {
    read_fd: RawFd,
    write_fd: RawFd,
}

#[cfg(not(target_os = "linux"))]
impl Wakeup {
    pub fn create() -> io::Result<Self> {
        let mut fds: [libc::c_int; 2] = [0; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            unsafe {
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub fn notify(&self) -> io::Result<()> {
        let byte: u8 = 1;
        let n = unsafe {
            libc::write(
                self.write_fd,
                &byte as *const u8 as *const libc::c_void,
                1,
            )
        };
        if n < 0 {
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::WouldBlock {
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn drain(&self) -> io::Result<()> {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::WouldBlock {
                    return Ok(());
                }
                return Err(e);
            }
            if (n as usize) < buf.len() {
                return Ok(());
            }
        }
    }
}
