// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-worker readiness loop: one process, one thread, no blocking I/O in the
// request path. Multiplexes the shared listening socket, the cross-worker
// wakeup fd, and every accepted connection. On Linux the readiness mechanism
// is epoll; elsewhere it's a portable poll() loop rebuilding its fd set each
// wait — both expose the same `Poller`/`Ready` shape so the loop above them
// is written once.

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::TcpListener;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::handler;
use crate::state::SharedState;
use crate::wakeup::Wakeup;
use crate::wire::{Header, Opcode, Status, FLAG_IS_RESPONSE};

const IDLE_TICK_MS: i32 = 1000;
const BROADCAST_BATCH: usize = 1024;

#[cfg(target_os = "linux")]
mod reactor {
    use std::io;
    use std::os::fd::RawFd;

    #[derive(Clone, Copy)]
    pub struct Ready {
        pub fd: RawFd,
        pub readable: bool,
        pub writable: bool,
        pub hup: bool,
    }

    pub struct Poller {
        epfd: RawFd,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if epfd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { epfd })
        }

        pub fn add(&mut self, fd: RawFd, write_interest: bool) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, write_interest)
        }

        pub fn modify(&mut self, fd: RawFd, write_interest: bool) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_MOD, fd, write_interest)
        }

        pub fn remove(&mut self, fd: RawFd) -> io::Result<()> {
            let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
            if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn ctl(&self, op: libc::c_int, fd: RawFd, write_interest: bool) -> io::Result<()> {
            let mut events = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
            if write_interest {
                events |= libc::EPOLLOUT as u32;
            }
            let mut ev = libc::epoll_event {
                events,
                u64: fd as u64,
            };
            if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn wait(&mut self, timeout_ms: i32) -> io::Result<Vec<Ready>> {
            let mut buf = [unsafe { std::mem::zeroed::<libc::epoll_event>() }; 256];
            let n = unsafe {
                libc::epoll_wait(self.epfd, buf.as_mut_ptr(), buf.len() as i32, timeout_ms)
            };
            if n < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    return Ok(Vec::new());
                }
                return Err(e);
            }
            let mut out = Vec::with_capacity(n as usize);
            for ev in &buf[..n as usize] {
                out.push(Ready {
                    fd: ev.u64 as RawFd,
                    readable: ev.events & (libc::EPOLLIN as u32) != 0,
                    writable: ev.events & (libc::EPOLLOUT as u32) != 0,
                    hup: ev.events
                        & ((libc::EPOLLHUP | libc::EPOLLRDHUP | libc::EPOLLERR) as u32)
                        != 0,
                });
            }
            Ok(out)
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.epfd);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod reactor {
    use std::collections::BTreeMap;
    use std::io;
    use std::os::fd::RawFd;

    #[derive(Clone, Copy)]
    pub struct Ready {
        pub fd: RawFd,
        pub readable: bool,
        pub writable: bool,
        pub hup: bool,
    }

    /// Portable fallback: rebuilds the pollfd set from the interest table on
    /// every wait. Fine for the fd counts a single worker handles; Linux gets
    /// the real epoll path above.
    pub struct Poller {
        interest: BTreeMap<RawFd, bool>,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            Ok(Self {
                interest: BTreeMap::new(),
            })
        }

        pub fn add(&mut self, fd: RawFd, write_interest: bool) -> io::Result<()> {
            self.interest.insert(fd, write_interest);
            Ok(())
        }

        pub fn modify(&mut self, fd: RawFd, write_interest: bool) -> io::Result<()> {
            self.interest.insert(fd, write_interest);
            Ok(())
        }

        pub fn remove(&mut self, fd: RawFd) -> io::Result<()> {
            self.interest.remove(&fd);
            Ok(())
        }

        pub fn wait(&mut self, timeout_ms: i32) -> io::Result<Vec<Ready>> {
            let mut pfds: Vec<libc::pollfd> = self
                .interest
                .iter()
                .map(|(&fd, &w)| {
                    let mut events = libc::POLLIN;
                    if w {
                        events |= libc::POLLOUT;
                    }
                    libc::pollfd {
                        fd,
                        events,
                        revents: 0,
                    }
                })
                .collect();
            let n =
                unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
            if n < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    return Ok(Vec::new());
                }
                return Err(e);
            }
            let mut out = Vec::new();
            for p in pfds {
                if p.revents != 0 {
                    out.push(Ready {
                        fd: p.fd,
                        readable: p.revents & libc::POLLIN != 0,
                        writable: p.revents & libc::POLLOUT != 0,
                        hup: p.revents & (libc::POLLHUP | libc::POLLERR) != 0,
                    });
                }
            }
            Ok(out)
        }
    }
}

fn connection_cap() -> usize {
    let mut rl: libc::rlimit = unsafe { std::mem::zeroed() };
    let nofile = if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) } == 0 {
        rl.rlim_cur as usize
    } else {
        1024
    };
    nofile.min(200_000)
}

/// Runs this worker's event loop until the process is signaled to exit.
/// `listener` must already be bound (and, ideally, `SO_REUSEPORT`-shared
/// across all workers) before `fork`; this function sets it non-blocking.
pub fn run(
    worker_id: usize,
    shared: &'static SharedState,
    listener: TcpListener,
    wakeup: &Wakeup,
    cfg: &Config,
) -> io::Result<()> {
    listener.set_nonblocking(true)?;
    let mut poller = reactor::Poller::new()?;
    poller.add(listener.as_raw_fd(), false)?;
    poller.add(wakeup.read_fd(), false)?;

    let mut connections: HashMap<RawFd, Connection> = HashMap::new();
    let cap = cfg.max_connections_per_worker.max(1).min(connection_cap());
    let mut chat_cursor = shared.chat_latest_seq();

    info!(worker_id, cap, "worker event loop starting");

    loop {
        drain_and_broadcast(shared, &mut chat_cursor, &mut connections, &mut poller);

        let events = match poller.wait(IDLE_TICK_MS) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        for ev in events {
            if ev.fd == listener.as_raw_fd() {
                accept_loop(shared, &listener, &mut poller, &mut connections, cap, cfg);
                continue;
            }
            if ev.fd == wakeup.read_fd() {
                if let Err(e) = wakeup.drain() {
                    warn!(error = %e, "wakeup drain failed");
                }
                drain_and_broadcast(shared, &mut chat_cursor, &mut connections, &mut poller);
                continue;
            }

            let mut close = ev.hup;
            if !close {
                if let Some(conn) = connections.get_mut(&ev.fd) {
                    if ev.readable {
                        close = service_readable(shared, wakeup, conn, cfg.max_body_len);
                    }
                    if !close && conn.has_pending_write() {
                        match conn.flush() {
                            Ok(true) => {
                                poller.modify(ev.fd, false).ok();
                            }
                            Ok(false) => {
                                poller.modify(ev.fd, true).ok();
                            }
                            Err(_) => close = true,
                        }
                    }
                } else {
                    continue;
                }
            }

            if close {
                poller.remove(ev.fd).ok();
                if let Some(conn) = connections.remove(&ev.fd) {
                    debug!(worker_id, peer = %conn.peer_addr, "connection closed");
                }
            }
        }
    }
}

fn accept_loop(
    shared: &SharedState,
    listener: &TcpListener,
    poller: &mut reactor::Poller,
    connections: &mut HashMap<RawFd, Connection>,
    cap: usize,
    cfg: &Config,
) {
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                if connections.len() >= cap {
                    drop(stream);
                    continue;
                }
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!(error = %e, "failed to set nonblocking on accepted socket");
                    continue;
                }
                stream.set_nodelay(true).ok();
                let fd = stream.as_raw_fd();
                shared.record_connection();
                let conn = Connection::new(stream, addr.to_string(), cfg.max_body_len as usize + 32);
                connections.insert(fd, conn);
                if poller.add(fd, false).is_err() {
                    connections.remove(&fd);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
    }
}

/// Reads and dispatches every complete frame currently available. Returns
/// `true` if the connection should be closed (protocol/integrity error or
/// I/O failure).
fn service_readable(shared: &SharedState, wakeup: &Wakeup, conn: &mut Connection, max_body_len: u32) -> bool {
    let mut tmp = [0u8; 8192];
    loop {
        match conn.stream.read(&mut tmp) {
            Ok(0) => return true,
            Ok(n) => conn.read_buf_mut().extend_from_slice(&tmp[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return true,
        }
    }

    loop {
        let (header_bytes, body) = match conn.take_frame(max_body_len) {
            None => return false,
            Some(Err(())) => {
                shared.total_errors.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            Some(Ok(pair)) => pair,
        };

        let header = match Header::parse_basic(&header_bytes, max_body_len) {
            Some(h) => h,
            None => {
                shared.total_errors.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        };

        if !header.validate_checksum(&header_bytes, &body) {
            shared.total_errors.fetch_add(1, Ordering::Relaxed);
            let resp_header = Header::build(
                FLAG_IS_RESPONSE,
                header.opcode,
                Status::ChecksumFail as u16,
                header.req_id,
                &[],
            );
            conn.queue_write(&resp_header);
            let _ = conn.flush();
            return true;
        }

        handler::handle(shared, wakeup, conn, &header, &body);
    }
}

fn drain_and_broadcast(
    shared: &SharedState,
    cursor: &mut u64,
    connections: &mut HashMap<RawFd, Connection>,
    poller: &mut reactor::Poller,
) {
    let events = match shared.chat_read_from(cursor, BROADCAST_BATCH) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "chat ring drain failed");
            return;
        }
    };

    for ev in &events {
        let mut body = Vec::with_capacity(8 + ev.message().len());
        body.extend_from_slice(&ev.room_id.to_be_bytes());
        body.extend_from_slice(&ev.from_user_id.to_be_bytes());
        body.extend_from_slice(&ev.msg_len.to_be_bytes());
        body.extend_from_slice(ev.message());
        let header = Header::build(0, Opcode::ChatBroadcast as u16, Status::Ok as u16, 0, &body);

        for conn in connections.values_mut() {
            if conn.authed && shared.room_is_member(ev.room_id, conn.user_id) {
                conn.queue_write(&header);
                conn.queue_write(&body);
            }
        }
    }

    if events.is_empty() {
        return;
    }

    let mut failed = Vec::new();
    for (&fd, conn) in connections.iter_mut() {
        if !conn.has_pending_write() {
            continue;
        }
        match conn.flush() {
            Ok(true) => {
                poller.modify(fd, false).ok();
            }
            Ok(false) => {
                poller.modify(fd, true).ok();
            }
            Err(_) => failed.push(fd),
        }
    }
    for fd in failed {
        poller.remove(fd).ok();
        connections.remove(&fd);
    }
}
