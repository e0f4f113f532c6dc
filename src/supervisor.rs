// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Parent-process orchestration: acquires and initializes the shared state
// region, binds the listening socket, creates the wakeup primitive, forks
// the configured number of workers, and supervises them until SIGINT/SIGTERM
// — reaping and restarting any worker that dies, then shutting the whole
// tree down gracefully.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd};
use std::time::{Duration, Instant};

use socket2::{Domain, Socket, Type};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::ServerError;
use crate::state::SharedState;
use crate::wakeup::Wakeup;
use crate::{worker, ShmHandle, ShmOpenMode};

const LISTEN_BACKLOG: i32 = 4096;
const REAP_POLL: Duration = Duration::from_millis(200);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

static SHUTDOWN_REQUESTED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

extern "C" fn on_term_signal(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, std::sync::atomic::Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_term_signal as usize);
        libc::signal(libc::SIGTERM, on_term_signal as usize);
    }
}

fn bind_listener(cfg: &Config) -> Result<std::net::TcpListener, ServerError> {
    let addr = SocketAddr::new(cfg.bind_addr(), cfg.port);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None).map_err(|e| {
        ServerError::Bind {
            addr: addr.to_string(),
            source: e,
        }
    })?;
    socket.set_reuse_address(true).ok();
    #[cfg(unix)]
    socket.set_reuse_port(true).ok();
    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|e| ServerError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
    Ok(socket.into())
}

struct WorkerSlot {
    pid: libc::pid_t,
}

fn fork_worker(
    worker_idx: usize,
    shared: &'static SharedState,
    listener: &std::net::TcpListener,
    wakeup: &Wakeup,
    cfg: &Config,
) -> Result<WorkerSlot, ServerError> {
    let listen_fd = listener.as_raw_fd();
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(ServerError::Fork {
            source: std::io::Error::last_os_error(),
        });
    }
    if pid == 0 {
        // Child: duplicate the inherited listening fd into an owned TcpListener
        // and run the event loop. Never returns to the caller.
        let listener = unsafe {
            let dup_fd = libc::dup(listen_fd);
            std::net::TcpListener::from_raw_fd(dup_fd)
        };
        if let Err(e) = worker::run(worker_idx, shared, listener, wakeup, cfg) {
            error!(worker_idx, error = %e, "worker event loop exited with error");
        }
        std::process::exit(0);
    }
    Ok(WorkerSlot { pid })
}

/// Entry point called by the `ns-server` binary after parsing `Config` and
/// initializing tracing.
pub fn run(cfg: Config) -> Result<(), ServerError> {
    cfg.validate()?;
    install_signal_handlers();

    ShmHandle::clear_storage(&cfg.shm_name);
    let shm = ShmHandle::acquire(&cfg.shm_name, SharedState::SIZE, ShmOpenMode::CreateOrOpen)
        .map_err(|e| ServerError::ShmAcquire {
            name: cfg.shm_name.clone(),
            source: e,
        })?;
    // The shared region and the workers that will map it all outlive this
    // function (the supervisor only exits at process shutdown, at which
    // point the mapping is explicitly unlinked) — a 'static borrow here is
    // sound without leaking, since `shm` is kept alive for the whole run.
    let shared: &'static SharedState = unsafe { SharedState::from_raw(shm.as_mut_ptr()) };
    shared
        .init_if_needed()
        .map_err(|e| ServerError::ShmInit { source: e })?;

    let listener = bind_listener(&cfg)?;
    info!(port = cfg.port, workers = cfg.workers, "listening");

    let wakeup = Wakeup::create().map_err(|e| ServerError::WakeupCreate { source: e })?;

    let mut slots: Vec<WorkerSlot> = Vec::with_capacity(cfg.workers as usize);
    for idx in 0..cfg.workers as usize {
        slots.push(fork_worker(idx, shared, &listener, &wakeup, &cfg)?);
    }

    loop {
        if SHUTDOWN_REQUESTED.load(std::sync::atomic::Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(REAP_POLL);

        for (idx, slot) in slots.iter_mut().enumerate() {
            let mut status: libc::c_int = 0;
            let ret = unsafe { libc::waitpid(slot.pid, &mut status, libc::WNOHANG) };
            if ret == slot.pid {
                warn!(worker_idx = idx, pid = slot.pid, "worker exited, restarting");
                match fork_worker(idx, shared, &listener, &wakeup, &cfg) {
                    Ok(new_slot) => *slot = new_slot,
                    Err(e) => error!(worker_idx = idx, error = %e, "failed to restart worker"),
                }
            }
        }
    }

    info!("shutdown requested, stopping workers");
    for slot in &slots {
        unsafe {
            libc::kill(slot.pid, libc::SIGTERM);
        }
    }

    let deadline = Instant::now() + SHUTDOWN_GRACE;
    for slot in &slots {
        loop {
            let mut status: libc::c_int = 0;
            let ret = unsafe { libc::waitpid(slot.pid, &mut status, libc::WNOHANG) };
            if ret == slot.pid || ret < 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(pid = slot.pid, "worker did not exit in time, killing");
                unsafe {
                    libc::kill(slot.pid, libc::SIGKILL);
                    libc::waitpid(slot.pid, &mut status, 0);
                }
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    shm.unlink();
    info!("shared state unlinked, supervisor exiting");
    Ok(())
}
