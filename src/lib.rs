// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// A multi-process TCP server multiplexing a chat subsystem and an account
// ledger over a single binary wire protocol. One supervisor process forks
// N worker processes sharing a listening socket and a cross-process shared
// memory region; the wire codec, shared-state primitives, and platform shm
// glue below are the library half of the crate, consumed by the `ns-server`
// binary in `src/bin/`.

pub mod shm_name;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

pub mod wire;

pub mod raw_mutex;

pub mod wakeup;

pub mod state;
pub use state::SharedState;

pub mod config;
pub use config::Config;

pub mod error;
pub use error::ServerError;

pub mod connection;

pub mod handler;

pub mod worker;

pub mod supervisor;
