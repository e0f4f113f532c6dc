// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Startup-fatal error taxonomy. Per-connection and per-request failures are
// carried on the wire as status codes (see `wire::Status`), never here —
// this enum is only for failures that abort a supervisor or worker before
// it can serve anything.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to acquire shared state region {name:?}: {source}")]
    ShmAcquire { name: String, source: io::Error },

    #[error("failed to initialize shared state region: {source}")]
    ShmInit { source: io::Error },

    #[error("failed to bind listening socket on {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("failed to create the cross-worker wakeup primitive: {source}")]
    WakeupCreate { source: io::Error },

    #[error("fork failed: {source}")]
    Fork { source: io::Error },

    #[error("invalid configuration: {0}")]
    Config(String),
}
