// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

use clap::Parser;
use ns_server::Config;
use tracing_subscriber::EnvFilter;

fn main() {
    let cfg = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = ns_server::supervisor::run(cfg) {
        tracing::error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }
}
