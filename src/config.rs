// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Runtime configuration, parsed once by the supervisor from the process
// argv via a `clap` derive `Parser`.

use std::net::IpAddr;

use clap::Parser;

use crate::error::ServerError;

#[derive(Debug, Clone, Parser)]
#[command(name = "ns-server", version, about = "Chat + ledger server")]
pub struct Config {
    /// Address to bind; unset binds INADDR_ANY.
    #[arg(long)]
    pub bind: Option<IpAddr>,

    #[arg(long, default_value_t = 9000)]
    pub port: u16,

    /// Worker process count, 1..=1024.
    #[arg(long, default_value_t = 4)]
    pub workers: u16,

    #[arg(long = "shm", default_value = "/ns_trading_chat")]
    pub shm_name: String,

    #[arg(long, default_value_t = 65536)]
    pub max_body_len: u32,

    /// Informational only; the event loop's hard cap is min(rlimit_nofile, 200000).
    #[arg(long, default_value_t = 1000)]
    pub max_connections_per_worker: usize,

    #[arg(long, default_value_t = 30_000)]
    pub recv_timeout_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    pub send_timeout_ms: u64,
}

impl Config {
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.workers == 0 || self.workers > 1024 {
            return Err(ServerError::Config(format!(
                "workers must be in 1..=1024, got {}",
                self.workers
            )));
        }
        if self.max_body_len == 0 {
            return Err(ServerError::Config("max_body_len must be nonzero".into()));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> IpAddr {
        self.bind.unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_parse_and_validate() {
        let cfg = Config::parse_from(["ns-server"]);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.shm_name, "/ns_trading_chat");
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_zero_workers() {
        let cfg = Config::parse_from(["ns-server", "--workers", "0"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_workers_over_limit() {
        let cfg = Config::parse_from(["ns-server", "--workers", "2000"]);
        assert!(cfg.validate().is_err());
    }
}
