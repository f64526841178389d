//! Bootstrap configuration: CLI flags with environment-variable
//! fallbacks (`SPEC_FULL.md` §6's `[ADDED]` process-bootstrap note).
//!
//! Grounded on the teacher's `server/server_impl.rs` `ServerBuilder`:
//! a flat, validated configuration struct built once at startup and
//! handed to the server rather than threaded through as loose
//! arguments. The teacher builds its struct through chained setter
//! methods; here `clap`'s derive macro produces the equivalent surface
//! directly from CLI flags and environment variables, which is the
//! idiom `examples/kowito-chopin/chopin-cli` and
//! `examples/universe1216-rust_new/cli` both use for the same job.

use crate::server::worker::{KEEP_ALIVE_TIMEOUT, REQUEST_TIMEOUT};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// Which connection-pool strategy to run (`spec.md` §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PoolKind {
    /// Variant A: a single global slab behind one mutex-guarded LIFO.
    Mutex,
    /// Variant B: one lock-free slab per CPU, with a shared fallback.
    PerCpu,
}

/// Parsed, validated process configuration.
#[derive(Debug, Parser)]
#[command(name = "bff-edge", about = "High-throughput backend-for-frontend edge engine")]
pub struct Config {
    /// Address to bind the listening socket on.
    #[arg(long, env = "BFF_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Number of worker OS threads. Defaults to the available
    /// parallelism reported by the OS.
    #[arg(long, env = "BFF_WORKERS")]
    pub workers: Option<usize>,

    /// Which connection-pool strategy workers use.
    #[arg(long, env = "BFF_POOL", value_enum, default_value_t = PoolKind::PerCpu)]
    pub pool: PoolKind,

    /// Per-request read timeout, in milliseconds.
    #[arg(long = "request-timeout-ms", env = "BFF_REQUEST_TIMEOUT_MS", default_value_t = REQUEST_TIMEOUT.as_millis() as u64)]
    pub request_timeout_ms: u64,

    /// Keep-alive idle timeout, in milliseconds.
    #[arg(long = "keep-alive-timeout-ms", env = "BFF_KEEP_ALIVE_TIMEOUT_MS", default_value_t = KEEP_ALIVE_TIMEOUT.as_millis() as u64)]
    pub keep_alive_timeout_ms: u64,

    /// `tracing_subscriber::EnvFilter` directive, overridden by
    /// `RUST_LOG` when set.
    #[arg(long, env = "BFF_LOG", default_value = "info")]
    pub log: String,
}

impl Config {
    /// Resolves the configured (or default) worker count against the
    /// machine's available parallelism.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_bare_invocation() {
        let config = Config::parse_from(["bff-edge"]);
        assert_eq!(config.bind, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.pool, PoolKind::PerCpu);
        assert_eq!(config.request_timeout(), REQUEST_TIMEOUT);
        assert_eq!(config.keep_alive_timeout(), KEEP_ALIVE_TIMEOUT);
    }

    #[test]
    fn worker_count_falls_back_to_available_parallelism_when_unset() {
        let config = Config::parse_from(["bff-edge"]);
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn explicit_worker_count_overrides_available_parallelism() {
        let config = Config::parse_from(["bff-edge", "--workers", "3"]);
        assert_eq!(config.worker_count(), 3);
    }

    #[test]
    fn pool_flag_selects_mutex_variant() {
        let config = Config::parse_from(["bff-edge", "--pool", "mutex"]);
        assert_eq!(config.pool, PoolKind::Mutex);
    }
}
