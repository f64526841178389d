//! bff-edge — a high-throughput HTTP/1.x backend-for-frontend engine.
//!
//! Serves a small, fixed table of JSON payloads ([`routes`]) over plain
//! HTTP/1.0 and HTTP/1.1, optimised for the case where the response set
//! is known at compile time and the bottleneck is connection churn
//! rather than response computation. Each worker thread owns a
//! dedicated single-threaded tokio runtime, its own slice of the
//! connection pool, and its own expiry timer heap; workers never share
//! mutable state with each other beyond the listening socket and the
//! route table.
//!
//! # Layout
//!
//! - [`http`] — wire-level types and the request-line/header parser.
//! - [`server::connection`] — the fixed-size, reusable connection
//!   record and its `FREE`/`READING`/`WRITING`/`KEEP_ALIVE`/`CLOSING`
//!   state machine.
//! - [`server::worker`] — the accept loop, per-connection task, and
//!   timer-reaper task that drive connections end to end.
//! - [`pool`] — the two interchangeable connection-pool strategies
//!   (global mutex free-stack, per-CPU lock-free free-stack).
//! - [`timer`] — the expiry min-heap backing request and keep-alive
//!   timeouts.
//! - [`handler`] and [`routes`] — request dispatch against the fixed
//!   route table.
//! - [`metrics`] — the fire-and-forget instrumentation seam.
//! - [`config`] — CLI/environment configuration for the bootstrap
//!   binary.

pub(crate) mod bytes;
pub mod config;
pub mod errors;
pub mod handler;
pub mod http;
pub mod metrics;
pub mod pool;
pub mod routes;
pub mod server;
pub mod timer;

pub use crate::{
    config::Config,
    errors::{ConnError, WorkerError},
    handler::RouteTableHandler,
    http::{Method, StatusCode, Url, Version},
    metrics::{MetricsSink, NullMetrics, TracingMetrics},
    routes::RouteTable,
};

#[doc(hidden)]
#[cfg(test)]
pub(crate) mod tools {
    use std::str::from_utf8;

    #[inline]
    pub(crate) fn str(value: Option<&[u8]>) -> Option<&str> {
        Some(from_utf8(value?).unwrap())
    }

    #[inline]
    pub(crate) fn str_op(value: &[u8]) -> &str {
        from_utf8(value).unwrap()
    }

    #[inline]
    pub(crate) fn str_2<'a>(value: (&'a [u8], &'a [u8])) -> (&'a str, &'a str) {
        (from_utf8(value.0).unwrap(), from_utf8(value.1).unwrap())
    }
}
