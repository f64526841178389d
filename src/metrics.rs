//! Fire-and-forget metrics injection point (`spec.md` §9's open question
//! on observability, resolved in `SPEC_FULL.md` §4.6).
//!
//! Grounded on the teacher's `ConnectionData`/`ConnectionFilter` pattern:
//! a trait the caller is generic over, with a blanket no-op default, so
//! instrumentation can be swapped in without touching the hot path.

use std::time::Duration;

pub trait MetricsSink: Send + Sync {
    fn request(&self, path: &str);
    fn error(&self, path: &str, status: u16);
    fn latency(&self, path: &str, elapsed: Duration);
}

/// Default sink: every call is a no-op, compiled away entirely under
/// optimisation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn request(&self, _path: &str) {}
    fn error(&self, _path: &str, _status: u16) {}
    fn latency(&self, _path: &str, _elapsed: Duration) {}
}

/// Routes metrics through `tracing` at debug level, for deployments that
/// scrape structured logs rather than wiring a dedicated metrics sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn request(&self, path: &str) {
        tracing::debug!(path, "request");
    }

    fn error(&self, path: &str, status: u16) {
        tracing::debug!(path, status, "request.error");
    }

    fn latency(&self, path: &str, elapsed: Duration) {
        tracing::debug!(path, micros = elapsed.as_micros() as u64, "request.latency");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_metrics_accepts_all_calls_without_panicking() {
        let sink = NullMetrics;
        sink.request("/health");
        sink.error("/health", 500);
        sink.latency("/health", Duration::from_micros(1));
    }
}
