//! Error taxonomy: per-connection errors and worker-fatal errors.
//!
//! Mirrors the teacher's `ErrorKind` idea of a single enum naming every
//! way a connection's read/write loop can end. Per `spec.md` §7's
//! classification, none of these ever produce a response: the one class
//! that does (method/URL/route policy, `spec.md` §4.6) is decided and
//! answered entirely inside `handler::RouteTableHandler::handle`, which
//! returns a `HandledResponse` rather than failing — so every variant
//! here drives the connection silently to `CLOSING` instead.

use std::io;

/// Per-connection failure. Always silent: the caller logs it and closes
/// the connection without writing a response.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("peer closed connection")]
    PeerClosed,

    #[error("malformed request: {0}")]
    Protocol(&'static str),

    #[error("request exceeds {max} bytes")]
    RequestTooLarge { max: usize },

    #[error("response exceeds {max} bytes")]
    ResponseTooLarge { max: usize },

    #[error("request timed out")]
    RequestTimeout,

    #[error("keep-alive idle timeout")]
    KeepAliveTimeout,
}

/// Worker-fatal errors: surfaced via `tracing::error!` and end that one
/// worker's loop, but never the process (`spec.md` §7).
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to bind listener: {0}")]
    ListenerBind(#[source] io::Error),

    #[error("failed to allocate timer-heap slab of {capacity} nodes")]
    TimerHeapAllocation { capacity: usize },

    #[error("failed to set up per-worker I/O runtime: {0}")]
    RuntimeInit(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_format_with_their_context() {
        assert_eq!(ConnError::RequestTooLarge { max: 256 }.to_string(), "request exceeds 256 bytes");
        assert_eq!(ConnError::KeepAliveTimeout.to_string(), "keep-alive idle timeout");
        assert_eq!(ConnError::Protocol("malformed request").to_string(), "malformed request: malformed request");
    }
}
