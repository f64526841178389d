//! The synchronous request handler (`spec.md` §4.6).
//!
//! Grounded on the teacher's `http/response.rs` `Response` builder: the
//! same status-line-then-headers-then-blank-line shape and the same
//! `Content-Length` bookkeeping idea, but generalised from a growable
//! `Vec<u8>` with a deferred-backpatch length field to a fixed 512-byte
//! scratch buffer. The backpatch trick in `number_to_bytes` exists there
//! because the teacher's builder can still be streaming a body when
//! `Content-Length` is written; here the body is always one of a handful
//! of `'static` byte slices whose length is already known before a
//! single header byte is written, so the length is formatted directly
//! with `write!` instead.

use crate::http::url::Url;
use crate::http::{Method, StatusCode, Version};
use crate::metrics::MetricsSink;
use crate::routes::RouteTable;
use std::io::{self, Write};
use std::time::{Duration, Instant};

pub const SERVER_HEADER: &str = "bff-edge";

#[derive(Debug, Clone, Copy)]
pub struct HandledResponse {
    pub status: StatusCode,
    pub keep_alive: bool,
    /// Bytes of `scratch` occupied by the formatted header block.
    pub header_len: usize,
    pub body: &'static [u8],
}

/// Serves the fixed [`RouteTable`], matching `spec.md` §4.6's policy
/// exactly: method, then URL shape, then route presence.
pub struct RouteTableHandler<'a> {
    routes: &'a RouteTable,
}

impl<'a> RouteTableHandler<'a> {
    pub fn new(routes: &'a RouteTable) -> Self {
        RouteTableHandler { routes }
    }

    /// Formats a response for the raw request `target` into `scratch`,
    /// reporting fire-and-forget metrics along the way. Never fails: a
    /// header block that would overflow `scratch` falls back to the
    /// fixed 500 branch, which is sized to always fit.
    ///
    /// URL validation here is only [`Url::parse`]'s post-query-strip
    /// shape check (`spec.md` §4.6: "empty after query-strip or not
    /// starting with `/`" → 400). Illegal characters and `..`/`//` are
    /// rejected further upstream, in `server::worker`'s URL-accumulation
    /// callback, and never reach `handle()` at all — those abort the
    /// parse and close the connection instead of producing a response.
    pub fn handle(
        &self,
        method: Method,
        target: &[u8],
        version: Version,
        requested_keep_alive: bool,
        scratch: &mut [u8],
        metrics: &dyn MetricsSink,
        started: Instant,
    ) -> HandledResponse {
        let (status, body, keep_alive): (StatusCode, &'static [u8], bool) = if !method.is_get() {
            (StatusCode::MethodNotAllowed, br#"{"error":"Method Not Allowed"}"#, false)
        } else {
            match Url::parse(target) {
                Err(_) => (StatusCode::BadRequest, br#"{"error":"Bad Request"}"#, false),
                Ok(url) => match self.routes.lookup(url.path()) {
                    Some(body) => (StatusCode::Ok, body, requested_keep_alive),
                    None => (StatusCode::NotFound, br#"{"error":"Not Found"}"#, false),
                },
            }
        };

        let path_label = std::str::from_utf8(target).unwrap_or("<invalid-utf8>");
        metrics.request(path_label);
        if status != StatusCode::Ok {
            metrics.error(path_label, status.code());
        }

        let response = match write_headers(scratch, status, version, keep_alive, body.len()) {
            Some(header_len) => HandledResponse { status, keep_alive, header_len, body },
            None => self.internal_error(scratch, version),
        };
        metrics.latency(path_label, started.elapsed());
        response
    }

    /// Defensive branch (`spec.md` §4.6): the header block overflowed
    /// the scratch buffer. None of the fixed routes trigger this; it
    /// exists so a future route addition fails loudly instead of
    /// truncating a response.
    fn internal_error(&self, scratch: &mut [u8], version: Version) -> HandledResponse {
        let body: &'static [u8] = br#"{"error":"Internal Server Error"}"#;
        let header_len = write_headers(scratch, StatusCode::InternalServerError, version, false, body.len())
            .expect("the fixed 500 header always fits in a 512-byte scratch buffer");
        HandledResponse {
            status: StatusCode::InternalServerError,
            keep_alive: false,
            header_len,
            body,
        }
    }
}

fn write_headers(
    scratch: &mut [u8],
    status: StatusCode,
    version: Version,
    keep_alive: bool,
    body_len: usize,
) -> Option<usize> {
    let mut cursor = ScratchCursor { buf: scratch, pos: 0 };
    let written = (|| -> io::Result<()> {
        cursor.write_all(status.status_line(version).as_bytes())?;
        write!(cursor, "Content-Type: application/json\r\n")?;
        write!(cursor, "Content-Length: {body_len}\r\n")?;
        write!(cursor, "Server: {SERVER_HEADER}\r\n")?;
        write!(cursor, "X-Content-Type-Options: nosniff\r\n")?;
        write!(cursor, "X-Frame-Options: DENY\r\n")?;
        if keep_alive {
            write!(cursor, "Connection: keep-alive\r\nKeep-Alive: timeout=10\r\n")?;
        } else {
            write!(cursor, "Connection: close\r\n")?;
        }
        cursor.write_all(b"\r\n")
    })();
    written.ok()?;
    Some(cursor.pos)
}

/// A `Write` over a borrowed fixed-size buffer, erroring instead of
/// growing once `buf` fills — the scratch-overflow signal `write_headers`
/// turns into the 500 fallback.
struct ScratchCursor<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Write for ScratchCursor<'a> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let end = self.pos + data.len();
        if end > self.buf.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "response header scratch exhausted"));
        }
        self.buf[self.pos..end].copy_from_slice(data);
        self.pos = end;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NullMetrics;

    fn header_str(scratch: &[u8], len: usize) -> &str {
        std::str::from_utf8(&scratch[..len]).unwrap()
    }

    #[test]
    fn known_route_returns_200_with_keep_alive_preserved() {
        let routes = RouteTable::new();
        let handler = RouteTableHandler::new(&routes);
        let mut scratch = [0u8; 512];
        let response = handler.handle(
            Method::Get,
            b"/health",
            Version::Http11,
            true,
            &mut scratch,
            &NullMetrics,
            Instant::now(),
        );
        assert_eq!(response.status, StatusCode::Ok);
        assert!(response.keep_alive);
        assert_eq!(response.body, br#"{"status":"OK"}"#.as_slice());
        let header = header_str(&scratch, response.header_len);
        assert!(header.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(header.contains("Content-Length: 15\r\n"));
        assert!(header.contains("Connection: keep-alive\r\n"));
        assert!(header.ends_with("\r\n\r\n"));
    }

    #[test]
    fn non_get_method_forces_close_and_405() {
        let routes = RouteTable::new();
        let handler = RouteTableHandler::new(&routes);
        let mut scratch = [0u8; 512];
        let response = handler.handle(
            Method::Post,
            b"/health",
            Version::Http11,
            true,
            &mut scratch,
            &NullMetrics,
            Instant::now(),
        );
        assert_eq!(response.status, StatusCode::MethodNotAllowed);
        assert!(!response.keep_alive);
        assert!(header_str(&scratch, response.header_len).contains("Connection: close\r\n"));
    }

    #[test]
    fn unknown_route_is_404_and_closes() {
        let routes = RouteTable::new();
        let handler = RouteTableHandler::new(&routes);
        let mut scratch = [0u8; 512];
        let response = handler.handle(
            Method::Get,
            b"/missing",
            Version::Http11,
            true,
            &mut scratch,
            &NullMetrics,
            Instant::now(),
        );
        assert_eq!(response.status, StatusCode::NotFound);
        assert!(!response.keep_alive);
    }

    #[test]
    fn query_string_is_stripped_before_route_lookup() {
        let routes = RouteTable::new();
        let handler = RouteTableHandler::new(&routes);
        let mut scratch = [0u8; 512];
        let response = handler.handle(
            Method::Get,
            b"/health?verbose=1",
            Version::Http11,
            true,
            &mut scratch,
            &NullMetrics,
            Instant::now(),
        );
        assert_eq!(response.status, StatusCode::Ok);
    }

    #[test]
    fn dot_dot_and_illegal_characters_are_rejected_before_the_handler_ever_runs() {
        // `..`/`//`/illegal-character rejection is no longer the
        // handler's job — `server::worker`'s `UrlSink::on_url` aborts
        // the parse on those targets (silent close, `spec.md` §8
        // scenario 5), so a `..` target can never actually reach
        // `handle()`. What's left for the handler is just "does this
        // shape-valid, unrecognized path match a route" — a plain 404.
        let routes = RouteTable::new();
        let handler = RouteTableHandler::new(&routes);
        let mut scratch = [0u8; 512];
        let response = handler.handle(
            Method::Get,
            b"/../etc/passwd",
            Version::Http11,
            true,
            &mut scratch,
            &NullMetrics,
            Instant::now(),
        );
        assert_eq!(response.status, StatusCode::NotFound);
    }

    #[test]
    fn empty_path_is_bad_request() {
        let routes = RouteTable::new();
        let handler = RouteTableHandler::new(&routes);
        let mut scratch = [0u8; 512];
        let response = handler.handle(
            Method::Get,
            b"",
            Version::Http11,
            true,
            &mut scratch,
            &NullMetrics,
            Instant::now(),
        );
        assert_eq!(response.status, StatusCode::BadRequest);
    }

    #[test]
    fn header_overflow_falls_back_to_500() {
        let routes = RouteTable::new();
        let handler = RouteTableHandler::new(&routes);
        // Too small for a keep-alive 200 response (193 bytes) but still
        // comfortably big enough for the fixed, close-only 500 fallback
        // (183 bytes) — the scratch buffer every real deployment uses is
        // 512 bytes (`RESPONSE_SCRATCH_SIZE`), so this overflow can't
        // actually happen there; this just exercises the fallback branch
        // without also overflowing the 500 branch itself.
        let mut scratch = [0u8; 190];
        let response = handler.handle(
            Method::Get,
            b"/health",
            Version::Http11,
            true,
            &mut scratch,
            &NullMetrics,
            Instant::now(),
        );
        assert_eq!(response.status, StatusCode::InternalServerError);
        assert!(!response.keep_alive);
    }

    #[test]
    fn latency_is_observed_even_though_it_is_fire_and_forget() {
        struct CountingMetrics(std::sync::atomic::AtomicUsize);
        impl MetricsSink for CountingMetrics {
            fn request(&self, _path: &str) {}
            fn error(&self, _path: &str, _status: u16) {}
            fn latency(&self, _path: &str, _elapsed: Duration) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
        let routes = RouteTable::new();
        let handler = RouteTableHandler::new(&routes);
        let mut scratch = [0u8; 512];
        let metrics = CountingMetrics(std::sync::atomic::AtomicUsize::new(0));
        handler.handle(Method::Get, b"/health", Version::Http11, true, &mut scratch, &metrics, Instant::now());
        assert_eq!(metrics.0.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
