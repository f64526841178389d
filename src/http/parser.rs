//! Streaming HTTP/1.x request-line and header parser (`spec.md` §6's
//! "parser contract (consumed)").
//!
//! Grounded on the teacher's `http/request.rs` `Parser` (`parse_method`,
//! `parse_url`, `check_version`, `parse_headers`/`parse_header`,
//! `check_end_of_headers`, `parse_content_length`, `parse_connection`),
//! with two deliberate departures: this parser never owns its input — it
//! scans `ConnectionRecord::read_buf` in place and is re-fed from the
//! front on every read, since the whole head fits comfortably inside one
//! 4 KiB read buffer and HTTP/0.9 (with its unterminated, header-less
//! request line) is out of scope here. The teacher's `unsafe fn
//! into_static` transmute, needed there to let a `Request` outlive the
//! buffer it was parsed from, has no counterpart: `ConnectionRecord`
//! already owns `read_buf` for the lifetime of the connection.
//!
//! The C source's "pause" return code for "stop after headers" becomes
//! [`ParseOutcome::HeadersComplete`], and its function-pointer callback
//! table becomes [`ParserCallbacks`].

use crate::bytes::{find_char, find_header_end, validate_printable_ascii};
use crate::http::{Method, Version};

/// Receives request-target bytes as the parser walks the request line.
/// Grounded on the teacher's URL callback, but typed rather than a raw
/// function pointer.
pub trait ParserCallbacks {
    /// A chunk of the raw request target (`spec.md` §6: "URL bytes may
    /// arrive in multiple chunks; concatenate defensively but reject
    /// when cumulative length >= 256"). Returning `false` aborts
    /// parsing with [`ParseError::UrlTooLong`].
    fn on_url(&mut self, chunk: &[u8]) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedHead {
    pub method: Method,
    pub version: Version,
    pub keep_alive: bool,
    pub content_length: usize,
    pub upgrade: bool,
    /// Bytes of the fed buffer consumed by the request line and headers,
    /// including the terminating blank line.
    pub bytes_consumed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// The terminating blank line hasn't arrived yet; keep reading.
    Incomplete,
    HeadersComplete(ParsedHead),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("request line is missing its method, target, or version")]
    MalformedRequestLine,
    #[error("unrecognized request method")]
    UnknownMethod,
    #[error("empty request target")]
    EmptyTarget,
    #[error("request target exceeds the url buffer")]
    UrlTooLong,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("malformed header line")]
    MalformedHeader,
    #[error("malformed content-length value")]
    MalformedContentLength,
}

/// Scans `data` for a complete request head (request line plus headers
/// terminated by a blank line) and, if found, extracts method, version,
/// keep-alive intent, advertised body length, and upgrade intent.
///
/// `data` is always scanned from byte 0: callers re-invoke this on the
/// same connection's growing read buffer rather than handing it a fresh
/// chunk each time, so the parser itself carries no state between calls.
pub fn feed(data: &[u8], callbacks: &mut impl ParserCallbacks) -> Result<ParseOutcome, ParseError> {
    let Some(header_end) = find_header_end(data) else {
        return Ok(ParseOutcome::Incomplete);
    };
    let head = &data[..header_end];
    let mut lines = head.split(|&b| b == b'\n').map(trim_trailing_cr);

    let request_line = lines.next().ok_or(ParseError::MalformedRequestLine)?;
    let mut parts = request_line.splitn(3, |&b| b == b' ');
    let method_bytes = parts.next().ok_or(ParseError::MalformedRequestLine)?;
    let target = parts.next().ok_or(ParseError::MalformedRequestLine)?;
    let version_bytes = parts.next().ok_or(ParseError::MalformedRequestLine)?;

    let method = Method::from_bytes(method_bytes).ok_or(ParseError::UnknownMethod)?;

    if target.is_empty() {
        return Err(ParseError::EmptyTarget);
    }
    if !callbacks.on_url(target) {
        return Err(ParseError::UrlTooLong);
    }

    let version = Version::from_bytes(version_bytes).ok_or(ParseError::UnsupportedVersion)?;

    // `spec.md` §6: "Persistent connections honoured when the client
    // opts in" — keep-alive defaults to off for both HTTP/1.0 and
    // HTTP/1.1 and is only enabled by an explicit `Connection:
    // keep-alive` header, not by HTTP/1.1's usual implicit default
    // (confirmed by the worked example: a bare HTTP/1.1 GET with no
    // `Connection` header closes the connection).
    let mut keep_alive = false;
    let mut content_length = 0usize;
    let mut upgrade = false;

    for line in lines {
        if line.is_empty() {
            break;
        }
        if !validate_printable_ascii(line) {
            return Err(ParseError::MalformedHeader);
        }
        let colon = find_char(line, b':').ok_or(ParseError::MalformedHeader)?;
        let name = &line[..colon];
        let mut value = &line[colon + 1..];
        while value.first() == Some(&b' ') {
            value = &value[1..];
        }

        if name.eq_ignore_ascii_case(b"connection") {
            if value.eq_ignore_ascii_case(b"keep-alive") {
                keep_alive = true;
            } else if value.eq_ignore_ascii_case(b"close") {
                keep_alive = false;
            }
        } else if name.eq_ignore_ascii_case(b"content-length") {
            content_length = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .ok_or(ParseError::MalformedContentLength)?;
        } else if name.eq_ignore_ascii_case(b"upgrade") {
            upgrade = true;
        }
    }

    Ok(ParseOutcome::HeadersComplete(ParsedHead {
        method,
        version,
        keep_alive,
        content_length,
        upgrade,
        bytes_consumed: header_end,
    }))
}

fn trim_trailing_cr(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((&b'\r', rest)) => rest,
        _ => line,
    }
}
