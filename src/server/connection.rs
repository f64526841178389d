//! The connection record and its lifecycle state machine.
//!
//! Ported from `original_source/connection.h`'s `connection_t` (fd,
//! state, inline `url[256]`, `read_buf[4096]`, `response_headers[512]`,
//! iovec pair, byte counters, timer-node back-reference) and the
//! teacher's `HttpConnection`/`ConnectionData` pairing of "fixed fields"
//! with "per-request scratch that gets reset on claim". The OS file
//! descriptor itself is not stored here: under tokio each live
//! connection is already identified by its `TcpStream`, owned by the
//! task driving it, so the record only holds the scratch state a
//! pooled, zero-allocation connection needs around that stream.
//!
//! `read_buf` is sized 8192, not the original's 4096: the source's own
//! `BUFFER_SIZE` (4096) and `MAX_REQUEST_SIZE` (8192, `worker.c`) never
//! agreed with each other — a request could never actually reach the
//! larger cap before the smaller buffer rejected it first. `spec.md`
//! §8's own worked boundary ("request of exactly 8192 bytes: accepted")
//! only holds if the buffer can actually hold 8192 bytes, so the buffer
//! is sized to the request cap rather than reproducing the mismatch.

use crate::timer::TimerRef;
use std::net::SocketAddr;
use std::time::Instant;

pub const READ_BUF_SIZE: usize = 8192;
pub const URL_BUF_SIZE: usize = 256;
pub const RESPONSE_SCRATCH_SIZE: usize = 512;

/// Connection lifecycle states (`spec.md` §4.1). `FREE` only ever
/// describes a record sitting on a pool free-stack; once claimed, a
/// record moves forward through `READING` → `WRITING` → either
/// `KEEP_ALIVE` (back to `READING`) or `CLOSING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Free,
    Reading,
    Writing,
    KeepAlive,
    Closing,
}

impl ConnState {
    /// Whether `self -> next` is a legal FSM transition.
    pub const fn can_transition_to(self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (Free, Reading)
                | (Reading, Writing)
                | (Reading, Closing)
                | (Writing, KeepAlive)
                | (Writing, Closing)
                | (KeepAlive, Reading)
                | (KeepAlive, Closing)
                | (Closing, Free)
        )
    }
}

/// A fixed-size, pre-allocated connection slot. Every field that would
/// otherwise need a per-request allocation lives here instead, reset by
/// [`ConnectionRecord::reset_for_claim`] on each reuse.
pub struct ConnectionRecord {
    pub state: ConnState,
    pub peer_addr: Option<SocketAddr>,

    pub read_buf: [u8; READ_BUF_SIZE],
    pub bytes_read: usize,

    pub url_buf: [u8; URL_BUF_SIZE],
    pub url_len: usize,

    pub keep_alive: bool,

    pub response_scratch: [u8; RESPONSE_SCRATCH_SIZE],
    /// Bytes of `response_scratch` actually holding header text.
    pub response_header_len: usize,
    /// The route's (or error's) body, borrowed 'static since the route
    /// table and error bodies are both compile-time constants.
    pub response_body: &'static [u8],
    pub bytes_sent: usize,

    pub timer_ref: Option<TimerRef>,
    pub last_active: Instant,
}

impl ConnectionRecord {
    /// A record as it sits on a pool's free-stack: `FREE`, no peer, no
    /// timer. `spec.md` §3's invariant `FREE ⇔ fd = -1 ∧ timer = null`
    /// becomes, in this translation, `FREE ⇔ peer_addr = None ∧
    /// timer_ref = None`.
    pub fn vacant() -> Self {
        ConnectionRecord {
            state: ConnState::Free,
            peer_addr: None,
            read_buf: [0; READ_BUF_SIZE],
            bytes_read: 0,
            url_buf: [0; URL_BUF_SIZE],
            url_len: 0,
            keep_alive: false,
            response_scratch: [0; RESPONSE_SCRATCH_SIZE],
            response_header_len: 0,
            response_body: b"",
            bytes_sent: 0,
            timer_ref: None,
            last_active: Instant::now(),
        }
    }

    /// Clears every per-request field in place, as `claim` does on the
    /// teacher's pool before handing a record to a worker. Called once
    /// per accepted connection and again on every keep-alive reuse.
    pub fn reset_for_claim(&mut self, peer_addr: SocketAddr, now: Instant) {
        debug_assert!(self.state == ConnState::Free || self.state == ConnState::KeepAlive);
        self.peer_addr = Some(peer_addr);
        self.bytes_read = 0;
        self.url_len = 0;
        self.keep_alive = false;
        self.response_header_len = 0;
        self.response_body = b"";
        self.bytes_sent = 0;
        self.last_active = now;
        self.state = ConnState::Reading;
    }

    /// Applies a validated state transition, panicking in debug builds
    /// on an illegal one (mirrors the teacher's `#[track_caller]`
    /// `debug_assert!`-guarded state machine for `Response`).
    #[track_caller]
    pub fn transition(&mut self, next: ConnState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal connection transition: {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    #[inline]
    pub fn url(&self) -> &[u8] {
        &self.url_buf[..self.url_len]
    }

    /// Appends `chunk` to the URL buffer, matching the parser contract's
    /// "URL bytes may arrive in multiple chunks; concatenate
    /// defensively but reject when cumulative length >= 256"
    /// (`spec.md` §4.8/GLOSSARY). One byte of the 256-byte buffer is
    /// reserved for the null terminator the invariant in §3 requires, so
    /// the largest URL actually accepted is 255 bytes (`spec.md` §8:
    /// "URL of exactly 255 bytes: accepted; 256 bytes: rejected").
    /// Returns `false` once the buffer would overflow, without writing
    /// the overflowing bytes.
    #[must_use]
    pub fn push_url_bytes(&mut self, chunk: &[u8]) -> bool {
        let end = self.url_len + chunk.len();
        if end >= self.url_buf.len() {
            return false;
        }
        self.url_buf[self.url_len..end].copy_from_slice(chunk);
        self.url_len = end;
        true
    }

    pub fn response_header(&self) -> &[u8] {
        &self.response_scratch[..self.response_header_len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_state_has_no_peer_or_timer() {
        let rec = ConnectionRecord::vacant();
        assert_eq!(rec.state, ConnState::Free);
        assert!(rec.peer_addr.is_none());
        assert!(rec.timer_ref.is_none());
    }

    #[test]
    fn legal_transitions_follow_the_fsm_table() {
        assert!(ConnState::Free.can_transition_to(ConnState::Reading));
        assert!(ConnState::Reading.can_transition_to(ConnState::Writing));
        assert!(ConnState::Writing.can_transition_to(ConnState::KeepAlive));
        assert!(ConnState::KeepAlive.can_transition_to(ConnState::Reading));
        assert!(ConnState::Closing.can_transition_to(ConnState::Free));
        assert!(!ConnState::Free.can_transition_to(ConnState::Writing));
        assert!(!ConnState::Closing.can_transition_to(ConnState::Reading));
    }

    #[test]
    fn reset_for_claim_clears_per_request_fields() {
        let mut rec = ConnectionRecord::vacant();
        rec.bytes_read = 42;
        rec.url_len = 10;
        rec.state = ConnState::Closing;
        rec.transition(ConnState::Free);

        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        rec.reset_for_claim(addr, Instant::now());

        assert_eq!(rec.state, ConnState::Reading);
        assert_eq!(rec.bytes_read, 0);
        assert_eq!(rec.url_len, 0);
        assert_eq!(rec.peer_addr, Some(addr));
    }

    #[test]
    fn url_push_rejects_overflow_without_partial_write() {
        let mut rec = ConnectionRecord::vacant();
        // exactly 255 bytes: accepted (spec.md §8 boundary case).
        let filler = vec![b'a'; URL_BUF_SIZE - 1];
        assert!(rec.push_url_bytes(&filler));
        assert_eq!(rec.url_len, URL_BUF_SIZE - 1);

        // a 256th byte must overflow and leave url_len untouched.
        assert!(!rec.push_url_bytes(b"b"));
        assert_eq!(rec.url_len, URL_BUF_SIZE - 1);
    }
}
