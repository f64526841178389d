//! The per-worker event loop (`spec.md` §4.2-§4.5).
//!
//! Grounded on teacher's `server/server_impl.rs` (`Server::launch`,
//! `spawn_worker`: one accept loop per worker, one spawned task per
//! connection, `tokio::spawn` rather than raw thread/epoll plumbing) and
//! on `original_source/worker_optimized.c` (`worker_loop_optimized`'s
//! operation order: timer horizon, block-with-timeout, process expired
//! timers, dispatch events; `handle_new_connections_batch`'s bounded
//! accept loop; `do_read_optimized`/`do_write_optimized`'s attempt caps
//! and partial-write resumption; `setup_worker_affinity`'s best-effort,
//! log-don't-propagate failure handling).
//!
//! Per `SPEC_FULL.md` §2's runtime-substrate note, the raw `epoll_wait`
//! loop becomes a `tokio::task::LocalSet` driving one task per
//! connection rather than a single thread multiplexing raw file
//! descriptors; `TcpStream::readable()`/`try_read()`/`try_write()`
//! reproduce the edge-triggered, drain-until-would-block contract the
//! original's raw epoll usage relies on. The worker's [`TimerHeap`]
//! stays genuinely load-bearing in this translation: each connection
//! task registers its deadline into the heap (so the structure's
//! back-reference removal is exercised exactly as intended) and a single
//! per-worker reaper task sleeps for the heap's own computed horizon,
//! sweeps due timers, and wakes the owning task through a
//! [`tokio::sync::Notify`] rather than each task independently racing
//! its own `sleep` — keeping one nearest-deadline computation per
//! worker instead of one timer-wheel entry per connection.

use crate::bytes::{contains_double_slash, contains_dot_dot, validate_url_chars};
use crate::errors::{ConnError, WorkerError};
use crate::handler::RouteTableHandler;
use crate::http::parser::{self, ParseOutcome, ParserCallbacks};
use crate::http::{Method, Version};
use crate::metrics::MetricsSink;
use crate::pool::{LockfreePool, MutexPool};
use crate::routes::RouteTable;
use crate::server::connection::{ConnState, ConnectionRecord, READ_BUF_SIZE, URL_BUF_SIZE};
use crate::timer::TimerHeap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

/// §4.1: "The request timeout is 5,000 ms; keep-alive idle is 10,000 ms."
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_millis(10_000);

pub const MAX_RESPONSE_SIZE: usize = 65_536;

const READ_ATTEMPT_CAP: usize = 16;
const WRITE_ATTEMPT_CAP: usize = 64;
const TIMER_SLAB_CAPACITY: usize = 16_384;
/// How often the reaper wakes when the heap is empty, just to notice a
/// worker shutdown request promptly.
const REAPER_IDLE_POLL: Duration = Duration::from_millis(250);
/// Upper bound on how late the accept loop can notice a shutdown
/// request while idle (no incoming connections to race it against).
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// The two pool variants unified behind one call surface, so the worker
/// loop doesn't need to be generic over which one is configured
/// (`spec.md` §4.7: workers "share only the listening socket and the
/// route table", the pool variant is a deployment choice, not a
/// per-worker one).
pub enum Pool {
    Mutex(MutexPool),
    PerCpu(LockfreePool),
}

impl Pool {
    fn claim(&self, cpu_id: usize, peer_addr: SocketAddr, now: Instant) -> Option<u32> {
        match self {
            Pool::Mutex(pool) => pool.claim(peer_addr, now),
            Pool::PerCpu(pool) => pool.claim(cpu_id, peer_addr, now),
        }
    }

    fn release(&self, idx: u32) {
        match self {
            Pool::Mutex(pool) => pool.release(idx),
            Pool::PerCpu(pool) => pool.release(idx),
        }
    }

    /// # Safety
    /// `idx` must currently be claimed by the caller.
    unsafe fn get_mut(&self, idx: u32) -> &mut ConnectionRecord {
        match self {
            Pool::Mutex(pool) => pool.get_mut(idx),
            Pool::PerCpu(pool) => pool.get_mut(idx),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub worker_id: usize,
    pub cpu_id: usize,
    pub request_timeout: Duration,
    pub keep_alive_timeout: Duration,
}

/// State shared by every connection task on one worker thread. Nothing
/// here is `Send`: it only ever moves between tasks on the same
/// `LocalSet`, matching "each worker owns exclusively ... one timer
/// heap" (§4.2).
#[derive(Clone)]
struct WorkerShared {
    pool: Arc<Pool>,
    routes: Arc<RouteTable>,
    metrics: Arc<dyn MetricsSink>,
    timers: Rc<RefCell<TimerHeap>>,
    wakers: Rc<RefCell<HashMap<u32, Rc<Notify>>>>,
    config: WorkerConfig,
}

/// Runs one worker's accept loop and connection tasks to completion.
/// `listener` is shared by every worker via `Arc`, matching
/// `original_source/main.c`'s single listening fd handed to every
/// `pthread_create`d worker — each worker's task independently calls
/// `accept()` on the same socket rather than owning a private one
/// (`SO_REUSEPORT` is still set at bind time for parity with the
/// original, but with one socket it only affects rebind semantics, not
/// load distribution). Returns only on a runtime-setup failure;
/// per-connection errors are logged and never propagated (§4.2, §7).
pub async fn run(
    listener: Arc<TcpListener>,
    pool: Arc<Pool>,
    routes: Arc<RouteTable>,
    metrics: Arc<dyn MetricsSink>,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
) -> Result<(), WorkerError> {
    try_set_affinity(config.cpu_id);
    try_elevate_scheduling_class();

    let shared = WorkerShared {
        pool,
        routes,
        metrics,
        timers: Rc::new(RefCell::new(TimerHeap::with_capacity(TIMER_SLAB_CAPACITY))),
        wakers: Rc::new(RefCell::new(HashMap::new())),
        config,
    };

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            tokio::task::spawn_local(reap_expired_timers(
                shared.pool.clone(),
                shared.timers.clone(),
                shared.wakers.clone(),
            ));

            while !shutdown.load(Ordering::Relaxed) {
                // `accept()` alone would block past a shutdown request
                // until the next connection arrived (§5: "stop flag
                // checked at the top of each worker iteration"). Racing
                // it against a short poll bounds how late that check can
                // run without needing a cross-thread wakeup from the
                // signal handler.
                tokio::select! {
                    biased;
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => accept_one(stream, peer_addr, &shared),
                        Err(err) => tracing::warn!(worker = config.worker_id, error = %err, "accept failed"),
                    },
                    _ = tokio::time::sleep(SHUTDOWN_POLL_INTERVAL) => {}
                }
            }
        })
        .await;

    Ok(())
}

fn accept_one(stream: TcpStream, peer_addr: SocketAddr, shared: &WorkerShared) {
    if let Err(err) = configure_accepted_socket(&stream) {
        tracing::warn!(%peer_addr, error = %err, "failed to configure accepted socket");
    }

    let Some(idx) = shared.pool.claim(shared.config.cpu_id, peer_addr, Instant::now()) else {
        tracing::warn!(%peer_addr, "connection pool exhausted, dropping accepted connection");
        return;
    };

    let shared = shared.clone();
    tokio::task::spawn_local(async move {
        if let Err(err) = drive_connection(stream, idx, &shared).await {
            tracing::debug!(idx, error = %err, "connection closed");
        }
        cancel_timer(&shared, idx);
        shared.pool.release(idx);
    });
}

/// Owns one connection end to end: request timeout while `READING`,
/// response emission while `WRITING`, keep-alive idle timeout while
/// `KEEP_ALIVE`, looping back to `READING` until the peer closes or a
/// policy/timeout error ends it.
async fn drive_connection(mut stream: TcpStream, idx: u32, shared: &WorkerShared) -> Result<(), ConnError> {
    loop {
        let notify = arm_timer(shared, idx, shared.config.request_timeout);
        let head = read_request(&mut stream, idx, shared, &notify).await;
        disarm_timer(shared, idx);
        let head = head?;

        write_response(&mut stream, idx, shared, head).await?;

        let keep_alive = unsafe { shared.pool.get_mut(idx) }.keep_alive;
        if !keep_alive {
            unsafe { shared.pool.get_mut(idx) }.transition(ConnState::Closing);
            return Ok(());
        }
        unsafe { shared.pool.get_mut(idx) }.transition(ConnState::KeepAlive);

        let notify = arm_timer(shared, idx, shared.config.keep_alive_timeout);
        let idle = wait_for_next_request(&mut stream, &notify).await;
        disarm_timer(shared, idx);
        idle?;

        let peer_addr = unsafe { shared.pool.get_mut(idx) }
            .peer_addr
            .expect("a claimed record always carries its peer address");
        unsafe { shared.pool.get_mut(idx) }.reset_for_claim(peer_addr, Instant::now());
    }
}

/// Registers `idx`'s next deadline with the shared heap and the reaper's
/// wake table, returning the `Notify` this connection's task should race
/// its I/O against.
fn arm_timer(shared: &WorkerShared, idx: u32, timeout: Duration) -> Rc<Notify> {
    let notify = Rc::new(Notify::new());
    shared.wakers.borrow_mut().insert(idx, notify.clone());

    let timer_ref = shared.timers.borrow_mut().add(idx, timeout, Instant::now());
    if timer_ref.is_none() {
        tracing::warn!(idx, "timer heap exhausted, connection proceeds without a deadline");
    }
    unsafe { shared.pool.get_mut(idx) }.timer_ref = timer_ref;
    notify
}

fn disarm_timer(shared: &WorkerShared, idx: u32) {
    cancel_timer(shared, idx);
    shared.wakers.borrow_mut().remove(&idx);
}

fn cancel_timer(shared: &WorkerShared, idx: u32) {
    if let Some(timer_ref) = unsafe { shared.pool.get_mut(idx) }.timer_ref.take() {
        shared.timers.borrow_mut().remove(timer_ref);
    }
}

/// Sleeps for the heap's own computed horizon (or a short idle poll when
/// empty, so worker shutdown is still noticed promptly), then fires the
/// `Notify` for every connection whose deadline has passed.
///
/// `process_expired` already frees each expired node inside the heap, so
/// a later `cancel_timer` call against the same connection is harmless
/// on the heap side. But the connection record's own `timer_ref` would
/// otherwise still point at that freed (and possibly since-reallocated)
/// slot until the woken task gets around to `disarm_timer` — so it's
/// cleared here, before the notify, rather than left for the race.
async fn reap_expired_timers(
    pool: Arc<Pool>,
    timers: Rc<RefCell<TimerHeap>>,
    wakers: Rc<RefCell<HashMap<u32, Rc<Notify>>>>,
) {
    loop {
        let horizon = timers.borrow().next_timeout_ms(Instant::now());
        let sleep_for = match horizon {
            Some(ms) => Duration::from_millis(ms),
            None => REAPER_IDLE_POLL,
        };
        tokio::time::sleep(sleep_for).await;

        let mut expired = Vec::new();
        timers
            .borrow_mut()
            .process_expired(Instant::now(), |idx| expired.push(idx));

        for idx in expired {
            unsafe { pool.get_mut(idx) }.timer_ref = None;
            if let Some(notify) = wakers.borrow_mut().remove(&idx) {
                notify.notify_one();
            }
        }
    }
}

/// Accumulates request-target bytes into a small owned buffer rather
/// than borrowing `ConnectionRecord` directly: the parser's `data`
/// argument already borrows the record's read buffer immutably for the
/// call's duration, so a callback that also needs `&mut` access to the
/// record would conflict with it. The accumulated bytes are committed
/// via [`ConnectionRecord::push_url_bytes`] once parsing completes.
#[derive(Default)]
struct UrlSink {
    buf: [u8; URL_BUF_SIZE],
    len: usize,
}

impl ParserCallbacks for UrlSink {
    /// Mirrors `original_source/http_handler.c`'s `on_url_callback` /
    /// `validate_url`: length, leading slash, character class, and
    /// `..`/`//` are all checked here, on the raw target, and any
    /// failure aborts the parse exactly like length overflow already
    /// did — the caller turns that into a silent close (`spec.md` §8
    /// scenario 5), never a response. This runs *before* the handler
    /// ever sees the target, so `Url::parse`'s own checks (`http/url.rs`)
    /// only need to cover the shape left over after query-stripping.
    fn on_url(&mut self, chunk: &[u8]) -> bool {
        // One byte reserved for the null terminator (see
        // `ConnectionRecord::push_url_bytes`): cumulative length >= 256
        // is rejected, matching the parser contract in `spec.md` §6.
        let end = self.len + chunk.len();
        if end >= self.buf.len() {
            return false;
        }
        if !validate_url_chars(chunk) {
            return false;
        }
        self.buf[self.len..end].copy_from_slice(chunk);
        self.len = end;

        if self.len == 0 || self.buf[0] != b'/' {
            return false;
        }
        let accumulated = &self.buf[..self.len];
        if contains_double_slash(accumulated) || contains_dot_dot(accumulated) {
            return false;
        }
        true
    }
}

/// A parsed request head, carried from the read path into the write
/// path. Method and version aren't stored in [`ConnectionRecord`] itself
/// (it mirrors the original's minimal field layout), so this is how
/// they survive the gap between parsing and handling.
struct RequestHead {
    method: Method,
    version: Version,
}

/// Reads until the parser reports headers complete, the peer closes, a
/// policy violation is found, or the request timeout fires (signalled
/// by `notify`). Matches §4.4's read path, dropping the "repeated
/// character" slow-loris heuristic per §9's resolved redesign note.
async fn read_request(
    stream: &mut TcpStream,
    idx: u32,
    shared: &WorkerShared,
    notify: &Notify,
) -> Result<RequestHead, ConnError> {
    let mut attempts = 0usize;
    loop {
        tokio::select! {
            biased;
            _ = notify.notified() => return Err(ConnError::RequestTimeout),
            readiness = stream.readable() => {
                readiness?;
                attempts += 1;
                if attempts > READ_ATTEMPT_CAP {
                    return Err(ConnError::Protocol("exceeded read attempt cap"));
                }

                let rec = unsafe { shared.pool.get_mut(idx) };
                drain_socket(stream, rec)?;

                let mut sink = UrlSink::default();
                let outcome = parser::feed(&rec.read_buf[..rec.bytes_read], &mut sink);
                match outcome {
                    Err(_) => return Err(ConnError::Protocol("malformed request")),
                    Ok(ParseOutcome::Incomplete) => {
                        if rec.bytes_read >= READ_BUF_SIZE {
                            return Err(ConnError::RequestTooLarge { max: READ_BUF_SIZE });
                        }
                        continue;
                    }
                    Ok(ParseOutcome::HeadersComplete(head)) => {
                        if head.content_length != 0 {
                            return Err(ConnError::Protocol("request body not supported"));
                        }
                        if head.upgrade {
                            return Err(ConnError::Protocol("protocol upgrade not supported"));
                        }
                        if !rec.push_url_bytes(&sink.buf[..sink.len]) {
                            return Err(ConnError::RequestTooLarge { max: URL_BUF_SIZE });
                        }
                        rec.keep_alive = head.keep_alive;
                        return Ok(RequestHead { method: head.method, version: head.version });
                    }
                }
            }
        }
    }
}

/// Repeatedly pulls from the socket into the record's read buffer until
/// it would block (§4.4: "repeatedly pull ... until the socket reports
/// 'would block'") or the buffer fills. Filling the buffer is not itself
/// an error here — a request whose headers end exactly at byte
/// `READ_BUF_SIZE` (`spec.md` §8: "request of exactly 8192 bytes:
/// accepted") must still reach the parser. The caller is the one that
/// turns "buffer full and the parser still isn't satisfied" into
/// [`ConnError::RequestTooLarge`].
fn drain_socket(stream: &TcpStream, rec: &mut ConnectionRecord) -> Result<(), ConnError> {
    while rec.bytes_read < READ_BUF_SIZE {
        match stream.try_read(&mut rec.read_buf[rec.bytes_read..]) {
            Ok(0) => return Err(ConnError::PeerClosed),
            Ok(n) => rec.bytes_read += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(ConnError::Transport(e)),
        }
    }
    Ok(())
}

/// Waits for either the next request's first byte or the keep-alive
/// timer. Unlike `read_request`, no bytes are consumed here: the next
/// loop iteration's `read_request` call does the actual read once this
/// returns successfully.
async fn wait_for_next_request(stream: &mut TcpStream, notify: &Notify) -> Result<(), ConnError> {
    tokio::select! {
        biased;
        _ = notify.notified() => Err(ConnError::KeepAliveTimeout),
        readiness = stream.readable() => readiness.map_err(ConnError::Transport),
    }
}

/// Formats and emits the response for a completed request (§4.5, §4.6).
async fn write_response(
    stream: &mut TcpStream,
    idx: u32,
    shared: &WorkerShared,
    head: RequestHead,
) -> Result<(), ConnError> {
    let started = Instant::now();
    {
        let rec = unsafe { shared.pool.get_mut(idx) };
        let handler = RouteTableHandler::new(&shared.routes);
        let target = {
            let mut buf = [0u8; URL_BUF_SIZE];
            let len = rec.url().len();
            buf[..len].copy_from_slice(rec.url());
            (buf, len)
        };
        let handled = handler.handle(
            head.method,
            &target.0[..target.1],
            head.version,
            rec.keep_alive,
            &mut rec.response_scratch,
            shared.metrics.as_ref(),
            started,
        );
        rec.response_header_len = handled.header_len;
        rec.response_body = handled.body;
        rec.keep_alive = handled.keep_alive;
        rec.bytes_sent = 0;
        rec.transition(ConnState::Writing);
    }

    let total_len = {
        let rec = unsafe { shared.pool.get_mut(idx) };
        rec.response_header_len + rec.response_body.len()
    };
    if total_len > MAX_RESPONSE_SIZE {
        return Err(ConnError::ResponseTooLarge { max: MAX_RESPONSE_SIZE });
    }

    let mut attempts = 0usize;
    loop {
        stream.writable().await.map_err(ConnError::Transport)?;
        attempts += 1;
        if attempts > WRITE_ATTEMPT_CAP {
            return Err(ConnError::Protocol("exceeded write attempt cap"));
        }

        let rec = unsafe { shared.pool.get_mut(idx) };
        match write_once(stream, rec) {
            Ok(true) => return Ok(()),
            Ok(false) => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(ConnError::Transport(e)),
        }
    }
}

/// Issues one vectored write attempt, resuming from `bytes_sent`. Returns
/// `Ok(true)` once the whole header+body pair has been sent.
fn write_once(stream: &TcpStream, rec: &mut ConnectionRecord) -> io::Result<bool> {
    let header = rec.response_header();
    let body = rec.response_body;
    let header_len = header.len();
    let total = header_len + body.len();

    let slices: [IoSlice<'_>; 2] = if rec.bytes_sent < header_len {
        [IoSlice::new(&header[rec.bytes_sent..]), IoSlice::new(body)]
    } else {
        [IoSlice::new(&[]), IoSlice::new(&body[rec.bytes_sent - header_len..])]
    };

    let n = stream.try_write_vectored(&slices)?;
    rec.bytes_sent += n;
    Ok(rec.bytes_sent >= total)
}

fn configure_accepted_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let sock_ref = socket2::SockRef::from(stream);
    sock_ref.set_send_buffer_size(64 * 1024)?;
    sock_ref.set_recv_buffer_size(64 * 1024)?;
    Ok(())
}

/// Best-effort CPU pinning (`spec.md` §4.2: "Workers may set CPU
/// affinity ... failure ... is non-fatal and must be logged, not
/// propagated"). Grounded on `examples/kowito-chopin`'s
/// `core_affinity::set_for_current` usage in its worker spawn loop.
fn try_set_affinity(cpu_id: usize) {
    let Some(core_ids) = core_affinity::get_core_ids() else {
        tracing::warn!(cpu_id, "failed to enumerate CPU core ids, continuing unpinned");
        return;
    };
    if core_ids.is_empty() {
        tracing::warn!(cpu_id, "no CPU core ids reported, continuing unpinned");
        return;
    }
    let core = core_ids[cpu_id % core_ids.len()];
    if !core_affinity::set_for_current(core) {
        tracing::warn!(cpu_id, "failed to pin worker to CPU, continuing unpinned");
    }
}

/// Best-effort scheduling-class elevation to `SCHED_RR`, mirroring
/// `original_source/worker_optimized.c`'s `setup_worker_affinity` (which
/// calls `sched_setscheduler` alongside its affinity mask). Requires
/// `CAP_SYS_NICE` and is expected to fail in most deployments; failure
/// is logged and otherwise ignored (`spec.md` §4.2).
fn try_elevate_scheduling_class() {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: `sched_setscheduler(0, ...)` targets the calling thread
        // and takes its parameter by value; no pointers escape this
        // function, and a failed call leaves the thread's scheduling
        // class untouched.
        let param = libc::sched_param { sched_priority: 1 };
        let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            tracing::warn!(error = %err, "failed to elevate scheduling class, continuing at default priority");
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        tracing::debug!("scheduling-class elevation is only attempted on linux");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_target_is_accepted() {
        let mut sink = UrlSink::default();
        assert!(sink.on_url(b"/bonuses?x=1"));
        assert_eq!(&sink.buf[..sink.len], b"/bonuses?x=1");
    }

    #[test]
    fn dot_dot_aborts_the_parse() {
        let mut sink = UrlSink::default();
        assert!(!sink.on_url(b"/../etc/passwd"));
    }

    #[test]
    fn double_slash_aborts_the_parse() {
        let mut sink = UrlSink::default();
        assert!(!sink.on_url(b"//etc"));
    }

    #[test]
    fn illegal_character_aborts_the_parse() {
        let mut sink = UrlSink::default();
        assert!(!sink.on_url(b"/bonuses x"));
    }

    #[test]
    fn missing_leading_slash_aborts_the_parse() {
        let mut sink = UrlSink::default();
        assert!(!sink.on_url(b"bonuses"));
    }

    #[test]
    fn dot_dot_split_across_chunk_boundary_is_still_caught() {
        let mut sink = UrlSink::default();
        assert!(sink.on_url(b"/a."));
        assert!(!sink.on_url(b"./b"));
    }

    #[test]
    fn url_length_boundary_matches_connection_record_cap() {
        let mut sink = UrlSink::default();
        let accepted = vec![b'a'; 254];
        assert!(sink.on_url(b"/"));
        assert!(sink.on_url(&accepted));
        assert_eq!(sink.len, 255);

        let mut sink = UrlSink::default();
        let rejected = vec![b'a'; 255];
        assert!(sink.on_url(b"/"));
        assert!(!sink.on_url(&rejected));
    }
}
