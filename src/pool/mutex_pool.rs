//! Variant A: a single global slab guarded by one mutex-protected LIFO
//! free-stack (`spec.md` §4.7, "global mutex LIFO").
//!
//! Grounded on the teacher's dead `server/server.rs`, which kept a
//! fixed-capacity queue of reusable connection slots behind a single
//! lock; generalised here to an index-based free-stack over a slab of
//! [`ConnectionRecord`]s rather than over live connection objects.

use crate::server::connection::{ConnState, ConnectionRecord};
use std::cell::UnsafeCell;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Default slab size (`spec.md` §3: "a single global slab (16,384
/// records)").
pub const DEFAULT_CAPACITY: usize = 16_384;

pub struct MutexPool {
    slab: Box<[UnsafeCell<ConnectionRecord>]>,
    free: Mutex<Vec<u32>>,
    used_count: AtomicUsize,
    peak_usage: AtomicUsize,
}

// Safety: every record is reachable by exactly one owner at a time —
// either sitting on `free` (to be claimed), or held by whichever caller
// last claimed it and has not yet released it. `free` is the only path
// by which an index changes hands, and it's mutex-guarded.
unsafe impl Sync for MutexPool {}

impl MutexPool {
    pub fn new(capacity: usize) -> Self {
        let slab = (0..capacity)
            .map(|_| UnsafeCell::new(ConnectionRecord::vacant()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // Order doesn't matter for correctness, only for which physical
        // record gets reused first; push in reverse so index 0 pops first.
        let free = (0..capacity as u32).rev().collect();
        MutexPool {
            slab,
            free: Mutex::new(free),
            used_count: AtomicUsize::new(0),
            peak_usage: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slab.len()
    }

    #[inline]
    pub fn used_count(&self) -> usize {
        self.used_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn peak_usage(&self) -> usize {
        self.peak_usage.load(Ordering::Relaxed)
    }

    /// Pops the top free index, clears its per-request fields, and
    /// returns it. `None` signals exhaustion (`spec.md` §4.7).
    pub fn claim(&self, peer_addr: SocketAddr, now: Instant) -> Option<u32> {
        let idx = {
            let mut free = self.free.lock().unwrap();
            free.pop()?
        };
        let used = self.used_count.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_usage.fetch_max(used, Ordering::Relaxed);
        // Safety: `idx` just left the free-stack, so no other caller holds it.
        unsafe { (*self.slab[idx as usize].get()).reset_for_claim(peer_addr, now) };
        Some(idx)
    }

    /// Returns `idx` to the free-stack. Idempotent: calling this twice
    /// on the same index (a double release) is detected via the
    /// record's own state and silently ignored the second time, per the
    /// resolved double-release policy shared by both pool variants.
    pub fn release(&self, idx: u32) {
        let rec = unsafe { &mut *self.slab[idx as usize].get() };
        if rec.state == ConnState::Free {
            return;
        }
        rec.state = ConnState::Free;
        rec.peer_addr = None;
        rec.timer_ref = None;

        self.free.lock().unwrap().push(idx);
        self.used_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// # Safety
    /// `idx` must currently be claimed by the caller (between a
    /// `claim`/`release` pair it owns); aliased access to the same
    /// index from two callers is undefined behavior.
    #[inline]
    pub unsafe fn get(&self, idx: u32) -> &ConnectionRecord {
        &*self.slab[idx as usize].get()
    }

    /// # Safety
    /// Same contract as [`Self::get`].
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, idx: u32) -> &mut ConnectionRecord {
        &mut *self.slab[idx as usize].get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    #[test]
    fn claim_then_release_round_trips_used_count() {
        let pool = MutexPool::new(4);
        let a = pool.claim(addr(), Instant::now()).unwrap();
        let b = pool.claim(addr(), Instant::now()).unwrap();
        assert_eq!(pool.used_count(), 2);
        pool.release(a);
        assert_eq!(pool.used_count(), 1);
        pool.release(b);
        assert_eq!(pool.used_count(), 0);
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = MutexPool::new(1);
        let a = pool.claim(addr(), Instant::now()).unwrap();
        assert!(pool.claim(addr(), Instant::now()).is_none());
        pool.release(a);
        assert!(pool.claim(addr(), Instant::now()).is_some());
    }

    #[test]
    fn double_release_is_idempotent() {
        let pool = MutexPool::new(2);
        let a = pool.claim(addr(), Instant::now()).unwrap();
        pool.release(a);
        assert_eq!(pool.used_count(), 0);
        pool.release(a);
        assert_eq!(pool.used_count(), 0, "double release must not underflow used_count");
    }

    #[test]
    fn peak_usage_tracks_high_water_mark() {
        let pool = MutexPool::new(4);
        let a = pool.claim(addr(), Instant::now()).unwrap();
        let b = pool.claim(addr(), Instant::now()).unwrap();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.peak_usage(), 2);
    }

    #[test]
    fn claimed_record_starts_in_reading_state() {
        let pool = MutexPool::new(1);
        let idx = pool.claim(addr(), Instant::now()).unwrap();
        let rec = unsafe { pool.get(idx) };
        assert_eq!(rec.state, ConnState::Reading);
        assert_eq!(rec.peer_addr, Some(addr()));
    }
}
