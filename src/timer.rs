//! Expiry timer min-heap with an intrusive back-reference for O(log n)
//! cancellation.
//!
//! Ported from `original_source/timer.c`'s `timer_heap_t`: an array of
//! node indices ordered by expiry, each node carrying its own position in
//! that array so `remove` can locate and extract it in O(log n) instead
//! of a linear scan. Nodes are drawn from a free-list slab rather than
//! `malloc`/`free`, matching the "no per-connection allocation in the
//! steady state" non-goal.
//!
//! The connection ↔ timer-node mutual reference is resolved per
//! `SPEC_FULL.md` §9: the heap *owns* nodes (by index, in its slab); a
//! connection holds only a `TimerRef`, a non-owning handle nulled on
//! removal.

use std::time::{Duration, Instant};

/// A non-owning handle a connection record keeps to its timer node.
/// Carries the slot's generation alongside its slab index so a `remove`
/// on a slot that has since been freed — or freed and reallocated to a
/// different timer — is detected as stale rather than silently operating
/// on the wrong node. Never touched except by passing it back into the
/// `TimerHeap` that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRef(u32, u32);

#[derive(Debug, Clone, Copy)]
struct Node {
    expiry: Instant,
    /// Index of the owning connection record (slab index, not a pointer).
    conn: u32,
    /// This node's current position in `heap`. Kept in sync on every swap.
    heap_index: u32,
    /// Generation this node was allocated under; matched against a
    /// `TimerRef`'s generation to detect staleness.
    generation: u32,
}

/// Binary min-heap of expiry timers, backed by a fixed-capacity slab.
pub struct TimerHeap {
    /// `None` means the slot is free. A slot that holds `Some` is always
    /// live in `heap`; there is no third "freed but still populated"
    /// state, so a stale `TimerRef` against a `None` slot is unambiguous.
    nodes: Vec<Option<Node>>,
    /// Generation counter per slot, bumped every time it's freed. Kept
    /// separate from `nodes` so it survives across the slot's `None`
    /// periods — a `TimerRef` issued before the slot was freed and
    /// reallocated must still be told apart from one issued after.
    generations: Vec<u32>,
    free_list: Vec<u32>,
    /// `heap[i]` is a slab index into `nodes`.
    heap: Vec<u32>,
    capacity: usize,
}

impl TimerHeap {
    /// Builds a heap whose node slab can hold `capacity` simultaneous
    /// timers (`spec.md` §3: sized 16,384-65,536, worker-configurable).
    pub fn with_capacity(capacity: usize) -> Self {
        TimerHeap {
            nodes: vec![None; capacity],
            generations: vec![0; capacity],
            free_list: (0..capacity as u32).rev().collect(),
            heap: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Arms a timer for `conn` expiring `timeout` from now. Returns
    /// `None` if the node slab is exhausted (resource error, per
    /// `spec.md` §7).
    pub fn add(&mut self, conn: u32, timeout: Duration, now: Instant) -> Option<TimerRef> {
        let slot = self.alloc_node()?;
        let heap_index = self.heap.len() as u32;
        let generation = self.generations[slot as usize];
        self.nodes[slot as usize] = Some(Node {
            expiry: now + timeout,
            conn,
            heap_index,
            generation,
        });
        self.heap.push(slot);
        self.sift_up(heap_index as usize);
        Some(TimerRef(slot, generation))
    }

    /// Cancels and releases the timer referenced by `timer_ref`.
    /// Tolerates being called on a node already removed by expiry
    /// (`process_expired` may race a connection's own cleanup): a freed
    /// slot reads back `None`, and a slot freed and then reallocated to
    /// a *different* timer is caught by the generation mismatch, so
    /// neither case can remove or corrupt a live, unrelated node.
    pub fn remove(&mut self, timer_ref: TimerRef) {
        let slot = timer_ref.0;
        let stale = match &self.nodes[slot as usize] {
            Some(node) => node.generation != timer_ref.1,
            None => true,
        };
        if stale {
            return;
        }
        self.remove_slot(slot);
    }

    /// Unconditionally removes an occupied slot from the heap and frees
    /// it. Callers must already know `slot` is live — `remove` checks
    /// that via the generation; `process_expired` knows it because it
    /// just read the slot as the current root.
    fn remove_slot(&mut self, slot: u32) {
        let node = self.nodes[slot as usize].expect("remove_slot called on a free slot");
        let index = node.heap_index as usize;
        debug_assert_eq!(self.heap[index], slot);

        let last = self.heap.len() - 1;
        self.heap.swap(index, last);
        self.heap.pop();

        if index < self.heap.len() {
            self.fix_index(index);
            self.sift_up(index);
            self.sift_down(index);
        }

        self.free_node(slot);
    }

    /// Milliseconds until the nearest expiry, `Some(0)` if already due,
    /// `None` if the heap is empty ("no timeout" per `spec.md` §4.2).
    pub fn next_timeout_ms(&self, now: Instant) -> Option<u64> {
        let top = self.top()?;
        Some(if top.expiry <= now {
            0
        } else {
            (top.expiry - now).as_millis() as u64
        })
    }

    /// Pops every timer whose expiry is at or before `now`, calling
    /// `on_expire` with the connection index for each. `on_expire` is
    /// expected to drive the connection to `CLOSING` and release it,
    /// which implicitly removes any timer it still holds — so this loop
    /// re-checks the root after each callback rather than assuming the
    /// heap shrank by exactly one.
    pub fn process_expired(&mut self, now: Instant, mut on_expire: impl FnMut(u32)) {
        loop {
            let Some(top) = self.top() else { break };
            if top.expiry > now {
                break;
            }
            let conn = top.conn;
            let slot = self.heap[0];
            self.remove_slot(slot);
            on_expire(conn);
        }
    }

    fn top(&self) -> Option<&Node> {
        let slot = *self.heap.first()?;
        self.nodes[slot as usize].as_ref()
    }

    fn alloc_node(&mut self) -> Option<u32> {
        self.free_list.pop()
    }

    fn free_node(&mut self, slot: u32) {
        self.nodes[slot as usize] = None;
        self.generations[slot as usize] = self.generations[slot as usize].wrapping_add(1);
        self.free_list.push(slot);
    }

    fn fix_index(&mut self, index: usize) {
        let slot = self.heap[index];
        if let Some(node) = &mut self.nodes[slot as usize] {
            node.heap_index = index as u32;
        }
    }

    fn expiry_of(&self, heap_index: usize) -> Instant {
        self.nodes[self.heap[heap_index] as usize]
            .as_ref()
            .unwrap()
            .expiry
    }

    fn swap_nodes(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.fix_index(a);
        self.fix_index(b);
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.expiry_of(index) < self.expiry_of(parent) {
                self.swap_nodes(index, parent);
                index = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        loop {
            let left = 2 * index + 1;
            let right = 2 * index + 2;
            let mut smallest = index;

            if left < self.heap.len() && self.expiry_of(left) < self.expiry_of(smallest) {
                smallest = left;
            }
            if right < self.heap.len() && self.expiry_of(right) < self.expiry_of(smallest) {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.swap_nodes(index, smallest);
            index = smallest;
        }
    }

    /// Node slab capacity this heap was built with.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_remove_restores_empty() {
        let mut heap = TimerHeap::with_capacity(8);
        let now = Instant::now();
        let r = heap.add(1, Duration::from_millis(100), now).unwrap();
        assert_eq!(heap.len(), 1);
        heap.remove(r);
        assert!(heap.is_empty());
    }

    #[test]
    fn next_timeout_reports_nearest() {
        let mut heap = TimerHeap::with_capacity(8);
        let now = Instant::now();
        heap.add(1, Duration::from_millis(500), now).unwrap();
        heap.add(2, Duration::from_millis(50), now).unwrap();
        heap.add(3, Duration::from_millis(900), now).unwrap();

        let timeout = heap.next_timeout_ms(now).unwrap();
        assert!(timeout <= 50, "expected nearest timer (~50ms), got {timeout}");
    }

    #[test]
    fn process_expired_fires_all_due_in_one_sweep() {
        let mut heap = TimerHeap::with_capacity(8);
        let now = Instant::now();
        heap.add(1, Duration::from_millis(10), now).unwrap();
        heap.add(2, Duration::from_millis(10), now).unwrap();
        heap.add(3, Duration::from_millis(1000), now).unwrap();

        let later = now + Duration::from_millis(20);
        let mut fired = Vec::new();
        heap.process_expired(later, |conn| fired.push(conn));

        fired.sort();
        assert_eq!(fired, vec![1, 2]);
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn back_reference_stays_consistent_across_many_mutations() {
        let mut heap = TimerHeap::with_capacity(64);
        let now = Instant::now();
        let mut refs = Vec::new();
        for i in 0..32u32 {
            let r = heap
                .add(i, Duration::from_millis(1000 - i as u64 * 10), now)
                .unwrap();
            refs.push(r);
        }
        // remove every other one, in reverse, to exercise swap-with-last.
        for (i, r) in refs.into_iter().enumerate() {
            if i % 2 == 0 {
                heap.remove(r);
            }
        }
        assert_eq!(heap.len(), 16);

        // remaining timers must still all fire on a sweep far enough out.
        let mut count = 0;
        heap.process_expired(now + Duration::from_secs(10), |_| count += 1);
        assert_eq!(count, 16);
    }

    #[test]
    fn exhausted_slab_returns_none() {
        let mut heap = TimerHeap::with_capacity(2);
        let now = Instant::now();
        assert!(heap.add(1, Duration::from_millis(10), now).is_some());
        assert!(heap.add(2, Duration::from_millis(10), now).is_some());
        assert!(heap.add(3, Duration::from_millis(10), now).is_none());
    }

    #[test]
    fn remove_tolerates_already_detached_node() {
        let mut heap = TimerHeap::with_capacity(8);
        let now = Instant::now();
        let r = heap.add(1, Duration::from_millis(10), now).unwrap();
        heap.remove(r);
        // Simulates process_expired racing a connection's own cleanup:
        // removing the same (now-stale) ref again must not panic.
        heap.remove(r);
    }

    #[test]
    fn stale_ref_does_not_corrupt_a_node_reallocated_into_its_old_slot() {
        // Mirrors the reaper-vs-connection-task race: a timer expires and
        // is freed by `process_expired`, its slot is immediately reused
        // for a brand new timer, and only then does the stale `TimerRef`
        // from the first timer's owner get `remove`d. That stale remove
        // must be a no-op, not a removal of the new occupant.
        let mut heap = TimerHeap::with_capacity(1);
        let now = Instant::now();
        let stale = heap.add(1, Duration::from_millis(10), now).unwrap();
        heap.remove_slot(0); // stand-in for process_expired's internal free

        let fresh = heap.add(2, Duration::from_millis(999), now).unwrap();
        assert_eq!(heap.len(), 1);

        heap.remove(stale);
        assert_eq!(heap.len(), 1, "stale remove must not touch the reallocated slot");

        heap.remove(fresh);
        assert!(heap.is_empty());
    }
}
