//! Connection pool: two variants over the same fixed-size record slab
//! idea (`spec.md` §3/§4.7).
//!
//! Both variants hand out `u32` slab indices rather than pointers or
//! references, since a claimed record is then driven by a tokio task
//! that outlives any borrow we could return from `claim`. Reading or
//! mutating a claimed record goes through `unsafe fn get`/`get_mut`: the
//! pool only guarantees the index is owned by exactly one caller
//! between `claim` and `release`, the same contract the teacher's
//! `ConnectionData` scratch buffers rely on.

pub mod lockfree_pool;
pub mod mutex_pool;

pub use lockfree_pool::LockfreePool;
pub use mutex_pool::MutexPool;
