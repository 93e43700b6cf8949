// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Depth-indexed ready pools and the arena-slot lock protocol.
//!
//! Each scheduler owns one [`TaskPool`]: an array of singly-linked task
//! lists indexed by task depth. The pool is reached through an
//! [`ArenaSlot`], whose `steal_end` word serializes the owner against
//! thieves with a single lock bit:
//!
//! ```text
//! steal_end = 2 * deepest | lock_bit   while published and non-empty
//!           = -2                        published, pool empty  (2 * -1)
//!           = -3                        slot unused, locked    (-4 | 1)
//!           = -4                        slot unused, unlocked
//! ```

use crate::loom::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicUsize, Ordering};
use crate::task::Header;
use core::fmt;
use core::ptr::{self, NonNull};
use spin::Backoff;

/// `steal_end` of a published slot whose pool is empty (`deepest == -1`).
pub(crate) const STEAL_END_EMPTY: isize = -2;
/// `steal_end` of an unused slot that is being claimed.
pub(crate) const STEAL_END_UNUSED_LOCKED: isize = -3;
/// `steal_end` of an unused, claimable slot.
pub(crate) const STEAL_END_UNUSED: isize = -4;

/// Initial bucket count of a fresh task pool.
pub(crate) const MIN_ARRAY_SIZE: usize = 16;

/// `arena_index` of a pool that is not published in the arena.
pub(crate) const NULL_ARENA_INDEX: usize = usize::MAX;

/// One arena entry: the lock word plus the published pool pointer.
///
/// Every scheduler also embeds a private `ArenaSlot` (its "dummy slot") so
/// the same locking code runs whether or not the scheduler is published.
pub(crate) struct ArenaSlot {
    /// `2 * deepest | lock_bit`; see the module docs for the encodings.
    pub(crate) steal_end: AtomicIsize,
    pub(crate) task_pool: AtomicPtr<TaskPool>,
    /// Set by the owner while it spins for its own lock; thieves that see it
    /// abandon their locking attempts immediately.
    pub(crate) owner_waits: AtomicBool,
}

// === impl ArenaSlot ===

impl ArenaSlot {
    pub(crate) fn new(steal_end: isize) -> Self {
        Self {
            steal_end: AtomicIsize::new(steal_end),
            task_pool: AtomicPtr::new(ptr::null_mut()),
            owner_waits: AtomicBool::new(false),
        }
    }

    /// Acquires the slot lock as the pool's owner.
    ///
    /// After the first failed attempt the owner raises `owner_waits`, which
    /// makes thieves back off; without it a steady stream of thieves could
    /// lock the owner out of its own pool.
    pub(crate) fn acquire(&self) {
        let mut boff = Backoff::new();
        let mut contended = false;
        loop {
            let steal_end = self.steal_end.load(Ordering::Relaxed);
            if steal_end & 1 == 0
                && self
                    .steal_end
                    .compare_exchange(
                        steal_end,
                        steal_end | 1,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                self.owner_waits.store(false, Ordering::Relaxed);
                return;
            }
            if contended {
                self.owner_waits.store(true, Ordering::Relaxed);
            }
            contended = true;
            boff.spin();
        }
    }

    /// Releases the slot lock, publishing the new deepest index.
    pub(crate) fn release(&self, deepest: isize) {
        debug_assert!(deepest >= -1);
        self.steal_end.store(2 * deepest, Ordering::Release);
    }

    /// Reports whether a thief scanning for work could find any here.
    pub(crate) fn looks_nonempty(&self) -> bool {
        self.steal_end.load(Ordering::Relaxed) >= 0
    }
}

impl fmt::Debug for ArenaSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaSlot")
            .field("steal_end", &self.steal_end.load(Ordering::Relaxed))
            .field("owner_waits", &self.owner_waits.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// The depth-indexed array of ready lists.
pub(crate) struct TaskPool {
    /// Smallest index that may hold stealable work. Advisory: only ever too
    /// small, never too large.
    pub(crate) steal_begin: AtomicIsize,
    /// Which arena slot this pool is published in, or [`NULL_ARENA_INDEX`].
    pub(crate) arena_index: AtomicUsize,
    buckets: Box<[AtomicPtr<Header>]>,
}

// === impl TaskPool ===

impl TaskPool {
    pub(crate) fn new(size: usize) -> Box<Self> {
        debug_assert!(size >= MIN_ARRAY_SIZE);
        let buckets = (0..size)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(Self {
            steal_begin: AtomicIsize::new(size as isize),
            arena_index: AtomicUsize::new(NULL_ARENA_INDEX),
            buckets,
        })
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub(crate) fn bucket(&self, depth: usize) -> &AtomicPtr<Header> {
        &self.buckets[depth]
    }

    /// Pushes an already-linked chain onto bucket `d`. Caller holds the slot
    /// lock; `last_next` is the `next` field of the chain's final task.
    pub(crate) fn link_chain(&self, d: usize, first: NonNull<Header>, last: NonNull<Header>) {
        let head = self.buckets[d].load(Ordering::Relaxed);
        // Safety: caller holds the slot lock, making it the unique writer of
        // the bucket lists.
        unsafe {
            last.as_ref().next.store(head, Ordering::Relaxed);
        }
        self.buckets[d].store(first.as_ptr(), Ordering::Relaxed);
    }

    /// Copies bucket contents and advisory prefix into a bigger pool during
    /// growth. Caller holds the slot lock.
    pub(crate) fn migrate_into(&self, new_pool: &TaskPool) {
        debug_assert!(new_pool.size() >= self.size());
        for (i, bucket) in self.buckets.iter().enumerate() {
            new_pool.buckets[i].store(bucket.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        new_pool
            .steal_begin
            .store(self.steal_begin.load(Ordering::Relaxed), Ordering::Relaxed);
        new_pool
            .arena_index
            .store(self.arena_index.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Asserts the pool holds no tasks below `limit` (used when leaving the
    /// arena).
    pub(crate) fn debug_assert_empty_below(&self, limit: isize) {
        #[cfg(debug_assertions)]
        for i in 0..limit.max(0) as usize {
            debug_assert!(
                self.buckets[i].load(Ordering::Relaxed).is_null(),
                "leaving arena, but have tasks to do"
            );
        }
        #[cfg(not(debug_assertions))]
        let _ = limit;
    }
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("size", &self.size())
            .field("steal_begin", &self.steal_begin.load(Ordering::Relaxed))
            .field("arena_index", &self.arena_index.load(Ordering::Relaxed))
            .finish()
    }
}
