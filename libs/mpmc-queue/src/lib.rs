// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A ticket-ordered multi-producer multi-consumer FIFO queue.
//!
//! The queue consists of [`N_QUEUES`] *micro-queues*, each a singly-linked
//! list of fixed-size pages. Producers and consumers claim monotonically
//! increasing *tickets* from a pair of shared counters; ticket `k` maps to
//! micro-queue `(k * PHI) % N_QUEUES`, which spreads consecutive tickets
//! across micro-queues so that concurrent pushes rarely contend on the same
//! page. Within a micro-queue, producers (and consumers) serialize by
//! spinning on a local ticket counter, which makes the queue strictly
//! linearizable per micro-queue and FIFO with respect to ticket order
//! overall.
//!
//! The queue is unbounded by default; [`ConcurrentQueue::with_capacity`]
//! creates a bounded queue whose `push` blocks while full and whose `pop`
//! blocks while empty (both after a bounded spin). The non-blocking
//! [`try_push`][ConcurrentQueue::try_push] and
//! [`try_pop`][ConcurrentQueue::try_pop] never wait.

mod loom;

use crate::loom::{AtomicPtr, AtomicUsize, Condvar, Mutex, Ordering, UnsafeCell};
use core::fmt;
use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};
use spin::Backoff;
use util::CachePadded;

/// Number of micro-queues. Must be a power of two.
const N_QUEUES: usize = 8;

/// Ticket-to-micro-queue stride, approximately `N_QUEUES` divided by the
/// golden ratio. Must be coprime with `N_QUEUES`.
const PHI: usize = 3;

/// Capacity value that denotes an unbounded queue.
const INFINITE_CAPACITY: usize = usize::MAX / 2;

/// Map a ticket to its micro-queue index.
#[inline]
const fn index(k: usize) -> usize {
    k.wrapping_mul(PHI) % N_QUEUES
}

/// Number of item slots per page, chosen by item size so a page stays close
/// to a few cache lines.
const fn items_per_page(item_size: usize) -> usize {
    if item_size <= 8 {
        32
    } else if item_size <= 16 {
        16
    } else if item_size <= 32 {
        8
    } else if item_size <= 64 {
        4
    } else if item_size <= 128 {
        2
    } else {
        1
    }
}

/// Error returned by [`ConcurrentQueue::push`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PushError {
    /// Allocating a fresh page failed; this push poisoned its micro-queue.
    AllocFailed,
    /// The target micro-queue was poisoned by an earlier failed push.
    Poisoned,
}

/// Error returned by [`ConcurrentQueue::pop`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PopError {
    /// The claimed ticket falls into a poisoned micro-queue window.
    Poisoned,
}

/// Error returned by [`ConcurrentQueue::try_push`].
#[derive(Debug, Eq, PartialEq)]
pub enum TryPushError<T> {
    /// The queue was at capacity; the rejected item is handed back.
    Full(T),
    /// The target micro-queue was poisoned by an earlier failed push.
    Poisoned,
}

impl fmt::Display for PushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::AllocFailed => f.write_str("page allocation failed"),
            PushError::Poisoned => f.write_str("micro-queue poisoned by failed push"),
        }
    }
}

impl core::error::Error for PushError {}

impl fmt::Display for PopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("micro-queue poisoned by failed push")
    }
}

impl core::error::Error for PopError {}

impl<T> fmt::Display for TryPushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryPushError::Full(_) => f.write_str("queue is full"),
            TryPushError::Poisoned => f.write_str("micro-queue poisoned by failed push"),
        }
    }
}

/// One fixed-size page of item storage in a micro-queue.
struct Page<T> {
    next: AtomicPtr<Page<T>>,
    /// Bit `i` is set while slot `i` holds a valid item.
    mask: AtomicUsize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

/// One of the [`N_QUEUES`] sub-queues, handling every `N_QUEUES`'th ticket.
///
/// The local ticket counters hold tickets with their low `log2(N_QUEUES)`
/// bits masked off (all tickets routed here share the same residue), so they
/// advance in steps of `N_QUEUES`. An *odd* local tail value marks the
/// micro-queue as poisoned.
struct MicroQueue<T> {
    head_page: AtomicPtr<Page<T>>,
    head_ticket: AtomicUsize,
    tail_page: AtomicPtr<Page<T>>,
    tail_ticket: AtomicUsize,
    /// Serializes page-list splicing between pushers and the page-freeing pop.
    page_mutex: spin::Mutex<()>,
}

/// One end of the queue: the shared ticket counter plus the wait state for
/// threads blocked on this end, padded onto its own cache line.
struct Side {
    ticket: AtomicUsize,
    /// Number of threads currently blocked waiting on `available`.
    waiting: AtomicUsize,
    wait_mutex: Mutex<()>,
    available: Condvar,
}

/// A ticket-ordered MPMC FIFO queue, unbounded or bounded.
pub struct ConcurrentQueue<T> {
    head: CachePadded<Side>,
    tail: CachePadded<Side>,
    capacity: AtomicUsize,
    queues: [MicroQueue<T>; N_QUEUES],
    #[cfg(test)]
    fail_next_page_alloc: core::sync::atomic::AtomicBool,
}

// Safety: items are handed between threads only through the ticket protocol,
// which serializes slot access per micro-queue.
unsafe impl<T: Send> Send for ConcurrentQueue<T> {}
// Safety: see above; all shared state is atomics or lock-protected.
unsafe impl<T: Send> Sync for ConcurrentQueue<T> {}

// === impl Page ===

impl<T> Page<T> {
    /// Ticket-local slot index within a page.
    #[inline]
    fn slot_index(k: usize) -> usize {
        (k / N_QUEUES) & (items_per_page(size_of::<T>()) - 1)
    }
}

// === impl MicroQueue ===

impl<T> MicroQueue<T> {
    fn new() -> Self {
        Self {
            head_page: AtomicPtr::new(ptr::null_mut()),
            head_ticket: AtomicUsize::new(0),
            tail_page: AtomicPtr::new(ptr::null_mut()),
            tail_ticket: AtomicUsize::new(0),
            page_mutex: spin::Mutex::new(()),
        }
    }

    /// Poison this micro-queue: future pushers and consumers claimed at or
    /// past `base` fail fast.
    ///
    /// Stores `base + N_QUEUES + 1`; the odd value can never be produced by a
    /// normal push finalizer.
    fn poison(&self, base: usize) {
        tracing::warn!(base, "page allocation failed, poisoning micro-queue");
        let _lock = self.page_mutex.lock();
        self.tail_ticket
            .store(base + N_QUEUES + 1, Ordering::Release);
    }

    /// Write `item` into the slot for ticket `k` (already masked to this
    /// micro-queue's residue by the caller).
    ///
    /// `fresh` is the page allocated by the caller when `k` starts a new
    /// page; it is spliced onto the page list once this producer's turn
    /// comes up.
    fn push(&self, item: T, k: usize, fresh: Option<NonNull<Page<T>>>) -> Result<(), PushError> {
        // Wait for our turn among producers of this micro-queue.
        if self.tail_ticket.load(Ordering::Acquire) != k {
            let mut boff = Backoff::new();
            loop {
                boff.spin();
                let t = self.tail_ticket.load(Ordering::Acquire);
                if t & 1 == 1 {
                    // Poisoned by a failed push.
                    if let Some(page) = fresh {
                        // Safety: the fresh page was never published.
                        unsafe { drop(Box::from_raw(page.as_ptr())) }
                    }
                    return Err(PushError::Poisoned);
                }
                if t == k {
                    break;
                }
            }
        }

        let page = if let Some(fresh) = fresh {
            let _lock = self.page_mutex.lock();
            if let Some(tail) = NonNull::new(self.tail_page.load(Ordering::Acquire)) {
                // Safety: tail pages stay alive until the page-freeing pop,
                // which cannot run concurrently with the producer that still
                // owns ticket k on the *next* page.
                unsafe {
                    tail.as_ref()
                        .next
                        .store(fresh.as_ptr(), Ordering::Release);
                }
            } else {
                self.head_page.store(fresh.as_ptr(), Ordering::Release);
            }
            self.tail_page.store(fresh.as_ptr(), Ordering::Release);
            fresh
        } else {
            // Safety: a page for this ticket window was spliced by the
            // producer that owned the window's first ticket.
            unsafe { NonNull::new_unchecked(self.tail_page.load(Ordering::Acquire)) }
        };

        let i = Page::<T>::slot_index(k);
        // Safety: the local tail ticket protocol grants this producer
        // exclusive access to slot i until the mask bit is published.
        unsafe {
            page.as_ref().slots[i].with_mut(|slot| (*slot).write(item));
        }
        // Publish the item, then release the micro-queue to the next producer.
        // Safety: the page stays alive at least until this producer releases
        // its ticket.
        unsafe {
            page.as_ref().mask.fetch_or(1 << i, Ordering::Release);
        }
        self.tail_ticket.store(k + N_QUEUES, Ordering::Release);
        Ok(())
    }

    /// Take the item for ticket `k` (masked by the caller).
    ///
    /// Returns `Ok(None)` when the slot's present bit is clear (the push for
    /// this ticket never completed); the caller is expected to claim a new
    /// ticket and retry.
    fn pop(&self, k: usize) -> Result<Option<T>, PopError> {
        // Wait for our turn among consumers of this micro-queue.
        let mut boff = Backoff::new();
        while self.head_ticket.load(Ordering::Acquire) != k {
            boff.spin();
        }
        // Wait for the push of ticket k to complete.
        boff.reset();
        loop {
            let t = self.tail_ticket.load(Ordering::Acquire);
            if t & 1 == 1 && k + N_QUEUES + 1 >= t {
                // Ticket k falls into the poisoned window; release our turn
                // so later consumers can fail too instead of spinning.
                self.head_ticket.store(k + N_QUEUES, Ordering::Release);
                return Err(PopError::Poisoned);
            }
            if t != k {
                break;
            }
            boff.spin();
        }

        let page = self.head_page.load(Ordering::Acquire);
        debug_assert!(!page.is_null(), "pop raced past page allocation");
        // Safety: head pages stay alive until the last slot's consumer frees
        // them, and the head ticket protocol says that consumer is us or a
        // successor.
        let page = unsafe { &*page };

        let i = Page::<T>::slot_index(k);
        let ipp = items_per_page(size_of::<T>());

        let value = if page.mask.fetch_and(!(1 << i), Ordering::AcqRel) & (1 << i) != 0 {
            // Safety: the mask bit was set, so the producer finished writing
            // the slot, and clearing the bit made us its unique owner.
            Some(unsafe { page.slots[i].with(|slot| (*slot).assume_init_read()) })
        } else {
            None
        };

        if i == ipp - 1 {
            // Last slot on the page: unlink and free it. Every earlier
            // consumer of this page has already advanced head_ticket, so no
            // one else can still be reading it.
            {
                let _lock = self.page_mutex.lock();
                let next = page.next.load(Ordering::Acquire);
                self.head_page.store(next, Ordering::Release);
                if next.is_null() {
                    self.tail_page.store(ptr::null_mut(), Ordering::Release);
                }
            }
            self.head_ticket.store(k + N_QUEUES, Ordering::Release);
            // Safety: unlinked above; all slots are consumed or empty.
            unsafe { drop(Box::from_raw(ptr::from_ref(page).cast_mut())) }
        } else {
            self.head_ticket.store(k + N_QUEUES, Ordering::Release);
        }

        Ok(value)
    }
}

// === impl Side ===

impl Side {
    fn new() -> Self {
        Self {
            ticket: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            wait_mutex: Mutex::new(()),
            available: Condvar::new(),
        }
    }

    /// Block the calling thread until `ready` returns true.
    ///
    /// Spurious wakeups are fine, the predicate is always re-checked.
    fn block_until(&self, mut ready: impl FnMut() -> bool) {
        let mut guard = self
            .wait_mutex
            .lock()
            .expect("queue wait mutex poisoned");
        self.waiting.fetch_add(1, Ordering::SeqCst);
        while !ready() {
            guard = self
                .available
                .wait(guard)
                .expect("queue wait mutex poisoned");
        }
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wake all threads blocked on this side, if any.
    fn notify(&self) {
        if self.waiting.load(Ordering::SeqCst) > 0 {
            let _guard = self
                .wait_mutex
                .lock()
                .expect("queue wait mutex poisoned");
            self.available.notify_all();
        }
    }
}

// === impl ConcurrentQueue ===

impl<T> ConcurrentQueue<T> {
    /// Creates a new unbounded queue.
    pub fn new() -> Self {
        Self::with_raw_capacity(INFINITE_CAPACITY)
    }

    /// Creates a new bounded queue with room for at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "a bounded queue must have capacity >= 1");
        Self::with_raw_capacity(capacity)
    }

    fn with_raw_capacity(capacity: usize) -> Self {
        Self {
            head: CachePadded(Side::new()),
            tail: CachePadded(Side::new()),
            capacity: AtomicUsize::new(capacity),
            queues: [(); N_QUEUES].map(|()| MicroQueue::new()),
            #[cfg(test)]
            fail_next_page_alloc: core::sync::atomic::AtomicBool::new(false),
        }
    }

    #[inline]
    fn micro(&self, k: usize) -> &MicroQueue<T> {
        // The stride formula approximates LRU page reuse in a
        // cache-oblivious way.
        &self.queues[index(k)]
    }

    /// Apparent number of items in the queue.
    ///
    /// The value is `tail ticket - head ticket` and may be transiently
    /// *negative* when pops have claimed tickets ahead of in-flight pushes.
    pub fn len(&self) -> isize {
        let tail = self.tail.ticket.load(Ordering::SeqCst);
        let head = self.head.ticket.load(Ordering::SeqCst);
        tail.wrapping_sub(head) as isize
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 0
    }

    /// The queue's current capacity. Unbounded queues report a huge value.
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Changes the queue's capacity. Growing takes effect for pushes that
    /// have not yet claimed a ticket; blocked producers re-check after the
    /// next pop.
    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(
            if capacity == 0 { INFINITE_CAPACITY } else { capacity },
            Ordering::Release,
        );
    }

    /// Allocate a page, or report failure so the caller can poison the
    /// micro-queue.
    fn allocate_page(&self) -> Result<NonNull<Page<T>>, PushError> {
        #[cfg(test)]
        if self
            .fail_next_page_alloc
            .swap(false, core::sync::atomic::Ordering::SeqCst)
        {
            return Err(PushError::AllocFailed);
        }

        let ipp = items_per_page(size_of::<T>());
        let mut slots = Vec::new();
        if slots.try_reserve_exact(ipp).is_err() {
            return Err(PushError::AllocFailed);
        }
        for _ in 0..ipp {
            slots.push(UnsafeCell::new(MaybeUninit::uninit()));
        }
        let page = Box::new(Page {
            next: AtomicPtr::new(ptr::null_mut()),
            mask: AtomicUsize::new(0),
            slots: slots.into_boxed_slice(),
        });
        // Safety: Box::into_raw never returns null.
        Ok(unsafe { NonNull::new_unchecked(Box::into_raw(page)) })
    }

    /// Route ticket `k` into its micro-queue, allocating (and on failure
    /// poisoning) as needed.
    fn push_at(&self, item: T, k: usize) -> Result<(), PushError> {
        let masked = k & !(N_QUEUES - 1);
        let fresh = if Page::<T>::slot_index(masked) == 0 {
            match self.allocate_page() {
                Ok(page) => Some(page),
                Err(e) => {
                    // Mark the micro-queue so that no more pushes are allowed
                    // and claimed consumers fail fast.
                    self.micro(k).poison(masked);
                    self.head.notify();
                    return Err(e);
                }
            }
        } else {
            None
        };
        self.micro(k).push(item, masked, fresh)
    }

    /// Appends `item` to the queue, blocking while a bounded queue is full.
    ///
    /// # Errors
    ///
    /// Fails only when a page allocation fails ([`PushError::AllocFailed`],
    /// which also poisons the micro-queue) or when this push lands in a
    /// previously poisoned micro-queue ([`PushError::Poisoned`]). The item is
    /// dropped on error.
    pub fn push(&self, item: T) -> Result<(), PushError> {
        let k = self.tail.ticket.fetch_add(1, Ordering::SeqCst);

        let over_capacity = |k: usize| {
            let e = self.capacity.load(Ordering::Acquire);
            k.wrapping_sub(self.head.ticket.load(Ordering::SeqCst)) as isize >= e as isize
        };
        if over_capacity(k) {
            let mut boff = Backoff::new();
            loop {
                if !over_capacity(k) {
                    break;
                }
                if !boff.bounded_spin() {
                    // Really full: go to sleep until pops free up slots.
                    self.tail.block_until(|| !over_capacity(k));
                    break;
                }
            }
        }

        self.push_at(item, k)?;

        // A consumer may be sleeping on the item we just made visible.
        self.head.notify();
        Ok(())
    }

    /// Appends `item` without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`TryPushError::Full`] (with the item) when no slot is free at
    /// the moment of the ticket CAS, or [`TryPushError::Poisoned`] when the
    /// micro-queue was poisoned.
    pub fn try_push(&self, item: T) -> Result<(), TryPushError<T>> {
        let mut k = self.tail.ticket.load(Ordering::SeqCst);
        loop {
            let e = self.capacity.load(Ordering::Acquire);
            if k.wrapping_sub(self.head.ticket.load(Ordering::SeqCst)) as isize >= e as isize {
                return Err(TryPushError::Full(item));
            }
            // The queue had an empty slot with ticket k when we looked.
            // Attempt to claim it.
            match self.tail.ticket.compare_exchange(
                k,
                k + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => k = actual,
            }
        }

        match self.push_at(item, k) {
            Ok(()) => {
                self.head.notify();
                Ok(())
            }
            Err(_) => Err(TryPushError::Poisoned),
        }
    }

    /// Removes the oldest item, blocking while the queue is empty.
    ///
    /// # Errors
    ///
    /// Fails only when the claimed ticket falls into a poisoned micro-queue
    /// window.
    pub fn pop(&self) -> Result<T, PopError> {
        let mut boff = Backoff::new();
        loop {
            let k = self.head.ticket.fetch_add(1, Ordering::SeqCst);
            while self.tail.ticket.load(Ordering::SeqCst) <= k {
                // Queue is empty; pause and re-try a few times before
                // sleeping.
                if !boff.bounded_spin() {
                    self.head
                        .block_until(|| self.tail.ticket.load(Ordering::SeqCst) > k);
                    boff.reset();
                    break;
                }
            }
            if let Some(value) = self.micro(k).pop(k & !(N_QUEUES - 1))? {
                // A producer may be sleeping on the slot we just freed.
                self.tail.notify();
                return Ok(value);
            }
            // The push for ticket k never completed; claim the next ticket.
        }
    }

    /// Removes the oldest item if the queue is non-empty at the moment of
    /// the ticket claim. Never blocks; returns `None` when empty (or when the
    /// claimed window is poisoned).
    pub fn try_pop(&self) -> Option<T> {
        loop {
            let mut k = self.head.ticket.load(Ordering::SeqCst);
            loop {
                if self.tail.ticket.load(Ordering::SeqCst) <= k {
                    // Queue is empty.
                    return None;
                }
                // The queue held an item with ticket k when we looked.
                // Attempt to claim it.
                match self.head.ticket.compare_exchange(
                    k,
                    k + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => break,
                    Err(actual) => k = actual,
                }
            }
            match self.micro(k).pop(k & !(N_QUEUES - 1)) {
                Ok(Some(value)) => {
                    self.tail.notify();
                    return Some(value);
                }
                Ok(None) => continue,
                Err(PopError::Poisoned) => return None,
            }
        }
    }

    /// Discards all items currently in the queue.
    pub fn clear(&self) {
        while self.try_pop().is_some() {}
    }

    /// Returns an iterator over a snapshot of the queue.
    ///
    /// The snapshot captures the head ticket and the head page of every
    /// micro-queue at construction. Taking `&mut self` guarantees the
    /// documented precondition: iteration is only meaningful while no other
    /// thread pushes or pops concurrently.
    pub fn iter(&mut self) -> Iter<'_, T> {
        let mut pages = [ptr::null::<Page<T>>(); N_QUEUES];
        for (i, q) in self.queues.iter().enumerate() {
            pages[i] = q.head_page.load(Ordering::Acquire);
        }
        Iter {
            queue: self,
            pages,
            ticket: self.head.ticket.load(Ordering::Acquire),
        }
    }

    #[cfg(test)]
    fn fail_next_page_alloc(&self) {
        self.fail_next_page_alloc
            .store(true, core::sync::atomic::Ordering::SeqCst);
    }
}

impl<T> Default for ConcurrentQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ConcurrentQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for ConcurrentQueue<T> {
    fn drop(&mut self) {
        self.clear();
        // Free whatever pages remain: at most the partially consumed head
        // page per micro-queue, plus unreachable pages past a poison point.
        for q in &mut self.queues {
            let mut page = q.head_page.load(Ordering::Acquire);
            while let Some(p) = NonNull::new(page) {
                // Safety: `&mut self` means no concurrent access; the chain
                // is ours to tear down.
                let p = unsafe { p.as_ref() };
                let mask = p.mask.load(Ordering::Acquire);
                for (i, slot) in p.slots.iter().enumerate() {
                    if mask & (1 << i) != 0 {
                        // Safety: the mask bit says the slot holds a valid,
                        // unconsumed item.
                        unsafe { slot.with_mut(|s| (*s).assume_init_drop()) }
                    }
                }
                let next = p.next.load(Ordering::Acquire);
                // Safety: unlinked from the chain we are tearing down.
                unsafe { drop(Box::from_raw(page)) }
                page = next;
            }
            q.head_page.store(ptr::null_mut(), Ordering::Release);
            q.tail_page.store(ptr::null_mut(), Ordering::Release);
        }
    }
}

/// A consistent-at-construction snapshot iterator, see
/// [`ConcurrentQueue::iter`].
pub struct Iter<'a, T> {
    queue: &'a ConcurrentQueue<T>,
    pages: [*const Page<T>; N_QUEUES],
    ticket: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let ipp = items_per_page(size_of::<T>());
        loop {
            let k = self.ticket;
            if self.queue.tail.ticket.load(Ordering::Acquire) <= k {
                return None;
            }
            self.ticket = k + 1;

            let qi = index(k);
            let page = self.pages[qi];
            if page.is_null() {
                continue;
            }
            let i = Page::<T>::slot_index(k);
            // Safety: the caller promised quiescence (iter takes &mut), so
            // the snapshot pages stay alive for 'a.
            let p = unsafe { &*page };
            if i == ipp - 1 {
                self.pages[qi] = p.next.load(Ordering::Acquire);
            }
            if p.mask.load(Ordering::Acquire) & (1 << i) != 0 {
                // Safety: mask bit set means the slot holds a valid item, and
                // quiescence means nobody consumes it while we borrow it.
                return Some(unsafe { p.slots[i].with(|s| (*s).assume_init_ref()) });
            }
            // Present bit clear: slot was popped or never completed, skip.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use std::sync::Arc;

    #[test]
    fn push_pop_single_thread() {
        let q = ConcurrentQueue::new();
        for i in 0..100 {
            q.push(i).unwrap();
        }
        assert_eq!(q.len(), 100);
        for i in 0..100 {
            assert_eq!(q.try_pop(), Some(i));
        }
        assert!(q.try_pop().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn fifo_across_pages() {
        // u64 items use 32-slot pages; push enough to span several pages per
        // micro-queue.
        let q = ConcurrentQueue::new();
        let n = N_QUEUES * 32 * 4 + 7;
        for i in 0..n as u64 {
            q.push(i).unwrap();
        }
        for i in 0..n as u64 {
            assert_eq!(q.pop().unwrap(), i);
        }
    }

    #[test]
    fn try_push_respects_capacity() {
        let q = ConcurrentQueue::with_capacity(4);
        for i in 0..4 {
            q.try_push(i).unwrap();
        }
        assert!(matches!(q.try_push(99), Err(TryPushError::Full(99))));
        assert_eq!(q.try_pop(), Some(0));
        q.try_push(4).unwrap();
        let drained: Vec<_> = core::iter::from_fn(|| q.try_pop()).collect();
        assert_eq!(drained, vec![1, 2, 3, 4]);
    }

    #[test]
    fn set_capacity_unblocks_future_pushes() {
        let q = ConcurrentQueue::with_capacity(1);
        q.try_push(1u32).unwrap();
        assert!(q.try_push(2).is_err());
        q.set_capacity(8);
        q.try_push(2).unwrap();
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn big_items_one_per_page() {
        let q = ConcurrentQueue::new();
        for i in 0..32u32 {
            q.push([i; 64]).unwrap();
        }
        for i in 0..32u32 {
            assert_eq!(q.pop().unwrap(), [i; 64]);
        }
    }

    #[test]
    fn drop_releases_items() {
        struct Counted(Arc<core::sync::atomic::AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, core::sync::atomic::Ordering::SeqCst);
            }
        }

        let drops = Arc::new(core::sync::atomic::AtomicUsize::new(0));
        {
            let q = ConcurrentQueue::new();
            for _ in 0..10 {
                q.push(Counted(drops.clone())).unwrap();
            }
            let _ = q.try_pop();
        }
        assert_eq!(drops.load(core::sync::atomic::Ordering::SeqCst), 10);
    }

    #[test]
    fn poisoned_micro_queue_fails_fast() {
        let q = ConcurrentQueue::<u64>::new();
        // First push of a page window triggers the allocation; force it to
        // fail so micro-queue 0 becomes poisoned.
        q.fail_next_page_alloc();
        assert_eq!(q.push(1), Err(PushError::AllocFailed));
        // A consumer that claimed the poisoned ticket fails too.
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn snapshot_iterator() {
        let mut q = ConcurrentQueue::new();
        for i in 0..50u64 {
            q.push(i).unwrap();
        }
        // Consume a few so the snapshot starts mid-stream.
        for _ in 0..8 {
            let _ = q.try_pop();
        }
        let seen: Vec<u64> = q.iter().copied().collect();
        assert_eq!(seen, (8..50).collect::<Vec<_>>());
    }

    #[test]
    fn spsc_bounded_threads() {
        loom::model(|| {
            let q = Arc::new(ConcurrentQueue::with_capacity(8));
            let producer = {
                let q = q.clone();
                loom::thread::spawn(move || {
                    for i in 0..100_000u64 {
                        q.push(i).unwrap();
                        assert!(q.len() <= 8);
                    }
                })
            };
            let consumer = {
                let q = q.clone();
                loom::thread::spawn(move || {
                    for i in 0..100_000u64 {
                        assert_eq!(q.pop().unwrap(), i);
                    }
                })
            };
            producer.join().unwrap();
            consumer.join().unwrap();
            assert!(q.is_empty());
        });
    }

    #[test]
    fn mpmc_threads_drain_everything() {
        loom::model(|| {
            const PER_PRODUCER: u64 = 20_000;
            const PRODUCERS: u64 = 3;
            const CONSUMERS: usize = 3;

            let q = Arc::new(ConcurrentQueue::new());
            let sum = Arc::new(core::sync::atomic::AtomicU64::new(0));

            let producers: Vec<_> = (0..PRODUCERS)
                .map(|p| {
                    let q = q.clone();
                    loom::thread::spawn(move || {
                        for i in 0..PER_PRODUCER {
                            q.push(p * PER_PRODUCER + i).unwrap();
                        }
                    })
                })
                .collect();
            let consumers: Vec<_> = (0..CONSUMERS)
                .map(|_| {
                    let q = q.clone();
                    let sum = sum.clone();
                    loom::thread::spawn(move || {
                        for _ in 0..(PRODUCERS * PER_PRODUCER) as usize / CONSUMERS {
                            let v = q.pop().unwrap();
                            sum.fetch_add(v, core::sync::atomic::Ordering::SeqCst);
                        }
                    })
                })
                .collect();

            for p in producers {
                p.join().unwrap();
            }
            for c in consumers {
                c.join().unwrap();
            }

            let n = PRODUCERS * PER_PRODUCER;
            assert_eq!(
                sum.load(core::sync::atomic::Ordering::SeqCst),
                n * (n - 1) / 2
            );
            assert!(q.is_empty());
        });
    }
}
