// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The process-singleton coordination object.
//!
//! The arena owns one slot per potential scheduler (workers in
//! `0..num_workers`, masters above), a mailbox per slot, the wake-up
//! [`Gate`], and the worker descriptors. Workers start lazily in a binary
//! heap fan-out: worker `i` starts `2i + 1` and `2i + 2`, so bringing up `W`
//! workers is `O(log W)` deep.
//!
//! The arena is reference counted through its `Arc`: one reference per
//! master, one per live worker thread, and one in the process-global slot.
//! It is freed when the last of those drops.

use crate::gate::Gate;
use crate::mailbox::Mailbox;
use crate::pool::{ArenaSlot, STEAL_END_UNUSED, STEAL_END_UNUSED_LOCKED};
use crate::scheduler::Scheduler;
use crate::task::AffinityId;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use util::CachePadded;

/// Marker stored into [`WorkerDescriptor::scheduler`] when shutdown begins
/// before the worker ever published itself; such a worker cleans itself up
/// and exits unregistered.
fn poisoned_worker() -> *mut Scheduler {
    ptr::without_provenance_mut(usize::MAX)
}

pub(crate) struct WorkerDescriptor {
    /// Null until the worker publishes its scheduler; [`poisoned_worker`]
    /// when shutdown won the race.
    scheduler: AtomicPtr<Scheduler>,
    /// Stored by the thread that started this worker; taken at join time.
    thread: Mutex<Option<JoinHandle<()>>>,
}

// === impl WorkerDescriptor ===

impl WorkerDescriptor {
    fn new() -> Self {
        Self {
            scheduler: AtomicPtr::new(ptr::null_mut()),
            thread: Mutex::new(None),
        }
    }

    /// The worker's scheduler, if it has published itself and was not told
    /// to die early.
    pub(crate) fn published_scheduler(&self) -> Option<NonNull<Scheduler>> {
        let s = self.scheduler.load(Ordering::Acquire);
        if s == poisoned_worker() {
            return None;
        }
        NonNull::new(s)
    }

    /// Publishes the worker's scheduler; reports `false` when shutdown beat
    /// us to it and the worker must self-destruct.
    pub(crate) fn try_publish(&self, s: NonNull<Scheduler>) -> bool {
        self.scheduler
            .compare_exchange(
                ptr::null_mut(),
                s.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn store_thread(&self, handle: JoinHandle<()>) {
        *self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn take_thread(&self) -> Option<JoinHandle<()>> {
        self.thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

pub(crate) struct Arena {
    gate: Gate,
    num_slots: usize,
    num_workers: usize,
    /// High-water mark of published slots; thieves only scan below it.
    limit: AtomicUsize,
    slots: Box<[CachePadded<ArenaSlot>]>,
    /// Mailbox `k` belongs to the occupant of slot `k`; affinity id `k + 1`
    /// addresses it.
    mailboxes: Box<[CachePadded<Mailbox>]>,
    workers: Box<[WorkerDescriptor]>,
}

// === impl Arena ===

impl Arena {
    /// Builds the arena and starts worker 0 (which fans out the rest).
    ///
    /// Sized per the lifecycle rules: `2 * num_threads` slots and
    /// `num_threads - 1` workers; the worker count never changes afterwards.
    pub(crate) fn create(num_threads: usize) -> Arc<Self> {
        debug_assert!(num_threads >= 1);
        let num_slots = 2 * num_threads;
        let num_workers = num_threads - 1;

        let slots = (0..num_slots)
            .map(|k| {
                // Worker slots start locked; their workers unlock them when
                // they move in. The rest are claimable by masters.
                CachePadded(ArenaSlot::new(if k < num_workers {
                    STEAL_END_UNUSED_LOCKED
                } else {
                    STEAL_END_UNUSED
                }))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let mailboxes = (0..num_slots)
            .map(|_| CachePadded(Mailbox::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let workers = (0..num_workers)
            .map(|_| WorkerDescriptor::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let arena = Arc::new(Self {
            gate: Gate::new(),
            num_slots,
            num_workers,
            limit: AtomicUsize::new(num_workers),
            slots,
            mailboxes,
            workers,
        });

        tracing::debug!(num_slots, num_workers, "arena created");

        if num_workers > 0 {
            Self::start_one_worker_thread(&arena, 0);
        }
        arena
    }

    /// Spawns the OS thread for worker `index`.
    pub(crate) fn start_one_worker_thread(arena: &Arc<Arena>, index: usize) {
        let for_worker = Arc::clone(arena);
        let handle = std::thread::Builder::new()
            .name(format!("weft-worker-{index}"))
            .spawn(move || crate::scheduler::worker_main(for_worker, index))
            .expect("failed to spawn worker thread");
        arena.workers[index].store_thread(handle);
    }

    #[inline]
    pub(crate) fn gate(&self) -> &Gate {
        &self.gate
    }

    #[inline]
    pub(crate) fn num_slots(&self) -> usize {
        self.num_slots
    }

    #[inline]
    pub(crate) fn num_workers(&self) -> usize {
        self.num_workers
    }

    #[inline]
    pub(crate) fn limit(&self) -> &AtomicUsize {
        &self.limit
    }

    #[inline]
    pub(crate) fn slot(&self, k: usize) -> &ArenaSlot {
        &self.slots[k]
    }

    /// The mailbox addressed by a non-zero affinity id.
    #[inline]
    pub(crate) fn mailbox(&self, id: AffinityId) -> &Mailbox {
        debug_assert!(id > 0, "affinity id 0 has no mailbox");
        &self.mailboxes[id as usize - 1]
    }

    pub(crate) fn workers(&self) -> impl Iterator<Item = &WorkerDescriptor> {
        self.workers.iter()
    }

    pub(crate) fn worker(&self, index: usize) -> &WorkerDescriptor {
        &self.workers[index]
    }

    /// Shuts down every worker and drains all mailboxes.
    ///
    /// Called by the last master after it has released its own scheduler; on
    /// return, no worker thread is running.
    pub(crate) fn terminate_workers(&self) {
        for i in (0..self.num_workers).rev() {
            let w = &self.workers[i];
            let mut scheduler = w.scheduler.load(Ordering::Acquire);
            if scheduler.is_null() {
                match w.scheduler.compare_exchange(
                    ptr::null_mut(),
                    poisoned_worker(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    // The worker has not published itself and now never
                    // will; it cleans itself up when it sees the marker.
                    Ok(_) => continue,
                    Err(actual) => scheduler = actual,
                }
            }
            debug_assert!(scheduler != poisoned_worker());
            // Safety: a published worker scheduler stays alive at least
            // until we join its thread below.
            unsafe {
                (*scheduler).signal_worker_exit();
            }
        }

        // Permanently wake up sleeping workers.
        self.gate
            .try_update(crate::gate::EMPTY, crate::gate::PERMANENTLY_OPEN, true);

        // Wait for all published workers to quit. The join handle is stored
        // by the thread that *started* the worker, so it may lag the
        // publication by an instant.
        for i in (0..self.num_workers).rev() {
            let w = &self.workers[i];
            if w.scheduler.load(Ordering::Acquire) == poisoned_worker() {
                continue;
            }
            loop {
                if let Some(handle) = w.take_thread() {
                    handle.join().expect("worker thread panicked");
                    break;
                }
                std::thread::yield_now();
            }
        }

        // All workers have quit; orphaned proxies keep their origin
        // scheduler's slab accounting alive, so hand them back properly.
        let mut drained = 0;
        for mailbox in self.mailboxes.iter() {
            drained += mailbox.drain(|proxy| {
                // Safety: every producer has quiesced; the proxy is ours.
                unsafe { crate::scheduler::deallocate_orphaned_proxy(proxy) }
            });
        }
        if drained > 0 {
            tracing::debug!(drained, "drained orphaned mailbox proxies at shutdown");
        }
    }
}

impl core::fmt::Debug for Arena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Arena")
            .field("num_slots", &self.num_slots)
            .field("num_workers", &self.num_workers)
            .field("limit", &self.limit.load(Ordering::Relaxed))
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}
