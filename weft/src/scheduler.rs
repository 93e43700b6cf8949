// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-thread scheduler and its dispatch loop.
//!
//! Every thread that participates in the runtime (worker or master) owns one
//! [`Scheduler`]: a depth-indexed task pool, a mailbox attachment, small-task
//! free lists, and the dispatch loop itself. Schedulers cooperate purely
//! through shared arena state: the pool is published through an arena slot
//! so thieves can lock it, affinity-tagged tasks travel as mailbox proxies,
//! and idle threads park on the arena gate.
//!
//! Lifetimes are managed by two counters. `small_task_count` starts at one
//! (a guard held by the scheduler itself) and counts the slabs this
//! scheduler has allocated; whichever thread drives it to zero frees the
//! scheduler object, which may be long after the owning thread is gone. The
//! `return_list` receives slabs freed by other threads and is plugged with a
//! sentinel at shutdown so late frees deallocate directly.

use crate::arena::Arena;
use crate::context::{CapturedPanic, ContextInner};
use crate::error::AllocFailed;
use crate::gate;
use crate::mailbox::MailInbox;
use crate::pool::{
    ArenaSlot, MIN_ARRAY_SIZE, NULL_ARENA_INDEX, STEAL_END_EMPTY, STEAL_END_UNUSED,
    STEAL_END_UNUSED_LOCKED, TaskPool,
};
use crate::task::state::Lifecycle;
use crate::task::{
    AffinityId, Header, Job, PROXY_MAILBOX_BIT, PROXY_POOL_BIT, PROXY_TAG_MASK, ProxyTask,
    QUICK_TASK_SIZE, Stub, Task, TaskList, TaskRef,
};
use core::alloc::Layout;
use core::cell::Cell;
use core::marker::PhantomData;
use core::panic::AssertUnwindSafe;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize, Ordering, fence};
use std::sync::Arc;
use util::FastRand;

/// Steal failures before an idle thread starts yielding, per arena slot
/// scanned. Tunable, not contractual.
const STEAL_YIELD_FACTOR: i64 = 2;
/// Further failures (past the yield threshold) before a worker parks on the
/// gate. Tunable, not contractual.
const STEAL_PARK_SLACK: i64 = 100;

/// Sentinel stored into `return_list` at shutdown: pushes must fall back to
/// deallocating directly.
fn plugged_return_list() -> *mut Header {
    ptr::without_provenance_mut(1)
}

pub(crate) struct Scheduler {
    // --- dispatch state, owner thread only ---
    /// Cached largest depth with a non-empty bucket; `-1` when the pool is
    /// empty.
    deepest: Cell<isize>,
    array_size: Cell<usize>,
    /// Points at `dummy_slot` while unpublished, at an arena slot otherwise.
    arena_slot: Cell<NonNull<ArenaSlot>>,
    /// The private slot that holds the task pool while this scheduler is not
    /// published in the arena.
    dummy_slot: ArenaSlot,
    inbox: MailInbox,
    innermost_running_task: Cell<Option<NonNull<Header>>>,
    /// Sentinel parent for the outermost dispatch loop.
    dummy_task: Cell<Option<NonNull<Header>>>,
    free_list: Cell<Option<NonNull<Header>>>,
    affinity_id: Cell<AffinityId>,
    random: Cell<FastRand>,
    /// Nested `Runtime` initializations on this thread.
    init_ref_count: Cell<usize>,
    is_worker: bool,
    arena: Arc<Arena>,

    // --- shared state, any thread ---
    /// Live slabs allocated by this scheduler, plus one guard reference.
    small_task_count: AtomicIsize,
    /// Slabs freed by other threads, waiting to be reused here.
    return_list: AtomicPtr<Header>,
    /// Snapshot of the global cancellation generation; equality with the
    /// global counter means this thread has observed every propagation.
    pub(crate) local_cancel_count: AtomicUsize,
    /// Head of the intrusive list of contexts created on this thread.
    context_list_first: AtomicPtr<ContextInner>,
    context_list_mutex: spin::Mutex<()>,
    /// Links on the global master-scheduler list (masters only).
    pub(crate) master_prev: AtomicPtr<Scheduler>,
    pub(crate) master_next: AtomicPtr<Scheduler>,
}

// Safety: the `Cell` fields above are only ever touched by the owning
// thread (the one that created the scheduler, or the worker thread it was
// created for); every cross-thread field is an atomic or lock-protected.
unsafe impl Sync for Scheduler {}
// Safety: see above; the owner role is transferred between threads only at
// scheduler creation.
unsafe impl Send for Scheduler {}

// === impl Scheduler ===

impl Scheduler {
    /// Allocates a scheduler on the heap and returns the raw handle that the
    /// `small_task_count` protocol will eventually free.
    pub(crate) fn new_raw(arena: Arc<Arena>, is_worker: bool) -> NonNull<Scheduler> {
        let pool = TaskPool::new(MIN_ARRAY_SIZE);
        let scheduler = Box::new(Scheduler {
            deepest: Cell::new(-1),
            array_size: Cell::new(MIN_ARRAY_SIZE),
            // Fixed up below once the allocation has its final address.
            arena_slot: Cell::new(NonNull::dangling()),
            dummy_slot: ArenaSlot::new(STEAL_END_EMPTY),
            inbox: MailInbox::new(),
            innermost_running_task: Cell::new(None),
            dummy_task: Cell::new(None),
            free_list: Cell::new(None),
            affinity_id: Cell::new(0),
            random: Cell::new(FastRand::from_seed(0)),
            init_ref_count: Cell::new(1),
            is_worker,
            arena,
            small_task_count: AtomicIsize::new(1), // extra 1 is a guard reference
            return_list: AtomicPtr::new(ptr::null_mut()),
            local_cancel_count: AtomicUsize::new(0),
            context_list_first: AtomicPtr::new(ptr::null_mut()),
            context_list_mutex: spin::Mutex::new(()),
            master_prev: AtomicPtr::new(ptr::null_mut()),
            master_next: AtomicPtr::new(ptr::null_mut()),
        });
        let this = NonNull::from(Box::leak(scheduler));
        // Safety: freshly leaked, nothing else references it yet.
        unsafe {
            let s = this.as_ref();
            s.arena_slot.set(NonNull::from(&s.dummy_slot));
            s.dummy_slot
                .task_pool
                .store(Box::into_raw(pool), Ordering::Relaxed);
            s.random
                .set(FastRand::from_seed(this.as_ptr() as u64 | 1));

            // Allocation failure is recoverable everywhere else, but a
            // scheduler without its dummy task is unusable, so it is fatal
            // during construction.
            let dummy = s
                .allocate_task(Stub, -1, None, ptr::null_mut())
                .expect("scheduler construction failed: no memory for the dummy task")
                .into_raw();
            dummy.as_ref().ref_count.store(2, Ordering::Relaxed);
            s.dummy_task.set(Some(dummy));
        }
        this
    }

    #[inline]
    pub(crate) fn arena(&self) -> &Arena {
        &self.arena
    }

    #[inline]
    pub(crate) fn is_worker(&self) -> bool {
        self.is_worker
    }

    #[inline]
    pub(crate) fn dummy_task(&self) -> NonNull<Header> {
        self.dummy_task.get().expect("scheduler has no dummy task")
    }

    #[inline]
    pub(crate) fn innermost_running_task(&self) -> Option<NonNull<Header>> {
        self.innermost_running_task.get()
    }

    #[inline]
    pub(crate) fn init_ref_count(&self) -> &Cell<usize> {
        &self.init_ref_count
    }

    #[inline]
    fn current_slot(&self) -> &ArenaSlot {
        // Safety: arena_slot points either at our own dummy_slot or at an
        // arena slot; both outlive the scheduler's dispatch activity.
        unsafe { self.arena_slot.get().as_ref() }
    }

    #[inline]
    fn in_arena(&self) -> bool {
        !ptr::eq(self.arena_slot.get().as_ptr(), &raw const self.dummy_slot)
    }

    #[inline]
    fn task_pool(&self) -> &TaskPool {
        // Safety: the pool is owned by this scheduler and replaced only
        // under the pool lock by the owner itself.
        unsafe { &*self.dummy_slot.task_pool.load(Ordering::Relaxed) }
    }

    fn acquire_pool(&self) {
        self.current_slot().acquire();
    }

    fn release_pool(&self) {
        self.current_slot().release(self.deepest.get());
    }

    // --- task allocation & reclamation -----------------------------------

    /// Allocates and initializes a task for `job`.
    ///
    /// Small tasks come from the free list, the return list, or a fresh
    /// slab, in that order; anything that does not fit a slab is allocated
    /// individually.
    ///
    /// # Errors
    ///
    /// Fails when the underlying storage allocation fails. Nothing has been
    /// mutated at that point, so the caller can retry later or give up on
    /// the spawning operation; the dispatch loop keeps running either way.
    pub(crate) fn allocate_task<J: Job>(
        &self,
        job: J,
        depth: i32,
        parent: Option<NonNull<Header>>,
        context: *mut ContextInner,
    ) -> Result<TaskRef, AllocFailed> {
        let (storage, origin, big) = if Task::<J>::fits_slab() {
            (self.allocate_small_slab()?, ptr::from_ref(self), false)
        } else {
            let storage = crate::alloc::allocate(Layout::new::<Task<J>>())?;
            crate::task::note_task_allocated();
            (storage, ptr::null(), true)
        };
        let header = Header::new(
            &Task::<J>::VTABLE,
            parent,
            depth,
            context,
            self,
            origin,
            false,
            big,
        );
        // Safety: storage is big and aligned enough for Task<J> by
        // construction.
        unsafe { Task::<J>::initialize(storage, header, job) }
        Ok(TaskRef::from_raw(storage.cast()))
    }

    /// Pops a small-task slab from the free list, stealing the whole return
    /// list when the free list is dry, or allocating a fresh slab.
    ///
    /// # Errors
    ///
    /// Fails only on the fresh-slab path, when the allocator has no memory.
    fn allocate_small_slab(&self) -> Result<NonNull<u8>, AllocFailed> {
        if let Some(t) = self.free_list.get() {
            // Safety: free-list nodes are dead slabs owned by this scheduler.
            unsafe {
                debug_assert_eq!(
                    t.as_ref().state.lifecycle(),
                    Lifecycle::Freed,
                    "free list of tasks is corrupted"
                );
                self.free_list.set(t.as_ref().next_task());
            }
            return Ok(t.cast());
        }
        if !self.return_list.load(Ordering::Relaxed).is_null() {
            let t = self.return_list.swap(ptr::null_mut(), Ordering::AcqRel);
            debug_assert!(t != plugged_return_list());
            if let Some(t) = NonNull::new(t) {
                // Safety: the swap made the chain exclusively ours.
                unsafe {
                    debug_assert!(
                        ptr::eq(t.as_ref().origin.load(Ordering::Relaxed), self),
                        "task returned to wrong return_list"
                    );
                    self.free_list.set(t.as_ref().next_task());
                }
                return Ok(t.cast());
            }
        }
        let storage = crate::alloc::allocate(Self::slab_layout())?;
        crate::task::note_task_allocated();
        self.small_task_count.fetch_add(1, Ordering::Relaxed);
        Ok(storage)
    }

    fn slab_layout() -> Layout {
        // The alignment is raised to a full cache line by the allocator.
        Layout::from_size_align(QUICK_TASK_SIZE, align_of::<Header>())
            .expect("slab layout is valid")
    }

    /// Drops the job payload and reclaims the task's storage.
    ///
    /// # Safety
    ///
    /// `t` must be a live task that no other thread can reach anymore.
    pub(crate) unsafe fn destroy_task(&self, t: NonNull<Header>) {
        // Safety: ensured by caller
        unsafe {
            let drop_job = t.as_ref().vtable.drop_job;
            drop_job(t);
            self.free_task(t);
        }
    }

    /// Returns a dead task's storage to whichever free list owns it.
    ///
    /// # Safety
    ///
    /// `t`'s job must already be dropped (or trivially absent), and no other
    /// thread may reach the task.
    pub(crate) unsafe fn free_task(&self, t: NonNull<Header>) {
        // Safety: ensured by caller
        unsafe {
            let h = t.as_ref();
            debug_assert!(matches!(
                h.state.lifecycle(),
                Lifecycle::Executing | Lifecycle::Allocated
            ));
            h.state.transition(Lifecycle::Freed);
            let origin = h.origin.load(Ordering::Relaxed);
            if ptr::eq(origin, self) {
                h.next.store(
                    self.free_list
                        .get()
                        .map_or(ptr::null_mut(), NonNull::as_ptr),
                    Ordering::Relaxed,
                );
                self.free_list.set(Some(t));
            } else if !origin.is_null() {
                free_nonlocal_small_task(t);
            } else {
                deallocate_big_task(t);
            }
        }
    }

    // --- spawning ---------------------------------------------------------

    /// Spawns a single task.
    ///
    /// # Safety
    ///
    /// `t` must be an allocated task owned by this thread.
    pub(crate) unsafe fn spawn_single(&self, t: NonNull<Header>) {
        // Safety: ensured by caller
        unsafe {
            t.as_ref().next.store(ptr::null_mut(), Ordering::Relaxed);
            self.spawn_chain(t);
        }
    }

    /// Spawns an intrusive chain of tasks that all share one depth.
    ///
    /// Affinity-tagged tasks whose target is another thread are replaced in
    /// the chain by freshly mailed proxies; the real task is reachable from
    /// the proxy only.
    ///
    /// # Safety
    ///
    /// Every task in the chain must be allocated, owned by this thread, and
    /// linked through `Header::next` with a null terminator.
    pub(crate) unsafe fn spawn_chain(&self, first: NonNull<Header>) {
        // Safety: ensured by caller
        unsafe {
            let d = first.as_ref().depth() as isize;
            let mut new_head: Option<NonNull<Header>> = None;
            let mut tail: Option<NonNull<Header>> = None;
            let mut cursor = Some(first);
            while let Some(t) = cursor {
                let h = t.as_ref();
                cursor = h.next_task();
                debug_assert_eq!(
                    h.state.lifecycle(),
                    Lifecycle::Allocated,
                    "attempt to spawn task that is not in 'allocated' state"
                );
                debug_assert_eq!(h.depth() as isize, d, "tasks must have same depth");
                h.owner.store(ptr::from_ref(self).cast_mut(), Ordering::Relaxed);
                #[cfg(debug_assertions)]
                if let Some(parent) = h.parent() {
                    let rc = parent.as_ref().ref_count.load(Ordering::Relaxed);
                    debug_assert!(
                        rc > 0,
                        "attempt to spawn task whose parent has a ref_count<=0 (forgot set_ref_count?)"
                    );
                    parent.as_ref().state.set_ref_count_active(true);
                }
                h.state.transition(Lifecycle::Ready);

                let dst = h.affinity.load(Ordering::Relaxed);
                let node = if dst != 0 && dst != self.affinity_id.get() {
                    // Affinity is advisory: if proxy storage is unavailable
                    // the task simply stays in our pool, and whoever runs it
                    // hears about the placement through note_affinity.
                    self.try_mail_proxy(t, dst).unwrap_or(t)
                } else {
                    t
                };
                match tail {
                    Some(prev) => prev.as_ref().next.store(node.as_ptr(), Ordering::Relaxed),
                    None => new_head = Some(node),
                }
                node.as_ref().next.store(ptr::null_mut(), Ordering::Relaxed);
                tail = Some(node);
            }
            let (new_head, tail) = (new_head.expect("empty spawn chain"), tail.expect("empty spawn chain"));

            debug_assert!(d >= 0, "spawned task depth must be non-negative");
            if d >= self.array_size.get() as isize {
                self.grow((d + 1) as usize);
            }
            if self.in_arena() {
                self.acquire_pool();
            } else {
                // Leaves the (possibly newly claimed) slot locked.
                self.try_enter_arena();
            }
            let pool = self.task_pool();
            pool.link_chain(d as usize, new_head, tail);
            if d > self.deepest.get() {
                self.deepest.set(d);
            }
            if d < pool.steal_begin.load(Ordering::Relaxed) {
                pool.steal_begin.store(d, Ordering::Relaxed);
            }
            self.release_pool();
            self.mark_pool_full();
            tracing::trace!(depth = d, "spawned task chain");
        }
    }

    /// Builds a mailed proxy standing in for affinity-tagged task `t`.
    ///
    /// Returns `None` when proxy storage cannot be allocated; the caller
    /// keeps the real task in its own pool instead.
    ///
    /// # Safety
    ///
    /// `t` must be a ready task owned by this thread; `dst` must be a live
    /// mailbox id.
    unsafe fn try_mail_proxy(&self, t: NonNull<Header>, dst: AffinityId) -> Option<NonNull<Header>> {
        let storage = self.allocate_small_slab().ok()?;
        let outbox = NonNull::from(self.arena.mailbox(dst));
        let header = Header::new(
            &ProxyTask::VTABLE,
            None,
            // Safety: ensured by caller.
            unsafe { t.as_ref().depth() },
            ptr::null_mut(),
            self,
            self,
            true,
            false,
        );
        header.state.transition(Lifecycle::Ready);
        let proxy = storage.cast::<ProxyTask>();
        // Safety: slab storage fits a ProxyTask (static assertion) and is
        // exclusively ours.
        unsafe {
            proxy.write(ProxyTask {
                header,
                task_and_tag: AtomicUsize::new(
                    t.as_ptr() as usize | PROXY_POOL_BIT | PROXY_MAILBOX_BIT,
                ),
                next_in_mailbox: AtomicPtr::new(ptr::null_mut()),
                outbox: AtomicPtr::new(outbox.as_ptr()),
            });
        }
        // Mail the proxy; from here on the recipient races us for the task.
        // Safety: the mailbox lives in the arena.
        unsafe {
            outbox.as_ref().push(proxy);
        }
        tracing::trace!(dst, "mailed task proxy");
        Some(proxy.cast())
    }

    /// Wakes sleeping workers if the gate is not already open.
    ///
    /// Deliberately sloppy about fences: a missed wakeup here is tolerated
    /// because parking re-scans every published slot first, and the runtime
    /// promises parallelism, never a specific interleaving.
    fn mark_pool_full(&self) {
        let snapshot = self.arena.gate().get_state();
        if snapshot != gate::FULL && snapshot != gate::PERMANENTLY_OPEN {
            self.arena.gate().try_update(snapshot, gate::FULL, true);
        }
    }

    /// Parks on the gate until work may exist. Returns `true` after an
    /// actual sleep, `false` when the scan found work (or shutdown opened
    /// the gate for good).
    fn wait_while_pool_is_empty(&self) -> bool {
        loop {
            let snapshot = self.arena.gate().get_state();
            match snapshot {
                gate::EMPTY => {
                    self.arena.gate().wait();
                    return true;
                }
                gate::FULL => {
                    // Use a unique id for "busy" in order to avoid ABA
                    // problems with other snapshot takers.
                    let busy = ptr::from_ref(self) as gate::State;
                    self.arena.gate().try_update(gate::FULL, busy, false);
                    if self.arena.gate().get_state() == busy {
                        // Got permission, take the snapshot.
                        let n = self.arena.limit().load(Ordering::Acquire);
                        let found = (0..n).any(|k| self.arena.slot(k).looks_nonempty());
                        // Test and test-and-set.
                        if self.arena.gate().get_state() == busy {
                            if found {
                                self.arena.gate().try_update(busy, gate::FULL, false);
                            } else {
                                self.arena.gate().try_update(busy, gate::EMPTY, false);
                                continue;
                            }
                        }
                    }
                    return false;
                }
                // Another thread is taking a snapshot, or the gate is
                // permanently open.
                _ => return false,
            }
        }
    }

    // --- pool membership --------------------------------------------------

    /// Claims an unused arena slot (if any) and publishes the task pool in
    /// it. The slot (claimed or not) is left *locked* for the caller's
    /// insert.
    fn try_enter_arena(&self) {
        debug_assert!(!self.in_arena(), "already in arena");
        let n = self.arena.num_slots();
        let start = self.arena.limit().load(Ordering::Relaxed);
        for k in start..n {
            let slot = self.arena.slot(k);
            if slot.steal_end.load(Ordering::Relaxed) == STEAL_END_UNUSED
                && slot
                    .steal_end
                    .compare_exchange(
                        STEAL_END_UNUSED,
                        STEAL_END_UNUSED_LOCKED,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                let pool = self.task_pool();
                pool.arena_index.store(k, Ordering::Relaxed);
                slot.task_pool.store(
                    self.dummy_slot.task_pool.load(Ordering::Relaxed),
                    Ordering::Release,
                );
                slot.owner_waits.store(false, Ordering::Relaxed);
                self.arena_slot.set(NonNull::from(slot));
                // Successfully claimed a spot; raise the publication
                // high-water mark.
                self.arena.limit().fetch_max(k + 1, Ordering::AcqRel);
                self.attach_mailbox((k + 1) as AffinityId);
                tracing::trace!(slot = k, "entered arena");
                break;
            }
        }
        // Either our freshly claimed slot or still the private one; in both
        // cases leave it locked so the caller can insert.
        self.current_slot()
            .steal_end
            .store(2 * self.deepest.get() + 1, Ordering::Release);
    }

    fn attach_mailbox(&self, id: AffinityId) {
        self.inbox.attach(NonNull::from(self.arena.mailbox(id)));
        self.affinity_id.set(id);
    }

    /// Withdraws from the arena, detaching the mailbox and (for a master
    /// with `compress`) garbage collecting trailing unused slots.
    fn leave_arena(&self, compress: bool) {
        debug_assert!(self.in_arena(), "not in arena");
        self.acquire_pool();
        let pool = self.task_pool();
        pool.debug_assert_empty_below(self.deepest.get());
        let k = pool.arena_index.load(Ordering::Relaxed);
        debug_assert!(k != NULL_ARENA_INDEX);
        let slot = self.arena.slot(k);
        debug_assert!(ptr::eq(slot, self.arena_slot.get().as_ptr()));

        slot.task_pool.store(ptr::null_mut(), Ordering::Relaxed);
        self.affinity_id.set(0);
        self.inbox.detach();
        pool.arena_index.store(NULL_ARENA_INDEX, Ordering::Relaxed);
        self.arena_slot.set(NonNull::from(&self.dummy_slot));
        self.dummy_slot.owner_waits.store(false, Ordering::Relaxed);

        let n = self.arena.num_workers();
        debug_assert!(!compress || k >= n, "must be master to compress");
        if compress && self.arena.limit().load(Ordering::Relaxed) == k + 1 {
            // Garbage collect trailing slots.
            let mut k = k;
            loop {
                let prev = match self.arena.limit().compare_exchange(
                    k + 1,
                    k,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(v) | Err(v) => v,
                };
                self.arena
                    .slot(k)
                    .steal_end
                    .store(STEAL_END_UNUSED, Ordering::Release);
                if prev != k + 1 || k == n {
                    break;
                }
                k -= 1;
                let trailing = self.arena.slot(k);
                if !(trailing.steal_end.load(Ordering::Relaxed) == STEAL_END_UNUSED
                    && trailing
                        .steal_end
                        .compare_exchange(
                            STEAL_END_UNUSED,
                            STEAL_END_UNUSED_LOCKED,
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        )
                        .is_ok())
                {
                    break;
                }
            }
        } else {
            slot.steal_end.store(STEAL_END_UNUSED, Ordering::Release);
        }
        tracing::trace!(slot = k, compress, "left arena");
    }

    /// Doubles the pool (at least to `minimum_size`) while keeping every
    /// linked task in place.
    fn grow(&self, minimum_size: usize) {
        let new_size = (2 * minimum_size).max(MIN_ARRAY_SIZE);
        let new_pool = TaskPool::new(new_size);
        self.acquire_pool();
        let old = self.dummy_slot.task_pool.load(Ordering::Relaxed);
        // Safety: we own the pool; thieves are locked out.
        unsafe {
            (*old).migrate_into(&new_pool);
        }
        let new_ptr = Box::into_raw(new_pool);
        self.dummy_slot.task_pool.store(new_ptr, Ordering::Relaxed);
        if self.in_arena() {
            self.current_slot().task_pool.store(new_ptr, Ordering::Release);
        }
        self.array_size.set(new_size);
        self.release_pool();
        // Safety: unpublished above; no thief can hold a reference since we
        // held the lock across the swap.
        unsafe { drop(Box::from_raw(old)) }
    }

    // --- taking & stealing work -------------------------------------------

    /// Takes the deepest task at depth >= `d` from the local pool.
    fn get_task(&self, d: isize) -> Option<NonNull<Header>> {
        loop {
            let mut result = None;
            if self.deepest.get() >= d {
                self.acquire_pool();
                let pool = self.task_pool();
                let mut i = self.deepest.get();
                while i >= d {
                    let bucket = pool.bucket(i as usize);
                    if let Some(t) = NonNull::new(bucket.load(Ordering::Relaxed)) {
                        // Safety: pool lock held; bucket nodes are live.
                        let next = unsafe { t.as_ref().next.load(Ordering::Relaxed) };
                        bucket.store(next, Ordering::Relaxed);
                        if next.is_null() {
                            i -= 1;
                        }
                        result = Some(t);
                        break;
                    }
                    i -= 1;
                }
                self.deepest.set(i);
                self.release_pool();
            }
            let t = result?;
            // Safety: we just unlinked t under the pool lock.
            if unsafe { t.as_ref().is_proxy() } {
                // Safety: t is a proxy we now exclusively hold on the pool
                // side.
                match unsafe { self.strip_proxy(t.cast()) } {
                    Some(real) => {
                        // Task affinity was not honored.
                        // Safety: the CAS gave us exclusive claim on `real`.
                        unsafe {
                            let note = real.as_ref().vtable.note_affinity;
                            note(real, self.affinity_id.get());
                        }
                        return Some(real);
                    }
                    // The mailbox side won; try again.
                    None => continue,
                }
            }
            return Some(t);
        }
    }

    /// Resolves a proxy taken from a pool: either claims the real task or
    /// frees the proxy and reports that the mailbox consumer won.
    ///
    /// # Safety
    ///
    /// The caller must have unlinked the proxy from a task pool.
    unsafe fn strip_proxy(&self, proxy: NonNull<ProxyTask>) -> Option<NonNull<Header>> {
        // Safety: ensured by caller
        unsafe {
            let p = proxy.as_ref();
            let tat = p.task_and_tag.load(Ordering::Acquire);
            if tat & PROXY_TAG_MASK == PROXY_TAG_MASK {
                // Shared by the pool and a mailbox: attempt to transition to
                // "empty proxy in mailbox".
                if p.task_and_tag
                    .compare_exchange(
                        tat,
                        PROXY_MAILBOX_BIT,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    // Grabbed the task; the mailbox gets to free the proxy.
                    return ProxyTask::task(tat);
                }
                debug_assert_eq!(
                    p.task_and_tag.load(Ordering::Relaxed),
                    PROXY_POOL_BIT,
                    "proxy tag protocol violated"
                );
            }
            // We have exclusive access to the proxy and the mailbox consumer
            // already took the task.
            p.header.state.transition(Lifecycle::Allocated);
            self.free_task(proxy.cast());
            None
        }
    }

    /// Takes the next mailed task whose proxy has not been claimed from the
    /// pool side.
    fn get_mailbox_task(&self) -> Option<NonNull<Header>> {
        debug_assert!(self.affinity_id.get() > 0, "not in arena");
        while let Some(proxy) = self.inbox.pop() {
            // Safety: popping made us the proxy's mailbox-side owner.
            unsafe {
                let p = proxy.as_ref();
                let tat = p.task_and_tag.load(Ordering::Acquire);
                if tat != PROXY_MAILBOX_BIT
                    && p.task_and_tag
                        .compare_exchange(tat, PROXY_POOL_BIT, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    // Successfully grabbed the task; the pool seeker frees
                    // the proxy.
                    let task = ProxyTask::task(tat).expect("proxy tag lost its task");
                    task.as_ref()
                        .owner
                        .store(ptr::from_ref(self).cast_mut(), Ordering::Relaxed);
                    tracing::trace!("took task from mailbox");
                    return Some(task);
                }
                p.header.state.transition(Lifecycle::Allocated);
                self.free_task(proxy.cast());
            }
        }
        None
    }

    /// Attempts to steal a task of depth >= `d` from `victim`'s pool.
    fn steal_task(&self, victim: &ArenaSlot, d: isize) -> Option<NonNull<Header>> {
        let mut boff = spin::Backoff::new();
        let mut steal_end = victim.steal_end.load(Ordering::Acquire);
        loop {
            if steal_end >> 1 < d {
                // Nothing of interest to steal.
                return None;
            }
            if steal_end & 1 == 1 {
                if victim.owner_waits.load(Ordering::Relaxed) {
                    // The pool owner wants its lock back; abandon the
                    // attempt rather than invert priorities.
                    return None;
                }
                boff.spin();
                steal_end = victim.steal_end.load(Ordering::Acquire);
                continue;
            }
            match victim.steal_end.compare_exchange(
                steal_end,
                steal_end + 1,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => steal_end = actual,
            }
        }

        // Locked. `steal_end` holds the pre-lock (even) value.
        // Safety: the lock keeps the pool published and its buckets stable.
        let result = unsafe {
            let pool = &*victim.task_pool.load(Ordering::Acquire);
            let top = steal_end >> 1;
            let mut i = pool.steal_begin.load(Ordering::Relaxed).max(d);
            let mut result = None;
            'scan: while i <= top {
                let bucket = pool.bucket(i as usize);
                let mut prev: Option<NonNull<Header>> = None;
                let mut cursor = NonNull::new(bucket.load(Ordering::Relaxed));
                while let Some(t) = cursor {
                    if t.as_ref().is_proxy() {
                        let p = t.cast::<ProxyTask>();
                        let tat = p.as_ref().task_and_tag.load(Ordering::Relaxed);
                        let outbox = p.as_ref().outbox.load(Ordering::Relaxed);
                        if tat & PROXY_TAG_MASK == PROXY_TAG_MASK
                            && (*outbox).recipient_is_idle()
                        {
                            // The task will likely be grabbed by whom it was
                            // mailed to; skip it.
                            prev = Some(t);
                            cursor = t.as_ref().next_task();
                            continue;
                        }
                    }
                    let next = t.as_ref().next.load(Ordering::Relaxed);
                    match prev {
                        Some(p) => p.as_ref().next.store(next, Ordering::Relaxed),
                        None => bucket.store(next, Ordering::Relaxed),
                    }
                    result = Some(t);
                    break 'scan;
                }
                // Unlike get_task we do not chase emptied buckets downward;
                // spawns update steal_begin anyway and stealing is rare by
                // comparison.
                i += 1;
            }
            let mut release_value = steal_end;
            if pool.steal_begin.load(Ordering::Relaxed) >= d {
                pool.steal_begin.store(i, Ordering::Relaxed);
                if i > top {
                    // Pool is drained; important information for snapshot
                    // takers.
                    release_value = STEAL_END_EMPTY;
                }
            }
            victim.steal_end.store(release_value, Ordering::Release);
            result
        };
        result
    }

    // --- the dispatch loop ------------------------------------------------

    /// Runs tasks until `parent`'s ref count drops to one.
    ///
    /// `child`, if given, is executed first without going through the pool.
    ///
    /// # Safety
    ///
    /// Must run on the scheduler's owner thread. `parent` must be a live
    /// task with ref count >= 2 when `child` is given (>= 1 otherwise), and
    /// `child` must be owned by this scheduler.
    pub(crate) unsafe fn wait_for_all(&self, parent: NonNull<Header>, child: Option<NonNull<Header>>) {
        // Safety: ensured by caller
        unsafe {
            let ph = parent.as_ref();
            #[cfg(debug_assertions)]
            {
                if let Some(child) = child {
                    debug_assert!(ptr::eq(child.as_ref().owner.load(Ordering::Relaxed), self));
                    debug_assert!(ph.ref_count.load(Ordering::Relaxed) >= 2);
                } else {
                    debug_assert!(ph.ref_count.load(Ordering::Relaxed) >= 1);
                }
            }

            // Compute the dispatch depth: the innermost master loop runs at
            // depth zero to flatten top-level work.
            let d = if self.innermost_running_task.get() == self.dummy_task.get() {
                debug_assert!(!self.is_worker);
                0
            } else {
                ph.depth() as isize + 1
            };
            let old_innermost = self.innermost_running_task.get();

            let mut t = child;
            // Outer loop steals tasks when necessary.
            'outer: loop {
                // Middle loop evaluates tasks pulled out of the pool.
                loop {
                    // Inner loop evaluates tasks handed to us directly by
                    // other tasks (the scheduler bypass).
                    while let Some(task) = t {
                        let h = task.as_ref();
                        debug_assert!(!h.is_proxy(), "unexpected proxy");
                        debug_assert!(ptr::eq(h.owner.load(Ordering::Relaxed), self));
                        debug_assert!(matches!(
                            h.state.lifecycle(),
                            Lifecycle::Allocated | Lifecycle::Ready | Lifecycle::Reexecute
                        ));

                        let ctx = h.context();
                        // Safety: a task's context outlives the task.
                        let cancelled =
                            ctx.is_some_and(|c| unsafe { c.as_ref().is_cancelled() });
                        h.state.transition(Lifecycle::Executing);

                        let mut t_next = None;
                        if !cancelled {
                            self.innermost_running_task.set(Some(task));
                            let mut cx = Execution {
                                scheduler: self,
                                current: task,
                                _not_send: PhantomData,
                            };
                            let execute = h.vtable.execute;
                            match std::panic::catch_unwind(AssertUnwindSafe(|| {
                                // Safety: the task is live and in the
                                // executing state; we are the dispatch loop.
                                unsafe { execute(task, &mut cx) }
                            })) {
                                Ok(next) => t_next = next,
                                Err(payload) => {
                                    // First canceller stores the payload;
                                    // everyone else just observes the
                                    // cancelled context.
                                    if let Some(c) = ctx {
                                        if c.as_ref().try_cancel() {
                                            c.as_ref()
                                                .store_panic(CapturedPanic::new(payload));
                                            crate::context::propagate_cancellation();
                                        }
                                    }
                                    tracing::debug!("task panicked; group cancelled");
                                }
                            }
                        }

                        if let Some(next) = t_next {
                            debug_assert_eq!(
                                next.as_ref().state.lifecycle(),
                                Lifecycle::Allocated,
                                "if execute() returns a task, it must be in the allocated state"
                            );
                            // The store also pulls *next toward this cache.
                            next.as_ref()
                                .owner
                                .store(ptr::from_ref(self).cast_mut(), Ordering::Relaxed);
                        }

                        match h.state.lifecycle() {
                            Lifecycle::Executing => {
                                // Ordinary completion: finish the parent if
                                // we were its last outstanding child.
                                if let Some(s) = h.parent() {
                                    let sh = s.as_ref();
                                    if sh.ref_count.fetch_sub(1, Ordering::Release) == 1 {
                                        fence(Ordering::Acquire);
                                        let s_depth = sh.depth() as isize;
                                        sh.state.set_ref_count_active(false);
                                        sh.owner.store(
                                            ptr::from_ref(self).cast_mut(),
                                            Ordering::Relaxed,
                                        );
                                        if t_next.is_none()
                                            && s_depth >= self.deepest.get()
                                            && s_depth >= d
                                        {
                                            // Eliminate the spawn/get_task
                                            // pair: the spawn would set
                                            // deepest = s_depth and the next
                                            // get_task(d) would take s right
                                            // back out.
                                            t_next = Some(s);
                                        } else {
                                            self.spawn_single(s);
                                        }
                                    }
                                }
                                self.destroy_task(task);
                            }
                            Lifecycle::Recycle => {
                                // recycle_as_safe_continuation: the task is
                                // its own continuation, so decrement *its*
                                // count atomically.
                                h.state.transition(Lifecycle::Allocated);
                                if h.ref_count.fetch_sub(1, Ordering::Release) == 1 {
                                    fence(Ordering::Acquire);
                                    h.state.set_ref_count_active(false);
                                    debug_assert!(h.depth() as isize >= d);
                                    if t_next.is_none() {
                                        t_next = Some(task);
                                    } else {
                                        self.spawn_single(task);
                                    }
                                }
                            }
                            Lifecycle::Reexecute => {
                                debug_assert!(
                                    t_next.is_some(),
                                    "reexecution requires that execute() return a task"
                                );
                                h.state.transition(Lifecycle::Allocated);
                                self.spawn_single(task);
                            }
                            // recycle_as_continuation / recycle_as_child_of:
                            // the task lives on; nothing to do here.
                            Lifecycle::Allocated => {}
                            state => {
                                debug_assert!(false, "illegal state after execute: {state:?}");
                            }
                        }
                        // Safety: bypass tasks are live allocated tasks.
                        debug_assert!(
                            t_next.is_none_or(|n| unsafe { n.as_ref().depth() as isize >= d })
                        );
                        t = t_next;
                    }

                    match self.get_task(d) {
                        Some(task) => t = Some(task),
                        None => break,
                    }
                }

                // The local pool is drained.
                self.inbox.set_is_idle(true);
                debug_assert!(
                    self.arena.num_workers() > 0 || ph.ref_count.load(Ordering::Acquire) == 1,
                    "deadlock detected"
                );

                let mut failure_count: i64 = 0;
                loop {
                    if ph.ref_count.load(Ordering::Acquire) == 1 {
                        self.inbox.set_is_idle(false);
                        break 'outer;
                    }
                    // Try to steal a task from a random victim.
                    let n = self.arena.limit().load(Ordering::Acquire);
                    let mut found = None;
                    if n > 1 {
                        if self.affinity_id.get() != 0 {
                            found = self.get_mailbox_task();
                        }
                        if found.is_none() {
                            found = self.steal_from_random_victim(n, d);
                        }
                    }
                    if let Some(task) = found {
                        debug_assert!(task.as_ref().depth() as isize >= d);
                        self.inbox.set_is_idle(false);
                        task.as_ref()
                            .owner
                            .store(ptr::from_ref(self).cast_mut(), Ordering::Relaxed);
                        t = Some(task);
                        continue 'outer;
                    }

                    // Pause, even though we might yield below, because the
                    // yield might return immediately.
                    core::hint::spin_loop();
                    failure_count += 1;
                    let yield_threshold = STEAL_YIELD_FACTOR * n as i64;
                    if failure_count >= yield_threshold {
                        std::thread::yield_now();
                        if failure_count >= yield_threshold + STEAL_PARK_SLACK {
                            if d == 0 && self.is_worker && self.wait_while_pool_is_empty() {
                                failure_count = 0;
                            } else {
                                failure_count = yield_threshold;
                            }
                        }
                    }
                }
            }

            // Done: collapse the wait.
            ph.ref_count.store(0, Ordering::Release);
            ph.state.set_ref_count_active(false);
            self.innermost_running_task.set(old_innermost);
            if self.deepest.get() < 0
                && self.innermost_running_task.get() == self.dummy_task.get()
                && self.in_arena()
            {
                self.leave_arena(/* compress */ true);
            }

            // Rethrow a captured panic at the outermost master exit, where
            // the whole task tree has collapsed. The master's own default
            // context is re-armed here so the next top-level wait starts
            // clean; a user context stays cancelled until reset().
            if let Some(pctx) = ph.context() {
                let default_ctx = self
                    .dummy_task()
                    .as_ref()
                    .context
                    .load(Ordering::Relaxed);
                let pctx = pctx.as_ref();
                if pctx.is_cancelled()
                    && !self.is_worker
                    && self.innermost_running_task.get() == self.dummy_task.get()
                {
                    if ptr::eq(ptr::from_ref(pctx), default_ctx) {
                        pctx.clear_cancellation();
                    }
                    if let Some(panic) = pctx.take_panic() {
                        panic.resume();
                    }
                }
            }
        }
    }

    /// One random-victim steal attempt across the published slots.
    fn steal_from_random_victim(&self, limit: usize, d: isize) -> Option<NonNull<Header>> {
        let self_index = if self.in_arena() {
            self.task_pool().arena_index.load(Ordering::Relaxed)
        } else {
            NULL_ARENA_INDEX
        };
        let mut rng = self.random.get();
        let k = if self_index < limit {
            if limit <= 1 {
                self.random.set(rng);
                return None;
            }
            // Adjust the distribution to exclude ourselves.
            let k = rng.next_below((limit - 1) as u32) as usize;
            if k >= self_index { k + 1 } else { k }
        } else {
            rng.next_below(limit as u32) as usize
        };
        self.random.set(rng);

        let task = self.steal_task(self.arena.slot(k), d)?;
        // Safety: steal_task unlinked the task under the victim's lock.
        unsafe {
            let task = if task.as_ref().is_proxy() {
                self.strip_proxy(task.cast())?
            } else {
                task
            };
            // A stolen task did not run where it was spawned (or where its
            // affinity pointed); let the job know where it landed.
            let note = task.as_ref().vtable.note_affinity;
            note(task, self.affinity_id.get());
            tracing::trace!(victim = k, "stole task");
            Some(task)
        }
    }

    // --- context bookkeeping ----------------------------------------------

    /// Adds a context created on this thread to the propagation list.
    ///
    /// # Safety
    ///
    /// `ctx` must stay registered until `unregister_context` and be called
    /// from this scheduler's thread.
    pub(crate) unsafe fn register_context(&self, ctx: NonNull<ContextInner>) {
        let _lock = self.context_list_mutex.lock();
        // Safety: list mutation is serialized by the mutex.
        unsafe {
            let first = self.context_list_first.load(Ordering::Relaxed);
            ctx.as_ref().next.store(first, Ordering::Relaxed);
            ctx.as_ref().prev.store(ptr::null_mut(), Ordering::Relaxed);
            if let Some(first) = NonNull::new(first) {
                first.as_ref().prev.store(ctx.as_ptr(), Ordering::Relaxed);
            }
            self.context_list_first
                .store(ctx.as_ptr(), Ordering::Release);
        }
    }

    /// # Safety
    ///
    /// `ctx` must be registered on this scheduler's list.
    pub(crate) unsafe fn unregister_context(&self, ctx: NonNull<ContextInner>) {
        let _lock = self.context_list_mutex.lock();
        // Safety: list mutation is serialized by the mutex.
        unsafe {
            let prev = ctx.as_ref().prev.load(Ordering::Relaxed);
            let next = ctx.as_ref().next.load(Ordering::Relaxed);
            match NonNull::new(prev) {
                Some(prev) => prev.as_ref().next.store(next, Ordering::Relaxed),
                None => self.context_list_first.store(next, Ordering::Release),
            }
            if let Some(next) = NonNull::new(next) {
                next.as_ref().prev.store(prev, Ordering::Relaxed);
            }
        }
    }

    /// Marks every local context that has a newly-cancelled ancestor. Runs
    /// under this scheduler's context-list mutex; the caller serializes
    /// whole propagations via the global scheduler-list mutex.
    pub(crate) fn propagate_cancellation_to_local_contexts(&self) {
        let _lock = self.context_list_mutex.lock();
        let mut cursor = self.context_list_first.load(Ordering::Acquire);
        while let Some(ctx) = NonNull::new(cursor) {
            // Safety: registered contexts stay alive until unregistered,
            // which requires the mutex we hold.
            let ctx = unsafe { ctx.as_ref() };
            if !ctx.is_cancelled() {
                ctx.propagate_cancellation_from_ancestors();
            }
            cursor = ctx.next.load(Ordering::Acquire);
        }
    }

    // --- lifecycle --------------------------------------------------------

    /// Tells a worker blocked in its outermost wait to exit.
    ///
    /// # Safety
    ///
    /// Only the arena shutdown path may call this, on a published worker.
    pub(crate) unsafe fn signal_worker_exit(&self) {
        // Safety: the dummy task lives until free_scheduler.
        unsafe {
            self.dummy_task()
                .as_ref()
                .ref_count
                .store(1, Ordering::Release);
        }
    }
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("is_worker", &self.is_worker)
            .field("deepest", &self.deepest.get())
            .field("affinity_id", &self.affinity_id.get())
            .field(
                "small_task_count",
                &self.small_task_count.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

/// Pushes a slab freed on a foreign thread onto its origin's return list,
/// or deallocates it directly when the origin has shut down. Driving the
/// origin's `small_task_count` to zero frees the scheduler object itself.
///
/// # Safety
///
/// `t` must be a freed small task whose origin is not the calling thread's
/// scheduler.
unsafe fn free_nonlocal_small_task(t: NonNull<Header>) {
    // Safety: ensured by caller
    unsafe {
        let origin_ptr = t.as_ref().origin.load(Ordering::Relaxed);
        let origin = &*origin_ptr;
        loop {
            let old = origin.return_list.load(Ordering::Acquire);
            if old == plugged_return_list() {
                break;
            }
            t.as_ref().next.store(old, Ordering::Relaxed);
            if origin
                .return_list
                .compare_exchange(old, t.as_ptr(), Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
        // Plugged: the origin is gone, deallocate directly.
        deallocate_slab(t);
        if origin.small_task_count.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            // We freed the last task allocated by the origin scheduler, so
            // freeing the scheduler object is on us.
            drop(Box::from_raw(origin_ptr));
        }
    }
}

/// # Safety
///
/// `t` must be a freed small-task slab nobody references.
unsafe fn deallocate_slab(t: NonNull<Header>) {
    crate::task::note_task_deallocated();
    // Safety: ensured by caller; slabs share one layout.
    unsafe { crate::alloc::deallocate(t.cast(), Scheduler::slab_layout()) }
}

/// # Safety
///
/// `t` must be a freed individually-allocated task nobody references.
unsafe fn deallocate_big_task(t: NonNull<Header>) {
    crate::task::note_task_deallocated();
    // Safety: ensured by caller; the vtable preserves the allocation layout.
    unsafe {
        let layout = t.as_ref().vtable.layout;
        crate::alloc::deallocate(t.cast(), layout);
    }
}

/// Frees a proxy left in a mailbox after every producer quiesced (arena
/// shutdown).
///
/// # Safety
///
/// See [`crate::mailbox::Mailbox::drain`].
pub(crate) unsafe fn deallocate_orphaned_proxy(proxy: NonNull<ProxyTask>) {
    // Safety: ensured by caller
    unsafe {
        let header = proxy.cast::<Header>();
        // If the pool side never claimed the underlying task, it leaks with
        // its pool; shutdown asserts pools are empty, so the tag must have
        // been resolved already.
        debug_assert_eq!(
            proxy.as_ref().task_and_tag.load(Ordering::Relaxed) & !PROXY_TAG_MASK,
            0,
            "orphaned proxy still carries a task"
        );
        let origin_ptr = header.as_ref().origin.load(Ordering::Relaxed);
        deallocate_slab(header);
        let origin = &*origin_ptr;
        if origin.small_task_count.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            drop(Box::from_raw(origin_ptr));
        }
    }
}

/// Tears a scheduler down: withdraws from the arena, frees the dummy task,
/// drains the free lists, plugs the return list, and drops the final guard
/// reference (which frees the object unless foreign tasks are still live).
///
/// # Safety
///
/// Must run on the scheduler's owner thread, after all of its tasks have
/// completed. `this` must not be used afterwards.
pub(crate) unsafe fn free_scheduler(this: NonNull<Scheduler>) {
    // Safety: ensured by caller
    unsafe {
        let s = this.as_ref();
        if s.in_arena() {
            s.leave_arena(/* compress */ false);
        }

        let dummy = s.dummy_task();
        if !s.is_worker {
            // The master's default root context is ours to free; workers
            // share a process-wide dummy context.
            let ctx = dummy.as_ref().context.load(Ordering::Relaxed);
            if !ctx.is_null() {
                drop(Box::from_raw(ctx));
            }
            crate::runtime::global().unregister_master(this);
        }
        crate::runtime::clear_current_scheduler();

        dummy.as_ref().ref_count.store(0, Ordering::Relaxed);
        s.free_task(dummy);
        s.dummy_task.set(None);

        // k accounts for the guard reference and each slab we deallocate.
        let mut k: isize = 1;
        loop {
            while let Some(t) = s.free_list.get() {
                s.free_list.set(t.as_ref().next_task());
                deallocate_slab(t);
                k += 1;
            }
            if s.return_list.load(Ordering::Acquire) == plugged_return_list() {
                break;
            }
            let stolen = s
                .return_list
                .swap(plugged_return_list(), Ordering::AcqRel);
            s.free_list.set(NonNull::new(stolen));
        }

        drop(Box::from_raw(s.dummy_slot.task_pool.swap(
            ptr::null_mut(),
            Ordering::Relaxed,
        )));

        // Update small_task_count last: as soon as it can reach zero,
        // another thread may free *this out from under us.
        debug_assert!(s.small_task_count.load(Ordering::Relaxed) >= k);
        if s.small_task_count.fetch_sub(k, Ordering::Release) == k {
            fence(Ordering::Acquire);
            drop(Box::from_raw(this.as_ptr()));
        }
    }
}

/// Body of a worker thread: fan out children, build a scheduler, claim the
/// predetermined arena slot, publish, and dispatch until shutdown.
pub(crate) fn worker_main(arena: Arc<Arena>, index: usize) {
    let _span = tracing::debug_span!("worker main loop", worker = index).entered();

    // Start my children (binary heap fan-out).
    let num_workers = arena.num_workers();
    if 2 * index + 1 < num_workers {
        Arena::start_one_worker_thread(&arena, 2 * index + 1);
        if 2 * index + 2 < num_workers {
            Arena::start_one_worker_thread(&arena, 2 * index + 2);
        }
    }

    let this = Scheduler::new_raw(Arc::clone(&arena), true);
    // Safety: freshly created; we are the owner thread.
    unsafe {
        let s = this.as_ref();

        // Workers never rethrow, but their tasks still need a context.
        s.dummy_task()
            .as_ref()
            .context
            .store(crate::runtime::worker_dummy_context().as_ptr(), Ordering::Relaxed);
        // Sync up the local cancellation state with the global one.
        s.local_cancel_count.store(
            crate::runtime::global().cancel_count.load(Ordering::Acquire),
            Ordering::Relaxed,
        );

        // Move into my predetermined slot (slot index == heap index).
        let slot = arena.slot(index);
        debug_assert_eq!(
            slot.steal_end.load(Ordering::Relaxed),
            STEAL_END_UNUSED_LOCKED,
            "slot not allocated as locked worker?"
        );
        let pool = s.task_pool();
        pool.arena_index.store(index, Ordering::Relaxed);
        slot.task_pool.store(
            s.dummy_slot.task_pool.load(Ordering::Relaxed),
            Ordering::Release,
        );
        slot.owner_waits.store(false, Ordering::Relaxed);
        s.arena_slot.set(NonNull::from(slot));
        s.attach_mailbox((index + 1) as AffinityId);
        slot.steal_end.store(STEAL_END_EMPTY, Ordering::Release);

        // Attempt to publish.
        if !arena.worker(index).try_publish(this) {
            // Shutdown commenced before we came up; clean up without ever
            // registering in thread-local storage.
            tracing::debug!(worker = index, "born into shutdown, exiting");
            free_scheduler(this);
            return;
        }
        crate::runtime::set_current_scheduler(this);

        s.wait_for_all(s.dummy_task(), None);

        tracing::debug!(worker = index, "worker shutting down");
        free_scheduler(this);
    }
    // The worker's arena reference drops here, possibly freeing the arena.
    drop(arena);
}

/// Builds and registers a master scheduler for the calling thread.
pub(crate) fn create_master(arena: Arc<Arena>) {
    let this = Scheduler::new_raw(arena, false);
    // Safety: freshly created on this thread; nothing else references it.
    unsafe {
        let s = this.as_ref();
        let dummy = s.dummy_task();
        dummy.as_ref().ref_count.store(1, Ordering::Relaxed);
        s.innermost_running_task.set(Some(dummy));

        // Context used by root tasks by default (when the caller does not
        // supply one).
        let default_ctx = Box::into_raw(Box::new(crate::context::ContextInner::new(
            crate::context::ContextKind::Isolated,
        )));
        dummy.as_ref().context.store(default_ctx, Ordering::Relaxed);

        crate::runtime::set_current_scheduler(this);
        crate::runtime::global().register_master(this);
        // Sync up the local cancellation state with the global one.
        s.local_cancel_count.store(
            crate::runtime::global().cancel_count.load(Ordering::Acquire),
            Ordering::Relaxed,
        );
    }
    tracing::debug!("master registered");
}

/// The dispatch-loop context handed to [`Job::execute`].
///
/// It exposes the operations a running task may perform on itself and its
/// relatives: allocating children and continuations, spawning, blocking
/// waits, recycling, and cancellation checks.
pub struct Execution<'a> {
    scheduler: &'a Scheduler,
    current: NonNull<Header>,
    _not_send: PhantomData<*mut ()>,
}

// === impl Execution ===

impl Execution<'_> {
    #[inline]
    fn current(&self) -> &Header {
        // Safety: the dispatch loop keeps the current task alive for the
        // whole execute() call.
        unsafe { self.current.as_ref() }
    }

    /// Allocates a child of the running task.
    ///
    /// # Errors
    ///
    /// Fails when task storage cannot be allocated; the task tree is left
    /// untouched.
    pub fn allocate_child(&mut self, job: impl Job) -> Result<TaskRef, AllocFailed> {
        let h = self.current();
        self.scheduler.allocate_task(
            job,
            h.depth() + 1,
            Some(self.current),
            h.context.load(Ordering::Relaxed),
        )
    }

    /// Allocates a continuation: the new task adopts the running task's
    /// parent and depth, and the running task is orphaned.
    ///
    /// # Errors
    ///
    /// Fails when task storage cannot be allocated; the running task keeps
    /// its parent in that case.
    pub fn allocate_continuation(&mut self, job: impl Job) -> Result<TaskRef, AllocFailed> {
        let h = self.current();
        let task = self.scheduler.allocate_task(
            job,
            h.depth(),
            h.parent(),
            h.context.load(Ordering::Relaxed),
        )?;
        // The continuation adopted the parent; orphan the running task only
        // now that nothing can fail anymore.
        h.parent.store(ptr::null_mut(), Ordering::Relaxed);
        Ok(task)
    }

    /// Allocates an extra child of `parent`, atomically bumping its ref
    /// count.
    ///
    /// # Errors
    ///
    /// Fails when task storage cannot be allocated; the parent's ref count
    /// is left untouched.
    pub fn allocate_additional_child_of(
        &mut self,
        parent: &TaskRef,
        job: impl Job,
    ) -> Result<TaskRef, AllocFailed> {
        self.allocate_additional_child_of_raw(parent.header_ptr(), job)
    }

    pub(crate) fn allocate_additional_child_of_raw(
        &mut self,
        parent: NonNull<Header>,
        job: impl Job,
    ) -> Result<TaskRef, AllocFailed> {
        // Safety: the parent is kept alive by its own ref count protocol.
        let ph = unsafe { parent.as_ref() };
        let task = self.scheduler.allocate_task(
            job,
            ph.depth() + 1,
            Some(parent),
            ph.context.load(Ordering::Relaxed),
        )?;
        // Bump only once the allocation cannot fail anymore, so an error
        // leaves the parent's count untouched. The count covers the child
        // before the handle escapes, which is all spawning needs.
        ph.ref_count.fetch_add(1, Ordering::Acquire);
        Ok(task)
    }

    /// Sets how many completions the running task waits for. Call before
    /// spawning the children it covers.
    pub fn set_ref_count(&mut self, n: usize) {
        debug_assert!(n > 0, "ref_count must be positive");
        debug_assert!(
            !self.current().state.is_ref_count_active(),
            "ref_count race detected"
        );
        self.current().ref_count.store(n as isize, Ordering::Release);
    }

    pub fn spawn(&mut self, task: TaskRef) {
        let raw = task.into_raw();
        // Safety: the handle proves allocation; we are on the owner thread.
        unsafe { self.scheduler.spawn_single(raw) }
    }

    pub fn spawn_list(&mut self, list: TaskList) {
        if let Some(first) = list.into_chain() {
            // Safety: as above, for the whole chain.
            unsafe { self.scheduler.spawn_chain(first) }
        }
    }

    /// Runs `child` immediately and dispatches until the running task's ref
    /// count (set via [`set_ref_count`][Self::set_ref_count]) drops to one.
    pub fn spawn_and_wait_for_all(&mut self, child: TaskRef) {
        let raw = child.into_raw();
        // Safety: dispatching on the owner thread with a live parent.
        unsafe {
            raw.as_ref()
                .owner
                .store(ptr::from_ref(self.scheduler).cast_mut(), Ordering::Relaxed);
            self.scheduler.wait_for_all(self.current, Some(raw));
        }
    }

    /// Like [`spawn_and_wait_for_all`][Self::spawn_and_wait_for_all] for a
    /// whole list: spawns all but the first task, runs the first directly.
    pub fn spawn_list_and_wait_for_all(&mut self, mut list: TaskList) {
        let Some(first) = list.pop_front() else {
            // Vacuous: nothing to wait for beyond already-spawned children.
            return self.wait_for_all();
        };
        if let Some(rest) = list.into_chain() {
            // Safety: chain of allocated tasks on the owner thread.
            unsafe { self.scheduler.spawn_chain(rest) }
        }
        self.spawn_and_wait_for_all(first);
    }

    /// Dispatches until the running task's ref count drops to one.
    pub fn wait_for_all(&mut self) {
        // Safety: dispatching on the owner thread.
        unsafe { self.scheduler.wait_for_all(self.current, None) }
    }

    /// Marks the running task to be reused as its own continuation. The
    /// caller must give it a ref count before returning.
    pub fn recycle_as_continuation(&mut self) {
        debug_assert_eq!(self.current().state.lifecycle(), Lifecycle::Executing);
        self.current().state.transition(Lifecycle::Allocated);
    }

    /// Like [`recycle_as_continuation`][Self::recycle_as_continuation], but
    /// safe against children completing while `execute` is still running:
    /// the dispatcher decrements the task's own ref count on return.
    pub fn recycle_as_safe_continuation(&mut self) {
        debug_assert_eq!(self.current().state.lifecycle(), Lifecycle::Executing);
        self.current().state.transition(Lifecycle::Recycle);
    }

    /// Requeues the running task at its current depth once `execute`
    /// returns. `execute` must return a bypass task.
    pub fn recycle_to_reexecute(&mut self) {
        debug_assert_eq!(self.current().state.lifecycle(), Lifecycle::Executing);
        self.current().state.transition(Lifecycle::Reexecute);
    }

    /// Reuses the running task as a fresh child of `parent`.
    pub fn recycle_as_child_of(&mut self, parent: &TaskRef) {
        let h = self.current();
        debug_assert_eq!(h.state.lifecycle(), Lifecycle::Executing);
        let ph = parent.header();
        h.state.transition(Lifecycle::Allocated);
        h.parent
            .store(parent.header_ptr().as_ptr(), Ordering::Relaxed);
        h.depth.store(ph.depth() + 1, Ordering::Relaxed);
        h.context
            .store(ph.context.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Hands the running task back to the dispatcher as the bypass task.
    ///
    /// Only meaningful after one of the recycle calls has moved the task out
    /// of the executing state; the returned handle must be the `execute()`
    /// return value.
    pub fn bypass_self(&mut self) -> TaskRef {
        debug_assert_eq!(self.current().state.lifecycle(), Lifecycle::Allocated);
        TaskRef::from_raw(self.current)
    }

    pub fn depth(&self) -> i32 {
        self.current().depth()
    }

    pub fn set_depth(&mut self, depth: i32) {
        debug_assert!(depth >= 0);
        self.current().depth.store(depth, Ordering::Relaxed);
    }

    pub fn add_to_depth(&mut self, delta: i32) {
        let d = self.current().depth() + delta;
        debug_assert!(d >= 0);
        self.current().depth.store(d, Ordering::Relaxed);
    }

    pub fn affinity(&self) -> AffinityId {
        self.current().affinity.load(Ordering::Relaxed)
    }

    pub fn set_affinity(&mut self, id: AffinityId) {
        self.current().affinity.store(id, Ordering::Relaxed);
    }

    /// The affinity id of the thread this task is executing on.
    pub fn current_thread_affinity(&self) -> AffinityId {
        self.scheduler.affinity_id.get()
    }

    /// Whether the running task's group has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.current()
            .context()
            // Safety: a task's context outlives the task.
            .is_some_and(|c| unsafe { c.as_ref().is_cancelled() })
    }

    /// Cancels the running task's group. Returns `true` for the caller that
    /// actually performed the cancellation.
    pub fn cancel_group_execution(&mut self) -> bool {
        let Some(ctx) = self.current().context() else {
            return false;
        };
        // Safety: a task's context outlives the task.
        if unsafe { ctx.as_ref().try_cancel() } {
            crate::context::propagate_cancellation();
            true
        } else {
            false
        }
    }
}

impl core::fmt::Debug for Execution<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Execution")
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}
