// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

pub(crate) mod state;

use crate::context::ContextInner;
use crate::error::AllocFailed;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicI32, AtomicIsize, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use crate::mailbox::Mailbox;
use crate::scheduler::{Execution, Scheduler};
use crate::task::state::{Lifecycle, TaskState};
use core::alloc::Layout;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use static_assertions::const_assert;

/// Identifies the arena slot whose mailbox an affinity-tagged task is routed
/// to. `0` means "no affinity"; slot `k`'s mailbox is affinity id `k + 1`.
pub type AffinityId = u32;

/// Total size of a small-task slab, header included.
///
/// Any task whose concrete `Task<J>` fits in a slab is drawn from (and
/// recycled through) per-scheduler free lists; anything larger is allocated
/// individually.
pub(crate) const QUICK_TASK_SIZE: usize = 256;

/// A unit of work dispatched by the scheduler.
///
/// `execute` runs on whatever thread claims the task; returning `Some(next)`
/// engages the scheduler bypass, running `next` immediately without a
/// spawn/steal round trip. `next` must be in the allocated state.
///
/// `note_affinity` is invoked when a task that asked for a specific thread
/// (via [`Execution::set_affinity`]) ends up executing somewhere else, right
/// before `execute`.
pub trait Job: Send {
    fn execute(&mut self, cx: &mut Execution<'_>) -> Option<TaskRef>;

    fn note_affinity(&mut self, _id: AffinityId) {}
}

/// The type-erased function table each concrete `Task<J>` is driven through.
///
/// Keeping the scheduler monomorphization-free matters here just like in any
/// vtable-erased task system: every `J` would otherwise drag the entire
/// dispatch loop into its own instantiation.
pub(crate) struct VTable {
    /// Run the job. Returns the bypass task, if any.
    pub(crate) execute:
        unsafe fn(NonNull<Header>, &mut Execution<'_>) -> Option<NonNull<Header>>,
    /// Tell the job which thread it actually landed on.
    pub(crate) note_affinity: unsafe fn(NonNull<Header>, AffinityId),
    /// Drop the job payload in place (at most once).
    pub(crate) drop_job: unsafe fn(NonNull<Header>),
    /// Layout of the concrete allocation, for the big-task dealloc path.
    pub(crate) layout: Layout,
}

/// Fixed prefix of every task allocation.
///
/// All fields are atomics: a task migrates between threads through the pool
/// lock and the proxy CAS, and after each hand-off a different thread becomes
/// the single writer. The lifecycle stage says who that writer is.
#[repr(C)]
pub(crate) struct Header {
    pub(crate) state: TaskState,
    pub(crate) vtable: &'static VTable,
    /// Outstanding children plus one for a waiter.
    pub(crate) ref_count: AtomicIsize,
    /// Ready-pool bucket; non-negative and below the pool capacity while the
    /// task is spawned.
    pub(crate) depth: AtomicI32,
    pub(crate) affinity: AtomicU32,
    pub(crate) parent: AtomicPtr<Header>,
    /// Intrusive link: pool bucket list, free list, or return list,
    /// depending on the lifecycle stage.
    pub(crate) next: AtomicPtr<Header>,
    /// The scheduler currently responsible for dispatching this task.
    pub(crate) owner: AtomicPtr<Scheduler>,
    /// The scheduler whose free list owns the slab. Null for big tasks.
    pub(crate) origin: AtomicPtr<Scheduler>,
    pub(crate) context: AtomicPtr<ContextInner>,
}

// === impl Header ===

impl Header {
    #[expect(clippy::too_many_arguments, reason = "internal constructor")]
    pub(crate) fn new(
        vtable: &'static VTable,
        parent: Option<NonNull<Header>>,
        depth: i32,
        context: *const ContextInner,
        owner: *const Scheduler,
        origin: *const Scheduler,
        proxy: bool,
        big: bool,
    ) -> Self {
        Self {
            state: TaskState::new(proxy, big),
            vtable,
            ref_count: AtomicIsize::new(0),
            depth: AtomicI32::new(depth),
            affinity: AtomicU32::new(0),
            parent: AtomicPtr::new(
                parent.map_or(ptr::null_mut(), NonNull::as_ptr),
            ),
            next: AtomicPtr::new(ptr::null_mut()),
            owner: AtomicPtr::new(owner.cast_mut()),
            origin: AtomicPtr::new(origin.cast_mut()),
            context: AtomicPtr::new(context.cast_mut()),
        }
    }

    #[inline]
    pub(crate) fn parent(&self) -> Option<NonNull<Header>> {
        NonNull::new(self.parent.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn depth(&self) -> i32 {
        self.depth.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn context(&self) -> Option<NonNull<ContextInner>> {
        NonNull::new(self.context.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn next_task(&self) -> Option<NonNull<Header>> {
        NonNull::new(self.next.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn is_proxy(&self) -> bool {
        self.state.is_proxy()
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("state", &self.state)
            .field("ref_count", &self.ref_count.load(Ordering::Relaxed))
            .field("depth", &self.depth())
            .field("affinity", &self.affinity.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A move-only handle to an allocated task.
///
/// The handle is consumed by spawning (the scheduler takes over) or by
/// [`TaskRef::destroy`]. Dropping it instead is fine for a continuation that
/// children have been allocated against (the last completing child arms it),
/// but leaks any other unspawned task: the allocation is owned by the task
/// state machine, not by this handle.
///
/// `TaskRef` is deliberately `!Send`: a task may only be spawned or
/// destroyed by the thread whose scheduler allocated it, exactly like the
/// raw pointers it replaces.
pub struct TaskRef {
    raw: NonNull<Header>,
    _not_send: PhantomData<*mut ()>,
}

// === impl TaskRef ===

impl TaskRef {
    #[inline]
    pub(crate) fn from_raw(raw: NonNull<Header>) -> Self {
        Self {
            raw,
            _not_send: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn into_raw(self) -> NonNull<Header> {
        let raw = self.raw;
        core::mem::forget(self);
        raw
    }

    #[inline]
    pub(crate) fn header(&self) -> &Header {
        // Safety: the handle owns the allocation until consumed.
        unsafe { self.raw.as_ref() }
    }

    #[inline]
    pub(crate) fn header_ptr(&self) -> NonNull<Header> {
        self.raw
    }

    /// Sets the count of child completions (plus one per waiter) this task
    /// waits for.
    ///
    /// # Panics
    ///
    /// In debug builds, panics when `n` is zero or when children may already
    /// be decrementing the count.
    pub fn set_ref_count(&self, n: usize) {
        debug_assert!(n > 0, "ref_count must be positive");
        debug_assert!(
            !self.header().state.is_ref_count_active(),
            "ref_count race detected"
        );
        self.header().ref_count.store(n as isize, Ordering::Release);
    }

    pub fn ref_count(&self) -> usize {
        self.header().ref_count.load(Ordering::Acquire).max(0) as usize
    }

    /// Tags the task for the mailbox of the thread that reported `id` via
    /// [`Job::note_affinity`]. Zero clears the tag.
    pub fn set_affinity(&self, id: AffinityId) {
        self.header().affinity.store(id, Ordering::Relaxed);
    }

    pub fn affinity(&self) -> AffinityId {
        self.header().affinity.load(Ordering::Relaxed)
    }

    pub fn set_depth(&self, depth: i32) {
        debug_assert!(depth >= 0, "depth must be non-negative");
        self.header().depth.store(depth, Ordering::Relaxed);
    }

    pub fn add_to_depth(&self, delta: i32) {
        let d = self.header().depth() + delta;
        debug_assert!(d >= 0, "depth must stay non-negative");
        self.header().depth.store(d, Ordering::Relaxed);
    }

    pub fn depth(&self) -> i32 {
        self.header().depth()
    }

    /// Allocates a child of this task, at `depth + 1`, sharing its context.
    ///
    /// # Errors
    ///
    /// Fails when task storage cannot be allocated; the task tree is left
    /// untouched.
    pub fn allocate_child(&self, job: impl Job) -> Result<TaskRef, AllocFailed> {
        let s = crate::runtime::expect_current_scheduler();
        // Safety: the scheduler pointer is valid for the life of this thread's
        // runtime registration.
        let s = unsafe { s.as_ref() };
        debug_assert!(
            ptr::eq(self.header().owner.load(Ordering::Relaxed), s),
            "thread does not own parent"
        );
        let header = self.header();
        s.allocate_task(
            job,
            header.depth() + 1,
            Some(self.raw),
            header.context.load(Ordering::Relaxed),
        )
    }

    /// Allocates a child of this task *while it may already be running*,
    /// atomically bumping its ref count.
    ///
    /// # Errors
    ///
    /// Fails when task storage cannot be allocated; the ref count is left
    /// untouched in that case.
    pub fn allocate_additional_child_of(&self, job: impl Job) -> Result<TaskRef, AllocFailed> {
        let s = crate::runtime::expect_current_scheduler();
        // Safety: as above.
        let s = unsafe { s.as_ref() };
        let header = self.header();
        let task = s.allocate_task(
            job,
            header.depth() + 1,
            Some(self.raw),
            header.context.load(Ordering::Relaxed),
        )?;
        header.ref_count.fetch_add(1, Ordering::Acquire);
        Ok(task)
    }

    /// Destroys a task that will never be spawned, decrementing its parent's
    /// ref count.
    ///
    /// # Panics
    ///
    /// In debug builds, panics when the task still has a non-zero ref count.
    pub fn destroy(self) {
        let raw = self.into_raw();
        // Safety: the handle owned the allocation.
        let header = unsafe { raw.as_ref() };
        debug_assert_eq!(
            header.ref_count.load(Ordering::Relaxed),
            0,
            "victim must have a ref_count of zero"
        );
        debug_assert_eq!(header.state.lifecycle(), Lifecycle::Allocated);
        if let Some(parent) = header.parent() {
            // Safety: a task's parent outlives all of its children.
            unsafe {
                parent.as_ref().ref_count.fetch_sub(1, Ordering::Release);
            }
        }
        let s = crate::runtime::expect_current_scheduler();
        // Safety: scheduler is valid on this thread; the task is ours to free.
        unsafe { s.as_ref().destroy_task(raw) }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("addr", &self.raw)
            .field("header", self.header())
            .finish()
    }
}

/// Storage for a spawned job: the shared header followed by the payload.
#[repr(C)]
pub(crate) struct Task<J: Job> {
    pub(crate) header: Header,
    /// `None` once the job has been dropped; exclusivity is granted by the
    /// lifecycle stage (`Executing` for the dispatcher, `Allocated` with a
    /// unique `TaskRef` for everyone else).
    job: UnsafeCell<Option<J>>,
}

// === impl Task ===

impl<J: Job> Task<J> {
    pub(crate) const VTABLE: VTable = VTable {
        execute: Self::execute,
        note_affinity: Self::note_affinity,
        drop_job: Self::drop_job,
        layout: Layout::new::<Self>(),
    };

    pub(crate) fn fits_slab() -> bool {
        size_of::<Self>() <= QUICK_TASK_SIZE && align_of::<Self>() <= crate::alloc::CACHE_LINE_SIZE
    }

    /// Writes a fresh `Task<J>` into `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of `Self` and properly aligned.
    pub(crate) unsafe fn initialize(ptr: NonNull<u8>, header: Header, job: J) {
        // Safety: ensured by caller
        unsafe {
            ptr.cast::<Self>().write(Task {
                header,
                job: UnsafeCell::new(Some(job)),
            });
        }
    }

    /// Runs the job. Called through the task's [`VTable`].
    ///
    /// # Safety
    ///
    /// `ptr` must point to the [`Header`] of a live `Task<J>` in the
    /// executing state; the dispatch loop is the only caller.
    unsafe fn execute(ptr: NonNull<Header>, cx: &mut Execution<'_>) -> Option<NonNull<Header>> {
        // Safety: ensured by caller
        unsafe {
            let this = ptr.cast::<Self>().as_ref();
            this.job.with_mut(|job| {
                let job = (*job)
                    .as_mut()
                    .expect("task executed after its job was dropped");
                job.execute(cx).map(TaskRef::into_raw)
            })
        }
    }

    /// # Safety
    ///
    /// `ptr` must point to the [`Header`] of a live `Task<J>`, and the caller
    /// must hold the claim that makes it the task's unique accessor.
    unsafe fn note_affinity(ptr: NonNull<Header>, id: AffinityId) {
        // Safety: ensured by caller
        unsafe {
            let this = ptr.cast::<Self>().as_ref();
            this.job.with_mut(|job| {
                if let Some(job) = (*job).as_mut() {
                    job.note_affinity(id);
                }
            });
        }
    }

    /// # Safety
    ///
    /// `ptr` must point to the [`Header`] of a live `Task<J>` that no other
    /// thread can reach anymore.
    unsafe fn drop_job(ptr: NonNull<Header>) {
        // Safety: ensured by caller
        unsafe {
            let this = ptr.cast::<Self>().as_ref();
            this.job.with_mut(|job| drop((*job).take()));
        }
    }
}

/// A job for sentinel tasks (the per-scheduler dummy parent). It is never
/// executed; it only exists so the dummy task has a vtable.
pub(crate) struct Stub;

impl Job for Stub {
    fn execute(&mut self, _cx: &mut Execution<'_>) -> Option<TaskRef> {
        unreachable!("the stub task should never be executed!")
    }
}

const_assert!(size_of::<Task<Stub>>() <= QUICK_TASK_SIZE);

/// Low bit of [`ProxyTask::task_and_tag`]: the proxy is reachable from a
/// task pool.
pub(crate) const PROXY_POOL_BIT: usize = 1;
/// Second bit: the proxy is reachable from a mailbox.
pub(crate) const PROXY_MAILBOX_BIT: usize = 2;
pub(crate) const PROXY_TAG_MASK: usize = PROXY_POOL_BIT | PROXY_MAILBOX_BIT;

/// A sentinel task standing in for an affinity-tagged task that was spawned
/// on a non-matching thread.
///
/// The proxy sits in the spawner's pool *and* in the target thread's
/// mailbox; whichever consumer wins the [`task_and_tag`] CAS executes the
/// real task, and the loser frees the proxy.
///
/// [`task_and_tag`]: ProxyTask::task_and_tag
#[repr(C)]
pub(crate) struct ProxyTask {
    pub(crate) header: Header,
    /// Pointer to the real task, with [`PROXY_POOL_BIT`] and
    /// [`PROXY_MAILBOX_BIT`] in the low bits.
    pub(crate) task_and_tag: AtomicUsize,
    pub(crate) next_in_mailbox: AtomicPtr<ProxyTask>,
    pub(crate) outbox: AtomicPtr<Mailbox>,
}

const_assert!(size_of::<ProxyTask>() <= QUICK_TASK_SIZE);

// === impl ProxyTask ===

impl ProxyTask {
    pub(crate) const VTABLE: VTable = VTable {
        execute: Self::execute_unreachable,
        note_affinity: Self::note_affinity_unreachable,
        drop_job: Self::drop_job_noop,
        layout: Layout::new::<Self>(),
    };

    unsafe fn execute_unreachable(
        ptr: NonNull<Header>,
        _cx: &mut Execution<'_>,
    ) -> Option<NonNull<Header>> {
        unreachable!("task proxy ({ptr:?}) should never be executed!")
    }

    unsafe fn note_affinity_unreachable(ptr: NonNull<Header>, _id: AffinityId) {
        unreachable!("task proxy ({ptr:?}) has no job to notify!")
    }

    unsafe fn drop_job_noop(_ptr: NonNull<Header>) {}

    /// The underlying task, if the tag still carries one.
    pub(crate) fn task(tat: usize) -> Option<NonNull<Header>> {
        NonNull::new((tat & !PROXY_TAG_MASK) as *mut Header)
    }
}

/// Running count of live task allocations (slabs plus big tasks), for leak
/// diagnostics. Deliberately not a loom atomic: it is bookkeeping, not part
/// of the modeled protocol, and loom types cannot live in plain statics.
static TASK_NODE_COUNT: core::sync::atomic::AtomicIsize =
    core::sync::atomic::AtomicIsize::new(0);

pub(crate) fn note_task_allocated() {
    TASK_NODE_COUNT.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn note_task_deallocated() {
    let prev = TASK_NODE_COUNT.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(prev > 0, "task node count underflow");
}

/// The number of task allocations currently alive in the process.
///
/// Diagnostic only; the value is exact at quiescence (no scheduler activity)
/// and approximate otherwise.
pub fn task_node_count() -> isize {
    TASK_NODE_COUNT.load(Ordering::SeqCst)
}

/// An intrusive list of unspawned tasks, built to hand a whole batch to
/// [`spawn_list`][crate::spawn_list] in one pool operation.
///
/// All tasks in a list must share one depth (and, for root lists, one
/// context).
pub struct TaskList {
    first: Option<NonNull<Header>>,
    last: Option<NonNull<Header>>,
    len: usize,
    _not_send: PhantomData<*mut ()>,
}

// === impl TaskList ===

impl TaskList {
    pub fn new() -> Self {
        Self {
            first: None,
            last: None,
            len: 0,
            _not_send: PhantomData,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn push_back(&mut self, task: TaskRef) {
        let raw = task.into_raw();
        // Safety: the list owns its nodes; the handle was just consumed.
        unsafe {
            raw.as_ref().next.store(ptr::null_mut(), Ordering::Relaxed);
            match self.last {
                Some(last) => last.as_ref().next.store(raw.as_ptr(), Ordering::Relaxed),
                None => self.first = Some(raw),
            }
        }
        self.last = Some(raw);
        self.len += 1;
    }

    pub fn pop_front(&mut self) -> Option<TaskRef> {
        let first = self.first?;
        // Safety: list nodes are live tasks owned by the list.
        let next = unsafe { first.as_ref().next_task() };
        self.first = next;
        if next.is_none() {
            self.last = None;
        }
        self.len -= 1;
        Some(TaskRef::from_raw(first))
    }

    /// Detaches the chain for the spawn path: returns the first node, leaving
    /// the intrusive `next` links intact.
    pub(crate) fn into_chain(mut self) -> Option<NonNull<Header>> {
        self.len = 0;
        self.last = None;
        self.first.take()
    }

    /// Iterates the chain without consuming it.
    pub(crate) fn iter_chain(
        first: Option<NonNull<Header>>,
    ) -> impl Iterator<Item = NonNull<Header>> {
        let mut cursor = first;
        core::iter::from_fn(move || {
            let t = cursor?;
            // Safety: chain nodes are live tasks.
            cursor = unsafe { t.as_ref().next_task() };
            Some(t)
        })
    }
}

impl Default for TaskList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskList {
    fn drop(&mut self) {
        debug_assert!(
            self.first.is_none() || std::thread::panicking(),
            "TaskList dropped with unspawned tasks"
        );
    }
}

impl fmt::Debug for TaskList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskList").field("len", &self.len).finish()
    }
}
