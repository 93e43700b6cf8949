// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task group contexts: hierarchical, one-shot cancellation plus panic
//! capture.
//!
//! Every scheduler keeps an intrusive list of the contexts created on its
//! thread, guarded by a spin mutex. Cancelling a context walks *every*
//! scheduler's list (workers through the arena, masters through the global
//! scheduler list) and marks each context that has a cancelled ancestor.
//! A global cancellation generation counter, snapshotted per scheduler as
//! `local_cancel_count`, lets the hot paths (context binding, dispatch-loop
//! exit) skip that walk entirely: equal counters mean this thread has
//! already observed every propagation that ever happened.

use crate::loom::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use crate::scheduler::Scheduler;
use core::any::Any;
use core::fmt;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

/// Where a context is in its binding protocol.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum ContextKind {
    /// Never binds to a parent; cancellation reaches it only directly.
    Isolated = 0,
    /// Bound, but the parent is not yet known; it is inferred from the
    /// spawning task at the first root allocation into this context.
    BindingRequired = 1,
    /// Bound and the parent link is final.
    BindingCompleted = 2,
}

/// The shared, address-stable part of a [`GroupContext`].
pub(crate) struct ContextInner {
    kind: AtomicU8,
    /// The scheduler whose context list this node is on. Null for isolated
    /// contexts, which are never listed.
    pub(crate) owner: AtomicPtr<Scheduler>,
    pub(crate) parent: AtomicPtr<ContextInner>,
    /// 0 or 1; moves 0 -> 1 exactly once per [`reset`](GroupContext::reset)
    /// epoch.
    cancellation_requested: AtomicUsize,
    /// Captured panic payload; written by the thread that won the
    /// cancellation CAS.
    panic: spin::Mutex<Option<CapturedPanic>>,
    /// Intrusive links on the owner scheduler's context list.
    pub(crate) prev: AtomicPtr<ContextInner>,
    pub(crate) next: AtomicPtr<ContextInner>,
}

// === impl ContextInner ===

impl ContextInner {
    pub(crate) fn new(kind: ContextKind) -> Self {
        Self {
            kind: AtomicU8::new(kind as u8),
            owner: AtomicPtr::new(ptr::null_mut()),
            parent: AtomicPtr::new(ptr::null_mut()),
            cancellation_requested: AtomicUsize::new(0),
            panic: spin::Mutex::new(None),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn kind(&self) -> ContextKind {
        match self.kind.load(Ordering::Relaxed) {
            0 => ContextKind::Isolated,
            1 => ContextKind::BindingRequired,
            _ => ContextKind::BindingCompleted,
        }
    }

    pub(crate) fn set_kind(&self, kind: ContextKind) {
        self.kind.store(kind as u8, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancellation_requested.load(Ordering::Acquire) != 0
    }

    /// Clears the cancellation flag at the outermost master dispatch exit,
    /// once the whole task tree under this context has collapsed.
    pub(crate) fn clear_cancellation(&self) {
        self.cancellation_requested.store(0, Ordering::Release);
    }

    /// Attempts the 0 -> 1 cancellation transition. The winner is
    /// responsible for propagation and may store the captured panic.
    pub(crate) fn try_cancel(&self) -> bool {
        self.cancellation_requested
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn store_panic(&self, panic: CapturedPanic) {
        *self.panic.lock() = Some(panic);
    }

    pub(crate) fn take_panic(&self) -> Option<CapturedPanic> {
        self.panic.lock().take()
    }

    /// Adopts the parent's cancellation flag verbatim. Valid only when the
    /// local and global cancellation generations agree (no propagation can
    /// be missing).
    pub(crate) fn copy_cancellation_from_parent(&self) {
        if let Some(parent) = NonNull::new(self.parent.load(Ordering::Acquire)) {
            // Safety: parent contexts outlive their descendants.
            let cancelled = unsafe { parent.as_ref().is_cancelled() };
            self.cancellation_requested
                .store(usize::from(cancelled), Ordering::Release);
        }
    }

    /// Walks `parent` links looking for a cancelled ancestor; if one exists,
    /// marks every context on the path to it (this one included).
    pub(crate) fn propagate_cancellation_from_ancestors(&self) {
        let mut ancestor = self.parent.load(Ordering::Acquire);
        // Safety: parent contexts outlive their descendants; the caller
        // holds either the owner list lock or the creation-time exclusivity.
        unsafe {
            while let Some(a) = NonNull::new(ancestor) {
                if a.as_ref().is_cancelled() {
                    break;
                }
                ancestor = a.as_ref().parent.load(Ordering::Acquire);
            }
            if ancestor.is_null() {
                return;
            }
            // One of our ancestor groups was cancelled; mark the whole path.
            let mut ctx: *const ContextInner = self;
            while !ptr::eq(ctx, ancestor) {
                (*ctx)
                    .cancellation_requested
                    .store(1, Ordering::Release);
                ctx = (*ctx).parent.load(Ordering::Acquire);
            }
        }
    }
}

impl fmt::Debug for ContextInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextInner")
            .field("kind", &self.kind())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// A panic captured on one thread, transferable to (and resumable on)
/// another.
///
/// The `summary` preserves the panic message when it was a string, so
/// callers can report what happened without resuming the unwind.
pub struct CapturedPanic {
    summary: String,
    payload: Box<dyn Any + Send>,
}

// === impl CapturedPanic ===

impl CapturedPanic {
    pub(crate) fn new(payload: Box<dyn Any + Send>) -> Self {
        let summary = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unidentified panic".to_owned()
        };
        Self { summary, payload }
    }

    /// The panic message, or `"unidentified panic"` for non-string payloads.
    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn into_payload(self) -> Box<dyn Any + Send> {
        self.payload
    }

    /// Continues unwinding on the calling thread with the original payload.
    pub fn resume(self) -> ! {
        std::panic::resume_unwind(self.payload)
    }
}

impl fmt::Debug for CapturedPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedPanic")
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}

/// A cancellation scope for a group of tasks.
///
/// Root tasks allocated through [`allocate_root_in`][crate::allocate_root_in]
/// belong to the given context; child tasks inherit their parent's. A
/// *bound* context attaches itself under the context of the task that first
/// spawns roots into it, so cancelling an outer group reaches every inner
/// one. An *isolated* context ignores its surroundings.
///
/// The handle is `!Send`: it must be dropped on the thread that created it,
/// while that thread's runtime registration is still alive.
pub struct GroupContext {
    inner: NonNull<ContextInner>,
    _not_send: PhantomData<*mut ()>,
}

// === impl GroupContext ===

impl GroupContext {
    /// Creates a context that never binds to an enclosing one.
    pub fn isolated() -> Self {
        let inner = Box::new(ContextInner::new(ContextKind::Isolated));
        // Safety: Box::into_raw never returns null.
        let inner = unsafe { NonNull::new_unchecked(Box::into_raw(inner)) };
        Self {
            inner,
            _not_send: PhantomData,
        }
    }

    /// Creates a context that binds to the spawning task's context at first
    /// use.
    ///
    /// # Panics
    ///
    /// Panics when the calling thread has no live
    /// [`Runtime`][crate::Runtime] registration.
    pub fn bound() -> Self {
        let scheduler = crate::runtime::expect_current_scheduler();
        let inner = Box::new(ContextInner::new(ContextKind::BindingRequired));
        inner.owner.store(scheduler.as_ptr(), Ordering::Relaxed);
        // Safety: Box::into_raw never returns null.
        let inner = unsafe { NonNull::new_unchecked(Box::into_raw(inner)) };
        // Safety: the scheduler is valid while this thread stays registered.
        unsafe {
            scheduler.as_ref().register_context(inner);
        }
        Self {
            inner,
            _not_send: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn inner(&self) -> NonNull<ContextInner> {
        self.inner
    }

    /// Requests cancellation of this group and every group bound beneath it.
    ///
    /// Returns `true` for the caller that actually performed the
    /// cancellation, `false` when the group was already cancelled.
    pub fn cancel_group_execution(&self) -> bool {
        // Safety: inner is alive as long as the handle is.
        let inner = unsafe { self.inner.as_ref() };
        if !inner.try_cancel() {
            return false;
        }
        tracing::debug!(ctx = ?self.inner, "group cancellation requested");
        propagate_cancellation();
        true
    }

    pub fn is_group_execution_cancelled(&self) -> bool {
        // Safety: as above.
        unsafe { self.inner.as_ref().is_cancelled() }
    }

    /// Rearms a cancelled context for reuse.
    ///
    /// Not thread-safe: no task belonging to this group may be running.
    pub fn reset(&mut self) {
        // Safety: as above; &mut self plus the documented contract give us
        // exclusivity.
        let inner = unsafe { self.inner.as_ref() };
        drop(inner.take_panic());
        inner.clear_cancellation();
    }

    /// Takes the panic captured when a task of this group panicked, if any.
    pub fn take_captured_panic(&self) -> Option<CapturedPanic> {
        // Safety: as above.
        unsafe { self.inner.as_ref().take_panic() }
    }
}

impl Drop for GroupContext {
    fn drop(&mut self) {
        // Safety: inner stays alive until the Box::from_raw below.
        unsafe {
            let inner = self.inner.as_ref();
            if let Some(owner) = NonNull::new(inner.owner.load(Ordering::Relaxed)) {
                owner.as_ref().unregister_context(self.inner);
            }
            drop(Box::from_raw(self.inner.as_ptr()));
        }
    }
}

impl fmt::Debug for GroupContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Safety: inner is alive as long as the handle is.
        unsafe { self.inner.as_ref().fmt(f) }
    }
}

impl Default for GroupContext {
    fn default() -> Self {
        Self::bound()
    }
}

/// The slow path behind a winning [`GroupContext::cancel_group_execution`]:
/// advance the global cancellation generation, walk every scheduler's
/// context list marking newly-cancelled descendants, then sync every
/// scheduler's local generation snapshot.
///
/// The whole walk runs under the global scheduler-list mutex so at most one
/// propagation is in flight at a time.
pub(crate) fn propagate_cancellation() {
    let scheduler = crate::runtime::expect_current_scheduler();
    let global = crate::runtime::global();

    let _list_guard = global.lock_scheduler_list();
    global.cancel_count.fetch_add(1, Ordering::Release);

    // Safety: the scheduler is valid while this thread stays registered, and
    // the arena outlives all of its workers.
    let arena = unsafe { scheduler.as_ref().arena() };

    // Phase one: mark. Workers are reached through the arena...
    for worker in arena.workers() {
        if let Some(s) = worker.published_scheduler() {
            // Safety: a published worker scheduler stays alive until the
            // arena joins it, which cannot happen while we hold the list
            // mutex (terminate also takes it to unregister masters).
            unsafe { s.as_ref().propagate_cancellation_to_local_contexts() }
        }
    }
    // ...masters through the global scheduler list.
    global.for_each_master(|s| {
        // Safety: masters unregister under the held mutex, so s is alive.
        unsafe { s.as_ref().propagate_cancellation_to_local_contexts() }
    });

    // Phase two: sync local generation snapshots so every fast path knows
    // the propagation above has been observed.
    let generation = global.cancel_count.load(Ordering::Acquire);
    for worker in arena.workers() {
        if let Some(s) = worker.published_scheduler() {
            // Safety: as above.
            unsafe {
                s.as_ref()
                    .local_cancel_count
                    .store(generation, Ordering::Release);
            }
        }
    }
    global.for_each_master(|s| {
        // Safety: as above.
        unsafe {
            s.as_ref()
                .local_cancel_count
                .store(generation, Ordering::Release);
        }
    });
}
