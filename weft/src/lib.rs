// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A work-stealing task-parallel runtime.
//!
//! `weft` schedules explicit task trees over a fixed pool of worker threads
//! plus any number of user ("master") threads. Tasks are spawned into
//! per-thread, depth-indexed pools; idle threads steal from random victims
//! at the shallowest eligible depth; affinity-tagged tasks are routed
//! through per-thread mailboxes; and a task whose `execute` returns a
//! successor hands it straight to the dispatch loop, skipping the pools
//! entirely.
//!
//! The building blocks:
//!
//! - [`Runtime`]: per-thread registration; the first one brings up the
//!   process arena and its workers.
//! - [`Job`] + [`TaskRef`]: a unit of work and the owning handle to its
//!   allocation. Trees are built with [`allocate_root`],
//!   [`TaskRef::allocate_child`], and friends, and run with
//!   [`spawn_root_and_wait`].
//! - [`Execution`]: handed to every `execute` call; allocation, spawning,
//!   blocking waits, recycling, and cancellation checks for the running
//!   task.
//! - [`GroupContext`]: hierarchical one-shot cancellation scopes with
//!   panic capture.
//! - [`pipeline`]: an ordered-token pipeline dispatcher built on the task
//!   surface.

mod alloc;
mod arena;
mod context;
mod error;
mod gate;
mod loom;
mod mailbox;
mod pool;
pub mod pipeline;
mod runtime;
mod scheduler;
mod task;

pub use context::{CapturedPanic, GroupContext};
pub use error::AllocFailed;
pub use runtime::{Runtime, default_num_threads};
pub use scheduler::Execution;
pub use task::{AffinityId, Job, TaskList, TaskRef, task_node_count};

use crate::context::ContextKind;
use crate::task::{Header, Stub};
use core::ptr::NonNull;
use core::sync::atomic::Ordering;

/// Allocates a root task bound to the calling thread's scheduler and to the
/// context of the innermost running task (the master's default context at
/// top level).
///
/// # Errors
///
/// Fails when task storage cannot be allocated.
///
/// # Panics
///
/// Panics when the calling thread has no live [`Runtime`] registration.
pub fn allocate_root(job: impl Job) -> Result<TaskRef, AllocFailed> {
    let s = runtime::expect_current_scheduler();
    // Safety: the scheduler pointer is valid while this thread is
    // registered.
    unsafe {
        let s = s.as_ref();
        let innermost = s
            .innermost_running_task()
            .expect("thread has no dispatch context");
        let h = innermost.as_ref();
        s.allocate_task(job, h.depth() + 1, None, h.context.load(Ordering::Relaxed))
    }
}

/// Allocates a root task belonging to `ctx`.
///
/// A bound context binds to the innermost running task's context on its
/// first use here; see [`GroupContext::bound`].
///
/// # Errors
///
/// Fails when task storage cannot be allocated; the context is left unbound
/// in that case.
///
/// # Panics
///
/// Panics when the calling thread has no live [`Runtime`] registration.
pub fn allocate_root_in(ctx: &GroupContext, job: impl Job) -> Result<TaskRef, AllocFailed> {
    let s = runtime::expect_current_scheduler();
    let inner = ctx.inner();
    // Safety: scheduler valid while registered; the context inner outlives
    // the handle we borrowed it from.
    unsafe {
        let s = s.as_ref();
        let innermost = s
            .innermost_running_task()
            .expect("thread has no dispatch context");
        let task = s.allocate_task(
            job,
            innermost.as_ref().depth() + 1,
            None,
            inner.as_ptr(),
        )?;

        // The supported usage model prohibits concurrent initial binding,
        // so no interlocking is needed around the kind check.
        if inner.as_ref().kind() == ContextKind::BindingRequired {
            // In the innermost dispatch loop of a master there is nothing to
            // bind to; skip the binding part.
            if innermost != s.dummy_task() {
                let owner = inner.as_ref().owner.load(Ordering::Relaxed);
                let local_count_snapshot =
                    (*owner).local_cancel_count.load(Ordering::Relaxed);
                inner.as_ref().parent.store(
                    innermost.as_ref().context.load(Ordering::Relaxed),
                    Ordering::Release,
                );
                let global_count_snapshot = runtime::global()
                    .cancel_count
                    .load(Ordering::Acquire);
                if local_count_snapshot == global_count_snapshot {
                    // Any cancellation in our new ancestry has already been
                    // propagated everywhere, including to our parent; copy
                    // its flag directly.
                    inner.as_ref().copy_cancellation_from_parent();
                } else if !inner.as_ref().is_cancelled() {
                    // A propagation was in flight while we linked ourselves
                    // in and may have skipped us; walk the ancestors to make
                    // sure a cancelled one is not missed.
                    inner.as_ref().propagate_cancellation_from_ancestors();
                }
            }
            inner.as_ref().set_kind(ContextKind::BindingCompleted);
        }
        Ok(task)
    }
}

/// Spawns a task allocated on this thread.
///
/// # Panics
///
/// Panics when the calling thread has no live [`Runtime`] registration; in
/// debug builds, also when the task is owned by a different thread.
pub fn spawn(task: TaskRef) {
    let s = runtime::expect_current_scheduler();
    let raw = task.into_raw();
    // Safety: the handle proves allocation; spawn_single asserts ownership.
    unsafe {
        debug_assert!(
            core::ptr::eq(raw.as_ref().owner.load(Ordering::Relaxed), s.as_ptr()),
            "attempt to spawn task owned by another thread"
        );
        s.as_ref().spawn_single(raw);
    }
}

/// Spawns a list of same-depth tasks in one pool operation.
pub fn spawn_list(list: TaskList) {
    let Some(first) = list.into_chain() else {
        return;
    };
    let s = runtime::expect_current_scheduler();
    // Safety: the list owned its tasks; all were allocated on this thread.
    unsafe { s.as_ref().spawn_chain(first) }
}

/// Spawns a root task and dispatches until it (and everything it spawned
/// underneath) has completed.
///
/// If a task in the tree panicked, the panic resumes here with its original
/// payload once the tree has collapsed.
///
/// # Panics
///
/// Panics when storage for the sentinel parent cannot be allocated (the
/// root tasks themselves were already allocated fallibly up front).
pub fn spawn_root_and_wait(task: TaskRef) {
    let mut list = TaskList::new();
    list.push_back(task);
    spawn_root_list_and_wait(list);
}

/// [`spawn_root_and_wait`] over a whole list of root tasks sharing one
/// context. An empty list is vacuous success.
///
/// # Panics
///
/// See [`spawn_root_and_wait`].
pub fn spawn_root_list_and_wait(list: TaskList) {
    let Some(first) = list.into_chain() else {
        return;
    };
    let s = runtime::expect_current_scheduler();
    // Safety: the list owned its tasks, all allocated on this thread; the
    // dummy parent outlives the wait via the guard below.
    unsafe {
        let s = s.as_ref();
        let fh = first.as_ref();
        let context = fh.context.load(Ordering::Relaxed);

        // An auto-destroyed sentinel parent one level above the roots.
        let dummy = s
            .allocate_task(Stub, fh.depth() - 1, None, context)
            .expect("no memory for the sentinel parent of a root wait")
            .into_raw();
        let _guard = FreeOnExit { task: dummy };

        let mut n: isize = 0;
        for t in TaskList::iter_chain(Some(first)) {
            let h = t.as_ref();
            n += 1;
            debug_assert!(
                h.parent().is_none(),
                "not a root task, or already running"
            );
            debug_assert!(
                core::ptr::eq(h.context.load(Ordering::Relaxed), context),
                "all the root tasks in a list must share the same context"
            );
            h.parent.store(dummy.as_ptr(), Ordering::Relaxed);
        }
        dummy.as_ref().ref_count.store(n + 1, Ordering::Relaxed);
        if n > 1 {
            s.spawn_chain(fh.next_task().expect("list of n > 1 has a second task"));
        }
        s.wait_for_all(dummy, Some(first));
    }
}

/// Frees a sentinel task even when the wait unwinds with a captured panic.
struct FreeOnExit {
    task: NonNull<Header>,
}

impl Drop for FreeOnExit {
    fn drop(&mut self) {
        let s = runtime::expect_current_scheduler();
        // Safety: the sentinel is ours and its ref count has collapsed (the
        // dispatch loop zeroes it before returning or rethrowing).
        unsafe { s.as_ref().free_task(self.task) }
    }
}
