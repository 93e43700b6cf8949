// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Group cancellation cut-off and panic capture across threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use weft::{Execution, GroupContext, Job, Runtime, TaskRef};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> std::sync::MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

const THREADS: usize = 4;

/// Fans out `n` children from inside a task, then blocks until they are
/// done.
struct FanOut<F: Fn(usize) -> C, C: Job> {
    n: usize,
    make: F,
}

impl<F, C> Job for FanOut<F, C>
where
    F: Fn(usize) -> C + Send,
    C: Job,
{
    fn execute(&mut self, cx: &mut Execution<'_>) -> Option<TaskRef> {
        cx.set_ref_count(self.n + 1);
        for i in 0..self.n {
            let child = cx.allocate_child((self.make)(i)).unwrap();
            cx.spawn(child);
        }
        cx.wait_for_all();
        None
    }
}

struct MaybeCancel {
    index: usize,
    cancel_at: usize,
    cancelled: Arc<AtomicBool>,
    ran_after_cancel: Arc<AtomicUsize>,
    ran: Arc<AtomicUsize>,
}

impl Job for MaybeCancel {
    fn execute(&mut self, cx: &mut Execution<'_>) -> Option<TaskRef> {
        if self.cancelled.load(Ordering::SeqCst) {
            self.ran_after_cancel.fetch_add(1, Ordering::SeqCst);
        }
        self.ran.fetch_add(1, Ordering::SeqCst);
        if self.index == self.cancel_at {
            self.cancelled.store(true, Ordering::SeqCst);
            assert!(cx.cancel_group_execution());
            // A second request is a no-op.
            assert!(!cx.cancel_group_execution());
            assert!(cx.is_cancelled());
        }
        None
    }
}

#[test]
fn cancellation_cuts_off_remaining_tasks() {
    let _serial = serial();
    let rt = Runtime::with_threads(THREADS);

    const N: usize = 1000;
    let cancelled = Arc::new(AtomicBool::new(false));
    let ran_after_cancel = Arc::new(AtomicUsize::new(0));
    let ran = Arc::new(AtomicUsize::new(0));

    let ctx = GroupContext::isolated();
    let root = weft::allocate_root_in(
        &ctx,
        FanOut {
            n: N,
            make: {
                let cancelled = cancelled.clone();
                let ran_after_cancel = ran_after_cancel.clone();
                let ran = ran.clone();
                move |index| MaybeCancel {
                    index,
                    cancel_at: 10,
                    cancelled: cancelled.clone(),
                    ran_after_cancel: ran_after_cancel.clone(),
                    ran: ran.clone(),
                }
            },
        },
    )
    .unwrap();
    weft::spawn_root_and_wait(root);

    assert!(ctx.is_group_execution_cancelled());
    assert!(cancelled.load(Ordering::SeqCst));
    // Once the cancel lands, only tasks already claimed by a thread may
    // still run their bodies: at most one per thread plus a little slack.
    let after = ran_after_cancel.load(Ordering::SeqCst);
    assert!(
        after <= THREADS + 32,
        "{after} task bodies ran after cancellation"
    );
    // And cancellation is stable: nothing un-cancels without reset().
    assert!(ctx.is_group_execution_cancelled());

    rt.terminate();
    assert_eq!(weft::task_node_count(), 0, "leaked task allocations");
}

#[test]
fn reset_rearms_a_cancelled_context() {
    let _serial = serial();
    let rt = Runtime::with_threads(2);

    let mut ctx = GroupContext::isolated();
    assert!(ctx.cancel_group_execution());
    assert!(ctx.is_group_execution_cancelled());
    ctx.reset();
    assert!(!ctx.is_group_execution_cancelled());

    drop(ctx);
    rt.terminate();
}

struct PanicAt {
    index: usize,
    panic_at: usize,
    ran: Arc<AtomicUsize>,
}

impl Job for PanicAt {
    fn execute(&mut self, _cx: &mut Execution<'_>) -> Option<TaskRef> {
        self.ran.fetch_add(1, Ordering::SeqCst);
        assert!(self.index != self.panic_at, "boom in leaf 7");
        None
    }
}

#[test]
fn leaf_panic_reaches_the_root_wait() {
    let _serial = serial();
    let rt = Runtime::with_threads(THREADS);

    let ran = Arc::new(AtomicUsize::new(0));
    let ctx = GroupContext::bound();
    let root = weft::allocate_root_in(
        &ctx,
        FanOut {
            n: 64,
            make: {
                let ran = ran.clone();
                move |index| PanicAt {
                    index,
                    panic_at: 7,
                    ran: ran.clone(),
                }
            },
        },
    )
    .unwrap();

    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        weft::spawn_root_and_wait(root);
    }))
    .expect_err("the leaf panic must surface in the waiting master");

    let message = caught
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| caught.downcast_ref::<&str>().map(|s| (*s).to_owned()))
        .expect("panic payload lost its message");
    assert!(
        message.contains("boom in leaf 7"),
        "unexpected panic message: {message}"
    );

    drop(ctx);
    rt.terminate();
    assert_eq!(weft::task_node_count(), 0, "leaked task allocations");
}

/// A bound child context created inside a task joins the cancellation tree
/// of its spawner's context.
struct NestedBound {
    inner_saw_cancel: Arc<AtomicBool>,
}

impl Job for NestedBound {
    fn execute(&mut self, cx: &mut Execution<'_>) -> Option<TaskRef> {
        let inner = GroupContext::bound();
        // Binding happens at the first root allocation into the context.
        let probe = weft::allocate_root_in(&inner, Noop).unwrap();
        probe.destroy();
        // Cancel the *outer* group; the bound inner context must observe it.
        cx.cancel_group_execution();
        self.inner_saw_cancel
            .store(inner.is_group_execution_cancelled(), Ordering::SeqCst);
        None
    }
}

struct Noop;

impl Job for Noop {
    fn execute(&mut self, _cx: &mut Execution<'_>) -> Option<TaskRef> {
        None
    }
}

#[test]
fn cancellation_propagates_to_bound_descendants() {
    let _serial = serial();
    let rt = Runtime::with_threads(2);

    let inner_saw_cancel = Arc::new(AtomicBool::new(false));
    let ctx = GroupContext::isolated();
    let root = weft::allocate_root_in(
        &ctx,
        NestedBound {
            inner_saw_cancel: inner_saw_cancel.clone(),
        },
    )
    .unwrap();
    weft::spawn_root_and_wait(root);

    assert!(ctx.is_group_execution_cancelled());
    assert!(
        inner_saw_cancel.load(Ordering::SeqCst),
        "bound descendant context missed the cancellation"
    );

    rt.terminate();
    assert_eq!(weft::task_node_count(), 0, "leaked task allocations");
}
