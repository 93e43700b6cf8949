// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicU8, Ordering};
use core::fmt;

/// Task state. The task stores its lifecycle stage and kind flags in a
/// single atomic byte with the following layout:
///
/// ```text
/// | 7   6 | 5                5 | 4   4 | 3     3 | 2       0 |
/// | unused | ref count active  |  big  |  proxy  | lifecycle |
/// ```
///
/// The lifecycle is only ever advanced by the thread that currently owns the
/// task (the owner for ready/executing transitions, a consumer for claim
/// transitions); other threads may observe it through the pool lock's
/// release/acquire pairing.
pub(crate) struct TaskState {
    val: AtomicU8,
}

mycelium_bitfield::bitfield! {
    /// A snapshot of a task's current state byte.
    #[derive(PartialEq, Eq)]
    pub(crate) struct Snapshot<u8> {
        /// Where the task is in its lifecycle.
        pub(crate) const LIFECYCLE: Lifecycle;
        /// If set, this task is a mailbox proxy and must never be executed.
        pub(crate) const PROXY: bool;
        /// If set, this task was individually allocated rather than drawn
        /// from the small-task pool.
        pub(crate) const BIG: bool;
        /// If set, children may still decrement the task's ref count, so the
        /// owner must not overwrite it.
        pub(crate) const REF_COUNT_ACTIVE: bool;
    }
}

/// The spec's six task lifecycle stages.
///
/// Legal transitions are `Allocated -> Ready -> Executing` followed by one
/// of `{Allocated, Freed, Recycle, Reexecute}`; only the owning scheduler
/// may move a task out of `Executing`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum Lifecycle {
    /// Storage is initialized and owned by client code.
    Allocated = 0b000,
    /// Linked into a task pool (or carried by a proxy), waiting to run.
    Ready = 0b001,
    /// Running inside the dispatch loop right now.
    Executing = 0b010,
    /// Returned to a free list or the allocator.
    Freed = 0b011,
    /// Marked by `recycle_as_safe_continuation`; the dispatcher decrements
    /// the task's own ref count instead of destroying it.
    Recycle = 0b100,
    /// Marked by `recycle_to_reexecute`; the dispatcher respawns the task at
    /// the same depth.
    Reexecute = 0b101,
}

impl mycelium_bitfield::FromBits<u8> for Lifecycle {
    const BITS: u32 = 3;
    type Error = &'static str;

    fn try_from_bits(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            0b000 => Ok(Self::Allocated),
            0b001 => Ok(Self::Ready),
            0b010 => Ok(Self::Executing),
            0b011 => Ok(Self::Freed),
            0b100 => Ok(Self::Recycle),
            0b101 => Ok(Self::Reexecute),
            _ => Err("invalid task lifecycle"),
        }
    }

    fn into_bits(self) -> u8 {
        self as u8
    }
}

// === impl TaskState ===

impl TaskState {
    pub(crate) fn new(proxy: bool, big: bool) -> Self {
        let snapshot = Snapshot::new()
            .with(Snapshot::LIFECYCLE, Lifecycle::Allocated)
            .with(Snapshot::PROXY, proxy)
            .with(Snapshot::BIG, big);
        Self {
            val: AtomicU8::new(snapshot.0),
        }
    }

    pub(crate) fn load(&self, ordering: Ordering) -> Snapshot {
        Snapshot(self.val.load(ordering))
    }

    #[inline]
    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.load(Ordering::Relaxed).get(Snapshot::LIFECYCLE)
    }

    #[inline]
    pub(crate) fn is_proxy(&self) -> bool {
        self.load(Ordering::Relaxed).get(Snapshot::PROXY)
    }

    #[inline]
    pub(crate) fn is_big(&self) -> bool {
        self.load(Ordering::Relaxed).get(Snapshot::BIG)
    }

    /// Advances the lifecycle stage.
    ///
    /// Only the thread that currently owns the task may call this; the debug
    /// assertion documents the legal edges from the spec's state machine.
    pub(crate) fn transition(&self, to: Lifecycle) {
        #[cfg(debug_assertions)]
        {
            use Lifecycle::*;
            let from = self.lifecycle();
            let legal = matches!(
                (from, to),
                (Allocated, Ready)
                    | (Allocated, Executing)
                    | (Allocated, Freed)
                    | (Ready, Executing)
                    | (Ready, Allocated)
                    | (Executing, Allocated)
                    | (Executing, Freed)
                    | (Executing, Recycle)
                    | (Executing, Reexecute)
                    | (Executing, Executing)
                    | (Recycle, Allocated)
                    | (Reexecute, Allocated)
                    | (Reexecute, Ready)
                    | (Freed, Allocated)
            );
            debug_assert!(legal, "illegal task state transition {from:?} -> {to:?}");
        }
        let _ = self
            .val
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some(Snapshot(bits).with(Snapshot::LIFECYCLE, to).0)
            });
    }

    /// Sets or clears the ref-count-active flag (debug bookkeeping for the
    /// "ref_count race detected" assertion).
    pub(crate) fn set_ref_count_active(&self, active: bool) {
        let _ = self
            .val
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some(Snapshot(bits).with(Snapshot::REF_COUNT_ACTIVE, active).0)
            });
    }

    pub(crate) fn is_ref_count_active(&self) -> bool {
        self.load(Ordering::Relaxed).get(Snapshot::REF_COUNT_ACTIVE)
    }
}

impl fmt::Debug for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state() {
        let state = TaskState::new(false, false);
        assert_eq!(state.lifecycle(), Lifecycle::Allocated);
        assert!(!state.is_proxy());
        assert!(!state.is_big());
        assert!(!state.is_ref_count_active());
    }

    #[test]
    fn flags_survive_transitions() {
        let state = TaskState::new(true, true);
        state.transition(Lifecycle::Ready);
        state.transition(Lifecycle::Executing);
        state.transition(Lifecycle::Recycle);
        assert!(state.is_proxy());
        assert!(state.is_big());
        assert_eq!(state.lifecycle(), Lifecycle::Recycle);
    }

    #[test]
    #[should_panic(expected = "illegal task state transition")]
    #[cfg(debug_assertions)]
    fn illegal_transition_asserts() {
        let state = TaskState::new(false, false);
        // Ready without passing through the dispatcher cannot be recycled.
        state.transition(Lifecycle::Ready);
        state.transition(Lifecycle::Recycle);
    }
}
