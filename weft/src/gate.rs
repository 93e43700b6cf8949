// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The arena's sleep/wake state machine.
//!
//! The gate packs its whole protocol into one machine word. Idle workers
//! park on it while it reads [`EMPTY`]; a spawner that publishes work forces
//! it to [`FULL`]; shutdown forces it [`PERMANENTLY_OPEN`] so sleepers can
//! never be stranded. Any *other* value is a snapshot token: the address of
//! the scheduler currently scanning all arena slots to decide whether the
//! pool really drained (see `Scheduler::wait_while_pool_is_empty`).

use crate::loom::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

pub(crate) type State = isize;

/// No published pool holds work; workers may sleep.
pub(crate) const EMPTY: State = 0;
/// Some pool may hold work.
pub(crate) const FULL: State = -1;
/// The arena is shutting down; the gate never closes again.
pub(crate) const PERMANENTLY_OPEN: State = -2;

pub(crate) struct Gate {
    state: AtomicIsize,
    /// Pairs with `sleepers` so that a wake between the state re-check and
    /// the park cannot be missed.
    mutex: Mutex<()>,
    sleepers: Condvar,
}

// === impl Gate ===

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicIsize::new(EMPTY),
            mutex: Mutex::new(()),
            sleepers: Condvar::new(),
        }
    }

    #[inline]
    pub(crate) fn get_state(&self) -> State {
        self.state.load(Ordering::Relaxed)
    }

    /// Attempts to move the gate from `expected` to `new`.
    ///
    /// With `force`, the transition is applied from *any* current state
    /// except [`PERMANENTLY_OPEN`], which is terminal.
    pub(crate) fn try_update(&self, expected: State, new: State, force: bool) {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current == PERMANENTLY_OPEN || (current != expected && !force) {
                return;
            }
            if self
                .state
                .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            tracing::trace!(from = current, to = new, "gate transition");
            if current == EMPTY && new != EMPTY {
                // Opened the gate: wake sleepers. Taking the mutex orders the
                // notify against a sleeper that re-checked EMPTY but has not
                // parked yet.
                let _guard = self
                    .mutex
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                self.sleepers.notify_all();
            }
            return;
        }
    }

    /// Blocks the calling thread while the gate reads [`EMPTY`].
    ///
    /// Spurious wakeups are allowed; callers re-check arena state anyway.
    pub(crate) fn wait(&self) {
        let mut guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        while self.state.load(Ordering::Acquire) == EMPTY {
            guard = self
                .sleepers
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl core::fmt::Debug for Gate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Gate").field("state", &self.get_state()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use std::sync::Arc;

    #[test]
    fn plain_transitions() {
        let gate = Gate::new();
        assert_eq!(gate.get_state(), EMPTY);

        // Expected-state mismatch is a no-op without force.
        gate.try_update(FULL, EMPTY, false);
        assert_eq!(gate.get_state(), EMPTY);

        gate.try_update(EMPTY, FULL, false);
        assert_eq!(gate.get_state(), FULL);

        // Forced transition applies from any state.
        gate.try_update(EMPTY, PERMANENTLY_OPEN, true);
        assert_eq!(gate.get_state(), PERMANENTLY_OPEN);

        // PERMANENTLY_OPEN is terminal, even against force.
        gate.try_update(PERMANENTLY_OPEN, EMPTY, true);
        assert_eq!(gate.get_state(), PERMANENTLY_OPEN);
    }

    #[test]
    fn snapshot_token_roundtrip() {
        let gate = Gate::new();
        gate.try_update(EMPTY, FULL, false);

        // Claim the snapshot: FULL -> thread-unique token.
        let token = 0x1000 as State;
        gate.try_update(FULL, token, false);
        assert_eq!(gate.get_state(), token);
        // Scan found nothing: close the gate again.
        gate.try_update(token, EMPTY, false);
        assert_eq!(gate.get_state(), EMPTY);
    }

    #[test]
    fn wait_wakes_on_open() {
        loom::model(|| {
            let gate = Arc::new(Gate::new());

            let sleeper = {
                let gate = gate.clone();
                loom::thread::spawn(move || {
                    gate.wait();
                    assert_ne!(gate.get_state(), EMPTY);
                })
            };

            let gate2 = gate.clone();
            let waker = loom::thread::spawn(move || {
                gate2.try_update(FULL, PERMANENTLY_OPEN, true);
            });

            sleeper.join().unwrap();
            waker.join().unwrap();
        });
    }
}
