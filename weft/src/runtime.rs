// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process-wide runtime state and the master lifecycle.
//!
//! The three pieces of global mutable state (the singleton arena slot, the
//! global cancellation counter, and the master scheduler list) live together
//! in one lazily-initialized [`Global`], each guarded by its own lock.

use crate::arena::Arena;
use crate::context::{ContextInner, ContextKind};
use crate::scheduler::{self, Scheduler};
use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

thread_local! {
    static CURRENT_SCHEDULER: Cell<*mut Scheduler> = const { Cell::new(ptr::null_mut()) };
}

pub(crate) fn current_scheduler() -> Option<NonNull<Scheduler>> {
    CURRENT_SCHEDULER.with(|c| NonNull::new(c.get()))
}

#[track_caller]
pub(crate) fn expect_current_scheduler() -> NonNull<Scheduler> {
    current_scheduler().expect("thread has no live Runtime registration")
}

pub(crate) fn set_current_scheduler(s: NonNull<Scheduler>) {
    CURRENT_SCHEDULER.with(|c| {
        debug_assert!(c.get().is_null(), "scheduler already registered");
        c.set(s.as_ptr());
    });
}

pub(crate) fn clear_current_scheduler() {
    CURRENT_SCHEDULER.with(|c| c.set(ptr::null_mut()));
}

struct ArenaState {
    arena: Option<Arc<Arena>>,
    masters: usize,
}

pub(crate) struct Global {
    /// The singleton arena plus the count of masters attached to it.
    arena: Mutex<ArenaState>,
    /// Serializes cancellation propagation and master list mutation.
    scheduler_list: Mutex<()>,
    /// Head of the intrusive master scheduler list, guarded by
    /// `scheduler_list`.
    master_list_first: AtomicPtr<Scheduler>,
    /// Cancellation generation count, bumped on every propagated cancel.
    pub(crate) cancel_count: AtomicUsize,
}

// === impl Global ===

impl Global {
    fn new() -> Self {
        Self {
            arena: Mutex::new(ArenaState {
                arena: None,
                masters: 0,
            }),
            scheduler_list: Mutex::new(()),
            master_list_first: AtomicPtr::new(ptr::null_mut()),
            cancel_count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn lock_scheduler_list(&self) -> MutexGuard<'_, ()> {
        self.scheduler_list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Visits every registered master scheduler. The caller must hold the
    /// scheduler-list lock.
    pub(crate) fn for_each_master(&self, mut f: impl FnMut(NonNull<Scheduler>)) {
        let mut cursor = self.master_list_first.load(Ordering::Acquire);
        while let Some(s) = NonNull::new(cursor) {
            // Safety: masters unregister under the scheduler-list lock,
            // which the caller holds.
            cursor = unsafe { s.as_ref().master_next.load(Ordering::Relaxed) };
            f(s);
        }
    }

    pub(crate) fn register_master(&self, s: NonNull<Scheduler>) {
        let _guard = self.lock_scheduler_list();
        let first = self.master_list_first.load(Ordering::Relaxed);
        // Safety: s is a live scheduler being registered by its own thread.
        unsafe {
            s.as_ref().master_prev.store(ptr::null_mut(), Ordering::Relaxed);
            s.as_ref().master_next.store(first, Ordering::Relaxed);
            if let Some(first) = NonNull::new(first) {
                first.as_ref().master_prev.store(s.as_ptr(), Ordering::Relaxed);
            }
        }
        self.master_list_first.store(s.as_ptr(), Ordering::Release);
    }

    pub(crate) fn unregister_master(&self, s: NonNull<Scheduler>) {
        let _guard = self.lock_scheduler_list();
        // Safety: s is registered and alive; the lock serializes traversal.
        unsafe {
            let prev = s.as_ref().master_prev.load(Ordering::Relaxed);
            let next = s.as_ref().master_next.load(Ordering::Relaxed);
            match NonNull::new(prev) {
                Some(prev) => prev.as_ref().master_next.store(next, Ordering::Relaxed),
                None => self.master_list_first.store(next, Ordering::Release),
            }
            if let Some(next) = NonNull::new(next) {
                next.as_ref().master_prev.store(prev, Ordering::Relaxed);
            }
        }
    }
}

static GLOBAL: OnceLock<Global> = OnceLock::new();

pub(crate) fn global() -> &'static Global {
    GLOBAL.get_or_init(|| {
        if std::env::var_os("WEFT_VERBOSE").is_some() {
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                threads = default_num_threads(),
                "weft runtime"
            );
        }
        Global::new()
    })
}

/// The context attached to worker dummy tasks. Never cancelled; it only
/// exists so every executable task has a context to consult.
pub(crate) fn worker_dummy_context() -> NonNull<ContextInner> {
    static DUMMY: OnceLock<Box<ContextInner>> = OnceLock::new();
    NonNull::from(
        DUMMY
            .get_or_init(|| Box::new(ContextInner::new(ContextKind::Isolated)))
            .as_ref(),
    )
}

/// The default degree of parallelism: one thread per hardware thread, or
/// the `WEFT_THREADS` override.
pub fn default_num_threads() -> usize {
    if let Some(n) = std::env::var("WEFT_THREADS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&n| n >= 1)
    {
        return n;
    }
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

/// A live registration of the calling thread as a *master* of the runtime.
///
/// The first `Runtime` in the process creates the singleton arena and its
/// workers; later ones (on other threads) join it as additional masters, and
/// nested ones on the same thread are reference counted. Dropping the last
/// `Runtime` of the last master shuts the workers down and returns the
/// process to its pre-init state; init/terminate pairs are idempotent at the
/// process level.
///
/// The handle is `!Send`: it must be dropped on the thread that created it.
#[must_use = "dropping a Runtime immediately terminates the registration"]
pub struct Runtime {
    _not_send: PhantomData<*mut ()>,
}

// === impl Runtime ===

impl Runtime {
    /// Registers the calling thread, sizing the worker pool automatically
    /// if this is the first registration in the process.
    pub fn initialize() -> Self {
        Self::init_inner(None)
    }

    /// Like [`initialize`][Self::initialize] with an explicit thread count
    /// (workers plus the calling master).
    ///
    /// The count only matters for the *first* arena creation; the worker
    /// pool never resizes afterwards, so later calls join whatever exists.
    ///
    /// # Panics
    ///
    /// Panics if `num_threads` is zero.
    pub fn with_threads(num_threads: usize) -> Self {
        assert!(num_threads >= 1, "num_threads must be at least 1");
        Self::init_inner(Some(num_threads))
    }

    fn init_inner(num_threads: Option<usize>) -> Self {
        let global = global();

        if let Some(s) = current_scheduler() {
            // Nested initialization on an already-registered thread.
            // Safety: the TLS pointer is valid while registered.
            let count = unsafe { s.as_ref().init_ref_count() };
            count.set(count.get() + 1);
            return Self {
                _not_send: PhantomData,
            };
        }

        let arena = {
            let mut state = global.arena.lock().unwrap_or_else(PoisonError::into_inner);
            state.masters += 1;
            match &state.arena {
                Some(arena) => Arc::clone(arena),
                None => {
                    let arena =
                        Arena::create(num_threads.unwrap_or_else(default_num_threads));
                    state.arena = Some(Arc::clone(&arena));
                    arena
                }
            }
        };

        scheduler::create_master(arena);
        Self {
            _not_send: PhantomData,
        }
    }

    /// Ends this registration. Equivalent to dropping the handle.
    pub fn terminate(self) {
        drop(self);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let s = expect_current_scheduler();
        // Safety: the TLS pointer is valid while registered.
        let count = unsafe { s.as_ref().init_ref_count() };
        debug_assert!(count.get() >= 1);
        count.set(count.get() - 1);
        if count.get() > 0 {
            return;
        }

        // Safety: last registration on this thread; all of the master's
        // waits have returned, so its tasks are done.
        unsafe {
            scheduler::free_scheduler(s);
        }

        let arena = {
            let mut state = global()
                .arena
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            state.masters -= 1;
            if state.masters == 0 {
                state.arena.take()
            } else {
                None
            }
        };
        if let Some(arena) = arena {
            // Last master: stop the workers and release the global arena
            // reference.
            arena.terminate_workers();
        }
    }
}

impl core::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Runtime")
    }
}
