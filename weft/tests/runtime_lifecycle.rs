// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Master/worker lifecycle: init/terminate idempotence, nested
//! registrations, and multiple concurrent masters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use weft::{Execution, Job, Runtime, TaskRef};

static SERIAL: Mutex<()> = Mutex::new(());

struct Tick {
    hits: Arc<AtomicUsize>,
}

impl Job for Tick {
    fn execute(&mut self, _cx: &mut Execution<'_>) -> Option<TaskRef> {
        self.hits.fetch_add(1, Ordering::Relaxed);
        None
    }
}

fn run_some_work() {
    let hits = Arc::new(AtomicUsize::new(0));
    let mut list = weft::TaskList::new();
    for _ in 0..32 {
        list.push_back(weft::allocate_root(Tick { hits: hits.clone() }).unwrap());
    }
    weft::spawn_root_list_and_wait(list);
    assert_eq!(hits.load(Ordering::Relaxed), 32);
}

#[test]
fn repeated_init_terminate_pairs_are_idempotent() {
    let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);

    for round in 0..3 {
        let rt = Runtime::with_threads(3);
        run_some_work();
        rt.terminate();
        assert_eq!(
            weft::task_node_count(),
            0,
            "leaked task allocations after round {round}"
        );
    }
}

#[test]
fn nested_initialization_is_reference_counted() {
    let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);

    let outer = Runtime::with_threads(2);
    let inner = Runtime::initialize();
    run_some_work();
    inner.terminate();
    // The outer registration is still live.
    run_some_work();
    outer.terminate();
    assert_eq!(weft::task_node_count(), 0, "leaked task allocations");
}

#[test]
fn multiple_masters_share_the_arena() {
    let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);

    let first = Runtime::with_threads(4);

    let joins: Vec<_> = (0..3)
        .map(|_| {
            std::thread::spawn(|| {
                let rt = Runtime::initialize();
                run_some_work();
                rt.terminate();
            })
        })
        .collect();
    run_some_work();
    for join in joins {
        join.join().unwrap();
    }

    first.terminate();
    assert_eq!(weft::task_node_count(), 0, "leaked task allocations");
}

#[test]
fn single_threaded_runtime_runs_everything_locally() {
    let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);

    // One thread means zero workers; the master does all the work itself.
    let rt = Runtime::with_threads(1);
    run_some_work();
    rt.terminate();
    assert_eq!(weft::task_node_count(), 0, "leaked task allocations");
}
