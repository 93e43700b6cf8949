// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Recursive divide-and-conquer clients of the public task surface: a
//! minimal parallel-for and parallel-reduce in the classic
//! continuation-passing shape.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use weft::{Execution, Job, Runtime, TaskRef};

/// The runtime is a process singleton; run these tests one at a time.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> std::sync::MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Continuation that just joins its children.
struct Join;

impl Job for Join {
    fn execute(&mut self, _cx: &mut Execution<'_>) -> Option<TaskRef> {
        None
    }
}

/// Adds one per element of `lo..hi`, splitting at grain-aligned midpoints
/// until a piece is at most `grain` long.
struct SumTask {
    lo: u64,
    hi: u64,
    grain: u64,
    sum: Arc<AtomicU64>,
    leaves: Arc<AtomicUsize>,
}

impl SumTask {
    fn split_off(&self, lo: u64, hi: u64) -> SumTask {
        SumTask {
            lo,
            hi,
            grain: self.grain,
            sum: self.sum.clone(),
            leaves: self.leaves.clone(),
        }
    }
}

impl Job for SumTask {
    fn execute(&mut self, cx: &mut Execution<'_>) -> Option<TaskRef> {
        if self.hi - self.lo <= self.grain {
            let mut acc = 0;
            for _ in self.lo..self.hi {
                acc += 1;
            }
            self.sum.fetch_add(acc, Ordering::Relaxed);
            self.leaves.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        // Split at a grain multiple so leaf count is exactly ceil(n/grain).
        let chunks = (self.hi - self.lo).div_ceil(self.grain);
        let mid = self.lo + (chunks / 2) * self.grain;
        let join = cx.allocate_continuation(Join).unwrap();
        join.set_ref_count(2);
        let left = join.allocate_child(self.split_off(self.lo, mid)).unwrap();
        let right = join.allocate_child(self.split_off(mid, self.hi)).unwrap();
        cx.spawn(right);
        // Ride the bypass into the left half.
        Some(left)
    }
}

#[test]
fn parallel_for_sums_and_runs_each_leaf_once() {
    let _serial = serial();
    let rt = Runtime::with_threads(4);

    let sum = Arc::new(AtomicU64::new(0));
    let leaves = Arc::new(AtomicUsize::new(0));
    let root = weft::allocate_root(SumTask {
        lo: 0,
        hi: 1000,
        grain: 10,
        sum: sum.clone(),
        leaves: leaves.clone(),
    })
    .unwrap();
    weft::spawn_root_and_wait(root);

    assert_eq!(sum.load(Ordering::Relaxed), 1000);
    assert_eq!(leaves.load(Ordering::Relaxed), 100);

    rt.terminate();
    assert_eq!(weft::task_node_count(), 0, "leaked task allocations");
}

/// Reduce with an explicit join step, counting splits and joins.
struct ReduceTask {
    lo: u64,
    hi: u64,
    grain: u64,
    total: Arc<AtomicU64>,
    splits: Arc<AtomicUsize>,
    joins: Arc<AtomicUsize>,
}

struct ReduceJoin {
    joins: Arc<AtomicUsize>,
}

impl Job for ReduceJoin {
    fn execute(&mut self, _cx: &mut Execution<'_>) -> Option<TaskRef> {
        self.joins.fetch_add(1, Ordering::Relaxed);
        None
    }
}

impl Job for ReduceTask {
    fn execute(&mut self, cx: &mut Execution<'_>) -> Option<TaskRef> {
        if self.hi - self.lo <= self.grain {
            let mut increments = 0;
            for _ in self.lo..self.hi {
                increments += 1;
            }
            self.total.fetch_add(increments, Ordering::Relaxed);
            return None;
        }
        self.splits.fetch_add(1, Ordering::Relaxed);
        let mid = self.lo + (self.hi - self.lo) / 2;
        let join = cx
            .allocate_continuation(ReduceJoin {
                joins: self.joins.clone(),
            })
            .unwrap();
        join.set_ref_count(2);
        let left = join
            .allocate_child(ReduceTask {
                lo: self.lo,
                hi: mid,
                grain: self.grain,
                total: self.total.clone(),
                splits: self.splits.clone(),
                joins: self.joins.clone(),
            })
            .unwrap();
        let right = join
            .allocate_child(ReduceTask {
                lo: mid,
                hi: self.hi,
                grain: self.grain,
                total: self.total.clone(),
                splits: self.splits.clone(),
                joins: self.joins.clone(),
            })
            .unwrap();
        cx.spawn(right);
        Some(left)
    }
}

#[test]
fn parallel_reduce_joins_match_splits() {
    let _serial = serial();
    let rt = Runtime::with_threads(4);

    const N: u64 = 4096;
    let total = Arc::new(AtomicU64::new(0));
    let splits = Arc::new(AtomicUsize::new(0));
    let joins = Arc::new(AtomicUsize::new(0));

    let root = weft::allocate_root(ReduceTask {
        lo: 0,
        hi: N,
        grain: 64,
        total: total.clone(),
        splits: splits.clone(),
        joins: joins.clone(),
    })
    .unwrap();
    weft::spawn_root_and_wait(root);

    assert_eq!(total.load(Ordering::Relaxed), N);
    assert_eq!(
        joins.load(Ordering::Relaxed),
        splits.load(Ordering::Relaxed),
        "every split must be joined exactly once"
    );

    rt.terminate();
    assert_eq!(weft::task_node_count(), 0, "leaked task allocations");
}

/// A batch of same-depth tasks spawned as one list.
struct Tick {
    hits: Arc<AtomicUsize>,
}

impl Job for Tick {
    fn execute(&mut self, _cx: &mut Execution<'_>) -> Option<TaskRef> {
        self.hits.fetch_add(1, Ordering::Relaxed);
        None
    }
}

#[test]
fn spawn_root_list_runs_every_task() {
    let _serial = serial();
    let rt = Runtime::with_threads(2);

    let hits = Arc::new(AtomicUsize::new(0));
    let mut list = weft::TaskList::new();
    for _ in 0..64 {
        list.push_back(weft::allocate_root(Tick { hits: hits.clone() }).unwrap());
    }
    weft::spawn_root_list_and_wait(list);
    assert_eq!(hits.load(Ordering::Relaxed), 64);

    // An empty list is vacuous success.
    weft::spawn_root_list_and_wait(weft::TaskList::new());

    rt.terminate();
    assert_eq!(weft::task_node_count(), 0, "leaked task allocations");
}
