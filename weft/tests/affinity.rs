// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Affinity routing through mailboxes: every tagged task runs exactly once,
//! and either lands on the thread it asked for or is told (via
//! `note_affinity`) where it actually ran.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use weft::{AffinityId, Execution, Job, Runtime, TaskRef};

static SERIAL: Mutex<()> = Mutex::new(());

struct Probes {
    runs: Vec<AtomicUsize>,
    ran_on: Vec<AtomicU32>,
    noted: Vec<AtomicU32>,
}

impl Probes {
    fn new(n: usize) -> Arc<Self> {
        Arc::new(Self {
            runs: (0..n).map(|_| AtomicUsize::new(0)).collect(),
            ran_on: (0..n).map(|_| AtomicU32::new(0)).collect(),
            noted: (0..n).map(|_| AtomicU32::new(0)).collect(),
        })
    }
}

struct Probe {
    index: usize,
    probes: Arc<Probes>,
}

impl Job for Probe {
    fn execute(&mut self, cx: &mut Execution<'_>) -> Option<TaskRef> {
        self.probes.runs[self.index].fetch_add(1, Ordering::SeqCst);
        self.probes.ran_on[self.index].store(cx.current_thread_affinity(), Ordering::SeqCst);
        None
    }

    fn note_affinity(&mut self, id: AffinityId) {
        self.probes.noted[self.index].store(id, Ordering::SeqCst);
    }
}

struct FanOutTagged {
    n: usize,
    slots: u32,
    probes: Arc<Probes>,
}

impl Job for FanOutTagged {
    fn execute(&mut self, cx: &mut Execution<'_>) -> Option<TaskRef> {
        cx.set_ref_count(self.n + 1);
        for index in 0..self.n {
            let child = cx
                .allocate_child(Probe {
                    index,
                    probes: self.probes.clone(),
                })
                .unwrap();
            // Spread tasks across every mailbox in the arena, occupied or
            // not.
            child.set_affinity((index as u32 % self.slots) + 1);
            cx.spawn(child);
        }
        cx.wait_for_all();
        None
    }
}

#[test]
fn tagged_tasks_run_once_and_report_where() {
    let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
    let threads = 4;
    let rt = Runtime::with_threads(threads);

    const N: usize = 512;
    let slots = (2 * threads) as u32;
    let probes = Probes::new(N);

    let root = weft::allocate_root(FanOutTagged {
        n: N,
        slots,
        probes: probes.clone(),
    })
    .unwrap();
    weft::spawn_root_and_wait(root);

    for index in 0..N {
        let runs = probes.runs[index].load(Ordering::SeqCst);
        assert_eq!(runs, 1, "task {index} ran {runs} times");

        let assigned = (index as u32 % slots) + 1;
        let ran_on = probes.ran_on[index].load(Ordering::SeqCst);
        let noted = probes.noted[index].load(Ordering::SeqCst);
        // Either the mailbox delivered the task to the thread it asked for,
        // or whoever ran it announced itself through note_affinity first.
        assert!(
            ran_on == assigned || noted == ran_on,
            "task {index}: assigned {assigned}, ran on {ran_on}, noted {noted}"
        );
    }

    rt.terminate();
    assert_eq!(weft::task_node_count(), 0, "leaked task allocations");
}

/// A task that asks to run where a previous task ran, affinity-partitioner
/// style.
#[test]
fn recorded_affinities_can_be_replayed() {
    let _serial = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
    let rt = Runtime::with_threads(4);

    const N: usize = 64;
    let first = Probes::new(N);
    let root = weft::allocate_root(FanOutTagged {
        n: N,
        slots: 8,
        probes: first.clone(),
    })
    .unwrap();
    weft::spawn_root_and_wait(root);

    // Replay: tag each task with wherever its predecessor actually ran.
    struct Replay {
        n: usize,
        targets: Vec<AffinityId>,
        probes: Arc<Probes>,
    }
    impl Job for Replay {
        fn execute(&mut self, cx: &mut Execution<'_>) -> Option<TaskRef> {
            cx.set_ref_count(self.n + 1);
            for index in 0..self.n {
                let child = cx
                    .allocate_child(Probe {
                        index,
                        probes: self.probes.clone(),
                    })
                    .unwrap();
                if self.targets[index] != 0 {
                    child.set_affinity(self.targets[index]);
                }
                cx.spawn(child);
            }
            cx.wait_for_all();
            None
        }
    }

    let targets: Vec<AffinityId> = (0..N)
        .map(|i| first.ran_on[i].load(Ordering::SeqCst))
        .collect();
    let second = Probes::new(N);
    let root = weft::allocate_root(Replay {
        n: N,
        targets,
        probes: second.clone(),
    })
    .unwrap();
    weft::spawn_root_and_wait(root);

    for index in 0..N {
        assert_eq!(second.runs[index].load(Ordering::SeqCst), 1);
    }

    rt.terminate();
    assert_eq!(weft::task_node_count(), 0, "leaked task allocations");
}
