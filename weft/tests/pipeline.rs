// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Pipeline dispatcher behavior: ordering through serial stages, token
//! throttling, and the sequential fallbacks.

use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use weft::Runtime;
use weft::pipeline::{FilterMode, Item, Pipeline, Stage};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> std::sync::MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serial input stage: yields `0..limit` as boxed numbers.
struct Numbers {
    next: Mutex<u64>,
    limit: u64,
}

impl Stage for Numbers {
    fn process(&self, item: Option<Item>) -> Option<Item> {
        assert!(item.is_none(), "input stage received an item");
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        if *next >= self.limit {
            return None;
        }
        let n = *next;
        *next += 1;
        Some(Box::new(n))
    }
}

/// Parallel middle stage: doubles the number and tracks concurrency.
struct Double {
    started: Arc<AtomicUsize>,
    in_flight: Arc<AtomicIsize>,
    max_in_flight: Arc<AtomicIsize>,
}

impl Stage for Double {
    fn process(&self, item: Option<Item>) -> Option<Item> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let n = *item
            .expect("middle stage needs an item")
            .downcast::<u64>()
            .expect("wrong item type");

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Some(Box::new(n * 2))
    }
}

/// Serial in-order sink: collects everything it sees.
struct Collect {
    seen: Arc<Mutex<Vec<u64>>>,
}

impl Stage for Collect {
    fn process(&self, item: Option<Item>) -> Option<Item> {
        let n = *item
            .expect("sink needs an item")
            .downcast::<u64>()
            .expect("wrong item type");
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(n);
        None
    }
}

#[test]
fn serial_parallel_serial_preserves_input_order() {
    let _serial = serial();
    let rt = Runtime::with_threads(4);

    const INPUTS: u64 = 1000;
    const TOKENS: usize = 4;

    let started = Arc::new(AtomicUsize::new(0));
    let in_flight = Arc::new(AtomicIsize::new(0));
    let max_in_flight = Arc::new(AtomicIsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut pipeline = Pipeline::new();
    pipeline.add_filter(
        FilterMode::SerialInOrder,
        Numbers {
            next: Mutex::new(0),
            limit: INPUTS,
        },
    );
    pipeline.add_filter(
        FilterMode::Parallel,
        Double {
            started: started.clone(),
            in_flight: in_flight.clone(),
            max_in_flight: max_in_flight.clone(),
        },
    );
    pipeline.add_filter(FilterMode::SerialInOrder, Collect { seen: seen.clone() });
    pipeline.run(TOKENS);

    let seen = seen.lock().unwrap_or_else(PoisonError::into_inner);
    assert_eq!(started.load(Ordering::SeqCst), INPUTS as usize);
    assert_eq!(
        *seen,
        (0..INPUTS).map(|n| n * 2).collect::<Vec<_>>(),
        "sink must observe items in input order regardless of token concurrency"
    );
    // Token throttling: never more parallel-stage invocations in flight
    // than tokens.
    assert!(max_in_flight.load(Ordering::SeqCst) <= TOKENS as isize);

    drop(seen);
    rt.terminate();
    assert_eq!(weft::task_node_count(), 0, "leaked task allocations");
}

#[test]
fn out_of_order_serial_is_exclusive_but_unordered() {
    let _serial = serial();
    let rt = Runtime::with_threads(4);

    const INPUTS: u64 = 300;
    let in_sink = Arc::new(AtomicIsize::new(0));
    let max_in_sink = Arc::new(AtomicIsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));

    struct ExclusiveSink {
        in_sink: Arc<AtomicIsize>,
        max_in_sink: Arc<AtomicIsize>,
        seen: Arc<Mutex<Vec<u64>>>,
    }

    impl Stage for ExclusiveSink {
        fn process(&self, item: Option<Item>) -> Option<Item> {
            let now = self.in_sink.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_sink.fetch_max(now, Ordering::SeqCst);
            let n = *item.unwrap().downcast::<u64>().unwrap();
            self.seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(n);
            self.in_sink.fetch_sub(1, Ordering::SeqCst);
            None
        }
    }

    struct Identity;

    impl Stage for Identity {
        fn process(&self, item: Option<Item>) -> Option<Item> {
            item
        }
    }

    let mut pipeline = Pipeline::new();
    pipeline.add_filter(
        FilterMode::SerialInOrder,
        Numbers {
            next: Mutex::new(0),
            limit: INPUTS,
        },
    );
    pipeline.add_filter(FilterMode::Parallel, Identity);
    pipeline.add_filter(
        FilterMode::SerialOutOfOrder,
        ExclusiveSink {
            in_sink: in_sink.clone(),
            max_in_sink: max_in_sink.clone(),
            seen: seen.clone(),
        },
    );
    pipeline.run(8);

    let mut seen = seen
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    assert_eq!(max_in_sink.load(Ordering::SeqCst), 1, "sink must be serial");
    assert_eq!(seen.len(), INPUTS as usize);
    seen.sort_unstable();
    assert_eq!(seen, (0..INPUTS).collect::<Vec<_>>());

    rt.terminate();
    assert_eq!(weft::task_node_count(), 0, "leaked task allocations");
}

#[test]
fn single_parallel_filter_drains_sequentially() {
    let _serial = serial();
    let rt = Runtime::with_threads(2);

    struct CountDown {
        remaining: AtomicUsize,
        drained: Arc<AtomicUsize>,
    }

    impl Stage for CountDown {
        fn process(&self, item: Option<Item>) -> Option<Item> {
            assert!(item.is_none());
            if self.remaining.load(Ordering::SeqCst) == 0 {
                return None;
            }
            self.remaining.fetch_sub(1, Ordering::SeqCst);
            self.drained.fetch_add(1, Ordering::SeqCst);
            Some(Box::new(()) as Item)
        }
    }

    let drained = Arc::new(AtomicUsize::new(0));
    let mut pipeline = Pipeline::new();
    pipeline.add_filter(
        FilterMode::Parallel,
        CountDown {
            remaining: AtomicUsize::new(10),
            drained: drained.clone(),
        },
    );
    pipeline.run(4);
    assert_eq!(drained.load(Ordering::SeqCst), 10);

    // An empty pipeline is a no-op.
    let mut empty = Pipeline::new();
    empty.run(4);

    rt.terminate();
}

#[test]
fn pipeline_reuses_after_clear() {
    let _serial = serial();
    let rt = Runtime::with_threads(2);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = Pipeline::new();
    pipeline.add_filter(
        FilterMode::SerialInOrder,
        Numbers {
            next: Mutex::new(0),
            limit: 10,
        },
    );
    pipeline.add_filter(FilterMode::SerialInOrder, Collect { seen: seen.clone() });
    pipeline.run(2);
    assert_eq!(seen.lock().unwrap_or_else(PoisonError::into_inner).len(), 10);

    pipeline.clear();
    assert!(pipeline.is_empty());
    // Running an emptied pipeline does nothing.
    pipeline.run(2);

    rt.terminate();
    assert_eq!(weft::task_node_count(), 0, "leaked task allocations");
}
