// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The pipeline dispatcher: a chain of filters driven by recycled stage
//! tasks.
//!
//! Items flow through the filter chain as *tokens*. Parallel filters admit
//! any number of tokens at once; serial filters own an ordered buffer that
//! parks early tokens until their turn comes. Between consecutive parallel
//! filters a stage task recycles itself and rides the scheduler bypass, so
//! the hot path never touches the task pools. Tokens are re-injected at the
//! sink: finishing a token frees an input slot, and whichever stage task
//! brings `input_tokens` back above zero spawns the next input task.

use crate::scheduler::Execution;
use crate::task::{Header, Job, TaskRef};
use core::any::Any;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::collections::VecDeque;

/// The opaque payload handed from filter to filter.
pub type Item = Box<dyn Any + Send>;

/// One processing stage of a pipeline.
///
/// The input stage is invoked with `None` and produces items until it
/// returns `None`; every later stage receives `Some(item)` and returns the
/// transformed item (or `None` to drop it at the sink).
///
/// Serial stages are never invoked concurrently; parallel stages must
/// tolerate concurrent invocation (hence `Sync`).
pub trait Stage: Send + Sync {
    fn process(&self, item: Option<Item>) -> Option<Item>;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FilterMode {
    /// Any number of tokens in flight.
    Parallel,
    /// One token at a time, in input order.
    SerialInOrder,
    /// One token at a time, order free.
    SerialOutOfOrder,
}

struct Filter {
    mode: FilterMode,
    stage: Box<dyn Stage>,
    /// Present iff the filter is serial.
    buffer: Option<OrderedBuffer>,
}

impl Filter {
    fn is_serial(&self) -> bool {
        self.mode != FilterMode::Parallel
    }
}

/// Initial capacity of an in-order buffer's ring. Must be a power of two.
const INITIAL_BUFFER_SIZE: usize = 4;

/// Parking lot for stage tasks that arrived at a serial filter before their
/// turn.
struct OrderedBuffer {
    inner: spin::Mutex<BufferState>,
    /// In-order buffers dispatch strictly by token; out-of-order ones just
    /// enforce exclusivity.
    ordered: bool,
}

struct BufferState {
    /// Power-of-two ring indexed by `token & (len - 1)` (in-order only).
    ring: Vec<Option<NonNull<Header>>>,
    /// Next token allowed to run (in-order only).
    low_token: usize,
    /// FIFO of parked tasks (out-of-order only).
    parked: VecDeque<NonNull<Header>>,
    /// A token is currently inside the filter (out-of-order only).
    in_flight: bool,
}

// === impl OrderedBuffer ===

impl OrderedBuffer {
    fn new(ordered: bool) -> Self {
        Self {
            inner: spin::Mutex::new(BufferState {
                ring: vec![None; INITIAL_BUFFER_SIZE],
                low_token: 0,
                parked: VecDeque::new(),
                in_flight: false,
            }),
            ordered,
        }
    }

    /// Offers `putter` (carrying `token`) to the filter. Returns the task
    /// back when it may run right now; parks it and returns `None`
    /// otherwise.
    fn put_token(&self, token: usize, putter: TaskRef) -> Option<TaskRef> {
        let mut state = self.inner.lock();
        if self.ordered {
            if token == state.low_token {
                return Some(putter);
            }
            debug_assert!(token.wrapping_sub(state.low_token) as isize > 0);
            if token - state.low_token >= state.ring.len() {
                let new_len = token - state.low_token + 1;
                state.grow(new_len);
            }
            let mask = state.ring.len() - 1;
            let slot = token & mask;
            debug_assert!(state.ring[slot].is_none());
            state.ring[slot] = Some(putter.into_raw());
            None
        } else if state.in_flight {
            state.parked.push_back(putter.into_raw());
            None
        } else {
            state.in_flight = true;
            Some(putter)
        }
    }

    /// Notes that processing of `token` finished and spawns the next parked
    /// task, if one is ready.
    fn note_done(&self, token: usize, cx: &mut Execution<'_>) {
        let wakee = {
            let mut state = self.inner.lock();
            if self.ordered {
                if token == state.low_token {
                    // Wake the next task.
                    state.low_token += 1;
                    let mask = state.ring.len() - 1;
                    let slot = state.low_token & mask;
                    state.ring[slot].take()
                } else {
                    None
                }
            } else if let Some(next) = state.parked.pop_front() {
                Some(next)
            } else {
                state.in_flight = false;
                None
            }
        };
        if let Some(wakee) = wakee {
            cx.spawn(TaskRef::from_raw(wakee));
        }
    }
}

impl BufferState {
    /// Reallocates the ring to the next power of two >= `minimum_size`,
    /// re-placing parked tasks by reconstructing their tokens from
    /// `low_token`.
    fn grow(&mut self, minimum_size: usize) {
        let old_size = self.ring.len();
        let mut new_size = old_size * 2;
        while new_size < minimum_size {
            new_size *= 2;
        }
        let mut new_ring = vec![None; new_size];
        let mut t = self.low_token;
        for _ in 0..old_size {
            new_ring[t & (new_size - 1)] = self.ring[t & (old_size - 1)].take();
            t += 1;
        }
        self.ring = new_ring;
    }
}

/// A linear chain of filters plus the token accounting shared by its stage
/// tasks.
pub struct Pipeline {
    filters: Vec<Filter>,
    /// Source of tokens, claimed at the input (or lazily at the first serial
    /// filter after a parallel input).
    token_counter: AtomicUsize,
    /// Free input slots; goes negative transiently while stage tasks race
    /// at the sink.
    input_tokens: AtomicIsize,
    end_of_input: AtomicBool,
    running: AtomicBool,
}

// === impl Pipeline ===

impl Pipeline {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            token_counter: AtomicUsize::new(0),
            input_tokens: AtomicIsize::new(0),
            end_of_input: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    /// Appends a filter to the chain. Must not be called while the pipeline
    /// is running.
    pub fn add_filter(&mut self, mode: FilterMode, stage: impl Stage + 'static) {
        debug_assert!(
            !self.running.load(Ordering::Relaxed),
            "invocation of add_filter on running pipeline"
        );
        let buffer = match mode {
            FilterMode::Parallel => None,
            FilterMode::SerialInOrder => Some(OrderedBuffer::new(true)),
            FilterMode::SerialOutOfOrder => Some(OrderedBuffer::new(false)),
        };
        self.filters.push(Filter {
            mode,
            stage: Box::new(stage),
            buffer,
        });
    }

    /// Removes the filter at `index` from the chain. Must not be called
    /// while the pipeline is running.
    pub fn remove_filter(&mut self, index: usize) {
        debug_assert!(
            !self.running.load(Ordering::Relaxed),
            "invocation of remove_filter on running pipeline"
        );
        self.filters.remove(index);
    }

    /// Removes every filter from the pipeline.
    pub fn clear(&mut self) {
        debug_assert!(
            !self.running.load(Ordering::Relaxed),
            "invocation of clear on running pipeline"
        );
        self.filters.clear();
    }

    /// Number of filters currently in the chain.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs the pipeline to completion with at most `max_tokens` items in
    /// flight.
    ///
    /// # Panics
    ///
    /// Panics when `max_tokens` is zero, when the calling thread has no live
    /// [`Runtime`][crate::Runtime] registration, or when allocating the
    /// run's bookkeeping tasks fails.
    pub fn run(&mut self, max_tokens: usize) {
        assert!(max_tokens > 0, "pipeline must run with at least one token");
        if self.filters.is_empty() {
            return;
        }
        if self.filters.len() == 1 && !self.filters[0].is_serial() {
            // A single parallel filter admits no pipelining; just drain the
            // input stream.
            while self.filters[0].stage.process(None).is_some() {}
            return;
        }

        self.end_of_input.store(false, Ordering::Relaxed);
        self.input_tokens
            .store(max_tokens as isize, Ordering::Relaxed);
        self.running.store(true, Ordering::Relaxed);

        // The end counter collapses once every in-flight token has passed
        // the sink: one reference per live stage chain plus one for the
        // wait below.
        let end_counter =
            crate::allocate_root(EndCounter).expect("no memory for the pipeline end counter");
        end_counter.set_ref_count(2);
        let this = NonNull::from(&*self);
        let first = end_counter
            .allocate_child(StageJob::input(this, end_counter.header_ptr()))
            .expect("no memory for the first pipeline stage task");

        // Prime the pump with the non-waiter.
        let s = crate::runtime::expect_current_scheduler();
        // Safety: we are on the registered master thread, the end counter is
        // alive for the whole wait, and the first stage task is owned here.
        unsafe {
            s.as_ref()
                .wait_for_all(end_counter.header_ptr(), Some(first.into_raw()));
        }
        end_counter.destroy();

        self.running.store(false, Ordering::Relaxed);
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("filters", &self.filters.len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// The ref-count anchor for one `run`; never executed.
struct EndCounter;

impl Job for EndCounter {
    fn execute(&mut self, _cx: &mut Execution<'_>) -> Option<TaskRef> {
        None
    }
}

/// A stage task: carries one item through the filter chain.
struct StageJob {
    pipeline: NonNull<Pipeline>,
    end_counter: NonNull<Header>,
    /// Index of the filter to apply next.
    filter_index: usize,
    object: Option<Item>,
    /// Invalid until this task passed a token-claiming point.
    token: usize,
    token_ready: bool,
    /// True while this task has not yet read the input.
    at_start: bool,
}

// Safety: the pipeline and end counter outlive the run; items are Send.
unsafe impl Send for StageJob {}

// === impl StageJob ===

impl StageJob {
    fn input(pipeline: NonNull<Pipeline>, end_counter: NonNull<Header>) -> Self {
        Self {
            pipeline,
            end_counter,
            filter_index: 0,
            object: None,
            token: 0,
            token_ready: false,
            at_start: true,
        }
    }

    fn spawn_fresh_input(&self, cx: &mut Execution<'_>) {
        let job = StageJob::input(self.pipeline, self.end_counter);
        // An allocation failure here unwinds into the dispatch loop, which
        // cancels the pipeline's group and rethrows at run()'s wait.
        let task = cx
            .allocate_additional_child_of_raw(self.end_counter, job)
            .expect("no memory for an input stage task");
        cx.spawn(task);
    }

    fn claim_token(&mut self, pipeline: &Pipeline) {
        if !self.token_ready {
            self.token = pipeline.token_counter.fetch_add(1, Ordering::Relaxed);
            self.token_ready = true;
        }
    }
}

impl Job for StageJob {
    fn execute(&mut self, cx: &mut Execution<'_>) -> Option<TaskRef> {
        // Safety: the pipeline is borrowed for the whole run and stage tasks
        // never outlive it.
        let pipeline = unsafe { self.pipeline.as_ref() };

        if self.at_start {
            debug_assert!(self.object.is_none());
            let filter = &pipeline.filters[0];
            if filter.is_serial() {
                match filter.stage.process(None) {
                    Some(object) => {
                        self.object = Some(object);
                        self.claim_token(pipeline);
                        if pipeline.input_tokens.fetch_sub(1, Ordering::AcqRel) - 1 > 0 {
                            self.spawn_fresh_input(cx);
                        }
                    }
                    None => {
                        pipeline.end_of_input.store(true, Ordering::Release);
                        return None;
                    }
                }
            } else {
                if pipeline.end_of_input.load(Ordering::Acquire) {
                    return None;
                }
                if pipeline.input_tokens.fetch_sub(1, Ordering::AcqRel) - 1 > 0 {
                    self.spawn_fresh_input(cx);
                }
                match filter.stage.process(None) {
                    Some(object) => self.object = Some(object),
                    None => {
                        pipeline.end_of_input.store(true, Ordering::Release);
                        return None;
                    }
                }
            }
            self.at_start = false;
        } else {
            let filter = &pipeline.filters[self.filter_index];
            self.object = filter.stage.process(self.object.take());
            if let Some(buffer) = &filter.buffer {
                buffer.note_done(self.token, cx);
            }
        }

        self.filter_index += 1;
        if self.filter_index < pipeline.filters.len() {
            // There is another filter to execute. Crank up priority a notch.
            cx.add_to_depth(1);
            let filter = &pipeline.filters[self.filter_index];
            if let Some(buffer) = &filter.buffer {
                // The next filter is serial: hand a continuation clone to
                // its buffer, which decides whether it runs now or parks.
                self.claim_token(pipeline);
                let clone = cx
                    .allocate_continuation(StageJob {
                        pipeline: self.pipeline,
                        end_counter: self.end_counter,
                        filter_index: self.filter_index,
                        object: self.object.take(),
                        token: self.token,
                        token_ready: self.token_ready,
                        at_start: false,
                    })
                    // On failure the running task keeps its parent link, so
                    // the unwind through the dispatch loop still balances
                    // the end counter.
                    .expect("no memory for a pipeline stage task");
                return buffer.put_token(self.token, clone);
            }
            // Reexecute this same task object immediately without spawning:
            // recycle marks it for future execution and returning it rides
            // the scheduler bypass.
            cx.recycle_as_continuation();
            return Some(cx.bypass_self());
        }

        // Reached the end of the pipe: inject a new token. This must happen
        // before execute() returns so the end counter's ref count cannot
        // reach zero prematurely.
        // Safety: the end counter outlives the run.
        let end_depth = unsafe { self.end_counter.as_ref().depth() };
        cx.set_depth(end_depth + 1);
        if pipeline.input_tokens.fetch_add(1, Ordering::AcqRel) + 1 == 1
            && !pipeline.end_of_input.load(Ordering::Acquire)
        {
            self.spawn_fresh_input(cx);
        }
        None
    }
}
