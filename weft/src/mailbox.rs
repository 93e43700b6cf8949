// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-slot inboxes for affinity-routed task proxies.
//!
//! Each arena slot owns one [`Mailbox`]. Any thread may push a proxy
//! (many-producer), only the slot's occupant pops (single-consumer). The
//! tail pointer doubles as the producer lock: its low bit is a spin lock
//! held just long enough to link one node.

use crate::loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use crate::task::ProxyTask;
use core::fmt;
use core::ptr::{self, NonNull};
use spin::Backoff;

const TAIL_LOCK_BIT: usize = 1;

pub(crate) struct Mailbox {
    /// First proxy in the list, or null when empty. Owner-read.
    my_first: AtomicPtr<ProxyTask>,
    /// Last proxy in the list with [`TAIL_LOCK_BIT`] mangled in.
    my_last: AtomicUsize,
    /// Advises thieves that the recipient is actively looking for work, so
    /// mailed proxies should be left for it.
    my_is_idle: AtomicBool,
}

// === impl Mailbox ===

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self {
            my_first: AtomicPtr::new(ptr::null_mut()),
            my_last: AtomicUsize::new(0),
            my_is_idle: AtomicBool::new(false),
        }
    }

    /// Spins until the tail lock is held, returning the previous tail.
    fn acquire_tail(&self) -> Option<NonNull<ProxyTask>> {
        let mut boff = Backoff::new();
        loop {
            let last = self.my_last.load(Ordering::Acquire);
            if last & TAIL_LOCK_BIT == 0
                && self
                    .my_last
                    .compare_exchange(
                        last,
                        last | TAIL_LOCK_BIT,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return NonNull::new(last as *mut ProxyTask);
            }
            boff.spin();
        }
    }

    /// Appends `proxy` to the mailbox. Callable from any thread.
    pub(crate) fn push(&self, proxy: NonNull<ProxyTask>) {
        // Safety: the proxy is not yet visible to any consumer.
        unsafe {
            proxy
                .as_ref()
                .next_in_mailbox
                .store(ptr::null_mut(), Ordering::Relaxed);
        }
        match self.acquire_tail() {
            Some(last) => {
                // Safety: the tail lock keeps `last` linked until we are done.
                unsafe {
                    last.as_ref()
                        .next_in_mailbox
                        .store(proxy.as_ptr(), Ordering::Release);
                }
            }
            None => self.my_first.store(proxy.as_ptr(), Ordering::Release),
        }
        // The release publishes the proxy's fields to the consumer, and the
        // store's cleared low bit drops the tail lock.
        self.my_last
            .store(proxy.as_ptr() as usize, Ordering::Release);
    }

    /// Takes the oldest proxy. Only the slot's occupant may call this.
    pub(crate) fn pop(&self) -> Option<NonNull<ProxyTask>> {
        let first = NonNull::new(self.my_first.load(Ordering::Acquire))?;
        // Safety: only the owner pops, so `first` stays linked until we
        // advance past it.
        let next = unsafe { first.as_ref().next_in_mailbox.load(Ordering::Acquire) };
        if !next.is_null() {
            // Not the last node; no lock needed to swing the head forward.
            self.my_first.store(next, Ordering::Relaxed);
            return Some(first);
        }
        // `first` looks like the last node: close the list under the tail
        // lock so a concurrent push cannot get lost.
        let prev_tail = self.acquire_tail();
        // Safety: as above.
        let next = unsafe { first.as_ref().next_in_mailbox.load(Ordering::Acquire) };
        if next.is_null() {
            debug_assert_eq!(prev_tail, Some(first));
            self.my_first.store(ptr::null_mut(), Ordering::Relaxed);
            // Unlocks and empties in one store.
            self.my_last.store(0, Ordering::Release);
        } else {
            // A push slipped in while we took the lock.
            self.my_first.store(next, Ordering::Relaxed);
            self.my_last.store(
                prev_tail.map_or(0, |p| p.as_ptr() as usize),
                Ordering::Release,
            );
        }
        Some(first)
    }

    /// Empties the mailbox, handing each orphaned proxy to `free`.
    ///
    /// May only be called after every producer for this mailbox has
    /// quiesced (arena shutdown).
    pub(crate) fn drain(&self, mut free: impl FnMut(NonNull<ProxyTask>)) -> usize {
        let mut drained = 0;
        while let Some(proxy) = self.pop() {
            free(proxy);
            drained += 1;
        }
        debug_assert_eq!(self.my_last.load(Ordering::Relaxed), 0);
        drained
    }

    #[inline]
    pub(crate) fn set_is_idle(&self, idle: bool) {
        self.my_is_idle.store(idle, Ordering::Relaxed);
    }

    /// Whether the recipient is actively polling its inbox; thieves use this
    /// to leave mailed proxies alone.
    #[inline]
    pub(crate) fn recipient_is_idle(&self) -> bool {
        self.my_is_idle.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("empty", &self.my_first.load(Ordering::Relaxed).is_null())
            .field("recipient_idle", &self.recipient_is_idle())
            .finish()
    }
}

/// The consumer half: a scheduler's handle onto the mailbox of the arena
/// slot it currently occupies.
pub(crate) struct MailInbox {
    putter: core::cell::Cell<Option<NonNull<Mailbox>>>,
}

// === impl MailInbox ===

impl MailInbox {
    pub(crate) fn new() -> Self {
        Self {
            putter: core::cell::Cell::new(None),
        }
    }

    pub(crate) fn attach(&self, outbox: NonNull<Mailbox>) {
        debug_assert!(self.putter.get().is_none(), "inbox already attached");
        self.putter.set(Some(outbox));
    }

    pub(crate) fn detach(&self) {
        debug_assert!(self.putter.get().is_some(), "inbox not attached");
        self.putter.set(None);
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.putter.get().is_some()
    }

    pub(crate) fn pop(&self) -> Option<NonNull<ProxyTask>> {
        let outbox = self.putter.get()?;
        // Safety: the mailbox lives in the arena, which outlives every
        // attached scheduler.
        unsafe { outbox.as_ref().pop() }
    }

    pub(crate) fn set_is_idle(&self, idle: bool) {
        if let Some(outbox) = self.putter.get() {
            // Safety: as above.
            unsafe { outbox.as_ref().set_is_idle(idle) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Header, ProxyTask};
    use core::ptr::NonNull;

    fn proxy() -> NonNull<ProxyTask> {
        let boxed = Box::new(ProxyTask {
            header: Header::new(
                &ProxyTask::VTABLE,
                None,
                0,
                core::ptr::null(),
                core::ptr::null(),
                core::ptr::null(),
                true,
                false,
            ),
            task_and_tag: AtomicUsize::new(0),
            next_in_mailbox: AtomicPtr::new(core::ptr::null_mut()),
            outbox: AtomicPtr::new(core::ptr::null_mut()),
        });
        // Safety: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
    }

    fn free(p: NonNull<ProxyTask>) {
        // Safety: allocated by `proxy` above.
        unsafe { drop(Box::from_raw(p.as_ptr())) }
    }

    #[test]
    fn push_pop_fifo() {
        let mailbox = Mailbox::new();
        let a = proxy();
        let b = proxy();
        let c = proxy();
        mailbox.push(a);
        mailbox.push(b);
        mailbox.push(c);

        assert_eq!(mailbox.pop(), Some(a));
        assert_eq!(mailbox.pop(), Some(b));
        assert_eq!(mailbox.pop(), Some(c));
        assert_eq!(mailbox.pop(), None);

        for p in [a, b, c] {
            free(p);
        }
    }

    #[test]
    fn pop_interleaved_with_push() {
        let mailbox = Mailbox::new();
        let a = proxy();
        mailbox.push(a);
        assert_eq!(mailbox.pop(), Some(a));
        assert_eq!(mailbox.pop(), None);

        let b = proxy();
        mailbox.push(b);
        assert_eq!(mailbox.pop(), Some(b));
        free(a);
        free(b);
    }

    #[test]
    fn drain_counts() {
        let mailbox = Mailbox::new();
        for _ in 0..5 {
            mailbox.push(proxy());
        }
        let drained = mailbox.drain(free);
        assert_eq!(drained, 5);
    }

    #[test]
    fn concurrent_producers() {
        use crate::loom;
        use std::sync::Arc;

        loom::model(|| {
            let mailbox = Arc::new(Mailbox::new());
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let mailbox = mailbox.clone();
                    loom::thread::spawn(move || {
                        for _ in 0..100 {
                            // Safety-wise each proxy is owned by the mailbox
                            // after push.
                            mailbox.push(proxy());
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            let mut seen = 0;
            while let Some(p) = mailbox.pop() {
                free(p);
                seen += 1;
            }
            assert_eq!(seen, 400);
        });
    }
}
