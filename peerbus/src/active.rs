// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Active-reference lifecycle counter.
//!
//! An [`Active`] tracks an object through the lifecycle
//! `new -> active -> deactivated -> drained` with a single atomic word. Any
//! number of short-lived read-side references ([`acquire`]) may coexist;
//! teardown happens exactly once, after [`deactivate`] has cut off new
//! references and [`drain`] has waited for the outstanding ones to drop.
//!
//! The pattern resembles an asymmetric many-reader / one-writer lock:
//! [`acquire`] is a try-read-lock, dropping the returned guard is the
//! read-unlock, and [`deactivate`] + [`drain`] together form the exclusive
//! lock that is taken once and never released.
//!
//! [`acquire`]: Active::acquire
//! [`deactivate`]: Active::deactivate
//! [`drain`]: Active::drain

use core::fmt;

use maitake_sync::WaitQueue;
use static_assertions::const_assert;

use crate::loom::sync::atomic::{AtomicIsize, Ordering};
use crate::util::{CachePadded, loom_const_fn};

/// Sentinel: the object was never activated.
const NEW: isize = isize::MIN;
/// Sentinel: the object was deactivated without ever being active.
const RELEASE_DIRECT: isize = isize::MIN + 1;
/// Sentinel: a thread is running the release callback.
const RELEASE: isize = isize::MIN + 2;
/// Sentinel: the release callback has completed.
const DRAINED: isize = isize::MIN + 3;
/// Added to the counter on deactivation. Chosen so that any active count
/// `n >= 0` stays distinct from any deactivated encoding `BIAS + n` and from
/// the sentinels above, and so that negating it cannot overflow.
const BIAS: isize = isize::MIN / 2;

// The sentinels must sit strictly below the deactivated band, which in turn
// sits strictly below zero.
const_assert!(NEW < RELEASE_DIRECT);
const_assert!(RELEASE_DIRECT < RELEASE);
const_assert!(RELEASE < DRAINED);
const_assert!(DRAINED < BIAS);
const_assert!(BIAS < 0);

/// An atomic lifecycle counter with embedded drain-waiter support.
///
/// The counter encodes both the liveness gate and the number of outstanding
/// references in one word, so [`acquire`](Self::acquire) is a single atomic
/// RMW on the fast path and [`deactivate`](Self::deactivate) is wait-free.
///
/// State transitions only ever follow the arrows
///
/// ```text
/// new -+-> active(0..n) -> deactivated(n..0) -+
///      |                                      +-> release -> drained
///      +-> release-direct --------------------+
/// ```
pub struct Active {
    count: CachePadded<AtomicIsize>,
    waitq: WaitQueue,
}

/// A held active reference.
///
/// Dropping the guard releases the reference; if it was the last one standing
/// between a deactivated object and its drain waiter, the waiter is woken.
#[derive(Debug)]
#[must_use = "an active reference blocks drain until it is dropped"]
pub struct ActiveGuard<'a> {
    active: &'a Active,
}

// === impl Active ===

impl Active {
    loom_const_fn! {
        /// Creates a new counter in the `new` state.
        pub const fn new() -> Self {
            Self {
                count: CachePadded(AtomicIsize::new(NEW)),
                waitq: WaitQueue::new(),
            }
        }
    }

    /// Transitions `new -> active(0)`.
    ///
    /// Returns `true` exactly once per object; all later (or concurrent)
    /// calls return `false`.
    #[tracing::instrument(level = "trace")]
    pub fn activate(&self) -> bool {
        self.count
            .0
            .compare_exchange(NEW, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Attempts to acquire an active reference.
    ///
    /// Fails if the object is not in the active band, i.e. before
    /// [`activate`](Self::activate) and at any point after
    /// [`deactivate`](Self::deactivate). Callers must treat failure as
    /// "shutting down".
    pub fn acquire(&self) -> Option<ActiveGuard<'_>> {
        self.count
            .0
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |count| {
                (count >= 0).then(|| count + 1)
            })
            .ok()
            .map(|_| ActiveGuard { active: self })
    }

    /// Drops one active reference.
    ///
    /// Called from [`ActiveGuard`]'s `Drop` impl. If this was the last
    /// reference the drain waiter was waiting on, it is woken.
    fn release(&self) {
        let prev = self.count.0.fetch_sub(1, Ordering::Release);
        if prev - 1 == BIAS {
            self.waitq.wake();
        }
    }

    /// Cuts off new acquisitions.
    ///
    /// Transitions `new -> release-direct`, or `active(n) -> deactivated(n)`.
    /// Idempotent: returns `true` only for the call that performed the
    /// transition, `false` if the object was already deactivated.
    #[tracing::instrument(level = "trace")]
    pub fn deactivate(&self) -> bool {
        if self
            .count
            .0
            .compare_exchange(NEW, RELEASE_DIRECT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return true;
        }

        self.count
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count >= 0).then(|| count + BIAS)
            })
            .is_ok()
    }

    /// Waits for all outstanding references to drop, then performs the
    /// release step exactly once.
    ///
    /// Precondition: [`deactivate`](Self::deactivate) has returned (on some
    /// thread). Any number of threads may call `drain` concurrently; exactly
    /// one of them runs `release`, and every caller only returns once the
    /// release has completed. Returns whether *this* caller performed the
    /// release.
    ///
    /// Draining is not cancellable once entered: the returned future must be
    /// polled to completion. It may block arbitrarily long if reference
    /// holders do not release.
    #[tracing::instrument(level = "trace", skip(release))]
    pub async fn drain<F: FnOnce()>(&self, release: F) -> bool {
        debug_assert!(
            !self.is_new() && !self.is_active(),
            "drain requires a prior deactivate"
        );

        // Wait for the outstanding references to drop. `release()` wakes us
        // when the counter lands exactly on `BIAS`; the sentinel states are
        // all below `BIAS` and need no wait at all.
        self.waitq
            .wait_for(|| self.count.0.load(Ordering::Acquire) <= BIAS)
            .await
            .expect("active wait queue is never closed");

        let won = self
            .count
            .0
            .compare_exchange(RELEASE_DIRECT, RELEASE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            || self
                .count
                .0
                .compare_exchange(BIAS, RELEASE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();

        if won {
            tracing::trace!("running release callback");
            release();
            self.count.0.store(DRAINED, Ordering::Release);
            self.waitq.wake_all();
            true
        } else {
            // Someone else is (or was) running the release callback; wait
            // until it has published the drained state.
            self.waitq
                .wait_for(|| self.count.0.load(Ordering::Acquire) == DRAINED)
                .await
                .expect("active wait queue is never closed");
            false
        }
    }

    /// Asserts that the object has been fully drained.
    ///
    /// Call before tearing down the containing object.
    pub fn destroy(&self) {
        debug_assert_eq!(
            self.count.0.load(Ordering::Acquire),
            DRAINED,
            "destroyed while not drained"
        );
    }

    /// Returns `true` if the object was never activated.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.count.0.load(Ordering::Acquire) == NEW
    }

    /// Returns `true` if the object accepts new acquisitions.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.count.0.load(Ordering::Acquire) >= 0
    }

    /// Returns `true` if the object has been deactivated (references may
    /// still be outstanding).
    #[must_use]
    pub fn is_deactivated(&self) -> bool {
        let count = self.count.0.load(Ordering::Acquire);
        count < 0 && count != NEW
    }

    /// Returns `true` if the release step has completed.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.count.0.load(Ordering::Acquire) == DRAINED
    }

    fn state_name(&self) -> &'static str {
        match self.count.0.load(Ordering::Acquire) {
            NEW => "new",
            RELEASE_DIRECT => "release-direct",
            RELEASE => "release",
            DRAINED => "drained",
            count if count >= 0 => "active",
            _ => "deactivated",
        }
    }
}

impl Default for Active {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Active {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Active")
            .field("state", &self.state_name())
            .finish_non_exhaustive()
    }
}

// === impl ActiveGuard ===

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.release();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use alloc::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::executor::block_on;

    use super::*;
    use crate::loom::thread;

    #[test]
    fn activates_exactly_once() {
        let active = Active::new();
        assert!(active.is_new());
        assert!(active.activate());
        assert!(!active.activate());
        assert!(active.is_active());
    }

    #[test]
    fn acquire_requires_activation() {
        let active = Active::new();
        assert!(active.acquire().is_none());
        assert!(active.activate());
        let guard = active.acquire().expect("object is active");
        drop(guard);
    }

    #[test]
    fn acquire_fails_after_deactivate() {
        let active = Active::new();
        assert!(active.activate());
        assert!(active.deactivate());
        assert!(active.acquire().is_none());
        assert!(active.is_deactivated());
    }

    #[test]
    fn deactivate_is_idempotent() {
        let active = Active::new();
        assert!(active.activate());
        assert!(active.deactivate());
        assert!(!active.deactivate());
    }

    // Deactivating a never-activated object must still run the release
    // callback exactly once, via the release-direct path.
    #[test]
    fn deactivate_before_activate() {
        let active = Active::new();
        assert!(active.acquire().is_none());
        assert!(active.deactivate());
        assert!(!active.deactivate());

        let calls = AtomicUsize::new(0);
        let released = block_on(active.drain(|| {
            calls.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(released);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(active.acquire().is_none());
        assert!(active.is_drained());
        active.destroy();
    }

    // Drain must block while references are outstanding, complete once they
    // drop, and run the release callback on exactly one of the concurrent
    // drain callers.
    #[test]
    fn drain_waits_for_holders() {
        let active = Arc::new(Active::new());
        assert!(active.activate());

        let g1 = active.acquire().expect("object is active");
        let g2 = active.acquire().expect("object is active");
        assert!(active.deactivate());

        let calls = Arc::new(AtomicUsize::new(0));
        let winners = Arc::new(AtomicUsize::new(0));
        let drainers: Vec<_> = (0..2)
            .map(|_| {
                let active = Arc::clone(&active);
                let calls = Arc::clone(&calls);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    let released = block_on(active.drain(|| {
                        calls.fetch_add(1, Ordering::SeqCst);
                    }));
                    if released {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        // Both drainers are stuck behind the two outstanding references.
        thread::sleep(Duration::from_millis(50));
        assert!(!active.is_drained());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        drop(g1);
        drop(g2);
        for drainer in drainers {
            drainer.join().unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(active.is_drained());
        active.destroy();
    }

    #[test]
    fn drain_after_drained_is_not_the_releaser() {
        let active = Active::new();
        assert!(active.activate());
        assert!(active.deactivate());
        assert!(block_on(active.drain(|| {})));

        let calls = AtomicUsize::new(0);
        let released = block_on(active.drain(|| {
            calls.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!released);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
