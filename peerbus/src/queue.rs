// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-peer ordered message queue with a local Lamport clock.
//!
//! Entries are ordered by `(timestamp, sender)`. Staging entries carry odd
//! timestamps, committed entries even ones; the clock ticks in steps of two
//! so a single tick yields a commit stamp and its staging twin. A staging
//! entry placed at timestamp `t` orders below any possible commit at `t + 1`
//! or later, so it blocks the front of the queue from advancing until it is
//! either committed (at an even timestamp at least `t + 1`) or removed. This
//! is what keeps a multi-queue transaction invisible until it is fully
//! committed, without any global lock.
//!
//! The front-of-queue pointer is cached in an [`ArcSwapOption`] so readers
//! can poll [`Queue::is_readable`] without taking the queue lock; arc-swap's
//! deferred reclamation keeps the pointer safe against concurrent removal.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::{cmp, fmt, mem};

use arc_swap::ArcSwapOption;
use cordyceps::List;
use maitake_sync::WaitQueue;
use spin::Mutex;

use crate::error::Error;
use crate::node::{EntryKey, MAX_TIMESTAMP, QueueNode};

/// A per-peer ordered message queue.
///
/// All mutating operations take the internal lock; only
/// [`is_readable`](Self::is_readable) is lock-free. Writers never hold more
/// than one queue lock at a time (a transaction visits its destinations one
/// by one), so queue locks never nest.
pub struct Queue {
    inner: Mutex<QueueInner>,
    /// The cached leftmost index entry iff it is ready to be dequeued.
    /// Written by lock holders, read lock-free.
    front: ArcSwapOption<QueueNode>,
}

struct QueueInner {
    /// Local Lamport clock; monotonically non-decreasing.
    clock: u64,
    index: BTreeMap<EntryKey, Arc<QueueNode>>,
}

/// A readable front entry returned by [`Queue::peek`] and [`Queue::pop`].
#[derive(Debug)]
pub struct Peek {
    pub node: Arc<QueueNode>,
    /// Whether more entries (committed or staged) remain linked beyond the
    /// returned one, for batched drain loops.
    pub more: bool,
}

// === impl Queue ===

impl Queue {
    /// Creates an empty queue with clock 0.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                clock: 0,
                index: BTreeMap::new(),
            }),
            front: ArcSwapOption::empty(),
        }
    }

    /// The current clock value.
    pub fn clock(&self) -> u64 {
        self.inner.lock().clock
    }

    /// Advances the clock by a full tick and returns the new (even) value.
    pub fn tick(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.clock = (inner.clock + 2) & !1;
        inner.clock
    }

    /// Fast-forwards the clock to at least `timestamp` and returns the new
    /// clock value.
    pub fn sync(&self, timestamp: u64) -> u64 {
        let mut inner = self.inner.lock();
        inner.clock = cmp::max(inner.clock, timestamp);
        inner.clock
    }

    /// Lock-free readability check: `true` iff the front entry is ready to
    /// be dequeued.
    pub fn is_readable(&self) -> bool {
        self.front.load().is_some()
    }

    /// The number of linked entries, committed and staged.
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stages `node` on this queue.
    ///
    /// The staged timestamp is the smallest odd value that is at least both
    /// the local clock and `timestamp`; the clock is fast-forwarded to it.
    /// The node must be unlinked and becomes linked into the index.
    ///
    /// Returns the staged timestamp, for the caller to fold into its commit
    /// timestamp selection.
    pub fn stage(&self, node: &Arc<QueueNode>, timestamp: u64) -> u64 {
        let mut inner = self.inner.lock();

        debug_assert!(!node.is_queued(), "staged node is already linked");
        debug_assert!(timestamp < MAX_TIMESTAMP);

        let staged = cmp::max(inner.clock, timestamp) | 1;
        inner.clock = staged;
        node.set_timestamp(staged);
        node.mark_queued();
        let prev = inner.index.insert(node.key(), Arc::clone(node));
        debug_assert!(prev.is_none());

        // A staging entry can only ever hide the front, never reveal it.
        self.refresh_front(&inner);

        tracing::trace!(sender = node.sender(), staged, "staged");
        staged
    }

    /// Commits a node previously staged on this queue.
    ///
    /// `timestamp` must be even and no less than the node's staged
    /// timestamp; the node is re-linked at it and the clock is fast-forwarded
    /// (a racing stage may already have pushed the clock past `timestamp`).
    /// If the queue became readable, one waiter on `waitq` is woken.
    ///
    /// Returns whether the queue became readable.
    ///
    /// # Errors
    ///
    /// [`Error::Invalid`] if `timestamp` is odd or smaller than the staged
    /// timestamp; [`Error::Fatal`] if the node is not staged on this queue.
    pub fn commit_staged(
        &self,
        waitq: &WaitQueue,
        node: &Arc<QueueNode>,
        timestamp: u64,
    ) -> Result<bool, Error> {
        let mut inner = self.inner.lock();

        if !node.is_queued() || !node.is_staging() {
            tracing::error!(
                sender = node.sender(),
                node.timestamp = node.timestamp(),
                "commit of a node that is not staged"
            );
            return Err(Error::Fatal);
        }
        if timestamp & 1 != 0 || timestamp < node.timestamp() {
            return Err(Error::Invalid);
        }

        let Some(entry) = inner.index.remove(&node.key()) else {
            tracing::error!(
                sender = node.sender(),
                node.timestamp = node.timestamp(),
                "staged node is not linked into this queue"
            );
            return Err(Error::Fatal);
        };
        debug_assert!(Arc::ptr_eq(&entry, node));

        node.set_timestamp(timestamp);
        inner.index.insert(node.key(), entry);
        inner.clock = cmp::max(inner.clock, timestamp);

        let woke = self.refresh_front(&inner);
        drop(inner);

        tracing::trace!(sender = node.sender(), timestamp, woke, "committed");
        if woke {
            waitq.wake();
        }
        Ok(woke)
    }

    /// Commits `node` directly, without a staging step.
    ///
    /// Shortcut for queue-local, single-destination notifications: allocates
    /// a fresh even timestamp from the local clock and links the node at it.
    /// Same wake policy as [`commit_staged`](Self::commit_staged). Returns
    /// the commit timestamp.
    pub fn commit_unstaged(&self, waitq: &WaitQueue, node: &Arc<QueueNode>) -> u64 {
        let mut inner = self.inner.lock();

        debug_assert!(!node.is_queued(), "committed node is already linked");

        inner.clock = (inner.clock + 2) & !1;
        let timestamp = inner.clock;
        node.set_timestamp(timestamp);
        node.mark_queued();
        let prev = inner.index.insert(node.key(), Arc::clone(node));
        debug_assert!(prev.is_none());

        let woke = self.refresh_front(&inner);
        drop(inner);

        if woke {
            waitq.wake();
        }
        timestamp
    }

    /// Unlinks `node` from the index, staged or committed.
    ///
    /// Removing a staging entry can unblock a committed entry behind it; if
    /// the queue became readable, one waiter on `waitq` is woken (symmetric
    /// wake semantics for cancellation paths).
    ///
    /// Returns whether the queue became readable.
    pub fn remove(&self, waitq: &WaitQueue, node: &Arc<QueueNode>) -> bool {
        let mut inner = self.inner.lock();

        debug_assert!(node.is_queued(), "removed node is not linked");
        let Some(entry) = inner.index.remove(&node.key()) else {
            tracing::error!(
                sender = node.sender(),
                node.timestamp = node.timestamp(),
                "removed node is not linked into this queue"
            );
            return false;
        };
        debug_assert!(Arc::ptr_eq(&entry, node));
        node.mark_unlinked();

        let woke = self.refresh_front(&inner);
        drop(inner);

        if woke {
            waitq.wake();
        }
        woke
    }

    /// Returns the front entry, if the queue is readable.
    ///
    /// A staged entry is never returned: until every destination of a
    /// transaction is committed, none of its nodes are visible anywhere.
    pub fn peek(&self) -> Option<Peek> {
        let inner = self.inner.lock();
        let node = self.front.load_full()?;
        Some(Peek {
            more: inner.index.len() > 1,
            node,
        })
    }

    /// Dequeues the front entry: peek + remove under a single lock
    /// acquisition, so two racing dequeuers cannot claim the same entry.
    ///
    /// If the queue is still readable afterwards, the wakeup is passed on to
    /// the next waiter on `waitq`.
    pub fn pop(&self, waitq: &WaitQueue) -> Option<Peek> {
        let mut inner = self.inner.lock();
        let node = self.front.load_full()?;

        let entry = inner.index.remove(&node.key());
        debug_assert!(entry.is_some());
        node.mark_unlinked();

        let more = !inner.index.is_empty();
        self.refresh_front(&inner);
        let still_readable = self.front.load().is_some();
        drop(inner);

        if still_readable {
            waitq.wake();
        }
        Some(Peek { node, more })
    }

    /// Drains every entry out of the index into an off-queue list.
    ///
    /// The queue is left empty and unreadable; the clock is unchanged. The
    /// caller disposes of the returned list outside the lock.
    pub fn flush(&self) -> List<QueueNode> {
        let mut inner = self.inner.lock();

        let mut flushed = List::new();
        for (_key, node) in mem::take(&mut inner.index) {
            node.mark_flushed();
            flushed.push_back(node);
        }
        self.front.store(None);
        flushed
    }

    /// Recomputes the cached front pointer from the index.
    ///
    /// The front is the leftmost entry iff its timestamp is even: a staging
    /// entry with a smaller timestamp would itself be leftmost, so "leftmost
    /// and committed" is exactly "ready to be dequeued".
    ///
    /// Returns whether the queue became readable (front went from null to
    /// non-null).
    fn refresh_front(&self, inner: &QueueInner) -> bool {
        let next = match inner.index.first_key_value() {
            Some((key, node)) if key.timestamp & 1 == 0 => Some(Arc::clone(node)),
            _ => None,
        };

        let was_readable = self.front.load().is_some();
        let now_readable = next.is_some();
        self.front.store(next);
        now_readable && !was_readable
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        // Entries that go down with their queue are implicitly flushed.
        let inner = self.inner.get_mut();
        for node in inner.index.values() {
            node.mark_flushed();
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Queue")
            .field("clock", &inner.clock)
            .field("len", &inner.index.len())
            .field("readable", &self.front.load().is_some())
            .finish_non_exhaustive()
    }
}
