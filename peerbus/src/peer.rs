// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Peers: the bus-facing wrapper around an [`Active`] and a [`Queue`].

use alloc::sync::Arc;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicU64, Ordering};

use maitake_sync::WaitQueue;

use crate::active::{Active, ActiveGuard};
use crate::error::Error;
use crate::node::NodeType;
use crate::queue::Queue;
use crate::transaction::Transaction;

/// Sender tags are never zero, so the counter starts at 1.
static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// A peer on the bus.
///
/// A peer owns its message queue; everyone else reaches the queue through
/// the peer's [`Active`] reference contract: [`acquire`](Peer::acquire) an
/// active reference, use the [`PeerInfo`] behind it, drop the guard.
/// Disconnecting deactivates the peer, waits for outstanding references to
/// drop, flushes the queue and wakes any parked readers.
///
/// A peer must be [`disconnect`](Peer::disconnect)ed before it is dropped
/// (a never-connected peer included; disconnect completes immediately when
/// no references are outstanding). Dropping asserts that the lifecycle was
/// drained.
pub struct Peer {
    id: u64,
    active: Active,
    /// Signaled when the queue becomes readable; closed on disconnect.
    readable: WaitQueue,
    info: PeerInfo,
}

/// The data a peer guards behind its active reference.
pub struct PeerInfo {
    queue: Queue,
}

/// A held active reference to a peer, granting access to its [`PeerInfo`].
#[derive(Debug)]
#[must_use = "a peer reference blocks disconnect until it is dropped"]
pub struct PeerGuard<'a> {
    _active: ActiveGuard<'a>,
    info: &'a PeerInfo,
}

/// A message dequeued from a peer's queue.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: NodeType,
    /// The sending peer's id.
    pub sender: u64,
    /// The commit timestamp the message was delivered at.
    pub timestamp: u64,
    pub payload: Arc<[u8]>,
}

// === impl Peer ===

impl Peer {
    /// Creates a new, unconnected peer.
    pub fn new() -> Self {
        Self {
            id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
            active: Active::new(),
            readable: WaitQueue::new(),
            info: PeerInfo {
                queue: Queue::new(),
            },
        }
    }

    /// The peer's stable identifier; used as the sender tag on every message
    /// it delivers. Never zero.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Connects the peer.
    ///
    /// Returns `true` if this call performed the activation, `false` if the
    /// peer was already connected.
    ///
    /// # Errors
    ///
    /// [`Error::ShuttingDown`] if the peer has been disconnected.
    pub fn connect(&self) -> Result<bool, Error> {
        if self.active.activate() {
            tracing::debug!(peer = self.id, "connected");
            return Ok(true);
        }
        if self.active.is_active() {
            return Ok(false);
        }
        Err(Error::ShuttingDown)
    }

    /// Disconnects the peer: deactivate, drain, flush.
    ///
    /// Idempotent. Blocks until every outstanding [`PeerGuard`] has been
    /// dropped, then (on exactly one caller) flushes the queue and closes
    /// the readable wait queue, failing parked readers with
    /// [`Error::ShuttingDown`]. Returns whether this caller performed the
    /// teardown.
    pub async fn disconnect(&self) -> bool {
        self.active.deactivate();
        self.active
            .drain(|| {
                let flushed = self.info.queue.flush();
                self.readable.close();
                drop(flushed);
                tracing::debug!(peer = self.id, "disconnected");
            })
            .await
    }

    /// Acquires an active reference to the peer.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] before [`connect`](Self::connect),
    /// [`Error::ShuttingDown`] after [`disconnect`](Self::disconnect) has
    /// begun.
    pub fn acquire(&self) -> Result<PeerGuard<'_>, Error> {
        if self.active.is_new() {
            return Err(Error::NotConnected);
        }
        match self.active.acquire() {
            Some(guard) => Ok(PeerGuard {
                _active: guard,
                info: &self.info,
            }),
            None => Err(Error::ShuttingDown),
        }
    }

    /// Delivers one data message to every destination, atomically.
    ///
    /// Either every destination receives the message (at one shared commit
    /// timestamp) or none does. Returns the commit timestamp.
    ///
    /// # Errors
    ///
    /// [`Error::Invalid`] on an empty destination set;
    /// [`Error::NotConnected`]/[`Error::ShuttingDown`] if the sender or any
    /// destination is gone, in which case all partial stagings are rolled
    /// back.
    pub fn send(
        &self,
        destinations: &[&Peer],
        payload: impl Into<Arc<[u8]>>,
    ) -> Result<u64, Error> {
        let mut tx = Transaction::new(self, NodeType::Data, payload.into())?;
        for dest in destinations {
            tx.stage(dest)?;
        }
        tx.commit()
    }

    /// Dequeues the front message, if any.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] / [`Error::ShuttingDown`] per the active
    /// reference contract.
    pub fn try_recv(&self) -> Result<Option<Message>, Error> {
        let guard = self.acquire()?;
        Ok(guard
            .queue()
            .pop(&self.readable)
            .map(|peek| Message::from_node(&peek.node)))
    }

    /// Receives the front message, parking until one is available.
    ///
    /// Cancel-safe: dropping the future leaves the queue unchanged.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] if the peer was never connected;
    /// [`Error::ShuttingDown`] once the peer disconnects.
    pub async fn recv(&self) -> Result<Message, Error> {
        loop {
            if let Some(message) = self.try_recv()? {
                return Ok(message);
            }
            self.readable
                .wait_for(|| self.info.queue.is_readable())
                .await
                .map_err(|_| Error::ShuttingDown)?;
        }
    }

    /// The peer's readable wait queue, for poll-style IO layers.
    ///
    /// Signaled whenever the queue's front becomes non-null; closed on
    /// disconnect.
    pub fn readable(&self) -> &WaitQueue {
        &self.readable
    }

    pub(crate) fn queue(&self) -> &Queue {
        &self.info.queue
    }
}

impl Default for Peer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("active", &self.active)
            .field("queue", &self.info.queue)
            .finish_non_exhaustive()
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.active.destroy();
    }
}

// === impl PeerInfo ===

impl PeerInfo {
    /// The peer's message queue.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }
}

impl fmt::Debug for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerInfo")
            .field("queue", &self.queue)
            .finish()
    }
}

// === impl PeerGuard ===

impl Deref for PeerGuard<'_> {
    type Target = PeerInfo;

    fn deref(&self) -> &Self::Target {
        self.info
    }
}

// === impl Message ===

impl Message {
    fn from_node(node: &crate::node::QueueNode) -> Self {
        Self {
            kind: node.kind(),
            sender: node.sender(),
            timestamp: node.timestamp(),
            payload: Arc::clone(node.payload()),
        }
    }
}
