// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Multi-queue delivery transactions.
//!
//! A transaction delivers one logical message to a set of destination
//! queues. Each destination gets its own node (sharing the payload); the
//! nodes are first *staged* on every destination at odd timestamps, then a
//! single even commit timestamp greater than every staged timestamp is
//! allocated from the sender's clock, and every node is finalized at it.
//!
//! Because a staged entry blocks its queue's front, no reader observes any
//! part of the message until every destination is committed, and two
//! transactions with overlapping destination sets are observed in the same
//! order by every queue: either one commit timestamp strictly exceeds the
//! other, or the tie is broken by the sender tag identically everywhere.
//!
//! Dropping a transaction that was not committed removes every staged node,
//! leaving all destination queues as if the transaction never existed.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp;

use crate::error::Error;
use crate::node::{NodeType, QueueNode};
use crate::peer::{Peer, PeerGuard};

/// An in-flight multicast delivery.
///
/// Holds an active reference on the sender and on every destination for the
/// whole stage/commit protocol, so none of the involved peers can drain
/// while the transaction is in flight.
#[derive(Debug)]
#[must_use = "a transaction delivers nothing unless committed"]
pub struct Transaction<'a> {
    sender: &'a Peer,
    _sender_ref: PeerGuard<'a>,
    kind: NodeType,
    payload: Arc<[u8]>,
    /// High-water mark over the sender clock and every staged timestamp;
    /// the commit timestamp is allocated above it.
    current_max: u64,
    dests: Vec<Dest<'a>>,
}

#[derive(Debug)]
struct Dest<'a> {
    peer: &'a Peer,
    _ref: PeerGuard<'a>,
    /// The staged node; taken on commit, so anything still here when the
    /// transaction drops is rolled back.
    node: Option<Arc<QueueNode>>,
}

// === impl Transaction ===

impl<'a> Transaction<'a> {
    /// Opens a transaction on behalf of `sender`.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] or [`Error::ShuttingDown`] if the sender's
    /// active reference cannot be acquired.
    pub fn new(sender: &'a Peer, kind: NodeType, payload: Arc<[u8]>) -> Result<Self, Error> {
        let guard = sender.acquire()?;
        let current_max = sender.queue().clock();
        Ok(Self {
            sender,
            _sender_ref: guard,
            kind,
            payload,
            current_max,
            dests: Vec::new(),
        })
    }

    /// Stages the message on one more destination.
    ///
    /// # Errors
    ///
    /// [`Error::NotConnected`] or [`Error::ShuttingDown`] if the destination
    /// is gone; previously staged destinations stay staged (and are rolled
    /// back if the caller gives up on the transaction).
    pub fn stage(&mut self, dest: &'a Peer) -> Result<(), Error> {
        let guard = dest.acquire()?;
        let node = QueueNode::new(self.kind, self.sender.id(), Arc::clone(&self.payload));
        let staged = dest.queue().stage(&node, self.current_max);
        self.current_max = cmp::max(self.current_max, staged);
        self.dests.push(Dest {
            peer: dest,
            _ref: guard,
            node: Some(node),
        });
        Ok(())
    }

    /// Selects the commit timestamp and finalizes delivery on every
    /// destination. Returns the commit timestamp.
    ///
    /// The commit timestamp is allocated by merging the staging high-water
    /// mark into the sender's clock and ticking it, so it is even, greater
    /// than every staged timestamp, and unique for this sender.
    ///
    /// # Errors
    ///
    /// [`Error::Invalid`] on an empty destination set. An error from a
    /// destination commit rolls back every not-yet-committed staging before
    /// surfacing.
    pub fn commit(mut self) -> Result<u64, Error> {
        if self.dests.is_empty() {
            return Err(Error::Invalid);
        }

        let timestamp = {
            let queue = self.sender.queue();
            queue.sync(self.current_max);
            queue.tick()
        };

        for dest in &mut self.dests {
            let Some(node) = dest.node.clone() else {
                continue;
            };
            dest.peer
                .queue()
                .commit_staged(dest.peer.readable(), &node, timestamp)?;
            dest.node = None;
        }

        tracing::trace!(
            sender = self.sender.id(),
            timestamp,
            destinations = self.dests.len(),
            "committed"
        );
        Ok(timestamp)
    }

    /// The number of destinations staged so far.
    pub fn destinations(&self) -> usize {
        self.dests.len()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        let mut aborted = 0_usize;
        for dest in &mut self.dests {
            if let Some(node) = dest.node.take() {
                dest.peer.queue().remove(dest.peer.readable(), &node);
                aborted += 1;
            }
        }
        if aborted > 0 {
            tracing::trace!(sender = self.sender.id(), aborted, "rolled back");
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use alloc::vec::Vec;

    use futures::executor::block_on;

    use super::*;
    use crate::loom::thread;
    use crate::peer::Peer;

    fn connected_peer() -> Peer {
        let peer = Peer::new();
        assert!(peer.connect().unwrap());
        peer
    }

    fn payload() -> Arc<[u8]> {
        Arc::from(&b"payload"[..])
    }

    fn drain(peer: &Peer) -> Vec<(u64, u64)> {
        let mut order = Vec::new();
        while let Some(message) = peer.try_recv().unwrap() {
            order.push((message.sender, message.timestamp));
        }
        order
    }

    // Two multicasts to the same destinations, with skewed clocks. The
    // second one stages past the first one's stagings, so both destination
    // queues observe them in the same order.
    #[test]
    fn multicast_clock_arithmetic() {
        let p1 = connected_peer();
        let p2 = connected_peer();
        let p3 = connected_peer();
        let p4 = connected_peer();
        p1.queue().sync(4);
        p3.queue().sync(10);
        p4.queue().sync(6);

        let mut m1 = Transaction::new(&p1, NodeType::Data, payload()).unwrap();
        m1.stage(&p2).unwrap();
        assert_eq!(p2.queue().clock(), 5, "staged at max(0, 4) | 1");
        m1.stage(&p3).unwrap();
        assert_eq!(p3.queue().clock(), 11, "staged at max(10, 5) | 1");
        assert_eq!(m1.commit().unwrap(), 12);

        let mut m2 = Transaction::new(&p4, NodeType::Data, payload()).unwrap();
        m2.stage(&p2).unwrap();
        assert_eq!(p2.queue().clock(), 13, "clock fast-forwarded past m1");
        m2.stage(&p3).unwrap();
        assert_eq!(p3.queue().clock(), 13);
        assert_eq!(m2.commit().unwrap(), 14);

        let expected = [(p1.id(), 12), (p4.id(), 14)];
        assert_eq!(drain(&p2), expected);
        assert_eq!(drain(&p3), expected);

        for peer in [&p1, &p2, &p3, &p4] {
            block_on(peer.disconnect());
        }
    }

    // While a transaction is staged, none of its nodes are visible anywhere.
    #[test]
    fn staged_nodes_are_invisible() {
        let p1 = connected_peer();
        let p2 = connected_peer();
        let p3 = connected_peer();

        let mut tx = Transaction::new(&p1, NodeType::Data, payload()).unwrap();
        tx.stage(&p2).unwrap();
        tx.stage(&p3).unwrap();
        assert_eq!(tx.destinations(), 2);

        assert!(p2.try_recv().unwrap().is_none());
        assert!(p3.try_recv().unwrap().is_none());
        assert!(!p2.queue().is_readable());

        tx.commit().unwrap();
        assert!(p2.try_recv().unwrap().is_some());
        assert!(p3.try_recv().unwrap().is_some());

        for peer in [&p1, &p2, &p3] {
            block_on(peer.disconnect());
        }
    }

    // Dropping an uncommitted transaction leaves the destination queues as
    // if it never existed.
    #[test]
    fn drop_rolls_back_stagings() {
        let p1 = connected_peer();
        let p2 = connected_peer();

        let mut tx = Transaction::new(&p1, NodeType::Data, payload()).unwrap();
        tx.stage(&p2).unwrap();
        assert_eq!(p2.queue().len(), 1);
        drop(tx);

        assert!(p2.queue().is_empty());
        assert!(!p2.queue().is_readable());

        // The queues are fully operational afterwards.
        p1.send(&[&p2], &b"after"[..]).unwrap();
        assert!(p2.try_recv().unwrap().is_some());

        block_on(p1.disconnect());
        block_on(p2.disconnect());
    }

    #[test]
    fn empty_destination_set_is_invalid() {
        let p1 = connected_peer();
        let tx = Transaction::new(&p1, NodeType::Data, payload()).unwrap();
        assert_eq!(tx.commit(), Err(Error::Invalid));
        block_on(p1.disconnect());
    }

    #[test]
    fn unconnected_sender_is_rejected() {
        let p1 = Peer::new();
        match Transaction::new(&p1, NodeType::Data, payload()) {
            Err(Error::NotConnected) => {}
            other => panic!("expected NotConnected, got {other:?}"),
        }
        block_on(p1.disconnect());
    }

    #[test]
    fn gone_destination_aborts_the_send() {
        let p1 = connected_peer();
        let p2 = connected_peer();
        let p3 = connected_peer();
        assert!(block_on(p3.disconnect()));

        assert_eq!(p1.send(&[&p2, &p3], &b"m"[..]), Err(Error::ShuttingDown));
        assert!(p2.queue().is_empty(), "the partial staging was rolled back");

        block_on(p1.disconnect());
        block_on(p2.disconnect());
    }

    // Program order: messages from one sender arrive in send order, with
    // strictly increasing commit timestamps.
    #[test]
    fn sender_program_order_is_preserved() {
        let p1 = connected_peer();
        let p2 = connected_peer();

        let t1 = p1.send(&[&p2], &b"first"[..]).unwrap();
        let t2 = p1.send(&[&p2], &b"second"[..]).unwrap();
        assert!(t1 < t2);

        let order = drain(&p2);
        assert_eq!(order, [(p1.id(), t1), (p1.id(), t2)]);

        block_on(p1.disconnect());
        block_on(p2.disconnect());
    }

    // Concurrent multicasts from several senders: every destination queue
    // must observe the identical total order.
    #[test]
    fn concurrent_multicasts_totally_order() {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::util::SubscriberInitExt;
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default();

        const SENDERS: usize = 4;
        const MESSAGES: usize = 25;

        let dests: Vec<_> = (0..2).map(|_| Arc::new(connected_peer())).collect();
        let senders: Vec<_> = (0..SENDERS).map(|_| Arc::new(connected_peer())).collect();

        let threads: Vec<_> = senders
            .iter()
            .map(|sender| {
                let sender = Arc::clone(sender);
                let dests = dests.clone();
                thread::spawn(move || {
                    for i in 0..MESSAGES {
                        let payload = [u8::try_from(i % 251).unwrap()];
                        let targets: Vec<&Peer> = dests.iter().map(|d| &**d).collect();
                        sender.send(&targets, &payload[..]).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let orders: Vec<_> = dests.iter().map(|dest| drain(dest)).collect();
        assert_eq!(orders[0].len(), SENDERS * MESSAGES);
        assert_eq!(orders[0], orders[1], "all queues observe the same order");

        // Per-sender subsequences are in program order.
        for sender in &senders {
            let timestamps: Vec<_> = orders[0]
                .iter()
                .filter(|(id, _)| *id == sender.id())
                .map(|&(_, timestamp)| timestamp)
                .collect();
            assert_eq!(timestamps.len(), MESSAGES);
            assert!(timestamps.is_sorted());
        }

        for peer in senders.iter().chain(dests.iter()) {
            block_on(peer.disconnect());
        }
    }
}
