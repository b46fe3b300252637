// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg_attr(not(test), no_std)]

//! # A capability-oriented multicast message bus core.
//!
//! Peers hold message queues; a send operation atomically delivers one
//! message to a chosen set of destination queues so that every peer observes
//! a consistent partial order of deliveries, without any global lock.
//!
//! The crate is built out of four components:
//!
//! - [`Active`]: an atomic lifecycle counter that lets an arbitrary number of
//!   short-lived references coexist with a single, once-only teardown.
//! - [`QueueNode`]: a reference-counted queue entry carrying a
//!   `(timestamp, sender)` ordering key and a small type tag.
//! - [`Queue`]: a per-peer ordered container with a local Lamport clock and a
//!   cached front-of-queue pointer that readers may check lock-free.
//! - [`Transaction`]: the multi-queue stage/commit protocol that implements
//!   multicast delivery.
//!
//! [`Peer`] composes these into the surface an IO layer consumes:
//! connect/disconnect, guarded access, send and receive.
//!
//! ## Ordering model
//!
//! Every queue keeps a 64-bit Lamport clock. Delivering a message first
//! *stages* an entry on every destination at an odd timestamp, then picks an
//! even commit timestamp greater than every staged timestamp and finalizes
//! each entry at it. A staged entry blocks the front of its queue from
//! advancing past it, so a reader can never observe the second half of a
//! multicast before the first, and two multicasts with overlapping
//! destination sets are observed in the same order by every queue. Ties on
//! the commit timestamp are broken by the sender tag, which is unique per
//! peer.

extern crate alloc;

mod error;
pub(crate) mod loom;
mod util;

pub mod active;
pub mod node;
pub mod peer;
pub mod queue;
pub mod transaction;

pub use error::Error;

pub use self::active::{Active, ActiveGuard};
pub use self::node::{NodeType, QueueNode};
pub use self::peer::{Message, Peer, PeerGuard, PeerInfo};
pub use self::queue::{Peek, Queue};
pub use self::transaction::Transaction;
