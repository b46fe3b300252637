// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Reference-counted queue entries.

use alloc::sync::Arc;
use core::fmt;
use core::mem::offset_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use cordyceps::list;
use mycelium_bitfield::{bitfield, enum_from_bits};

enum_from_bits! {
    /// The type tag of a queue node.
    ///
    /// Stored in the top two bits of the node's stamp word; never mutates
    /// after construction.
    #[derive(Debug, Eq, PartialEq)]
    pub enum NodeType<u8> {
        /// No payload; an unset entry.
        None = 0b00,
        /// A data message carrying an opaque payload.
        Data = 0b01,
        /// Notification that a node owned by the receiver was destroyed.
        NodeDestruction = 0b10,
        /// Notification that the last handle to a node was released.
        NodeRelease = 0b11,
    }
}

bitfield! {
    /// The node's packed `(timestamp, type)` word.
    struct Stamp<u64> {
        /// The node's staging (odd) or commit (even) timestamp.
        const TIMESTAMP = 62;
        /// The node's type tag.
        const KIND: NodeType;
    }
}

/// Largest timestamp representable in the packed stamp word.
pub(crate) const MAX_TIMESTAMP: u64 = (1 << 62) - 1;

/// A node is linked nowhere.
const LINK_NONE: u8 = 0;
/// A node is linked into its queue's ordered index.
const LINK_QUEUED: u8 = 1;
/// A node has been flushed out of the index into an off-queue list.
const LINK_FLUSHED: u8 = 2;

/// Process-wide node sequence counter, used as the final ordering tie-break.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

/// A reference-counted queue entry.
///
/// A node is shared between the queue it is linked into, the transaction
/// delivering it, and a dequeuer holding it; the `Arc` refcount is the sole
/// synchronization for reclamation. The timestamp is only mutated by the
/// owning queue, under the queue lock, while the node is unlinked; everyone
/// else (including lock-free front readers) sees it through acquire loads.
pub struct QueueNode {
    stamp: AtomicU64,
    sender: u64,
    seq: u64,
    payload: Arc<[u8]>,
    linkage: AtomicU8,
    links: list::Links<QueueNode>,
}

/// The ordering key of a linked node: `(timestamp, sender)` lexicographically,
/// as the multicast protocol requires, with the process-unique node sequence
/// number as a final tie-break so the key is unique. Commit timestamps are
/// allocated uniquely per sender, so `seq` never reorders two distinct
/// committed messages; it only disambiguates racing stagings.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct EntryKey {
    pub(crate) timestamp: u64,
    pub(crate) sender: u64,
    pub(crate) seq: u64,
}

// === impl QueueNode ===

impl QueueNode {
    /// Creates a fresh unlinked node with timestamp 0.
    ///
    /// `sender` is the stable identifier of the sending peer and must not be
    /// zero.
    pub fn new(kind: NodeType, sender: u64, payload: Arc<[u8]>) -> Arc<Self> {
        debug_assert_ne!(sender, 0, "sender tags are never zero");
        Arc::new(Self {
            stamp: AtomicU64::new(Stamp::new().with(Stamp::KIND, kind).0),
            sender,
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            payload,
            linkage: AtomicU8::new(LINK_NONE),
            links: list::Links::new(),
        })
    }

    /// The node's type tag.
    pub fn kind(&self) -> NodeType {
        Stamp::from_bits(self.stamp.load(Ordering::Acquire)).get(Stamp::KIND)
    }

    /// The node's current staging or commit timestamp (0 if never staged).
    pub fn timestamp(&self) -> u64 {
        Stamp::from_bits(self.stamp.load(Ordering::Acquire)).get(Stamp::TIMESTAMP)
    }

    /// Whether the node carries a staging (odd) timestamp.
    pub fn is_staging(&self) -> bool {
        self.timestamp() & 1 == 1
    }

    /// Whether the node is currently linked into a queue index.
    pub fn is_queued(&self) -> bool {
        self.linkage.load(Ordering::Relaxed) == LINK_QUEUED
    }

    /// The sending peer's stable identifier.
    pub fn sender(&self) -> u64 {
        self.sender
    }

    /// The opaque message payload.
    pub fn payload(&self) -> &Arc<[u8]> {
        &self.payload
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    /// Rewrites the timestamp, preserving the type tag.
    ///
    /// Only the owning queue may call this, under the queue lock, while the
    /// node is not linked into the index.
    pub(crate) fn set_timestamp(&self, timestamp: u64) {
        debug_assert!(timestamp <= MAX_TIMESTAMP);
        let stamp = Stamp::from_bits(self.stamp.load(Ordering::Relaxed))
            .with(Stamp::TIMESTAMP, timestamp);
        self.stamp.store(stamp.0, Ordering::Release);
    }

    pub(crate) fn key(&self) -> EntryKey {
        EntryKey {
            timestamp: self.timestamp(),
            sender: self.sender,
            seq: self.seq,
        }
    }

    pub(crate) fn mark_queued(&self) {
        let prev = self.linkage.swap(LINK_QUEUED, Ordering::Relaxed);
        debug_assert_eq!(prev, LINK_NONE, "node was already linked");
    }

    pub(crate) fn mark_unlinked(&self) {
        let prev = self.linkage.swap(LINK_NONE, Ordering::Relaxed);
        debug_assert_eq!(prev, LINK_QUEUED);
    }

    pub(crate) fn mark_flushed(&self) {
        let prev = self.linkage.swap(LINK_FLUSHED, Ordering::Relaxed);
        debug_assert_eq!(prev, LINK_QUEUED);
    }
}

impl fmt::Debug for QueueNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueNode")
            .field("kind", &self.kind())
            .field("timestamp", &self.timestamp())
            .field("sender", &self.sender)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl Drop for QueueNode {
    fn drop(&mut self) {
        debug_assert_ne!(
            self.linkage.load(Ordering::Relaxed),
            LINK_QUEUED,
            "queue node dropped while linked into an index"
        );
    }
}

// Safety: node state is either immutable (`sender`, `seq`, `payload`),
// atomic (`stamp`, `linkage`), or only touched under the owning queue's lock
// (`links`).
unsafe impl Send for QueueNode {}
// Safety: see above.
unsafe impl Sync for QueueNode {}

// Safety: `QueueNode` is only ever owned behind an `Arc`, so nodes are pinned
// in memory while they participate in a flush list, and the list holds a
// strong reference to every linked node.
unsafe impl cordyceps::Linked<list::Links<QueueNode>> for QueueNode {
    type Handle = Arc<QueueNode>;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        // Safety: `Arc::into_raw` never returns null.
        unsafe { NonNull::new_unchecked(Arc::into_raw(handle).cast_mut()) }
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        // Safety: `ptr` was produced by `into_ptr` above.
        unsafe { Arc::from_raw(ptr.as_ptr()) }
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<list::Links<Self>> {
        ptr.map_addr(|addr| {
            let offset = offset_of!(Self, links);
            addr.checked_add(offset).unwrap()
        })
        .cast()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn payload() -> Arc<[u8]> {
        Arc::from(&b""[..])
    }

    #[test]
    fn stamp_packs_kind_and_timestamp() {
        let node = QueueNode::new(NodeType::Data, 7, payload());
        assert_eq!(node.kind(), NodeType::Data);
        assert_eq!(node.timestamp(), 0);

        node.set_timestamp(41);
        assert_eq!(node.timestamp(), 41);
        assert!(node.is_staging());
        assert_eq!(node.kind(), NodeType::Data);

        node.set_timestamp(MAX_TIMESTAMP);
        assert_eq!(node.timestamp(), MAX_TIMESTAMP);
        assert_eq!(node.kind(), NodeType::Data);
    }

    #[test]
    fn keys_order_by_timestamp_then_sender() {
        let key = |timestamp, sender, seq| EntryKey {
            timestamp,
            sender,
            seq,
        };
        assert!(key(9, 9, 0) < key(10, 1, 1));
        assert!(key(20, 7, 5) < key(20, 9, 2));
        assert!(key(20, 7, 1) < key(20, 7, 2));
    }

    #[test]
    fn sequence_numbers_are_unique() {
        let a = QueueNode::new(NodeType::Data, 1, payload());
        let b = QueueNode::new(NodeType::Data, 1, payload());
        assert_ne!(a.seq(), b.seq());
    }
}
