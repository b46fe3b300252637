// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Errors surfaced by the bus core.
///
/// The taxonomy is behavioral: an IO layer sitting on top of this crate maps
/// these onto whatever error surface it exposes (errno values, status codes).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The operation requires a connected peer, but the peer was never
    /// activated.
    NotConnected,
    /// The peer has been deactivated; no new references can be acquired.
    ShuttingDown,
    /// Malformed parameters, e.g. a commit timestamp that is not even or an
    /// empty destination set.
    Invalid,
    /// A blocking wait was cancelled before its condition became true. The
    /// caller may retry. Produced by blocking front-ends; the async surface
    /// of this crate expresses cancellation by dropping the future instead.
    Interrupted,
    /// A transient resource failure (e.g. a pool allocation). The caller may
    /// retry. Reserved for the IO layer's backing-pool integration.
    Transient,
    /// An internal invariant was violated. Logged at the detection site.
    Fatal,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotConnected => f.write_str("peer is not connected"),
            Error::ShuttingDown => f.write_str("peer is shutting down"),
            Error::Invalid => f.write_str("invalid argument"),
            Error::Interrupted => f.write_str("wait was interrupted"),
            Error::Transient => f.write_str("transient resource failure"),
            Error::Fatal => f.write_str("internal invariant violated"),
        }
    }
}

impl core::error::Error for Error {}
