// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Flat error enumeration shared by every public entry point.
//!
//! Packet-level errors (CRC, wire, size, topo) are normally absorbed inside
//! the scheduler and surfaced only as per-socket statistics; they reach an
//! application only when returned directly from a one-shot call such as
//! [`crate::codec::pd::decode_and_validate_pd_header`].

use std::fmt;
use std::io;

/// Result alias used by every fallible public call in this crate.
pub type TrdpResult<T> = Result<T, TrdpError>;

/// Error kinds, one per failure mode defined by the protocol.
#[derive(Debug)]
pub enum TrdpError {
    /// A parameter was out of range or internally inconsistent.
    Param(&'static str),
    /// The session (or a sub-object of it) was never initialized.
    NoInit,
    /// No session matches the handle or session id supplied.
    NoSession,
    /// No data has arrived yet for this subscription.
    NoData,
    /// A blocking wait exceeded its timeout.
    Timeout,
    /// An MD request did not receive a reply within `replyTimeout`.
    ReplyTimeout,
    /// An MD requester did not receive a confirm within `confirmTimeout`.
    ConfirmTimeout,
    /// The application-level reply callback reported a timeout.
    AppReplyTimeout,
    /// The application-level confirm callback reported a timeout.
    AppConfirmTimeout,
    /// A request expecting confirmation was not confirmed in time.
    ReqConfirmTimeout,
    /// No listener is registered to service a request.
    NoListener,
    /// A buffer was too small, or a size field was out of bounds.
    Size,
    /// The packet failed structural validation (bad version or message type).
    Wire,
    /// The header CRC did not match.
    Crc,
    /// The packet's topology counters did not pass the session's filter.
    Topo,
    /// A socket-layer operation failed.
    Sock(io::Error),
    /// A non-socket I/O operation failed.
    Io(io::Error),
    /// A non-blocking operation would have blocked.
    WouldBlock,
    /// A table or pool has reached capacity.
    Mem,
    /// A semaphore operation failed.
    Sema,
    /// A mutex was poisoned.
    Mutex,
    /// A URI could not be resolved to an address.
    Unresolved(String),
}

impl fmt::Display for TrdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Param(msg) => write!(f, "invalid parameter: {msg}"),
            Self::NoInit => write!(f, "session not initialized"),
            Self::NoSession => write!(f, "no matching session"),
            Self::NoData => write!(f, "no data available"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::ReplyTimeout => write!(f, "reply timeout"),
            Self::ConfirmTimeout => write!(f, "confirm timeout"),
            Self::AppReplyTimeout => write!(f, "application reply timeout"),
            Self::AppConfirmTimeout => write!(f, "application confirm timeout"),
            Self::ReqConfirmTimeout => write!(f, "request/confirm timeout"),
            Self::NoListener => write!(f, "no matching listener"),
            Self::Size => write!(f, "size out of bounds"),
            Self::Wire => write!(f, "malformed packet"),
            Self::Crc => write!(f, "header CRC mismatch"),
            Self::Topo => write!(f, "topology counter filter rejected packet"),
            Self::Sock(e) => write!(f, "socket error: {e}"),
            Self::Io(e) => write!(f, "i/o error: {e}"),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::Mem => write!(f, "table full"),
            Self::Sema => write!(f, "semaphore error"),
            Self::Mutex => write!(f, "mutex poisoned"),
            Self::Unresolved(uri) => write!(f, "could not resolve '{uri}'"),
        }
    }
}

impl std::error::Error for TrdpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sock(e) | Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TrdpError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::WouldBlock {
            Self::WouldBlock
        } else {
            Self::Io(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_maps_from_io_error() {
        let e: TrdpError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(matches!(e, TrdpError::WouldBlock));
    }

    #[test]
    fn display_is_non_empty_for_every_variant() {
        let variants = [
            TrdpError::Param("x"),
            TrdpError::NoInit,
            TrdpError::NoSession,
            TrdpError::NoData,
            TrdpError::Timeout,
            TrdpError::ReplyTimeout,
            TrdpError::ConfirmTimeout,
            TrdpError::AppReplyTimeout,
            TrdpError::AppConfirmTimeout,
            TrdpError::ReqConfirmTimeout,
            TrdpError::NoListener,
            TrdpError::Size,
            TrdpError::Wire,
            TrdpError::Crc,
            TrdpError::Topo,
            TrdpError::WouldBlock,
            TrdpError::Mem,
            TrdpError::Sema,
            TrdpError::Mutex,
            TrdpError::Unresolved("testUri".into()),
        ];
        for v in variants {
            assert!(!v.to_string().is_empty());
        }
    }
}
