//! Error types shared across the network context, connections and the path service.
//!
//! | Error | Raised by | Retried |
//! |-------|-----------|---------|
//! | [`ValidationError`] | dial/listen, before any I/O | never |
//! | [`RegistrationError`] | dispatcher registration | by the caller |
//! | [`ConnError`] | connection send/receive | by the caller |
//! | [`LookupError`] | path resolver, daemon client, AS inspector | on the resolver's error-refire timer |
//! | [`RevocationError`] | revocation extraction and verification | never; classified `unknown` |
//! | [`SegmentError`] | segment-sync parsing and the verify-and-store pipeline | never; rejected via ack |

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::addr::{Ia, L3Type, L4Type, NetFamily};
use crate::dispatcher::ScmpNotification;
use crate::messages::PathErrorCode;

/// First invariant violated by the addresses handed to dial/listen.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unsupported network family {0:?}")]
    UnsupportedFamily(String),
    #[error("nil {0} in local address")]
    MissingLocalAddress(&'static str),
    #[error("local address network type {actual} does not match family {family}")]
    FamilyMismatch { family: NetFamily, actual: L3Type },
    #[error("local address {0} is unspecified")]
    UnspecifiedAddress(String),
    #[error("local transport type {actual} does not match family {family} ({expected})")]
    L4Mismatch {
        family: NetFamily,
        expected: L4Type,
        actual: L4Type,
    },
    #[error("unable to bind to non-local {label} IA {actual}, local IA is {expected}")]
    NonLocalIa {
        label: &'static str,
        expected: Ia,
        actual: Ia,
    },
    #[error("unable to dial to nil remote")]
    NilRemote,
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("address {0} is already registered")]
    AddressInUse(String),
    #[error("no free port left for {0}")]
    PortsExhausted(String),
    #[error("registration timed out after {0:?}")]
    Timeout(Duration),
    #[error("dispatcher unavailable: {0}")]
    Unavailable(String),
    #[error("dispatcher I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure of a dial/listen call.
#[derive(Debug, Error)]
pub enum NetError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("connection closed")]
    Closed,
    #[error("operation requires an unconnected socket but the connection is dialed")]
    Dialed,
    #[error("operation requires a dialed connection")]
    NotDialed,
    #[error("no path to {0}")]
    NoPath(Ia),
    #[error("destination has no host address")]
    NoHost,
    #[error("SCMP notification: {0}")]
    Scmp(ScmpNotification),
    #[error("path lookup failed: {0}")]
    Lookup(#[from] LookupError),
    #[error("packet encoding failed: {0}")]
    Encode(#[from] bincode::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("lookup daemon unavailable: {0}")]
    DaemonUnavailable(String),
    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),
    #[error("lookup failed with code {0}")]
    Code(PathErrorCode),
    #[error("unknown IA {0}")]
    UnknownIa(Ia),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RevocationError {
    #[error("Unable to extract RevInfo: {0}")]
    Malformed(String),
    #[error("no verification key for {0}")]
    UnknownSigner(Ia),
    #[error("revocation verification failed: {0}")]
    Verification(String),
    #[error("revocation for {ia}#{ifid} expired")]
    Expired { ia: Ia, ifid: u64 },
    #[error("revocation handling exceeded {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentError {
    #[error("unexpected message type {0}")]
    UnexpectedMessage(&'static str),
    #[error("failed to parse: {0}")]
    Parse(String),
    #[error("segment {id} rejected: {reason}")]
    Verification { id: String, reason: String },
    #[error(transparent)]
    Revocation(#[from] RevocationError),
    #[error("segment store failed: {0}")]
    Store(String),
    #[error("segment pipeline dropped without completing")]
    Incomplete,
    #[error("segment pipeline exceeded {0:?}")]
    Timeout(Duration),
}

/// Second attempt to install the process-wide default network context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("default network context already initialized")]
pub struct AlreadyInitialized;
