//! # Path Service Wire Messages
//!
//! Every datagram exchanged with a path server carries one [`Pld`] envelope:
//! a correlation id plus exactly one [`PldBody`] variant. Servers answer each
//! request with exactly one envelope echoing the request's id.
//!
//! ## Request Kinds
//!
//! | Request | Reply |
//! |---------|-------|
//! | `PathReq` | `PathReply` |
//! | `AsInfoReq` | `AsInfoReply` |
//! | `IfInfoReq` | `IfInfoReply` |
//! | `SvcInfoReq` | `SvcInfoReply` |
//! | `RevNotification` | `RevReply` |
//! | `SegSync` | `SegSyncAck` |
//!
//! ## Security Limits
//!
//! - `MAX_DESERIALIZE_SIZE`: Maximum envelope size accepted from the network
//! - All deserialization uses `deserialize_bounded()` with size limits

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::addr::Ia;
use crate::path::{IfId, Path};
use crate::revocation::{RevOutcome, SignedRevInfo};
use crate::topology::ServiceType;

/// Largest datagram payload accepted by the path service.
pub const MAX_PLD_SIZE: usize = 64 * 1024;

/// Maximum buffer size for deserialization.
/// Segment-sync payloads travel nested in an envelope, so the same bound covers both.
pub const MAX_DESERIALIZE_SIZE: u64 = MAX_PLD_SIZE as u64;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_pld(pld: &Pld) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(pld)
}

pub fn deserialize_pld(data: &[u8]) -> Result<Pld, bincode::Error> {
    deserialize_bounded(data)
}

pub type RequestId = u64;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pld {
    pub id: RequestId,
    pub body: PldBody,
}

impl Pld {
    pub fn new(id: RequestId, body: PldBody) -> Self {
        Self { id, body }
    }

    /// Reply envelope carrying this request's correlation id.
    pub fn reply(&self, body: PldBody) -> Self {
        Self { id: self.id, body }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PldBody {
    PathReq(PathReq),
    PathReply(PathReply),
    AsInfoReq(AsInfoReq),
    AsInfoReply(AsInfoReply),
    IfInfoReq(IfInfoReq),
    IfInfoReply(IfInfoReply),
    SvcInfoReq(SvcInfoReq),
    SvcInfoReply(SvcInfoReply),
    RevNotification(RevNotification),
    RevReply(RevReply),
    SegSync(SegSync),
    SegSyncAck(Ack),
}

impl PldBody {
    pub fn kind(&self) -> &'static str {
        match self {
            PldBody::PathReq(_) => "path_req",
            PldBody::PathReply(_) => "path_reply",
            PldBody::AsInfoReq(_) => "as_info_req",
            PldBody::AsInfoReply(_) => "as_info_reply",
            PldBody::IfInfoReq(_) => "if_info_req",
            PldBody::IfInfoReply(_) => "if_info_reply",
            PldBody::SvcInfoReq(_) => "svc_info_req",
            PldBody::SvcInfoReply(_) => "svc_info_reply",
            PldBody::RevNotification(_) => "rev_notification",
            PldBody::RevReply(_) => "rev_reply",
            PldBody::SegSync(_) => "seg_sync",
            PldBody::SegSyncAck(_) => "seg_sync_ack",
        }
    }
}

// ============================================================================
// Paths
// ============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathReqFlags {
    /// Bypass cached results and ask upstream again.
    pub refresh: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathReq {
    pub dst: Ia,
    /// Zero means the server's local scope.
    pub src: Ia,
    pub max_paths: u16,
    pub flags: PathReqFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathErrorCode {
    Ok,
    NoPaths,
    PsTimeout,
    Internal,
    BadSrcIa,
    BadDstIa,
}

impl fmt::Display for PathErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PathErrorCode::Ok => "OK",
            PathErrorCode::NoPaths => "No paths available",
            PathErrorCode::PsTimeout => "Path server timeout",
            PathErrorCode::Internal => "Internal error",
            PathErrorCode::BadSrcIa => "Bad source ISD/AS",
            PathErrorCode::BadDstIa => "Bad destination ISD/AS",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathReply {
    pub error_code: PathErrorCode,
    pub entries: Vec<Path>,
}

impl PathReply {
    pub fn ok(entries: Vec<Path>) -> Self {
        Self {
            error_code: PathErrorCode::Ok,
            entries,
        }
    }

    pub fn error(code: PathErrorCode) -> Self {
        Self {
            error_code: code,
            entries: Vec::new(),
        }
    }
}

// ============================================================================
// Topology Queries
// ============================================================================

/// Overlay address of a host in the local scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub port: u16,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

impl HostInfo {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ipv4
            .map(|ip| SocketAddr::from((ip, self.port)))
            .or_else(|| self.ipv6.map(|ip| SocketAddr::from((ip, self.port))))
    }
}

impl From<SocketAddr> for HostInfo {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => HostInfo {
                port: v4.port(),
                ipv4: Some(*v4.ip()),
                ipv6: None,
            },
            SocketAddr::V6(v6) => HostInfo {
                port: v6.port(),
                ipv4: None,
                ipv6: Some(*v6.ip()),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsInfoReq {
    /// Zero means the server's local scope.
    pub isdas: Ia,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsInfoReplyEntry {
    pub raw_isdas: u64,
    /// Only reported for the server's own scope.
    pub mtu: Option<u16>,
    pub is_core: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsInfoReply {
    pub entries: Vec<AsInfoReplyEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfInfoReq {
    /// Empty means every local interface.
    pub if_ids: Vec<IfId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfInfoReplyEntry {
    pub if_id: IfId,
    pub host_info: HostInfo,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfInfoReply {
    pub entries: Vec<IfInfoReplyEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SvcInfoReq {
    pub service_types: Vec<ServiceType>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SvcInfoReplyEntry {
    pub service_type: ServiceType,
    /// Seconds the host list may be cached.
    pub ttl: u32,
    pub host_infos: Vec<HostInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SvcInfoReply {
    pub entries: Vec<SvcInfoReplyEntry>,
}

// ============================================================================
// Revocations
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevNotification {
    pub srev_info: SignedRevInfo,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevReply {
    pub result: RevOutcome,
    pub srev_info: SignedRevInfo,
}

// ============================================================================
// Segment Sync
// ============================================================================

/// Unsolicited segment push between path servers. `raw` holds an encoded
/// [`crate::segment::SegSyncPayload`]; it is decoded by the receiving handler so
/// that a malformed payload can be rejected with an ack.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegSync {
    pub raw: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckCode {
    Ok,
    Reject,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub code: AckCode,
    pub reason: String,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            code: AckCode::Ok,
            reason: String::new(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            code: AckCode::Reject,
            reason: reason.into(),
        }
    }
}
