//! # Forwarding Paths
//!
//! A [`Path`] is the opaque forwarding directive attached to every packet that
//! leaves the local scope. It carries:
//!
//! - `raw`: the hop-field sequence consumed by border routers ([`HOP_FIELD_LEN`] bytes per hop)
//! - `interfaces`: the (scope, interface) pairs the path crosses, in travel order
//! - `mtu` and `expiry`: the path's MTU and the instant after which it must be re-resolved
//! - `next_hop`: overlay address of the first border router, when known
//!
//! Paths are immutable once issued. The empty path addresses the local scope.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::addr::Ia;

/// Size of one hop field in the raw forwarding buffer.
pub const HOP_FIELD_LEN: usize = 12;

/// MTU assumed for the local (empty) path.
pub const DEFAULT_MTU: u16 = 1472;

/// Lifetime of the empty local path. It never crosses a border router so it
/// only expires to force periodic re-resolution.
const LOCAL_PATH_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Interface identifier, unique within one scope. Zero means "no interface".
pub type IfId = u64;

/// blake3 digest over a path's interface sequence.
pub type PathFingerprint = [u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("malformed path: {len} raw bytes is not a multiple of the {HOP_FIELD_LEN}-byte hop field")]
    Malformed { len: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathInterface {
    pub ia: Ia,
    pub ifid: IfId,
}

impl PathInterface {
    pub fn new(ia: Ia, ifid: IfId) -> Self {
        Self { ia, ifid }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    raw: Vec<u8>,
    interfaces: Vec<PathInterface>,
    mtu: u16,
    expiry: SystemTime,
    next_hop: Option<SocketAddr>,
}

impl Path {
    pub fn new(
        raw: Vec<u8>,
        interfaces: Vec<PathInterface>,
        mtu: u16,
        expiry: SystemTime,
        next_hop: Option<SocketAddr>,
    ) -> Self {
        Self {
            raw,
            interfaces,
            mtu,
            expiry,
            next_hop,
        }
    }

    /// The empty path used for destinations inside the local scope.
    pub fn local(mtu: u16) -> Self {
        Self {
            raw: Vec::new(),
            interfaces: Vec::new(),
            mtu,
            expiry: SystemTime::now() + LOCAL_PATH_LIFETIME,
            next_hop: None,
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn interfaces(&self) -> &[PathInterface] {
        &self.interfaces
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn expiry(&self) -> SystemTime {
        self.expiry
    }

    pub fn next_hop(&self) -> Option<SocketAddr> {
        self.next_hop
    }

    pub fn with_next_hop(mut self, next_hop: Option<SocketAddr>) -> Self {
        self.next_hop = next_hop;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty() && self.interfaces.is_empty()
    }

    pub fn hop_count(&self) -> usize {
        self.raw.len() / HOP_FIELD_LEN
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expiry <= now
    }

    /// True if the path traverses interface `ifid` of scope `ia`.
    pub fn crosses(&self, ia: Ia, ifid: IfId) -> bool {
        self.interfaces.iter().any(|i| i.ia == ia && i.ifid == ifid)
    }

    /// The same path travelled in the opposite direction.
    ///
    /// The next hop is cleared: the overlay address of the first router on
    /// the way back is only known to the receiver of the original packet.
    pub fn reversed(&self) -> Result<Path, PathError> {
        if self.raw.len() % HOP_FIELD_LEN != 0 {
            return Err(PathError::Malformed {
                len: self.raw.len(),
            });
        }
        let raw = self
            .raw
            .chunks_exact(HOP_FIELD_LEN)
            .rev()
            .flatten()
            .copied()
            .collect();
        let interfaces = self.interfaces.iter().rev().copied().collect();
        Ok(Path {
            raw,
            interfaces,
            mtu: self.mtu,
            expiry: self.expiry,
            next_hop: None,
        })
    }

    /// Content key over the interface sequence; two paths crossing the same
    /// interfaces share a fingerprint regardless of hop-field contents.
    pub fn fingerprint(&self) -> PathFingerprint {
        let mut hasher = blake3::Hasher::new();
        for intf in &self.interfaces {
            hasher.update(&intf.ia.raw().to_be_bytes());
            hasher.update(&intf.ifid.to_be_bytes());
        }
        *hasher.finalize().as_bytes()
    }
}

impl fmt::Display for Path {
    /// `Hops: [1-ff00:0:110 1>2 1-ff00:0:111] MTU: 1472`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Hops: [")?;
        if let Some(first) = self.interfaces.first() {
            write!(f, "{}", first.ia)?;
            for pair in self.interfaces.chunks(2) {
                match pair {
                    [out, inb] => write!(f, " {}>{} {}", out.ifid, inb.ifid, inb.ia)?,
                    [out] => write!(f, " {}>?", out.ifid)?,
                    _ => {}
                }
            }
        }
        write!(f, "] MTU: {}", self.mtu)
    }
}
