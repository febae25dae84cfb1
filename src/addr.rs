//! # Scoped Addressing
//!
//! Value types identifying scopes and endpoints:
//!
//! - [`Ia`]: the (isolation domain, autonomous system) pair that scopes every address
//! - [`L3Addr`] / [`L4Info`]: network- and transport-layer parts of a host address
//! - [`HostAddr`]: an AS-local host (IP or service anycast) with an optional port
//! - [`Addr`]: a full endpoint, optionally carrying a [`Path`] and an overlay next hop
//! - [`NetFamily`]: the network family requested by dial/listen callers
//!
//! ## Text Formats
//!
//! | Type | Example |
//! |------|---------|
//! | `Ia` | `1-ff00:0:110`, `2-64512` |
//! | `Addr` | `1-ff00:0:110,[192.0.2.1]:30041`, `1-ff00:0:110,PS` |
//!
//! AS numbers up to 2^32-1 are written in decimal, larger ones as three
//! colon-separated 16-bit hex groups.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::path::{Path, PathError};

/// Largest AS number representable in the 48-bit AS field.
pub const MAX_ASN: u64 = (1 << 48) - 1;

/// AS numbers at or below this value are printed in decimal (BGP-compatible).
const MAX_BGP_ASN: u64 = u32::MAX as u64;

const ASN_GROUP_BITS: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrParseError {
    #[error("invalid ISD-AS {0:?}")]
    InvalidIa(String),
    #[error("invalid host {0:?}")]
    InvalidHost(String),
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("missing ',' between ISD-AS and host in {0:?}")]
    MissingSeparator(String),
    #[error("unknown service {0:?}")]
    UnknownService(String),
    #[error("unknown network family {0:?}")]
    UnknownFamily(String),
}

// ============================================================================
// ISD-AS
// ============================================================================

/// Scope identifier: isolation domain plus autonomous system.
///
/// The all-zero value means "unset"; [`crate::network::NetworkContext`] fills
/// it in with its own local scope.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ia {
    isd: u16,
    asn: u64,
}

impl Ia {
    pub const ZERO: Ia = Ia { isd: 0, asn: 0 };

    /// Build a scope; AS numbers are truncated to 48 bits.
    pub const fn new(isd: u16, asn: u64) -> Self {
        Self { isd, asn: asn & MAX_ASN }
    }

    pub fn isd(&self) -> u16 {
        self.isd
    }

    pub fn asn(&self) -> u64 {
        self.asn
    }

    pub fn is_zero(&self) -> bool {
        self.isd == 0 && self.asn == 0
    }

    /// Packed wire form: `isd << 48 | asn`.
    pub fn raw(&self) -> u64 {
        (u64::from(self.isd) << 48) | self.asn
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            isd: (raw >> 48) as u16,
            asn: raw & MAX_ASN,
        }
    }
}

impl fmt::Display for Ia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.asn <= MAX_BGP_ASN {
            return write!(f, "{}-{}", self.isd, self.asn);
        }
        let mask = (1u64 << ASN_GROUP_BITS) - 1;
        write!(
            f,
            "{}-{:x}:{:x}:{:x}",
            self.isd,
            (self.asn >> (2 * ASN_GROUP_BITS)) & mask,
            (self.asn >> ASN_GROUP_BITS) & mask,
            self.asn & mask,
        )
    }
}

impl fmt::Debug for Ia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ia({})", self)
    }
}

impl FromStr for Ia {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AddrParseError::InvalidIa(s.to_string());
        let (isd_part, asn_part) = s.split_once('-').ok_or_else(invalid)?;
        let isd: u16 = isd_part.parse().map_err(|_| invalid())?;

        let asn = if asn_part.contains(':') {
            let groups: Vec<&str> = asn_part.split(':').collect();
            if groups.len() != 3 {
                return Err(invalid());
            }
            let mut asn = 0u64;
            for group in groups {
                if group.is_empty() || group.len() > 4 {
                    return Err(invalid());
                }
                let value = u16::from_str_radix(group, 16).map_err(|_| invalid())?;
                asn = (asn << ASN_GROUP_BITS) | u64::from(value);
            }
            asn
        } else {
            let asn: u64 = asn_part.parse().map_err(|_| invalid())?;
            if asn > MAX_BGP_ASN {
                return Err(invalid());
            }
            asn
        };

        Ok(Ia::new(isd, asn))
    }
}

// ============================================================================
// Service Anycast
// ============================================================================

/// Service anycast tags a socket can additionally register for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceAddr {
    #[default]
    None,
    PathServer,
    BeaconServer,
    CertServer,
    Sig,
}

impl ServiceAddr {
    pub fn is_none(&self) -> bool {
        matches!(self, ServiceAddr::None)
    }
}

impl fmt::Display for ServiceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceAddr::None => "NONE",
            ServiceAddr::PathServer => "PS",
            ServiceAddr::BeaconServer => "BS",
            ServiceAddr::CertServer => "CS",
            ServiceAddr::Sig => "SIG",
        };
        f.write_str(name)
    }
}

impl FromStr for ServiceAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(ServiceAddr::None),
            "PS" => Ok(ServiceAddr::PathServer),
            "BS" => Ok(ServiceAddr::BeaconServer),
            "CS" => Ok(ServiceAddr::CertServer),
            "SIG" => Ok(ServiceAddr::Sig),
            _ => Err(AddrParseError::UnknownService(s.to_string())),
        }
    }
}

// ============================================================================
// Host Addresses
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum L3Type {
    Ipv4,
    Ipv6,
    Svc,
}

impl fmt::Display for L3Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            L3Type::Ipv4 => f.write_str("IPv4"),
            L3Type::Ipv6 => f.write_str("IPv6"),
            L3Type::Svc => f.write_str("SVC"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum L3Addr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Svc(ServiceAddr),
}

impl L3Addr {
    pub fn ty(&self) -> L3Type {
        match self {
            L3Addr::Ipv4(_) => L3Type::Ipv4,
            L3Addr::Ipv6(_) => L3Type::Ipv6,
            L3Addr::Svc(_) => L3Type::Svc,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            L3Addr::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            L3Addr::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            L3Addr::Svc(_) => None,
        }
    }

    /// True for `0.0.0.0` and `::`. Service addresses are never unspecified.
    pub fn is_unspecified(&self) -> bool {
        self.ip().is_some_and(|ip| ip.is_unspecified())
    }
}

impl From<IpAddr> for L3Addr {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => L3Addr::Ipv4(v4),
            IpAddr::V6(v6) => L3Addr::Ipv6(v6),
        }
    }
}

impl fmt::Display for L3Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            L3Addr::Ipv4(ip) => write!(f, "{}", ip),
            L3Addr::Ipv6(ip) => write!(f, "{}", ip),
            L3Addr::Svc(svc) => write!(f, "{}", svc),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum L4Type {
    Udp,
    Tcp,
}

impl fmt::Display for L4Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            L4Type::Udp => f.write_str("UDP"),
            L4Type::Tcp => f.write_str("TCP"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum L4Info {
    Udp(u16),
    Tcp(u16),
}

impl L4Info {
    pub fn ty(&self) -> L4Type {
        match self {
            L4Info::Udp(_) => L4Type::Udp,
            L4Info::Tcp(_) => L4Type::Tcp,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            L4Info::Udp(port) | L4Info::Tcp(port) => *port,
        }
    }

    pub fn with_port(&self, port: u16) -> Self {
        match self {
            L4Info::Udp(_) => L4Info::Udp(port),
            L4Info::Tcp(_) => L4Info::Tcp(port),
        }
    }
}

/// An AS-local host. Both parts are optional because callers may leave them
/// unset; binding validates their presence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAddr {
    pub l3: Option<L3Addr>,
    pub l4: Option<L4Info>,
}

impl HostAddr {
    pub fn new(l3: L3Addr, l4: Option<L4Info>) -> Self {
        Self { l3: Some(l3), l4 }
    }

    pub fn udp(addr: SocketAddr) -> Self {
        Self {
            l3: Some(L3Addr::from(addr.ip())),
            l4: Some(L4Info::Udp(addr.port())),
        }
    }

    pub fn svc(svc: ServiceAddr) -> Self {
        Self {
            l3: Some(L3Addr::Svc(svc)),
            l4: None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        self.l4.map(|l4| l4.port())
    }

    /// Overlay socket address, when the host is an IP host with a port.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip = self.l3?.ip()?;
        Some(SocketAddr::new(ip, self.port().unwrap_or(0)))
    }

    pub fn service(&self) -> Option<ServiceAddr> {
        match self.l3 {
            Some(L3Addr::Svc(svc)) => Some(svc),
            _ => None,
        }
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.l3, self.l4) {
            (Some(L3Addr::Svc(svc)), _) => write!(f, "{}", svc),
            (Some(l3), Some(l4)) => write!(f, "[{}]:{}", l3, l4.port()),
            (Some(l3), None) => write!(f, "[{}]", l3),
            (None, Some(l4)) => write!(f, "[<nil>]:{}", l4.port()),
            (None, None) => f.write_str("<nil>"),
        }
    }
}

// ============================================================================
// Full Address
// ============================================================================

/// A scoped endpoint.
///
/// `path` and `next_hop` are only meaningful for remote destinations: the
/// path is attached to outgoing packets and the next hop is the overlay
/// address of the first border router on that path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addr {
    pub ia: Ia,
    pub host: Option<HostAddr>,
    pub path: Option<Path>,
    pub next_hop: Option<SocketAddr>,
}

impl Addr {
    pub fn new(ia: Ia, host: HostAddr) -> Self {
        Self {
            ia,
            host: Some(host),
            path: None,
            next_hop: None,
        }
    }

    pub fn udp(ia: Ia, addr: SocketAddr) -> Self {
        Self::new(ia, HostAddr::udp(addr))
    }

    pub fn svc(ia: Ia, svc: ServiceAddr) -> Self {
        Self::new(ia, HostAddr::svc(svc))
    }

    pub fn with_path(mut self, path: Path) -> Self {
        self.next_hop = path.next_hop().or(self.next_hop);
        self.path = Some(path);
        self
    }

    pub fn port(&self) -> Option<u16> {
        self.host.and_then(|h| h.port())
    }

    /// Address for answering a packet received from `self`: the arrival path
    /// reversed, sent back through the overlay address it came from.
    pub fn reply_addr(&self) -> Result<Addr, PathError> {
        Ok(Addr {
            ia: self.ia,
            host: self.host,
            path: self.path.as_ref().map(Path::reversed).transpose()?,
            next_hop: self.next_hop,
        })
    }

    /// Same endpoint without path or next hop; used as a demultiplexing key.
    pub fn endpoint(&self) -> Addr {
        Addr {
            ia: self.ia,
            host: self.host,
            path: None,
            next_hop: None,
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{},{}", self.ia, host),
            None => write!(f, "{},<nil>", self.ia),
        }
    }
}

impl FromStr for Addr {
    type Err = AddrParseError;

    /// Parses `ISD-AS,[IP]:port`, `ISD-AS,IPv4:port`, `ISD-AS,[IP]` or `ISD-AS,SVC`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ia_part, host_part) = s
            .split_once(',')
            .ok_or_else(|| AddrParseError::MissingSeparator(s.to_string()))?;
        let ia: Ia = ia_part.trim().parse()?;
        let host = parse_host(host_part.trim())?;
        Ok(Addr::new(ia, host))
    }
}

fn parse_host(s: &str) -> Result<HostAddr, AddrParseError> {
    if let Some(rest) = s.strip_prefix('[') {
        let (ip_part, after) = rest
            .split_once(']')
            .ok_or_else(|| AddrParseError::InvalidHost(s.to_string()))?;
        let ip: IpAddr = ip_part
            .parse()
            .map_err(|_| AddrParseError::InvalidHost(s.to_string()))?;
        let l4 = match after.strip_prefix(':') {
            Some(port) => Some(L4Info::Udp(
                port.parse()
                    .map_err(|_| AddrParseError::InvalidPort(port.to_string()))?,
            )),
            None if after.is_empty() => None,
            None => return Err(AddrParseError::InvalidHost(s.to_string())),
        };
        return Ok(HostAddr::new(L3Addr::from(ip), l4));
    }

    if let Ok(sock) = s.parse::<SocketAddr>() {
        return Ok(HostAddr::udp(sock));
    }
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(HostAddr::new(L3Addr::from(ip), None));
    }
    s.parse::<ServiceAddr>()
        .map(HostAddr::svc)
        .map_err(|_| AddrParseError::InvalidHost(s.to_string()))
}

// ============================================================================
// Network Family
// ============================================================================

/// Network family named by dial/listen callers (`"udp4"`, `"udp6"`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NetFamily {
    Udp4,
    Udp6,
}

impl NetFamily {
    pub fn l3_type(&self) -> L3Type {
        match self {
            NetFamily::Udp4 => L3Type::Ipv4,
            NetFamily::Udp6 => L3Type::Ipv6,
        }
    }

    pub fn l4_type(&self) -> L4Type {
        L4Type::Udp
    }

    /// L4 used when the caller leaves it unset: port 0, "assign any".
    pub fn default_l4(&self) -> L4Info {
        L4Info::Udp(0)
    }
}

impl fmt::Display for NetFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetFamily::Udp4 => f.write_str("udp4"),
            NetFamily::Udp6 => f.write_str("udp6"),
        }
    }
}

impl FromStr for NetFamily {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp4" => Ok(NetFamily::Udp4),
            "udp6" => Ok(NetFamily::Udp6),
            _ => Err(AddrParseError::UnknownFamily(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ia_parse_and_display_hex_asn() {
        let ia: Ia = "1-ff00:0:110".parse().unwrap();
        assert_eq!(ia.isd(), 1);
        assert_eq!(ia.asn(), 0xff00_0000_0110);
        assert_eq!(ia.to_string(), "1-ff00:0:110");
    }

    #[test]
    fn ia_parse_and_display_bgp_asn() {
        let ia: Ia = "2-64512".parse().unwrap();
        assert_eq!(ia, Ia::new(2, 64512));
        assert_eq!(ia.to_string(), "2-64512");
    }

    #[test]
    fn ia_rejects_malformed() {
        for bad in ["", "1", "1-", "-5", "1-ff00:0", "1-ff00:0:110:1", "1-fffff:0:1", "70000-1", "1-4294967296"] {
            assert!(bad.parse::<Ia>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn ia_raw_packing() {
        let ia: Ia = "1-ff00:0:110".parse().unwrap();
        assert_eq!(ia.raw(), (1u64 << 48) | 0xff00_0000_0110);
        assert_eq!(Ia::from_raw(ia.raw()), ia);
        assert!(Ia::ZERO.is_zero());
        assert!(!ia.is_zero());
        assert_eq!(Ia::from_raw(0), Ia::ZERO);
    }

    #[test]
    fn addr_parse_bracketed_v4() {
        let addr: Addr = "1-ff00:0:110,[192.0.2.1]:30041".parse().unwrap();
        assert_eq!(addr.ia.to_string(), "1-ff00:0:110");
        let host = addr.host.unwrap();
        assert_eq!(host.l3, Some(L3Addr::Ipv4(Ipv4Addr::new(192, 0, 2, 1))));
        assert_eq!(host.l4, Some(L4Info::Udp(30041)));
        assert_eq!(addr.to_string(), "1-ff00:0:110,[192.0.2.1]:30041");
    }

    #[test]
    fn addr_parse_without_port_leaves_l4_unset() {
        let addr: Addr = "1-ff00:0:110,[192.0.2.1]".parse().unwrap();
        assert_eq!(addr.host.unwrap().l4, None);
    }

    #[test]
    fn addr_parse_v6_and_service() {
        let v6: Addr = "1-ff00:0:110,[2001:db8::1]:8080".parse().unwrap();
        assert_eq!(v6.host.unwrap().l3.unwrap().ty(), L3Type::Ipv6);

        let svc: Addr = "1-ff00:0:110,PS".parse().unwrap();
        assert_eq!(svc.host.unwrap().service(), Some(ServiceAddr::PathServer));
        assert_eq!(svc.to_string(), "1-ff00:0:110,PS");
    }

    #[test]
    fn addr_parse_errors() {
        assert!(matches!(
            "1-ff00:0:110".parse::<Addr>(),
            Err(AddrParseError::MissingSeparator(_))
        ));
        assert!(matches!(
            "1-ff00:0:110,[nope]:1".parse::<Addr>(),
            Err(AddrParseError::InvalidHost(_))
        ));
        assert!(matches!(
            "1-ff00:0:110,[192.0.2.1]:99999".parse::<Addr>(),
            Err(AddrParseError::InvalidPort(_))
        ));
    }

    #[test]
    fn unspecified_detection() {
        assert!(L3Addr::Ipv4(Ipv4Addr::UNSPECIFIED).is_unspecified());
        assert!(L3Addr::Ipv6(Ipv6Addr::UNSPECIFIED).is_unspecified());
        assert!(!L3Addr::Ipv4(Ipv4Addr::LOCALHOST).is_unspecified());
        assert!(!L3Addr::Svc(ServiceAddr::PathServer).is_unspecified());
    }

    #[test]
    fn net_family_parse() {
        assert_eq!("udp4".parse::<NetFamily>().unwrap(), NetFamily::Udp4);
        assert_eq!("udp6".parse::<NetFamily>().unwrap(), NetFamily::Udp6);
        assert!("tcp".parse::<NetFamily>().is_err());
        assert_eq!(NetFamily::Udp4.default_l4(), L4Info::Udp(0));
    }
}
