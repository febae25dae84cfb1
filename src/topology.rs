//! # Local Topology Snapshot
//!
//! Read-mostly view of the local scope consumed by the path service handlers:
//! the scope's own IA and core attribute, its border-router interfaces, and the
//! hosts offering each infrastructure service.
//!
//! Loading a topology from disk is left to the process that embeds this crate;
//! [`TopologyHandle`] lets it swap in a new snapshot while requests are in
//! flight. Readers always see a complete snapshot.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::addr::{AddrParseError, Ia, ServiceAddr};
use crate::error::LookupError;
use crate::path::{DEFAULT_MTU, IfId};
use crate::protocols::AsInspector;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceType {
    PathServer,
    BeaconServer,
    CertServer,
    Sig,
}

impl ServiceType {
    pub fn anycast(&self) -> ServiceAddr {
        match self {
            ServiceType::PathServer => ServiceAddr::PathServer,
            ServiceType::BeaconServer => ServiceAddr::BeaconServer,
            ServiceType::CertServer => ServiceAddr::CertServer,
            ServiceType::Sig => ServiceAddr::Sig,
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.anycast())
    }
}

impl FromStr for ServiceType {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<ServiceAddr>()? {
            ServiceAddr::PathServer => Ok(ServiceType::PathServer),
            ServiceAddr::BeaconServer => Ok(ServiceType::BeaconServer),
            ServiceAddr::CertServer => Ok(ServiceType::CertServer),
            ServiceAddr::Sig => Ok(ServiceType::Sig),
            ServiceAddr::None => Err(AddrParseError::UnknownService(s.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkType {
    Core,
    Parent,
    Child,
    Peer,
}

/// One border-router interface of the local scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IfInfo {
    /// Overlay address of the border router owning the interface.
    pub internal_addr: SocketAddr,
    pub remote_ia: Ia,
    pub link_type: LinkType,
    pub mtu: u16,
}

#[derive(Clone, Debug)]
pub struct Topology {
    pub ia: Ia,
    pub core: bool,
    pub mtu: u16,
    pub interfaces: BTreeMap<IfId, IfInfo>,
    pub services: HashMap<ServiceType, Vec<SocketAddr>>,
}

impl Topology {
    pub fn new(ia: Ia, core: bool) -> Self {
        Self {
            ia,
            core,
            mtu: DEFAULT_MTU,
            interfaces: BTreeMap::new(),
            services: HashMap::new(),
        }
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_interface(mut self, ifid: IfId, info: IfInfo) -> Self {
        self.interfaces.insert(ifid, info);
        self
    }

    pub fn with_service(mut self, svc: ServiceType, addr: SocketAddr) -> Self {
        self.services.entry(svc).or_default().push(addr);
        self
    }

    pub fn interface(&self, ifid: IfId) -> Option<&IfInfo> {
        self.interfaces.get(&ifid)
    }

    pub fn service_addrs(&self, svc: ServiceType) -> &[SocketAddr] {
        self.services.get(&svc).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Shared, swappable topology snapshot.
#[derive(Clone)]
pub struct TopologyHandle {
    current: Arc<RwLock<Arc<Topology>>>,
}

impl TopologyHandle {
    pub fn new(topo: Topology) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(topo))),
        }
    }

    pub fn snapshot(&self) -> Arc<Topology> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, topo: Topology) {
        if let Ok(mut guard) = self.current.write() {
            *guard = Arc::new(topo);
        }
    }

    pub fn ia(&self) -> Ia {
        self.snapshot().ia
    }
}

/// [`AsInspector`] backed by the topology snapshot plus a static table of
/// known remote scopes and their core attribute.
#[derive(Clone)]
pub struct TopologyInspector {
    topo: TopologyHandle,
    remote: HashMap<Ia, bool>,
}

impl TopologyInspector {
    pub fn new(topo: TopologyHandle) -> Self {
        Self {
            topo,
            remote: HashMap::new(),
        }
    }

    pub fn with_remote(mut self, ia: Ia, core: bool) -> Self {
        self.remote.insert(ia, core);
        self
    }
}

#[async_trait]
impl AsInspector for TopologyInspector {
    async fn is_core(&self, ia: Ia) -> Result<bool, LookupError> {
        let topo = self.topo.snapshot();
        if ia == topo.ia {
            return Ok(topo.core);
        }
        self.remote
            .get(&ia)
            .copied()
            .ok_or(LookupError::UnknownIa(ia))
    }
}
