//! # Dispatcher Registration
//!
//! A dispatcher demultiplexes datagrams for every socket of a host. Sockets
//! register a (scope, host, port) tuple, optionally also a bind overlay address
//! and a service anycast tag, and receive a [`PacketConn`] bound exclusively to
//! that registration.
//!
//! ## Implementations
//!
//! | Dispatcher | Use |
//! |------------|-----|
//! | [`LocalDispatcher`] | In-process demultiplexer; tests and single-process deployments |
//! | [`UdpDispatcher`] | Dispatcher bypass over plain UDP sockets; used by the binary |
//!
//! ## SCMP Liveness
//!
//! Protocol-error notifications (SCMP) are never returned from a send. They
//! are queued on the socket and surface from its receive path. A socket that
//! lets more than [`MAX_UNDRAINED_SCMP`] notifications pile up is reclaimed
//! by the [`LocalDispatcher`]: write-only users must still receive.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

use crate::addr::{Addr, HostAddr, Ia, ServiceAddr};
use crate::error::{ConnError, RegistrationError};
use crate::messages::{deserialize_bounded, MAX_PLD_SIZE};
use crate::path::IfId;

// ============================================================================
// Constants
// ============================================================================

/// First port handed out when a caller asks for port 0.
pub const FIRST_DYNAMIC_PORT: u16 = 30041;

/// SCMP notifications a socket may leave undrained before it is reclaimed.
pub const MAX_UNDRAINED_SCMP: usize = 64;

/// Per-socket receive queue depth. Datagrams beyond it are dropped.
const SOCKET_QUEUE_CAPACITY: usize = 1024;

/// Prefix of every frame sent by [`UdpDispatcher`].
const FRAME_MAGIC: [u8; 4] = *b"PNT1";

/// Receive buffer for one UDP frame: payload plus addressing overhead.
const MAX_FRAME_SIZE: usize = MAX_PLD_SIZE + 4096;

// ============================================================================
// Packets
// ============================================================================

/// Protocol-error notification delivered on a socket's receive path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScmpNotification {
    /// A border router reports that an interface on the path is revoked.
    InterfaceRevoked { ia: Ia, ifid: IfId },
    /// Nothing is registered at the destination.
    DestinationUnreachable { dst: String },
}

impl fmt::Display for ScmpNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScmpNotification::InterfaceRevoked { ia, ifid } => {
                write!(f, "interface {}#{} revoked", ia, ifid)
            }
            ScmpNotification::DestinationUnreachable { dst } => {
                write!(f, "destination {} unreachable", dst)
            }
        }
    }
}

/// A datagram with its scoped addressing. `dst.path` is the forwarding path;
/// on receipt `src.path` is the path the packet arrived on and `src.next_hop`
/// the overlay address it came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub src: Addr,
    pub dst: Addr,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delivery {
    Data(Packet),
    Scmp(ScmpNotification),
}

// ============================================================================
// Traits
// ============================================================================

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Register `host` (IP and port, 0 = any) in scope `ia`. Returns the socket
    /// and the port actually assigned. A zero `timeout` waits indefinitely.
    async fn register(
        &self,
        ia: Ia,
        host: HostAddr,
        bind: Option<SocketAddr>,
        svc: ServiceAddr,
        timeout: Duration,
    ) -> Result<(Box<dyn PacketConn>, u16), RegistrationError>;
}

#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn send(&self, packet: Packet) -> Result<(), ConnError>;

    async fn recv(&self) -> Result<Delivery, ConnError>;

    /// Release the registration. Pending and future receives fail with `Closed`.
    async fn close(&self);
}

async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, RegistrationError>
where
    F: Future<Output = Result<T, RegistrationError>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| RegistrationError::Timeout(timeout))?
}

// ============================================================================
// Local Dispatcher
// ============================================================================

type SocketId = u64;
type HostKey = (Ia, IpAddr, u16);

struct SocketEntry {
    tx: mpsc::Sender<Delivery>,
    undrained: Arc<AtomicUsize>,
    hosts: Vec<HostKey>,
    svc: Option<(Ia, ServiceAddr)>,
}

struct LocalState {
    next_id: SocketId,
    next_port: u16,
    hosts: HashMap<HostKey, SocketId>,
    services: HashMap<(Ia, ServiceAddr), Vec<SocketId>>,
    sockets: HashMap<SocketId, SocketEntry>,
}

impl LocalState {
    fn allocate_port(&mut self, ia: Ia, ip: IpAddr) -> Option<u16> {
        let span = u32::from(u16::MAX - FIRST_DYNAMIC_PORT) + 1;
        for _ in 0..span {
            let port = self.next_port;
            self.next_port = if port == u16::MAX {
                FIRST_DYNAMIC_PORT
            } else {
                port + 1
            };
            if !self.hosts.contains_key(&(ia, ip, port)) {
                return Some(port);
            }
        }
        None
    }

    fn unregister(&mut self, id: SocketId) -> bool {
        let Some(entry) = self.sockets.remove(&id) else {
            return false;
        };
        for key in &entry.hosts {
            self.hosts.remove(key);
        }
        if let Some(svc) = entry.svc
            && let Some(ids) = self.services.get_mut(&svc)
        {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.services.remove(&svc);
            }
        }
        true
    }

    fn lookup(&self, dst: &Addr) -> Option<SocketId> {
        let host = dst.host?;
        if let Some(svc) = host.service() {
            return self.services.get(&(dst.ia, svc))?.first().copied();
        }
        let sock = host.socket_addr()?;
        self.hosts.get(&(dst.ia, sock.ip(), sock.port())).copied()
    }

    /// Queue a notification on `id`, reclaiming the socket once too many are undrained.
    fn push_scmp(&mut self, id: SocketId, notification: ScmpNotification) {
        let Some(entry) = self.sockets.get(&id) else {
            return;
        };
        let pending = entry.undrained.fetch_add(1, Ordering::SeqCst) + 1;
        if pending > MAX_UNDRAINED_SCMP {
            warn!(socket = id, pending, "reclaiming socket with undrained SCMP notifications");
            self.unregister(id);
            return;
        }
        if entry.tx.try_send(Delivery::Scmp(notification)).is_err() {
            entry.undrained.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// In-process dispatcher. Cheap to clone; clones share registrations.
#[derive(Clone)]
pub struct LocalDispatcher {
    state: Arc<Mutex<LocalState>>,
}

impl Default for LocalDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalDispatcher {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LocalState {
                next_id: 1,
                next_port: FIRST_DYNAMIC_PORT,
                hosts: HashMap::new(),
                services: HashMap::new(),
                sockets: HashMap::new(),
            })),
        }
    }

    /// Number of live registrations.
    pub fn registrations(&self) -> usize {
        self.state.lock().map(|s| s.sockets.len()).unwrap_or(0)
    }

    /// Deliver a notification to whatever socket is registered at `dst`,
    /// as a border router would. Returns `false` if nothing is registered there.
    pub fn inject_scmp(&self, dst: &Addr, notification: ScmpNotification) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        match state.lookup(dst) {
            Some(id) => {
                state.push_scmp(id, notification);
                true
            }
            None => false,
        }
    }

    fn register_now(
        &self,
        ia: Ia,
        host: HostAddr,
        bind: Option<SocketAddr>,
        svc: ServiceAddr,
    ) -> Result<(Box<dyn PacketConn>, u16), RegistrationError> {
        let Some(ip) = host.l3.and_then(|l3| l3.ip()) else {
            return Err(RegistrationError::Unavailable(format!(
                "host {} has no IP address",
                host
            )));
        };
        let mut state = self
            .state
            .lock()
            .map_err(|_| RegistrationError::Unavailable("dispatcher state poisoned".to_string()))?;

        let requested = host.port().unwrap_or(0);
        let port = if requested == 0 {
            state
                .allocate_port(ia, ip)
                .ok_or_else(|| RegistrationError::PortsExhausted(format!("{},[{}]", ia, ip)))?
        } else {
            requested
        };

        let mut hosts = vec![(ia, ip, port)];
        if let Some(bind) = bind {
            let bind_port = if bind.port() == 0 { port } else { bind.port() };
            let key = (ia, bind.ip(), bind_port);
            if !hosts.contains(&key) {
                hosts.push(key);
            }
        }
        for (key_ia, key_ip, key_port) in &hosts {
            if state.hosts.contains_key(&(*key_ia, *key_ip, *key_port)) {
                return Err(RegistrationError::AddressInUse(format!(
                    "{},[{}]:{}",
                    key_ia, key_ip, key_port
                )));
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = mpsc::channel(SOCKET_QUEUE_CAPACITY);
        let undrained = Arc::new(AtomicUsize::new(0));
        for key in &hosts {
            state.hosts.insert(*key, id);
        }
        let svc_key = (!svc.is_none()).then_some((ia, svc));
        if let Some(key) = svc_key {
            state.services.entry(key).or_default().push(id);
        }
        state.sockets.insert(
            id,
            SocketEntry {
                tx,
                undrained: undrained.clone(),
                hosts,
                svc: svc_key,
            },
        );
        debug!(socket = id, ia = %ia, ip = %ip, port, svc = %svc, "registered socket");

        let conn = LocalPacketConn {
            id,
            state: self.state.clone(),
            rx: tokio::sync::Mutex::new(rx),
            undrained,
        };
        Ok((Box::new(conn), port))
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn register(
        &self,
        ia: Ia,
        host: HostAddr,
        bind: Option<SocketAddr>,
        svc: ServiceAddr,
        timeout: Duration,
    ) -> Result<(Box<dyn PacketConn>, u16), RegistrationError> {
        with_timeout(timeout, async { self.register_now(ia, host, bind, svc) }).await
    }
}

struct LocalPacketConn {
    id: SocketId,
    state: Arc<Mutex<LocalState>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Delivery>>,
    undrained: Arc<AtomicUsize>,
}

impl LocalPacketConn {
    fn unregister(&self) {
        if let Ok(mut state) = self.state.lock()
            && state.unregister(self.id)
        {
            debug!(socket = self.id, "unregistered socket");
        }
    }
}

#[async_trait]
impl PacketConn for LocalPacketConn {
    async fn send(&self, packet: Packet) -> Result<(), ConnError> {
        let Ok(mut state) = self.state.lock() else {
            return Err(ConnError::Closed);
        };
        if !state.sockets.contains_key(&self.id) {
            return Err(ConnError::Closed);
        }
        let Some(dst_id) = state.lookup(&packet.dst) else {
            trace!(socket = self.id, dst = %packet.dst, "no registration at destination");
            let dst = packet.dst.to_string();
            state.push_scmp(self.id, ScmpNotification::DestinationUnreachable { dst });
            return Ok(());
        };
        let Some(entry) = state.sockets.get(&dst_id) else {
            return Ok(());
        };
        let mut packet = packet;
        packet.src.path = packet.dst.path.take();
        packet.src.next_hop = None;
        if entry.tx.try_send(Delivery::Data(packet)).is_err() {
            trace!(socket = dst_id, "receive queue full, dropping datagram");
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Delivery, ConnError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(Delivery::Scmp(notification)) => {
                let _ = self
                    .undrained
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
                Ok(Delivery::Scmp(notification))
            }
            Some(delivery) => Ok(delivery),
            None => Err(ConnError::Closed),
        }
    }

    async fn close(&self) {
        self.unregister();
    }
}

impl Drop for LocalPacketConn {
    fn drop(&mut self) {
        self.unregister();
    }
}

// ============================================================================
// UDP Dispatcher Bypass
// ============================================================================

fn encode_frame(packet: &Packet) -> Result<Vec<u8>, bincode::Error> {
    let body = bincode::serialize(packet)?;
    let mut out = Vec::with_capacity(FRAME_MAGIC.len() + body.len());
    out.extend_from_slice(&FRAME_MAGIC);
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode_frame(data: &[u8]) -> Option<Packet> {
    let body = data.strip_prefix(&FRAME_MAGIC[..])?;
    deserialize_bounded(body).ok()
}

/// Dispatcher bypass: every registration binds its own UDP socket and
/// frames are exchanged directly between overlay addresses.
///
/// There is no shared demultiplexer, so service anycast is resolved through
/// a static table of known service addresses.
#[derive(Clone, Default)]
pub struct UdpDispatcher {
    services: Arc<HashMap<(Ia, ServiceAddr), SocketAddr>>,
}

impl UdpDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, ia: Ia, svc: ServiceAddr, addr: SocketAddr) -> Self {
        Arc::make_mut(&mut self.services).insert((ia, svc), addr);
        self
    }
}

#[async_trait]
impl Dispatcher for UdpDispatcher {
    async fn register(
        &self,
        ia: Ia,
        host: HostAddr,
        bind: Option<SocketAddr>,
        svc: ServiceAddr,
        timeout: Duration,
    ) -> Result<(Box<dyn PacketConn>, u16), RegistrationError> {
        let public = host.socket_addr().ok_or_else(|| {
            RegistrationError::Unavailable(format!("host {} has no IP address", host))
        })?;
        let bind_addr = bind.unwrap_or(public);

        let socket = with_timeout(timeout, async {
            UdpSocket::bind(bind_addr).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::AddrInUse {
                    RegistrationError::AddressInUse(bind_addr.to_string())
                } else {
                    RegistrationError::Io(e)
                }
            })
        })
        .await?;

        let bound = socket.local_addr()?;
        let port = if bind.is_some() && public.port() != 0 {
            public.port()
        } else {
            bound.port()
        };
        debug!(ia = %ia, public = %public, bound = %bound, port, svc = %svc, "bound UDP socket");

        let conn = UdpPacketConn {
            socket,
            services: self.services.clone(),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        };
        Ok((Box::new(conn), port))
    }
}

struct UdpPacketConn {
    socket: UdpSocket,
    services: Arc<HashMap<(Ia, ServiceAddr), SocketAddr>>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl UdpPacketConn {
    fn overlay_target(&self, dst: &Addr) -> Option<SocketAddr> {
        if let Some(next_hop) = dst.next_hop {
            return Some(next_hop);
        }
        if let Some(next_hop) = dst.path.as_ref().and_then(|p| p.next_hop()) {
            return Some(next_hop);
        }
        let host = dst.host?;
        match host.service() {
            Some(svc) => self.services.get(&(dst.ia, svc)).copied(),
            None => host.socket_addr(),
        }
    }
}

#[async_trait]
impl PacketConn for UdpPacketConn {
    async fn send(&self, packet: Packet) -> Result<(), ConnError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnError::Closed);
        }
        let target = self.overlay_target(&packet.dst).ok_or(ConnError::NoHost)?;
        let frame = encode_frame(&packet)?;
        self.socket.send_to(&frame, target).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Delivery, ConnError> {
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        loop {
            let shutdown = self.shutdown.notified();
            if self.closed.load(Ordering::SeqCst) {
                return Err(ConnError::Closed);
            }
            let (len, from) = tokio::select! {
                _ = shutdown => return Err(ConnError::Closed),
                res = self.socket.recv_from(&mut buf) => res?,
            };
            match decode_frame(&buf[..len]) {
                Some(mut packet) => {
                    packet.src.path = packet.dst.path.take();
                    packet.src.next_hop = Some(from);
                    return Ok(Delivery::Data(packet));
                }
                None => {
                    trace!(from = %from, len, "dropping undecodable frame");
                }
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }
}
