//! # Connections
//!
//! A [`Connection`] is a dispatcher registration plus the addressing needed
//! to use it. It is created by [`crate::NetworkContext`] in one of two modes:
//!
//! | Mode | Remote | Valid operations |
//! |------|--------|------------------|
//! | dialed | fixed | `read`, `write` |
//! | listening | per datagram | `read_from`, `write_to` |
//!
//! ## Path Selection on Send
//!
//! 1. An explicit path on the destination address is used as-is.
//! 2. Destinations in the local scope get the empty local path.
//! 3. Otherwise the first path from the resolver is used; without a
//!    resolver the send fails with [`ConnError::NoPath`].
//!
//! SCMP notifications surface as [`ConnError::Scmp`] from the receive
//! operations. Interface revocations are also forwarded to the resolver.
//!
//! ## Draining
//!
//! Notifications queue on the socket until received. A connection that only
//! writes must still keep calling `read` or `read_from`: once more than
//! [`crate::MAX_UNDRAINED_SCMP`] notifications are left undrained, the
//! dispatcher reclaims the socket and later operations fail with
//! [`ConnError::Closed`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::addr::{Addr, Ia, NetFamily, ServiceAddr};
use crate::dispatcher::{Delivery, Packet, PacketConn, ScmpNotification};
use crate::error::ConnError;
use crate::messages::{serialize_pld, Pld};
use crate::path::{Path, DEFAULT_MTU};
use crate::protocols::ReplySink;
use crate::resolver::PathResolver;

struct ConnInner {
    family: NetFamily,
    local: Addr,
    remote: Option<Addr>,
    bind: Option<Addr>,
    svc: ServiceAddr,
    socket: Box<dyn PacketConn>,
    resolver: Option<PathResolver>,
    closed: AtomicBool,
}

/// Handle to a registered socket. Cheap to clone; clones share the socket.
///
/// Receives must be drained even by write-only users, or the dispatcher
/// reclaims the socket after [`crate::MAX_UNDRAINED_SCMP`] notifications.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.inner.local.to_string())
            .field("remote", &self.inner.remote.as_ref().map(|r| r.to_string()))
            .field("svc", &self.inner.svc)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        family: NetFamily,
        local: Addr,
        remote: Option<Addr>,
        bind: Option<Addr>,
        svc: ServiceAddr,
        socket: Box<dyn PacketConn>,
        resolver: Option<PathResolver>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                family,
                local,
                remote,
                bind,
                svc,
                socket,
                resolver,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn family(&self) -> NetFamily {
        self.inner.family
    }

    pub fn local_addr(&self) -> &Addr {
        &self.inner.local
    }

    pub fn remote_addr(&self) -> Option<&Addr> {
        self.inner.remote.as_ref()
    }

    pub fn bind_addr(&self) -> Option<&Addr> {
        self.inner.bind.as_ref()
    }

    pub fn svc(&self) -> ServiceAddr {
        self.inner.svc
    }

    pub fn is_dialed(&self) -> bool {
        self.inner.remote.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Send to the dialed peer.
    ///
    /// Writing does not consume SCMP notifications; a write-only caller must
    /// also drain `read` or the socket is reclaimed.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, ConnError> {
        let remote = self.inner.remote.as_ref().ok_or(ConnError::NotDialed)?;
        self.send(buf, remote).await
    }

    /// Send to `dst`. Only valid on listening connections.
    ///
    /// As with [`Connection::write`], `read_from` must still be drained.
    pub async fn write_to(&self, buf: &[u8], dst: &Addr) -> Result<usize, ConnError> {
        if self.is_dialed() {
            return Err(ConnError::Dialed);
        }
        self.send(buf, dst).await
    }

    /// Receive the next datagram from the dialed peer's socket.
    pub async fn read(&self) -> Result<Vec<u8>, ConnError> {
        if !self.is_dialed() {
            return Err(ConnError::NotDialed);
        }
        let (payload, _) = self.recv().await?;
        Ok(payload)
    }

    /// Receive the next datagram and its source. Only valid on listening connections.
    ///
    /// The source carries the path the datagram arrived on; use
    /// [`Addr::reply_addr`] to answer it.
    pub async fn read_from(&self) -> Result<(Vec<u8>, Addr), ConnError> {
        if self.is_dialed() {
            return Err(ConnError::Dialed);
        }
        self.recv().await
    }

    /// Release the dispatcher registration. Later operations fail with `Closed`.
    pub async fn close(&self) -> Result<(), ConnError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(ConnError::Closed);
        }
        self.inner.socket.close().await;
        debug!(local = %self.inner.local, "connection closed");
        Ok(())
    }

    async fn send(&self, buf: &[u8], dst: &Addr) -> Result<usize, ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        let host = dst.host.ok_or(ConnError::NoHost)?;
        let local = &self.inner.local;
        let ia = if dst.ia.is_zero() { local.ia } else { dst.ia };
        let path = self.resolve_path(dst, ia).await?;
        let next_hop = dst.next_hop.or(path.next_hop());

        let packet = Packet {
            src: local.endpoint(),
            dst: Addr {
                ia,
                host: Some(host),
                path: Some(path),
                next_hop,
            },
            payload: buf.to_vec(),
        };
        self.inner.socket.send(packet).await?;
        trace!(dst = %dst, len = buf.len(), "sent datagram");
        Ok(buf.len())
    }

    async fn resolve_path(&self, dst: &Addr, dst_ia: Ia) -> Result<Path, ConnError> {
        if let Some(path) = &dst.path {
            return Ok(path.clone());
        }
        if dst_ia == self.inner.local.ia {
            return Ok(Path::local(DEFAULT_MTU));
        }
        let resolver = self.inner.resolver.as_ref().ok_or(ConnError::NoPath(dst_ia))?;
        resolver
            .query(self.inner.local.ia, dst_ia, 1, false)
            .await?
            .into_iter()
            .next()
            .ok_or(ConnError::NoPath(dst_ia))
    }

    async fn recv(&self) -> Result<(Vec<u8>, Addr), ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        match self.inner.socket.recv().await? {
            Delivery::Data(packet) => Ok((packet.payload, packet.src)),
            Delivery::Scmp(notification) => {
                if let ScmpNotification::InterfaceRevoked { ia, ifid } = &notification
                    && let Some(resolver) = &self.inner.resolver
                {
                    resolver.revoke(*ia, *ifid).await;
                }
                debug!(local = %self.inner.local, scmp = %notification, "received SCMP notification");
                Err(ConnError::Scmp(notification))
            }
        }
    }
}

#[async_trait]
impl ReplySink for Connection {
    async fn reply(&self, src: &Addr, pld: &Pld) -> anyhow::Result<()> {
        let dst = src.reply_addr()?;
        let bytes = serialize_pld(pld)?;
        if self.is_dialed() {
            self.write(&bytes).await?;
        } else {
            self.write_to(&bytes, &dst).await?;
        }
        Ok(())
    }
}
