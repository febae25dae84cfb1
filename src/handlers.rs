//! # Path Service Request Handlers
//!
//! One handler per request kind. The server builds a fresh handler for every
//! inbound datagram; each `handle` call sends exactly one reply envelope
//! echoing the request's correlation id, including on internal failure.
//!
//! | Request | Handler | Failure reply |
//! |---------|---------|---------------|
//! | `PathReq` | [`PathRequestHandler`] | `PathReply` with `PsTimeout` on work-budget expiry |
//! | `AsInfoReq` | [`AsInfoHandler`] | empty `AsInfoReply` |
//! | `IfInfoReq` | [`IfInfoHandler`] | unknown ids skipped |
//! | `SvcInfoReq` | [`SvcInfoHandler`] | empty host list |
//! | `RevNotification` | [`RevNotificationHandler`] | `RevReply` classified `Unknown`, also on work-budget expiry |
//!
//! ## Timeouts
//!
//! | Budget | Default | Bounds |
//! |--------|---------|--------|
//! | work | 10s | collaborator calls for one request |
//! | reply | 2s | sending the reply envelope |
//! | early reply | 200ms | waiting for upstream when local paths exist |

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::addr::{Addr, Ia};
use crate::messages::{
    AsInfoReply, AsInfoReplyEntry, AsInfoReq, HostInfo, IfInfoReply, IfInfoReplyEntry, IfInfoReq,
    PathErrorCode, PathReply, PathReq, Pld, PldBody, RevNotification, RevReply, SvcInfoReply,
    SvcInfoReplyEntry, SvcInfoReq,
};
use crate::protocols::{AsInspector, PathFetcher, ReplySink, RevCache, VerifierFactory};
use crate::error::RevocationError;
use crate::revocation::{classify, verify_srev_info, SignedRevInfo};
use crate::topology::TopologyHandle;

// ============================================================================
// Configuration
// ============================================================================

/// Budget for the collaborator calls made on behalf of one request.
pub const DEFAULT_WORK_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for sending one reply. Shorter than the work budget.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a path request with local results waits for upstream answers.
pub const DEFAULT_EARLY_REPLY: Duration = Duration::from_millis(200);

/// Seconds a service-info answer may be cached by the requester.
pub const DEFAULT_SERVICE_TTL: u32 = 300;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub work_timeout: Duration,
    pub reply_timeout: Duration,
    pub early_reply: Duration,
    pub service_ttl: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            work_timeout: DEFAULT_WORK_TIMEOUT,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            early_reply: DEFAULT_EARLY_REPLY,
            service_ttl: DEFAULT_SERVICE_TTL,
        }
    }
}

/// Send `body` back to `src` under `pld`'s correlation id.
/// Returns whether the reply left within `reply_timeout`.
pub(crate) async fn send_reply(
    sink: &dyn ReplySink,
    src: &Addr,
    pld: &Pld,
    body: PldBody,
    reply_timeout: Duration,
) -> bool {
    let kind = body.kind();
    let reply = pld.reply(body);
    match tokio::time::timeout(reply_timeout, sink.reply(src, &reply)).await {
        Ok(Ok(())) => {
            debug!(src = %src, id = pld.id, kind, "sent reply");
            true
        }
        Ok(Err(e)) => {
            warn!(src = %src, id = pld.id, kind, error = %e, "failed to send reply");
            false
        }
        Err(_) => {
            warn!(src = %src, id = pld.id, kind, "timed out sending reply");
            false
        }
    }
}

// ============================================================================
// Path Requests
// ============================================================================

pub struct PathRequestHandler {
    fetcher: Arc<dyn PathFetcher>,
    config: ServerConfig,
}

impl PathRequestHandler {
    pub fn new(fetcher: Arc<dyn PathFetcher>, config: ServerConfig) -> Self {
        Self { fetcher, config }
    }

    pub async fn handle(
        &self,
        src: &Addr,
        pld: &Pld,
        req: &PathReq,
        sink: &dyn ReplySink,
    ) -> PathReply {
        let fetch = self
            .fetcher
            .fetch(req, self.config.early_reply, self.config.work_timeout);
        let reply = match tokio::time::timeout(self.config.work_timeout, fetch).await {
            Ok(reply) => reply,
            Err(_) => {
                warn!(src = %src, id = pld.id, dst = %req.dst, "path lookup exceeded work budget");
                PathReply::error(PathErrorCode::PsTimeout)
            }
        };
        debug!(
            id = pld.id,
            dst = %req.dst,
            code = %reply.error_code,
            paths = reply.entries.len(),
            "answered path request"
        );
        send_reply(
            sink,
            src,
            pld,
            PldBody::PathReply(reply.clone()),
            self.config.reply_timeout,
        )
        .await;
        reply
    }
}

// ============================================================================
// Topology Queries
// ============================================================================

pub struct AsInfoHandler {
    topo: TopologyHandle,
    inspector: Arc<dyn AsInspector>,
    config: ServerConfig,
}

impl AsInfoHandler {
    pub fn new(topo: TopologyHandle, inspector: Arc<dyn AsInspector>, config: ServerConfig) -> Self {
        Self {
            topo,
            inspector,
            config,
        }
    }

    pub async fn handle(
        &self,
        src: &Addr,
        pld: &Pld,
        req: &AsInfoReq,
        sink: &dyn ReplySink,
    ) -> AsInfoReply {
        let topo = self.topo.snapshot();
        let ia: Ia = if req.isdas.is_zero() { topo.ia } else { req.isdas };
        let lookup = tokio::time::timeout(self.config.work_timeout, self.inspector.is_core(ia)).await;
        let reply = match lookup {
            Ok(Ok(is_core)) => AsInfoReply {
                entries: vec![AsInfoReplyEntry {
                    raw_isdas: ia.raw(),
                    mtu: (ia == topo.ia).then_some(topo.mtu),
                    is_core,
                }],
            },
            Ok(Err(e)) => {
                warn!(ia = %ia, error = %e, "core lookup failed");
                AsInfoReply::default()
            }
            Err(_) => {
                warn!(ia = %ia, "core lookup exceeded work budget");
                AsInfoReply::default()
            }
        };
        send_reply(
            sink,
            src,
            pld,
            PldBody::AsInfoReply(reply.clone()),
            self.config.reply_timeout,
        )
        .await;
        reply
    }
}

pub struct IfInfoHandler {
    topo: TopologyHandle,
    config: ServerConfig,
}

impl IfInfoHandler {
    pub fn new(topo: TopologyHandle, config: ServerConfig) -> Self {
        Self { topo, config }
    }

    pub async fn handle(
        &self,
        src: &Addr,
        pld: &Pld,
        req: &IfInfoReq,
        sink: &dyn ReplySink,
    ) -> IfInfoReply {
        let topo = self.topo.snapshot();
        let entry = |if_id, internal_addr| IfInfoReplyEntry {
            if_id,
            host_info: HostInfo::from(internal_addr),
        };
        let entries = if req.if_ids.is_empty() {
            topo.interfaces
                .iter()
                .map(|(if_id, info)| entry(*if_id, info.internal_addr))
                .collect()
        } else {
            req.if_ids
                .iter()
                .filter_map(|if_id| match topo.interface(*if_id) {
                    Some(info) => Some(entry(*if_id, info.internal_addr)),
                    None => {
                        info!(if_id, "unknown interface requested");
                        None
                    }
                })
                .collect()
        };
        let reply = IfInfoReply { entries };
        send_reply(
            sink,
            src,
            pld,
            PldBody::IfInfoReply(reply.clone()),
            self.config.reply_timeout,
        )
        .await;
        reply
    }
}

pub struct SvcInfoHandler {
    topo: TopologyHandle,
    config: ServerConfig,
}

impl SvcInfoHandler {
    pub fn new(topo: TopologyHandle, config: ServerConfig) -> Self {
        Self { topo, config }
    }

    pub async fn handle(
        &self,
        src: &Addr,
        pld: &Pld,
        req: &SvcInfoReq,
        sink: &dyn ReplySink,
    ) -> SvcInfoReply {
        let topo = self.topo.snapshot();
        let entries = req
            .service_types
            .iter()
            .map(|svc| SvcInfoReplyEntry {
                service_type: *svc,
                ttl: self.config.service_ttl,
                host_infos: topo
                    .service_addrs(*svc)
                    .iter()
                    .copied()
                    .map(HostInfo::from)
                    .collect(),
            })
            .collect();
        let reply = SvcInfoReply { entries };
        send_reply(
            sink,
            src,
            pld,
            PldBody::SvcInfoReply(reply.clone()),
            self.config.reply_timeout,
        )
        .await;
        reply
    }
}

// ============================================================================
// Revocations
// ============================================================================

/// Verifies a pushed revocation, caches it when valid and reports the outcome.
pub struct RevNotificationHandler {
    verifiers: Arc<dyn VerifierFactory>,
    revocations: Arc<dyn RevCache>,
    config: ServerConfig,
}

impl RevNotificationHandler {
    pub fn new(
        verifiers: Arc<dyn VerifierFactory>,
        revocations: Arc<dyn RevCache>,
        config: ServerConfig,
    ) -> Self {
        Self {
            verifiers,
            revocations,
            config,
        }
    }

    pub async fn handle(
        &self,
        src: &Addr,
        pld: &Pld,
        req: &RevNotification,
        sink: &dyn ReplySink,
    ) -> RevReply {
        let work = self.verify_and_cache(src, &req.srev_info);
        let result = match tokio::time::timeout(self.config.work_timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(src = %src, id = pld.id, "revocation handling exceeded work budget");
                Err(RevocationError::Timeout(self.config.work_timeout))
            }
        };

        let reply = RevReply {
            result: classify(&result),
            srev_info: req.srev_info.clone(),
        };
        send_reply(
            sink,
            src,
            pld,
            PldBody::RevReply(reply.clone()),
            self.config.reply_timeout,
        )
        .await;
        reply
    }

    async fn verify_and_cache(
        &self,
        src: &Addr,
        srev: &SignedRevInfo,
    ) -> Result<(), RevocationError> {
        let (info, result) = verify_srev_info(self.verifiers.as_ref(), srev).await;
        match (&result, info) {
            (Ok(()), Some(rev)) => {
                let (ia, ifid) = (rev.ia, rev.ifid);
                match self.revocations.insert(rev).await {
                    Ok(true) => info!(ia = %ia, ifid, "cached interface revocation"),
                    Ok(false) => debug!(ia = %ia, ifid, "revocation already known"),
                    Err(e) => warn!(ia = %ia, ifid, error = %e, "failed to cache revocation"),
                }
            }
            (Err(e), Some(rev)) => {
                warn!(src = %src, ia = %rev.ia, ifid = rev.ifid, error = %e, "revocation failed verification");
            }
            (Err(e), None) => warn!(src = %src, error = %e, "malformed revocation"),
            (Ok(()), None) => {}
        }
        result
    }
}
