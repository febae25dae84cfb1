//! # Path Server
//!
//! Receive loop for the path service. Every decodable datagram is handled on
//! its own task. Each handler bounds its collaborator calls by the work
//! budget and its reply by the reply budget; replies are correlated with
//! requests only by the envelope id.
//!
//! | Datagram | Action |
//! |----------|--------|
//! | undecodable | logged and dropped (no id to echo) |
//! | request kind | dispatched to a freshly built handler |
//! | `SegSync` | segment-sync handler, one ack |
//! | reply kind | logged and ignored |

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::addr::Addr;
use crate::conn::Connection;
use crate::error::ConnError;
use crate::handlers::{
    AsInfoHandler, IfInfoHandler, PathRequestHandler, RevNotificationHandler, ServerConfig,
    SvcInfoHandler,
};
use crate::messages::{deserialize_pld, Pld, PldBody};
use crate::protocols::{AsInspector, PathFetcher, ReplySink, RevCache, SegmentHandler, VerifierFactory};
use crate::segsync::SyncHandler;
use crate::topology::TopologyHandle;

/// Path service composition: collaborators shared by all per-request handlers.
#[derive(Clone)]
pub struct PathServer {
    config: ServerConfig,
    topo: TopologyHandle,
    fetcher: Arc<dyn PathFetcher>,
    inspector: Arc<dyn AsInspector>,
    verifiers: Arc<dyn VerifierFactory>,
    revocations: Arc<dyn RevCache>,
    sync: Arc<SyncHandler>,
}

impl PathServer {
    pub fn new(
        config: ServerConfig,
        topo: TopologyHandle,
        fetcher: Arc<dyn PathFetcher>,
        inspector: Arc<dyn AsInspector>,
        verifiers: Arc<dyn VerifierFactory>,
        revocations: Arc<dyn RevCache>,
        segments: Arc<dyn SegmentHandler>,
    ) -> Self {
        Self {
            config,
            topo,
            fetcher,
            inspector,
            verifiers,
            revocations,
            sync: Arc::new(SyncHandler::new(
                segments,
                config.work_timeout,
                config.reply_timeout,
            )),
        }
    }

    pub fn config(&self) -> ServerConfig {
        self.config
    }

    /// Serve requests arriving on a listening connection until it is closed.
    pub async fn serve(&self, conn: Connection) -> Result<(), ConnError> {
        info!(local = %conn.local_addr(), "path server listening");
        loop {
            let (bytes, src) = match conn.read_from().await {
                Ok(datagram) => datagram,
                Err(ConnError::Scmp(notification)) => {
                    debug!(scmp = %notification, "path server received SCMP");
                    continue;
                }
                Err(ConnError::Closed) => {
                    info!("path server shutting down");
                    return Ok(());
                }
                Err(_) if conn.is_closed() => {
                    info!("path server shutting down");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "path server receive failed");
                    return Err(e);
                }
            };
            let pld = match deserialize_pld(&bytes) {
                Ok(pld) => pld,
                Err(e) => {
                    debug!(src = %src, len = bytes.len(), error = %e, "dropping undecodable datagram");
                    continue;
                }
            };

            // Handlers bound their own work and reply.
            let server = self.clone();
            let sink = conn.clone();
            tokio::spawn(async move {
                server.handle(&src, pld, &sink).await;
            });
        }
    }

    /// Handle one decoded envelope from `src`, replying through `sink`.
    pub async fn handle(&self, src: &Addr, pld: Pld, sink: &dyn ReplySink) {
        trace!(src = %src, id = pld.id, kind = pld.body.kind(), "handling request");
        match &pld.body {
            PldBody::PathReq(req) => {
                PathRequestHandler::new(self.fetcher.clone(), self.config)
                    .handle(src, &pld, req, sink)
                    .await;
            }
            PldBody::AsInfoReq(req) => {
                AsInfoHandler::new(self.topo.clone(), self.inspector.clone(), self.config)
                    .handle(src, &pld, req, sink)
                    .await;
            }
            PldBody::IfInfoReq(req) => {
                IfInfoHandler::new(self.topo.clone(), self.config)
                    .handle(src, &pld, req, sink)
                    .await;
            }
            PldBody::SvcInfoReq(req) => {
                SvcInfoHandler::new(self.topo.clone(), self.config)
                    .handle(src, &pld, req, sink)
                    .await;
            }
            PldBody::RevNotification(req) => {
                RevNotificationHandler::new(
                    self.verifiers.clone(),
                    self.revocations.clone(),
                    self.config,
                )
                .handle(src, &pld, req, sink)
                .await;
            }
            PldBody::SegSync(_) => {
                let _ = self.sync.handle(src, &pld, sink).await;
            }
            PldBody::PathReply(_)
            | PldBody::AsInfoReply(_)
            | PldBody::IfInfoReply(_)
            | PldBody::SvcInfoReply(_)
            | PldBody::RevReply(_)
            | PldBody::SegSyncAck(_) => {
                debug!(src = %src, id = pld.id, kind = pld.body.kind(), "ignoring reply message");
            }
        }
    }
}
