//! # Lookup Daemon Client
//!
//! [`DaemonClient`] speaks the path service protocol over a dialed
//! [`Connection`]. Requests are tagged with random correlation ids; one
//! background reader task demultiplexes reply envelopes back to the waiting
//! callers. A request whose reply does not arrive within
//! [`DaemonClientConfig::request_timeout`] fails with [`LookupError::Timeout`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::addr::Ia;
use crate::conn::Connection;
use crate::error::{ConnError, LookupError};
use crate::messages::{
    deserialize_pld, serialize_pld, Ack, AsInfoReply, AsInfoReq, IfInfoReply, IfInfoReq, PathReply,
    PathReq, PathReqFlags, Pld, PldBody, RequestId, RevNotification, RevReply, SegSync,
    SvcInfoReply, SvcInfoReq,
};
use crate::path::IfId;
use crate::protocols::DaemonConnector;
use crate::revocation::SignedRevInfo;
use crate::segment::SegSyncPayload;
use crate::topology::ServiceType;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DaemonClientConfig {
    pub request_timeout: Duration,
}

impl Default for DaemonClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
        }
    }
}

type Pending = Arc<Mutex<HashMap<RequestId, oneshot::Sender<PldBody>>>>;

pub struct DaemonClient {
    conn: Connection,
    pending: Pending,
    config: DaemonClientConfig,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for DaemonClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonClient")
            .field("conn", &self.conn)
            .field("config", &self.config)
            .finish()
    }
}

impl DaemonClient {
    /// Wrap a connection dialed to a path server. Spawns the reply reader.
    pub fn new(conn: Connection, config: DaemonClientConfig) -> Result<Self, LookupError> {
        if !conn.is_dialed() {
            return Err(LookupError::DaemonUnavailable(
                "daemon connection must be dialed".to_string(),
            ));
        }
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_replies(conn.clone(), pending.clone()));
        Ok(Self {
            conn,
            pending,
            config,
            reader,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Push segments and revocations to the peer path server.
    pub async fn sync_segments(&self, payload: &SegSyncPayload) -> Result<Ack, LookupError> {
        let raw = payload
            .encode()
            .map_err(|e| LookupError::UnexpectedReply(format!("encoding segments: {}", e)))?;
        match self.request(PldBody::SegSync(SegSync { raw })).await? {
            PldBody::SegSyncAck(ack) => Ok(ack),
            other => Err(unexpected(&other)),
        }
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    async fn request(&self, body: PldBody) -> Result<PldBody, LookupError> {
        let id: RequestId = rand::random();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }
        // Removes the waiter on every exit, including a dropped caller.
        let _waiter = PendingGuard {
            pending: &self.pending,
            id,
        };

        let bytes = serialize_pld(&Pld::new(id, body))
            .map_err(|e| LookupError::UnexpectedReply(format!("encoding request: {}", e)))?;
        self.conn
            .write(&bytes)
            .await
            .map_err(|e| LookupError::DaemonUnavailable(e.to_string()))?;

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => Err(LookupError::DaemonUnavailable(
                "daemon connection closed".to_string(),
            )),
            Err(_) => Err(LookupError::Timeout(self.config.request_timeout)),
        }
    }
}

struct PendingGuard<'a> {
    pending: &'a Pending,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

impl Drop for DaemonClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn unexpected(body: &PldBody) -> LookupError {
    LookupError::UnexpectedReply(body.kind().to_string())
}

async fn read_replies(conn: Connection, pending: Pending) {
    loop {
        match conn.read().await {
            Ok(bytes) => {
                let pld = match deserialize_pld(&bytes) {
                    Ok(pld) => pld,
                    Err(e) => {
                        debug!(error = %e, "dropping undecodable reply");
                        continue;
                    }
                };
                let waiter = pending.lock().ok().and_then(|mut p| p.remove(&pld.id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(pld.body);
                    }
                    None => trace!(id = pld.id, kind = pld.body.kind(), "reply without waiter"),
                }
            }
            Err(ConnError::Scmp(notification)) => {
                debug!(scmp = %notification, "daemon connection SCMP");
            }
            Err(e) => {
                debug!(error = %e, "daemon reader stopped");
                break;
            }
        }
    }
    // Dropping the senders fails every outstanding request.
    if let Ok(mut pending) = pending.lock() {
        pending.clear();
    }
}

#[async_trait]
impl DaemonConnector for DaemonClient {
    async fn paths(
        &self,
        dst: Ia,
        src: Ia,
        max_paths: u16,
        flags: PathReqFlags,
    ) -> Result<PathReply, LookupError> {
        let req = PathReq {
            dst,
            src,
            max_paths,
            flags,
        };
        match self.request(PldBody::PathReq(req)).await? {
            PldBody::PathReply(reply) => Ok(reply),
            other => Err(unexpected(&other)),
        }
    }

    async fn as_info(&self, ia: Ia) -> Result<AsInfoReply, LookupError> {
        match self.request(PldBody::AsInfoReq(AsInfoReq { isdas: ia })).await? {
            PldBody::AsInfoReply(reply) => Ok(reply),
            other => Err(unexpected(&other)),
        }
    }

    async fn if_info(&self, if_ids: &[IfId]) -> Result<IfInfoReply, LookupError> {
        let req = IfInfoReq {
            if_ids: if_ids.to_vec(),
        };
        match self.request(PldBody::IfInfoReq(req)).await? {
            PldBody::IfInfoReply(reply) => Ok(reply),
            other => Err(unexpected(&other)),
        }
    }

    async fn svc_info(&self, types: &[ServiceType]) -> Result<SvcInfoReply, LookupError> {
        let req = SvcInfoReq {
            service_types: types.to_vec(),
        };
        match self.request(PldBody::SvcInfoReq(req)).await? {
            PldBody::SvcInfoReply(reply) => Ok(reply),
            other => Err(unexpected(&other)),
        }
    }

    async fn rev_notification(&self, srev: SignedRevInfo) -> Result<RevReply, LookupError> {
        let req = RevNotification { srev_info: srev };
        match self.request(PldBody::RevNotification(req)).await? {
            PldBody::RevReply(reply) => Ok(reply),
            other => Err(unexpected(&other)),
        }
    }
}
