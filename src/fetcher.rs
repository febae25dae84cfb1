//! # Segment Fetcher
//!
//! Default [`PathFetcher`]: builds end-to-end paths from stored segments.
//!
//! ## Path Construction
//!
//! 1. Segments running directly from the source to the destination.
//! 2. Two-segment joins meeting at a shared intermediate scope.
//!
//! Candidates are dropped when expired or when they cross an interface with
//! an active revocation, deduplicated by fingerprint, ordered by interface
//! count and capped at the request's maximum.
//!
//! ## Upstream Requests
//!
//! With a [`SegmentRequester`] configured, upstream servers are asked when
//! nothing is known locally or the request sets `refresh`. Local results are
//! returned once the early-reply budget passes while the upstream request
//! keeps running in the background (bounded by the work budget) and stores
//! whatever it gets for later requests.
//!
//! Without a requester the fetcher only knows segments pushed to it through
//! segment sync; `pathnet serve` runs in that mode.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::addr::Ia;
use crate::messages::{PathErrorCode, PathReply, PathReq};
use crate::path::Path;
use crate::protocols::{PathFetcher, RevCache, SegmentRequester, SegmentStore};
use crate::topology::TopologyHandle;

/// Paths returned when a request asks for `max_paths == 0`.
pub const DEFAULT_MAX_PATHS: usize = 10;

enum Upstream {
    Stored(usize),
    Failed(String),
    TimedOut,
}

pub struct SegmentFetcher {
    topo: TopologyHandle,
    store: Arc<dyn SegmentStore>,
    revocations: Arc<dyn RevCache>,
    requester: Option<Arc<dyn SegmentRequester>>,
}

impl SegmentFetcher {
    pub fn new(
        topo: TopologyHandle,
        store: Arc<dyn SegmentStore>,
        revocations: Arc<dyn RevCache>,
    ) -> Self {
        Self {
            topo,
            store,
            revocations,
            requester: None,
        }
    }

    /// Ask `requester` for segments that are not known locally.
    pub fn with_requester(mut self, requester: Arc<dyn SegmentRequester>) -> Self {
        self.requester = Some(requester);
        self
    }

    async fn local_paths(&self, src: Ia, dst: Ia, max: usize) -> Vec<Path> {
        let mut candidates: Vec<Path> = self
            .store
            .between(src, dst)
            .await
            .iter()
            .map(|seg| seg.join(&[]))
            .collect();
        for first in self.store.starting_at(src).await {
            let Some(mid) = first.last_ia() else {
                continue;
            };
            if mid == dst || mid == src {
                continue;
            }
            for second in self.store.between(mid, dst).await {
                candidates.push(first.join(&[&second]));
            }
        }

        let mut seen = HashSet::new();
        let mut paths = Vec::new();
        for path in candidates {
            if path.is_expired() || self.is_revoked(&path).await {
                continue;
            }
            if seen.insert(path.fingerprint()) {
                paths.push(path);
            }
        }
        paths.sort_by_key(|p| p.interfaces().len());
        paths.truncate(max);

        let topo = self.topo.snapshot();
        paths
            .into_iter()
            .map(|path| {
                let next_hop = path
                    .interfaces()
                    .first()
                    .filter(|hop| hop.ia == topo.ia)
                    .and_then(|hop| topo.interface(hop.ifid))
                    .map(|info| info.internal_addr);
                path.with_next_hop(next_hop)
            })
            .collect()
    }

    async fn is_revoked(&self, path: &Path) -> bool {
        for hop in path.interfaces() {
            if self.revocations.get(hop.ia, hop.ifid).await.is_some() {
                debug!(ia = %hop.ia, ifid = hop.ifid, "skipping path over revoked interface");
                return true;
            }
        }
        false
    }

    fn spawn_upstream(
        &self,
        requester: Arc<dyn SegmentRequester>,
        src: Ia,
        dst: Ia,
        work_timeout: Duration,
    ) -> tokio::task::JoinHandle<Upstream> {
        let store = self.store.clone();
        tokio::spawn(async move {
            let request = async {
                let segments = requester.request_segments(src, dst).await?;
                let mut stored = 0;
                for segment in segments {
                    if segment.is_expired() {
                        continue;
                    }
                    if store.insert(segment).await? {
                        stored += 1;
                    }
                }
                anyhow::Ok(stored)
            };
            match tokio::time::timeout(work_timeout, request).await {
                Ok(Ok(stored)) => {
                    debug!(src = %src, dst = %dst, stored, "stored upstream segments");
                    Upstream::Stored(stored)
                }
                Ok(Err(e)) => Upstream::Failed(e.to_string()),
                Err(_) => Upstream::TimedOut,
            }
        })
    }
}

fn finish(paths: Vec<Path>) -> PathReply {
    if paths.is_empty() {
        PathReply::error(PathErrorCode::NoPaths)
    } else {
        PathReply::ok(paths)
    }
}

#[async_trait]
impl PathFetcher for SegmentFetcher {
    async fn fetch(&self, req: &PathReq, early_reply: Duration, work_timeout: Duration) -> PathReply {
        let topo = self.topo.snapshot();
        if req.dst.is_zero() {
            return PathReply::error(PathErrorCode::BadDstIa);
        }
        let src = if req.src.is_zero() { topo.ia } else { req.src };
        if src != topo.ia {
            return PathReply::error(PathErrorCode::BadSrcIa);
        }
        if req.dst == topo.ia {
            return PathReply::ok(vec![Path::local(topo.mtu)]);
        }

        let max = match req.max_paths {
            0 => DEFAULT_MAX_PATHS,
            n => usize::from(n),
        };
        let local = self.local_paths(src, req.dst, max).await;
        let Some(requester) = self.requester.clone() else {
            return finish(local);
        };
        if !local.is_empty() && !req.flags.refresh {
            return PathReply::ok(local);
        }

        let upstream = self.spawn_upstream(requester, src, req.dst, work_timeout);
        if local.is_empty() {
            return match upstream.await {
                Ok(Upstream::Stored(_)) => finish(self.local_paths(src, req.dst, max).await),
                Ok(Upstream::TimedOut) => PathReply::error(PathErrorCode::PsTimeout),
                Ok(Upstream::Failed(e)) => {
                    warn!(dst = %req.dst, error = %e, "upstream segment request failed");
                    PathReply::error(PathErrorCode::Internal)
                }
                Err(e) => {
                    warn!(dst = %req.dst, error = %e, "upstream segment task failed");
                    PathReply::error(PathErrorCode::Internal)
                }
            };
        }

        // Dropping the handle after the early-reply budget detaches the task.
        match tokio::time::timeout(early_reply, upstream).await {
            Ok(Ok(Upstream::Stored(_))) => finish(self.local_paths(src, req.dst, max).await),
            Ok(Ok(Upstream::Failed(e))) => {
                debug!(dst = %req.dst, error = %e, "upstream refresh failed, using local paths");
                PathReply::ok(local)
            }
            _ => PathReply::ok(local),
        }
    }
}
