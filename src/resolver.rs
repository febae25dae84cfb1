//! # Path Resolver
//!
//! Obtains and caches paths between scopes on behalf of connections.
//!
//! ## Architecture
//!
//! The resolver follows the handle/actor split:
//! - [`PathResolver`] is a cheap-clone handle. Daemon calls happen in the
//!   caller's task so that one slow lookup never blocks the cache.
//! - `ResolverActor` owns the LRU cache and runs the background refresh loop.
//!
//! ## Refresh Policy
//!
//! Every (src, dst) pair that has been queried is refreshed in the background:
//! after a successful lookup it fires again after [`Timers::normal_refire`],
//! after a failed one after [`Timers::error_refire`]. A failed lookup is
//! reported to the caller once and never retried synchronously.
//!
//! Daemon-less operation is expressed by not having a resolver at all
//! (`Option<PathResolver>` on the network context).

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::addr::Ia;
use crate::error::LookupError;
use crate::messages::{PathErrorCode, PathReqFlags};
use crate::path::{IfId, Path};
use crate::protocols::DaemonConnector;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of (src, dst) pairs cached and refreshed.
/// SECURITY: Bounds memory growth from callers querying many destinations.
pub const MAX_CACHED_QUERIES: usize = 1024;

/// Upper bound on the refresh loop's tick.
const MAX_REFRESH_TICK: Duration = Duration::from_secs(1);

const RESOLVER_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timers {
    /// Delay before re-querying a pair after a successful lookup.
    pub normal_refire: Duration,
    /// Delay before re-querying a pair after a failed lookup.
    pub error_refire: Duration,
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            normal_refire: Duration::from_secs(60),
            error_refire: Duration::from_secs(3),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct QueryKey {
    src: Ia,
    dst: Ia,
}

async fn fetch_paths(
    daemon: &dyn DaemonConnector,
    key: QueryKey,
    max_paths: u16,
    refresh: bool,
) -> Result<Vec<Path>, LookupError> {
    let reply = daemon
        .paths(key.dst, key.src, max_paths, PathReqFlags { refresh })
        .await?;
    match reply.error_code {
        PathErrorCode::Ok => Ok(reply
            .entries
            .into_iter()
            .filter(|p| !p.is_expired())
            .collect()),
        PathErrorCode::NoPaths => Ok(Vec::new()),
        code => Err(LookupError::Code(code)),
    }
}

/// The larger of two path limits, where 0 means no limit.
fn widest(a: u16, b: u16) -> u16 {
    if a == 0 || b == 0 { 0 } else { a.max(b) }
}

/// Whether `len` paths fetched under `limit` can answer a query for `requested`.
/// A fetch that came back short of its limit already holds every known path.
fn covers(limit: u16, len: usize, requested: u16) -> bool {
    limit == 0 || (requested != 0 && requested <= limit) || len < usize::from(limit)
}

fn capped(mut paths: Vec<Path>, max_paths: u16) -> Vec<Path> {
    if max_paths > 0 {
        paths.truncate(usize::from(max_paths));
    }
    paths
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

struct CachedPaths {
    paths: Vec<Path>,
    /// Limit the paths were fetched with.
    max_paths: u16,
}

enum ResolverCommand {
    Lookup {
        key: QueryKey,
        reply: oneshot::Sender<Option<CachedPaths>>,
    },
    Store {
        key: QueryKey,
        max_paths: u16,
        result: Result<Vec<Path>, LookupError>,
    },
    Revoke {
        ia: Ia,
        ifid: IfId,
    },
    Tracked {
        reply: oneshot::Sender<usize>,
    },
    Quit,
}

// ============================================================================
// PathResolver Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct PathResolver {
    cmd_tx: mpsc::Sender<ResolverCommand>,
    daemon: Arc<dyn DaemonConnector>,
    timers: Timers,
}

impl std::fmt::Debug for PathResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathResolver")
            .field("timers", &self.timers)
            .finish()
    }
}

impl PathResolver {
    /// Start a daemon-backed resolver. Spawns the cache actor.
    pub fn new(daemon: Arc<dyn DaemonConnector>, timers: Timers) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(RESOLVER_CHANNEL_CAPACITY);
        let actor = ResolverActor::new(daemon.clone(), timers, cmd_tx.downgrade());
        tokio::spawn(actor.run(cmd_rx));
        Self {
            cmd_tx,
            daemon,
            timers,
        }
    }

    pub fn daemon(&self) -> &Arc<dyn DaemonConnector> {
        &self.daemon
    }

    pub fn timers(&self) -> Timers {
        self.timers
    }

    /// Up to `max_paths` (0 = no limit) unexpired paths from `src` to `dst`.
    ///
    /// Served from cache unless `refresh` is set, nothing is cached, or the
    /// cached lookup was capped below `max_paths`. A miss fetches with the
    /// widest limit seen for the pair.
    pub async fn query(
        &self,
        src: Ia,
        dst: Ia,
        max_paths: u16,
        refresh: bool,
    ) -> Result<Vec<Path>, LookupError> {
        let key = QueryKey { src, dst };
        let cached = if refresh { None } else { self.cached(key).await };
        let mut limit = max_paths;
        if let Some(cached) = cached {
            if !cached.paths.is_empty() && covers(cached.max_paths, cached.paths.len(), max_paths) {
                return Ok(capped(cached.paths, max_paths));
            }
            limit = widest(cached.max_paths, max_paths);
        }

        let result = fetch_paths(self.daemon.as_ref(), key, limit, refresh).await;
        if let Err(e) = &result {
            debug!(src = %src, dst = %dst, error = %e, "path lookup failed");
        }
        let _ = self
            .cmd_tx
            .send(ResolverCommand::Store {
                key,
                max_paths: limit,
                result: result.clone(),
            })
            .await;
        result.map(|paths| capped(paths, max_paths))
    }

    /// Drop every cached path crossing interface `ifid` of `ia`.
    pub async fn revoke(&self, ia: Ia, ifid: IfId) {
        let _ = self.cmd_tx.send(ResolverCommand::Revoke { ia, ifid }).await;
    }

    /// Number of (src, dst) pairs currently cached and refreshed.
    pub async fn tracked(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(ResolverCommand::Tracked { reply: reply_tx })
            .await
            .is_err()
        {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(ResolverCommand::Quit).await;
    }

    async fn cached(&self, key: QueryKey) -> Option<CachedPaths> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ResolverCommand::Lookup {
                key,
                reply: reply_tx,
            })
            .await
            .ok()?;
        reply_rx.await.ok().flatten()
    }
}

// ============================================================================
// ResolverActor (private - owns all mutable state)
// ============================================================================

struct CacheEntry {
    paths: Vec<Path>,
    max_paths: u16,
    next_refresh: Instant,
    refreshing: bool,
}

struct ResolverActor {
    /// SECURITY: LruCache bounds memory growth.
    cache: LruCache<QueryKey, CacheEntry>,
    daemon: Arc<dyn DaemonConnector>,
    timers: Timers,
    /// Weak so that dropping every handle still shuts the actor down.
    self_tx: mpsc::WeakSender<ResolverCommand>,
}

impl ResolverActor {
    fn new(
        daemon: Arc<dyn DaemonConnector>,
        timers: Timers,
        self_tx: mpsc::WeakSender<ResolverCommand>,
    ) -> Self {
        let cap = NonZeroUsize::new(MAX_CACHED_QUERIES).expect("MAX_CACHED_QUERIES must be non-zero");
        Self {
            cache: LruCache::new(cap),
            daemon,
            timers,
            self_tx,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ResolverCommand>) {
        let tick = self
            .timers
            .error_refire
            .min(self.timers.normal_refire)
            .min(MAX_REFRESH_TICK)
            .max(Duration::from_millis(1));
        let mut refresh_interval = tokio::time::interval(tick);
        refresh_interval.tick().await; // Skip initial tick

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ResolverCommand::Lookup { key, reply }) => {
                            let cached = self.cache.get(&key).map(|entry| CachedPaths {
                                paths: entry.paths.iter().filter(|p| !p.is_expired()).cloned().collect(),
                                max_paths: entry.max_paths,
                            });
                            let _ = reply.send(cached);
                        }
                        Some(ResolverCommand::Store { key, max_paths, result }) => {
                            self.store(key, max_paths, result);
                        }
                        Some(ResolverCommand::Revoke { ia, ifid }) => {
                            self.revoke(ia, ifid);
                        }
                        Some(ResolverCommand::Tracked { reply }) => {
                            let _ = reply.send(self.cache.len());
                        }
                        Some(ResolverCommand::Quit) | None => {
                            debug!("resolver actor shutting down");
                            break;
                        }
                    }
                }

                _ = refresh_interval.tick() => {
                    self.refresh_due();
                }
            }
        }
    }

    fn store(&mut self, key: QueryKey, max_paths: u16, result: Result<Vec<Path>, LookupError>) {
        let now = Instant::now();
        let entry = self.cache.get_or_insert_mut(key, || CacheEntry {
            paths: Vec::new(),
            max_paths,
            next_refresh: now,
            refreshing: false,
        });
        entry.refreshing = false;
        match result {
            Ok(paths) => {
                entry.paths = paths;
                entry.max_paths = max_paths;
                entry.next_refresh = now + self.timers.normal_refire;
            }
            Err(e) => {
                // Keep serving the previous paths until they expire.
                entry.next_refresh = now + self.timers.error_refire;
                warn!(src = %key.src, dst = %key.dst, error = %e, "path refresh failed");
            }
        }
    }

    fn revoke(&mut self, ia: Ia, ifid: IfId) {
        let now = Instant::now();
        let mut dropped = 0usize;
        for (_, entry) in self.cache.iter_mut() {
            let before = entry.paths.len();
            entry.paths.retain(|p| !p.crosses(ia, ifid));
            dropped += before - entry.paths.len();
            if before > 0 && entry.paths.is_empty() {
                entry.next_refresh = now;
            }
        }
        debug!(ia = %ia, ifid, dropped, "revoked interface");
    }

    fn refresh_due(&mut self) {
        let now = Instant::now();
        for (key, entry) in self.cache.iter_mut() {
            if entry.refreshing || entry.next_refresh > now {
                continue;
            }
            let Some(tx) = self.self_tx.upgrade() else {
                return;
            };
            entry.refreshing = true;
            let key = *key;
            let max_paths = entry.max_paths;
            let daemon = self.daemon.clone();
            tokio::spawn(async move {
                let result = fetch_paths(daemon.as_ref(), key, max_paths, false).await;
                let _ = tx
                    .send(ResolverCommand::Store {
                        key,
                        max_paths,
                        result,
                    })
                    .await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AsInfoReply, IfInfoReply, PathReply, RevReply, SvcInfoReply};
    use crate::path::PathInterface;
    use crate::revocation::SignedRevInfo;
    use crate::topology::ServiceType;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    fn ia(s: &str) -> Ia {
        s.parse().unwrap()
    }

    fn path_via(ifid: IfId) -> Path {
        Path::new(
            vec![0u8; 24],
            vec![
                PathInterface::new(ia("1-ff00:0:110"), ifid),
                PathInterface::new(ia("1-ff00:0:111"), ifid + 100),
            ],
            1400,
            SystemTime::now() + Duration::from_secs(600),
            None,
        )
    }

    /// Daemon answering with two paths, failing the first `fail_first` calls.
    struct CountingDaemon {
        calls: AtomicUsize,
        fail_first: usize,
    }

    impl CountingDaemon {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_first,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DaemonConnector for CountingDaemon {
        async fn paths(
            &self,
            _dst: Ia,
            _src: Ia,
            max_paths: u16,
            _flags: PathReqFlags,
        ) -> Result<PathReply, LookupError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(LookupError::DaemonUnavailable("down".into()));
            }
            Ok(PathReply::ok(capped(vec![path_via(1), path_via(2)], max_paths)))
        }

        async fn as_info(&self, _ia: Ia) -> Result<AsInfoReply, LookupError> {
            Ok(AsInfoReply::default())
        }

        async fn if_info(&self, _if_ids: &[IfId]) -> Result<IfInfoReply, LookupError> {
            Ok(IfInfoReply::default())
        }

        async fn svc_info(&self, _types: &[ServiceType]) -> Result<SvcInfoReply, LookupError> {
            Ok(SvcInfoReply::default())
        }

        async fn rev_notification(&self, _srev: SignedRevInfo) -> Result<RevReply, LookupError> {
            Err(LookupError::UnexpectedReply("unused".into()))
        }
    }

    #[tokio::test]
    async fn cached_query_hits_daemon_once() {
        let daemon = CountingDaemon::new(0);
        let resolver = PathResolver::new(daemon.clone(), Timers::default());

        let first = resolver.query(ia("1-ff00:0:110"), ia("1-ff00:0:111"), 10, false).await.unwrap();
        let second = resolver.query(ia("1-ff00:0:110"), ia("1-ff00:0:111"), 1, false).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert_eq!(daemon.calls(), 1);
        assert_eq!(resolver.tracked().await, 1);
    }

    #[tokio::test]
    async fn refresh_flag_bypasses_cache() {
        let daemon = CountingDaemon::new(0);
        let resolver = PathResolver::new(daemon.clone(), Timers::default());

        resolver.query(ia("1-ff00:0:110"), ia("1-ff00:0:111"), 10, false).await.unwrap();
        resolver.query(ia("1-ff00:0:110"), ia("1-ff00:0:111"), 10, true).await.unwrap();
        assert_eq!(daemon.calls(), 2);
    }

    #[tokio::test]
    async fn failure_surfaces_then_retries_on_error_timer() {
        let daemon = CountingDaemon::new(1);
        let timers = Timers {
            normal_refire: Duration::from_secs(60),
            error_refire: Duration::from_millis(20),
        };
        let resolver = PathResolver::new(daemon.clone(), timers);

        let err = resolver.query(ia("1-ff00:0:110"), ia("1-ff00:0:111"), 10, false).await;
        assert!(matches!(err, Err(LookupError::DaemonUnavailable(_))));
        assert_eq!(daemon.calls(), 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while daemon.calls() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("background retry did not fire");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let paths = resolver.query(ia("1-ff00:0:110"), ia("1-ff00:0:111"), 10, false).await.unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(daemon.calls(), 2);
    }

    #[tokio::test]
    async fn revoke_drops_crossing_paths() {
        let daemon = CountingDaemon::new(0);
        let resolver = PathResolver::new(daemon.clone(), Timers::default());

        resolver.query(ia("1-ff00:0:110"), ia("1-ff00:0:111"), 10, false).await.unwrap();
        resolver.revoke(ia("1-ff00:0:110"), 1).await;

        let paths = resolver.query(ia("1-ff00:0:110"), ia("1-ff00:0:111"), 10, false).await.unwrap();
        assert_eq!(paths.len(), 1);
        assert!(!paths[0].crosses(ia("1-ff00:0:110"), 1));
        assert_eq!(daemon.calls(), 1);
    }

    #[test]
    fn default_timers() {
        let t = Timers::default();
        assert_eq!(t.normal_refire, Duration::from_secs(60));
        assert_eq!(t.error_refire, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn larger_limit_refetches_capped_cache() {
        let daemon = CountingDaemon::new(0);
        let resolver = PathResolver::new(daemon.clone(), Timers::default());
        let (src, dst) = (ia("1-ff00:0:110"), ia("1-ff00:0:111"));

        assert_eq!(resolver.query(src, dst, 1, false).await.unwrap().len(), 1);
        assert_eq!(daemon.calls(), 1);

        assert_eq!(resolver.query(src, dst, 2, false).await.unwrap().len(), 2);
        assert_eq!(daemon.calls(), 2);

        assert_eq!(resolver.query(src, dst, 1, false).await.unwrap().len(), 1);
        assert_eq!(daemon.calls(), 2);

        assert_eq!(resolver.query(src, dst, 0, false).await.unwrap().len(), 2);
        assert_eq!(daemon.calls(), 3);
        assert_eq!(resolver.query(src, dst, 5, false).await.unwrap().len(), 2);
        assert_eq!(daemon.calls(), 3);
        resolver.quit().await;
    }

    #[test]
    fn limits_widen_towards_unlimited() {
        assert_eq!(widest(3, 5), 5);
        assert_eq!(widest(0, 5), 0);
        assert!(covers(0, 1, 50));
        assert!(covers(5, 5, 3));
        assert!(covers(5, 2, 10));
        assert!(!covers(5, 5, 10));
        assert!(!covers(5, 5, 0));
    }
}
