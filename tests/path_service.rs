//! End-to-end tests: a path server and its clients talking over the
//! in-process dispatcher.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use pathnet::{
    generate_signing_key, AckCode, Addr, AsEntry, DaemonClient, DaemonClientConfig,
    DaemonConnector, DefaultSegmentHandler, Ia, IfInfo, LinkType, LocalDispatcher, MemRevCache,
    MemSegmentStore, NetworkContext, PathErrorCode, PathReqFlags, PathResolver, PathSegment,
    PathServer, ProcessedResult, RevCache, RevInfo, RevOutcome, RevocationError, SegSyncPayload,
    SegmentError, SegmentFetcher, SegmentHandler, SegmentJob, SegmentStore, ServerConfig,
    ServiceAddr, ServiceType, SignedRevInfo, SyncStats, Timers, Topology, TopologyHandle,
    TopologyInspector, TrustStore, Verifier, VerifierFactory, HOP_FIELD_LEN,
};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(1);

const LOCAL: &str = "1-ff00:0:110";
const CORE: &str = "1-ff00:0:120";

fn ia(s: &str) -> Ia {
    s.parse().expect("valid IA")
}

fn sock(s: &str) -> SocketAddr {
    s.parse().expect("valid socket address")
}

fn segment(from: &str, from_if: u64, to: &str, to_if: u64) -> PathSegment {
    let entry = |ia_s: &str, ingress: u64, egress: u64| AsEntry {
        ia: ia(ia_s),
        ingress,
        egress,
        hop_field: vec![(ingress + egress) as u8; HOP_FIELD_LEN],
        mtu: 1400,
    };
    PathSegment::new(
        vec![entry(from, 0, from_if), entry(to, to_if, 0)],
        SystemTime::now() + Duration::from_secs(3600),
    )
}

/// Verifier whose every check outlasts the server's work budget.
struct SlowVerifier;

impl VerifierFactory for SlowVerifier {
    fn new_verifier(&self) -> Box<dyn Verifier> {
        Box::new(SlowVerifier)
    }
}

#[async_trait]
impl Verifier for SlowVerifier {
    async fn verify_rev(&self, _srev: &SignedRevInfo, _info: &RevInfo) -> Result<(), RevocationError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }

    async fn verify_segment(&self, _segment: &PathSegment) -> Result<(), SegmentError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }
}

/// Pipeline that completes only after a minute.
struct SlowPipeline;

impl SegmentHandler for SlowPipeline {
    fn handle(&self, _job: SegmentJob) -> ProcessedResult {
        let (tx, result) = ProcessedResult::channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let _ = tx.send(Ok(SyncStats::default()));
        });
        result
    }
}

struct Harness {
    dispatcher: LocalDispatcher,
    store: Arc<MemSegmentStore>,
    revocations: Arc<MemRevCache>,
    trust: TrustStore,
}

impl Harness {
    /// Start a path server for `LOCAL` with interface 1 towards `CORE`.
    async fn start(trust: TrustStore) -> Self {
        Self::start_with(trust, None, None).await
    }

    /// Like [`Harness::start`], optionally replacing the verifier and the sync pipeline.
    async fn start_with(
        trust: TrustStore,
        verifiers: Option<Arc<dyn VerifierFactory>>,
        segments: Option<Arc<dyn SegmentHandler>>,
    ) -> Self {
        let dispatcher = LocalDispatcher::new();
        let store = Arc::new(MemSegmentStore::new());
        let revocations = Arc::new(MemRevCache::new());

        let topo = TopologyHandle::new(
            Topology::new(ia(LOCAL), false)
                .with_interface(
                    1,
                    IfInfo {
                        internal_addr: sock("192.0.2.50:30042"),
                        remote_ia: ia(CORE),
                        link_type: LinkType::Parent,
                        mtu: 1400,
                    },
                )
                .with_service(ServiceType::PathServer, sock("192.0.2.10:30252")),
        );
        let verifiers: Arc<dyn VerifierFactory> =
            verifiers.unwrap_or_else(|| Arc::new(trust.clone()));
        let segments: Arc<dyn SegmentHandler> = segments.unwrap_or_else(|| {
            Arc::new(DefaultSegmentHandler::new(
                verifiers.clone(),
                store.clone(),
                revocations.clone(),
            ))
        });
        let server = PathServer::new(
            ServerConfig::default(),
            topo.clone(),
            Arc::new(SegmentFetcher::new(topo.clone(), store.clone(), revocations.clone())),
            Arc::new(TopologyInspector::new(topo).with_remote(ia(CORE), true)),
            verifiers,
            revocations.clone(),
            segments,
        );

        let ctx = NetworkContext::new(ia(LOCAL), Arc::new(dispatcher.clone()), None);
        let conn = ctx
            .listen_with_bind_svc(
                "udp4",
                Some(&Addr::udp(ia(LOCAL), sock("192.0.2.10:30252"))),
                None,
                ServiceAddr::PathServer,
                REGISTER_TIMEOUT,
            )
            .await
            .expect("path server listen failed");
        tokio::spawn(async move {
            let _ = server.serve(conn).await;
        });

        Self {
            dispatcher,
            store,
            revocations,
            trust,
        }
    }

    async fn client(&self) -> DaemonClient {
        self.client_with(DaemonClientConfig::default()).await
    }

    async fn client_with(&self, config: DaemonClientConfig) -> DaemonClient {
        let ctx = NetworkContext::new(ia(LOCAL), Arc::new(self.dispatcher.clone()), None);
        let conn = ctx
            .dial(
                "udp4",
                Some(&Addr::udp(ia(LOCAL), sock("192.0.2.20:0"))),
                Some(&Addr::svc(ia(LOCAL), ServiceAddr::PathServer)),
                REGISTER_TIMEOUT,
            )
            .await
            .expect("dial failed");
        DaemonClient::new(conn, config).expect("daemon client")
    }
}

#[tokio::test]
async fn as_info_for_local_and_remote_scope() {
    let harness = Harness::start(TrustStore::new()).await;
    let client = harness.client().await;

    let local = timeout(TEST_TIMEOUT, client.as_info(Ia::ZERO))
        .await
        .expect("timed out")
        .expect("as_info failed");
    assert_eq!(local.entries.len(), 1);
    assert_eq!(local.entries[0].raw_isdas, ia(LOCAL).raw());
    assert!(!local.entries[0].is_core);

    let core = client.as_info(ia(CORE)).await.expect("as_info failed");
    assert!(core.entries[0].is_core);
    assert_eq!(core.entries[0].mtu, None);

    let unknown = client.as_info(ia("2-ff00:0:210")).await.expect("as_info failed");
    assert!(unknown.entries.is_empty());
}

#[tokio::test]
async fn if_and_service_info() {
    let harness = Harness::start(TrustStore::new()).await;
    let client = harness.client().await;

    let ifs = client.if_info(&[1, 99]).await.expect("if_info failed");
    assert_eq!(ifs.entries.len(), 1);
    assert_eq!(ifs.entries[0].if_id, 1);
    assert_eq!(ifs.entries[0].host_info.socket_addr(), Some(sock("192.0.2.50:30042")));

    let svcs = client
        .svc_info(&[ServiceType::PathServer])
        .await
        .expect("svc_info failed");
    assert_eq!(svcs.entries.len(), 1);
    assert_eq!(svcs.entries[0].ttl, ServerConfig::default().service_ttl);
    assert_eq!(
        svcs.entries[0].host_infos[0].socket_addr(),
        Some(sock("192.0.2.10:30252"))
    );
}

#[tokio::test]
async fn path_lookup_through_resolver() {
    let harness = Harness::start(TrustStore::new()).await;
    harness
        .store
        .insert(segment(LOCAL, 1, CORE, 7))
        .await
        .expect("insert failed");

    let client = harness.client().await;
    let reply = client
        .paths(ia("2-ff00:0:210"), Ia::ZERO, 5, PathReqFlags::default())
        .await
        .expect("paths failed");
    assert_eq!(reply.error_code, PathErrorCode::NoPaths);

    let resolver = PathResolver::new(Arc::new(client), Timers::default());
    let paths = timeout(TEST_TIMEOUT, resolver.query(ia(LOCAL), ia(CORE), 5, false))
        .await
        .expect("timed out")
        .expect("lookup failed");
    assert_eq!(paths.len(), 1);
    assert!(paths[0].crosses(ia(LOCAL), 1));
    assert_eq!(paths[0].next_hop(), Some(sock("192.0.2.50:30042")));
    assert_eq!(resolver.tracked().await, 1);
    resolver.quit().await;
}

#[tokio::test]
async fn resolved_path_carries_remote_datagrams() {
    let harness = Harness::start(TrustStore::new()).await;
    harness
        .store
        .insert(segment(LOCAL, 1, CORE, 7))
        .await
        .expect("insert failed");

    let resolver = PathResolver::new(Arc::new(harness.client().await), Timers::default());
    let local_ctx = NetworkContext::new(
        ia(LOCAL),
        Arc::new(harness.dispatcher.clone()),
        Some(resolver.clone()),
    );
    let core_ctx = NetworkContext::new(ia(CORE), Arc::new(harness.dispatcher.clone()), None);

    let receiver_addr = Addr::udp(ia(CORE), sock("198.51.100.1:40000"));
    let receiver = core_ctx
        .listen("udp4", Some(&receiver_addr), REGISTER_TIMEOUT)
        .await
        .unwrap();
    let sender = local_ctx
        .listen("udp4", Some(&Addr::udp(ia(LOCAL), sock("192.0.2.30:0"))), REGISTER_TIMEOUT)
        .await
        .unwrap();

    sender.write_to(b"hello", &receiver_addr).await.expect("send failed");
    let (payload, src) = timeout(TEST_TIMEOUT, receiver.read_from())
        .await
        .expect("timed out")
        .expect("receive failed");
    assert_eq!(payload, b"hello");
    assert_eq!(src.ia, ia(LOCAL));
    let path = src.path.expect("arrival path");
    assert_eq!(path.hop_count(), 2);
    resolver.quit().await;
}

#[tokio::test]
async fn revocation_notifications_are_classified() {
    let key = generate_signing_key();
    let signer = ia(CORE);
    let harness = Harness::start(TrustStore::new().with_key(signer, key.verifying_key())).await;
    let client = harness.client().await;

    let info = RevInfo::issue(signer, 7, LinkType::Child, Duration::from_secs(60));
    let srev = SignedRevInfo::sign(&info, &key).unwrap();
    let reply = client.rev_notification(srev.clone()).await.expect("notification failed");
    assert_eq!(reply.result, RevOutcome::Valid);
    assert_eq!(reply.srev_info, srev);
    assert!(harness.revocations.get(signer, 7).await.is_some());

    // Same claim again: accepted, cache unchanged.
    let reply = client.rev_notification(srev).await.expect("notification failed");
    assert_eq!(reply.result, RevOutcome::Valid);
    assert_eq!(harness.revocations.len().await, 1);

    let forged_key = generate_signing_key();
    let other = RevInfo::issue(signer, 8, LinkType::Child, Duration::from_secs(60));
    let forged = SignedRevInfo::sign(&other, &forged_key).unwrap();
    let reply = client.rev_notification(forged).await.expect("notification failed");
    assert_eq!(reply.result, RevOutcome::Unknown);
    assert!(harness.revocations.get(signer, 8).await.is_none());
    assert_eq!(harness.revocations.len().await, 1);
    assert!(harness.trust.key(signer).is_some());
}

#[tokio::test]
async fn revoked_interface_hides_paths() {
    let harness = Harness::start(TrustStore::new()).await;
    harness.store.insert(segment(LOCAL, 1, CORE, 7)).await.unwrap();
    harness
        .revocations
        .insert(RevInfo::issue(ia(LOCAL), 1, LinkType::Parent, Duration::from_secs(60)))
        .await
        .unwrap();

    let client = harness.client().await;
    let reply = client
        .paths(ia(CORE), Ia::ZERO, 5, PathReqFlags::default())
        .await
        .expect("paths failed");
    assert_eq!(reply.error_code, PathErrorCode::NoPaths);
}

#[tokio::test(start_paused = true)]
async fn slow_verifier_still_gets_a_rev_reply() {
    let harness = Harness::start_with(TrustStore::new(), Some(Arc::new(SlowVerifier)), None).await;
    let client = harness
        .client_with(DaemonClientConfig {
            request_timeout: Duration::from_secs(120),
        })
        .await;

    let key = generate_signing_key();
    let info = RevInfo::issue(ia(CORE), 7, LinkType::Child, Duration::from_secs(600));
    let srev = SignedRevInfo::sign(&info, &key).unwrap();
    let reply = client.rev_notification(srev).await.expect("no rev reply");
    assert_eq!(reply.result, RevOutcome::Unknown);
    assert!(harness.revocations.get(ia(CORE), 7).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn slow_sync_pipeline_still_gets_an_ack() {
    let harness = Harness::start_with(TrustStore::new(), None, Some(Arc::new(SlowPipeline))).await;
    let client = harness
        .client_with(DaemonClientConfig {
            request_timeout: Duration::from_secs(120),
        })
        .await;

    let ack = client
        .sync_segments(&SegSyncPayload::default())
        .await
        .expect("no segment sync ack");
    assert_eq!(ack.code, AckCode::Reject);
    assert_eq!(
        ack.reason,
        SegmentError::Timeout(ServerConfig::default().work_timeout).to_string()
    );
}

#[tokio::test(start_paused = true)]
async fn abandoned_request_forgets_its_waiter() {
    let harness = Harness::start_with(TrustStore::new(), Some(Arc::new(SlowVerifier)), None).await;
    let client = harness
        .client_with(DaemonClientConfig {
            request_timeout: Duration::from_secs(120),
        })
        .await;

    let key = generate_signing_key();
    let info = RevInfo::issue(ia(CORE), 9, LinkType::Child, Duration::from_secs(600));
    let srev = SignedRevInfo::sign(&info, &key).unwrap();
    let abandoned = timeout(Duration::from_secs(1), client.rev_notification(srev)).await;
    assert!(abandoned.is_err());
    assert_eq!(client.pending_requests(), 0);
}
