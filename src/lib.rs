//! # Pathnet - Path-Aware Networking Core
//!
//! Pathnet provides the host-side core of a path-aware inter-domain network:
//!
//! - **Addressing**: scoped addresses (`ISD-AS` plus host, port and an optional path)
//! - **Network Context**: validated dial/listen against a packet dispatcher
//! - **Path Resolution**: cached, periodically refreshed path lookups through a lookup daemon
//! - **Path Service**: request handlers answering path, topology and revocation queries
//! - **Segment Sync**: verified push of path segments and revocations between path servers
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** for the path resolver cache:
//! - [`PathResolver`] is a cheap-clone handle talking to a private actor over channels
//! - The actor owns the cache and runs the refresh loop
//!
//! The path service handlers depend only on the collaborator traits in
//! `protocols`, so stores, verifiers and fetchers can be swapped.
//!
//! ## Security Model
//!
//! - Revocations and segments carry domain-separated Ed25519 signatures
//! - Unverifiable revocations are reported `Unknown` and never cached
//! - All wire decoding is size-bounded
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `addr` | Scopes, host addresses, scoped addresses, network families |
//! | `path` | Forwarding paths, reversal, fingerprints |
//! | `network` | Network context, address validation, default-context registry |
//! | `dispatcher` | Dispatcher registration, in-process and UDP dispatchers |
//! | `conn` | Dialed and listening connections |
//! | `resolver` | Path resolver handle and cache actor |
//! | `daemon` | Lookup daemon client |
//! | `topology` | Local topology snapshot and AS inspector |
//! | `handlers` | Per-kind path service request handlers |
//! | `fetcher` | Path construction from stored segments |
//! | `server` | Path server receive loop |
//! | `segment` | Path segments and the in-memory segment store |
//! | `segsync` | Segment-sync handler and verify-and-store pipeline |
//! | `revocation` | Interface revocations, trust store, revocation cache |
//! | `crypto` | Domain-separated signing helpers |
//! | `protocols` | Collaborator trait definitions |
//! | `messages` | Wire envelope and message types |
//! | `error` | Error types |

mod addr;
mod conn;
mod crypto;
mod daemon;
mod dispatcher;
mod error;
mod fetcher;
mod handlers;
mod messages;
mod network;
mod path;
mod protocols;
mod resolver;
mod revocation;
mod segment;
mod segsync;
mod server;
mod topology;

pub use addr::{
    Addr, AddrParseError, HostAddr, Ia, L3Addr, L3Type, L4Info, L4Type, NetFamily, ServiceAddr,
};
pub use conn::Connection;
pub use crypto::{generate_signing_key, verifying_key_from_hex, SignatureError};
pub use daemon::{DaemonClient, DaemonClientConfig};
pub use dispatcher::{
    Delivery, Dispatcher, LocalDispatcher, Packet, PacketConn, ScmpNotification, UdpDispatcher,
    FIRST_DYNAMIC_PORT, MAX_UNDRAINED_SCMP,
};
pub use error::{
    AlreadyInitialized, ConnError, LookupError, NetError, RegistrationError, RevocationError,
    SegmentError, ValidationError,
};
pub use fetcher::{SegmentFetcher, DEFAULT_MAX_PATHS};
pub use handlers::{
    AsInfoHandler, IfInfoHandler, PathRequestHandler, RevNotificationHandler, ServerConfig,
    SvcInfoHandler,
};
pub use messages::{
    deserialize_pld, serialize_pld, Ack, AckCode, AsInfoReply, AsInfoReplyEntry, AsInfoReq,
    HostInfo, IfInfoReply, IfInfoReplyEntry, IfInfoReq, PathErrorCode, PathReply, PathReq,
    PathReqFlags, Pld, PldBody, RequestId, RevNotification, RevReply, SegSync, SvcInfoReply,
    SvcInfoReplyEntry, SvcInfoReq,
};
pub use network::{default_registry, validate_local, NetworkContext, Registry, SUPPORTED_FAMILY};
pub use path::{IfId, Path, PathError, PathInterface, DEFAULT_MTU, HOP_FIELD_LEN};
pub use protocols::{
    AsInspector, DaemonConnector, PathFetcher, ReplySink, RevCache, SegmentHandler,
    SegmentRequester, SegmentStore, Verifier, VerifierFactory,
};
pub use resolver::{PathResolver, Timers};
pub use revocation::{
    classify, verify_srev_info, MemRevCache, RevInfo, RevOutcome, SignedRevInfo, TrustStore,
};
pub use segment::{AsEntry, MemSegmentStore, PathSegment, SegSyncPayload, SegmentId};
pub use segsync::{DefaultSegmentHandler, ProcessedResult, SegmentJob, SyncHandler, SyncStats};
pub use server::PathServer;
pub use topology::{
    IfInfo, LinkType, ServiceType, Topology, TopologyHandle, TopologyInspector,
};
