//! Collaborator traits for the path service and the network context.
//!
//! The handlers and the resolver only depend on these traits, so the
//! in-memory implementations in this crate can be swapped for remote or
//! persistent ones and tests can substitute counting or delaying fakes.
//!
//! ## Traits
//!
//! | Trait | Purpose | Provided implementation |
//! |-------|---------|-------------------------|
//! | [`DaemonConnector`] | Path and topology lookups against a path server | [`crate::DaemonClient`] |
//! | [`AsInspector`] | Core attribute of a scope | [`crate::TopologyInspector`] |
//! | [`PathFetcher`] | Answers path requests | [`crate::SegmentFetcher`] |
//! | [`SegmentRequester`] | Asks upstream servers for segments | embedder-supplied |
//! | [`SegmentStore`] | Stores and queries path segments | [`crate::MemSegmentStore`] |
//! | [`SegmentHandler`] | Verify-and-store pipeline for pushed segments | [`crate::DefaultSegmentHandler`] |
//! | [`VerifierFactory`] / [`Verifier`] | Signature checks on revocations and segments | [`crate::TrustStore`] |
//! | [`RevCache`] | Latest valid revocation per interface | [`crate::MemRevCache`] |
//! | [`ReplySink`] | Sends a handler's reply envelope | [`crate::Connection`] |

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::addr::{Addr, Ia};
use crate::error::{LookupError, RevocationError, SegmentError};
use crate::messages::{
    AsInfoReply, IfInfoReply, PathReply, PathReq, PathReqFlags, Pld, RevReply, SvcInfoReply,
};
use crate::path::IfId;
use crate::revocation::{RevInfo, SignedRevInfo};
use crate::segment::PathSegment;
use crate::segsync::{ProcessedResult, SegmentJob};
use crate::topology::ServiceType;

/// Lookup daemon operations.
#[async_trait]
pub trait DaemonConnector: Send + Sync + 'static {
    /// Up to `max_paths` paths from `src` to `dst`. The reply's error code is
    /// passed through untouched.
    async fn paths(
        &self,
        dst: Ia,
        src: Ia,
        max_paths: u16,
        flags: PathReqFlags,
    ) -> Result<PathReply, LookupError>;

    /// AS information; `Ia::ZERO` asks about the daemon's own scope.
    async fn as_info(&self, ia: Ia) -> Result<AsInfoReply, LookupError>;

    /// Interface information; an empty list asks for every interface.
    async fn if_info(&self, if_ids: &[IfId]) -> Result<IfInfoReply, LookupError>;

    async fn svc_info(&self, types: &[ServiceType]) -> Result<SvcInfoReply, LookupError>;

    async fn rev_notification(&self, srev: SignedRevInfo) -> Result<RevReply, LookupError>;
}

#[async_trait]
pub trait AsInspector: Send + Sync {
    async fn is_core(&self, ia: Ia) -> Result<bool, LookupError>;
}

#[async_trait]
pub trait PathFetcher: Send + Sync {
    /// Answer a path request. Local results may be returned once
    /// `early_reply` has passed while upstream work continues; nothing may
    /// run longer than `work_timeout` on the caller's behalf.
    async fn fetch(&self, req: &PathReq, early_reply: Duration, work_timeout: Duration) -> PathReply;
}

/// Upstream segment source for [`crate::SegmentFetcher::with_requester`].
///
/// The path service wire protocol carries paths and pushed segments but no
/// segment requests, so the crate ships no implementation: embedders plug in
/// their own transport to core or parent path servers. Without one, a
/// fetcher answers from segments pushed to it over segment sync.
#[async_trait]
pub trait SegmentRequester: Send + Sync {
    async fn request_segments(&self, src: Ia, dst: Ia) -> Result<Vec<PathSegment>>;
}

#[async_trait]
pub trait SegmentStore: Send + Sync {
    /// Store a segment. Returns `false` if it was already present.
    async fn insert(&self, segment: PathSegment) -> Result<bool, SegmentError>;

    /// Unexpired segments running from `first` to `last`.
    async fn between(&self, first: Ia, last: Ia) -> Vec<PathSegment>;

    /// Unexpired segments starting at `first`.
    async fn starting_at(&self, first: Ia) -> Vec<PathSegment>;
}

/// Verify-and-store pipeline behind the segment-sync handler.
pub trait SegmentHandler: Send + Sync {
    /// Start processing `job`. The returned result completes once every
    /// segment and revocation has been verified and stored, or on the first failure.
    fn handle(&self, job: SegmentJob) -> ProcessedResult;
}

#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify_rev(&self, srev: &SignedRevInfo, info: &RevInfo) -> Result<(), RevocationError>;

    async fn verify_segment(&self, segment: &PathSegment) -> Result<(), SegmentError>;
}

pub trait VerifierFactory: Send + Sync {
    fn new_verifier(&self) -> Box<dyn Verifier>;
}

#[async_trait]
pub trait RevCache: Send + Sync {
    /// Record a verified claim. Returns `true` if the cache changed.
    async fn insert(&self, info: RevInfo) -> Result<bool, RevocationError>;

    /// The active claim for an interface, if any.
    async fn get(&self, ia: Ia, ifid: IfId) -> Option<RevInfo>;

    async fn len(&self) -> usize;
}

/// Destination for a handler's single reply envelope.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Send `pld` back to `src`, the address the request arrived from.
    async fn reply(&self, src: &Addr, pld: &Pld) -> Result<()>;
}
