//! # Segment Synchronization
//!
//! Path servers push path segments and revocations to each other without
//! being asked. [`SyncHandler`] answers every push with exactly one [`Ack`]:
//!
//! 1. The envelope must carry a `SegSync` body, else `reject`.
//! 2. The raw payload must decode, else `reject` with "failed to parse".
//! 3. The path back to the sender is the reverse of the arrival path.
//! 4. Segments and revocations go to the [`SegmentHandler`] pipeline.
//! 5. The ack waits for the pipeline's completion signal, at most the work
//!    budget; expiry is rejected.
//! 6. A pipeline error is rejected with its text; success is acked `ok`.
//!
//! [`DefaultSegmentHandler`] is the verify-and-store pipeline: every object is
//! verified with one fresh verifier before anything is stored, and any single
//! failure fails the whole push.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::addr::{Addr, HostAddr, ServiceAddr};
use crate::error::SegmentError;
use crate::messages::{Ack, Pld, PldBody};
use crate::path::Path;
use crate::protocols::{ReplySink, RevCache, SegmentHandler, SegmentStore, VerifierFactory};
use crate::revocation::SignedRevInfo;
use crate::segment::{PathSegment, SegSyncPayload};

/// Work handed to a [`SegmentHandler`].
#[derive(Clone, Debug)]
pub struct SegmentJob {
    pub segments: Vec<PathSegment>,
    pub revocations: Vec<SignedRevInfo>,
    /// Path server that pushed the job, addressed by service anycast over the reverse path.
    pub peer: Addr,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub segments_inserted: usize,
    pub revocations_inserted: usize,
}

/// Completion signal of a [`SegmentHandler`] run.
pub struct ProcessedResult {
    done: oneshot::Receiver<Result<SyncStats, SegmentError>>,
}

pub type ProcessedSender = oneshot::Sender<Result<SyncStats, SegmentError>>;

impl ProcessedResult {
    pub fn channel() -> (ProcessedSender, Self) {
        let (tx, done) = oneshot::channel();
        (tx, Self { done })
    }

    /// A result that is already complete.
    pub fn ready(result: Result<SyncStats, SegmentError>) -> Self {
        let (tx, this) = Self::channel();
        let _ = tx.send(result);
        this
    }

    /// Wait until every segment and revocation of the job has been handled.
    /// A pipeline that drops its sender without answering counts as failed.
    pub async fn full_reply_processed(self) -> Result<SyncStats, SegmentError> {
        self.done.await.unwrap_or(Err(SegmentError::Incomplete))
    }
}

// ============================================================================
// Verify-and-Store Pipeline
// ============================================================================

pub struct DefaultSegmentHandler {
    verifiers: Arc<dyn VerifierFactory>,
    store: Arc<dyn SegmentStore>,
    revocations: Arc<dyn RevCache>,
}

impl DefaultSegmentHandler {
    pub fn new(
        verifiers: Arc<dyn VerifierFactory>,
        store: Arc<dyn SegmentStore>,
        revocations: Arc<dyn RevCache>,
    ) -> Self {
        Self {
            verifiers,
            store,
            revocations,
        }
    }
}

impl SegmentHandler for DefaultSegmentHandler {
    fn handle(&self, job: SegmentJob) -> ProcessedResult {
        let (tx, result) = ProcessedResult::channel();
        let verifiers = self.verifiers.clone();
        let store = self.store.clone();
        let revocations = self.revocations.clone();
        tokio::spawn(async move {
            let outcome = verify_and_store(verifiers.as_ref(), store.as_ref(), revocations.as_ref(), job).await;
            let _ = tx.send(outcome);
        });
        result
    }
}

async fn verify_and_store(
    verifiers: &dyn VerifierFactory,
    store: &dyn SegmentStore,
    revocations: &dyn RevCache,
    job: SegmentJob,
) -> Result<SyncStats, SegmentError> {
    let verifier = verifiers.new_verifier();
    for segment in &job.segments {
        verifier.verify_segment(segment).await?;
    }
    let mut infos = Vec::with_capacity(job.revocations.len());
    for srev in &job.revocations {
        let info = srev.rev_info()?;
        verifier.verify_rev(srev, &info).await?;
        infos.push(info);
    }

    let mut stats = SyncStats::default();
    for segment in job.segments {
        if store.insert(segment).await? {
            stats.segments_inserted += 1;
        }
    }
    for info in infos {
        if revocations.insert(info).await? {
            stats.revocations_inserted += 1;
        }
    }
    debug!(
        peer = %job.peer,
        segments = stats.segments_inserted,
        revocations = stats.revocations_inserted,
        "stored pushed segments"
    );
    Ok(stats)
}

// ============================================================================
// Sync Handler
// ============================================================================

pub struct SyncHandler {
    pipeline: Arc<dyn SegmentHandler>,
    work_timeout: Duration,
    reply_timeout: Duration,
}

impl SyncHandler {
    /// `work_timeout` bounds the wait for the pipeline; `reply_timeout` bounds the ack.
    pub fn new(
        pipeline: Arc<dyn SegmentHandler>,
        work_timeout: Duration,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            pipeline,
            work_timeout,
            reply_timeout,
        }
    }

    /// Process one push from `src`. Exactly one ack is sent through `sink`.
    pub async fn handle(
        &self,
        src: &Addr,
        pld: &Pld,
        sink: &dyn ReplySink,
    ) -> Result<SyncStats, SegmentError> {
        let result = self.process(src, pld).await;
        let ack = match &result {
            Ok(_) => Ack::ok(),
            Err(e) => {
                warn!(src = %src, id = pld.id, error = %e, "rejecting segment sync");
                Ack::reject(e.to_string())
            }
        };
        self.send_ack(src, pld, ack, sink).await;
        result
    }

    async fn process(&self, src: &Addr, pld: &Pld) -> Result<SyncStats, SegmentError> {
        let PldBody::SegSync(sync) = &pld.body else {
            return Err(SegmentError::UnexpectedMessage(pld.body.kind()));
        };
        let payload = SegSyncPayload::decode(&sync.raw)?;
        let path = src
            .path
            .as_ref()
            .map(Path::reversed)
            .transpose()
            .map_err(|e| SegmentError::Parse(e.to_string()))?;
        let peer = Addr {
            ia: src.ia,
            host: Some(HostAddr::svc(ServiceAddr::PathServer)),
            path,
            next_hop: src.next_hop,
        };

        let job = SegmentJob {
            segments: payload.segments,
            revocations: payload.revocations,
            peer,
        };
        let processed = self.pipeline.handle(job).full_reply_processed();
        tokio::time::timeout(self.work_timeout, processed)
            .await
            .unwrap_or(Err(SegmentError::Timeout(self.work_timeout)))
    }

    async fn send_ack(&self, src: &Addr, pld: &Pld, ack: Ack, sink: &dyn ReplySink) {
        let reply = pld.reply(PldBody::SegSyncAck(ack));
        match tokio::time::timeout(self.reply_timeout, sink.reply(src, &reply)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(src = %src, id = pld.id, error = %e, "failed to send segment sync ack"),
            Err(_) => warn!(src = %src, id = pld.id, "timed out sending segment sync ack"),
        }
    }
}
