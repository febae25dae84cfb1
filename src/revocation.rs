//! # Revocations
//!
//! A revocation is a signed claim by a scope that one of its interfaces is
//! down for a bounded validity window. Path servers verify claims before
//! trusting them and keep the latest valid claim per (scope, interface) in a
//! [`RevCache`].
//!
//! ## Verification Flow
//!
//! 1. Extract the [`RevInfo`] from the signed blob; a malformed blob fails
//!    without any cryptographic work.
//! 2. Hand the claim to a fresh [`Verifier`] from the [`VerifierFactory`].
//! 3. Classify the result with [`classify`]. The extracted claim is returned
//!    even when verification fails so callers can log it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::trace;

use crate::addr::Ia;
use crate::crypto::{
    sign_with_domain, verify_with_domain, REVOCATION_SIGNATURE_DOMAIN, SEGMENT_SIGNATURE_DOMAIN,
};
use crate::error::{RevocationError, SegmentError};
use crate::messages::deserialize_bounded;
use crate::path::IfId;
use crate::protocols::{RevCache, Verifier, VerifierFactory};
use crate::segment::PathSegment;
use crate::topology::LinkType;

/// Shortest validity window a revocation may carry.
pub const MIN_REV_TTL: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevInfo {
    pub ia: Ia,
    pub ifid: IfId,
    pub link_type: LinkType,
    /// Issuing time, seconds since the Unix epoch.
    pub timestamp: u64,
    /// Validity window in seconds, starting at `timestamp`.
    pub ttl: u32,
}

impl RevInfo {
    /// A claim issued now, valid for `ttl` (at least [`MIN_REV_TTL`]).
    pub fn issue(ia: Ia, ifid: IfId, link_type: LinkType, ttl: Duration) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            ia,
            ifid,
            link_type,
            timestamp,
            ttl: ttl.max(MIN_REV_TTL).as_secs() as u32,
        }
    }

    /// End of the validity window, `None` when it is not representable.
    pub fn expiry(&self) -> Option<SystemTime> {
        let secs = self.timestamp.checked_add(u64::from(self.ttl))?;
        UNIX_EPOCH.checked_add(Duration::from_secs(secs))
    }

    /// A claim whose window cannot be represented is never active.
    pub fn is_active_at(&self, now: SystemTime) -> bool {
        self.expiry().is_some_and(|expiry| now < expiry)
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(SystemTime::now())
    }
}

/// Encoded [`RevInfo`] plus the issuing scope's signature over it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRevInfo {
    pub blob: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedRevInfo {
    pub fn sign(info: &RevInfo, key: &SigningKey) -> Result<Self, bincode::Error> {
        let blob = bincode::serialize(info)?;
        let signature = sign_with_domain(key, REVOCATION_SIGNATURE_DOMAIN, &blob);
        Ok(Self { blob, signature })
    }

    pub fn rev_info(&self) -> Result<RevInfo, RevocationError> {
        let info: RevInfo = deserialize_bounded(&self.blob)
            .map_err(|e| RevocationError::Malformed(e.to_string()))?;
        if info.expiry().is_none() {
            return Err(RevocationError::Malformed(format!(
                "validity window overflows: timestamp {} ttl {}",
                info.timestamp, info.ttl
            )));
        }
        Ok(info)
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Outcome reported back to the sender of a revocation notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RevOutcome {
    Valid,
    /// Not produced yet: reserved for claims superseded by a newer one.
    Stale,
    /// Not produced yet: reserved for claims that are authentic but inconsistent.
    Invalid,
    Unknown,
}

pub fn classify(result: &Result<(), RevocationError>) -> RevOutcome {
    match result {
        Ok(()) => RevOutcome::Valid,
        Err(_) => RevOutcome::Unknown,
    }
}

/// Extract and verify a claim.
///
/// The returned claim is `None` only when extraction itself failed.
pub async fn verify_srev_info(
    factory: &dyn VerifierFactory,
    srev: &SignedRevInfo,
) -> (Option<RevInfo>, Result<(), RevocationError>) {
    let info = match srev.rev_info() {
        Ok(info) => info,
        Err(e) => return (None, Err(e)),
    };
    let verifier = factory.new_verifier();
    let result = verifier.verify_rev(srev, &info).await;
    (Some(info), result)
}

// ============================================================================
// Trust Store
// ============================================================================

/// [`VerifierFactory`] over a fixed IA -> Ed25519 key table.
#[derive(Clone, Default)]
pub struct TrustStore {
    keys: Arc<HashMap<Ia, VerifyingKey>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, ia: Ia, key: VerifyingKey) -> Self {
        Arc::make_mut(&mut self.keys).insert(ia, key);
        self
    }

    pub fn key(&self, ia: Ia) -> Option<&VerifyingKey> {
        self.keys.get(&ia)
    }
}

impl VerifierFactory for TrustStore {
    fn new_verifier(&self) -> Box<dyn Verifier> {
        Box::new(TrustStoreVerifier {
            keys: self.keys.clone(),
        })
    }
}

struct TrustStoreVerifier {
    keys: Arc<HashMap<Ia, VerifyingKey>>,
}

#[async_trait]
impl Verifier for TrustStoreVerifier {
    async fn verify_rev(&self, srev: &SignedRevInfo, info: &RevInfo) -> Result<(), RevocationError> {
        let key = self
            .keys
            .get(&info.ia)
            .ok_or(RevocationError::UnknownSigner(info.ia))?;
        verify_with_domain(key, REVOCATION_SIGNATURE_DOMAIN, &srev.blob, &srev.signature)
            .map_err(|e| RevocationError::Verification(e.to_string()))
    }

    async fn verify_segment(&self, segment: &PathSegment) -> Result<(), SegmentError> {
        let id = hex::encode(&segment.id()[..8]);
        let reject = |reason: String| SegmentError::Verification {
            id: id.clone(),
            reason,
        };
        let origin = segment
            .first_ia()
            .ok_or_else(|| reject("segment has no AS entries".to_string()))?;
        if segment.is_expired() {
            return Err(reject("segment expired".to_string()));
        }
        let key = self
            .keys
            .get(&origin)
            .ok_or_else(|| reject(format!("no verification key for {}", origin)))?;
        let data = segment
            .signing_bytes()
            .map_err(|e| reject(e.to_string()))?;
        verify_with_domain(key, SEGMENT_SIGNATURE_DOMAIN, &data, &segment.signature)
            .map_err(|e| reject(e.to_string()))
    }
}

// ============================================================================
// Revocation Cache
// ============================================================================

/// In-memory [`RevCache`]. Inserts hold the write lock for the whole
/// compare-and-replace, so concurrent inserts for one key are atomic.
#[derive(Clone, Default)]
pub struct MemRevCache {
    entries: Arc<RwLock<HashMap<(Ia, IfId), RevInfo>>>,
}

impl MemRevCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries whose validity window has passed. Returns the number removed.
    pub async fn purge_expired(&self) -> usize {
        let now = SystemTime::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, info| info.is_active_at(now));
        before - entries.len()
    }
}

#[async_trait]
impl RevCache for MemRevCache {
    async fn insert(&self, info: RevInfo) -> Result<bool, RevocationError> {
        if !info.is_active() {
            trace!(ia = %info.ia, ifid = info.ifid, "ignoring expired revocation");
            return Ok(false);
        }
        let mut entries = self.entries.write().await;
        let key = (info.ia, info.ifid);
        match entries.get(&key) {
            Some(existing) if existing.is_active() && existing.timestamp >= info.timestamp => Ok(false),
            _ => {
                entries.insert(key, info);
                Ok(true)
            }
        }
    }

    async fn get(&self, ia: Ia, ifid: IfId) -> Option<RevInfo> {
        self.entries
            .read()
            .await
            .get(&(ia, ifid))
            .filter(|info| info.is_active())
            .cloned()
    }

    async fn len(&self) -> usize {
        let now = SystemTime::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|info| info.is_active_at(now))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_signing_key;

    fn ia(s: &str) -> Ia {
        s.parse().unwrap()
    }

    fn signed(key: &SigningKey) -> (RevInfo, SignedRevInfo) {
        let info = RevInfo::issue(ia("1-ff00:0:111"), 5, LinkType::Parent, Duration::from_secs(60));
        let srev = SignedRevInfo::sign(&info, key).unwrap();
        (info, srev)
    }

    #[tokio::test]
    async fn valid_claim_verifies() {
        let key = generate_signing_key();
        let store = TrustStore::new().with_key(ia("1-ff00:0:111"), key.verifying_key());
        let (info, srev) = signed(&key);

        let (extracted, result) = verify_srev_info(&store, &srev).await;
        assert_eq!(extracted, Some(info));
        assert_eq!(classify(&result), RevOutcome::Valid);
    }

    #[tokio::test]
    async fn wrong_signer_is_unknown_but_extracted() {
        let key = generate_signing_key();
        let other = generate_signing_key();
        let store = TrustStore::new().with_key(ia("1-ff00:0:111"), other.verifying_key());
        let (info, srev) = signed(&key);

        let (extracted, result) = verify_srev_info(&store, &srev).await;
        assert_eq!(extracted, Some(info));
        assert!(matches!(result, Err(RevocationError::Verification(_))));
        assert_eq!(classify(&result), RevOutcome::Unknown);
    }

    #[tokio::test]
    async fn unknown_signer() {
        let key = generate_signing_key();
        let (_, srev) = signed(&key);
        let (_, result) = verify_srev_info(&TrustStore::new(), &srev).await;
        assert_eq!(result, Err(RevocationError::UnknownSigner(ia("1-ff00:0:111"))));
    }

    #[tokio::test]
    async fn malformed_blob_fails_before_verification() {
        let srev = SignedRevInfo {
            blob: vec![1, 2, 3],
            signature: vec![],
        };
        let (extracted, result) = verify_srev_info(&TrustStore::new(), &srev).await;
        assert!(extracted.is_none());
        assert!(matches!(result, Err(RevocationError::Malformed(_))));
    }

    #[tokio::test]
    async fn overflowing_window_is_malformed() {
        let key = generate_signing_key();
        let store = TrustStore::new().with_key(ia("1-ff00:0:111"), key.verifying_key());
        let mut info = RevInfo::issue(ia("1-ff00:0:111"), 5, LinkType::Parent, Duration::from_secs(60));
        info.timestamp = u64::MAX - 5;
        let srev = SignedRevInfo::sign(&info, &key).unwrap();

        assert_eq!(info.expiry(), None);
        assert!(!info.is_active());
        let (extracted, result) = verify_srev_info(&store, &srev).await;
        assert!(extracted.is_none());
        assert!(matches!(result, Err(RevocationError::Malformed(_))));
        assert_eq!(classify(&result), RevOutcome::Unknown);
    }

    #[tokio::test]
    async fn overflowing_window_is_never_cached() {
        let cache = MemRevCache::new();
        let mut info = RevInfo::issue(ia("1-ff00:0:111"), 5, LinkType::Parent, Duration::from_secs(60));
        info.timestamp = u64::MAX;

        assert!(!cache.insert(info.clone()).await.unwrap());
        assert_eq!(cache.get(info.ia, 5).await, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn cache_insert_is_idempotent() {
        let cache = MemRevCache::new();
        let info = RevInfo::issue(ia("1-ff00:0:111"), 5, LinkType::Parent, Duration::from_secs(60));

        assert!(cache.insert(info.clone()).await.unwrap());
        assert!(!cache.insert(info.clone()).await.unwrap());
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get(info.ia, 5).await, Some(info));
    }

    #[tokio::test]
    async fn cache_keeps_newest_claim() {
        let cache = MemRevCache::new();
        let mut older = RevInfo::issue(ia("1-ff00:0:111"), 5, LinkType::Parent, Duration::from_secs(60));
        older.timestamp -= 5;
        let newer = RevInfo::issue(ia("1-ff00:0:111"), 5, LinkType::Parent, Duration::from_secs(60));

        assert!(cache.insert(older.clone()).await.unwrap());
        assert!(cache.insert(newer.clone()).await.unwrap());
        assert!(!cache.insert(older).await.unwrap());
        assert_eq!(cache.get(newer.ia, 5).await, Some(newer));
    }

    #[tokio::test]
    async fn expired_claims_are_not_cached() {
        let cache = MemRevCache::new();
        let mut info = RevInfo::issue(ia("1-ff00:0:111"), 5, LinkType::Parent, MIN_REV_TTL);
        info.timestamp -= 3600;

        assert!(!cache.insert(info).await.unwrap());
        assert_eq!(cache.len().await, 0);
        assert_eq!(cache.purge_expired().await, 0);
    }
}
