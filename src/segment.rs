//! # Path Segments
//!
//! A [`PathSegment`] is one signed piece of a path between two scopes, made of
//! ordered AS entries. Path servers push segments to each other through the
//! segment-sync protocol and join them into end-to-end [`Path`]s on request.
//!
//! Segment identity is content-addressed: `blake3(signing_bytes)`, so the
//! same segment pushed twice by different peers is stored once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::addr::Ia;
use crate::crypto::{sign_with_domain, SEGMENT_SIGNATURE_DOMAIN};
use crate::error::SegmentError;
use crate::messages::deserialize_bounded;
use crate::path::{IfId, Path, PathInterface};
use crate::protocols::SegmentStore;
use crate::revocation::SignedRevInfo;

pub type SegmentId = [u8; 32];

/// One AS traversed by a segment. Interface 0 marks the segment's ends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsEntry {
    pub ia: Ia,
    pub ingress: IfId,
    pub egress: IfId,
    pub hop_field: Vec<u8>,
    pub mtu: u16,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSegment {
    pub entries: Vec<AsEntry>,
    pub expiry: SystemTime,
    /// Origin scope's signature over [`PathSegment::signing_bytes`].
    pub signature: Vec<u8>,
}

impl PathSegment {
    pub fn new(entries: Vec<AsEntry>, expiry: SystemTime) -> Self {
        Self {
            entries,
            expiry,
            signature: Vec::new(),
        }
    }

    /// Sign as the origin (first) scope.
    pub fn signed(mut self, key: &SigningKey) -> Result<Self, bincode::Error> {
        let data = self.signing_bytes()?;
        self.signature = sign_with_domain(key, SEGMENT_SIGNATURE_DOMAIN, &data);
        Ok(self)
    }

    /// Canonical content covered by the signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(&(&self.entries, self.expiry))
    }

    pub fn id(&self) -> SegmentId {
        let mut hasher = blake3::Hasher::new();
        for entry in &self.entries {
            hasher.update(&entry.ia.raw().to_be_bytes());
            hasher.update(&entry.ingress.to_be_bytes());
            hasher.update(&entry.egress.to_be_bytes());
            hasher.update(&entry.hop_field);
        }
        if let Ok(since) = self.expiry.duration_since(SystemTime::UNIX_EPOCH) {
            hasher.update(&since.as_secs().to_be_bytes());
        }
        *hasher.finalize().as_bytes()
    }

    pub fn first_ia(&self) -> Option<Ia> {
        self.entries.first().map(|e| e.ia)
    }

    pub fn last_ia(&self) -> Option<Ia> {
        self.entries.last().map(|e| e.ia)
    }

    pub fn is_expired(&self) -> bool {
        self.expiry <= SystemTime::now()
    }

    pub fn interfaces(&self) -> Vec<PathInterface> {
        let mut out = Vec::with_capacity(self.entries.len() * 2);
        for entry in &self.entries {
            if entry.ingress != 0 {
                out.push(PathInterface::new(entry.ia, entry.ingress));
            }
            if entry.egress != 0 {
                out.push(PathInterface::new(entry.ia, entry.egress));
            }
        }
        out
    }

    pub fn mtu(&self) -> u16 {
        self.entries.iter().map(|e| e.mtu).min().unwrap_or(0)
    }

    /// Forwarding path following this segment and then each of `rest`.
    ///
    /// Consecutive segments must meet at a shared scope; the caller checks
    /// that before joining.
    pub fn join(&self, rest: &[&PathSegment]) -> Path {
        let mut raw = Vec::new();
        let mut interfaces = Vec::new();
        let mut mtu = self.mtu();
        let mut expiry = self.expiry;
        for seg in std::iter::once(self).chain(rest.iter().copied()) {
            for entry in &seg.entries {
                raw.extend_from_slice(&entry.hop_field);
            }
            interfaces.extend(seg.interfaces());
            mtu = mtu.min(seg.mtu());
            expiry = expiry.min(seg.expiry);
        }
        Path::new(raw, interfaces, mtu, expiry, None)
    }
}

/// Body of a segment-sync push.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegSyncPayload {
    pub segments: Vec<PathSegment>,
    pub revocations: Vec<SignedRevInfo>,
}

impl SegSyncPayload {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, SegmentError> {
        deserialize_bounded(raw).map_err(|e| SegmentError::Parse(e.to_string()))
    }
}

// ============================================================================
// In-Memory Store
// ============================================================================

#[derive(Default)]
struct StoreState {
    by_id: HashMap<SegmentId, PathSegment>,
    by_ends: HashMap<(Ia, Ia), HashSet<SegmentId>>,
}

/// [`SegmentStore`] keeping segments in memory, indexed by (first IA, last IA).
#[derive(Clone, Default)]
pub struct MemSegmentStore {
    state: Arc<RwLock<StoreState>>,
}

impl MemSegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn purge_expired(&self) -> usize {
        let mut state = self.state.write().await;
        let expired: Vec<SegmentId> = state
            .by_id
            .iter()
            .filter(|(_, seg)| seg.is_expired())
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(seg) = state.by_id.remove(id)
                && let (Some(first), Some(last)) = (seg.first_ia(), seg.last_ia())
                && let Some(ids) = state.by_ends.get_mut(&(first, last))
            {
                ids.remove(id);
            }
        }
        state.by_ends.retain(|_, ids| !ids.is_empty());
        expired.len()
    }
}

#[async_trait]
impl SegmentStore for MemSegmentStore {
    async fn insert(&self, segment: PathSegment) -> Result<bool, SegmentError> {
        let (Some(first), Some(last)) = (segment.first_ia(), segment.last_ia()) else {
            return Err(SegmentError::Store("segment has no AS entries".to_string()));
        };
        let id = segment.id();
        let mut state = self.state.write().await;
        if state.by_id.contains_key(&id) {
            return Ok(false);
        }
        state.by_id.insert(id, segment);
        state.by_ends.entry((first, last)).or_default().insert(id);
        Ok(true)
    }

    async fn between(&self, first: Ia, last: Ia) -> Vec<PathSegment> {
        let state = self.state.read().await;
        state
            .by_ends
            .get(&(first, last))
            .into_iter()
            .flatten()
            .filter_map(|id| state.by_id.get(id))
            .filter(|seg| !seg.is_expired())
            .cloned()
            .collect()
    }

    async fn starting_at(&self, first: Ia) -> Vec<PathSegment> {
        let state = self.state.read().await;
        state
            .by_id
            .values()
            .filter(|seg| seg.first_ia() == Some(first) && !seg.is_expired())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::HOP_FIELD_LEN;
    use std::time::Duration;

    fn ia(s: &str) -> Ia {
        s.parse().unwrap()
    }

    fn entry(ia_s: &str, ingress: IfId, egress: IfId) -> AsEntry {
        AsEntry {
            ia: ia(ia_s),
            ingress,
            egress,
            hop_field: vec![ingress as u8; HOP_FIELD_LEN],
            mtu: 1400,
        }
    }

    fn segment(a: &str, b: &str, a_if: IfId, b_if: IfId) -> PathSegment {
        PathSegment::new(
            vec![entry(a, 0, a_if), entry(b, b_if, 0)],
            SystemTime::now() + Duration::from_secs(600),
        )
    }

    #[test]
    fn join_concatenates_segments() {
        let up = segment("1-ff00:0:110", "1-ff00:0:120", 1, 2);
        let down = segment("1-ff00:0:120", "1-ff00:0:111", 3, 4);
        let path = up.join(&[&down]);

        assert_eq!(path.hop_count(), 4);
        let ifids: Vec<IfId> = path.interfaces().iter().map(|i| i.ifid).collect();
        assert_eq!(ifids, vec![1, 2, 3, 4]);
        assert_eq!(path.interfaces()[1].ia, ia("1-ff00:0:120"));
    }

    #[test]
    fn id_is_content_addressed() {
        let a = segment("1-ff00:0:110", "1-ff00:0:120", 1, 2);
        let b = a.clone();
        let c = segment("1-ff00:0:110", "1-ff00:0:120", 1, 3);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn payload_decode_rejects_garbage() {
        assert!(matches!(
            SegSyncPayload::decode(&[9, 9, 9]),
            Err(SegmentError::Parse(_))
        ));
        let payload = SegSyncPayload {
            segments: vec![segment("1-ff00:0:110", "1-ff00:0:120", 1, 2)],
            revocations: vec![],
        };
        assert_eq!(SegSyncPayload::decode(&payload.encode().unwrap()).unwrap(), payload);
    }

    #[tokio::test]
    async fn store_dedups_and_indexes_by_ends() {
        let store = MemSegmentStore::new();
        let seg = segment("1-ff00:0:110", "1-ff00:0:120", 1, 2);

        assert!(store.insert(seg.clone()).await.unwrap());
        assert!(!store.insert(seg.clone()).await.unwrap());
        assert_eq!(store.len().await, 1);
        assert_eq!(store.between(ia("1-ff00:0:110"), ia("1-ff00:0:120")).await, vec![seg]);
        assert!(store.between(ia("1-ff00:0:120"), ia("1-ff00:0:110")).await.is_empty());
        assert_eq!(store.starting_at(ia("1-ff00:0:110")).await.len(), 1);
    }

    #[tokio::test]
    async fn store_rejects_empty_and_purges_expired() {
        let store = MemSegmentStore::new();
        let empty = PathSegment::new(vec![], SystemTime::now());
        assert!(store.insert(empty).await.is_err());

        let mut stale = segment("1-ff00:0:110", "1-ff00:0:120", 1, 2);
        stale.expiry = SystemTime::now() - Duration::from_secs(1);
        assert!(store.insert(stale).await.unwrap());
        assert!(store.between(ia("1-ff00:0:110"), ia("1-ff00:0:120")).await.is_empty());
        assert_eq!(store.purge_expired().await, 1);
        assert!(store.is_empty().await);
    }
}
