use std::collections::VecDeque;
use std::time::Instant;

use crate::vector::{cosine_similarity, FeatureVector};

/// A previously seen person.
#[derive(Clone, Debug)]
pub struct KnownIdentity {
    pub vector: FeatureVector,
    pub first_seen: Instant,
    pub id: String,
}

/// Storage and nearest-match lookup for known identities.
///
/// The matcher only talks to this trait, so the linear scan can be replaced
/// by an approximate nearest-neighbour index without touching callers.
pub trait IdentityIndex: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&mut self, identity: KnownIdentity);

    /// Remove entries first seen before `cutoff`. Returns how many were removed.
    fn evict_seen_before(&mut self, cutoff: Instant) -> usize;

    /// Remove the entry with the earliest `first_seen`.
    fn evict_oldest(&mut self) -> Option<KnownIdentity>;

    /// Most similar entry at or above `threshold`.
    fn best_match(&self, query: &FeatureVector, threshold: f32) -> Option<(&KnownIdentity, f32)>;

    fn clear(&mut self);
}

/// O(n) scan over identities kept in insertion order.
#[derive(Debug, Default)]
pub struct LinearIndex {
    entries: VecDeque<KnownIdentity>,
}

impl LinearIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityIndex for LinearIndex {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn insert(&mut self, identity: KnownIdentity) {
        self.entries.push_back(identity);
    }

    fn evict_seen_before(&mut self, cutoff: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.first_seen >= cutoff);
        before - self.entries.len()
    }

    fn evict_oldest(&mut self) -> Option<KnownIdentity> {
        let (idx, _) = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| entry.first_seen)?;
        self.entries.remove(idx)
    }

    fn best_match(&self, query: &FeatureVector, threshold: f32) -> Option<(&KnownIdentity, f32)> {
        let mut best: Option<(&KnownIdentity, f32)> = None;
        for entry in &self.entries {
            let similarity = cosine_similarity(query.as_slice(), entry.vector.as_slice());
            if similarity < threshold {
                continue;
            }
            if best.map_or(true, |(_, s)| similarity > s) {
                best = Some((entry, similarity));
            }
        }
        best
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}
