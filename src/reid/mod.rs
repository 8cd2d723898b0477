//! Person re-identification.
//!
//! `IdentityMatcher` decides whether a person crop belongs to someone seen
//! within the retention window. Known identities live in memory only:
//!
//! - entries older than `retention` are evicted lazily, at lookup time
//! - the store never holds more than `max_stored_vectors` entries; the oldest
//!   entry is evicted to make room for a new one
//! - a crop matches when cosine similarity against any retained entry reaches
//!   `similarity_threshold`, and the best match's id is returned
//!
//! The full evict, extract, scan, insert sequence runs under one lock, so two
//! concurrent sightings of the same new person cannot both register as new.

pub mod extractor;
pub mod index;
#[cfg(feature = "backend-tract")]
pub mod tract;

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::EdgeError;
use crate::frame::Frame;
use crate::vector::FeatureVector;

pub use extractor::{select_extractor, FeatureExtractor, HistogramExtractor};
pub use index::{IdentityIndex, KnownIdentity, LinearIndex};
#[cfg(feature = "backend-tract")]
pub use tract::TractExtractor;

pub const DEFAULT_FEATURE_SIZE: usize = 128;
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.6;
pub const DEFAULT_RETENTION_SECS: u64 = 3600;
pub const DEFAULT_MAX_STORED_VECTORS: usize = 1000;

#[derive(Clone, Debug)]
pub struct MatcherConfig {
    pub feature_size: usize,
    pub similarity_threshold: f32,
    pub retention: Duration,
    pub max_stored_vectors: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            feature_size: DEFAULT_FEATURE_SIZE,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            max_stored_vectors: DEFAULT_MAX_STORED_VECTORS,
        }
    }
}

impl MatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.feature_size == 0 {
            return Err(EdgeError::configuration("feature_size must be greater than zero"));
        }
        // At zero, every vector would match, even the zero vector.
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(EdgeError::configuration(format!(
                "similarity_threshold {} must be within (0, 1]",
                self.similarity_threshold
            )));
        }
        if self.retention.is_zero() {
            return Err(EdgeError::configuration("retention must be greater than zero"));
        }
        if self.max_stored_vectors == 0 {
            return Err(EdgeError::configuration(
                "max_stored_vectors must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Outcome of [`IdentityMatcher::process`].
#[derive(Clone, Debug, PartialEq)]
pub struct Match {
    pub is_new: bool,
    /// For a new person, the id derived from its vector; otherwise the id of
    /// the stored identity it matched.
    pub id: String,
    /// Similarity of the best stored match, `None` when nothing matched.
    pub similarity: Option<f32>,
}

pub struct IdentityMatcher {
    config: MatcherConfig,
    extractor: Arc<dyn FeatureExtractor>,
    clock: Arc<dyn Clock>,
    index: Mutex<Box<dyn IdentityIndex>>,
}

impl IdentityMatcher {
    pub fn new(config: MatcherConfig, extractor: Arc<dyn FeatureExtractor>) -> Result<Self> {
        Self::with_parts(
            config,
            extractor,
            Arc::new(SystemClock),
            Box::new(LinearIndex::new()),
        )
    }

    pub fn with_parts(
        config: MatcherConfig,
        extractor: Arc<dyn FeatureExtractor>,
        clock: Arc<dyn Clock>,
        index: Box<dyn IdentityIndex>,
    ) -> Result<Self> {
        config.validate()?;
        log::info!(
            "IdentityMatcher: extractor={} feature_size={} threshold={:.2} retention={}s capacity={}",
            extractor.name(),
            config.feature_size,
            config.similarity_threshold,
            config.retention.as_secs(),
            config.max_stored_vectors
        );
        Ok(Self {
            config,
            extractor,
            clock,
            index: Mutex::new(index),
        })
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Classify a person crop as new or already seen.
    pub fn process(&self, crop: &Frame) -> Result<Match> {
        if crop.is_empty() {
            return Err(EdgeError::invalid_input("empty person crop"));
        }

        let mut index = self
            .index
            .lock()
            .map_err(|_| anyhow!("identity index lock poisoned"))?;
        let now = self.clock.now();

        if let Some(cutoff) = now.checked_sub(self.config.retention) {
            let evicted = index.evict_seen_before(cutoff);
            if evicted > 0 {
                log::debug!("IdentityMatcher: evicted {} expired identities", evicted);
            }
        }

        let vector = self.extract(crop)?;
        let id = vector.id();

        if let Some((known, similarity)) =
            index.best_match(&vector, self.config.similarity_threshold)
        {
            return Ok(Match {
                is_new: false,
                id: known.id.clone(),
                similarity: Some(similarity),
            });
        }

        if vector.is_zero() {
            // Nothing can ever match a zero vector; storing it would only burn capacity.
            return Ok(Match {
                is_new: true,
                id,
                similarity: None,
            });
        }

        while index.len() >= self.config.max_stored_vectors {
            if index.evict_oldest().is_none() {
                break;
            }
        }
        index.insert(KnownIdentity {
            vector,
            first_seen: now,
            id: id.clone(),
        });

        Ok(Match {
            is_new: true,
            id,
            similarity: None,
        })
    }

    fn extract(&self, crop: &Frame) -> Result<FeatureVector> {
        let size = self.config.feature_size;
        match self.extractor.extract(crop, size) {
            Ok(vector) if vector.len() == size => Ok(vector),
            Ok(vector) => Err(EdgeError::invalid_input(format!(
                "extractor {} returned {} features, expected {}",
                self.extractor.name(),
                vector.len(),
                size
            ))),
            Err(err) => {
                log::warn!(
                    "IdentityMatcher: feature extraction failed ({}): {:#}",
                    self.extractor.name(),
                    err
                );
                Ok(FeatureVector::zeros(size))
            }
        }
    }

    /// Number of identities currently retained (expired entries included
    /// until the next `process` call).
    pub fn known_count(&self) -> usize {
        self.index.lock().map(|index| index.len()).unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut index) = self.index.lock() {
            index.clear();
        }
    }
}
