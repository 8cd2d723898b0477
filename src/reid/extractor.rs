use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::error::EdgeError;
use crate::frame::Frame;
use crate::vector::{l2_normalize, FeatureVector};

/// Turns a person crop into a fixed-length embedding.
///
/// Implementations must be deterministic for identical input so repeated
/// sightings of the same crop map onto the same identity.
pub trait FeatureExtractor: Send + Sync {
    /// Extractor identifier.
    fn name(&self) -> &'static str;

    fn extract(&self, crop: &Frame, feature_size: usize) -> Result<FeatureVector>;
}

/// Colour-histogram embedding, used when no model is available.
///
/// Bins are interleaved across the R, G and B channels: slot `i` counts
/// channel `i % 3` in bucket `i / 3`. The result is L2-normalised.
#[derive(Clone, Copy, Debug, Default)]
pub struct HistogramExtractor;

impl HistogramExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl FeatureExtractor for HistogramExtractor {
    fn name(&self) -> &'static str {
        "histogram"
    }

    fn extract(&self, crop: &Frame, feature_size: usize) -> Result<FeatureVector> {
        if crop.is_empty() {
            return Err(EdgeError::invalid_input("cannot extract features from empty crop"));
        }
        if feature_size == 0 {
            return Err(EdgeError::invalid_input("feature_size must be non-zero"));
        }
        let buckets = feature_size.div_ceil(3);
        let mut hist = vec![0f32; feature_size];
        for px in crop.pixels().chunks_exact(3) {
            for (channel, value) in px.iter().enumerate() {
                let bucket = (*value as usize) * buckets / 256;
                let slot = bucket * 3 + channel;
                if let Some(count) = hist.get_mut(slot) {
                    *count += 1.0;
                }
            }
        }
        l2_normalize(&mut hist);
        Ok(FeatureVector::new(hist))
    }
}

/// Pick the model-backed extractor when one is configured and loads,
/// otherwise fall back to the histogram extractor.
pub fn select_extractor(model_path: Option<&Path>) -> Arc<dyn FeatureExtractor> {
    let Some(path) = model_path else {
        log::info!("IdentityMatcher: no re-id model configured; using histogram features");
        return Arc::new(HistogramExtractor::new());
    };
    if !path.exists() {
        log::warn!(
            "IdentityMatcher: re-id model {} not found; using histogram features",
            path.display()
        );
        return Arc::new(HistogramExtractor::new());
    }
    load_model(path)
}

#[cfg(feature = "backend-tract")]
fn load_model(path: &Path) -> Arc<dyn FeatureExtractor> {
    match super::tract::TractExtractor::load(path) {
        Ok(extractor) => Arc::new(extractor),
        Err(err) => {
            log::warn!(
                "IdentityMatcher: failed to load re-id model {}: {:#}; using histogram features",
                path.display(),
                err
            );
            Arc::new(HistogramExtractor::new())
        }
    }
}

#[cfg(not(feature = "backend-tract"))]
fn load_model(path: &Path) -> Arc<dyn FeatureExtractor> {
    log::warn!(
        "IdentityMatcher: re-id model {} requires the backend-tract feature; using histogram features",
        path.display()
    );
    Arc::new(HistogramExtractor::new())
}
