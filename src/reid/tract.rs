#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::error::EdgeError;
use crate::frame::Frame;
use crate::reid::extractor::FeatureExtractor;
use crate::vector::{l2_normalize, FeatureVector};

/// Per-channel normalisation most person re-id models are trained with.
const CHANNEL_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const CHANNEL_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Common input size for person re-id networks (width x height).
pub const DEFAULT_INPUT_SIZE: (u32, u32) = (128, 256);

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>>;

/// Re-identification embedding model run with tract.
///
/// The model takes one `1x3xHxW` float tensor. Crops are resized to the model
/// input, normalised per channel, and the first output whose length equals
/// the configured feature size is used as the embedding.
pub struct TractExtractor {
    plan: Plan,
    input_width: u32,
    input_height: u32,
}

impl TractExtractor {
    pub fn load(model_path: &Path) -> Result<Self> {
        let (width, height) = DEFAULT_INPUT_SIZE;
        Self::with_input_size(model_path, width, height)
    }

    pub fn with_input_size(model_path: &Path, input_width: u32, input_height: u32) -> Result<Self> {
        if !model_path.is_file() {
            return Err(EdgeError::permanent(format!(
                "re-id model {} not found",
                model_path.display()
            )));
        }
        let shape = tvec!(1, 3, input_height as usize, input_width as usize);
        let plan = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("load re-id model {}", model_path.display()))?
            .with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), shape))
            .context("re-id model input shape")?
            .into_optimized()
            .context("optimize re-id model")?
            .into_runnable()
            .context("prepare re-id model")?;
        log::info!(
            "TractExtractor: loaded {} (input {}x{})",
            model_path.display(),
            input_width,
            input_height
        );
        Ok(Self {
            plan,
            input_width,
            input_height,
        })
    }

    fn to_tensor(&self, crop: &Frame) -> Result<Tensor> {
        let resized = crop.resized(self.input_width, self.input_height)?;
        let rgb = resized.pixels();
        let stride = self.input_width as usize;
        let tensor = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.input_height as usize, stride),
            |(_, c, y, x)| {
                let value = rgb[(y * stride + x) * 3 + c] as f32 / 255.0;
                (value - CHANNEL_MEAN[c]) / CHANNEL_STD[c]
            },
        );
        Ok(tensor.into_tensor())
    }
}

impl FeatureExtractor for TractExtractor {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn extract(&self, crop: &Frame, feature_size: usize) -> Result<FeatureVector> {
        let input = self.to_tensor(crop)?;
        let outputs = self
            .plan
            .run(tvec!(input.into()))
            .context("re-id inference")?;
        if outputs.is_empty() {
            return Err(anyhow!("re-id model produced no outputs"));
        }
        let embedding = outputs
            .iter()
            .find(|t| t.len() == feature_size)
            .ok_or_else(|| {
                EdgeError::invalid_input(format!(
                    "no re-id model output has {} features (got {:?})",
                    feature_size,
                    outputs.iter().map(|t| t.len()).collect::<Vec<_>>()
                ))
            })?;
        let mut values: Vec<f32> = embedding
            .to_array_view::<f32>()
            .context("re-id output is not f32")?
            .iter()
            .copied()
            .collect();
        l2_normalize(&mut values);
        Ok(FeatureVector::new(values))
    }
}
