//! Feature vector primitives.
//!
//! Pure functions over fixed-length `f32` embeddings. Similarity is clamped
//! to `[0, 1]` and any zero-norm operand compares as `0.0`, so a failed
//! extraction can never match a stored identity.

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::error::EdgeError;

/// Length of the hex identifier derived from a vector.
pub const VECTOR_ID_LEN: usize = 16;

/// Immutable embedding of a cropped person image.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureVector {
    values: Box<[f32]>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values: values.into_boxed_slice(),
        }
    }

    /// All-zero vector, used when extraction fails.
    pub fn zeros(len: usize) -> Self {
        Self::new(vec![0.0; len])
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|v| *v == 0.0)
    }

    /// Content-derived identifier: stable for equal vectors.
    pub fn id(&self) -> String {
        vector_id(&self.values)
    }
}

impl From<Vec<f32>> for FeatureVector {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

fn norm(v: &[f32]) -> f64 {
    v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt()
}

/// Cosine similarity clamped to `[0, 1]`.
///
/// Returns `0.0` when either vector has zero norm or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let norm_a = norm(a);
    let norm_b = norm(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum();
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0) as f32
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(EdgeError::invalid_input(format!(
            "vector length mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    let sum: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = (*x as f64) - (*y as f64);
            d * d
        })
        .sum();
    Ok(sum.sqrt() as f32)
}

/// Scale to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let n = norm(v);
    if n > 0.0 {
        for x in v.iter_mut() {
            *x = (*x as f64 / n) as f32;
        }
    }
}

/// Element-wise mean. `Ok(None)` for an empty input.
pub fn average_vectors(vectors: &[FeatureVector]) -> Result<Option<FeatureVector>> {
    let Some(first) = vectors.first() else {
        return Ok(None);
    };
    let len = first.len();
    let mut acc = vec![0f64; len];
    for v in vectors {
        if v.len() != len {
            return Err(EdgeError::invalid_input(format!(
                "cannot average vectors of length {} and {}",
                len,
                v.len()
            )));
        }
        for (slot, x) in acc.iter_mut().zip(v.as_slice()) {
            *slot += *x as f64;
        }
    }
    let count = vectors.len() as f64;
    Ok(Some(FeatureVector::new(
        acc.into_iter().map(|x| (x / count) as f32).collect(),
    )))
}

pub fn vector_to_bytes(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

pub fn vector_from_bytes(bytes: &[u8]) -> Result<FeatureVector> {
    if bytes.len() % 4 != 0 {
        return Err(EdgeError::invalid_input(format!(
            "vector byte length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(FeatureVector::new(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    ))
}

/// Hex SHA-256 prefix of the little-endian vector bytes.
pub fn vector_id(v: &[f32]) -> String {
    let digest = Sha256::digest(vector_to_bytes(v));
    let mut id = hex::encode(digest);
    id.truncate(VECTOR_ID_LEN);
    id
}
