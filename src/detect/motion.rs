use anyhow::Result;
use sha2::{Digest, Sha256};

use super::{PersonDetection, PersonDetector};
use crate::frame::{BoundingBox, Frame};

/// Stand-in detector: reports one whole-frame person whenever the frame
/// content changes from the previous frame.
#[derive(Default)]
pub struct MotionDetector {
    last_hash: Option<[u8; 32]>,
    confidence: f32,
}

impl MotionDetector {
    pub fn new() -> Self {
        Self {
            last_hash: None,
            confidence: 0.85,
        }
    }
}

impl PersonDetector for MotionDetector {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<PersonDetection>> {
        let current_hash: [u8; 32] = Sha256::digest(frame.pixels()).into();
        let motion = self.last_hash.is_some_and(|prev| prev != current_hash);
        self.last_hash = Some(current_hash);

        if motion && !frame.is_empty() {
            Ok(vec![PersonDetection {
                bbox: BoundingBox::full(frame),
                confidence: self.confidence,
            }])
        } else {
            Ok(Vec::new())
        }
    }
}
