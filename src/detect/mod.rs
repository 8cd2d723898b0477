mod motion;

use anyhow::Result;

use crate::frame::{BoundingBox, Frame};

pub use motion::MotionDetector;

/// A person found in a frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PersonDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Person detector boundary.
///
/// The model behind it (and its tensor pre/post-processing) lives outside
/// this crate; implementations only have to report pixel-space boxes.
pub trait PersonDetector: Send {
    /// Detector identifier.
    fn name(&self) -> &'static str;

    fn detect(&mut self, frame: &Frame) -> Result<Vec<PersonDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
