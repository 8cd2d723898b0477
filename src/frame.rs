//! Decoded video frames.
//!
//! - `Frame`: immutable RGB8 image behind an `Arc`, cheap to clone so the
//!   supervisor can cache the last good frame while the pipeline uses it.
//! - `BoundingBox`: pixel-space box produced by a detector.
//!
//! Crops clamp the box to the frame. A crop that ends up with zero area is
//! rejected as invalid input rather than producing an empty image.

use anyhow::{Context, Result};
use image::{ImageBuffer, Rgb, RgbImage};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use crate::error::EdgeError;

#[derive(Clone, Debug)]
pub struct Frame {
    data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Wrap RGB8 pixel data. The buffer length must be `width * height * 3`.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if data.len() != expected {
            return Err(EdgeError::invalid_input(format!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                data.len()
            )));
        }
        Ok(Self {
            data: data.into(),
            width,
            height,
        })
    }

    /// Decode a JPEG (or any format the `image` crate was built with).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes).context("decode image")?;
        let rgb = image.into_rgb8();
        let (width, height) = rgb.dimensions();
        Self::from_rgb(rgb.into_raw(), width, height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() || self.width == 0 || self.height == 0
    }

    /// RGB triple at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = ((y as usize) * (self.width as usize) + x as usize) * 3;
        let px = self.data.get(idx..idx + 3)?;
        Some([px[0], px[1], px[2]])
    }

    /// Copy out the region `[x1, x2) x [y1, y2)`, clamped to the frame.
    pub fn crop(&self, bbox: BoundingBox) -> Result<Frame> {
        if self.is_empty() {
            return Err(EdgeError::invalid_input("cannot crop an empty frame"));
        }
        let x1 = bbox.x1.clamp(0, self.width as i64) as usize;
        let y1 = bbox.y1.clamp(0, self.height as i64) as usize;
        let x2 = bbox.x2.clamp(0, self.width as i64) as usize;
        let y2 = bbox.y2.clamp(0, self.height as i64) as usize;
        if x2 <= x1 || y2 <= y1 {
            return Err(EdgeError::invalid_input(format!(
                "crop {:?} has zero area inside {}x{} frame",
                bbox, self.width, self.height
            )));
        }

        let row_bytes = self.width as usize * 3;
        let mut out = Vec::with_capacity((x2 - x1) * (y2 - y1) * 3);
        for row in y1..y2 {
            let start = row * row_bytes + x1 * 3;
            let end = row * row_bytes + x2 * 3;
            out.extend_from_slice(&self.data[start..end]);
        }
        Frame::from_rgb(out, (x2 - x1) as u32, (y2 - y1) as u32)
    }

    /// Nearest-neighbour resize; used to feed fixed-size model inputs.
    pub fn resized(&self, width: u32, height: u32) -> Result<Frame> {
        if self.is_empty() || width == 0 || height == 0 {
            return Err(EdgeError::invalid_input("cannot resize an empty frame"));
        }
        let mut out = Vec::with_capacity(rgb_len(width, height)?);
        for y in 0..height {
            let sy = (y as u64 * self.height as u64 / height as u64) as u32;
            for x in 0..width {
                let sx = (x as u64 * self.width as u64 / width as u64) as u32;
                let px = self
                    .pixel(sx, sy)
                    .ok_or_else(|| EdgeError::invalid_input("resize sampled out of bounds"))?;
                out.extend_from_slice(&px);
            }
        }
        Frame::from_rgb(out, width, height)
    }

    pub fn encode_jpeg(&self) -> Result<Vec<u8>> {
        let image = self.to_image()?;
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Jpeg)
            .context("encode jpeg")?;
        Ok(bytes)
    }

    pub fn save_jpeg(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create snapshot dir {}", parent.display()))?;
        }
        let bytes = self.encode_jpeg()?;
        std::fs::write(path, bytes).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    fn to_image(&self) -> Result<RgbImage> {
        ImageBuffer::<Rgb<u8>, Vec<u8>>::from_raw(self.width, self.height, self.data.to_vec())
            .ok_or_else(|| EdgeError::invalid_input("frame buffer does not match its dimensions"))
    }
}

fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| EdgeError::invalid_input("frame dimensions overflow"))
}

/// Pixel-space box, corners may lie outside the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

impl BoundingBox {
    pub fn new(x1: i64, y1: i64, x2: i64, y2: i64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Whole-frame box.
    pub fn full(frame: &Frame) -> Self {
        Self::new(0, 0, frame.width as i64, frame.height as i64)
    }
}
