//! Video sources.
//!
//! - `SyntheticSource`: generated frames for `stub://` URLs
//! - `MjpegHttpSource`: HTTP MJPEG/JPEG cameras (feature: ingest-mjpeg)
//! - `GstreamerSource`: RTSP streams and local V4L2 devices (feature: rtsp-gstreamer)
//!
//! Sources are driven by the `ConnectionSupervisor`; they do not retry on
//! their own.

use anyhow::Result;
use rand::Rng;

use crate::error::EdgeError;
use crate::frame::Frame;

/// A single external stream handle.
pub trait VideoSource: Send {
    /// Human-readable location, used in logs.
    fn describe(&self) -> String;

    /// Open (or reopen) the transport.
    fn open(&mut self) -> Result<()>;

    fn is_opened(&self) -> bool;

    /// Next frame. `Ok(None)` means nothing arrived yet; `Err` means the
    /// stream failed.
    fn read(&mut self) -> Result<Option<Frame>>;

    fn release(&mut self);
}

#[derive(Clone, Debug)]
pub struct SourceSettings {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            url: "stub://front_camera".to_string(),
            width: 640,
            height: 480,
            target_fps: 10,
        }
    }
}

/// Pick a source implementation from the URL scheme.
pub fn open_source(settings: &SourceSettings) -> Result<Box<dyn VideoSource>> {
    let url = settings.url.as_str();
    if url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(settings.clone())));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        #[cfg(feature = "ingest-mjpeg")]
        {
            return Ok(Box::new(super::mjpeg::MjpegHttpSource::new(settings.clone())?));
        }
        #[cfg(not(feature = "ingest-mjpeg"))]
        {
            return Err(EdgeError::configuration(format!(
                "{} requires the ingest-mjpeg feature",
                url
            )));
        }
    }
    if url.starts_with("rtsp://") || url.starts_with("/dev/video") {
        #[cfg(feature = "rtsp-gstreamer")]
        {
            return Ok(Box::new(super::gstreamer::GstreamerSource::new(
                settings.clone(),
            )?));
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            return Err(EdgeError::configuration(format!(
                "{} requires the rtsp-gstreamer feature",
                url
            )));
        }
    }
    Err(EdgeError::configuration(format!(
        "unsupported camera source '{}'; expected stub://, http(s)://, rtsp:// or /dev/video*",
        url
    )))
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

/// Generated scene: a static background with a coloured block standing in
/// for a visitor. Every 50 frames the visitor changes.
pub struct SyntheticSource {
    settings: SourceSettings,
    opened: bool,
    frame_count: u64,
    visitor: [u8; 3],
}

impl SyntheticSource {
    pub fn new(settings: SourceSettings) -> Self {
        Self {
            settings,
            opened: false,
            frame_count: 0,
            visitor: [200, 40, 40],
        }
    }

    pub fn frames_generated(&self) -> u64 {
        self.frame_count
    }

    fn generate(&mut self) -> Result<Frame> {
        self.frame_count += 1;
        if self.frame_count.is_multiple_of(50) {
            self.visitor = rand::thread_rng().gen();
        }

        let width = self.settings.width;
        let height = self.settings.height;
        let x1 = width / 3;
        let x2 = 2 * width / 3;
        let y1 = height / 4;
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                if x >= x1 && x < x2 && y >= y1 {
                    pixels.extend_from_slice(&self.visitor);
                } else {
                    let shade = ((x + y) % 64) as u8 + 32;
                    pixels.extend_from_slice(&[shade, shade, shade]);
                }
            }
        }
        Frame::from_rgb(pixels, width, height)
    }
}

impl VideoSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("{} (synthetic)", self.settings.url)
    }

    fn open(&mut self) -> Result<()> {
        self.opened = true;
        Ok(())
    }

    fn is_opened(&self) -> bool {
        self.opened
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if !self.opened {
            return Err(EdgeError::transient("synthetic source not opened"));
        }
        self.generate().map(Some)
    }

    fn release(&mut self) {
        self.opened = false;
    }
}
