//! GStreamer-backed source (feature: rtsp-gstreamer).
//!
//! Builds `rtspsrc` pipelines for `rtsp://` URLs and `v4l2src` pipelines for
//! local `/dev/video*` devices. Frames are pulled from an RGB appsink.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use std::time::Duration;

use super::source::{SourceSettings, VideoSource};
use crate::error::EdgeError;
use crate::frame::Frame;

pub struct GstreamerSource {
    settings: SourceSettings,
    pipeline: Option<(gstreamer::Pipeline, gstreamer_app::AppSink)>,
    last_error: Option<String>,
}

impl GstreamerSource {
    pub fn new(settings: SourceSettings) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self {
            settings,
            pipeline: None,
            last_error: None,
        })
    }

    fn pipeline_description(&self) -> String {
        let input = if self.settings.url.starts_with("/dev/video") {
            format!("v4l2src device={}", self.settings.url)
        } else {
            format!("rtspsrc location={} latency=0", self.settings.url)
        };
        format!(
            "{} ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            input
        )
    }

    fn build(&self) -> Result<(gstreamer::Pipeline, gstreamer_app::AppSink)> {
        let pipeline = gstreamer::parse::launch(&self.pipeline_description())
            .context("build camera pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("camera pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);
        Ok((pipeline, appsink))
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.settings.target_fps == 0 {
            500
        } else {
            (1000 / self.settings.target_fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }

    fn poll_bus(&mut self) {
        let Some((pipeline, _)) = self.pipeline.as_ref() else {
            return;
        };
        let Some(bus) = pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

impl VideoSource for GstreamerSource {
    fn describe(&self) -> String {
        self.settings.url.clone()
    }

    fn open(&mut self) -> Result<()> {
        self.release();
        let (pipeline, appsink) = self.build()?;
        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|e| EdgeError::transient(format!("start camera pipeline: {:?}", e)))?;
        self.pipeline = Some((pipeline, appsink));
        self.last_error = None;
        Ok(())
    }

    fn is_opened(&self) -> bool {
        self.pipeline.is_some() && self.last_error.is_none()
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            return Err(EdgeError::transient(err.clone()));
        }
        let timeout = self.frame_timeout();
        let Some((_, appsink)) = self.pipeline.as_ref() else {
            return Err(anyhow!("camera pipeline not opened"));
        };
        let Some(sample) =
            appsink.try_pull_sample(gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64))
        else {
            return Ok(None);
        };
        let (pixels, width, height) = sample_to_pixels(&sample)?;
        Ok(Some(Frame::from_rgb(pixels, width, height)?))
    }

    fn release(&mut self) {
        if let Some((pipeline, _)) = self.pipeline.take() {
            if let Err(err) = pipeline.set_state(gstreamer::State::Null) {
                log::debug!("GstreamerSource: failed to stop pipeline: {:?}", err);
            }
        }
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        self.release();
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("camera sample missing buffer")?;
    let caps = sample.caps().context("camera sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse camera caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map camera buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let packed = data.get(..len).context("camera buffer shorter than frame")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("camera buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
