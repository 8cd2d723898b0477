//! HTTP camera source (feature: ingest-mjpeg).
//!
//! Handles `multipart/x-mixed-replace` MJPEG streams as well as endpoints that
//! return a single JPEG per request (snapshot URLs).

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::{Duration, Instant};

use url::Url;

use super::source::{SourceSettings, VideoSource};
use crate::error::EdgeError;
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

enum HttpStream {
    Mjpeg(MjpegStream),
    SingleJpeg,
}

pub struct MjpegHttpSource {
    settings: SourceSettings,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
}

impl MjpegHttpSource {
    pub fn new(settings: SourceSettings) -> Result<Self> {
        let url = Url::parse(&settings.url)
            .map_err(|e| EdgeError::configuration(format!("invalid camera url: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(EdgeError::configuration(format!(
                "unsupported camera scheme '{}'; expected http(s)",
                url.scheme()
            )));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(5))
            .build();
        Ok(Self {
            settings,
            agent,
            stream: None,
            last_frame_at: None,
        })
    }

    fn fetch_single_jpeg(&self) -> Result<Vec<u8>> {
        let response = self
            .agent
            .get(&self.settings.url)
            .call()
            .map_err(|e| EdgeError::transient(format!("fetch jpeg snapshot: {}", e)))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_JPEG_BYTES as u64)
            .read_to_end(&mut bytes)
            .context("read jpeg snapshot")?;
        if bytes.is_empty() {
            return Err(EdgeError::transient("empty jpeg snapshot"));
        }
        Ok(bytes)
    }
}

impl VideoSource for MjpegHttpSource {
    fn describe(&self) -> String {
        self.settings.url.clone()
    }

    fn open(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.settings.url)
            .call()
            .map_err(|e| EdgeError::transient(format!("connect to {}: {}", self.settings.url, e)))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        self.stream = Some(if content_type.contains("multipart") {
            HttpStream::Mjpeg(MjpegStream::new(response.into_reader()))
        } else {
            HttpStream::SingleJpeg
        });
        self.last_frame_at = None;
        Ok(())
    }

    fn is_opened(&self) -> bool {
        self.stream.is_some()
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        let min_interval = frame_interval(self.settings.target_fps);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                std::thread::sleep(min_interval - elapsed);
            }
        }
        let jpeg = match self.stream.as_mut() {
            None => return Err(anyhow!("http source not opened")),
            Some(HttpStream::Mjpeg(stream)) => stream.read_next_jpeg(),
            Some(HttpStream::SingleJpeg) => self.fetch_single_jpeg(),
        };
        let jpeg = match jpeg {
            Ok(jpeg) => jpeg,
            Err(err) => {
                self.stream = None;
                return Err(err);
            }
        };
        let frame = Frame::decode(&jpeg)?;
        self.last_frame_at = Some(Instant::now());
        Ok(Some(frame))
    }

    fn release(&mut self) {
        self.stream = None;
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(frame);
            }

            let read = self
                .reader
                .read(&mut chunk)
                .map_err(|e| EdgeError::transient(format!("read mjpeg chunk: {}", e)))?;
            if read == 0 {
                return Err(EdgeError::transient("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}
