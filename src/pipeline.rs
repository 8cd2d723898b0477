//! Capture pipeline: stream frames through detection and re-identification
//! and hand new sightings to the delivery queues.
//!
//! Only new identities are reported. A report consists of:
//! - an entry in the local activity log
//! - a detection record on the record queue
//! - when a snapshot directory is set, a JPEG of the crop queued for upload
//!   under `faces/{id}/{file}`

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use crate::activity::ActivityLog;
use crate::config::{DeliverySettings, StorageSettings};
use crate::delivery::record::now_ms;
use crate::delivery::{
    face_remote_path, BatchSink, DeliveryQueue, DetectionEvent, DirectorySink, FileUpload,
    FlushOutcome, OutboundRecord, UnavailableSink,
};
use crate::detect::PersonDetector;
use crate::error::{EdgeError, ErrorKind};
use crate::frame::Frame;
use crate::reid::IdentityMatcher;
use crate::supervisor::{ConnectionSupervisor, FrameRead};

/// Build the record sink from settings.
///
/// Fails with a configuration error when no database is configured or the
/// HTTP client is not compiled in.
pub fn record_sink(
    settings: &DeliverySettings,
    camera_id: &str,
) -> Result<Arc<dyn BatchSink<OutboundRecord>>> {
    let Some(url) = settings.database_url.as_deref() else {
        return Err(EdgeError::configuration("no database_url configured"));
    };
    #[cfg(feature = "remote-http")]
    {
        let sink = crate::delivery::http::RealtimeDbSink::new(url, &settings.path_prefix, camera_id)?
            .with_auth_token(settings.auth_token.clone());
        Ok(Arc::new(sink))
    }
    #[cfg(not(feature = "remote-http"))]
    {
        let _ = camera_id;
        Err(EdgeError::configuration(format!(
            "database {} requires the remote-http feature",
            url
        )))
    }
}

/// Build the file sink from settings: remote bucket first, then a local
/// directory store.
pub fn file_sink(settings: &StorageSettings) -> Result<Arc<dyn BatchSink<FileUpload>>> {
    if let Some(url) = settings.bucket_url.as_deref() {
        #[cfg(feature = "remote-http")]
        {
            return Ok(Arc::new(crate::delivery::http::ObjectStoreSink::new(url)?));
        }
        #[cfg(not(feature = "remote-http"))]
        {
            return Err(EdgeError::configuration(format!(
                "bucket {} requires the remote-http feature",
                url
            )));
        }
    }
    if let Some(dir) = settings.local_dir.as_ref() {
        return Ok(Arc::new(DirectorySink::new(dir.clone())));
    }
    Err(EdgeError::configuration("no bucket_url or local_dir configured"))
}

/// Use `sink` if it could be built, otherwise the unavailable sink so the
/// queue keeps accepting items in offline mode.
pub fn or_unavailable<T: 'static>(
    component: &str,
    sink: Result<Arc<dyn BatchSink<T>>>,
) -> Arc<dyn BatchSink<T>> {
    match sink {
        Ok(sink) => sink,
        Err(err) => {
            log::warn!(
                "{}: remote disabled ({:#}); running offline, items are kept in memory",
                component,
                err
            );
            Arc::new(UnavailableSink::new(format!("{:#}", err)))
        }
    }
}

pub struct PipelineParts {
    pub camera_id: String,
    pub supervisor: Arc<ConnectionSupervisor>,
    pub detector: Box<dyn PersonDetector>,
    pub matcher: Arc<IdentityMatcher>,
    pub records: Arc<DeliveryQueue<OutboundRecord>>,
    pub uploads: Option<Arc<DeliveryQueue<FileUpload>>>,
    pub activity: Option<Arc<ActivityLog>>,
    pub snapshot_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames: u64,
    pub cached_frames: u64,
    pub missed_frames: u64,
    pub persons: u64,
    pub new_persons: u64,
}

/// What a single [`CapturePipeline::step`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// A live frame was processed; carries the ids of new identities.
    Processed { new_ids: Vec<String> },
    /// Only a cached frame was available; it was not re-processed.
    Cached,
    NoFrame,
}

pub struct CapturePipeline {
    parts: PipelineParts,
    stats: PipelineStats,
}

impl CapturePipeline {
    pub fn new(parts: PipelineParts) -> Self {
        log::info!(
            "CapturePipeline: camera={} detector={} snapshots={}",
            parts.camera_id,
            parts.detector.name(),
            parts
                .snapshot_dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "off".to_string())
        );
        Self {
            parts,
            stats: PipelineStats::default(),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Pull one frame from the supervisor and process it.
    pub fn step(&mut self) -> Result<StepOutcome> {
        match self.parts.supervisor.read() {
            FrameRead::Live(frame) => {
                self.stats.frames += 1;
                let new_ids = self.process_frame(&frame)?;
                Ok(StepOutcome::Processed { new_ids })
            }
            FrameRead::Cached(_) => {
                self.stats.cached_frames += 1;
                Ok(StepOutcome::Cached)
            }
            FrameRead::Unavailable => {
                self.stats.missed_frames += 1;
                Ok(StepOutcome::NoFrame)
            }
        }
    }

    fn process_frame(&mut self, frame: &Frame) -> Result<Vec<String>> {
        let detections = match self.parts.detector.detect(frame) {
            Ok(detections) => detections,
            Err(err) => {
                log::warn!("CapturePipeline: detector failed: {:#}", err);
                return Ok(Vec::new());
            }
        };

        let mut new_ids = Vec::new();
        for detection in detections {
            let crop = match frame.crop(detection.bbox) {
                Ok(crop) => crop,
                Err(err) => {
                    log::debug!("CapturePipeline: skipping detection: {:#}", err);
                    continue;
                }
            };
            let matched = match self.parts.matcher.process(&crop) {
                Ok(matched) => matched,
                Err(err) if EdgeError::classify(&err) == ErrorKind::InvalidInput => {
                    log::debug!("CapturePipeline: skipping crop: {:#}", err);
                    continue;
                }
                Err(err) => return Err(err),
            };
            self.stats.persons += 1;
            if !matched.is_new {
                continue;
            }
            self.stats.new_persons += 1;
            self.report_new(&crop, &matched.id, detection.confidence);
            new_ids.push(matched.id);
        }
        Ok(new_ids)
    }

    fn report_new(&self, crop: &Frame, id: &str, confidence: f32) {
        let timestamp_ms = now_ms();
        let snapshot = self.save_snapshot(crop, id, timestamp_ms);

        let event = DetectionEvent {
            timestamp_ms,
            camera_id: self.parts.camera_id.clone(),
            person_hash: id.to_string(),
            is_new: true,
            confidence,
            snapshot: snapshot.as_ref().map(|(_, remote)| remote.clone()),
        };

        if let Some(activity) = &self.parts.activity {
            if let Err(err) = activity.log_person(&event) {
                log::warn!("CapturePipeline: activity log write failed: {:#}", err);
            }
        }
        self.parts.records.enqueue(event.into_record());

        if let (Some(uploads), Some((local, remote))) = (&self.parts.uploads, snapshot) {
            uploads.enqueue(
                FileUpload::new(local, remote)
                    .with_metadata("camera_id", self.parts.camera_id.clone())
                    .with_metadata("person_hash", id)
                    .with_metadata("timestamp_ms", timestamp_ms.to_string()),
            );
        }
    }

    fn save_snapshot(&self, crop: &Frame, id: &str, timestamp_ms: u64) -> Option<(PathBuf, String)> {
        let dir = self.parts.snapshot_dir.as_ref()?;
        let local = dir.join(format!("{}_{}.jpg", id, timestamp_ms));
        match crop.save_jpeg(&local) {
            Ok(()) => {
                let remote = face_remote_path(id, &local);
                Some((local, remote))
            }
            Err(err) => {
                log::warn!(
                    "CapturePipeline: failed to save snapshot {}: {:#}",
                    local.display(),
                    err
                );
                None
            }
        }
    }

    /// Flush both queues once, then stop them and the supervisor.
    pub fn shutdown(&self) {
        log::info!("CapturePipeline: shutting down");
        self.parts.supervisor.stop();
        report_flush("RecordQueue", self.parts.records.flush());
        self.parts.records.stop();
        if let Some(uploads) = &self.parts.uploads {
            report_flush("FileUploader", uploads.flush());
            uploads.stop();
        }
        log::info!(
            "CapturePipeline: frames={} persons={} new={}",
            self.stats.frames,
            self.stats.persons,
            self.stats.new_persons
        );
    }
}

fn report_flush(component: &str, outcome: FlushOutcome) {
    match outcome {
        FlushOutcome::Drained => log::info!("{}: all items delivered", component),
        FlushOutcome::Offline { pending } | FlushOutcome::TimedOut { pending } => log::warn!(
            "{}: {} item(s) could not be delivered before shutdown",
            component,
            pending
        ),
    }
}
