//! MANTA edge appliance.
//!
//! Detects people in a camera stream, recognises repeat visitors, and reports
//! new sightings to a remote backend over an unreliable network.
//!
//! # Architecture
//!
//! - `vector`: similarity primitives over feature vectors
//! - `reid`: `IdentityMatcher`, the in-memory store of recently seen people
//! - `delivery`: `DeliveryQueue`, batched delivery with offline mode and retry
//! - `supervisor`: `ConnectionSupervisor`, keeps the camera stream alive
//! - `pipeline`: wires frames through detection, matching and delivery
//!
//! Ambient pieces: `config` (JSON file plus `MANTA_*` environment),
//! `error` (failure taxonomy), `status` (observer for mode changes and
//! reconnects), `activity` (local JSON activity log).

pub mod activity;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod detect;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod reid;
pub mod status;
pub mod supervisor;
pub mod vector;
pub mod worker;

pub use activity::{ActivityEntry, ActivityLog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EdgeConfig;
pub use delivery::{
    BatchSink, DeliveryQueue, DetectionEvent, FileUpload, FlushOutcome, OutboundRecord,
    QueueConfig, QueueStats, UnavailableSink,
};
pub use detect::{MotionDetector, PersonDetection, PersonDetector};
pub use error::{EdgeError, ErrorKind};
pub use frame::{BoundingBox, Frame};
pub use pipeline::{CapturePipeline, PipelineParts, PipelineStats, StepOutcome};
pub use reid::{FeatureExtractor, HistogramExtractor, IdentityMatcher, Match, MatcherConfig};
pub use status::{LogObserver, Mode, NullObserver, StatusObserver};
pub use supervisor::{
    ConnectionSupervisor, FrameRead, LinkJoiner, NoLink, SourceSettings, SupervisorConfig,
    SupervisorStats, VideoSource,
};
pub use vector::{cosine_similarity, FeatureVector};
