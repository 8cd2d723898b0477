use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::delivery::QueueConfig;
use crate::error::EdgeError;
use crate::reid::MatcherConfig;
use crate::supervisor::{SourceSettings, SupervisorConfig};

const DEFAULT_CAMERA_ID: &str = "camera-01";
const DEFAULT_CAMERA_SOURCE: &str = "stub://front_camera";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 10;
const DEFAULT_PATH_PREFIX: &str = "detections";
const DEFAULT_RECORD_BATCH_SIZE: usize = 10;
const DEFAULT_RECORD_RETRY_SECS: u64 = 60;
const DEFAULT_UPLOAD_WORKERS: usize = 2;
const DEFAULT_UPLOAD_RETRY_SECS: u64 = 60;
const DEFAULT_SNAPSHOT_DIR: &str = "snapshots";
const DEFAULT_ACTIVITY_PATH: &str = "logs/activity.json";
const DEFAULT_ACTIVITY_RETENTION_DAYS: u32 = 7;

#[derive(Debug, Deserialize, Default)]
struct EdgeConfigFile {
    camera_id: Option<String>,
    camera: Option<CameraConfigFile>,
    wifi: Option<WifiConfigFile>,
    reid: Option<ReidConfigFile>,
    delivery: Option<DeliveryConfigFile>,
    storage: Option<StorageConfigFile>,
    activity: Option<ActivityConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    connection_timeout_secs: Option<u64>,
    retry_interval_secs: Option<u64>,
    staleness_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct WifiConfigFile {
    ssid: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ReidConfigFile {
    feature_size: Option<usize>,
    similarity_threshold: Option<f32>,
    retention_secs: Option<u64>,
    max_stored_vectors: Option<usize>,
    model_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct DeliveryConfigFile {
    database_url: Option<String>,
    path_prefix: Option<String>,
    auth_token: Option<String>,
    batch_size: Option<usize>,
    retry_interval_secs: Option<u64>,
    workers: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    bucket_url: Option<String>,
    local_dir: Option<PathBuf>,
    snapshot_dir: Option<PathBuf>,
    workers: Option<usize>,
    retry_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ActivityConfigFile {
    path: Option<PathBuf>,
    retention_days: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub camera_id: String,
    pub camera: CameraSettings,
    pub wifi: Option<WifiSettings>,
    pub reid: ReidSettings,
    pub delivery: DeliverySettings,
    pub storage: StorageSettings,
    pub activity: ActivitySettings,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub source: SourceSettings,
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone)]
pub struct WifiSettings {
    pub ssid: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReidSettings {
    pub matcher: MatcherConfig,
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    /// Realtime database base URL. `None` runs the record queue offline.
    pub database_url: Option<String>,
    pub path_prefix: String,
    pub auth_token: Option<String>,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Object store base URL. Takes precedence over `local_dir`.
    pub bucket_url: Option<String>,
    /// Directory acting as the object store when no bucket is configured.
    pub local_dir: Option<PathBuf>,
    pub snapshot_dir: PathBuf,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone)]
pub struct ActivitySettings {
    pub path: PathBuf,
    pub retention_days: u32,
}

impl EdgeConfig {
    /// Load from `MANTA_CONFIG` (if set), apply environment overrides, validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("MANTA_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => EdgeConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EdgeConfigFile) -> Self {
        let camera_file = file.camera.unwrap_or_default();
        let supervisor_defaults = SupervisorConfig::default();
        let camera = CameraSettings {
            source: SourceSettings {
                url: camera_file
                    .source
                    .unwrap_or_else(|| DEFAULT_CAMERA_SOURCE.to_string()),
                width: camera_file.width.unwrap_or(DEFAULT_WIDTH),
                height: camera_file.height.unwrap_or(DEFAULT_HEIGHT),
                target_fps: camera_file.target_fps.unwrap_or(DEFAULT_FPS),
            },
            supervisor: SupervisorConfig {
                connection_timeout: secs_or(
                    camera_file.connection_timeout_secs,
                    supervisor_defaults.connection_timeout,
                ),
                retry_interval: secs_or(
                    camera_file.retry_interval_secs,
                    supervisor_defaults.retry_interval,
                ),
                staleness_timeout: secs_or(
                    camera_file.staleness_timeout_secs,
                    supervisor_defaults.staleness_timeout,
                ),
                ..supervisor_defaults
            },
        };

        let wifi = file.wifi.and_then(|wifi| {
            wifi.ssid
                .filter(|ssid| !ssid.trim().is_empty())
                .map(|ssid| WifiSettings {
                    ssid,
                    password: wifi.password,
                })
        });

        let reid_file = file.reid.unwrap_or_default();
        let matcher_defaults = MatcherConfig::default();
        let reid = ReidSettings {
            matcher: MatcherConfig {
                feature_size: reid_file.feature_size.unwrap_or(matcher_defaults.feature_size),
                similarity_threshold: reid_file
                    .similarity_threshold
                    .unwrap_or(matcher_defaults.similarity_threshold),
                retention: secs_or(reid_file.retention_secs, matcher_defaults.retention),
                max_stored_vectors: reid_file
                    .max_stored_vectors
                    .unwrap_or(matcher_defaults.max_stored_vectors),
            },
            model_path: reid_file.model_path,
        };

        let delivery_file = file.delivery.unwrap_or_default();
        let delivery = DeliverySettings {
            database_url: non_empty(delivery_file.database_url),
            path_prefix: delivery_file
                .path_prefix
                .unwrap_or_else(|| DEFAULT_PATH_PREFIX.to_string()),
            auth_token: non_empty(delivery_file.auth_token),
            queue: QueueConfig {
                batch_size: delivery_file.batch_size.unwrap_or(DEFAULT_RECORD_BATCH_SIZE),
                retry_interval: Duration::from_secs(
                    delivery_file
                        .retry_interval_secs
                        .unwrap_or(DEFAULT_RECORD_RETRY_SECS),
                ),
                workers: delivery_file.workers.unwrap_or(1),
                ..QueueConfig::named("RecordQueue")
            },
        };

        let storage_file = file.storage.unwrap_or_default();
        let storage = StorageSettings {
            bucket_url: non_empty(storage_file.bucket_url),
            local_dir: storage_file.local_dir,
            snapshot_dir: storage_file
                .snapshot_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR)),
            queue: QueueConfig {
                batch_size: 1,
                retry_interval: Duration::from_secs(
                    storage_file
                        .retry_interval_secs
                        .unwrap_or(DEFAULT_UPLOAD_RETRY_SECS),
                ),
                workers: storage_file.workers.unwrap_or(DEFAULT_UPLOAD_WORKERS),
                pop_timeout: Duration::from_secs(1),
                ..QueueConfig::named("FileUploader")
            },
        };

        let activity_file = file.activity.unwrap_or_default();
        let activity = ActivitySettings {
            path: activity_file
                .path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ACTIVITY_PATH)),
            retention_days: activity_file
                .retention_days
                .unwrap_or(DEFAULT_ACTIVITY_RETENTION_DAYS),
        };

        Self {
            camera_id: file
                .camera_id
                .unwrap_or_else(|| DEFAULT_CAMERA_ID.to_string()),
            camera,
            wifi,
            reid,
            delivery,
            storage,
            activity,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(id) = env_string("MANTA_CAMERA_ID") {
            self.camera_id = id;
        }
        if let Some(source) = env_string("MANTA_CAMERA_SOURCE") {
            self.camera.source.url = source;
        }
        if let Some(url) = env_string("MANTA_DATABASE_URL") {
            self.delivery.database_url = Some(url);
        }
        if let Some(url) = env_string("MANTA_STORAGE_URL") {
            self.storage.bucket_url = Some(url);
        }
        if let Some(size) = env_parse::<usize>("MANTA_BATCH_SIZE", "an integer")? {
            self.delivery.queue.batch_size = size;
        }
        if let Some(secs) = env_parse::<u64>("MANTA_RETRY_INTERVAL_SECS", "an integer number of seconds")? {
            self.delivery.queue.retry_interval = Duration::from_secs(secs);
            self.storage.queue.retry_interval = Duration::from_secs(secs);
        }
        if let Some(threshold) = env_parse::<f32>("MANTA_SIMILARITY_THRESHOLD", "a number")? {
            self.reid.matcher.similarity_threshold = threshold;
        }
        if let Some(secs) = env_parse::<u64>("MANTA_RETENTION_SECS", "an integer number of seconds")? {
            self.reid.matcher.retention = Duration::from_secs(secs);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.camera_id = self.camera_id.trim().to_string();
        if self.camera_id.is_empty() {
            return Err(EdgeError::configuration("camera_id must not be empty"));
        }
        if self.camera_id.contains('/') {
            return Err(EdgeError::configuration(format!(
                "camera_id '{}' must not contain '/'",
                self.camera_id
            )));
        }
        if self.camera.supervisor.staleness_timeout.is_zero() {
            return Err(EdgeError::configuration(
                "camera staleness timeout must be greater than zero",
            ));
        }
        self.reid.matcher.validate()?;
        self.delivery.queue.validate()?;
        self.storage.queue.validate()?;
        if self.activity.retention_days == 0 {
            return Err(EdgeError::configuration(
                "activity retention_days must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<EdgeConfigFile> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        EdgeError::configuration(format!(
            "failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    let cfg = serde_json::from_str(&raw).map_err(|e| {
        EdgeError::configuration(format!("invalid config file {}: {}", path.display(), e))
    })?;
    Ok(cfg)
}

fn secs_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, what: &str) -> Result<Option<T>> {
    match env_string(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| EdgeError::configuration(format!("{} must be {}", key, what))),
        None => Ok(None),
    }
}
