//! Local activity log.
//!
//! Every person sighting is appended to a JSON array on disk so the device
//! keeps a local record even when the remote database is unreachable.
//! Entries older than `retention_days` are dropped when the log is opened.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::delivery::record::now_ms;
use crate::delivery::DetectionEvent;

const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub record_time_ms: u64,
    pub camera_id: String,
    #[serde(flatten)]
    pub event: serde_json::Map<String, serde_json::Value>,
}

pub struct ActivityLog {
    path: PathBuf,
    camera_id: String,
    entries: Mutex<Vec<ActivityEntry>>,
}

impl ActivityLog {
    /// Open (or create) the log and apply retention.
    pub fn open(path: impl Into<PathBuf>, camera_id: &str, retention_days: u32) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create activity log dir {}", parent.display()))?;
        }
        let mut entries = load_entries(&path);
        let cutoff = now_ms().saturating_sub(retention_days as u64 * MS_PER_DAY);
        let before = entries.len();
        entries.retain(|entry| entry.record_time_ms >= cutoff);
        if entries.len() != before {
            log::info!(
                "ActivityLog: dropped {} entries older than {} days",
                before - entries.len(),
                retention_days
            );
        }
        let log = Self {
            path,
            camera_id: camera_id.to_string(),
            entries: Mutex::new(entries),
        };
        log.save()?;
        log::info!("ActivityLog: recording to {}", log.path.display());
        Ok(log)
    }

    pub fn log_person(&self, event: &DetectionEvent) -> Result<()> {
        let mut fields = match serde_json::to_value(event)? {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        let camera_id = match fields.remove("camera_id") {
            Some(serde_json::Value::String(id)) if !id.is_empty() => id,
            _ => self.camera_id.clone(),
        };
        let entry = ActivityEntry {
            record_time_ms: now_ms(),
            camera_id,
            event: fields,
        };
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.push(entry);
        }
        log::info!("ActivityLog: person detected: {}", event.person_hash);
        self.save()
    }

    /// The last `count` entries, oldest first.
    pub fn recent(&self, count: usize) -> Vec<ActivityEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let start = entries.len().saturating_sub(count);
        entries[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn save(&self) -> Result<()> {
        let json = {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            serde_json::to_vec_pretty(&*entries)?
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        Ok(())
    }
}

fn load_entries(path: &Path) -> Vec<ActivityEntry> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return Vec::new(),
    };
    match serde_json::from_str(&raw) {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!(
                "ActivityLog: {} is not a valid log ({}); starting fresh",
                path.display(),
                err
            );
            Vec::new()
        }
    }
}
