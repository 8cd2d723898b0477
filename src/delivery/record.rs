use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static KEY_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// One fact to deliver. `key` decides where the record lands at the sink, so
/// redelivering the same record overwrites rather than duplicates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundRecord {
    pub key: String,
    pub body: serde_json::Value,
}

impl OutboundRecord {
    /// Record with a synthesized key: epoch milliseconds plus a
    /// process-wide sequence number, so keys sort by creation time.
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            key: synthesize_key(now_ms()),
            body,
        }
    }

    pub fn with_key(key: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            body,
        }
    }
}

/// Sink location for a record: `{prefix}/{device_id}/logs/{key}`.
pub fn record_path(prefix: &str, device_id: &str, key: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/logs/{}", device_id, key)
    } else {
        format!("{}/{}/logs/{}", prefix, device_id, key)
    }
}

fn synthesize_key(timestamp_ms: u64) -> String {
    let seq = KEY_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{:013}-{:06}", timestamp_ms, seq % 1_000_000)
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A person sighting as reported upstream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub timestamp_ms: u64,
    pub camera_id: String,
    pub person_hash: String,
    pub is_new: bool,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
}

impl DetectionEvent {
    pub fn into_record(self) -> OutboundRecord {
        let key = synthesize_key(self.timestamp_ms);
        let body = serde_json::to_value(&self).unwrap_or(serde_json::Value::Null);
        OutboundRecord { key, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn synthesized_keys_are_unique() {
        let keys: HashSet<String> = (0..500)
            .map(|_| OutboundRecord::new(serde_json::json!({})).key)
            .collect();
        assert_eq!(keys.len(), 500);
    }

    #[test]
    fn record_path_layout() {
        assert_eq!(
            record_path("/detections/", "cam-1", "k1"),
            "detections/cam-1/logs/k1"
        );
        assert_eq!(record_path("", "cam-1", "k1"), "cam-1/logs/k1");
    }

    #[test]
    fn event_record_keeps_fields() {
        let event = DetectionEvent {
            timestamp_ms: 1_700_000_000_123,
            camera_id: "cam-1".to_string(),
            person_hash: "abcd".to_string(),
            is_new: true,
            confidence: 0.9,
            snapshot: None,
        };
        let record = event.into_record();
        assert!(record.key.starts_with("1700000000123-"));
        assert_eq!(record.body["person_hash"], "abcd");
        assert!(record.body.get("snapshot").is_none());
    }
}
