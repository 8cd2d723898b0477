//! HTTP sinks (feature: remote-http).
//!
//! - `RealtimeDbSink`: JSON realtime database reached over REST. A batch is a
//!   single multi-key `PATCH` on `{prefix}/{device}/logs`, so it either lands
//!   whole or not at all.
//! - `ObjectStoreSink`: blob store accepting `PUT {base}/{remote_path}`.
//!
//! Both classify failures for the queue: payloads the server rejects outright
//! are permanent, everything else is retried.

use anyhow::Result;
use std::time::Duration;

use super::files::FileUpload;
use super::record::OutboundRecord;
use super::sink::BatchSink;
use crate::error::EdgeError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

fn agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(timeout)
        .timeout(timeout)
        .build()
}

fn classify(context: &str, err: ureq::Error) -> anyhow::Error {
    match err {
        ureq::Error::Status(code, _) if matches!(code, 400 | 413 | 422) => {
            EdgeError::permanent(format!("{}: server rejected payload with {}", context, code))
        }
        ureq::Error::Status(code, _) => {
            EdgeError::transient(format!("{}: server returned {}", context, code))
        }
        ureq::Error::Transport(transport) => {
            EdgeError::transient(format!("{}: {}", context, transport))
        }
    }
}

pub struct RealtimeDbSink {
    agent: ureq::Agent,
    base_url: String,
    path_prefix: String,
    device_id: String,
    auth_token: Option<String>,
}

impl RealtimeDbSink {
    pub fn new(base_url: &str, path_prefix: &str, device_id: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(EdgeError::configuration("database url is empty"));
        }
        if device_id.trim().is_empty() {
            return Err(EdgeError::configuration("device id is empty"));
        }
        Ok(Self {
            agent: agent(DEFAULT_TIMEOUT),
            base_url,
            path_prefix: path_prefix.trim_matches('/').to_string(),
            device_id: device_id.to_string(),
            auth_token: None,
        })
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    fn logs_url(&self, query: &str) -> String {
        let path = if self.path_prefix.is_empty() {
            format!("{}/logs", self.device_id)
        } else {
            format!("{}/{}/logs", self.path_prefix, self.device_id)
        };
        let mut url = format!("{}/{}.json", self.base_url, path);
        let mut params: Vec<String> = Vec::new();
        if !query.is_empty() {
            params.push(query.to_string());
        }
        if let Some(token) = &self.auth_token {
            params.push(format!("auth={}", token));
        }
        if !params.is_empty() {
            url.push('?');
            url.push_str(&params.join("&"));
        }
        url
    }
}

impl BatchSink<OutboundRecord> for RealtimeDbSink {
    fn name(&self) -> &str {
        "realtime-db"
    }

    fn deliver(&self, batch: &[OutboundRecord]) -> Result<()> {
        let mut body = serde_json::Map::with_capacity(batch.len());
        for record in batch {
            body.insert(record.key.clone(), record.body.clone());
        }
        self.agent
            .patch(&self.logs_url(""))
            .send_json(serde_json::Value::Object(body))
            .map_err(|e| classify("patch logs", e))?;
        Ok(())
    }

    fn probe(&self) -> Result<()> {
        match self.agent.get(&self.logs_url("shallow=true")).call() {
            Ok(_) => Ok(()),
            // Reads may be denied while writes are allowed; any answer will do.
            Err(ureq::Error::Status(_, _)) => Ok(()),
            Err(err) => Err(classify("probe database", err)),
        }
    }
}

pub struct ObjectStoreSink {
    agent: ureq::Agent,
    base_url: String,
}

impl ObjectStoreSink {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(EdgeError::configuration("storage url is empty"));
        }
        Ok(Self {
            agent: agent(Duration::from_secs(30)),
            base_url,
        })
    }

    fn object_url(&self, remote_path: &str) -> String {
        format!("{}/{}", self.base_url, remote_path.trim_start_matches('/'))
    }

    fn put(&self, upload: &FileUpload) -> Result<()> {
        let body = upload.read_body()?;
        let content_type = match upload.local_path.extension().and_then(|e| e.to_str()) {
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("png") => "image/png",
            Some("json") => "application/json",
            _ => "application/octet-stream",
        };
        let mut request = self
            .agent
            .put(&self.object_url(&upload.remote_path))
            .set("Content-Type", content_type);
        for (key, value) in &upload.metadata {
            request = request.set(&format!("x-meta-{}", key), value);
        }
        request
            .send_bytes(&body)
            .map_err(|e| classify(&format!("upload {}", upload.remote_path), e))?;
        Ok(())
    }
}

impl BatchSink<FileUpload> for ObjectStoreSink {
    fn name(&self) -> &str {
        "object-store"
    }

    fn deliver(&self, batch: &[FileUpload]) -> Result<()> {
        for upload in batch {
            self.put(upload)?;
        }
        Ok(())
    }

    fn probe(&self) -> Result<()> {
        match self.agent.head(&self.base_url).call() {
            Ok(_) => Ok(()),
            // Any HTTP answer means the store is reachable.
            Err(ureq::Error::Status(_, _)) => Ok(()),
            Err(err) => Err(classify("probe object store", err)),
        }
    }
}
