use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use super::sink::BatchSink;
use crate::error::EdgeError;

/// A local file to copy to object storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileUpload {
    pub local_path: PathBuf,
    pub remote_path: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl FileUpload {
    pub fn new(local_path: impl Into<PathBuf>, remote_path: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Read the file body. A missing file is a permanent failure.
    pub fn read_body(&self) -> Result<Vec<u8>> {
        match std::fs::read(&self.local_path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == IoErrorKind::NotFound => Err(EdgeError::permanent(format!(
                "local file {} no longer exists",
                self.local_path.display()
            ))),
            Err(err) => Err(EdgeError::transient(format!(
                "read {}: {}",
                self.local_path.display(),
                err
            ))),
        }
    }
}

/// Remote path for a person snapshot: `faces/{identity}/{file name}`.
pub fn face_remote_path(identity: &str, local_path: &Path) -> String {
    let file_name = local_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot.jpg".to_string());
    format!("faces/{}/{}", identity, file_name)
}

/// Object store backed by a local directory, for offline deployments and tests.
///
/// Each upload is written to `root/remote_path`; metadata, when present, goes
/// to a `.meta.json` file next to it.
#[derive(Clone, Debug)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn put(&self, upload: &FileUpload) -> Result<()> {
        let body = upload.read_body()?;
        let relative = upload.remote_path.trim_start_matches('/');
        if relative.split('/').any(|part| part == "..") {
            return Err(EdgeError::invalid_input(format!(
                "remote path {} escapes the store",
                upload.remote_path
            )));
        }
        let dest = self.root.join(relative);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::write(&dest, body).with_context(|| format!("write {}", dest.display()))?;
        if !upload.metadata.is_empty() {
            let meta_path = dest.with_extension("meta.json");
            std::fs::write(&meta_path, serde_json::to_vec_pretty(&upload.metadata)?)
                .with_context(|| format!("write {}", meta_path.display()))?;
        }
        Ok(())
    }
}

impl BatchSink<FileUpload> for DirectorySink {
    fn name(&self) -> &str {
        "directory"
    }

    fn deliver(&self, batch: &[FileUpload]) -> Result<()> {
        for upload in batch {
            self.put(upload)?;
        }
        Ok(())
    }

    fn probe(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("create store root {}", self.root.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn face_path_uses_file_name() {
        assert_eq!(
            face_remote_path("a1b2", Path::new("/var/snapshots/person_1.jpg")),
            "faces/a1b2/person_1.jpg"
        );
    }

    #[test]
    fn missing_file_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path().join("store"));
        let upload = FileUpload::new(dir.path().join("gone.jpg"), "faces/x/gone.jpg");
        let err = sink.deliver(&[upload]).unwrap_err();
        assert_eq!(EdgeError::classify(&err), ErrorKind::PermanentResource);
    }

    #[test]
    fn copies_file_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("p.jpg");
        std::fs::write(&local, b"jpeg").unwrap();
        let sink = DirectorySink::new(dir.path().join("store"));
        let upload = FileUpload::new(&local, "faces/abc/p.jpg").with_metadata("camera_id", "cam-1");
        sink.deliver(&[upload]).unwrap();

        let stored = dir.path().join("store/faces/abc/p.jpg");
        assert_eq!(std::fs::read(&stored).unwrap(), b"jpeg");
        let meta = std::fs::read_to_string(dir.path().join("store/faces/abc/p.meta.json")).unwrap();
        assert!(meta.contains("cam-1"));
    }

    #[test]
    fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("p.jpg");
        std::fs::write(&local, b"jpeg").unwrap();
        let sink = DirectorySink::new(dir.path().join("store"));
        let upload = FileUpload::new(&local, "../outside.jpg");
        assert!(sink.deliver(&[upload]).is_err());
    }
}
