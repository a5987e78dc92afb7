//! Write-once persistence of run records.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::protocol::ProtocolRunRecord;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A record with this run id was already written.
    #[error("Run record already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Run record not found: {0}")]
    NotFound(PathBuf),
}

/// Durable storage for finished runs. Records are never updated in place.
pub trait RunStore: Send + Sync {
    /// Persist `record`, returning where it was written.
    fn save(&self, record: &ProtocolRunRecord) -> Result<PathBuf, StoreError>;

    fn load(&self, dataset_id: &str, run_id: &str) -> Result<ProtocolRunRecord, StoreError>;

    /// Run ids stored for `dataset_id`, sorted.
    fn list(&self, dataset_id: &str) -> Result<Vec<String>, StoreError>;
}

/// Stores each record as `<root>/<dataset_id>/<run_id>.json`.
#[derive(Debug, Clone)]
pub struct JsonRunStore {
    root: PathBuf,
}

impl JsonRunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dataset_dir(&self, dataset_id: &str) -> PathBuf {
        self.root.join(path_component(dataset_id))
    }

    fn record_path(&self, dataset_id: &str, run_id: &str) -> PathBuf {
        self.dataset_dir(dataset_id)
            .join(format!("{}.json", path_component(run_id)))
    }
}

/// Replace characters that could escape the store directory.
fn path_component(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{}", cleaned),
        _ => cleaned,
    }
}

impl RunStore for JsonRunStore {
    fn save(&self, record: &ProtocolRunRecord) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(self.dataset_dir(&record.dataset_id))?;
        let path = self.record_path(&record.dataset_id, &record.run_id);
        let json = serde_json::to_vec_pretty(record)?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(path))
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(&json)?;
        file.sync_all()?;

        info!(path = %path.display(), run_id = %record.run_id, "run record written");
        Ok(path)
    }

    fn load(&self, dataset_id: &str, run_id: &str) -> Result<ProtocolRunRecord, StoreError> {
        let path = self.record_path(dataset_id, run_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound(path)),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn list(&self, dataset_id: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.dataset_dir(dataset_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
