use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Elements,
    Shots,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Submitted,
    Completed,
    Failed,
}

/// One unit of generation work, persisted across runs.
///
/// `request` is the opaque submission payload; the store never inspects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub key: String,
    pub phase: Phase,
    #[serde(default)]
    pub request: serde_json::Value,
    pub status: WorkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_recorded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

impl WorkItem {
    pub fn new(key: impl Into<String>, phase: Phase, request: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            phase,
            request,
            status: WorkStatus::Pending,
            task_id: None,
            url: None,
            url_recorded_at: None,
            output_path: None,
            error: None,
            attempts: 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == WorkStatus::Completed
    }

    /// The recorded remote URL, if present and younger than `ttl`.
    ///
    /// Remote file storage expires uploads, so an old URL must be treated as
    /// absent rather than passed to a downstream request.
    pub fn fresh_url(&self, ttl: Duration, now: DateTime<Utc>) -> Option<&str> {
        let url = self.url.as_deref()?;
        let recorded = self.url_recorded_at?;
        if now - recorded < ttl {
            Some(url)
        } else {
            None
        }
    }

    pub fn record_url(&mut self, url: impl Into<String>) {
        self.url = Some(url.into());
        self.url_recorded_at = Some(Utc::now());
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    items: BTreeMap<String, WorkItem>,
}

/// Durable key -> WorkItem mapping, one JSON file per collection scope.
///
/// Loaded fully at start; every mutation goes through `upsert`, which
/// rewrites the whole file via write-temp-then-rename so a crash mid-write
/// leaves either the old or the new file, never a truncated one.
#[derive(Debug)]
pub struct StatusStore {
    path: PathBuf,
    items: BTreeMap<String, WorkItem>,
}

impl StatusStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let items = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let file: StoreFile =
                    serde_json::from_str(&content).map_err(|source| PipelineError::CorruptState {
                        path: path.clone(),
                        source,
                    })?;
                file.items
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, items })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&WorkItem> {
        self.items.get(key)
    }

    pub fn all(&self) -> impl Iterator<Item = (&String, &WorkItem)> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Replace the record under `item.key` and flush the whole store to disk.
    pub fn upsert(&mut self, item: WorkItem) -> Result<()> {
        self.items.insert(item.key.clone(), item);
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let file = StoreFile {
            items: self.items.clone(),
        };
        let body = serde_json::to_vec_pretty(&file)?;

        // Temp file in the target directory so the rename stays on one
        // filesystem and is atomic.
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&body)?;
        tmp.flush()?;
        tmp.persist(&self.path)
            .map_err(|err| PipelineError::Io(err.error))?;
        Ok(())
    }
}
