//! Checkpoint snapshots for resumable imports.
//!
//! Epistemic foundation:
//! - K_i: One JSON file per snapshot, named `<operation_id>-<UTC timestamp>.json`
//! - K_i: Snapshots are written atomically (write-then-rename)
//! - K_i: "Latest" = newest modification time
//! - B_i: Checkpoint may not exist → Option
//! - I^B: A snapshot may be unreadable → skipped, next newest is used

use crate::models::{ImportError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// A single progress snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    pub operation_id: String,
    /// File backing this snapshot
    #[serde(skip)]
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CheckpointState {
    /// Integer progress value, if present.
    pub fn progress_u64(&self, key: &str) -> Option<u64> {
        self.progress.get(key).and_then(Value::as_u64)
    }
}

/// Manages the snapshots of one operation.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    /// Directory for checkpoint files
    dir: PathBuf,
    operation_id: String,
}

impl CheckpointManager {
    /// Create a new checkpoint manager.
    pub fn new(dir: &Path, operation_id: &str) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| ImportError::io("creating checkpoint dir", e))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            operation_id: operation_id.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Write a new snapshot.
    pub fn checkpoint(
        &self,
        progress: Map<String, Value>,
        metadata: Map<String, Value>,
    ) -> Result<CheckpointState> {
        let state = CheckpointState {
            operation_id: self.operation_id.clone(),
            path: self.next_path(),
            created_at: Utc::now(),
            updated_at: None,
            progress,
            metadata,
        };
        self.save(&state)?;
        info!(path = %state.path.display(), "Checkpoint created");
        Ok(state)
    }

    /// Load the snapshot with the newest modification time.
    pub fn load_checkpoint(&self) -> Result<Option<CheckpointState>> {
        for path in self.list_checkpoints()? {
            match Self::read(&path) {
                Ok(state) => return Ok(Some(state)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint");
                }
            }
        }
        Ok(None)
    }

    /// Rewrite the latest snapshot in place, creating one if none exists.
    ///
    /// Progress is replaced; metadata is replaced only when given. The original
    /// `created_at` is preserved.
    pub fn update_checkpoint(
        &self,
        progress: Map<String, Value>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<CheckpointState> {
        let Some(mut state) = self.load_checkpoint()? else {
            return self.checkpoint(progress, metadata.unwrap_or_default());
        };

        state.progress = progress;
        if let Some(metadata) = metadata {
            state.metadata = metadata;
        }
        state.updated_at = Some(Utc::now());
        self.save(&state)?;
        debug!(path = %state.path.display(), "Checkpoint updated");
        Ok(state)
    }

    /// Delete snapshots at least `keep_days` old. Returns the number removed.
    pub fn cleanup_old_checkpoints(&self, keep_days: u32) -> Result<usize> {
        let max_age = Duration::from_secs(u64::from(keep_days) * 24 * 60 * 60);
        let now = SystemTime::now();
        let mut removed = 0;

        for path in self.list_checkpoints()? {
            let age = Self::modified(&path)
                .and_then(|t| now.duration_since(t).ok())
                .unwrap_or(Duration::ZERO);
            if age >= max_age {
                fs::remove_file(&path)
                    .map_err(|e| ImportError::io("removing old checkpoint", e))?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, keep_days, "Old checkpoints cleaned up");
        }
        Ok(removed)
    }

    /// Purge every snapshot of this operation.
    pub fn delete_all(&self) -> Result<usize> {
        let paths = self.list_checkpoints()?;
        for path in &paths {
            fs::remove_file(path).map_err(|e| ImportError::io("removing checkpoint", e))?;
        }
        info!(removed = paths.len(), "All checkpoints deleted");
        Ok(paths.len())
    }

    /// Snapshot files of this operation, newest first.
    pub fn list_checkpoints(&self) -> Result<Vec<PathBuf>> {
        let pattern = self.dir.join(format!(
            "{}-*.json",
            glob::Pattern::escape(&self.operation_id)
        ));
        let pattern_str = pattern.to_string_lossy();

        let mut files: Vec<(Option<SystemTime>, PathBuf)> = glob::glob(&pattern_str)
            .map_err(|e| ImportError::Internal(format!("Invalid glob pattern: {e}")))?
            .filter_map(|r| r.ok())
            .filter(|p| self.owns(p))
            .map(|p| (Self::modified(&p), p))
            .collect();

        files.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        Ok(files.into_iter().map(|(_, p)| p).collect())
    }

    /// Snapshot stamps start with `YYYYMMDDT`; IDs extending ours (`op` vs `op-2`) do not.
    fn owns(&self, path: &Path) -> bool {
        let stamp = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(self.operation_id.as_str()))
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|rest| rest.strip_suffix(".json"));

        stamp.is_some_and(|s| {
            let bytes = s.as_bytes();
            bytes.len() > 9 && bytes[..8].iter().all(u8::is_ascii_digit) && bytes[8] == b'T'
        })
    }

    fn next_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%6fZ");
        let mut path = self.dir.join(format!("{}-{stamp}.json", self.operation_id));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("{}-{stamp}-{n}.json", self.operation_id));
            n += 1;
        }
        path
    }

    fn modified(path: &Path) -> Option<SystemTime> {
        fs::metadata(path).and_then(|m| m.modified()).ok()
    }

    fn read(path: &Path) -> Result<CheckpointState> {
        let content =
            fs::read_to_string(path).map_err(|e| ImportError::io("reading checkpoint", e))?;
        let mut state: CheckpointState = serde_json::from_str(&content)
            .map_err(|e| ImportError::Parse(format!("Invalid checkpoint: {e}")))?;
        state.path = path.to_path_buf();
        Ok(state)
    }

    /// Save a snapshot (atomic write).
    fn save(&self, state: &CheckpointState) -> Result<()> {
        let content = serde_json::to_string_pretty(state)?;

        let temp_path = state.path.with_extension("json.tmp");
        fs::write(&temp_path, content)
            .map_err(|e| ImportError::io("writing temp checkpoint", e))?;
        fs::rename(&temp_path, &state.path)
            .map_err(|e| ImportError::io("renaming checkpoint", e))?;
        Ok(())
    }
}
