//! Atomic snapshot handoff between the discovery and polling processes.
//!
//! One JSON file per venue at `<root>/<venue>/state/active_instruments.snapshot.json`.
//! Writes go to a sibling temp file, fsync, then rename; a reader therefore
//! sees either the prior complete file or the new complete file, never a
//! partial one.

use crate::models::ActiveSet;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const SNAPSHOT_FILE: &str = "active_instruments.snapshot.json";

/// Snapshot path for a venue under the output root.
pub fn snapshot_path(root: &Path, venue: &str) -> PathBuf {
    root.join(venue).join("state").join(SNAPSHOT_FILE)
}

/// Serialize the set to a sibling temp file, fsync, and atomically rename
/// over the target. The temp file lives in the same directory so the rename
/// never crosses a filesystem boundary.
pub fn write_snapshot(path: &Path, set: &ActiveSet) -> Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("snapshot path {:?} has no parent directory", path))?;
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create snapshot directory {:?}", dir))?;

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to create snapshot temp file {:?}", tmp))?;
        let body = serde_json::to_vec(set).context("failed to serialize snapshot")?;
        file.write_all(&body)
            .with_context(|| format!("failed to write snapshot temp file {:?}", tmp))?;
        file.sync_all()
            .with_context(|| format!("failed to fsync snapshot temp file {:?}", tmp))?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename snapshot into place at {:?}", path))?;
    Ok(())
}

/// Non-fatal snapshot read failures. The poller keeps its last good (or
/// empty) set and retries on the next read cycle.
#[derive(Debug)]
pub enum SnapshotError {
    /// No snapshot has been written yet.
    Missing,
    /// The file exists but does not parse.
    Corrupt(String),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Missing => write!(f, "snapshot file not found"),
            SnapshotError::Corrupt(msg) => write!(f, "snapshot corrupt: {}", msg),
        }
    }
}

impl std::error::Error for SnapshotError {}

/// Freshness-gated snapshot reader for the polling hot path.
///
/// Tracks the last observed mtime and `asof_ts_utc`; unchanged files are
/// skipped without re-parsing, so the ~1 s read cadence stays cheap.
pub struct SnapshotReader {
    path: PathBuf,
    last_mtime: Option<SystemTime>,
    last_asof: Option<DateTime<Utc>>,
}

impl SnapshotReader {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_mtime: None,
            last_asof: None,
        }
    }

    /// Returns `Ok(Some)` when a newer snapshot was parsed, `Ok(None)` when
    /// the file is unchanged since the last poll.
    pub fn poll(&mut self) -> std::result::Result<Option<ActiveSet>, SnapshotError> {
        let meta = match fs::metadata(&self.path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::Missing)
            }
            Err(e) => return Err(SnapshotError::Corrupt(e.to_string())),
        };
        let mtime = meta.modified().ok();

        if mtime.is_some() && mtime == self.last_mtime {
            return Ok(None);
        }

        let body = fs::read_to_string(&self.path)
            .map_err(|e| SnapshotError::Corrupt(e.to_string()))?;
        let set: ActiveSet =
            serde_json::from_str(&body).map_err(|e| SnapshotError::Corrupt(e.to_string()))?;

        self.last_mtime = mtime;
        if self.last_asof == Some(set.asof_ts_utc) {
            // mtime moved but content generation did not; nothing new.
            return Ok(None);
        }
        self.last_asof = Some(set.asof_ts_utc);
        Ok(Some(set))
    }
}
