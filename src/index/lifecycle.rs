//! Index directory lifecycle: `status.json`, version document, and
//! corruption-triggered rebuild.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tantivy::schema::Schema;
use tantivy::Index;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::timefmt;

/// Bumped whenever the on-disk schema or document conventions change in a
/// way that makes an existing index unreadable by a newer build.
pub const INDEX_VERSION: u32 = 1;

/// The index's startup/shutdown lifecycle state, mirrored into
/// `status.json` so a client can tell "no match" apart from "not yet ready".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Loading,
    Scanning,
    Monitoring,
    Closed,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Status {
    pub version: u32,
    pub status: LifecycleState,
    pub time: String,
    pub last_volatile_commit_unix: i64,
    pub last_persistent_commit_unix: i64,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            status: LifecycleState::Loading,
            time: timefmt::format_iso8601(timefmt::unix_now()),
            last_volatile_commit_unix: 0,
            last_persistent_commit_unix: 0,
        }
    }
}

fn status_path(dir: &Path) -> PathBuf {
    dir.join("status.json")
}

pub fn read_status(dir: &Path) -> Option<Status> {
    let text = std::fs::read_to_string(status_path(dir)).ok()?;
    serde_json::from_str(&text).ok()
}

pub fn write_status(dir: &Path, status: &Status) -> Result<()> {
    let text = serde_json::to_string_pretty(status).map_err(|e| Error::IndexCorruption(dir.to_path_buf(), e.to_string()))?;
    std::fs::write(status_path(dir), text)?;
    Ok(())
}

/// Updates just the lifecycle state and timestamp, preserving the rest of
/// `status.json`.
pub fn set_status(dir: &Path, state: LifecycleState) -> Result<()> {
    let mut status = read_status(dir).unwrap_or_default();
    status.status = state;
    status.time = timefmt::format_iso8601(timefmt::unix_now());
    write_status(dir, &status)
}

/// Opens the index at `dir`, creating it if absent. If `status.json` names
/// an incompatible version, or the directory exists but fails to open as a
/// tantivy index, the directory is wiped and a fresh index is created in
/// its place.
pub fn open_or_rebuild(dir: &Path, schema: Schema) -> Result<Index> {
    std::fs::create_dir_all(dir)?;

    if let Some(status) = read_status(dir) {
        if status.version != INDEX_VERSION {
            warn!(dir = %dir.display(), on_disk = status.version, expected = INDEX_VERSION, "index version mismatch, rebuilding");
            return rebuild(dir, schema);
        }
    }

    match Index::open_in_dir(dir) {
        Ok(index) => {
            info!(dir = %dir.display(), "opened existing index");
            Ok(index)
        }
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "index directory present but unreadable, rebuilding");
            rebuild(dir, schema)
        }
    }
}

fn rebuild(dir: &Path, schema: Schema) -> Result<Index> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::remove_file(entry.path())?;
        }
    }
    let index = Index::create_in_dir(dir, schema)?;
    write_status(dir, &Status::default())?;
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::schema;

    #[test]
    fn opens_fresh_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let (schema, _) = schema::build();
        let index = open_or_rebuild(tmp.path(), schema).unwrap();
        assert!(index.schema().fields().count() > 0);
        assert!(status_path(tmp.path()).exists());
    }

    #[test]
    fn set_status_updates_state_and_timestamp() {
        let tmp = tempfile::tempdir().unwrap();
        let (schema, _) = schema::build();
        open_or_rebuild(tmp.path(), schema).unwrap();
        assert_eq!(read_status(tmp.path()).unwrap().status, LifecycleState::Loading);
        set_status(tmp.path(), LifecycleState::Monitoring).unwrap();
        let status = read_status(tmp.path()).unwrap();
        assert_eq!(status.status, LifecycleState::Monitoring);
        assert!(!status.time.is_empty());
    }

    #[test]
    fn rebuilds_on_version_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let (schema, _) = schema::build();
        open_or_rebuild(tmp.path(), schema.clone()).unwrap();
        write_status(tmp.path(), &Status { version: 9999, ..Default::default() }).unwrap();
        let index = open_or_rebuild(tmp.path(), schema).unwrap();
        let status = read_status(tmp.path()).unwrap();
        assert_eq!(status.version, INDEX_VERSION);
        assert!(index.schema().fields().count() > 0);
    }
}
