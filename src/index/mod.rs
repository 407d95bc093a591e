//! Full-text path index.

pub mod lifecycle;
pub mod reader;
pub mod schema;
pub mod writer;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::config::Config;
use crate::error::Result;
use crate::index::reader::Readers;
use crate::index::schema::Fields;
use crate::index::writer::{doc_fields_for, IndexWriterHandle};

struct Inner {
    writer: IndexWriterHandle,
    readers: Readers,
    dir: PathBuf,
    config: Config,
}

/// Cheaply cloneable handle to the index, shared across the job workers,
/// the commit timers, and the search API.
#[derive(Clone)]
pub struct IndexHandle(Arc<Inner>);

impl IndexHandle {
    pub fn open(dir: &Path, config: Config) -> Result<Self> {
        let (schema, fields) = schema::build();
        let index = lifecycle::open_or_rebuild(dir, schema)?;
        register_on(&index);
        let writer = IndexWriterHandle::open(&index, fields)?;
        let readers = Readers::open(&index, fields)?;
        Ok(Self(Arc::new(Inner { writer, readers, dir: dir.to_path_buf(), config })))
    }

    /// Startup step 1 of the lifecycle manager: if `volatile_dir` is absent
    /// and `persistent_dir` exists, seeds the volatile directory from it
    /// before opening.
    pub fn open_with_persistent(volatile_dir: &Path, persistent_dir: &Path, config: Config) -> Result<Self> {
        if !volatile_dir.exists() && persistent_dir.exists() {
            std::fs::create_dir_all(volatile_dir)?;
            for entry in std::fs::read_dir(persistent_dir)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    std::fs::copy(entry.path(), volatile_dir.join(entry.file_name()))?;
                }
            }
        }
        Self::open(volatile_dir, config)
    }

    #[instrument(skip(self))]
    pub async fn upsert_path(&self, path: &Path) -> Result<()> {
        let Some(fields) = doc_fields_for(path, &self.0.config) else {
            debug!(path = %path.display(), "path vanished before indexing, skipping");
            return Ok(());
        };
        self.0.writer.upsert(fields)
    }

    #[instrument(skip(self))]
    pub async fn remove_path(&self, path: &Path) -> Result<()> {
        self.0.writer.delete_path(&path.to_string_lossy())
    }

    #[instrument(skip(self))]
    pub async fn rename_path(&self, src: &Path, dst: &Path) -> Result<()> {
        self.0.writer.delete_path(&src.to_string_lossy())?;
        if let Some(fields) = doc_fields_for(dst, &self.0.config) {
            self.0.writer.upsert(fields)?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn rename_prefix(&self, old_prefix: &Path, new_prefix: &Path) -> Result<()> {
        let old = old_prefix.to_string_lossy().into_owned();
        let new = new_prefix.to_string_lossy().into_owned();
        let rows = self.0.readers.rows_with_prefix(&old)?;
        self.0.writer.rewrite_prefix(&old, &new, rows)
    }

    /// Frequent, cheap commit that only needs to reach the NRT reader
    /// (the volatile commit window).
    pub async fn commit_volatile(&self) -> Result<()> {
        self.0.writer.commit()?;
        self.0.readers.reload_nrt()?;
        let mut status = lifecycle::read_status(&self.0.dir).unwrap_or_default();
        status.last_volatile_commit_unix = unix_now();
        lifecycle::write_status(&self.0.dir, &status)
    }

    /// Slower, durable commit that also reaches the committed (search)
    /// reader (the persistent commit window).
    pub async fn commit_persistent(&self) -> Result<()> {
        self.0.writer.commit()?;
        self.0.readers.reload_nrt()?;
        self.0.readers.reload_committed()?;
        let mut status = lifecycle::read_status(&self.0.dir).unwrap_or_default();
        status.last_persistent_commit_unix = unix_now();
        lifecycle::write_status(&self.0.dir, &status)
    }

    pub fn exists(&self, full_path: &str) -> Result<bool> {
        self.0.readers.exists(full_path)
    }

    /// "Refresh indexes": evicts every document whose `full_path` no longer
    /// exists on disk or now matches `config`'s blacklist. Used after a
    /// configuration reload. Returns whether anything was evicted.
    pub async fn refresh_indexes(&self, config: &Config) -> Result<bool> {
        let rows = self.0.readers.all_rows()?;
        let mut changed = false;
        for row in rows {
            let stale = !Path::new(&row.full_path).exists()
                || config.blacklist_paths.iter().any(|blacklisted| row.full_path.contains(blacklisted.as_str()));
            if stale {
                self.0.writer.delete_path(&row.full_path)?;
                changed = true;
            }
        }
        if changed {
            self.0.writer.commit()?;
            self.0.readers.reload_nrt()?;
            self.0.readers.reload_committed()?;
        }
        Ok(changed)
    }

    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<(writer::DocFields, f32)>> {
        self.0.readers.search(query, limit)
    }

    /// Marks the index's lifecycle state in `status.json`.
    pub fn set_lifecycle_state(&self, state: lifecycle::LifecycleState) -> Result<()> {
        lifecycle::set_status(&self.0.dir, state)
    }

    /// Final commit, mirrored to the persistent directory, with the
    /// lifecycle state set to `closed` — the daemon's shutdown sequence.
    pub async fn shutdown(&self, persistent_dir: &Path) -> Result<()> {
        self.commit_persistent().await?;
        self.set_lifecycle_state(lifecycle::LifecycleState::Closed)?;
        mirror_to_persistent(&self.0.dir, persistent_dir)
    }
}

/// Copies the volatile index directory over the persistent one, replacing
/// its prior contents.
fn mirror_to_persistent(volatile_dir: &Path, persistent_dir: &Path) -> Result<()> {
    if persistent_dir.exists() {
        std::fs::remove_dir_all(persistent_dir)?;
    }
    std::fs::create_dir_all(persistent_dir)?;
    for entry in std::fs::read_dir(volatile_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::copy(entry.path(), persistent_dir.join(entry.file_name()))?;
        }
    }
    Ok(())
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Registers the custom path tokenizer on `index`'s tokenizer manager. Must
/// be called before the first reader/writer is built against `index`.
pub fn register_on(index: &tantivy::Index) {
    index
        .tokenizers()
        .register(crate::tokenizer::TOKENIZER_NAME, crate::tokenizer::PathTokenizer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        Config::from_str("").unwrap()
    }

    #[tokio::test]
    async fn upsert_then_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("report.txt");
        std::fs::write(&file, b"hello").unwrap();

        let (schema, fields) = schema::build();
        let index_dir = tmp.path().join("idx");
        std::fs::create_dir_all(&index_dir).unwrap();
        let tantivy_index = lifecycle::open_or_rebuild(&index_dir, schema).unwrap();
        register_on(&tantivy_index);
        let writer = IndexWriterHandle::open(&tantivy_index, fields).unwrap();
        let readers = Readers::open(&tantivy_index, fields).unwrap();
        let handle = IndexHandle(Arc::new(Inner { writer, readers, dir: index_dir, config: test_config() }));

        handle.upsert_path(&file).await.unwrap();
        handle.commit_volatile().await.unwrap();
        assert!(handle.exists(&file.to_string_lossy()).unwrap());
    }
}
