//! Indexing job queue and worker pool.
//!
//! An `async_channel` queue fans work out to a fixed pool of `tokio`
//! workers sized by [`crate::config::worker_pool_size`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jwalk::WalkDir;
use tracing::{debug, error, info, instrument};

use crate::config::Config;
use crate::index::IndexHandle;

/// One unit of indexing work.
#[derive(Debug, Clone)]
pub struct IndexJob {
    pub src: PathBuf,
    pub dst: Option<PathBuf>,
    pub kind: JobKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    Insert,
    Remove,
    /// `src` -> `dst` for a single file/symlink.
    Rename,
    /// A folder at `src` was renamed to `dst`; every indexed document whose
    /// path starts with `src` must be rewritten with the `dst` prefix
    /// (directory-rename descendant fix-up).
    RenameDescendants,
    /// Full rescan of one configured root, used at startup and on explicit
    /// request.
    Scan { root: PathBuf },
}

impl IndexJob {
    pub fn insert(path: PathBuf) -> Self {
        Self { src: path, dst: None, kind: JobKind::Insert }
    }

    pub fn remove(path: PathBuf) -> Self {
        Self { src: path, dst: None, kind: JobKind::Remove }
    }

    pub fn rename(src: PathBuf, dst: PathBuf) -> Self {
        Self { src, dst: Some(dst), kind: JobKind::Rename }
    }

    pub fn rename_descendants(src: PathBuf, dst: PathBuf) -> Self {
        Self { src, dst: Some(dst), kind: JobKind::RenameDescendants }
    }

    pub fn scan(root: PathBuf) -> Self {
        Self { src: root.clone(), dst: None, kind: JobKind::Scan { root } }
    }
}

/// Queue handle shared by producers (the filter stage) and the worker pool.
#[derive(Clone)]
pub struct JobQueue {
    sender: async_channel::Sender<IndexJob>,
    receiver: async_channel::Receiver<IndexJob>,
    pub stop_scanning: Arc<AtomicBool>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = async_channel::bounded(capacity);
        Self { sender, receiver, stop_scanning: Arc::new(AtomicBool::new(false)) }
    }

    pub async fn push(&self, job: IndexJob) {
        if self.sender.send(job).await.is_err() {
            error!("job queue closed, dropping job");
        }
    }

    /// Spawns `worker_count` tokio tasks draining the queue against `index`.
    pub fn spawn_workers(&self, worker_count: usize, index: IndexHandle) {
        for id in 0..worker_count {
            let receiver = self.receiver.clone();
            let index = index.clone();
            let queue = self.clone();
            tokio::spawn(async move {
                while let Ok(job) = receiver.recv().await {
                    if let Err(e) = apply_job(&index, &queue, &job).await {
                        error!(worker = id, job = ?job, error = %e, "indexing job failed");
                    }
                }
            });
        }
    }

    /// Walks `root` with a parallel directory walker, queuing an `Insert`
    /// per regular file and respecting `stop_scanning` between batches.
    #[instrument(skip(self))]
    pub async fn queue_scan(&self, root: PathBuf) {
        let stop = self.stop_scanning.clone();
        let sender = self.sender.clone();
        tokio::task::spawn_blocking(move || {
            for entry in WalkDir::new(&root).skip_hidden(false) {
                if stop.load(Ordering::Relaxed) {
                    debug!(root = %root.display(), "scan cancelled");
                    break;
                }
                let Ok(entry) = entry else { continue };
                if entry.file_type().is_file() {
                    let _ = sender.send_blocking(IndexJob::insert(entry.path()));
                }
            }
        })
        .await
        .ok();
    }
}

async fn apply_job(index: &IndexHandle, queue: &JobQueue, job: &IndexJob) -> crate::error::Result<()> {
    match &job.kind {
        JobKind::Insert => index.upsert_path(&job.src).await,
        JobKind::Remove => index.remove_path(&job.src).await,
        JobKind::Rename => {
            let dst = job.dst.as_ref().expect("rename job always carries dst");
            index.rename_path(&job.src, dst).await
        }
        JobKind::RenameDescendants => {
            let dst = job.dst.as_ref().expect("rename job always carries dst");
            index.rename_prefix(&job.src, dst).await
        }
        JobKind::Scan { root } => {
            debug!(root = %root.display(), "expanding scan job into a directory walk");
            queue.queue_scan(root.clone()).await;
            Ok(())
        }
    }
}

/// Drives the volatile/persistent commit timers off one shared
/// `tokio::time::interval` at their GCD.
pub async fn run_commit_timers(config: Config, index: IndexHandle, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
    let gcd_secs = gcd(config.commit_volatile_index_timeout.as_secs().max(1), config.commit_persistent_index_timeout.as_secs().max(1));
    let mut ticker = tokio::time::interval(Duration::from_secs(gcd_secs));
    let mut elapsed = Duration::ZERO;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                elapsed += Duration::from_secs(gcd_secs);
                if elapsed >= config.commit_volatile_index_timeout {
                    if let Err(e) = index.commit_volatile().await {
                        error!(error = %e, "volatile commit failed");
                    }
                }
                if elapsed >= config.commit_persistent_index_timeout {
                    if let Err(e) = index.commit_persistent().await {
                        error!(error = %e, "persistent commit failed");
                    }
                    elapsed = Duration::ZERO;
                }
            }
            _ = shutdown.recv() => {
                info!("commit timer loop shutting down");
                break;
            }
        }
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 { a } else { gcd(b, a % b) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gcd_matches_textbook_cases() {
        assert_eq!(gcd(2, 600), 2);
        assert_eq!(gcd(12, 18), 6);
        assert_eq!(gcd(7, 7), 7);
    }

    #[tokio::test]
    async fn queue_push_and_drain_preserves_order() {
        let queue = JobQueue::new(8);
        queue.push(IndexJob::insert(PathBuf::from("/a"))).await;
        queue.push(IndexJob::remove(PathBuf::from("/b"))).await;
        let first = queue.receiver.recv().await.unwrap();
        let second = queue.receiver.recv().await.unwrap();
        assert_eq!(first.kind, JobKind::Insert);
        assert_eq!(second.kind, JobKind::Remove);
    }
}
