//! Event scoping and translation into indexing jobs.
//!
//! Runs the filtering predicates in order (sentinel device, overlay-type
//! exclusion, indexing scope, blacklist), re-pairs rename halves on the
//! userspace side independently of the kernel-simulation merger, and
//! implements the rename-across-scope table plus the directory-rename
//! descendant fix-up.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use tracing::debug;

use crate::config::Config;
use crate::event::merge::RenamePairing;
use crate::event::{Action, FsEvent};
use crate::jobqueue::IndexJob;
use crate::mount::{OverlayDeviceSet, PartitionTable};

/// Paths ending in `.longname` are sentinel records the long-filename
/// overlay emits and are always dropped, regardless of device.
fn is_sentinel_path(path: &Path) -> bool {
    path.as_os_str().to_string_lossy().ends_with(".longname")
}

/// The overlay re-fires every non-sentinel event under its own mount too;
/// if `path`'s nearest mount is the overlay type, the event is a duplicate
/// of one already delivered for the real, underlying filesystem.
fn is_overlay_duplicate(path: &Path, mounts: &PartitionTable) -> bool {
    mounts.nearest_mount(path).is_some_and(|entry| entry.is_overlay())
}

/// Whether `path` falls under one of the configured indexing roots and is
/// not excluded by a blacklist entry.
fn in_scope(path: &Path, config: &Config) -> bool {
    let in_roots = config.indexing_paths.iter().any(|root| path.starts_with(root));
    if !in_roots {
        return false;
    }
    !config.blacklist_paths.iter().any(|blacklisted| path.starts_with(blacklisted))
}

/// The userspace-side event filter: owns its own rename-pairing table
/// (independent of the kernel-simulation merger's), and turns scoped
/// [`FsEvent`]s into [`IndexJob`]s.
pub struct Filter {
    /// Shared with the daemon's configuration-reload task, so a reload is
    /// visible to the next observed event without restarting the filter.
    config: Arc<StdRwLock<Config>>,
    pairing: RenamePairing,
    /// Memoizes the bind-mount `hardreal` resolution per raw path, since the
    /// mount table rarely changes between events.
    resolved_cache: moka::sync::Cache<PathBuf, PathBuf>,
    /// Non-real devices currently opted into the long-filename overlay
    /// allowlist, kept in sync by the daemon's mount-refresh task.
    overlay_devices: OverlayDeviceSet,
}

impl Filter {
    pub fn new(config: Arc<StdRwLock<Config>>, overlay_devices: OverlayDeviceSet) -> Self {
        let resolved_cache = moka::sync::Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(30))
            .build();
        Self { config, pairing: RenamePairing::new(), resolved_cache, overlay_devices }
    }

    /// Feeds one raw event (as decoded off the transport) through the
    /// sentinel/type filters, pairing, and scoping, producing zero or more
    /// jobs.
    pub fn observe(&self, event: FsEvent, mounts: &PartitionTable) -> Vec<IndexJob> {
        if is_sentinel_path(&event.src) || event.dst.as_deref().is_some_and(is_sentinel_path) {
            debug!(path = %event.src.display(), "dropping long-filename overlay sentinel");
            return Vec::new();
        }

        if is_overlay_duplicate(&event.src, mounts) || event.dst.as_deref().is_some_and(|d| is_overlay_duplicate(d, mounts)) {
            debug!(path = %event.src.display(), "dropping duplicate event re-fired by long-filename overlay");
            return Vec::new();
        }

        let Some(unified) = self.pairing.observe(event) else {
            return Vec::new();
        };

        self.translate(unified, mounts)
    }

    fn resolve(&self, path: &Path, mounts: &PartitionTable) -> PathBuf {
        if let Some(cached) = self.resolved_cache.get(path) {
            return cached;
        }
        let opted_in = self.overlay_devices.read().expect("overlay device set poisoned");
        let resolved = match mounts.hardreal(path, &opted_in) {
            Some(entry) => entry.mount_point.join(path.strip_prefix(&entry.mount_point).unwrap_or(path)),
            None => path.to_path_buf(),
        };
        drop(opted_in);
        self.resolved_cache.insert(path.to_path_buf(), resolved.clone());
        resolved
    }

    fn translate(&self, event: FsEvent, mounts: &PartitionTable) -> Vec<IndexJob> {
        let src = self.resolve(&event.src, mounts);
        let config = self.config.read().expect("config lock poisoned");

        match event.action {
            Action::NewFile | Action::NewLink | Action::NewSymlink | Action::NewFolder => {
                if in_scope(&src, &config) {
                    vec![IndexJob::insert(src)]
                } else {
                    Vec::new()
                }
            }
            Action::DelFile | Action::DelFolder => {
                if in_scope(&src, &config) {
                    vec![IndexJob::remove(src)]
                } else {
                    Vec::new()
                }
            }
            Action::RenameFile | Action::RenameFolder => {
                let Some(raw_dst) = event.dst.as_ref() else { return Vec::new() };
                let dst = self.resolve(raw_dst, mounts);
                let src_in = in_scope(&src, &config);
                let dst_in = in_scope(&dst, &config);
                let is_folder = event.action == Action::RenameFolder;

                match (src_in, dst_in) {
                    (true, true) if is_folder => vec![IndexJob::rename_descendants(src, dst)],
                    (true, true) => vec![IndexJob::rename(src, dst)],
                    (true, false) => vec![IndexJob::remove(src)],
                    (false, true) if is_folder => vec![IndexJob::insert(dst.clone()), IndexJob::scan(dst)],
                    (false, true) => vec![IndexJob::insert(dst)],
                    (false, false) => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    /// Drops rename halves that never found their pair within `max_age`
    /// called once per batch.
    pub fn age_out_pending_renames(&self, max_age: std::time::Duration) -> usize {
        self.pairing.age_out(max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DeviceId;
    use std::collections::HashSet;
    use std::sync::RwLock;

    fn config_with_roots(roots: &[&str], blacklist: &[&str]) -> Config {
        let mut cfg = Config::from_str("").unwrap();
        cfg.indexing_paths = roots.iter().map(PathBuf::from).collect();
        cfg.blacklist_paths = blacklist.iter().map(|s| s.to_string()).collect();
        cfg
    }

    fn new_filter(config: Config) -> Filter {
        Filter::new(Arc::new(RwLock::new(config)), Arc::new(RwLock::new(HashSet::new())))
    }

    #[test]
    fn longname_sentinel_path_is_dropped() {
        let filter = new_filter(config_with_roots(&["/home"], &[]));
        let event = FsEvent::new(Action::NewFile, DeviceId::new(8, 1), PathBuf::from("/home/u/x.longname"));
        assert!(filter.observe(event, &PartitionTable::new()).is_empty());
    }

    #[tokio::test]
    async fn overlay_mounted_path_is_dropped_as_duplicate() {
        let filter = new_filter(config_with_roots(&["/home"], &[]));
        let mut table = PartitionTable::new();
        table.rebuild("36 35 0:24 / /home/overlay rw - anything_overlay none rw\n").await;
        let event = FsEvent::new(Action::NewFile, DeviceId::new(0, 24), PathBuf::from("/home/overlay/x.txt"));
        assert!(filter.observe(event, &table).is_empty());
    }

    #[test]
    fn new_file_in_scope_produces_insert_job() {
        let filter = new_filter(config_with_roots(&["/home"], &[]));
        let event = FsEvent::new(Action::NewFile, DeviceId::new(8, 1), PathBuf::from("/home/u/x.txt"));
        let jobs = filter.observe(event, &PartitionTable::new());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, crate::jobqueue::JobKind::Insert);
    }

    #[test]
    fn blacklisted_path_is_dropped() {
        let filter = new_filter(config_with_roots(&["/home"], &["/home/u/.cache"]));
        let event = FsEvent::new(Action::NewFile, DeviceId::new(8, 1), PathBuf::from("/home/u/.cache/x"));
        assert!(filter.observe(event, &PartitionTable::new()).is_empty());
    }

    #[test]
    fn rename_across_scope_out_becomes_remove() {
        let filter = new_filter(config_with_roots(&["/home"], &[]));
        let from = filter.observe(
            FsEvent::new(Action::RenameFromFile, DeviceId::new(8, 1), PathBuf::from("/home/u/x.txt")),
            &PartitionTable::new(),
        );
        assert!(from.is_empty());
        let to = filter.observe(
            FsEvent { cookie: 0, ..FsEvent::new(Action::RenameToFile, DeviceId::new(8, 1), PathBuf::from("/tmp/x.txt")) },
            &PartitionTable::new(),
        );
        assert_eq!(to.len(), 1);
        assert_eq!(to[0].kind, crate::jobqueue::JobKind::Remove);
        assert_eq!(to[0].src, PathBuf::from("/home/u/x.txt"));
    }

    #[test]
    fn rename_across_scope_in_becomes_insert() {
        let filter = new_filter(config_with_roots(&["/home"], &[]));
        filter.observe(
            FsEvent::new(Action::RenameFromFile, DeviceId::new(8, 1), PathBuf::from("/tmp/x.txt")),
            &PartitionTable::new(),
        );
        let to = filter.observe(
            FsEvent { cookie: 0, ..FsEvent::new(Action::RenameToFile, DeviceId::new(8, 1), PathBuf::from("/home/u/x.txt")) },
            &PartitionTable::new(),
        );
        assert_eq!(to.len(), 1);
        assert_eq!(to[0].kind, crate::jobqueue::JobKind::Insert);
        assert_eq!(to[0].src, PathBuf::from("/home/u/x.txt"));
    }

    #[test]
    fn rename_into_scope_folder_also_schedules_a_scan() {
        let filter = new_filter(config_with_roots(&["/home"], &[]));
        filter.observe(
            FsEvent::new(Action::RenameFromFolder, DeviceId::new(8, 1), PathBuf::from("/tmp/old")),
            &PartitionTable::new(),
        );
        let to = filter.observe(
            FsEvent { cookie: 0, ..FsEvent::new(Action::RenameToFolder, DeviceId::new(8, 1), PathBuf::from("/home/u/new")) },
            &PartitionTable::new(),
        );
        assert_eq!(to.len(), 2);
        assert_eq!(to[0].kind, crate::jobqueue::JobKind::Insert);
        assert!(matches!(to[1].kind, crate::jobqueue::JobKind::Scan { .. }));
        assert_eq!(to[1].src, PathBuf::from("/home/u/new"));
    }

    #[test]
    fn directory_rename_inside_scope_fixes_up_descendants() {
        let filter = new_filter(config_with_roots(&["/home"], &[]));
        filter.observe(
            FsEvent::new(Action::RenameFromFolder, DeviceId::new(8, 1), PathBuf::from("/home/u/old")),
            &PartitionTable::new(),
        );
        let to = filter.observe(
            FsEvent { cookie: 0, ..FsEvent::new(Action::RenameToFolder, DeviceId::new(8, 1), PathBuf::from("/home/u/new")) },
            &PartitionTable::new(),
        );
        assert_eq!(to.len(), 1);
        assert_eq!(to[0].kind, crate::jobqueue::JobKind::RenameDescendants);
    }
}
