//! Mount/partition tracking, ported from the rbtree-keyed
//! partition map in the original kernel module's `vfs_partition.c` — here
//! keyed the same way (by device id) but backed by a sharded concurrent map
//! instead of an rbtree, since nothing requires ordered traversal.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::event::DeviceId;

/// The long-filename overlay's pseudo-filesystem type, as reported in the
/// mountinfo `fs_type` field.
pub const OVERLAY_FS_TYPE: &str = "anything_overlay";

/// Shared, synchronously-readable set of non-real devices opted into the
/// long-filename overlay allowlist. Writes happen from the async
/// mount-refresh task; reads happen from [`PartitionTable::hardreal`], which
/// must stay synchronous since it's called from `Filter::resolve`.
pub type OverlayDeviceSet = Arc<RwLock<HashSet<DeviceId>>>;

/// One parsed line of `/proc/self/mountinfo` (or the `/proc/mounts`
/// fallback): a single mounted filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub device: DeviceId,
    pub mount_point: PathBuf,
    pub source: String,
    pub fs_type: String,
}

impl PartitionEntry {
    pub fn is_overlay(&self) -> bool {
        self.fs_type == OVERLAY_FS_TYPE
    }
}

/// Device-id-keyed partition map, rebuilt wholesale from a mountinfo
/// snapshot, rebuilt whenever the mount table changes.
pub struct PartitionTable {
    by_device: whirlwind::ShardMap<DeviceId, PartitionEntry>,
    entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    pub fn new() -> Self {
        Self { by_device: whirlwind::ShardMap::new(), entries: Vec::new() }
    }

    /// Parses `/proc/self/mountinfo` lines. Format (space-separated, fields
    /// after the optional-tag `-` separator skipped):
    /// `mount_id parent_id major:minor root mount_point options ... - fs_type source super_options`
    pub fn parse_mountinfo(text: &str) -> Vec<PartitionEntry> {
        let mut out = Vec::new();
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let Some(_mount_id) = fields.next() else { continue };
            let Some(_parent_id) = fields.next() else { continue };
            let Some(dev_field) = fields.next() else { continue };
            let Some(_root) = fields.next() else { continue };
            let Some(mount_point) = fields.next() else { continue };

            let Some((major, minor)) = dev_field.split_once(':') else { continue };
            let (Ok(major), Ok(minor)) = (major.parse::<u32>(), minor.parse::<u32>()) else { continue };

            let mut rest = fields;
            let mut past_separator = false;
            let mut fs_type = None;
            let mut source = None;
            for field in rest.by_ref() {
                if field == "-" {
                    past_separator = true;
                    continue;
                }
                if !past_separator {
                    continue;
                }
                if fs_type.is_none() {
                    fs_type = Some(field.to_string());
                } else if source.is_none() {
                    source = Some(field.to_string());
                    break;
                }
            }
            let (Some(fs_type), Some(source)) = (fs_type, source) else { continue };

            out.push(PartitionEntry {
                device: DeviceId::new(major, minor),
                mount_point: PathBuf::from(unescape_octal(mount_point)),
                source: unescape_octal(&source),
                fs_type,
            });
        }
        out
    }

    /// Rebuilds the table in place from a fresh mountinfo snapshot.
    pub async fn rebuild(&mut self, mountinfo: &str) {
        let entries = Self::parse_mountinfo(mountinfo);
        let fresh = whirlwind::ShardMap::new();
        for entry in &entries {
            fresh.insert(entry.device, entry.clone()).await;
        }
        self.by_device = fresh;
        self.entries = entries;
    }

    pub async fn lookup(&self, device: DeviceId) -> Option<PartitionEntry> {
        self.by_device.get(&device).await.map(|r| r.value().clone())
    }

    /// Finds the mount entry whose mount point is the longest prefix of
    /// `path`, with no regard for whether the device is real — used by the
    /// filter's type-filter predicate to test the nearest mount's fs type.
    pub fn nearest_mount(&self, path: &Path) -> Option<&PartitionEntry> {
        self.entries
            .iter()
            .filter(|e| path.starts_with(&e.mount_point))
            .max_by_key(|e| e.mount_point.as_os_str().len())
    }

    /// The "hardreal" walk-up used to turn a raw event path plus device id
    /// into the absolute path on the real, possibly bind-mounted, filesystem
    /// tree: among the mount points prefixing `path`, picks the longest one
    /// whose device is real, skipping past any non-real (major==0)
    /// intermediate mount unless its device has been explicitly opted into
    /// `opted_in_overlays`.
    pub fn hardreal(&self, path: &Path, opted_in_overlays: &HashSet<DeviceId>) -> Option<&PartitionEntry> {
        let mut candidates: Vec<&PartitionEntry> =
            self.entries.iter().filter(|e| path.starts_with(&e.mount_point)).collect();
        candidates.sort_by_key(|e| std::cmp::Reverse(e.mount_point.as_os_str().len()));
        candidates.into_iter().find(|e| !e.device.is_non_real() || opted_in_overlays.contains(&e.device))
    }

    /// Non-real devices of long-filename overlay mounts sitting under one of
    /// `indexing_paths` — the set the daemon should keep opted into the
    /// kernel-side allowlist after each mount-table refresh.
    pub fn overlay_devices_in_scope(&self, indexing_paths: &[PathBuf]) -> HashSet<DeviceId> {
        self.entries
            .iter()
            .filter(|e| e.is_overlay())
            .filter(|e| indexing_paths.iter().any(|root| e.mount_point.starts_with(root) || root.starts_with(&e.mount_point)))
            .map(|e| e.device)
            .collect()
    }
}

impl Default for PartitionTable {
    fn default() -> Self {
        Self::new()
    }
}

fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            if let Ok(code) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or(""), 8) {
                out.push(code as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// The long-filename-overlay sysfs handshake: a real
/// deployment writes `a<N>`/`r<N>`/`e<N>` commands to the
/// `vfs_unnamed_devices` attribute the deepin-anything kernel module
/// exposes, opting specific non-real devices in or out of indexing.
#[async_trait::async_trait]
pub trait OverlayAllowlist: Send + Sync {
    async fn allow(&self, device: DeviceId) -> crate::error::Result<()>;
    async fn deny(&self, device: DeviceId) -> crate::error::Result<()>;
    async fn exclusive(&self, device: DeviceId) -> crate::error::Result<()>;
}

/// Writes to a real (or test double) sysfs-like attribute file.
pub struct SysfsOverlayAllowlist {
    attribute_path: PathBuf,
}

impl SysfsOverlayAllowlist {
    pub fn new(attribute_path: PathBuf) -> Self {
        Self { attribute_path }
    }

    async fn write_command(&self, prefix: char, device: DeviceId) -> crate::error::Result<()> {
        let command = format!("{prefix}{}:{}", device.major, device.minor);
        tokio::fs::write(&self.attribute_path, command).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl OverlayAllowlist for SysfsOverlayAllowlist {
    async fn allow(&self, device: DeviceId) -> crate::error::Result<()> {
        self.write_command('a', device).await
    }

    async fn deny(&self, device: DeviceId) -> crate::error::Result<()> {
        self.write_command('r', device).await
    }

    async fn exclusive(&self, device: DeviceId) -> crate::error::Result<()> {
        self.write_command('e', device).await
    }
}

/// Used when the host kernel doesn't expose the overlay attribute — the
/// daemon degrades gracefully instead of treating this as fatal.
pub struct NoopOverlayAllowlist;

#[async_trait::async_trait]
impl OverlayAllowlist for NoopOverlayAllowlist {
    async fn allow(&self, _device: DeviceId) -> crate::error::Result<()> {
        Ok(())
    }

    async fn deny(&self, _device: DeviceId) -> crate::error::Result<()> {
        Ok(())
    }

    async fn exclusive(&self, _device: DeviceId) -> crate::error::Result<()> {
        Ok(())
    }
}

/// Probes for the overlay attribute at `attribute_path`, logging once and
/// falling back to a no-op implementation when it's absent.
pub async fn detect_overlay_allowlist(attribute_path: &Path) -> Box<dyn OverlayAllowlist> {
    if tokio::fs::metadata(attribute_path).await.is_ok() {
        Box::new(SysfsOverlayAllowlist::new(attribute_path.to_path_buf()))
    } else {
        warn!(path = %attribute_path.display(), "long-filename overlay attribute not present, indexing non-real devices as-is");
        Box::new(NoopOverlayAllowlist)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
36 35 98:0 / / rw,noatime master:1 - ext4 /dev/root rw,errors=remount-ro
36 35 0:23 / /proc rw,nosuid - proc proc rw
37 35 98:1 / /home rw,relatime master:2 - ext4 /dev/sda2 rw
38 37 98:1 / /home/user/mnt rw,relatime master:2 - ext4 /dev/sda2 rw,bind
39 37 0:24 / /home/user/overlay rw,relatime - anything_overlay none rw
";

    #[test]
    fn parses_mountinfo_lines() {
        let entries = PartitionTable::parse_mountinfo(SAMPLE);
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].device, DeviceId::new(98, 0));
        assert_eq!(entries[0].mount_point, PathBuf::from("/"));
        assert_eq!(entries[0].fs_type, "ext4");
        assert_eq!(entries[2].mount_point, PathBuf::from("/home"));
        assert!(entries[4].is_overlay());
    }

    #[test]
    fn hardreal_picks_longest_prefix() {
        let mut table = PartitionTable::new();
        table.entries = PartitionTable::parse_mountinfo(SAMPLE);
        let opted_in = HashSet::new();
        let found = table.hardreal(Path::new("/home/user/mnt/doc.txt"), &opted_in).unwrap();
        assert_eq!(found.mount_point, PathBuf::from("/home/user/mnt"));
        let found = table.hardreal(Path::new("/home/user/file.txt"), &opted_in).unwrap();
        assert_eq!(found.mount_point, PathBuf::from("/home"));
    }

    #[test]
    fn hardreal_walks_past_non_real_mount_unless_opted_in() {
        let mut table = PartitionTable::new();
        table.entries = PartitionTable::parse_mountinfo(SAMPLE);
        let overlay_device = DeviceId::new(0, 24);

        let found = table.hardreal(Path::new("/home/user/overlay/doc.txt"), &HashSet::new()).unwrap();
        assert_eq!(found.mount_point, PathBuf::from("/home"));

        let mut opted_in = HashSet::new();
        opted_in.insert(overlay_device);
        let found = table.hardreal(Path::new("/home/user/overlay/doc.txt"), &opted_in).unwrap();
        assert_eq!(found.mount_point, PathBuf::from("/home/user/overlay"));
    }

    #[tokio::test]
    async fn rebuild_replaces_prior_entries() {
        let mut table = PartitionTable::new();
        table.rebuild(SAMPLE).await;
        assert!(table.lookup(DeviceId::new(98, 1)).await.is_some());
        table.rebuild("36 35 99:9 / / rw - ext4 /dev/root rw\n").await;
        assert!(table.lookup(DeviceId::new(98, 1)).await.is_none());
        assert!(table.lookup(DeviceId::new(99, 9)).await.is_some());
    }
}
