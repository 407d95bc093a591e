//! Filesystem change events and the merge engine that coalesces them.

pub mod merge;

use std::path::PathBuf;

use num_derive::{FromPrimitive, ToPrimitive};

/// One of the fourteen VFS-call-triggered actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum Action {
    NewFile = 0,
    NewLink = 1,
    NewSymlink = 2,
    NewFolder = 3,
    DelFile = 4,
    DelFolder = 5,
    RenameFile = 6,
    RenameFolder = 7,
    RenameFromFile = 8,
    RenameToFile = 9,
    RenameFromFolder = 10,
    RenameToFolder = 11,
    Mount = 12,
    Unmount = 13,
}

impl Action {
    /// Whether this action is one of the three "new" file actions that the
    /// merger groups together.
    pub fn is_new_file(self) -> bool {
        matches!(self, Action::NewFile | Action::NewLink | Action::NewSymlink)
    }

    pub fn is_folder(self) -> bool {
        matches!(
            self,
            Action::NewFolder
                | Action::DelFolder
                | Action::RenameFolder
                | Action::RenameFromFolder
                | Action::RenameToFolder
        )
    }

    pub fn is_rename_from(self) -> bool {
        matches!(self, Action::RenameFromFile | Action::RenameFromFolder)
    }

    pub fn is_rename_to(self) -> bool {
        matches!(self, Action::RenameToFile | Action::RenameToFolder)
    }
}

/// A 32-bit device id, `major << 8 | minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    pub major: u32,
    pub minor: u32,
}

impl DeviceId {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// True for major==0, the "non-real" device marker used by the
    /// long-filename overlay opt-in logic.
    pub fn is_non_real(self) -> bool {
        self.major == 0
    }
}

/// One filesystem-modifying event, as produced by the probe layer and
/// consumed by the merger and the event filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub action: Action,
    /// Rename pair identifier; 0 when not part of a rename.
    pub cookie: u32,
    pub device: DeviceId,
    /// Path relative to the device's root (event-side), or an already
    /// resolved absolute path once it has passed through the mount resolver.
    pub src: PathBuf,
    pub dst: Option<PathBuf>,
}

impl FsEvent {
    pub fn new(action: Action, device: DeviceId, src: PathBuf) -> Self {
        Self { action, cookie: 0, device, src, dst: None }
    }

    pub fn rename(action: Action, device: DeviceId, src: PathBuf, dst: PathBuf, cookie: u32) -> Self {
        Self { action, cookie, device, src, dst: Some(dst) }
    }

    /// Serialised size estimate used for the merger's memory bound, matching
    /// the kernel's `sizeof(struct krp_change) + src_len + 1 + dst_len + 1`.
    pub fn approx_size(&self) -> usize {
        const HEADER: usize = 24;
        HEADER
            + self.src.as_os_str().len()
            + 1
            + self.dst.as_ref().map(|d| d.as_os_str().len() + 1).unwrap_or(0)
    }
}

/// Monotonic, process-wide rename-cookie generator.
#[derive(Debug, Default)]
pub struct CookieGenerator(std::sync::atomic::AtomicU32);

impl CookieGenerator {
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed).wrapping_add(1)
    }
}
