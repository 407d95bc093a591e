//! OS-facing adapter standing in for a kernel VFS probe.
//!
//! A real deployment hooks `vfs_create`/`vfs_unlink`/`vfs_rename`/mount
//! syscalls from kernel space. Here `notify` (inotify on Linux) watches the
//! configured indexing paths and this module turns its events into the same
//! [`FsEvent`] values a kernel probe would emit, including device-id
//! resolution and rename-cookie pairing via `notify`'s own rename tracker.

use std::path::{Path, PathBuf};

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::{Action, DeviceId, FsEvent};

/// Resolves the `(major, minor)` device id backing `path`, as the kernel
/// probe would read straight off the `struct inode`.
#[cfg(target_os = "linux")]
pub fn device_of(path: &Path) -> Option<DeviceId> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::stat(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    let dev = stat.st_dev;
    let major = unsafe { libc::major(dev) } as u32;
    let minor = unsafe { libc::minor(dev) } as u32;
    Some(DeviceId::new(major, minor))
}

#[cfg(not(target_os = "linux"))]
pub fn device_of(_path: &Path) -> Option<DeviceId> {
    Some(DeviceId::new(0, 0))
}

fn classify_create(kind: CreateKind, path: &Path) -> Action {
    match kind {
        CreateKind::Folder => Action::NewFolder,
        _ if path.is_dir() => Action::NewFolder,
        _ => Action::NewFile,
    }
}

fn classify_remove(kind: RemoveKind) -> Action {
    match kind {
        RemoveKind::Folder => Action::DelFolder,
        _ => Action::DelFile,
    }
}

/// Translates one `notify::Event` into zero or more raw [`FsEvent`]s (a
/// rename produces two: `rename_from_*` then `rename_to_*`, sharing the
/// tracker id `notify` assigns as the cookie).
fn translate(event: notify::Event) -> Vec<FsEvent> {
    let mut out = Vec::new();
    let cookie = event
        .attrs
        .tracker()
        .map(|t| t as u32)
        .unwrap_or(0);

    match event.kind {
        EventKind::Create(kind) => {
            for path in event.paths {
                let Some(device) = device_of(&path) else { continue };
                out.push(FsEvent::new(classify_create(kind, &path), device, path));
            }
        }
        EventKind::Remove(kind) => {
            for path in event.paths {
                let Some(device) = device_of(path.parent().unwrap_or(&path)) else { continue };
                out.push(FsEvent::new(classify_remove(kind), device, path));
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => {
            for path in event.paths {
                let Some(device) = device_of(path.parent().unwrap_or(&path)) else { continue };
                let is_dir = path.is_dir();
                match mode {
                    RenameMode::From => {
                        let action = if is_dir { Action::RenameFromFolder } else { Action::RenameFromFile };
                        out.push(FsEvent { action, cookie, device, src: path, dst: None });
                    }
                    RenameMode::To => {
                        let action = if is_dir { Action::RenameToFolder } else { Action::RenameToFile };
                        out.push(FsEvent { action, cookie, device, src: path, dst: None });
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    out
}

/// Watches `roots` recursively and forwards translated raw events to `tx`.
/// Returns the live watcher, which must be kept alive for the duration of
/// watching (dropping it stops delivery).
pub fn spawn_watcher(roots: &[PathBuf], tx: mpsc::UnboundedSender<FsEvent>) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(event) => {
            for fs_event in translate(event) {
                if tx.send(fs_event).is_err() {
                    debug!("probe receiver dropped, discarding event");
                }
            }
        }
        Err(e) => warn!(error = %e, "filesystem watch error"),
    })?;

    for root in roots {
        watcher.watch(root, RecursiveMode::Recursive)?;
    }
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_create_prefers_explicit_folder_kind() {
        assert_eq!(classify_create(CreateKind::Folder, Path::new("/tmp/nonexistent")), Action::NewFolder);
    }

    #[test]
    fn classify_remove_maps_folder_and_file() {
        assert_eq!(classify_remove(RemoveKind::Folder), Action::DelFolder);
        assert_eq!(classify_remove(RemoveKind::File), Action::DelFile);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn device_of_resolves_existing_path() {
        assert!(device_of(Path::new("/")).is_some());
    }
}
