//! Kernel→user transport.
//!
//! The wire struct carries one path per message, so a paired rename is split
//! into a `rename_from_*` + `rename_to_*` pair sharing a cookie on the way
//! out, and re-joined by whichever side owns pairing for that hop (the
//! kernel-simulation side in `event::merge::RenamePairing`, the userspace
//! side in `filter`). This module only does the mechanical split/encode and
//! decode; it holds no pairing state of its own.

use std::ffi::CString;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::error::{Error, Result};
use crate::event::{Action, DeviceId, FsEvent};

/// `PATH_MAX` on Linux; messages with a longer path are rejected.
pub const MAX_PATH_LEN: usize = 4096;

/// One wire message: `action: u8, cookie: u32, major: u16, minor: u8,
/// path: CString`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub action: u8,
    pub cookie: u32,
    pub major: u16,
    pub minor: u8,
    pub path: CString,
}

impl WireMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = self.path.as_bytes();
        if bytes.len() >= MAX_PATH_LEN {
            return Err(Error::Protocol(format!("path too long: {} bytes", bytes.len())));
        }
        let mut out = Vec::with_capacity(8 + bytes.len() + 1);
        out.write_u8(self.action)?;
        out.write_u32::<LittleEndian>(self.cookie)?;
        out.write_u16::<LittleEndian>(self.major)?;
        out.write_u8(self.minor)?;
        out.extend_from_slice(bytes);
        out.push(0);
        Ok(out)
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let action = buf.read_u8()?;
        let cookie = buf.read_u32::<LittleEndian>()?;
        let major = buf.read_u16::<LittleEndian>()?;
        let minor = buf.read_u8()?;
        let nul = buf
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::Protocol("path missing nul terminator".into()))?;
        if nul >= MAX_PATH_LEN {
            return Err(Error::Protocol(format!("path too long: {nul} bytes")));
        }
        let path = CString::new(&buf[..nul]).map_err(|e| Error::Protocol(e.to_string()))?;
        Ok(Self { action, cookie, major, minor, path })
    }
}

fn path_to_cstring(path: &std::path::Path) -> Result<CString> {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        CString::new(path.as_os_str().as_bytes()).map_err(|e| Error::Protocol(e.to_string()))
    }
    #[cfg(not(unix))]
    {
        CString::new(path.to_string_lossy().into_owned()).map_err(|e| Error::Protocol(e.to_string()))
    }
}

fn cstring_to_path(cs: &CString) -> std::path::PathBuf {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        std::path::PathBuf::from(std::ffi::OsStr::from_bytes(cs.as_bytes()))
    }
    #[cfg(not(unix))]
    {
        std::path::PathBuf::from(cs.to_string_lossy().into_owned())
    }
}

/// Splits one logical event into the one or two wire messages needed to
/// carry it (renames split into a from/to pair; everything else is one
/// message).
pub fn split_for_wire(event: &FsEvent) -> Result<Vec<WireMessage>> {
    let major = event.device.major as u16;
    let minor = event.device.minor as u8;

    if let (Action::RenameFile | Action::RenameFolder, Some(dst)) = (event.action, &event.dst) {
        let (from_action, to_action) = if event.action == Action::RenameFile {
            (Action::RenameFromFile, Action::RenameToFile)
        } else {
            (Action::RenameFromFolder, Action::RenameToFolder)
        };
        return Ok(vec![
            WireMessage {
                action: from_action.to_u8().expect("Action fits in u8"),
                cookie: event.cookie,
                major,
                minor,
                path: path_to_cstring(&event.src)?,
            },
            WireMessage {
                action: to_action.to_u8().expect("Action fits in u8"),
                cookie: event.cookie,
                major,
                minor,
                path: path_to_cstring(dst)?,
            },
        ]);
    }

    Ok(vec![WireMessage {
        action: event.action.to_u8().expect("Action fits in u8"),
        cookie: event.cookie,
        major,
        minor,
        path: path_to_cstring(&event.src)?,
    }])
}

/// Reconstructs the raw (possibly half-rename) event a single wire message
/// represents. Callers that need paired renames run this through a
/// `RenamePairing`.
pub fn message_to_raw_event(msg: &WireMessage) -> Result<FsEvent> {
    let action = Action::from_u8(msg.action).ok_or_else(|| Error::Protocol(format!("unknown action code {}", msg.action)))?;
    let device = DeviceId::new(msg.major as u32, msg.minor as u32);
    let src = cstring_to_path(&msg.path);
    Ok(FsEvent { action, cookie: msg.cookie, device, src, dst: None })
}

/// Single-producer, single-consumer multicast channel ("typed
/// multicast message channel", "exactly one registered consumer").
pub struct Channel {
    sender: tokio::sync::broadcast::Sender<Vec<u8>>,
    _consumer_taken: std::sync::atomic::AtomicBool,
}

impl Channel {
    pub fn new(capacity: usize) -> (std::sync::Arc<Self>, ChannelReceiver) {
        let (sender, receiver) = tokio::sync::broadcast::channel(capacity);
        let channel = std::sync::Arc::new(Self {
            sender,
            _consumer_taken: std::sync::atomic::AtomicBool::new(true),
        });
        (channel, ChannelReceiver(receiver))
    }

    pub fn send(&self, msg: &WireMessage) -> Result<()> {
        let bytes = msg.encode()?;
        // No receivers yet is not an error: the daemon may start the probe
        // before the filter task subscribes.
        let _ = self.sender.send(bytes);
        Ok(())
    }
}

pub struct ChannelReceiver(tokio::sync::broadcast::Receiver<Vec<u8>>);

impl ChannelReceiver {
    pub async fn recv(&mut self) -> Result<WireMessage> {
        loop {
            match self.0.recv().await {
                Ok(bytes) => return WireMessage::decode(&bytes),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Err(Error::Fatal("transport channel closed".into()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DeviceId;
    use std::path::PathBuf;

    #[test]
    fn round_trips_a_plain_event() {
        let event = FsEvent::new(Action::NewFile, DeviceId::new(8, 1), PathBuf::from("/a/b.txt"));
        let messages = split_for_wire(&event).unwrap();
        assert_eq!(messages.len(), 1);
        let bytes = messages[0].encode().unwrap();
        let decoded = WireMessage::decode(&bytes).unwrap();
        let raw = message_to_raw_event(&decoded).unwrap();
        assert_eq!(raw.action, Action::NewFile);
        assert_eq!(raw.src, PathBuf::from("/a/b.txt"));
    }

    #[test]
    fn rename_splits_into_from_and_to_with_shared_cookie() {
        let event = FsEvent::rename(Action::RenameFile, DeviceId::new(8, 1), PathBuf::from("/a/x"), PathBuf::from("/b/y"), 7);
        let messages = split_for_wire(&event).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].cookie, 7);
        assert_eq!(messages[1].cookie, 7);
        let from = message_to_raw_event(&messages[0]).unwrap();
        let to = message_to_raw_event(&messages[1]).unwrap();
        assert_eq!(from.action, Action::RenameFromFile);
        assert_eq!(to.action, Action::RenameToFile);
        assert_eq!(from.src, PathBuf::from("/a/x"));
        assert_eq!(to.src, PathBuf::from("/b/y"));
    }

    #[test]
    fn rejects_path_over_the_limit() {
        let long = "a".repeat(MAX_PATH_LEN + 1);
        let event = FsEvent::new(Action::NewFile, DeviceId::new(8, 1), PathBuf::from(format!("/{long}")));
        assert!(split_for_wire(&event).unwrap()[0].encode().is_err());
    }

    #[tokio::test]
    async fn channel_delivers_in_order() {
        let (channel, mut rx) = Channel::new(16);
        let event = FsEvent::new(Action::DelFile, DeviceId::new(1, 0), PathBuf::from("/x"));
        channel.send(&split_for_wire(&event).unwrap()[0]).unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.action, Action::DelFile.to_u8().unwrap());
    }
}
