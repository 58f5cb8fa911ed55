// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Attribute Codec
//!
//! Converts host file metadata into the wire-safe [`FileAttributes`] record that
//! is exchanged over RPC and handed to the mount layer. The record never carries
//! host-specific types: timestamps are plain seconds/nanoseconds pairs and the
//! file type is folded into `mode` exactly as `stat(2)` reports it.

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// File type for directory entries and attributes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    /// Devices, sockets and fifos. Served locally, never mirrored.
    Other,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFREG => FileKind::File,
            libc::S_IFDIR => FileKind::Directory,
            libc::S_IFLNK => FileKind::Symlink,
            _ => FileKind::Other,
        }
    }
}

/// Seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i64) -> Self {
        Self {
            seconds,
            nanos: nanos.clamp(0, 999_999_999) as u32,
        }
    }

    pub fn now() -> Self {
        SystemTime::now().into()
    }

    pub fn to_system_time(self) -> SystemTime {
        if self.seconds >= 0 {
            UNIX_EPOCH + Duration::new(self.seconds as u64, self.nanos)
        } else {
            UNIX_EPOCH - Duration::from_secs(self.seconds.unsigned_abs())
                + Duration::from_nanos(u64::from(self.nanos))
        }
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                seconds: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            },
            Err(e) => {
                let d = e.duration();
                // Round towards negative infinity so nanos stays non-negative
                if d.subsec_nanos() == 0 {
                    Self { seconds: -(d.as_secs() as i64), nanos: 0 }
                } else {
                    Self {
                        seconds: -(d.as_secs() as i64) - 1,
                        nanos: 1_000_000_000 - d.subsec_nanos(),
                    }
                }
            }
        }
    }
}

/// POSIX file attributes as reported by `lstat(2)` on the backing store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileAttributes {
    /// Inode number reported by the backing filesystem
    pub ino: u64,
    pub size: u64,
    /// 512-byte blocks allocated
    pub blocks: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    /// File type and permission bits
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

impl FileAttributes {
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            ino: meta.ino(),
            size: meta.size(),
            blocks: meta.blocks(),
            atime: Timestamp::new(meta.atime(), meta.atime_nsec()),
            mtime: Timestamp::new(meta.mtime(), meta.mtime_nsec()),
            ctime: Timestamp::new(meta.ctime(), meta.ctime_nsec()),
            mode: meta.mode(),
            nlink: meta.nlink().min(u64::from(u32::MAX)) as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
        }
    }

    pub fn kind(&self) -> FileKind {
        FileKind::from_mode(self.mode)
    }

    /// Permission bits only (`mode & 0o7777`).
    pub fn permissions(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }
}

/// A directory entry plus the attribute snapshot taken when it was listed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirEntry {
    /// Root-relative path of the entry
    pub path: String,
    pub name: String,
    pub attr: FileAttributes,
}

/// Optional sub-operations of a setattr request. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttributes {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeSpec>,
    pub mtime: Option<TimeSpec>,
}

impl SetAttributes {
    pub fn is_empty(&self) -> bool {
        *self == SetAttributes::default()
    }

    /// The subset that is replayed on the remote side. Ownership stays local.
    pub fn mirrored(&self) -> SetAttributes {
        SetAttributes {
            uid: None,
            gid: None,
            ..self.clone()
        }
    }
}

/// Timestamp argument of a setattr request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSpec {
    Now,
    At(Timestamp),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_from_metadata_reports_backing_inode() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"hello").unwrap();

        let meta = std::fs::symlink_metadata(&path).unwrap();
        let attr = FileAttributes::from_metadata(&meta);
        assert_eq!(attr.ino, meta.ino());
        assert_eq!(attr.size, 5);
        assert_eq!(attr.kind(), FileKind::File);
        assert_eq!(attr.nlink, 1);
    }

    #[test]
    fn test_kind_from_mode() {
        assert_eq!(FileKind::from_mode(libc::S_IFDIR | 0o755), FileKind::Directory);
        assert_eq!(FileKind::from_mode(libc::S_IFLNK | 0o777), FileKind::Symlink);
        assert_eq!(FileKind::from_mode(libc::S_IFIFO | 0o644), FileKind::Other);
    }

    #[test]
    fn test_timestamp_conversion_before_epoch() {
        let before = UNIX_EPOCH - Duration::from_millis(1500);
        let ts = Timestamp::from(before);
        assert_eq!(ts.seconds, -2);
        assert_eq!(ts.nanos, 500_000_000);
        assert_eq!(ts.to_system_time(), before);
    }

    #[test]
    fn test_mirrored_setattr_drops_ownership() {
        let changes = SetAttributes {
            mode: Some(0o600),
            uid: Some(0),
            gid: Some(0),
            ..Default::default()
        };
        let mirrored = changes.mirrored();
        assert_eq!(mirrored.mode, Some(0o600));
        assert!(mirrored.uid.is_none() && mirrored.gid.is_none());
    }
}
