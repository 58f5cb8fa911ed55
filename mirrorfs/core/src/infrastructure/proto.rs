// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Wire codec
//!
//! Generated `mirrorfs.v1` stubs plus the conversions between them and the
//! domain types. Both the RPC client and the RPC handlers go through these,
//! so a record looks the same on either side of the channel.
//!
//! Error mapping keeps the filesystem taxonomy intact across the wire:
//! [`FsError`] becomes a status code on the server and is rebuilt from the
//! code on the client.

use chrono::{DateTime, Utc};
use tonic::{Code, Status};

use crate::domain::attributes::{DirEntry, FileAttributes, SetAttributes, TimeSpec, Timestamp};
use crate::domain::error::FsError;
use crate::domain::events::{FileEvent, FileEventKind};
use crate::domain::transfer::Chunk;

pub mod mirrorfs {
    pub mod v1 {
        tonic::include_proto!("mirrorfs.v1");
    }
}

pub use mirrorfs::v1 as pb;

impl From<Timestamp> for pb::Timespec {
    fn from(ts: Timestamp) -> Self {
        pb::Timespec {
            seconds: ts.seconds,
            nanos: ts.nanos,
        }
    }
}

impl From<pb::Timespec> for Timestamp {
    fn from(ts: pb::Timespec) -> Self {
        Timestamp::new(ts.seconds, i64::from(ts.nanos))
    }
}

impl From<&FileAttributes> for pb::FileAttr {
    fn from(attr: &FileAttributes) -> Self {
        pb::FileAttr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: Some(attr.atime.into()),
            mtime: Some(attr.mtime.into()),
            ctime: Some(attr.ctime.into()),
            mode: attr.mode,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            blksize: attr.blksize,
        }
    }
}

impl From<pb::FileAttr> for FileAttributes {
    fn from(attr: pb::FileAttr) -> Self {
        FileAttributes {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: attr.atime.map(Into::into).unwrap_or_default(),
            mtime: attr.mtime.map(Into::into).unwrap_or_default(),
            ctime: attr.ctime.map(Into::into).unwrap_or_default(),
            mode: attr.mode,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: 0,
            blksize: attr.blksize,
        }
    }
}

impl From<&DirEntry> for pb::DirEntry {
    fn from(entry: &DirEntry) -> Self {
        pb::DirEntry {
            path: entry.path.clone(),
            name: entry.name.clone(),
            attr: Some((&entry.attr).into()),
        }
    }
}

impl TryFrom<pb::DirEntry> for DirEntry {
    type Error = FsError;

    fn try_from(entry: pb::DirEntry) -> Result<Self, FsError> {
        let attr = entry
            .attr
            .ok_or_else(|| FsError::Internal(format!("{}: entry without attributes", entry.path)))?;
        Ok(DirEntry {
            path: entry.path,
            name: entry.name,
            attr: attr.into(),
        })
    }
}

/// `Now` is resolved on the sending side; the wire only carries instants.
fn time_spec(spec: Option<TimeSpec>) -> Option<pb::Timespec> {
    spec.map(|spec| match spec {
        TimeSpec::Now => Timestamp::now().into(),
        TimeSpec::At(ts) => ts.into(),
    })
}

/// Ownership is never mirrored and is dropped here.
pub fn setattr_request(path: &str, changes: &SetAttributes) -> pb::SetattrRequest {
    pb::SetattrRequest {
        path: path.to_string(),
        mode: changes.mode,
        size: changes.size,
        atime: time_spec(changes.atime),
        mtime: time_spec(changes.mtime),
    }
}

impl From<&pb::SetattrRequest> for SetAttributes {
    fn from(req: &pb::SetattrRequest) -> Self {
        SetAttributes {
            mode: req.mode,
            uid: None,
            gid: None,
            size: req.size,
            atime: req.atime.map(|ts| TimeSpec::At(ts.into())),
            mtime: req.mtime.map(|ts| TimeSpec::At(ts.into())),
        }
    }
}

impl From<Chunk> for pb::FileChunk {
    fn from(chunk: Chunk) -> Self {
        pb::FileChunk {
            data: chunk.data,
            offset: chunk.offset as i64,
            total_size: chunk.total_size as i64,
        }
    }
}

impl TryFrom<pb::FileChunk> for Chunk {
    type Error = FsError;

    fn try_from(chunk: pb::FileChunk) -> Result<Self, FsError> {
        let offset = u64::try_from(chunk.offset)
            .map_err(|_| FsError::InvalidArgument(format!("negative chunk offset {}", chunk.offset)))?;
        let total_size = u64::try_from(chunk.total_size)
            .map_err(|_| FsError::InvalidArgument(format!("negative total size {}", chunk.total_size)))?;
        Ok(Chunk {
            data: chunk.data,
            offset,
            total_size,
        })
    }
}

impl From<FileEventKind> for pb::FileEventKind {
    fn from(kind: FileEventKind) -> Self {
        match kind {
            FileEventKind::Add => pb::FileEventKind::Add,
            FileEventKind::Modify => pb::FileEventKind::Modify,
            FileEventKind::Rename => pb::FileEventKind::Rename,
            FileEventKind::Delete => pb::FileEventKind::Delete,
        }
    }
}

impl From<&FileEvent> for pb::FileEvent {
    fn from(event: &FileEvent) -> Self {
        pb::FileEvent {
            kind: pb::FileEventKind::from(event.kind) as i32,
            path: event.path.clone(),
            new_path: event.new_path.clone().unwrap_or_default(),
            mode: event.mode,
            timestamp: Some(pb::Timespec {
                seconds: event.timestamp.timestamp(),
                nanos: event.timestamp.timestamp_subsec_nanos(),
            }),
        }
    }
}

impl TryFrom<pb::FileEvent> for FileEvent {
    type Error = FsError;

    fn try_from(event: pb::FileEvent) -> Result<Self, FsError> {
        let kind = match pb::FileEventKind::try_from(event.kind) {
            Ok(pb::FileEventKind::Add) => FileEventKind::Add,
            Ok(pb::FileEventKind::Modify) => FileEventKind::Modify,
            Ok(pb::FileEventKind::Rename) => FileEventKind::Rename,
            Ok(pb::FileEventKind::Delete) => FileEventKind::Delete,
            _ => return Err(FsError::InvalidArgument(format!("unknown event kind {}", event.kind))),
        };
        let new_path = match kind {
            FileEventKind::Rename if event.new_path.is_empty() => {
                return Err(FsError::InvalidArgument(format!("rename of {} without target", event.path)))
            }
            FileEventKind::Rename => Some(event.new_path),
            _ => None,
        };
        let timestamp = event
            .timestamp
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts.seconds, ts.nanos))
            .unwrap_or_else(Utc::now);
        Ok(FileEvent {
            kind,
            path: event.path,
            new_path,
            mode: event.mode,
            timestamp,
        })
    }
}

impl From<FsError> for Status {
    fn from(err: FsError) -> Self {
        let message = err.to_string();
        match err {
            FsError::NotFound(_) => Status::not_found(message),
            FsError::PermissionDenied(_) => Status::permission_denied(message),
            FsError::AlreadyExists(_) => Status::already_exists(message),
            FsError::InvalidArgument(_) => Status::invalid_argument(message),
            FsError::Unauthenticated(_) | FsError::NotLoggedIn => Status::unauthenticated(message),
            FsError::ResourceExhausted => Status::resource_exhausted(message),
            FsError::TimedOut => Status::deadline_exceeded(message),
            FsError::SizeMismatch { .. } => Status::data_loss(message),
            FsError::NotEmpty(_) | FsError::NotADirectory(_) | FsError::IsADirectory(_) => {
                Status::failed_precondition(message)
            }
            FsError::CrossDevice(_) | FsError::Os(_) | FsError::Internal(_) => Status::internal(message),
        }
    }
}

impl From<Status> for FsError {
    fn from(status: Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::NotFound => FsError::NotFound(message),
            Code::PermissionDenied => FsError::PermissionDenied(message),
            Code::AlreadyExists => FsError::AlreadyExists(message),
            Code::InvalidArgument => FsError::InvalidArgument(message),
            Code::Unauthenticated => FsError::Unauthenticated(message),
            Code::ResourceExhausted => FsError::ResourceExhausted,
            Code::DeadlineExceeded => FsError::TimedOut,
            Code::FailedPrecondition if message.starts_with("directory not empty") => FsError::NotEmpty(message),
            Code::FailedPrecondition if message.starts_with("not a directory") => FsError::NotADirectory(message),
            Code::FailedPrecondition if message.starts_with("is a directory") => FsError::IsADirectory(message),
            Code::Unavailable => FsError::Os(libc::ENOTCONN),
            _ => FsError::Internal(format!("{}: {}", status.code(), message)),
        }
    }
}
