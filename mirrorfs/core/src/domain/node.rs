// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Filesystem Nodes
//!
//! A [`Node`] is a root-relative backing path classified by what the backing
//! store currently reports for it. Classification happens per call from a
//! fresh `lstat`; nothing about a node outlives the operation that built it.
//!
//! Each kind is its own type so that the operations a kind supports can be
//! expressed as trait implementations on that type (see
//! `application::node_ops`). Converting a [`Node`] into the view an operation
//! needs is where a wrong-kind request fails (`ENOTDIR`, `EISDIR`, `EINVAL`).
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Typed views over backing entries

use super::attributes::{FileAttributes, FileKind};
use super::error::FsError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryNode {
    path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkNode {
    path: String,
}

/// Devices, fifos and sockets found in the backing directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialNode {
    path: String,
}

macro_rules! node_view {
    ($ty:ident) => {
        impl $ty {
            pub fn new(path: impl Into<String>) -> Self {
                Self { path: path.into() }
            }

            pub fn path(&self) -> &str {
                &self.path
            }
        }
    };
}

node_view!(DirectoryNode);
node_view!(FileNode);
node_view!(SymlinkNode);
node_view!(SpecialNode);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Directory(DirectoryNode),
    File(FileNode),
    Symlink(SymlinkNode),
    Special(SpecialNode),
}

impl Node {
    pub fn classify(path: impl Into<String>, attr: &FileAttributes) -> Self {
        let path = path.into();
        match attr.kind() {
            FileKind::Directory => Node::Directory(DirectoryNode { path }),
            FileKind::File => Node::File(FileNode { path }),
            FileKind::Symlink => Node::Symlink(SymlinkNode { path }),
            FileKind::Other => Node::Special(SpecialNode { path }),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Node::Directory(n) => n.path(),
            Node::File(n) => n.path(),
            Node::Symlink(n) => n.path(),
            Node::Special(n) => n.path(),
        }
    }

    pub fn kind(&self) -> FileKind {
        match self {
            Node::Directory(_) => FileKind::Directory,
            Node::File(_) => FileKind::File,
            Node::Symlink(_) => FileKind::Symlink,
            Node::Special(_) => FileKind::Other,
        }
    }

    pub fn into_directory(self) -> Result<DirectoryNode, FsError> {
        match self {
            Node::Directory(dir) => Ok(dir),
            other => Err(FsError::NotADirectory(other.path().to_string())),
        }
    }

    pub fn into_file(self) -> Result<FileNode, FsError> {
        match self {
            Node::File(file) => Ok(file),
            Node::Directory(dir) => Err(FsError::IsADirectory(dir.path)),
            other => Err(FsError::InvalidArgument(other.path().to_string())),
        }
    }

    pub fn into_symlink(self) -> Result<SymlinkNode, FsError> {
        match self {
            Node::Symlink(link) => Ok(link),
            other => Err(FsError::InvalidArgument(other.path().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::attributes::Timestamp;

    fn attr(mode: u32) -> FileAttributes {
        FileAttributes {
            ino: 7,
            size: 0,
            blocks: 0,
            atime: Timestamp::default(),
            mtime: Timestamp::default(),
            ctime: Timestamp::default(),
            mode,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
        }
    }

    #[test]
    fn test_classify_by_mode() {
        let node = Node::classify("/docs", &attr(libc::S_IFDIR | 0o755));
        assert_eq!(node.kind(), FileKind::Directory);
        assert_eq!(node.into_directory().unwrap().path(), "/docs");
    }

    #[test]
    fn test_wrong_kind_views_fail_with_posix_codes() {
        let file = Node::classify("/a.txt", &attr(libc::S_IFREG | 0o644));
        assert_eq!(file.clone().into_directory().unwrap_err().errno(), libc::ENOTDIR);
        assert_eq!(file.into_symlink().unwrap_err().errno(), libc::EINVAL);

        let dir = Node::classify("/d", &attr(libc::S_IFDIR | 0o755));
        assert_eq!(dir.into_file().unwrap_err().errno(), libc::EISDIR);
    }
}
