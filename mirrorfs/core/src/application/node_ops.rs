// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Node capabilities
//!
//! Which operations a node kind supports is spelled out as trait
//! implementations: every kind has [`NodeOps`], directories add
//! [`DirectoryOps`], regular files [`FileOps`] and symlinks [`SymlinkOps`].
//! Each mutating operation performs the backing syscall first and reports
//! the committed mutation to the context's sink only on success.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::application::mirror::{Mutation, MutationSink};
use crate::domain::attributes::{DirEntry, FileAttributes, SetAttributes};
use crate::domain::error::FsError;
use crate::domain::node::{DirectoryNode, FileNode, Node, SpecialNode, SymlinkNode};
use crate::domain::path_sanitizer::{join_name, PathSanitizer};
use crate::infrastructure::backing_store::BackingStore;

/// `renameat2(2)` flags understood by [`DirectoryOps::rename`].
pub const RENAME_NOREPLACE: u32 = 1;
pub const RENAME_EXCHANGE: u32 = 2;

/// Backing store plus the sink mutations are reported to.
pub struct NodeContext {
    pub store: BackingStore,
    pub sink: Arc<dyn MutationSink>,
    sanitizer: PathSanitizer,
}

impl NodeContext {
    pub fn new(store: BackingStore, sink: Arc<dyn MutationSink>) -> Self {
        Self {
            store,
            sink,
            sanitizer: PathSanitizer::new(),
        }
    }

    /// Classify whatever currently lives at `path`.
    pub fn node(&self, path: &str) -> Result<(Node, FileAttributes), FsError> {
        let attr = self.store.lstat(path)?;
        Ok((Node::classify(path, &attr), attr))
    }

    fn child_path(&self, dir: &str, name: &str) -> Result<String, FsError> {
        self.sanitizer.validate_name(name)?;
        Ok(join_name(dir, name))
    }
}

pub trait NodeOps {
    fn path(&self) -> &str;

    fn getattr(&self, cx: &NodeContext) -> Result<FileAttributes, FsError> {
        cx.store.lstat(self.path())
    }

    fn setattr(&self, cx: &NodeContext, changes: &SetAttributes) -> Result<FileAttributes, FsError> {
        let attr = cx.store.set_attributes(self.path(), changes)?;
        cx.sink.committed(
            Mutation::SetAttr {
                path: self.path().to_string(),
                changes: changes.clone(),
            },
            attr.mode,
        );
        Ok(attr)
    }

    fn access(&self, cx: &NodeContext, mask: i32) -> Result<(), FsError> {
        cx.store.access(self.path(), mask)
    }
}

pub trait DirectoryOps: NodeOps {
    fn lookup(&self, cx: &NodeContext, name: &str) -> Result<(Node, FileAttributes), FsError> {
        let path = cx.child_path(self.path(), name)?;
        cx.node(&path)
    }

    fn read_dir(&self, cx: &NodeContext) -> Result<Vec<DirEntry>, FsError> {
        cx.store.read_dir(self.path())
    }

    fn mkdir(&self, cx: &NodeContext, name: &str, mode: u32) -> Result<(String, FileAttributes), FsError> {
        let path = cx.child_path(self.path(), name)?;
        let attr = cx.store.mkdir(&path, mode)?;
        cx.sink.committed(
            Mutation::Mkdir {
                path: path.clone(),
                mode: attr.mode,
            },
            attr.mode,
        );
        Ok((path, attr))
    }

    fn create(
        &self,
        cx: &NodeContext,
        name: &str,
        mode: u32,
        flags: i32,
    ) -> Result<(String, File, FileAttributes), FsError> {
        let path = cx.child_path(self.path(), name)?;
        // Offsets must match what the server sees, so appends are resolved
        // by the kernel rather than the local descriptor.
        let file = cx.store.create(&path, mode, flags & !libc::O_APPEND)?;
        let attr = cx.store.lstat(&path)?;
        cx.sink.committed(
            Mutation::Create {
                path: path.clone(),
                mode: attr.mode,
                flags,
            },
            attr.mode,
        );
        Ok((path, file, attr))
    }

    fn unlink(&self, cx: &NodeContext, name: &str) -> Result<String, FsError> {
        let path = cx.child_path(self.path(), name)?;
        let attr = cx.store.lstat(&path)?;
        cx.store.remove_file(&path)?;
        cx.sink.committed(Mutation::Unlink { path: path.clone() }, attr.mode);
        Ok(path)
    }

    fn rmdir(&self, cx: &NodeContext, name: &str) -> Result<String, FsError> {
        let path = cx.child_path(self.path(), name)?;
        let attr = cx.store.lstat(&path)?;
        cx.store.remove_dir(&path)?;
        cx.sink.committed(Mutation::Rmdir { path: path.clone() }, attr.mode);
        Ok(path)
    }

    fn symlink(&self, cx: &NodeContext, name: &str, target: &str) -> Result<(String, FileAttributes), FsError> {
        let path = cx.child_path(self.path(), name)?;
        let attr = cx.store.symlink(target, &path)?;
        cx.sink.committed(
            Mutation::Symlink {
                target: target.to_string(),
                path: path.clone(),
            },
            attr.mode,
        );
        Ok((path, attr))
    }

    /// Hard-link `existing` into this directory as `name`.
    fn link(&self, cx: &NodeContext, existing: &Node, name: &str) -> Result<(String, FileAttributes), FsError> {
        if let Node::Directory(_) = existing {
            return Err(FsError::Os(libc::EPERM));
        }
        let path = cx.child_path(self.path(), name)?;
        let attr = cx.store.link(existing.path(), &path)?;
        cx.sink.committed(
            Mutation::Link {
                existing: existing.path().to_string(),
                path: path.clone(),
            },
            attr.mode,
        );
        Ok((path, attr))
    }

    /// Move `name` into `target` as `new_name`, returning both paths.
    fn rename(
        &self,
        cx: &NodeContext,
        name: &str,
        target: &DirectoryNode,
        new_name: &str,
        flags: u32,
    ) -> Result<(String, String), FsError> {
        let from = cx.child_path(self.path(), name)?;
        let to = cx.child_path(target.path(), new_name)?;

        if flags & RENAME_EXCHANGE != 0 {
            return Err(FsError::InvalidArgument(from));
        }
        if flags & RENAME_NOREPLACE != 0 && cx.store.exists(&to)? {
            return Err(FsError::AlreadyExists(to));
        }

        cx.store.rename(&from, &to)?;
        let mode = cx.store.lstat(&to).map(|attr| attr.mode).unwrap_or(0);
        debug!(from = %from, to = %to, "Renamed");
        cx.sink.committed(
            Mutation::Rename {
                from: from.clone(),
                to: to.clone(),
            },
            mode,
        );
        Ok((from, to))
    }
}

pub trait FileOps: NodeOps {
    fn open(&self, cx: &NodeContext, flags: i32) -> Result<File, FsError> {
        let file = cx.store.open(self.path(), flags & !libc::O_APPEND)?;
        let truncates = flags & libc::O_TRUNC != 0 && flags & libc::O_ACCMODE != libc::O_RDONLY;
        if truncates {
            let changes = SetAttributes {
                size: Some(0),
                ..Default::default()
            };
            let mode = file.metadata().map(|m| std::os::unix::fs::MetadataExt::mode(&m)).unwrap_or(0);
            cx.sink.committed(
                Mutation::SetAttr {
                    path: self.path().to_string(),
                    changes,
                },
                mode,
            );
        }
        Ok(file)
    }
}

pub trait SymlinkOps: NodeOps {
    fn readlink(&self, cx: &NodeContext) -> Result<PathBuf, FsError> {
        cx.store.read_link(self.path())
    }
}

impl NodeOps for DirectoryNode {
    fn path(&self) -> &str {
        DirectoryNode::path(self)
    }
}

impl NodeOps for FileNode {
    fn path(&self) -> &str {
        FileNode::path(self)
    }
}

impl NodeOps for SymlinkNode {
    fn path(&self) -> &str {
        SymlinkNode::path(self)
    }

    /// Permissions and size of a link are meaningless; only ownership and
    /// times apply, without following the link.
    fn setattr(&self, cx: &NodeContext, changes: &SetAttributes) -> Result<FileAttributes, FsError> {
        let changes = SetAttributes {
            mode: None,
            size: None,
            ..changes.clone()
        };
        let attr = cx.store.set_attributes(self.path(), &changes)?;
        cx.sink.committed(
            Mutation::SetAttr {
                path: self.path().to_string(),
                changes,
            },
            attr.mode,
        );
        Ok(attr)
    }
}

impl NodeOps for SpecialNode {
    fn path(&self) -> &str {
        SpecialNode::path(self)
    }
}

impl DirectoryOps for DirectoryNode {}
impl FileOps for FileNode {}
impl SymlinkOps for SymlinkNode {}

impl NodeOps for Node {
    fn path(&self) -> &str {
        Node::path(self)
    }

    fn setattr(&self, cx: &NodeContext, changes: &SetAttributes) -> Result<FileAttributes, FsError> {
        match self {
            Node::Directory(n) => n.setattr(cx, changes),
            Node::File(n) => n.setattr(cx, changes),
            Node::Symlink(n) => n.setattr(cx, changes),
            Node::Special(n) => n.setattr(cx, changes),
        }
    }
}
