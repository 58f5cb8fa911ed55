// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Loopback filesystem node adapter
//!
//! Serves mount-layer operations, addressed by inode number and entry name,
//! against a backing directory. Every call re-stats the backing store; the
//! only state kept between calls is the inode-to-path table, the open
//! handles, and the kernel reference counts the mount layer expects.
//!
//! The adapter is independent of any particular mount library. The fuser
//! binding in `infrastructure::fuse` translates its results into replies.

use std::ffi::OsStr;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, instrument};

use crate::application::file_handle::{FileHandle, HandleTable, LockRequest, ReadHook};
use crate::application::mirror::MutationSink;
use crate::application::node_ops::{DirectoryOps, FileOps, NodeContext, NodeOps, SymlinkOps};
use crate::application::node_table::{NodeTable, ROOT_INO};
use crate::domain::attributes::{FileAttributes, FileKind, SetAttributes};
use crate::domain::error::FsError;
use crate::domain::node::{DirectoryNode, Node};
use crate::domain::path_sanitizer::parent_of;
use crate::infrastructure::backing_store::{BackingStore, StoreStats};

/// Lets the adapter tell the kernel that a cached name is no longer valid.
pub trait KernelNotifier: Send + Sync {
    fn invalidate_entry(&self, parent: u64, name: &str);
}

pub struct NoopNotifier;

impl KernelNotifier for NoopNotifier {
    fn invalidate_entry(&self, _parent: u64, _name: &str) {}
}

/// A looked-up entry; `attr.ino` is already the kernel inode number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub ino: u64,
    pub attr: FileAttributes,
}

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub ino: u64,
    pub kind: FileKind,
    pub name: String,
}

pub struct LoopbackFs {
    cx: NodeContext,
    nodes: RwLock<NodeTable>,
    handles: HandleTable,
    read_hook: Option<Arc<dyn ReadHook>>,
    notifier: RwLock<Arc<dyn KernelNotifier>>,
}

impl LoopbackFs {
    pub fn new(store: BackingStore, sink: Arc<dyn MutationSink>) -> Result<Self, FsError> {
        let root = store.lstat("/")?;
        if root.kind() != FileKind::Directory {
            return Err(FsError::NotADirectory(store.root().display().to_string()));
        }
        Ok(Self {
            cx: NodeContext::new(store, sink),
            nodes: RwLock::new(NodeTable::new(root.ino)),
            handles: HandleTable::new(),
            read_hook: None,
            notifier: RwLock::new(Arc::new(NoopNotifier)),
        })
    }

    pub fn with_read_hook(mut self, hook: Arc<dyn ReadHook>) -> Self {
        self.read_hook = Some(hook);
        self
    }

    /// Install the notifier once the mount session exists.
    pub fn set_notifier(&self, notifier: Arc<dyn KernelNotifier>) {
        *self.notifier.write() = notifier;
    }

    pub fn store(&self) -> &BackingStore {
        &self.cx.store
    }

    fn path_of(&self, ino: u64) -> Result<String, FsError> {
        self.nodes
            .read()
            .path(ino)
            .map(str::to_string)
            .ok_or_else(|| FsError::NotFound(format!("inode {ino}")))
    }

    fn node_of(&self, ino: u64) -> Result<(Node, FileAttributes), FsError> {
        let path = self.path_of(ino)?;
        self.cx.node(&path)
    }

    fn directory(&self, ino: u64) -> Result<DirectoryNode, FsError> {
        self.node_of(ino)?.0.into_directory()
    }

    fn present(&self, mut attr: FileAttributes) -> FileAttributes {
        attr.ino = self.nodes.read().kernel_ino(attr.ino);
        attr
    }

    /// Hand one new kernel reference to `path`.
    fn remember(&self, path: &str, mut attr: FileAttributes) -> Entry {
        let ino = self.nodes.write().remember(attr.ino, path);
        attr.ino = ino;
        Entry { ino, attr }
    }

    fn open_handle(&self, file: std::fs::File, path: &str) -> u64 {
        let handle = FileHandle::new(file, path, self.cx.sink.clone(), self.read_hook.clone());
        self.handles.insert(handle)
    }

    #[instrument(level = "debug", skip(self))]
    pub fn lookup(&self, parent: u64, name: &OsStr) -> Result<Entry, FsError> {
        let dir = self.directory(parent)?;
        let (node, attr) = dir.lookup(&self.cx, utf8(name)?)?;
        Ok(self.remember(node.path(), attr))
    }

    pub fn forget(&self, ino: u64, count: u64) {
        self.nodes.write().forget(ino, count);
    }

    pub fn getattr(&self, ino: u64, fh: Option<u64>) -> Result<FileAttributes, FsError> {
        let attr = match fh {
            Some(fh) => self.handles.get(fh)?.getattr()?,
            None => self.node_of(ino)?.1,
        };
        Ok(self.present(attr))
    }

    pub fn setattr(&self, ino: u64, fh: Option<u64>, changes: &SetAttributes) -> Result<FileAttributes, FsError> {
        let attr = match fh {
            Some(fh) => self.handles.get(fh)?.setattr(changes)?,
            None => {
                let (node, _) = self.node_of(ino)?;
                node.setattr(&self.cx, changes)?
            }
        };
        Ok(self.present(attr))
    }

    pub fn readlink(&self, ino: u64) -> Result<Vec<u8>, FsError> {
        let link = self.node_of(ino)?.0.into_symlink()?;
        Ok(link.readlink(&self.cx)?.into_os_string().into_vec())
    }

    pub fn mkdir(&self, parent: u64, name: &OsStr, mode: u32, umask: u32) -> Result<Entry, FsError> {
        let dir = self.directory(parent)?;
        let (path, attr) = dir.mkdir(&self.cx, utf8(name)?, mode & !umask)?;
        Ok(self.remember(&path, attr))
    }

    /// Create and open a regular file.
    pub fn create(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
    ) -> Result<(Entry, u64), FsError> {
        let dir = self.directory(parent)?;
        let (path, file, attr) = dir.create(&self.cx, utf8(name)?, mode & !umask, flags)?;
        let fh = self.open_handle(file, &path);
        Ok((self.remember(&path, attr), fh))
    }

    pub fn unlink(&self, parent: u64, name: &OsStr) -> Result<(), FsError> {
        let dir = self.directory(parent)?;
        dir.unlink(&self.cx, utf8(name)?)?;
        Ok(())
    }

    pub fn rmdir(&self, parent: u64, name: &OsStr) -> Result<(), FsError> {
        let dir = self.directory(parent)?;
        dir.rmdir(&self.cx, utf8(name)?)?;
        Ok(())
    }

    /// Move an entry, re-point cached paths and open handles, and tell the
    /// kernel both names changed.
    #[instrument(level = "debug", skip(self))]
    pub fn rename(
        &self,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
        flags: u32,
    ) -> Result<(), FsError> {
        let source = self.directory(parent)?;
        let target = self.directory(new_parent)?;
        let (name, new_name) = (utf8(name)?, utf8(new_name)?);

        let (from, to) = source.rename(&self.cx, name, &target, new_name, flags)?;
        self.nodes.write().rename(&from, &to);
        self.handles.rename(&from, &to);

        let notifier = self.notifier.read().clone();
        notifier.invalidate_entry(parent, name);
        notifier.invalidate_entry(new_parent, new_name);
        Ok(())
    }

    pub fn symlink(&self, parent: u64, name: &OsStr, target: &OsStr) -> Result<Entry, FsError> {
        let dir = self.directory(parent)?;
        let (path, attr) = dir.symlink(&self.cx, utf8(name)?, utf8(target)?)?;
        Ok(self.remember(&path, attr))
    }

    pub fn link(&self, ino: u64, new_parent: u64, new_name: &OsStr) -> Result<Entry, FsError> {
        let (existing, _) = self.node_of(ino)?;
        let dir = self.directory(new_parent)?;
        let (path, attr) = dir.link(&self.cx, &existing, utf8(new_name)?)?;
        Ok(self.remember(&path, attr))
    }

    pub fn open(&self, ino: u64, flags: i32) -> Result<u64, FsError> {
        let file_node = self.node_of(ino)?.0.into_file()?;
        let file = file_node.open(&self.cx, flags)?;
        Ok(self.open_handle(file, file_node.path()))
    }

    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        self.handles.get(fh)?.read(offset, size)
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        self.handles.get(fh)?.write(offset, data)
    }

    pub fn flush(&self, fh: u64) -> Result<(), FsError> {
        self.handles.get(fh)?.flush()
    }

    pub fn fsync(&self, fh: u64, datasync: bool) -> Result<(), FsError> {
        self.handles.get(fh)?.fsync(datasync)
    }

    pub fn release(&self, fh: u64) {
        if let Some(handle) = self.handles.remove(fh) {
            handle.release();
        }
    }

    pub fn lseek(&self, fh: u64, offset: i64, whence: i32) -> Result<i64, FsError> {
        self.handles.get(fh)?.seek(offset, whence)
    }

    pub fn getlk(&self, fh: u64, request: &LockRequest) -> Result<LockRequest, FsError> {
        self.handles.get(fh)?.get_lock(request)
    }

    pub fn setlk(&self, fh: u64, request: &LockRequest, wait: bool) -> Result<(), FsError> {
        self.handles.get(fh)?.set_lock(request, wait)
    }

    /// Directory listing including `.` and `..`.
    pub fn readdir(&self, ino: u64) -> Result<Vec<Listing>, FsError> {
        let dir = self.directory(ino)?;
        let parent_ino = if ino == ROOT_INO {
            ROOT_INO
        } else {
            let parent = self.cx.store.lstat(parent_of(dir.path()))?;
            self.nodes.read().kernel_ino(parent.ino)
        };

        let mut listing = vec![
            Listing { ino, kind: FileKind::Directory, name: ".".to_string() },
            Listing { ino: parent_ino, kind: FileKind::Directory, name: "..".to_string() },
        ];
        let nodes = self.nodes.read();
        listing.extend(dir.read_dir(&self.cx)?.into_iter().map(|entry| Listing {
            ino: nodes.kernel_ino(entry.attr.ino),
            kind: entry.attr.kind(),
            name: entry.name,
        }));
        debug!(path = %dir.path(), entries = listing.len(), "Listed directory");
        Ok(listing)
    }

    pub fn statfs(&self) -> Result<StoreStats, FsError> {
        self.cx.store.statfs()
    }

    pub fn access(&self, ino: u64, mask: i32) -> Result<(), FsError> {
        let (node, _) = self.node_of(ino)?;
        node.access(&self.cx, mask)
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }
}

fn utf8(name: &OsStr) -> Result<&str, FsError> {
    name.to_str()
        .ok_or_else(|| FsError::InvalidArgument(String::from_utf8_lossy(name.as_bytes()).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::mirror::{DiscardSink, Mutation};
    use parking_lot::Mutex;
    use std::ffi::OsString;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Mutation>>);

    impl MutationSink for Recorder {
        fn committed(&self, mutation: Mutation, _mode: u32) {
            self.0.lock().push(mutation);
        }
    }

    #[derive(Default)]
    struct Invalidations(Mutex<Vec<(u64, String)>>);

    impl KernelNotifier for Invalidations {
        fn invalidate_entry(&self, parent: u64, name: &str) {
            self.0.lock().push((parent, name.to_string()));
        }
    }

    fn mount() -> (TempDir, LoopbackFs) {
        let dir = TempDir::new().unwrap();
        let fs = LoopbackFs::new(BackingStore::new(dir.path()), Arc::new(DiscardSink)).unwrap();
        (dir, fs)
    }

    fn name(s: &str) -> OsString {
        OsString::from(s)
    }

    #[test]
    fn test_create_write_then_getattr_reports_size() {
        let (_dir, fs) = mount();
        let (entry, fh) = fs.create(ROOT_INO, &name("a.txt"), 0o644, 0o022, libc::O_RDWR).unwrap();
        fs.write(fh, 0, b"hello world").unwrap();
        fs.release(fh);

        let attr = fs.getattr(entry.ino, None).unwrap();
        assert_eq!(attr.size, 11);
        assert_eq!(attr.permissions(), 0o644);
        assert_eq!(fs.open_handles(), 0);
    }

    #[test]
    fn test_sparse_write_reads_zero_gap() {
        let (_dir, fs) = mount();
        let (entry, fh) = fs.create(ROOT_INO, &name("s"), 0o644, 0, libc::O_RDWR).unwrap();
        fs.write(fh, 0, b"12345").unwrap();
        fs.release(fh);

        let fh = fs.open(entry.ino, libc::O_RDWR).unwrap();
        fs.write(fh, 10, b"ABC").unwrap();
        assert_eq!(fs.read(fh, 0, 4096).unwrap(), b"12345\0\0\0\0\0ABC");
    }

    #[test]
    fn test_rename_across_directories_keeps_inode() {
        let (_dir, fs) = mount();
        let notifier = Arc::new(Invalidations::default());
        fs.set_notifier(notifier.clone());

        let a = fs.mkdir(ROOT_INO, &name("a"), 0o755, 0).unwrap();
        let b = fs.mkdir(ROOT_INO, &name("b"), 0o755, 0).unwrap();
        let (file, fh) = fs.create(a.ino, &name("f"), 0o644, 0, libc::O_RDWR).unwrap();

        fs.rename(a.ino, &name("f"), b.ino, &name("g"), 0).unwrap();

        assert!(fs.lookup(a.ino, &name("f")).unwrap_err().is_not_found());
        let moved = fs.lookup(b.ino, &name("g")).unwrap();
        assert_eq!(moved.ino, file.ino);
        assert_eq!(fs.getattr(file.ino, None).unwrap().ino, file.ino);
        assert_eq!(fs.handles.get(fh).unwrap().path(), "/b/g");
        assert_eq!(
            *notifier.0.lock(),
            vec![(a.ino, "f".to_string()), (b.ino, "g".to_string())]
        );
    }

    #[test]
    fn test_rename_directory_rewrites_descendants() {
        let (_dir, fs) = mount();
        let docs = fs.mkdir(ROOT_INO, &name("docs"), 0o755, 0).unwrap();
        let (inner, fh) = fs.create(docs.ino, &name("a"), 0o644, 0, libc::O_RDWR).unwrap();
        fs.release(fh);

        fs.rename(ROOT_INO, &name("docs"), ROOT_INO, &name("archive"), 0).unwrap();
        // The kernel still holds the old inode of the child; it must resolve.
        assert!(fs.getattr(inner.ino, None).is_ok());
    }

    #[test]
    fn test_unlink_and_rmdir_policies() {
        let (_dir, fs) = mount();
        let d = fs.mkdir(ROOT_INO, &name("d"), 0o755, 0).unwrap();
        let (_, fh) = fs.create(d.ino, &name("f"), 0o644, 0, libc::O_RDWR).unwrap();
        fs.release(fh);

        assert_eq!(fs.rmdir(ROOT_INO, &name("d")).unwrap_err().errno(), libc::ENOTEMPTY);
        fs.unlink(d.ino, &name("f")).unwrap();
        assert!(fs.unlink(d.ino, &name("f")).unwrap_err().is_not_found());
        fs.rmdir(ROOT_INO, &name("d")).unwrap();
    }

    #[test]
    fn test_readdir_lists_dot_entries_and_children() {
        let (_dir, fs) = mount();
        let sub = fs.mkdir(ROOT_INO, &name("sub"), 0o755, 0).unwrap();
        fs.symlink(sub.ino, &name("ln"), &name("target")).unwrap();

        let rows = fs.readdir(sub.ino).unwrap();
        let names: Vec<_> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "ln"]);
        assert_eq!(rows[1].ino, ROOT_INO);
        assert_eq!(rows[2].kind, FileKind::Symlink);
    }

    #[test]
    fn test_wrong_kind_operations() {
        let (_dir, fs) = mount();
        let (file, fh) = fs.create(ROOT_INO, &name("f"), 0o644, 0, libc::O_RDWR).unwrap();
        fs.release(fh);
        assert_eq!(fs.readdir(file.ino).unwrap_err().errno(), libc::ENOTDIR);
        assert_eq!(fs.open(ROOT_INO, libc::O_RDONLY).unwrap_err().errno(), libc::EISDIR);
        assert_eq!(fs.readlink(file.ino).unwrap_err().errno(), libc::EINVAL);
    }

    #[test]
    fn test_forgotten_inode_is_not_found() {
        let (_dir, fs) = mount();
        let d = fs.mkdir(ROOT_INO, &name("d"), 0o755, 0).unwrap();
        fs.forget(d.ino, 1);
        assert!(fs.getattr(d.ino, None).unwrap_err().is_not_found());
        assert!(fs.getattr(ROOT_INO, None).is_ok());
    }

    #[test]
    fn test_mutations_reach_the_sink_after_commit() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let fs = LoopbackFs::new(BackingStore::new(dir.path()), recorder.clone()).unwrap();

        let x = fs.mkdir(ROOT_INO, &name("X"), 0o755, 0).unwrap();
        let (_, fh) = fs.create(x.ino, &name("f.txt"), 0o644, 0, libc::O_WRONLY).unwrap();
        fs.write(fh, 0, b"hi").unwrap();
        fs.release(fh);
        assert!(fs.mkdir(ROOT_INO, &name("X"), 0o755, 0).is_err());

        let recorded = recorder.0.lock();
        assert_eq!(recorded.len(), 3);
        assert!(matches!(&recorded[0], Mutation::Mkdir { path, .. } if path == "/X"));
        assert!(matches!(&recorded[1], Mutation::Create { path, .. } if path == "/X/f.txt"));
        assert!(matches!(&recorded[2], Mutation::Write { path, offset: 0, .. } if path == "/X/f.txt"));
    }

    #[test]
    fn test_hard_link_shares_inode() {
        let (_dir, fs) = mount();
        let (file, fh) = fs.create(ROOT_INO, &name("a"), 0o644, 0, libc::O_RDWR).unwrap();
        fs.release(fh);
        let linked = fs.link(file.ino, ROOT_INO, &name("b")).unwrap();
        assert_eq!(linked.ino, file.ino);
        assert_eq!(linked.attr.nlink, 2);
    }
}
