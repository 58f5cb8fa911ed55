// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Open file handles
//!
//! A [`FileHandle`] owns one backing descriptor plus the root-relative path it
//! was opened under. The descriptor and path sit behind a single lock because
//! the mount layer may deliver read, write, setattr and release concurrently
//! for the same handle. The path follows renames so mirrored writes land on
//! the right remote file.
//!
//! `flush` only duplicates and closes the descriptor. It does not fsync; the
//! durability of the two copies is deliberately left to `fsync` and to the
//! next differential pull.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::application::mirror::{Mutation, MutationSink};
use crate::domain::attributes::{FileAttributes, SetAttributes, TimeSpec};
use crate::domain::error::FsError;
use crate::domain::path_sanitizer::strip_ancestor;

/// Largest lock offset the kernel sends; means "to end of file".
pub const OFFSET_MAX: u64 = i64::MAX as u64;

/// Called before every read so the handle can refresh stale content.
pub trait ReadHook: Send + Sync {
    fn before_read(&self, path: &str);
}

/// A byte-range lock as exchanged with the mount layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRequest {
    /// `F_RDLCK`, `F_WRLCK` or `F_UNLCK`
    pub typ: i32,
    pub start: u64,
    /// Inclusive; [`OFFSET_MAX`] for "to end of file"
    pub end: u64,
    pub pid: u32,
}

struct HandleState {
    file: Option<File>,
    path: String,
}

pub struct FileHandle {
    state: Mutex<HandleState>,
    sink: Arc<dyn MutationSink>,
    read_hook: Option<Arc<dyn ReadHook>>,
}

impl FileHandle {
    pub fn new(
        file: File,
        path: impl Into<String>,
        sink: Arc<dyn MutationSink>,
        read_hook: Option<Arc<dyn ReadHook>>,
    ) -> Self {
        Self {
            state: Mutex::new(HandleState {
                file: Some(file),
                path: path.into(),
            }),
            sink,
            read_hook,
        }
    }

    pub fn path(&self) -> String {
        self.state.lock().path.clone()
    }

    fn with_file<T>(&self, op: impl FnOnce(&File, &str) -> io::Result<T>) -> Result<T, FsError> {
        let state = self.state.lock();
        let file = state.file.as_ref().ok_or(FsError::Os(libc::EBADF))?;
        op(file, &state.path).map_err(|e| FsError::from_io(e, state.path.as_str()))
    }

    pub fn read(&self, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        if let Some(hook) = &self.read_hook {
            hook.before_read(&self.path());
        }
        self.with_file(|file, _| {
            let mut buf = vec![0u8; size as usize];
            let mut filled = 0;
            while filled < buf.len() {
                match file.read_at(&mut buf[filled..], offset + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            buf.truncate(filled);
            Ok(buf)
        })
    }

    /// Write locally, then hand the same bytes and offset to the sink.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        let (path, mode) = self.with_file(|file, path| {
            file.write_all_at(data, offset)?;
            let mode = std::os::unix::fs::MetadataExt::mode(&file.metadata()?);
            Ok((path.to_string(), mode))
        })?;
        self.sink.committed(
            Mutation::Write {
                path,
                offset,
                data: data.to_vec(),
            },
            mode,
        );
        Ok(data.len())
    }

    pub fn flush(&self) -> Result<(), FsError> {
        self.with_file(|file, _| file.try_clone().map(drop))
    }

    pub fn fsync(&self, datasync: bool) -> Result<(), FsError> {
        self.with_file(|file, _| if datasync { file.sync_data() } else { file.sync_all() })
    }

    /// Close the descriptor. Further calls fail with `EBADF`.
    pub fn release(&self) {
        let mut state = self.state.lock();
        if state.file.take().is_some() {
            debug!(path = %state.path, "Handle released");
        }
    }

    pub fn getattr(&self) -> Result<FileAttributes, FsError> {
        self.with_file(|file, _| file.metadata().map(|m| FileAttributes::from_metadata(&m)))
    }

    /// Apply `changes` through the descriptor.
    pub fn setattr(&self, changes: &SetAttributes) -> Result<FileAttributes, FsError> {
        let (path, attr) = self.with_file(|file, path| {
            if let Some(mode) = changes.mode {
                file.set_permissions(std::fs::Permissions::from_mode(mode & 0o7777))?;
            }
            if changes.uid.is_some() || changes.gid.is_some() {
                std::os::unix::fs::fchown(file, changes.uid, changes.gid)?;
            }
            if let Some(size) = changes.size {
                file.set_len(size)?;
            }
            if changes.atime.is_some() || changes.mtime.is_some() {
                futimens(file, changes.atime, changes.mtime)?;
            }
            let attr = FileAttributes::from_metadata(&file.metadata()?);
            Ok((path.to_string(), attr))
        })?;
        self.sink.committed(
            Mutation::SetAttr {
                path,
                changes: changes.clone(),
            },
            attr.mode,
        );
        Ok(attr)
    }

    /// `lseek(2)` on the backing descriptor, including `SEEK_DATA`/`SEEK_HOLE`.
    pub fn seek(&self, offset: i64, whence: i32) -> Result<i64, FsError> {
        self.with_file(|file, _| {
            // SAFETY: the descriptor is owned by `file` and stays open while
            // the state lock is held.
            let pos = unsafe { libc::lseek(file.as_raw_fd(), offset as libc::off_t, whence) };
            if pos < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(pos as i64)
        })
    }

    /// Report the first lock that would conflict with `request`, or
    /// `F_UNLCK` when it could be placed.
    pub fn get_lock(&self, request: &LockRequest) -> Result<LockRequest, FsError> {
        let file = self.duplicate()?;
        let mut lock = to_flock(request);
        fcntl_lock(&file, libc::F_OFD_GETLK, &mut lock).map_err(|e| FsError::from_io(e, self.path()))?;
        if i32::from(lock.l_type) == libc::F_UNLCK {
            return Ok(LockRequest {
                typ: libc::F_UNLCK,
                ..*request
            });
        }
        Ok(from_flock(&lock))
    }

    /// Place, or release with `F_UNLCK`, a byte-range lock on the backing
    /// file. With `wait` the call blocks until the lock is granted.
    pub fn set_lock(&self, request: &LockRequest, wait: bool) -> Result<(), FsError> {
        // Blocking lock calls run on a duplicate so they never hold the
        // handle lock; the duplicate shares the open file description.
        let file = self.duplicate()?;
        let mut lock = to_flock(request);
        let cmd = if wait { libc::F_OFD_SETLKW } else { libc::F_OFD_SETLK };
        fcntl_lock(&file, cmd, &mut lock).map_err(|e| FsError::from_io(e, self.path()))
    }

    fn duplicate(&self) -> Result<File, FsError> {
        self.with_file(|file, _| file.try_clone())
    }

    fn rename(&self, from: &str, to: &str) {
        let mut state = self.state.lock();
        if let Some(rest) = strip_ancestor(&state.path, from) {
            state.path = if rest == "/" {
                to.to_string()
            } else {
                format!("{}{}", to.trim_end_matches('/'), rest)
            };
        }
    }
}

fn to_flock(request: &LockRequest) -> libc::flock {
    // SAFETY: `flock` is a plain C struct; all-zero is a valid value.
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = request.typ as libc::c_short;
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    lock.l_start = request.start as libc::off_t;
    lock.l_len = if request.end >= OFFSET_MAX {
        0
    } else {
        (request.end - request.start + 1) as libc::off_t
    };
    // OFD locks require a zero pid
    lock.l_pid = 0;
    lock
}

fn from_flock(lock: &libc::flock) -> LockRequest {
    let start = lock.l_start as u64;
    let end = if lock.l_len == 0 {
        OFFSET_MAX
    } else {
        start + lock.l_len as u64 - 1
    };
    LockRequest {
        typ: i32::from(lock.l_type),
        start,
        end,
        pid: lock.l_pid.max(0) as u32,
    }
}

fn fcntl_lock(file: &File, cmd: libc::c_int, lock: &mut libc::flock) -> io::Result<()> {
    loop {
        // SAFETY: valid descriptor and a properly initialised `flock`.
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, lock as *mut libc::flock) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn to_timespec(time: Option<TimeSpec>) -> libc::timespec {
    match time {
        None => libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_OMIT },
        Some(TimeSpec::Now) => libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_NOW },
        Some(TimeSpec::At(ts)) => libc::timespec {
            tv_sec: ts.seconds as libc::time_t,
            tv_nsec: ts.nanos as libc::c_long,
        },
    }
}

fn futimens(file: &File, atime: Option<TimeSpec>, mtime: Option<TimeSpec>) -> io::Result<()> {
    let times = [to_timespec(atime), to_timespec(mtime)];
    // SAFETY: valid descriptor and exactly two timespec entries.
    let rc = unsafe { libc::futimens(file.as_raw_fd(), times.as_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Open handles keyed by the number handed to the kernel.
pub struct HandleTable {
    handles: RwLock<HashMap<u64, Arc<FileHandle>>>,
    next: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }

    pub fn insert(&self, handle: FileHandle) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        self.handles.write().insert(fh, Arc::new(handle));
        fh
    }

    pub fn get(&self, fh: u64) -> Result<Arc<FileHandle>, FsError> {
        self.handles
            .read()
            .get(&fh)
            .cloned()
            .ok_or(FsError::Os(libc::EBADF))
    }

    pub fn remove(&self, fh: u64) -> Option<Arc<FileHandle>> {
        self.handles.write().remove(&fh)
    }

    /// Re-point open handles after `from` moved to `to`.
    pub fn rename(&self, from: &str, to: &str) {
        for handle in self.handles.read().values() {
            handle.rename(from, to);
        }
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::mirror::DiscardSink;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Mutation>>);

    impl MutationSink for Recorder {
        fn committed(&self, mutation: Mutation, _mode: u32) {
            self.0.lock().push(mutation);
        }
    }

    #[derive(Default)]
    struct CountingHook(AtomicUsize);

    impl ReadHook for CountingHook {
        fn before_read(&self, _path: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn open(dir: &TempDir, name: &str, content: &[u8]) -> File {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        std::fs::OpenOptions::new().read(true).write(true).open(path).unwrap()
    }

    #[test]
    fn test_write_past_end_reads_back_zero_gap() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let handle = FileHandle::new(open(&dir, "f", b"12345"), "/f", recorder.clone(), None);

        assert_eq!(handle.write(10, b"ABC").unwrap(), 3);
        let data = handle.read(0, 64).unwrap();
        assert_eq!(data, b"12345\0\0\0\0\0ABC");

        assert_eq!(
            recorder.0.lock()[0],
            Mutation::Write { path: "/f".into(), offset: 10, data: b"ABC".to_vec() }
        );
    }

    #[test]
    fn test_read_runs_hook_first() {
        let dir = TempDir::new().unwrap();
        let hook = Arc::new(CountingHook::default());
        let handle = FileHandle::new(open(&dir, "f", b"hi"), "/f", Arc::new(DiscardSink), Some(hook.clone()));
        assert_eq!(handle.read(0, 2).unwrap(), b"hi");
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_released_handle_is_bad_descriptor() {
        let dir = TempDir::new().unwrap();
        let handle = FileHandle::new(open(&dir, "f", b"x"), "/f", Arc::new(DiscardSink), None);
        handle.release();
        assert_eq!(handle.read(0, 1).unwrap_err().errno(), libc::EBADF);
        assert!(handle.flush().is_err());
    }

    #[test]
    fn test_setattr_truncates_and_mirrors() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let handle = FileHandle::new(open(&dir, "f", b"0123456789"), "/f", recorder.clone(), None);
        let changes = SetAttributes { size: Some(3), ..Default::default() };
        assert_eq!(handle.setattr(&changes).unwrap().size, 3);
        assert!(matches!(recorder.0.lock()[0], Mutation::SetAttr { .. }));
    }

    #[test]
    fn test_range_lock_conflict_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"data").unwrap();
        let first = FileHandle::new(File::options().read(true).write(true).open(&path).unwrap(), "/f", Arc::new(DiscardSink), None);
        let second = FileHandle::new(File::options().read(true).write(true).open(&path).unwrap(), "/f", Arc::new(DiscardSink), None);

        let lock = LockRequest { typ: libc::F_WRLCK, start: 0, end: 9, pid: 0 };
        first.set_lock(&lock, false).unwrap();

        let conflict = second.get_lock(&lock).unwrap();
        assert_eq!(conflict.typ, libc::F_WRLCK);
        assert_eq!((conflict.start, conflict.end), (0, 9));
        assert!(second.set_lock(&lock, false).is_err());

        first.set_lock(&LockRequest { typ: libc::F_UNLCK, ..lock }, false).unwrap();
        assert_eq!(second.get_lock(&lock).unwrap().typ, libc::F_UNLCK);
    }

    #[test]
    fn test_waiting_lock_is_granted_after_unlock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"data").unwrap();
        let rw = || File::options().read(true).write(true).open(&path).unwrap();
        let first = FileHandle::new(rw(), "/f", Arc::new(DiscardSink), None);
        let second = Arc::new(FileHandle::new(rw(), "/f", Arc::new(DiscardSink), None));

        let whole = LockRequest { typ: libc::F_WRLCK, start: 0, end: OFFSET_MAX, pid: 0 };
        first.set_lock(&whole, false).unwrap();
        let waiter = std::thread::spawn({
            let second = second.clone();
            move || second.set_lock(&whole, true)
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!waiter.is_finished());

        first.set_lock(&LockRequest { typ: libc::F_UNLCK, ..whole }, false).unwrap();
        waiter.join().unwrap().unwrap();
        assert_eq!(first.get_lock(&whole).unwrap().typ, libc::F_WRLCK);
    }

    #[test]
    fn test_handle_table_follows_renames() {
        let dir = TempDir::new().unwrap();
        let table = HandleTable::new();
        let fh = table.insert(FileHandle::new(open(&dir, "f", b""), "/docs/f", Arc::new(DiscardSink), None));
        table.rename("/docs", "/archive");
        assert_eq!(table.get(fh).unwrap().path(), "/archive/f");
        assert!(table.remove(fh).is_some());
        assert!(table.get(fh).is_err());
    }
}
