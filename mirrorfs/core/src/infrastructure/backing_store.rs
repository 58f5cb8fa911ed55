// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Local Backing Store
//!
//! Thin, root-scoped wrapper around the host filesystem. Every operation takes
//! a root-relative path, joins it under the store's root through the
//! [`PathSanitizer`], and performs exactly one syscall-equivalent. Link counts,
//! sparse files and permission checks are left to the host filesystem.
//!
//! Confinement is enforced on the resolved filesystem, not just the path
//! text: the directory holding the final component must canonicalize to
//! somewhere under the root, and the final component itself is never
//! followed by a mutating call. Reads that follow it go through
//! [`BackingStore::ensure_contained`].
//!
//! The same store type backs the mount adapter on both node roles, the
//! server's mirror handlers (rooted at a user's `<org>/<dept>` directory) and
//! the client's remote observer.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::domain::attributes::{DirEntry, FileAttributes, SetAttributes, TimeSpec};
use crate::domain::error::FsError;
use crate::domain::path_sanitizer::{join_name, PathSanitizer};

/// Filesystem statistics as reported by `statvfs(3)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub block_size: u32,
    pub name_max: u32,
    pub fragment_size: u32,
}

#[derive(Debug, Clone)]
pub struct BackingStore {
    root: PathBuf,
    sanitizer: PathSanitizer,
}

impl BackingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sanitizer: PathSanitizer::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a root-relative path to the absolute backing path.
    ///
    /// Fails with `PermissionDenied` when a symlinked ancestor leads out of
    /// the root. The final component is not inspected.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, FsError> {
        let full = self.sanitizer.join_under(&self.root, path)?;
        if full != self.root {
            self.ensure_parent_contained(&full, path)?;
        }
        Ok(full)
    }

    fn canonical_root(&self) -> Result<PathBuf, FsError> {
        fs::canonicalize(&self.root).map_err(|e| FsError::from_io(e, "/"))
    }

    /// Check the nearest existing ancestor of `full`. Missing ancestors are
    /// only ever created as real directories below it.
    fn ensure_parent_contained(&self, full: &Path, path: &str) -> Result<(), FsError> {
        let existing = full
            .ancestors()
            .skip(1)
            .take_while(|dir| dir.starts_with(&self.root))
            .find(|dir| fs::symlink_metadata(dir).is_ok())
            .unwrap_or(self.root.as_path());
        let canonical = fs::canonicalize(existing).map_err(|e| FsError::from_io(e, path))?;
        if !canonical.starts_with(self.canonical_root()?) {
            tracing::warn!(path = %path, "Parent directory escapes the root");
            return Err(FsError::PermissionDenied(path.to_string()));
        }
        Ok(())
    }

    pub fn normalize(&self, path: &str) -> Result<String, FsError> {
        Ok(self.sanitizer.normalize(path)?)
    }

    /// Fail unless the fully resolved target of `path` (symlinks followed)
    /// still lies under the root.
    pub fn ensure_contained(&self, path: &str) -> Result<PathBuf, FsError> {
        let full = self.resolve(path)?;
        let canonical = fs::canonicalize(&full).map_err(|e| FsError::from_io(e, path))?;
        if !canonical.starts_with(self.canonical_root()?) {
            tracing::warn!(path = %path, "Resolved target escapes the root");
            return Err(FsError::PermissionDenied(path.to_string()));
        }
        Ok(full)
    }

    /// `lstat(2)`: symlinks are reported, not followed.
    pub fn lstat(&self, path: &str) -> Result<FileAttributes, FsError> {
        let full = self.resolve(path)?;
        let meta = fs::symlink_metadata(&full).map_err(|e| FsError::from_io(e, path))?;
        Ok(FileAttributes::from_metadata(&meta))
    }

    pub fn exists(&self, path: &str) -> Result<bool, FsError> {
        let full = self.resolve(path)?;
        match fs::symlink_metadata(&full) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FsError::from_io(e, path)),
        }
    }

    pub fn mkdir(&self, path: &str, mode: u32) -> Result<FileAttributes, FsError> {
        let full = self.resolve(path)?;
        fs::DirBuilder::new()
            .mode(mode & 0o7777)
            .create(&full)
            .map_err(|e| FsError::from_io(e, path))?;
        self.lstat(path)
    }

    /// `mkdir -p`. Existing directories are left alone.
    pub fn mkdir_all(&self, path: &str, mode: u32) -> Result<(), FsError> {
        let full = self.resolve(path)?;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(mode & 0o7777)
            .create(&full)
            .map_err(|e| FsError::from_io(e, path))
    }

    /// Create (or open, unless `O_EXCL` is set) a regular file. A symlink at
    /// `path` is refused with `ELOOP`.
    pub fn create(&self, path: &str, mode: u32, flags: i32) -> Result<File, FsError> {
        let full = self.resolve(path)?;
        open_options(flags | libc::O_CREAT | libc::O_NOFOLLOW)
            .mode(mode & 0o7777)
            .open(&full)
            .map_err(|e| FsError::from_io(e, path))
    }

    pub fn open(&self, path: &str, flags: i32) -> Result<File, FsError> {
        let full = self.resolve(path)?;
        open_options((flags & !libc::O_CREAT) | libc::O_NOFOLLOW)
            .open(&full)
            .map_err(|e| FsError::from_io(e, path))
    }

    pub fn remove_file(&self, path: &str) -> Result<(), FsError> {
        let full = self.resolve(path)?;
        fs::remove_file(&full).map_err(|e| FsError::from_io(e, path))
    }

    pub fn remove_dir(&self, path: &str) -> Result<(), FsError> {
        let full = self.resolve(path)?;
        fs::remove_dir(&full).map_err(|e| FsError::from_io(e, path))
    }

    /// Remove whatever `path` is, recursively for directories.
    pub fn remove_all(&self, path: &str) -> Result<(), FsError> {
        let full = self.resolve(path)?;
        if full == self.root {
            return Err(FsError::PermissionDenied(path.to_string()));
        }
        let meta = fs::symlink_metadata(&full).map_err(|e| FsError::from_io(e, path))?;
        let result = if meta.is_dir() {
            fs::remove_dir_all(&full)
        } else {
            fs::remove_file(&full)
        };
        result.map_err(|e| FsError::from_io(e, path))
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        fs::rename(&src, &dst).map_err(|e| FsError::from_io(e, from))
    }

    /// Create a symlink at `path` whose contents are `target`, stored verbatim.
    pub fn symlink(&self, target: &str, path: &str) -> Result<FileAttributes, FsError> {
        let full = self.resolve(path)?;
        std::os::unix::fs::symlink(target, &full).map_err(|e| FsError::from_io(e, path))?;
        self.lstat(path)
    }

    /// Hard-link the existing entry `existing` at `path`.
    pub fn link(&self, existing: &str, path: &str) -> Result<FileAttributes, FsError> {
        let src = self.resolve(existing)?;
        let dst = self.resolve(path)?;
        fs::hard_link(&src, &dst).map_err(|e| FsError::from_io(e, path))?;
        self.lstat(path)
    }

    pub fn read_link(&self, path: &str) -> Result<PathBuf, FsError> {
        let full = self.resolve(path)?;
        fs::read_link(&full).map_err(|e| FsError::from_io(e, path))
    }

    /// Read a whole file. Refuses targets that resolve outside the root.
    pub fn read_all(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let full = self.ensure_contained(path)?;
        fs::read(&full).map_err(|e| FsError::from_io(e, path))
    }

    /// `pwrite(2)` into an existing or newly created file.
    pub fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        let full = self.resolve(path)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .mode(0o644)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&full)
            .map_err(|e| FsError::from_io(e, path))?;
        file.write_all_at(data, offset)
            .map_err(|e| FsError::from_io(e, path))?;
        Ok(data.len())
    }

    /// List a directory (without `.` and `..`), attributes via `lstat`.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let normalized = self.normalize(path)?;
        let full = self.ensure_contained(&normalized)?;
        let mut entries = Vec::new();

        for entry in fs::read_dir(&full).map_err(|e| FsError::from_io(e, path))? {
            let entry = entry.map_err(|e| FsError::from_io(e, path))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                tracing::debug!(dir = %normalized, "Skipping entry with non UTF-8 name");
                continue;
            };
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                // Raced with a concurrent unlink
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(FsError::from_io(e, path)),
            };
            entries.push(DirEntry {
                path: join_name(&normalized, &name),
                name,
                attr: FileAttributes::from_metadata(&meta),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Apply the present sub-operations of `changes` by path.
    pub fn set_attributes(&self, path: &str, changes: &SetAttributes) -> Result<FileAttributes, FsError> {
        let full = self.resolve(path)?;

        if let Some(mode) = changes.mode {
            // Linux has no symlink permissions; chmod would follow the link
            let meta = fs::symlink_metadata(&full).map_err(|e| FsError::from_io(e, path))?;
            if meta.file_type().is_symlink() {
                return Err(FsError::Os(libc::EOPNOTSUPP));
            }
            fs::set_permissions(&full, fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| FsError::from_io(e, path))?;
        }

        if changes.uid.is_some() || changes.gid.is_some() {
            std::os::unix::fs::lchown(&full, changes.uid, changes.gid)
                .map_err(|e| FsError::from_io(e, path))?;
        }

        if let Some(size) = changes.size {
            let file = OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NOFOLLOW)
                .open(&full)
                .map_err(|e| FsError::from_io(e, path))?;
            file.set_len(size).map_err(|e| FsError::from_io(e, path))?;
        }

        if changes.atime.is_some() || changes.mtime.is_some() {
            set_times_nofollow(&full, changes.atime, changes.mtime)
                .map_err(|e| FsError::from_io(e, path))?;
        }

        self.lstat(path)
    }

    pub fn statfs(&self) -> Result<StoreStats, FsError> {
        let path = cstring(&self.root)?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: `path` is a valid NUL-terminated string and `stat` is a
        // properly sized out-parameter.
        let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(FsError::from_io(io::Error::last_os_error(), "/"));
        }
        Ok(StoreStats {
            blocks: stat.f_blocks as u64,
            blocks_free: stat.f_bfree as u64,
            blocks_available: stat.f_bavail as u64,
            files: stat.f_files as u64,
            files_free: stat.f_ffree as u64,
            block_size: stat.f_bsize as u32,
            name_max: stat.f_namemax as u32,
            fragment_size: stat.f_frsize as u32,
        })
    }

    /// `access(2)` against the backing path. The target must stay under the root.
    pub fn access(&self, path: &str, mask: i32) -> Result<(), FsError> {
        let full = cstring(&self.ensure_contained(path)?)?;
        // SAFETY: `full` is a valid NUL-terminated path.
        let rc = unsafe { libc::access(full.as_ptr(), mask) };
        if rc != 0 {
            return Err(FsError::from_io(io::Error::last_os_error(), path));
        }
        Ok(())
    }
}

/// Translate `open(2)` flags into `OpenOptions`.
pub fn open_options(flags: i32) -> OpenOptions {
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => options.write(true),
        libc::O_RDWR => options.read(true).write(true),
        _ => options.read(true),
    };
    if flags & libc::O_CREAT != 0 {
        if flags & libc::O_EXCL != 0 {
            options.create_new(true);
        } else {
            options.create(true);
        }
        if flags & libc::O_ACCMODE == libc::O_RDONLY {
            // create() requires write access
            options.write(true);
        }
    }
    if flags & libc::O_TRUNC != 0 && flags & libc::O_ACCMODE != libc::O_RDONLY {
        options.truncate(true);
    }
    if flags & libc::O_APPEND != 0 {
        options.append(true);
    }
    let passthrough = flags & (libc::O_NOFOLLOW | libc::O_SYNC | libc::O_DSYNC | libc::O_NOATIME);
    options.custom_flags(passthrough);
    options
}

fn cstring(path: &Path) -> Result<CString, FsError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| FsError::InvalidArgument(path.display().to_string()))
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

/// `utimensat(2)` with `AT_SYMLINK_NOFOLLOW`; absent times are omitted.
fn set_times_nofollow(path: &Path, atime: Option<TimeSpec>, mtime: Option<TimeSpec>) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let times = [to_timespec(atime), to_timespec(mtime)];
    // SAFETY: `c_path` is NUL-terminated and `times` holds exactly two entries.
    let rc = unsafe {
        libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), libc::AT_SYMLINK_NOFOLLOW)
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
