// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! FUSE adapter
//!
//! Translates kernel requests into [`LoopbackFs`] calls and their results
//! into `fuser` replies. Every error is answered with its errno; nothing here
//! decides filesystem semantics.
//!
//! The session loop dispatches one request at a time, so nothing that can
//! wait on the network or on another request runs on it:
//! - reads (which may refresh stale content from the server first) finish on
//!   a small pool of I/O threads
//! - a lock request that sleeps until granted gets a thread of its own, so
//!   the unlock that will wake it can still be dispatched
//!
//! Entry invalidations are pushed to a dedicated thread. Notifying the
//! kernel from inside a request handler (rename in particular) can deadlock
//! the session loop, which is waiting on the same request.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use fuser::{
    BackgroundSession, FileAttr, FileType, Filesystem, KernelConfig, MountOption, Notifier, ReplyAttr,
    ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyLock, ReplyLseek, ReplyOpen,
    ReplyStatfs, ReplyWrite, Request, Session, TimeOrNow,
};
use tracing::{debug, info, warn};

use crate::application::file_handle::LockRequest;
use crate::application::loopback::{KernelNotifier, LoopbackFs, NoopNotifier};
use crate::domain::attributes::{FileAttributes, FileKind, SetAttributes, TimeSpec};
use crate::domain::error::FsError;
use crate::infrastructure::backing_store::StoreStats;

/// How long the kernel may cache entries and attributes.
const ATTR_TTL: Duration = Duration::from_secs(1);

const GENERATION: u64 = 0;

const IO_THREADS: usize = 4;

type Job = Box<dyn FnOnce() + Send>;

/// Worker threads that complete requests off the session loop. They exit
/// once the owning [`MountedFs`] is dropped.
struct IoPool {
    tx: flume::Sender<Job>,
}

impl IoPool {
    fn start(threads: usize) -> std::io::Result<Self> {
        let (tx, rx) = flume::unbounded::<Job>();
        for i in 0..threads {
            let rx = rx.clone();
            std::thread::Builder::new()
                .name(format!("mirrorfs-io-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })?;
        }
        Ok(Self { tx })
    }

    fn run(&self, job: impl FnOnce() + Send + 'static) {
        if let Err(flume::SendError(job)) = self.tx.send(Box::new(job)) {
            job();
        }
    }
}

pub struct MountedFs {
    fs: Arc<LoopbackFs>,
    io: IoPool,
}

impl MountedFs {
    pub fn new(fs: Arc<LoopbackFs>) -> std::io::Result<Self> {
        Ok(Self {
            fs,
            io: IoPool::start(IO_THREADS)?,
        })
    }

    /// Read on an I/O thread and hand the result to `done` there.
    fn dispatch_read<F>(&self, fh: u64, offset: u64, size: u32, done: F)
    where
        F: FnOnce(Result<Vec<u8>, FsError>) + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        self.io.run(move || done(fs.read(fh, offset, size)));
    }

    /// Non-waiting lock calls complete inline. A waiting one blocks its own
    /// thread until the lock is granted.
    fn dispatch_setlk<F>(&self, fh: u64, request: LockRequest, sleep: bool, done: F)
    where
        F: FnOnce(Result<(), FsError>) + Send + 'static,
    {
        if !sleep {
            return done(self.fs.setlk(fh, &request, false));
        }
        let fs = Arc::clone(&self.fs);
        let waiter = std::thread::Builder::new()
            .name("mirrorfs-lock".to_string())
            .spawn(move || done(fs.setlk(fh, &request, true)));
        if let Err(e) = waiter {
            // The dropped reply answers the kernel with EIO
            warn!(fh, error = %e, "Failed to start lock waiter");
        }
    }
}

fn file_type(kind: FileKind, mode: u32) -> FileType {
    match kind {
        FileKind::File => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::Other => match mode & libc::S_IFMT {
            libc::S_IFCHR => FileType::CharDevice,
            libc::S_IFBLK => FileType::BlockDevice,
            libc::S_IFIFO => FileType::NamedPipe,
            libc::S_IFSOCK => FileType::Socket,
            _ => FileType::RegularFile,
        },
    }
}

fn to_fuse_attr(attr: &FileAttributes) -> FileAttr {
    FileAttr {
        ino: attr.ino,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime.to_system_time(),
        mtime: attr.mtime.to_system_time(),
        ctime: attr.ctime.to_system_time(),
        crtime: attr.ctime.to_system_time(),
        kind: file_type(attr.kind(), attr.mode),
        perm: attr.permissions(),
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn time_spec(time: TimeOrNow) -> TimeSpec {
    match time {
        TimeOrNow::Now => TimeSpec::Now,
        TimeOrNow::SpecificTime(at) => TimeSpec::At(at.into()),
    }
}

fn lock_request(typ: i32, start: u64, end: u64, pid: u32) -> LockRequest {
    LockRequest { typ, start, end, pid }
}

/// Kernel offsets are signed; anything negative is a caller bug.
fn offset(offset: i64) -> Result<u64, i32> {
    u64::try_from(offset).map_err(|_| libc::EINVAL)
}

impl Filesystem for MountedFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        info!(root = %self.fs.store().root().display(), "Filesystem mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        info!(open_handles = self.fs.open_handles(), "Filesystem unmounted");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.fs.lookup(parent, name) {
            Ok(entry) => reply.entry(&ATTR_TTL, &to_fuse_attr(&entry.attr), GENERATION),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.fs.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        match self.fs.getattr(ino, fh) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_fuse_attr(&attr)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttributes {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(time_spec),
            mtime: mtime.map(time_spec),
        };
        match self.fs.setattr(ino, fh, &changes) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_fuse_attr(&attr)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.fs.readlink(ino) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, umask: u32, reply: ReplyEntry) {
        match self.fs.mkdir(parent, name, mode, umask) {
            Ok(entry) => reply.entry(&ATTR_TTL, &to_fuse_attr(&entry.attr), GENERATION),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.fs.unlink(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.fs.rmdir(parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(&mut self, _req: &Request<'_>, parent: u64, link_name: &OsStr, target: &Path, reply: ReplyEntry) {
        match self.fs.symlink(parent, link_name, target.as_os_str()) {
            Ok(entry) => reply.entry(&ATTR_TTL, &to_fuse_attr(&entry.attr), GENERATION),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        match self.fs.rename(parent, name, newparent, newname, flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn link(&mut self, _req: &Request<'_>, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        match self.fs.link(ino, newparent, newname) {
            Ok(entry) => reply.entry(&ATTR_TTL, &to_fuse_attr(&entry.attr), GENERATION),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.fs.open(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset_: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let offset = match offset(offset_) {
            Ok(offset) => offset,
            Err(errno) => return reply.error(errno),
        };
        self.dispatch_read(fh, offset, size, move |result| match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset_: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let offset = match offset(offset_) {
            Ok(offset) => offset,
            Err(errno) => return reply.error(errno),
        };
        match self.fs.write(fh, offset, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.fs.flush(fh) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.fs.release(fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.fs.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let listing = match self.fs.readdir(ino) {
            Ok(listing) => listing,
            Err(e) => return reply.error(e.errno()),
        };
        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, row) in listing.iter().enumerate().skip(skip) {
            let kind = file_type(row.kind, 0);
            // Offset is the cookie of the next entry
            if reply.add(row.ino, (i + 1) as i64, kind, &row.name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.fs.statfs() {
            Ok(stats) => {
                let StoreStats {
                    blocks,
                    blocks_free,
                    blocks_available,
                    files,
                    files_free,
                    block_size,
                    name_max,
                    fragment_size,
                } = stats;
                reply.statfs(
                    blocks,
                    blocks_free,
                    blocks_available,
                    files,
                    files_free,
                    block_size,
                    name_max,
                    fragment_size,
                )
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.fs.access(ino, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        match self.fs.create(parent, name, mode, umask, flags) {
            Ok((entry, fh)) => reply.created(&ATTR_TTL, &to_fuse_attr(&entry.attr), GENERATION, fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        match self.fs.getlk(fh, &lock_request(typ, start, end, pid)) {
            Ok(lock) => reply.locked(lock.start, lock.end, lock.typ, lock.pid),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        self.dispatch_setlk(fh, lock_request(typ, start, end, pid), sleep, move |result| match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        });
    }

    fn lseek(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, offset: i64, whence: i32, reply: ReplyLseek) {
        match self.fs.lseek(fh, offset, whence) {
            Ok(position) => reply.offset(position),
            Err(e) => reply.error(e.errno()),
        }
    }
}

/// Queues invalidations for the notifier thread.
pub struct ChannelNotifier {
    tx: flume::Sender<(u64, String)>,
}

impl KernelNotifier for ChannelNotifier {
    fn invalidate_entry(&self, parent: u64, name: &str) {
        if self.tx.send((parent, name.to_string())).is_err() {
            debug!(parent, name, "Notifier thread gone, invalidation dropped");
        }
    }
}

fn spawn_notifier(notifier: Notifier) -> std::io::Result<(ChannelNotifier, JoinHandle<()>)> {
    let (tx, rx) = flume::unbounded::<(u64, String)>();
    let thread = std::thread::Builder::new()
        .name("mirrorfs-notify".to_string())
        .spawn(move || {
            while let Ok((parent, name)) = rx.recv() {
                // ENOENT just means the kernel had nothing cached
                if let Err(e) = notifier.inval_entry(parent, OsStr::new(&name)) {
                    debug!(parent, name = %name, error = %e, "Entry invalidation skipped");
                }
            }
        })?;
    Ok((ChannelNotifier { tx }, thread))
}

/// A live mount. Dropping it without [`MountHandle::unmount`] still
/// unmounts, but does not wait for the notifier thread.
pub struct MountHandle {
    fs: Arc<LoopbackFs>,
    session: Option<BackgroundSession>,
    notifier: Option<JoinHandle<()>>,
}

impl MountHandle {
    pub fn unmount(mut self) {
        if let Some(session) = self.session.take() {
            session.join();
        }
        // Releases the last sender so the notifier thread exits
        self.fs.set_notifier(Arc::new(NoopNotifier));
        if let Some(thread) = self.notifier.take() {
            if thread.join().is_err() {
                warn!("Notifier thread panicked");
            }
        }
        info!("Unmounted");
    }
}

/// Mount `fs` at `mount_point` and serve it from a background thread.
pub fn mount(fs: Arc<LoopbackFs>, mount_point: &Path, fs_name: &str) -> Result<MountHandle> {
    let options = [
        MountOption::FSName(fs_name.to_string()),
        MountOption::DefaultPermissions,
        MountOption::RW,
    ];
    let mounted = MountedFs::new(Arc::clone(&fs)).context("failed to start I/O threads")?;
    let mut session = Session::new(mounted, mount_point, &options)
        .with_context(|| format!("failed to mount {}", mount_point.display()))?;

    let (notifier, thread) = spawn_notifier(session.notifier()).context("failed to start notifier thread")?;
    fs.set_notifier(Arc::new(notifier));

    let session = session.spawn().context("failed to start FUSE session")?;
    info!(mount_point = %mount_point.display(), "Mounted");
    Ok(MountHandle {
        fs,
        session: Some(session),
        notifier: Some(thread),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::file_handle::{ReadHook, OFFSET_MAX};
    use crate::application::mirror::DiscardSink;
    use crate::application::node_table::ROOT_INO;
    use crate::domain::attributes::Timestamp;
    use crate::infrastructure::backing_store::BackingStore;
    use tempfile::TempDir;

    fn mounted(dir: &TempDir, hook: Option<Arc<dyn ReadHook>>) -> MountedFs {
        let mut fs = LoopbackFs::new(BackingStore::new(dir.path()), Arc::new(DiscardSink)).unwrap();
        if let Some(hook) = hook {
            fs = fs.with_read_hook(hook);
        }
        MountedFs::new(Arc::new(fs)).unwrap()
    }

    /// Holds every read until released.
    struct Gate(flume::Receiver<()>);

    impl ReadHook for Gate {
        fn before_read(&self, _path: &str) {
            let _ = self.0.recv_timeout(Duration::from_secs(5));
        }
    }

    fn attr(mode: u32) -> FileAttributes {
        FileAttributes {
            ino: 7,
            size: 13,
            blocks: 8,
            atime: Timestamp::new(10, 0),
            mtime: Timestamp::new(20, 0),
            ctime: Timestamp::new(30, 0),
            mode,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            blksize: 4096,
        }
    }

    #[test]
    fn test_attributes_map_to_kernel_form() {
        let fuse = to_fuse_attr(&attr(libc::S_IFREG | 0o4755));
        assert_eq!(fuse.ino, 7);
        assert_eq!(fuse.kind, FileType::RegularFile);
        assert_eq!(fuse.perm, 0o4755);
        assert_eq!(fuse.mtime, Timestamp::new(20, 0).to_system_time());

        assert_eq!(to_fuse_attr(&attr(libc::S_IFDIR | 0o755)).kind, FileType::Directory);
        assert_eq!(to_fuse_attr(&attr(libc::S_IFLNK | 0o777)).kind, FileType::Symlink);
        assert_eq!(to_fuse_attr(&attr(libc::S_IFIFO | 0o644)).kind, FileType::NamedPipe);
    }

    #[test]
    fn test_time_or_now_maps_to_time_spec() {
        assert_eq!(time_spec(TimeOrNow::Now), TimeSpec::Now);
        let at = Timestamp::new(1_700_000_000, 0);
        assert_eq!(time_spec(TimeOrNow::SpecificTime(at.to_system_time())), TimeSpec::At(at));
    }

    #[test]
    fn test_negative_offsets_are_rejected() {
        assert_eq!(offset(-1), Err(libc::EINVAL));
        assert_eq!(offset(13), Ok(13));
    }

    #[test]
    fn test_waiting_lock_does_not_stall_the_unlock() {
        let dir = TempDir::new().unwrap();
        let mounted = mounted(&dir, None);
        let (entry, holder) = mounted.fs.create(ROOT_INO, OsStr::new("f"), 0o644, 0, libc::O_RDWR).unwrap();
        let waiter = mounted.fs.open(entry.attr.ino, libc::O_RDWR).unwrap();

        let write = lock_request(libc::F_WRLCK, 0, OFFSET_MAX, 0);
        mounted.fs.setlk(holder, &write, false).unwrap();

        // Both requests arrive on the same thread, in this order
        let (granted_tx, granted) = flume::unbounded();
        mounted.dispatch_setlk(waiter, write, true, move |result| {
            let _ = granted_tx.send(result);
        });
        let (unlocked_tx, unlocked) = flume::unbounded();
        mounted.dispatch_setlk(holder, LockRequest { typ: libc::F_UNLCK, ..write }, false, move |result| {
            let _ = unlocked_tx.send(result);
        });

        unlocked.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        granted.recv_timeout(Duration::from_secs(3)).unwrap().unwrap();
    }

    #[test]
    fn test_slow_read_does_not_block_other_requests() {
        let dir = TempDir::new().unwrap();
        let (release, gate) = flume::unbounded();
        let mounted = mounted(&dir, Some(Arc::new(Gate(gate))));
        let (_, fh) = mounted.fs.create(ROOT_INO, OsStr::new("f"), 0o644, 0, libc::O_RDWR).unwrap();
        mounted.fs.write(fh, 0, b"hi").unwrap();

        let (read_tx, read) = flume::unbounded();
        mounted.dispatch_read(fh, 0, 2, move |result| {
            let _ = read_tx.send(result);
        });

        let (lock_tx, locked) = flume::unbounded();
        mounted.dispatch_setlk(fh, lock_request(libc::F_RDLCK, 0, 1, 0), false, move |result| {
            let _ = lock_tx.send(result);
        });
        locked.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert!(read.try_recv().is_err());

        release.send(()).unwrap();
        assert_eq!(read.recv_timeout(Duration::from_secs(2)).unwrap().unwrap(), b"hi");
    }

    #[test]
    fn test_channel_notifier_reports_a_closed_channel_quietly() {
        let (tx, rx) = flume::unbounded();
        let notifier = ChannelNotifier { tx };
        notifier.invalidate_entry(1, "a");
        assert_eq!(rx.try_recv().unwrap(), (1, "a".to_string()));
        drop(rx);
        notifier.invalidate_entry(1, "b");
    }
}
