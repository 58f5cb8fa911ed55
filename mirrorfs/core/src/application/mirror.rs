// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Mutation fan-out
//!
//! Every mutating node operation reports what it committed to a
//! [`MutationSink`] once the local syscall has succeeded. The sink decides
//! what that means for the node's role:
//!
//! - client mount: [`RemoteMirror`] replays the mutation against the server
//!   on the background work queue, logging failures;
//! - server mount: [`PublishingSink`] publishes a [`FileEvent`].
//!
//! Sinks never block on the network and never report failure back to the
//! kernel-facing caller. When the mirror queue is full the mutation is dropped
//! with a warning, and a call that outlives its timeout is abandoned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::application::remote::RemoteFs;
use crate::application::work_queue::WorkQueue;
use crate::domain::attributes::SetAttributes;
use crate::domain::error::FsError;
use crate::domain::events::{EventPublisher, FileEvent};

/// A committed local mutation, with root-relative paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Mkdir { path: String, mode: u32 },
    Create { path: String, mode: u32, flags: i32 },
    Unlink { path: String },
    Rmdir { path: String },
    Rename { from: String, to: String },
    Symlink { target: String, path: String },
    Link { existing: String, path: String },
    Write { path: String, offset: u64, data: Vec<u8> },
    SetAttr { path: String, changes: SetAttributes },
}

impl Mutation {
    /// Paths whose remote copy this mutation changes.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Mutation::Rename { from, to } => vec![from.as_str(), to.as_str()],
            Mutation::Mkdir { path, .. }
            | Mutation::Create { path, .. }
            | Mutation::Unlink { path }
            | Mutation::Rmdir { path }
            | Mutation::Symlink { path, .. }
            | Mutation::Link { path, .. }
            | Mutation::Write { path, .. }
            | Mutation::SetAttr { path, .. } => vec![path.as_str()],
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Mutation::Mkdir { .. } => "mkdir",
            Mutation::Create { .. } => "create",
            Mutation::Unlink { .. } => "unlink",
            Mutation::Rmdir { .. } => "rmdir",
            Mutation::Rename { .. } => "rename",
            Mutation::Symlink { .. } => "symlink",
            Mutation::Link { .. } => "link",
            Mutation::Write { .. } => "write",
            Mutation::SetAttr { .. } => "setattr",
        }
    }

    /// The event a server publishes for this mutation. `mode` is the mode of
    /// the affected entry.
    pub fn to_event(&self, mode: u32) -> FileEvent {
        match self {
            Mutation::Mkdir { path, .. }
            | Mutation::Create { path, .. }
            | Mutation::Symlink { path, .. }
            | Mutation::Link { path, .. } => FileEvent::add(path.as_str(), mode),
            Mutation::Write { path, .. } | Mutation::SetAttr { path, .. } => {
                FileEvent::modify(path.as_str(), mode)
            }
            Mutation::Unlink { path } | Mutation::Rmdir { path } => {
                FileEvent::delete(path.as_str(), mode)
            }
            Mutation::Rename { from, to } => FileEvent::rename(from.as_str(), to.as_str(), mode),
        }
    }
}

pub trait MutationSink: Send + Sync {
    /// Called after `mutation` has committed locally.
    fn committed(&self, mutation: Mutation, mode: u32);
}

/// Sink for mounts that mirror nothing.
pub struct DiscardSink;

impl MutationSink for DiscardSink {
    fn committed(&self, mutation: Mutation, _mode: u32) {
        debug!(op = mutation.name(), "Mutation not mirrored");
    }
}

/// Server mount: committed mutations become file events.
pub struct PublishingSink {
    publisher: Arc<dyn EventPublisher>,
}

impl PublishingSink {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self { publisher }
    }
}

impl MutationSink for PublishingSink {
    fn committed(&self, mutation: Mutation, mode: u32) {
        self.publisher.publish(mutation.to_event(mode));
    }
}

/// Reference counts of mirror calls not yet completed, per path.
///
/// A path with outstanding calls has local content the server has not seen
/// yet, so it must not be overwritten by a download.
#[derive(Debug, Default)]
pub struct PendingMirrors {
    paths: Mutex<HashMap<String, usize>>,
}

impl PendingMirrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, path: &str) {
        *self.paths.lock().entry(path.to_string()).or_insert(0) += 1;
    }

    pub fn finish(&self, path: &str) {
        let mut paths = self.paths.lock();
        if let Some(count) = paths.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                paths.remove(path);
            }
        }
    }

    pub fn is_pending(&self, path: &str) -> bool {
        self.paths.lock().contains_key(path)
    }

    pub fn is_empty(&self) -> bool {
        self.paths.lock().is_empty()
    }
}

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Client mount: replay mutations on the server in the background.
pub struct RemoteMirror {
    remote: Arc<dyn RemoteFs>,
    queue: Arc<WorkQueue>,
    pending: Arc<PendingMirrors>,
    call_timeout: Duration,
}

impl RemoteMirror {
    pub fn new(remote: Arc<dyn RemoteFs>, queue: Arc<WorkQueue>, pending: Arc<PendingMirrors>) -> Self {
        Self {
            remote,
            queue,
            pending,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn pending(&self) -> Arc<PendingMirrors> {
        self.pending.clone()
    }
}

impl MutationSink for RemoteMirror {
    fn committed(&self, mutation: Mutation, _mode: u32) {
        let paths: Vec<String> = mutation.paths().into_iter().map(str::to_string).collect();
        for path in &paths {
            self.pending.begin(path);
        }

        let remote = self.remote.clone();
        let pending = self.pending.clone();
        let job_paths = paths.clone();
        let call_timeout = self.call_timeout;
        let job = Box::pin(async move {
            let op = mutation.name();
            match tokio::time::timeout(call_timeout, replay(remote.as_ref(), mutation)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(op, paths = ?job_paths, error = %e, "Mirror call failed"),
                Err(_) => warn!(
                    op,
                    paths = ?job_paths,
                    timeout_secs = call_timeout.as_secs_f64(),
                    "Mirror call timed out"
                ),
            }
            for path in &job_paths {
                pending.finish(path);
            }
        });

        // Callers are kernel request threads; waiting for a slot would stall the mount.
        if let Err(e) = self.queue.try_submit(job) {
            warn!(paths = ?paths, error = %e, "Mirror call dropped");
            for path in &paths {
                self.pending.finish(path);
            }
        }
    }
}

/// Issue the RPC equivalent of `mutation`.
pub async fn replay(remote: &dyn RemoteFs, mutation: Mutation) -> Result<(), FsError> {
    match mutation {
        Mutation::Mkdir { path, mode } => remote.mkdir(&path, mode).await.map(drop),
        Mutation::Create { path, mode, flags } => remote.create(&path, mode, flags).await.map(drop),
        Mutation::Unlink { path } => remote.unlink(&path).await,
        Mutation::Rmdir { path } => remote.rmdir(&path).await,
        Mutation::Rename { from, to } => remote.rename(&from, &to).await,
        Mutation::Symlink { target, path } => remote.symlink(&target, &path).await.map(drop),
        Mutation::Link { existing, path } => remote.link(&existing, &path).await.map(drop),
        Mutation::Write { path, offset, data } => remote.write(&path, offset, &data).await.map(drop),
        Mutation::SetAttr { path, changes } => {
            let changes = changes.mirrored();
            if changes.is_empty() {
                return Ok(());
            }
            remote.setattr(&path, &changes).await.map(drop)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::remote::{ChunkStream, EventStream};
    use crate::domain::attributes::{DirEntry, FileAttributes};
    use crate::domain::events::FileEventKind;
    use async_trait::async_trait;
    use std::time::Instant;

    struct Recorder(Mutex<Vec<FileEvent>>);

    impl EventPublisher for Recorder {
        fn publish(&self, event: FileEvent) {
            self.0.lock().push(event);
        }
    }

    #[test]
    fn test_publishing_sink_maps_mutations_to_events() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let sink = PublishingSink::new(recorder.clone());

        sink.committed(Mutation::Mkdir { path: "/X".into(), mode: 0o755 }, libc::S_IFDIR | 0o755);
        sink.committed(
            Mutation::Write { path: "/X/f.txt".into(), offset: 0, data: b"hi".to_vec() },
            libc::S_IFREG | 0o644,
        );
        sink.committed(
            Mutation::Rename { from: "/X/f.txt".into(), to: "/X/g.txt".into() },
            libc::S_IFREG | 0o644,
        );
        sink.committed(Mutation::Rmdir { path: "/Y".into() }, libc::S_IFDIR | 0o755);

        let kinds: Vec<_> = recorder.0.lock().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                FileEventKind::Add,
                FileEventKind::Modify,
                FileEventKind::Rename,
                FileEventKind::Delete
            ]
        );
        assert_eq!(recorder.0.lock()[2].new_path.as_deref(), Some("/X/g.txt"));
    }

    #[test]
    fn test_pending_mirrors_are_reference_counted() {
        let pending = PendingMirrors::new();
        pending.begin("/a");
        pending.begin("/a");
        pending.finish("/a");
        assert!(pending.is_pending("/a"));
        pending.finish("/a");
        assert!(!pending.is_pending("/a"));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_rename_touches_both_paths() {
        let mutation = Mutation::Rename { from: "/a".into(), to: "/b".into() };
        assert_eq!(mutation.paths(), vec!["/a", "/b"]);
    }

    /// A server that accepted the connection and never answers.
    struct Stalled;

    #[async_trait]
    impl RemoteFs for Stalled {
        async fn lookup(&self, _: &str, _: &str) -> Result<DirEntry, FsError> {
            std::future::pending().await
        }
        async fn getattr(&self, _: &str) -> Result<FileAttributes, FsError> {
            std::future::pending().await
        }
        async fn read_dir_all(&self, _: &str) -> Result<Vec<DirEntry>, FsError> {
            std::future::pending().await
        }
        async fn mkdir(&self, _: &str, _: u32) -> Result<DirEntry, FsError> {
            std::future::pending().await
        }
        async fn rmdir(&self, _: &str) -> Result<(), FsError> {
            std::future::pending().await
        }
        async fn unlink(&self, _: &str) -> Result<(), FsError> {
            std::future::pending().await
        }
        async fn create(&self, _: &str, _: u32, _: i32) -> Result<DirEntry, FsError> {
            std::future::pending().await
        }
        async fn symlink(&self, _: &str, _: &str) -> Result<DirEntry, FsError> {
            std::future::pending().await
        }
        async fn link(&self, _: &str, _: &str) -> Result<DirEntry, FsError> {
            std::future::pending().await
        }
        async fn readlink(&self, _: &str) -> Result<String, FsError> {
            std::future::pending().await
        }
        async fn read_all(&self, _: &str) -> Result<Vec<u8>, FsError> {
            std::future::pending().await
        }
        async fn write(&self, _: &str, _: u64, _: &[u8]) -> Result<usize, FsError> {
            std::future::pending().await
        }
        async fn rename(&self, _: &str, _: &str) -> Result<(), FsError> {
            std::future::pending().await
        }
        async fn setattr(&self, _: &str, _: &SetAttributes) -> Result<FileAttributes, FsError> {
            std::future::pending().await
        }
        async fn download(&self, _: &str, _: &str) -> Result<ChunkStream, FsError> {
            std::future::pending().await
        }
        async fn observe(&self) -> Result<EventStream, FsError> {
            std::future::pending().await
        }
    }

    fn write(path: &str) -> Mutation {
        Mutation::Write { path: path.into(), offset: 0, data: b"x".to_vec() }
    }

    #[test]
    fn test_full_queue_drops_mutations_without_blocking() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let queue = Arc::new(WorkQueue::start("test", runtime.handle(), 1, 1));
        let pending = Arc::new(PendingMirrors::new());
        let mirror = Arc::new(RemoteMirror::new(Arc::new(Stalled), queue.clone(), pending.clone()));

        let (done_tx, done) = std::sync::mpsc::channel();
        let writer = {
            let mirror = mirror.clone();
            std::thread::spawn(move || {
                for i in 0..16 {
                    mirror.committed(write(&format!("/f{i}")), libc::S_IFREG | 0o644);
                }
                let _ = done_tx.send(());
            })
        };
        done.recv_timeout(Duration::from_secs(2))
            .expect("committed() waited for the stalled remote");
        writer.join().unwrap();

        // One call stuck on the worker, at most one queued behind it.
        assert!(queue.stats().submitted <= 2);
        assert!(pending.is_pending("/f0"));
        assert!(!pending.is_pending("/f15"));
    }

    #[test]
    fn test_stalled_call_times_out_and_releases_its_path() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let queue = Arc::new(WorkQueue::start("test", runtime.handle(), 4, 1));
        let pending = Arc::new(PendingMirrors::new());
        let mirror = RemoteMirror::new(Arc::new(Stalled), queue.clone(), pending.clone())
            .with_call_timeout(Duration::from_millis(50));

        mirror.committed(write("/a"), libc::S_IFREG | 0o644);
        assert!(pending.is_pending("/a"));

        let deadline = Instant::now() + Duration::from_secs(2);
        while pending.is_pending("/a") {
            assert!(Instant::now() < deadline, "timed-out call still pending");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
