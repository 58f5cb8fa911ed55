// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! File Mirror Application Service
//!
//! Server side of every mirrored operation. Each call:
//! 1. resolves the caller's root (`<data_dir>/<org>/<dept>`)
//! 2. normalizes the root-relative request path, rejecting traversal
//! 3. performs the operation against a store scoped to that root
//! 4. publishes a [`FileEvent`] once the change has committed
//!
//! Published paths are relative to the data directory so the event bus can
//! route them by subscriber root. Reads never publish.
//!
//! [`ScopedMirror`] binds the service to one caller and exposes it through
//! [`RemoteFs`], which lets a client talk to an in-process server.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument, warn};

use crate::application::remote::{ChunkStream, EventStream, RemoteFs};
use crate::application::root_resolver::{ResolvedRoot, RootResolver};
use crate::application::transfer::send_chunks;
use crate::domain::attributes::{DirEntry, FileAttributes, SetAttributes};
use crate::domain::error::FsError;
use crate::domain::events::{EventPublisher, FileEvent};
use crate::domain::identity::CallerIdentity;
use crate::domain::path_sanitizer::{file_name, join_name, parent_of, PathSanitizer};
use crate::infrastructure::backing_store::BackingStore;
use crate::infrastructure::event_bus::{EventBus, Subscription};

const RENAME_PARENT_MODE: u32 = 0o755;

/// Chunks buffered between the file reader and the RPC stream.
const DOWNLOAD_BUFFER: usize = 4;

/// A request bound to one caller's root.
struct Scope {
    store: BackingStore,
    root: ResolvedRoot,
}

impl Scope {
    /// Data-directory-relative form of a root-relative path.
    fn global(&self, path: &str) -> String {
        if path == "/" {
            self.root.relative.clone()
        } else {
            format!("{}{}", self.root.relative, path)
        }
    }
}

pub struct FileMirrorService {
    resolver: RootResolver,
    events: EventBus,
    sanitizer: PathSanitizer,
}

impl FileMirrorService {
    pub fn new(resolver: RootResolver, events: EventBus) -> Self {
        Self {
            resolver,
            events,
            sanitizer: PathSanitizer::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn scope(&self, caller: &CallerIdentity) -> Result<Scope, FsError> {
        let root = self.resolver.resolve(Some(caller))?;
        Ok(Scope {
            store: BackingStore::new(root.absolute.clone()),
            root,
        })
    }

    fn publish(&self, event: FileEvent) {
        self.events.publish(event);
    }

    pub async fn lookup(&self, caller: &CallerIdentity, parent: &str, name: &str) -> Result<DirEntry, FsError> {
        self.sanitizer.validate_name(name)?;
        let scope = self.scope(caller)?;
        let path = join_name(&scope.store.normalize(parent)?, name);
        let attr = blocking({
            let store = scope.store.clone();
            let path = path.clone();
            move || store.lstat(&path)
        })
        .await?;
        Ok(entry(path, attr))
    }

    pub async fn getattr(&self, caller: &CallerIdentity, path: &str) -> Result<FileAttributes, FsError> {
        let scope = self.scope(caller)?;
        let path = scope.store.normalize(path)?;
        blocking(move || scope.store.lstat(&path)).await
    }

    pub async fn read_dir_all(&self, caller: &CallerIdentity, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let scope = self.scope(caller)?;
        let path = scope.store.normalize(path)?;
        blocking(move || scope.store.read_dir(&path)).await
    }

    #[instrument(level = "debug", skip(self, caller), fields(user = %caller.username))]
    pub async fn mkdir(&self, caller: &CallerIdentity, path: &str, mode: u32) -> Result<DirEntry, FsError> {
        let scope = self.scope(caller)?;
        let path = scope.store.normalize(path)?;
        let attr = blocking({
            let store = scope.store.clone();
            let path = path.clone();
            move || store.mkdir(&path, mode)
        })
        .await?;
        self.publish(FileEvent::add(scope.global(&path), attr.mode));
        Ok(entry(path, attr))
    }

    #[instrument(level = "debug", skip(self, caller), fields(user = %caller.username))]
    pub async fn rmdir(&self, caller: &CallerIdentity, path: &str) -> Result<(), FsError> {
        let scope = self.scope(caller)?;
        let path = scope.store.normalize(path)?;
        let mode = blocking({
            let store = scope.store.clone();
            let path = path.clone();
            move || {
                let attr = store.lstat(&path)?;
                store.remove_dir(&path)?;
                Ok(attr.mode)
            }
        })
        .await?;
        self.publish(FileEvent::delete(scope.global(&path), mode));
        Ok(())
    }

    #[instrument(level = "debug", skip(self, caller), fields(user = %caller.username))]
    pub async fn unlink(&self, caller: &CallerIdentity, path: &str) -> Result<(), FsError> {
        let scope = self.scope(caller)?;
        let path = scope.store.normalize(path)?;
        let mode = blocking({
            let store = scope.store.clone();
            let path = path.clone();
            move || {
                let attr = store.lstat(&path)?;
                store.remove_file(&path)?;
                Ok(attr.mode)
            }
        })
        .await?;
        self.publish(FileEvent::delete(scope.global(&path), mode));
        Ok(())
    }

    /// Create or open a regular file. Only `O_TRUNC` is honored from `flags`:
    /// the client has already applied its own `O_EXCL` check locally.
    #[instrument(level = "debug", skip(self, caller), fields(user = %caller.username))]
    pub async fn create(&self, caller: &CallerIdentity, path: &str, mode: u32, flags: i32) -> Result<DirEntry, FsError> {
        let scope = self.scope(caller)?;
        let path = scope.store.normalize(path)?;
        let truncate = flags & libc::O_TRUNC != 0;
        let attr = blocking({
            let store = scope.store.clone();
            let path = path.clone();
            move || {
                let open_flags = libc::O_WRONLY | if truncate { libc::O_TRUNC } else { 0 };
                store.create(&path, mode, open_flags)?;
                store.lstat(&path)
            }
        })
        .await?;
        self.publish(FileEvent::add(scope.global(&path), attr.mode));
        if truncate {
            self.publish(FileEvent::modify(scope.global(&path), attr.mode));
        }
        Ok(entry(path, attr))
    }

    #[instrument(level = "debug", skip(self, caller), fields(user = %caller.username))]
    pub async fn symlink(&self, caller: &CallerIdentity, target: &str, path: &str) -> Result<DirEntry, FsError> {
        let scope = self.scope(caller)?;
        let path = scope.store.normalize(path)?;
        let attr = blocking({
            let store = scope.store.clone();
            let path = path.clone();
            let target = target.to_string();
            move || store.symlink(&target, &path)
        })
        .await?;
        self.publish(FileEvent::add(scope.global(&path), attr.mode));
        Ok(entry(path, attr))
    }

    #[instrument(level = "debug", skip(self, caller), fields(user = %caller.username))]
    pub async fn link(&self, caller: &CallerIdentity, existing: &str, path: &str) -> Result<DirEntry, FsError> {
        let scope = self.scope(caller)?;
        let existing = scope.store.normalize(existing)?;
        let path = scope.store.normalize(path)?;
        let attr = blocking({
            let store = scope.store.clone();
            let path = path.clone();
            move || store.link(&existing, &path)
        })
        .await?;
        self.publish(FileEvent::add(scope.global(&path), attr.mode));
        Ok(entry(path, attr))
    }

    pub async fn readlink(&self, caller: &CallerIdentity, path: &str) -> Result<String, FsError> {
        let scope = self.scope(caller)?;
        let path = scope.store.normalize(path)?;
        let target = blocking({
            let path = path.clone();
            move || scope.store.read_link(&path)
        })
        .await?;
        target
            .into_os_string()
            .into_string()
            .map_err(|_| FsError::InvalidArgument(format!("{path}: link target is not UTF-8")))
    }

    pub async fn read_all(&self, caller: &CallerIdentity, path: &str) -> Result<Vec<u8>, FsError> {
        let scope = self.scope(caller)?;
        let path = scope.store.normalize(path)?;
        blocking(move || scope.store.read_all(&path)).await
    }

    pub async fn write(&self, caller: &CallerIdentity, path: &str, offset: u64, data: Vec<u8>) -> Result<usize, FsError> {
        let scope = self.scope(caller)?;
        let path = scope.store.normalize(path)?;
        let (written, mode) = blocking({
            let store = scope.store.clone();
            let path = path.clone();
            move || {
                let written = store.write_at(&path, offset, &data)?;
                Ok((written, store.lstat(&path)?.mode))
            }
        })
        .await?;
        debug!(path = %path, offset, written, "Mirrored write");
        self.publish(FileEvent::modify(scope.global(&path), mode));
        Ok(written)
    }

    /// Rename, creating missing destination parents.
    #[instrument(level = "debug", skip(self, caller), fields(user = %caller.username))]
    pub async fn rename(&self, caller: &CallerIdentity, from: &str, to: &str) -> Result<(), FsError> {
        let scope = self.scope(caller)?;
        let from = scope.store.normalize(from)?;
        let to = scope.store.normalize(to)?;
        if from == "/" || to == "/" {
            return Err(FsError::PermissionDenied("cannot rename the root".to_string()));
        }
        let mode = blocking({
            let store = scope.store.clone();
            let (from, to) = (from.clone(), to.clone());
            move || {
                let attr = store.lstat(&from)?;
                store.mkdir_all(parent_of(&to), RENAME_PARENT_MODE)?;
                store.rename(&from, &to)?;
                Ok(attr.mode)
            }
        })
        .await?;
        self.publish(FileEvent::rename(scope.global(&from), scope.global(&to), mode));
        Ok(())
    }

    /// Apply mode, size and timestamp changes. Ownership is never changed remotely.
    #[instrument(level = "debug", skip(self, caller), fields(user = %caller.username))]
    pub async fn setattr(&self, caller: &CallerIdentity, path: &str, changes: &SetAttributes) -> Result<FileAttributes, FsError> {
        let scope = self.scope(caller)?;
        let path = scope.store.normalize(path)?;
        let changes = changes.mirrored();
        let attr = blocking({
            let store = scope.store.clone();
            let path = path.clone();
            move || store.set_attributes(&path, &changes)
        })
        .await?;
        self.publish(FileEvent::modify(scope.global(&path), attr.mode));
        Ok(attr)
    }

    /// Differential download of `path` against the caller's `local_hash`.
    ///
    /// Resolution failures are returned directly; failures while reading are
    /// delivered as the last stream item.
    pub async fn download(&self, caller: &CallerIdentity, path: &str, local_hash: &str) -> Result<ChunkStream, FsError> {
        let scope = self.scope(caller)?;
        let path = scope.store.normalize(path)?;
        blocking({
            let store = scope.store.clone();
            let path = path.clone();
            move || store.ensure_contained(&path).map(drop)
        })
        .await?;

        let (tx, rx) = mpsc::channel(DOWNLOAD_BUFFER);
        let local_hash = local_hash.to_string();
        tokio::spawn(async move {
            let errors = tx.clone();
            if let Err(e) = send_chunks(scope.store, path.clone(), local_hash, tx).await {
                warn!(path = %path, error = %e, "Download failed");
                let _ = errors.send(Err(e)).await;
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }

    /// Subscribe to changes under the caller's root. Dropping the
    /// subscription deregisters it.
    pub fn observe(&self, caller: &CallerIdentity) -> Result<Subscription, FsError> {
        let root = self.resolver.resolve(Some(caller))?;
        debug!(user = %caller.username, root = %root.relative, "Observer registered");
        Ok(self.events.subscribe(&root.relative))
    }
}

fn entry(path: String, attr: FileAttributes) -> DirEntry {
    DirEntry {
        name: file_name(&path).to_string(),
        path,
        attr,
    }
}

async fn blocking<T, F>(op: F) -> Result<T, FsError>
where
    F: FnOnce() -> Result<T, FsError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| FsError::Internal(e.to_string()))?
}

/// [`FileMirrorService`] bound to one caller.
#[derive(Clone)]
pub struct ScopedMirror {
    service: Arc<FileMirrorService>,
    caller: CallerIdentity,
}

impl ScopedMirror {
    pub fn new(service: Arc<FileMirrorService>, caller: CallerIdentity) -> Self {
        Self { service, caller }
    }
}

#[async_trait]
impl RemoteFs for ScopedMirror {
    async fn lookup(&self, parent: &str, name: &str) -> Result<DirEntry, FsError> {
        self.service.lookup(&self.caller, parent, name).await
    }

    async fn getattr(&self, path: &str) -> Result<FileAttributes, FsError> {
        self.service.getattr(&self.caller, path).await
    }

    async fn read_dir_all(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        self.service.read_dir_all(&self.caller, path).await
    }

    async fn mkdir(&self, path: &str, mode: u32) -> Result<DirEntry, FsError> {
        self.service.mkdir(&self.caller, path, mode).await
    }

    async fn rmdir(&self, path: &str) -> Result<(), FsError> {
        self.service.rmdir(&self.caller, path).await
    }

    async fn unlink(&self, path: &str) -> Result<(), FsError> {
        self.service.unlink(&self.caller, path).await
    }

    async fn create(&self, path: &str, mode: u32, flags: i32) -> Result<DirEntry, FsError> {
        self.service.create(&self.caller, path, mode, flags).await
    }

    async fn symlink(&self, target: &str, path: &str) -> Result<DirEntry, FsError> {
        self.service.symlink(&self.caller, target, path).await
    }

    async fn link(&self, existing: &str, path: &str) -> Result<DirEntry, FsError> {
        self.service.link(&self.caller, existing, path).await
    }

    async fn readlink(&self, path: &str) -> Result<String, FsError> {
        self.service.readlink(&self.caller, path).await
    }

    async fn read_all(&self, path: &str) -> Result<Vec<u8>, FsError> {
        self.service.read_all(&self.caller, path).await
    }

    async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        self.service.write(&self.caller, path, offset, data.to_vec()).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        self.service.rename(&self.caller, from, to).await
    }

    async fn setattr(&self, path: &str, changes: &SetAttributes) -> Result<FileAttributes, FsError> {
        self.service.setattr(&self.caller, path, changes).await
    }

    async fn download(&self, path: &str, local_hash: &str) -> Result<ChunkStream, FsError> {
        self.service.download(&self.caller, path, local_hash).await
    }

    async fn observe(&self) -> Result<EventStream, FsError> {
        let subscription = self.service.observe(&self.caller)?;
        Ok(subscription.map(Ok).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::EventBusConfig;
    use crate::domain::events::FileEventKind;
    use std::time::Duration;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> (FileMirrorService, CallerIdentity) {
        std::fs::create_dir_all(dir.path().join("acme/eng")).unwrap();
        let (bus, _dispatcher) = EventBus::start(&EventBusConfig::default());
        let service = FileMirrorService::new(RootResolver::new(dir.path()), bus);
        (service, CallerIdentity::new("alice", "acme", "eng"))
    }

    async fn next_event(subscription: &mut Subscription) -> FileEvent {
        tokio::time::timeout(Duration::from_secs(2), subscription.next())
            .await
            .expect("event within timeout")
            .expect("subscription open")
    }

    #[tokio::test]
    async fn test_mutations_publish_data_dir_relative_events() {
        let dir = TempDir::new().unwrap();
        let (service, caller) = service(&dir);
        let mut all = service.events().subscribe("/");

        service.mkdir(&caller, "/X", 0o755).await.unwrap();
        service.create(&caller, "/X/f.txt", 0o644, libc::O_WRONLY).await.unwrap();
        service.write(&caller, "/X/f.txt", 0, b"hi".to_vec()).await.unwrap();

        let first = next_event(&mut all).await;
        assert_eq!(first.kind, FileEventKind::Add);
        assert_eq!(first.path, "/acme/eng/X");
        assert_eq!(next_event(&mut all).await.path, "/acme/eng/X/f.txt");
        let modify = next_event(&mut all).await;
        assert_eq!(modify.kind, FileEventKind::Modify);
        assert_eq!(std::fs::read(dir.path().join("acme/eng/X/f.txt")).unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_paths_cannot_escape_the_root() {
        let dir = TempDir::new().unwrap();
        let (service, caller) = service(&dir);
        std::fs::write(dir.path().join("acme/secret"), b"s").unwrap();

        assert!(service.read_all(&caller, "/../secret").await.is_err());
        assert!(service.lookup(&caller, "/", "..").await.is_err());
        assert!(service.write(&caller, "../../x", 0, b"x".to_vec()).await.is_err());
        assert!(!dir.path().join("x").exists());
    }

    #[tokio::test]
    async fn test_rename_creates_destination_parents() {
        let dir = TempDir::new().unwrap();
        let (service, caller) = service(&dir);
        service.create(&caller, "/a.txt", 0o644, 0).await.unwrap();

        service.rename(&caller, "/a.txt", "/deep/er/b.txt").await.unwrap();
        let attr = service.getattr(&caller, "/deep/er/b.txt").await.unwrap();
        assert_eq!(attr.size, 0);
        assert!(service.getattr(&caller, "/a.txt").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_create_without_trunc_keeps_content() {
        let dir = TempDir::new().unwrap();
        let (service, caller) = service(&dir);
        service.write(&caller, "/f", 0, b"body".to_vec()).await.unwrap();

        service.create(&caller, "/f", 0o644, libc::O_WRONLY | libc::O_EXCL).await.unwrap();
        assert_eq!(service.read_all(&caller, "/f").await.unwrap(), b"body");
        service.create(&caller, "/f", 0o644, libc::O_WRONLY | libc::O_TRUNC).await.unwrap();
        assert!(service.read_all(&caller, "/f").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unlink_and_rmdir() {
        let dir = TempDir::new().unwrap();
        let (service, caller) = service(&dir);
        service.mkdir(&caller, "/d", 0o755).await.unwrap();
        service.create(&caller, "/d/f", 0o644, 0).await.unwrap();

        assert!(matches!(service.rmdir(&caller, "/d").await, Err(FsError::NotEmpty(_))));
        service.unlink(&caller, "/d/f").await.unwrap();
        service.rmdir(&caller, "/d").await.unwrap();
        assert!(service.read_dir_all(&caller, "/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_root_is_not_found() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir);
        let stranger = CallerIdentity::new("bob", "acme", "ops");
        assert!(service.getattr(&stranger, "/").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_setattr_ignores_ownership() {
        let dir = TempDir::new().unwrap();
        let (service, caller) = service(&dir);
        service.write(&caller, "/f", 0, b"abcdef".to_vec()).await.unwrap();

        let changes = SetAttributes {
            size: Some(2),
            uid: Some(0),
            gid: Some(0),
            ..Default::default()
        };
        let attr = service.setattr(&caller, "/f", &changes).await.unwrap();
        assert_eq!(attr.size, 2);
    }

    #[tokio::test]
    async fn test_symlink_and_readlink() {
        let dir = TempDir::new().unwrap();
        let (service, caller) = service(&dir);
        service.symlink(&caller, "target.txt", "/ln").await.unwrap();
        assert_eq!(service.readlink(&caller, "/ln").await.unwrap(), "target.txt");
    }

    #[tokio::test]
    async fn test_symlinks_cannot_reach_another_organization() {
        let dir = TempDir::new().unwrap();
        let (service, caller) = service(&dir);
        let rival = dir.path().join("rival/ops");
        std::fs::create_dir_all(&rival).unwrap();
        std::fs::write(rival.join("plan.txt"), b"rival plans").unwrap();
        service.symlink(&caller, rival.to_str().unwrap(), "/ln").await.unwrap();

        assert!(service.write(&caller, "/ln/planted.txt", 0, b"x".to_vec()).await.is_err());
        let truncate = SetAttributes { size: Some(0), ..Default::default() };
        assert!(service.setattr(&caller, "/ln/plan.txt", &truncate).await.is_err());
        assert!(service.mkdir(&caller, "/ln/newdir", 0o755).await.is_err());
        assert!(service.unlink(&caller, "/ln/plan.txt").await.is_err());
        assert!(service.rename(&caller, "/ln/plan.txt", "/mine.txt").await.is_err());
        assert!(service.read_dir_all(&caller, "/ln").await.is_err());
        assert!(service.download(&caller, "/ln/plan.txt", "").await.is_err());

        assert!(!rival.join("planted.txt").exists());
        assert!(!rival.join("newdir").exists());
        assert_eq!(std::fs::read(rival.join("plan.txt")).unwrap(), b"rival plans");
    }

    #[tokio::test]
    async fn test_download_of_missing_file_fails_up_front() {
        let dir = TempDir::new().unwrap();
        let (service, caller) = service(&dir);
        let result = service.download(&caller, "/nope", "").await;
        assert!(matches!(result, Err(FsError::NotFound(_))));
    }
}
