// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Differential transfer
//!
//! Both ends of the hash-gated download:
//!
//! - [`send_chunks`] runs on the side holding the authoritative copy. It
//!   compares the receiver's digest with its own and streams nothing on a
//!   match, the file body in [`BLOCK_SIZE`] chunks otherwise.
//! - [`apply_chunks`] runs on the receiving side. It writes each chunk at its
//!   offset, checks the byte count against the announced size and truncates
//!   the local copy to that size.
//!
//! [`RemoteSync`] drives the client side against a [`RemoteFs`].

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::application::file_handle::ReadHook;
use crate::application::mirror::PendingMirrors;
use crate::application::remote::RemoteFs;
use crate::domain::attributes::FileKind;
use crate::domain::error::FsError;
use crate::domain::path_sanitizer::{file_name, is_hidden};
use crate::domain::transfer::{chunk_plan, Chunk, ChunkAssembler, TransferOutcome, BLOCK_SIZE};
use crate::infrastructure::backing_store::BackingStore;

/// Directory name never pulled from the server.
pub const TRASH_DIR: &str = "Trash";

/// Hex BLAKE3 digest of the file at `path`, or `""` when it does not exist.
pub fn content_hash(path: &Path) -> Result<String, FsError> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(FsError::from_io(e, path.display().to_string())),
    };
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FsError::from_io(e, path.display().to_string())),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Stream `path` to `tx` unless `receiver_hash` already matches.
///
/// Stops early, without error, when the receiver goes away. Returns the
/// number of chunks sent.
pub async fn send_chunks(
    store: BackingStore,
    path: String,
    receiver_hash: String,
    tx: mpsc::Sender<Result<Chunk, FsError>>,
) -> Result<u64, FsError> {
    let full = store.ensure_contained(&path)?;
    let (hash, file) = {
        let full = full.clone();
        tokio::task::spawn_blocking(move || -> Result<(String, File), FsError> {
            let hash = content_hash(&full)?;
            let file = File::open(&full).map_err(|e| FsError::from_io(e, full.display().to_string()))?;
            Ok((hash, file))
        })
        .await
        .map_err(|e| FsError::Internal(e.to_string()))??
    };

    if hash == receiver_hash {
        debug!(path = %path, "Receiver is up to date");
        return Ok(0);
    }

    let total_size = file
        .metadata()
        .map_err(|e| FsError::from_io(e, path.as_str()))?
        .len();
    let file = Arc::new(file);
    let mut sent = 0;

    for (offset, len) in chunk_plan(total_size) {
        let reader = file.clone();
        let data = tokio::task::spawn_blocking(move || -> io::Result<Vec<u8>> {
            let mut data = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                match reader.read_at(&mut data[filled..], offset + filled as u64)? {
                    0 => break,
                    n => filled += n,
                }
            }
            data.truncate(filled);
            Ok(data)
        })
        .await
        .map_err(|e| FsError::Internal(e.to_string()))?
        .map_err(|e| FsError::from_io(e, path.as_str()))?;

        let chunk = Chunk {
            data,
            offset,
            total_size,
        };
        if tx.send(Ok(chunk)).await.is_err() {
            debug!(path = %path, "Receiver went away mid-transfer");
            return Ok(sent);
        }
        sent += 1;
    }

    debug!(path = %path, chunks = sent, total_size, "Transfer sent");
    Ok(sent)
}

/// Write an incoming chunk stream into `path` under `store`.
///
/// Zero chunks leave the local file untouched. The file is created when
/// missing and truncated to the announced size on success.
pub async fn apply_chunks<S>(store: &BackingStore, path: &str, mut chunks: S) -> Result<TransferOutcome, FsError>
where
    S: Stream<Item = Result<Chunk, FsError>> + Unpin,
{
    let full = store.resolve(path)?;
    let mut assembler = ChunkAssembler::new();
    let mut file: Option<File> = None;

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        let offset = assembler.accept(&chunk)?;
        if file.is_none() {
            let opened = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .custom_flags(libc::O_NOFOLLOW)
                .open(&full)
                .map_err(|e| FsError::from_io(e, path))?;
            file = Some(opened);
        }
        if let Some(file) = &file {
            file.write_all_at(&chunk.data, offset)
                .map_err(|e| FsError::from_io(e, path))?;
        }
    }

    let outcome = assembler.finish()?;
    if let (TransferOutcome::Updated { total_size }, Some(file)) = (outcome, &file) {
        file.set_len(total_size).map_err(|e| FsError::from_io(e, path))?;
    }
    Ok(outcome)
}

/// Client-side puller.
pub struct RemoteSync {
    store: BackingStore,
    remote: Arc<dyn RemoteFs>,
    pending: Arc<PendingMirrors>,
}

impl RemoteSync {
    pub fn new(store: BackingStore, remote: Arc<dyn RemoteFs>, pending: Arc<PendingMirrors>) -> Self {
        Self {
            store,
            remote,
            pending,
        }
    }

    pub fn store(&self) -> &BackingStore {
        &self.store
    }

    pub fn remote(&self) -> &Arc<dyn RemoteFs> {
        &self.remote
    }

    pub fn pending(&self) -> &PendingMirrors {
        &self.pending
    }

    /// Pull `path` if the remote copy differs from the local one.
    ///
    /// Paths with mirror calls still in flight are skipped: their local
    /// content is newer than anything the server can send.
    pub async fn download_if_stale(&self, path: &str) -> Result<TransferOutcome, FsError> {
        if self.pending.is_pending(path) {
            debug!(path = %path, "Local changes not yet mirrored; skipping download");
            return Ok(TransferOutcome::NoChange);
        }
        let full = self.store.resolve(path)?;
        let local_hash = tokio::task::spawn_blocking(move || content_hash(&full))
            .await
            .map_err(|e| FsError::Internal(e.to_string()))??;

        let chunks = self.remote.download(path, &local_hash).await?;
        let outcome = apply_chunks(&self.store, path, chunks).await?;
        if let TransferOutcome::Updated { total_size } = outcome {
            debug!(path = %path, total_size, "Pulled remote content");
        }
        Ok(outcome)
    }

    /// Mirror the remote tree under `path` into the backing store.
    ///
    /// Creates missing directories and pulls every regular file through the
    /// differential transfer. The trash directory and dot-files are skipped.
    /// Failures on individual entries are logged and do not stop the walk.
    pub async fn pull_tree(&self, path: &str) -> Result<PullSummary, FsError> {
        let mut summary = PullSummary::default();
        let mut queue = vec![path.to_string()];

        while let Some(dir) = queue.pop() {
            let entries = match self.remote.read_dir_all(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %dir, error = %e, "Failed to list remote directory");
                    summary.failed += 1;
                    continue;
                }
            };

            for entry in entries {
                if is_hidden(&entry.path) || (dir == "/" && file_name(&entry.path) == TRASH_DIR) {
                    continue;
                }
                match entry.attr.kind() {
                    FileKind::Directory => {
                        if let Err(e) = self.store.mkdir_all(&entry.path, entry.attr.mode) {
                            warn!(path = %entry.path, error = %e, "Failed to create directory");
                            summary.failed += 1;
                            continue;
                        }
                        summary.directories += 1;
                        queue.push(entry.path);
                    }
                    FileKind::File => match self.download_if_stale(&entry.path).await {
                        Ok(TransferOutcome::Updated { .. }) => summary.downloaded += 1,
                        Ok(TransferOutcome::NoChange) => summary.unchanged += 1,
                        Err(e) => {
                            warn!(path = %entry.path, error = %e, "Failed to pull file");
                            summary.failed += 1;
                        }
                    },
                    _ => debug!(path = %entry.path, "Skipping non-regular entry"),
                }
            }
        }

        info!(
            directories = summary.directories,
            downloaded = summary.downloaded,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "Remote tree pulled"
        );
        Ok(summary)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PullSummary {
    pub directories: u64,
    pub downloaded: u64,
    pub unchanged: u64,
    pub failed: u64,
}

/// Pre-read hook: refresh a file from the server before it is read.
///
/// Runs on mount threads, outside the runtime, and blocks the read for at
/// most `timeout`. Failures and timeouts fall back to the local copy.
pub struct StaleCheck {
    sync: Arc<RemoteSync>,
    runtime: tokio::runtime::Handle,
    timeout: Duration,
}

impl StaleCheck {
    pub fn new(sync: Arc<RemoteSync>, runtime: tokio::runtime::Handle, timeout: Duration) -> Self {
        Self {
            sync,
            runtime,
            timeout,
        }
    }
}

impl ReadHook for StaleCheck {
    fn before_read(&self, path: &str) {
        if self.sync.pending().is_pending(path) {
            return;
        }
        let sync = self.sync.clone();
        let result = self
            .runtime
            .block_on(tokio::time::timeout(self.timeout, sync.download_if_stale(path)));
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(path = %path, error = %e, "Stale check failed; serving local copy"),
            Err(_) => warn!(path = %path, "Stale check timed out; serving local copy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tempfile::TempDir;
    use tokio_stream::wrappers::ReceiverStream;

    async fn transfer(server: &BackingStore, client: &BackingStore, path: &str) -> (u64, Result<TransferOutcome, FsError>) {
        let local_hash = content_hash(&client.resolve(path).unwrap()).unwrap();
        let (tx, rx) = mpsc::channel(4);
        let sender = tokio::spawn(send_chunks(server.clone(), path.to_string(), local_hash, tx));
        let outcome = apply_chunks(client, path, ReceiverStream::new(rx)).await;
        (sender.await.unwrap().unwrap(), outcome)
    }

    #[test]
    fn test_hash_of_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert_eq!(content_hash(&dir.path().join("nope")).unwrap(), "");
    }

    #[tokio::test]
    async fn test_matching_hash_sends_nothing() {
        let (server_dir, client_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        std::fs::write(server_dir.path().join("f"), b"same").unwrap();
        std::fs::write(client_dir.path().join("f"), b"same").unwrap();
        let before = std::fs::metadata(client_dir.path().join("f")).unwrap().modified().unwrap();

        let (sent, outcome) = transfer(&BackingStore::new(server_dir.path()), &BackingStore::new(client_dir.path()), "/f").await;
        assert_eq!(sent, 0);
        assert_eq!(outcome.unwrap(), TransferOutcome::NoChange);
        let after = std::fs::metadata(client_dir.path().join("f")).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_changed_file_is_rewritten_and_truncated() {
        let (server_dir, client_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let body: Vec<u8> = (0..(BLOCK_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();
        std::fs::write(server_dir.path().join("f"), &body).unwrap();
        std::fs::write(client_dir.path().join("f"), vec![9u8; BLOCK_SIZE * 4]).unwrap();

        let (sent, outcome) = transfer(&BackingStore::new(server_dir.path()), &BackingStore::new(client_dir.path()), "/f").await;
        assert_eq!(sent, 3);
        assert_eq!(outcome.unwrap(), TransferOutcome::Updated { total_size: body.len() as u64 });
        assert_eq!(std::fs::read(client_dir.path().join("f")).unwrap(), body);
    }

    #[tokio::test]
    async fn test_empty_remote_file_truncates_receiver() {
        let (server_dir, client_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        std::fs::write(server_dir.path().join("f"), b"").unwrap();
        std::fs::write(client_dir.path().join("f"), b"stale").unwrap();

        let (sent, outcome) = transfer(&BackingStore::new(server_dir.path()), &BackingStore::new(client_dir.path()), "/f").await;
        assert_eq!(sent, 1);
        assert_eq!(outcome.unwrap(), TransferOutcome::Updated { total_size: 0 });
        assert!(std::fs::read(client_dir.path().join("f")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_short_stream_is_size_mismatch() {
        let client_dir = TempDir::new().unwrap();
        let store = BackingStore::new(client_dir.path());
        let chunks = stream::iter(vec![Ok(Chunk { data: b"abc".to_vec(), offset: 0, total_size: 10 })]);
        let result = apply_chunks(&store, "/f", chunks).await;
        assert!(matches!(result, Err(FsError::SizeMismatch { expected: 10, received: 3 })));
    }

    #[tokio::test]
    async fn test_sender_refuses_escaping_symlink() {
        let server_dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"s").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), server_dir.path().join("ln")).unwrap();

        let (tx, _rx) = mpsc::channel(1);
        let result = send_chunks(BackingStore::new(server_dir.path()), "/ln".into(), String::new(), tx).await;
        assert!(matches!(result, Err(FsError::PermissionDenied(_))));
    }
}
