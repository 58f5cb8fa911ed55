// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Remote filesystem port
//!
//! What the client side needs from the server: the mirror operations, the
//! differential download and the change stream. All paths are relative to the
//! caller's root. The gRPC client implements this over the network; the
//! server's mirror service implements it in-process for a fixed caller.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::domain::attributes::{DirEntry, FileAttributes, SetAttributes};
use crate::domain::error::FsError;
use crate::domain::events::FileEvent;
use crate::domain::transfer::Chunk;

pub type ChunkStream = BoxStream<'static, Result<Chunk, FsError>>;
pub type EventStream = BoxStream<'static, Result<FileEvent, FsError>>;

#[async_trait]
pub trait RemoteFs: Send + Sync {
    async fn lookup(&self, parent: &str, name: &str) -> Result<DirEntry, FsError>;

    async fn getattr(&self, path: &str) -> Result<FileAttributes, FsError>;

    async fn read_dir_all(&self, path: &str) -> Result<Vec<DirEntry>, FsError>;

    async fn mkdir(&self, path: &str, mode: u32) -> Result<DirEntry, FsError>;

    async fn rmdir(&self, path: &str) -> Result<(), FsError>;

    async fn unlink(&self, path: &str) -> Result<(), FsError>;

    async fn create(&self, path: &str, mode: u32, flags: i32) -> Result<DirEntry, FsError>;

    async fn symlink(&self, target: &str, path: &str) -> Result<DirEntry, FsError>;

    async fn link(&self, existing: &str, path: &str) -> Result<DirEntry, FsError>;

    async fn readlink(&self, path: &str) -> Result<String, FsError>;

    async fn read_all(&self, path: &str) -> Result<Vec<u8>, FsError>;

    async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize, FsError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError>;

    async fn setattr(&self, path: &str, changes: &SetAttributes) -> Result<FileAttributes, FsError>;

    /// Zero chunks when `local_hash` matches the remote content.
    async fn download(&self, path: &str, local_hash: &str) -> Result<ChunkStream, FsError>;

    /// Change notifications for the caller's root until the stream ends.
    async fn observe(&self) -> Result<EventStream, FsError>;
}
