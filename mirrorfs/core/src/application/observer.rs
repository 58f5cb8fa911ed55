// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Remote Observer Application Service
//!
//! Holds one change subscription open against the server for the lifetime of
//! a mount session and replays every event onto the local backing directory:
//! - add: create an empty directory or file matching the announced mode
//! - modify: pull the new content through the differential transfer
//! - rename: move the local entry, creating missing parents
//! - delete: remove the local entry
//!
//! Events are applied one at a time in arrival order. Every handler accepts
//! the "already in the desired state" case, so duplicates and replays are
//! harmless. Local writes go straight to the backing directory and never
//! re-enter the mirror path.
//!
//! The loop ends when the stream ends or the session is cancelled. It is not
//! restarted here; that is the supervisor's call.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::remote::EventStream;
use crate::application::transfer::RemoteSync;
use crate::domain::attributes::FileKind;
use crate::domain::error::FsError;
use crate::domain::events::{FileEvent, FileEventKind};
use crate::domain::path_sanitizer::parent_of;
use crate::domain::transfer::TransferOutcome;

const PARENT_MODE: u32 = 0o755;

/// Why the observation loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverExit {
    StreamEnded,
    StreamFailed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverReport {
    pub exit: ObserverExit,
    pub applied: u64,
    pub failed: u64,
}

pub struct RemoteObserver {
    sync: Arc<RemoteSync>,
}

impl RemoteObserver {
    pub fn new(sync: Arc<RemoteSync>) -> Self {
        Self { sync }
    }

    /// Subscribe and consume in a background task.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<ObserverReport> {
        info!("Starting remote observer");
        tokio::spawn(async move {
            let events = tokio::select! {
                events = self.sync.remote().observe() => events,
                _ = cancel.cancelled() => {
                    return ObserverReport { exit: ObserverExit::Cancelled, applied: 0, failed: 0 };
                }
            };
            match events {
                Ok(events) => self.consume(events, cancel).await,
                Err(e) => {
                    error!(error = %e, "Failed to open change subscription");
                    ObserverReport {
                        exit: ObserverExit::StreamFailed,
                        applied: 0,
                        failed: 0,
                    }
                }
            }
        })
    }

    /// Apply events from `events` until it ends or `cancel` fires.
    pub async fn consume(&self, mut events: EventStream, cancel: CancellationToken) -> ObserverReport {
        let mut applied = 0u64;
        let mut failed = 0u64;

        let exit = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break ObserverExit::Cancelled,
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => match self.apply(&event).await {
                    Ok(()) => applied += 1,
                    Err(e) => {
                        failed += 1;
                        warn!(event = %event, error = %e, "Failed to apply remote event");
                    }
                },
                Some(Err(e)) => {
                    error!(error = %e, "Change subscription failed");
                    break ObserverExit::StreamFailed;
                }
                None => break ObserverExit::StreamEnded,
            }
        };

        info!(?exit, applied, failed, "Remote observer stopped");
        ObserverReport { exit, applied, failed }
    }

    /// Replay one event onto the backing directory.
    pub async fn apply(&self, event: &FileEvent) -> Result<(), FsError> {
        debug!(event = %event, "Applying remote event");
        match event.kind {
            FileEventKind::Add => self.apply_add(&event.path, event.mode),
            FileEventKind::Modify => self.apply_modify(&event.path, event.mode).await,
            FileEventKind::Rename => {
                let to = event
                    .new_path
                    .as_deref()
                    .ok_or_else(|| FsError::InvalidArgument(format!("rename of {} without target", event.path)))?;
                self.apply_rename(&event.path, to, event.mode).await
            }
            FileEventKind::Delete => self.apply_delete(&event.path),
        }
    }

    fn apply_add(&self, path: &str, mode: u32) -> Result<(), FsError> {
        let store = self.sync.store();
        match FileKind::from_mode(mode) {
            FileKind::Directory => store.mkdir_all(path, mode),
            FileKind::File => {
                if store.exists(path)? {
                    return Ok(());
                }
                store.mkdir_all(parent_of(path), PARENT_MODE)?;
                store.create(path, mode, libc::O_WRONLY).map(drop)
            }
            _ => {
                debug!(path = %path, mode = format!("{mode:o}"), "Ignoring add of special entry");
                Ok(())
            }
        }
    }

    async fn apply_modify(&self, path: &str, mode: u32) -> Result<(), FsError> {
        if FileKind::from_mode(mode) != FileKind::File {
            return Ok(());
        }
        self.sync.store().mkdir_all(parent_of(path), PARENT_MODE)?;
        match self.sync.download_if_stale(path).await? {
            TransferOutcome::Updated { total_size } => debug!(path = %path, total_size, "Refreshed from remote"),
            TransferOutcome::NoChange => {}
        }
        Ok(())
    }

    async fn apply_rename(&self, from: &str, to: &str, mode: u32) -> Result<(), FsError> {
        let store = self.sync.store();
        if !store.exists(from)? {
            if store.exists(to)? {
                // Already applied
                return Ok(());
            }
            // Never had the source; fetch the result instead
            return match FileKind::from_mode(mode) {
                FileKind::Directory => store.mkdir_all(to, mode),
                FileKind::File => self.apply_modify(to, mode).await,
                _ => Ok(()),
            };
        }
        store.mkdir_all(parent_of(to), PARENT_MODE)?;
        store.rename(from, to)
    }

    fn apply_delete(&self, path: &str) -> Result<(), FsError> {
        match self.sync.store().remove_all(path) {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}
