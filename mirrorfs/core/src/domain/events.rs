// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! File Change Events
//!
//! [`FileEvent`] is the immutable notification produced by the server for every
//! locally committed mutation and fanned out to remote observers. Paths are
//! root-relative: on the server they are relative to the data directory, and
//! they are re-expressed relative to each subscriber's root before delivery
//! (see [`FileEvent::relative_to`]).
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Change-notification model shared by the event bus and observers

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::path_sanitizer::{is_hidden, strip_ancestor};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum FileEventKind {
    Add,
    Modify,
    Rename,
    Delete,
}

impl fmt::Display for FileEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileEventKind::Add => "ADD",
            FileEventKind::Modify => "MODIFY",
            FileEventKind::Rename => "RENAME",
            FileEventKind::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub path: String,
    /// Rename target; `None` for every other kind
    pub new_path: Option<String>,
    /// Mode of the affected entry (type and permission bits)
    pub mode: u32,
    pub timestamp: DateTime<Utc>,
}

impl FileEvent {
    pub fn add(path: impl Into<String>, mode: u32) -> Self {
        Self::new(FileEventKind::Add, path.into(), None, mode)
    }

    pub fn modify(path: impl Into<String>, mode: u32) -> Self {
        Self::new(FileEventKind::Modify, path.into(), None, mode)
    }

    pub fn rename(path: impl Into<String>, new_path: impl Into<String>, mode: u32) -> Self {
        Self::new(FileEventKind::Rename, path.into(), Some(new_path.into()), mode)
    }

    pub fn delete(path: impl Into<String>, mode: u32) -> Self {
        Self::new(FileEventKind::Delete, path.into(), None, mode)
    }

    fn new(kind: FileEventKind, path: String, new_path: Option<String>, mode: u32) -> Self {
        Self {
            kind,
            path,
            new_path,
            mode,
            timestamp: Utc::now(),
        }
    }

    /// Strip dot-file traffic from the event.
    ///
    /// Events on hidden entries are dropped. A rename from a hidden name onto a
    /// visible one (the editor "write temp, rename over" save) survives as a
    /// modify of the target, and a rename onto a hidden name as a delete.
    pub fn visible(self) -> Option<FileEvent> {
        let hidden_from = is_hidden(&self.path);
        let hidden_to = self.new_path.as_deref().is_some_and(is_hidden);

        match (self.kind, hidden_from, hidden_to) {
            (FileEventKind::Rename, true, false) => {
                let target = self.new_path?;
                Some(FileEvent { kind: FileEventKind::Modify, path: target, new_path: None, ..self })
            }
            (FileEventKind::Rename, false, true) => Some(FileEvent {
                kind: FileEventKind::Delete,
                new_path: None,
                ..self
            }),
            (_, false, false) => Some(self),
            _ => None,
        }
    }

    /// Does this event concern anything under `root`?
    pub fn concerns(&self, root: &str) -> bool {
        strip_ancestor(&self.path, root).is_some()
            || self
                .new_path
                .as_deref()
                .is_some_and(|p| strip_ancestor(p, root).is_some())
    }

    /// Re-express the event relative to `root`.
    ///
    /// Returns `None` when the event does not concern `root`. A rename whose
    /// source lies outside `root` is delivered as an add of the target; one
    /// whose target lies outside is delivered as a delete of the source.
    pub fn relative_to(&self, root: &str) -> Option<FileEvent> {
        let path = strip_ancestor(&self.path, root);
        let new_path = self.new_path.as_deref().and_then(|p| strip_ancestor(p, root));

        let (kind, path, new_path) = match (self.kind, path, new_path) {
            (FileEventKind::Rename, Some(from), Some(to)) => (FileEventKind::Rename, from, Some(to)),
            (FileEventKind::Rename, None, Some(to)) => (FileEventKind::Add, to, None),
            (FileEventKind::Rename, Some(from), None) => (FileEventKind::Delete, from, None),
            (kind, Some(path), _) => (kind, path, None),
            (_, None, _) => return None,
        };

        Some(FileEvent {
            kind,
            path,
            new_path,
            mode: self.mode,
            timestamp: self.timestamp,
        })
    }
}

/// Port through which committed mutations are announced.
pub trait EventPublisher: Send + Sync {
    /// Hand `event` off for delivery. Must not block on subscribers.
    fn publish(&self, event: FileEvent);
}

impl fmt::Display for FileEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.new_path {
            Some(new_path) => write!(f, "{} {} -> {}", self.kind, self.path, new_path),
            None => write!(f, "{} {}", self.kind, self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_to_strips_subscriber_root() {
        let event = FileEvent::add("/acme/eng/X/f.txt", 0o100644);
        let relative = event.relative_to("/acme/eng").unwrap();
        assert_eq!(relative.path, "/X/f.txt");
        assert_eq!(relative.kind, FileEventKind::Add);
        assert_eq!(relative.timestamp, event.timestamp);
    }

    #[test]
    fn test_relative_to_rejects_sibling_with_shared_prefix() {
        let event = FileEvent::modify("/org/dept10/a.txt", 0o100644);
        assert!(event.relative_to("/org/dept1").is_none());
        assert!(!event.concerns("/org/dept1"));
    }

    #[test]
    fn test_rename_across_boundary_degrades() {
        let event = FileEvent::rename("/org/a/x", "/org/b/x", 0o100644);

        let into_b = event.relative_to("/org/b").unwrap();
        assert_eq!(into_b.kind, FileEventKind::Add);
        assert_eq!(into_b.path, "/x");

        let out_of_a = event.relative_to("/org/a").unwrap();
        assert_eq!(out_of_a.kind, FileEventKind::Delete);
        assert_eq!(out_of_a.path, "/x");

        let both = event.relative_to("/org").unwrap();
        assert_eq!(both.kind, FileEventKind::Rename);
        assert_eq!(both.new_path.as_deref(), Some("/b/x"));
    }

    #[test]
    fn test_hidden_entries_are_filtered() {
        assert!(FileEvent::add("/a/.x.swp", 0).visible().is_none());
        assert!(FileEvent::rename("/a/.x", "/a/.y", 0).visible().is_none());
        assert!(FileEvent::delete("/a/x", 0).visible().is_some());
    }

    #[test]
    fn test_rename_over_visible_target_becomes_modify() {
        let saved = FileEvent::rename("/a/.notes.txt.swp", "/a/notes.txt", 0o100644)
            .visible()
            .unwrap();
        assert_eq!(saved.kind, FileEventKind::Modify);
        assert_eq!(saved.path, "/a/notes.txt");
        assert!(saved.new_path.is_none());

        let hidden = FileEvent::rename("/a/notes.txt", "/a/.notes.txt~", 0o100644)
            .visible()
            .unwrap();
        assert_eq!(hidden.kind, FileEventKind::Delete);
        assert_eq!(hidden.path, "/a/notes.txt");
    }
}
