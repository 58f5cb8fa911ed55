// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Inode to path mapping for the mount adapter
//!
//! Inode numbers are the backing filesystem's own, except that the backing
//! root is presented as [`ROOT_INO`] because the mount layer requires it.
//! Entries are created by lookups and dropped once the kernel has forgotten
//! every reference it was handed. Paths are root-relative.

use std::collections::HashMap;

use crate::domain::path_sanitizer::strip_ancestor;

/// Inode number of the mount root.
pub const ROOT_INO: u64 = 1;

#[derive(Debug)]
struct NodeEntry {
    path: String,
    lookups: u64,
}

#[derive(Debug)]
pub struct NodeTable {
    root_backing_ino: u64,
    nodes: HashMap<u64, NodeEntry>,
}

impl NodeTable {
    pub fn new(root_backing_ino: u64) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_INO,
            NodeEntry {
                path: "/".to_string(),
                lookups: 0,
            },
        );
        Self {
            root_backing_ino,
            nodes,
        }
    }

    /// Kernel-facing inode number for a backing inode number.
    pub fn kernel_ino(&self, backing_ino: u64) -> u64 {
        if backing_ino == self.root_backing_ino {
            ROOT_INO
        } else {
            backing_ino
        }
    }

    pub fn path(&self, ino: u64) -> Option<&str> {
        self.nodes.get(&ino).map(|entry| entry.path.as_str())
    }

    /// Record one kernel reference to `path`, returning its kernel inode.
    ///
    /// Hard links share an inode; the most recently looked-up name wins.
    pub fn remember(&mut self, backing_ino: u64, path: &str) -> u64 {
        let ino = self.kernel_ino(backing_ino);
        if ino == ROOT_INO {
            return ino;
        }
        let entry = self.nodes.entry(ino).or_insert_with(|| NodeEntry {
            path: path.to_string(),
            lookups: 0,
        });
        entry.path = path.to_string();
        entry.lookups += 1;
        ino
    }

    /// Drop `count` kernel references. The root is never forgotten.
    pub fn forget(&mut self, ino: u64, count: u64) {
        if ino == ROOT_INO {
            return;
        }
        if let Some(entry) = self.nodes.get_mut(&ino) {
            entry.lookups = entry.lookups.saturating_sub(count);
            if entry.lookups == 0 {
                self.nodes.remove(&ino);
            }
        }
    }

    /// Move `from` and everything below it to `to`.
    pub fn rename(&mut self, from: &str, to: &str) {
        for entry in self.nodes.values_mut() {
            if let Some(rest) = strip_ancestor(&entry.path, from) {
                entry.path = if rest == "/" {
                    to.to_string()
                } else {
                    format!("{}{}", to.trim_end_matches('/'), rest)
                };
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_presented_as_ino_one() {
        let mut table = NodeTable::new(4242);
        assert_eq!(table.kernel_ino(4242), ROOT_INO);
        assert_eq!(table.remember(4242, "/"), ROOT_INO);
        assert_eq!(table.path(ROOT_INO), Some("/"));
        table.forget(ROOT_INO, 10);
        assert_eq!(table.path(ROOT_INO), Some("/"));
    }

    #[test]
    fn test_backing_inode_is_kept() {
        let mut table = NodeTable::new(2);
        assert_eq!(table.remember(77, "/a.txt"), 77);
        assert_eq!(table.path(77), Some("/a.txt"));
    }

    #[test]
    fn test_forget_drops_after_last_reference() {
        let mut table = NodeTable::new(2);
        table.remember(10, "/a");
        table.remember(10, "/a");
        table.forget(10, 1);
        assert_eq!(table.path(10), Some("/a"));
        table.forget(10, 1);
        assert_eq!(table.path(10), None);
    }

    #[test]
    fn test_rename_moves_subtree() {
        let mut table = NodeTable::new(2);
        table.remember(10, "/docs");
        table.remember(11, "/docs/a.txt");
        table.remember(12, "/docs2/b.txt");

        table.rename("/docs", "/archive/docs");
        assert_eq!(table.path(10), Some("/archive/docs"));
        assert_eq!(table.path(11), Some("/archive/docs/a.txt"));
        assert_eq!(table.path(12), Some("/docs2/b.txt"));
    }
}
