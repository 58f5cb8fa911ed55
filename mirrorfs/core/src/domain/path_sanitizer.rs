// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Path Sanitizer Domain Service
//!
//! Every path that crosses the wire is *root-relative*: it starts with `/`, uses
//! `/` separators and is interpreted under the caller's exclusive root. This
//! module normalizes such paths, rejects traversal attempts, joins them under a
//! backing root, and implements the segment-aware prefix test used for
//! subscriber matching (`/org/dept1` never contains `/org/dept10/x`).
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Root-boundary enforcement for client-supplied paths

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Path sanitization errors
#[derive(Debug, Error)]
pub enum PathSanitizerError {
    #[error("Path traversal attempt detected: {0}")]
    PathTraversal(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Path outside root boundary: {0}")]
    OutsideBoundary(String),

    #[error("Path too long: {0}")]
    PathTooLong(String),
}

/// Validates and normalizes root-relative paths.
///
/// # Security Guarantees
/// - Rejects paths containing `..` components or NUL bytes
/// - Collapses `.` components, duplicate and trailing separators
/// - Joined paths are checked to start with the backing root
#[derive(Debug, Clone)]
pub struct PathSanitizer {
    /// Maximum allowed path length (default: 4096)
    max_path_len: usize,
}

impl PathSanitizer {
    pub fn new() -> Self {
        Self { max_path_len: 4096 }
    }

    pub fn with_max_length(max_path_len: usize) -> Self {
        Self { max_path_len }
    }

    /// Normalize a client-supplied path into canonical root-relative form.
    ///
    /// `""`, `"."` and `"/"` all denote the root and normalize to `"/"`.
    /// Relative input (`a/b`) is treated as if it started with `/`.
    ///
    /// # Examples
    /// ```
    /// use mirrorfs_core::domain::path_sanitizer::PathSanitizer;
    ///
    /// let sanitizer = PathSanitizer::new();
    /// assert_eq!(sanitizer.normalize("a//b/./c/").unwrap(), "/a/b/c");
    /// assert!(sanitizer.normalize("/a/../../etc/passwd").is_err());
    /// ```
    pub fn normalize(&self, path: &str) -> Result<String, PathSanitizerError> {
        if path.len() > self.max_path_len {
            return Err(PathSanitizerError::PathTooLong(path.to_string()));
        }

        if path.contains('\0') {
            tracing::warn!(path = %path, "Path contains null byte");
            return Err(PathSanitizerError::InvalidPath(
                "Path contains null byte".to_string(),
            ));
        }

        let mut normalized = String::with_capacity(path.len() + 1);
        for component in Path::new(path).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => {
                    let part = part.to_str().ok_or_else(|| {
                        PathSanitizerError::InvalidPath(path.to_string())
                    })?;
                    normalized.push('/');
                    normalized.push_str(part);
                }
                Component::ParentDir => {
                    tracing::warn!(
                        path = %path,
                        "Path traversal attempt detected: contains '..' component"
                    );
                    return Err(PathSanitizerError::PathTraversal(path.to_string()));
                }
                Component::Prefix(_) => {
                    return Err(PathSanitizerError::InvalidPath(path.to_string()));
                }
            }
        }

        if normalized.is_empty() {
            normalized.push('/');
        }
        Ok(normalized)
    }

    /// Validate a single directory-entry name as handed to us by the mount
    /// layer or a provisioning request.
    pub fn validate_name(&self, name: &str) -> Result<(), PathSanitizerError> {
        if name.is_empty() || name == "." || name == ".." {
            return Err(PathSanitizerError::InvalidPath(name.to_string()));
        }
        if name.contains('/') || name.contains('\0') {
            tracing::warn!(name = %name, "Entry name contains a separator or null byte");
            return Err(PathSanitizerError::InvalidPath(name.to_string()));
        }
        if name.len() > 255 {
            return Err(PathSanitizerError::PathTooLong(name.to_string()));
        }
        Ok(())
    }

    /// Normalize `path` and join it under `root`.
    ///
    /// # Returns
    /// * `Ok(PathBuf)` - absolute backing path strictly under `root`
    /// * `Err(PathSanitizerError)` - the path is unsafe or invalid
    pub fn join_under(&self, root: &Path, path: &str) -> Result<PathBuf, PathSanitizerError> {
        let normalized = self.normalize(path)?;
        if normalized == "/" {
            return Ok(root.to_path_buf());
        }
        let joined = root.join(normalized.trim_start_matches('/'));

        if !joined.starts_with(root) {
            tracing::warn!(
                path = %path,
                root = %root.display(),
                "Path outside root boundary detected"
            );
            return Err(PathSanitizerError::OutsideBoundary(path.to_string()));
        }
        Ok(joined)
    }

    /// Express an absolute backing path relative to `root` (`"/"` for the root itself).
    pub fn relative_to(&self, absolute: &Path, root: &Path) -> Result<String, PathSanitizerError> {
        let stripped = absolute.strip_prefix(root).map_err(|_| {
            PathSanitizerError::OutsideBoundary(absolute.display().to_string())
        })?;
        let stripped = stripped.to_str().ok_or_else(|| {
            PathSanitizerError::InvalidPath(absolute.display().to_string())
        })?;
        self.normalize(stripped)
    }
}

impl Default for PathSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Segment-aware containment: is `path` equal to `ancestor` or nested below it?
///
/// Both arguments are normalized root-relative paths.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return path.starts_with('/');
    }
    match path.strip_prefix(ancestor) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Re-express `path` relative to `ancestor`, or `None` when it is not contained.
pub fn strip_ancestor(path: &str, ancestor: &str) -> Option<String> {
    if !is_within(path, ancestor) {
        return None;
    }
    if ancestor == "/" {
        return Some(path.to_string());
    }
    let rest = &path[ancestor.len()..];
    Some(if rest.is_empty() { "/".to_string() } else { rest.to_string() })
}

/// Join a normalized parent path and a validated entry name.
pub fn join_name(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Final segment of a normalized path (`""` for the root).
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

/// Parent of a normalized path (`"/"` for top-level entries and the root).
pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Editor swap files and other dot-files never generate notification traffic.
pub fn is_hidden(path: &str) -> bool {
    file_name(path).starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_root_forms() {
        let sanitizer = PathSanitizer::new();
        assert_eq!(sanitizer.normalize("").unwrap(), "/");
        assert_eq!(sanitizer.normalize("/").unwrap(), "/");
        assert_eq!(sanitizer.normalize(".").unwrap(), "/");
        assert_eq!(sanitizer.normalize("docs/./a.txt").unwrap(), "/docs/a.txt");
    }

    #[test]
    fn test_reject_parent_dir() {
        let sanitizer = PathSanitizer::new();
        let result = sanitizer.normalize("/docs/../../etc/passwd");
        assert!(matches!(result.unwrap_err(), PathSanitizerError::PathTraversal(_)));
    }

    #[test]
    fn test_reject_null_byte() {
        let sanitizer = PathSanitizer::new();
        assert!(sanitizer.normalize("/path\0/with/null").is_err());
    }

    #[test]
    fn test_path_too_long() {
        let sanitizer = PathSanitizer::with_max_length(10);
        let result = sanitizer.normalize("/very/long/path/that/exceeds/limit");
        assert!(matches!(result.unwrap_err(), PathSanitizerError::PathTooLong(_)));
    }

    #[test]
    fn test_join_under_stays_in_root() {
        let sanitizer = PathSanitizer::new();
        let root = Path::new("/srv/data/acme/eng");
        assert_eq!(
            sanitizer.join_under(root, "/notes/a.txt").unwrap(),
            PathBuf::from("/srv/data/acme/eng/notes/a.txt")
        );
        assert_eq!(sanitizer.join_under(root, "/").unwrap(), PathBuf::from(root));
        assert!(sanitizer.join_under(root, "../../etc/passwd").is_err());
    }

    #[test]
    fn test_validate_name() {
        let sanitizer = PathSanitizer::new();
        assert!(sanitizer.validate_name("report.pdf").is_ok());
        assert!(sanitizer.validate_name("..").is_err());
        assert!(sanitizer.validate_name("a/b").is_err());
        assert!(sanitizer.validate_name("").is_err());
    }

    #[test]
    fn test_relative_to() {
        let sanitizer = PathSanitizer::new();
        let root = Path::new("/srv/data");
        assert_eq!(
            sanitizer.relative_to(Path::new("/srv/data/acme/eng"), root).unwrap(),
            "/acme/eng"
        );
        assert_eq!(sanitizer.relative_to(root, root).unwrap(), "/");
        assert!(sanitizer.relative_to(Path::new("/etc"), root).is_err());
    }

    #[test]
    fn test_is_within_respects_segment_boundaries() {
        assert!(is_within("/org/dept1/x/y", "/org/dept1"));
        assert!(is_within("/org/dept1", "/org/dept1"));
        assert!(!is_within("/org/dept10/x", "/org/dept1"));
        assert!(!is_within("/orgC/deptD/x", "/orgA/deptB"));
        assert!(is_within("/anything", "/"));
    }

    #[test]
    fn test_strip_ancestor() {
        assert_eq!(strip_ancestor("/org/d/x.txt", "/org/d").as_deref(), Some("/x.txt"));
        assert_eq!(strip_ancestor("/org/d", "/org/d").as_deref(), Some("/"));
        assert_eq!(strip_ancestor("/org/d10/x", "/org/d"), None);
    }

    #[test]
    fn test_segment_helpers() {
        assert_eq!(join_name("/", "a"), "/a");
        assert_eq!(join_name("/a", "b"), "/a/b");
        assert_eq!(file_name("/a/b.txt"), "b.txt");
        assert_eq!(parent_of("/a/b.txt"), "/a");
        assert_eq!(parent_of("/a"), "/");
        assert!(is_hidden("/a/.b.swp"));
        assert!(!is_hidden("/.config/visible"));
    }
}
