// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Filesystem Error Taxonomy
//!
//! [`FsError`] is the single error type surfaced by filesystem node operations,
//! the mirror service, and the differential transfer protocol. It carries enough
//! information to be translated into either the mount layer's errno space
//! ([`FsError::errno`]) or a gRPC status (see `presentation::grpc`).
//!
//! Backing-store failures are classified from their raw OS error so the kernel
//! sees exactly the code the host filesystem produced; anything without a more
//! specific variant is kept as [`FsError::Os`].
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Shared error model for kernel-facing and network-facing paths

use std::io;

use thiserror::Error;

use super::path_sanitizer::PathSanitizerError;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("cross-device link: {0}")]
    CrossDevice(String),

    #[error("no space left on device")]
    ResourceExhausted,

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("not logged in")]
    NotLoggedIn,

    #[error("transfer size mismatch: expected {expected} bytes, received {received}")]
    SizeMismatch { expected: u64, received: u64 },

    #[error("operation timed out")]
    TimedOut,

    #[error("os error {0}")]
    Os(i32),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FsError {
    /// Errno reported to the mount layer.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::PermissionDenied(_) => libc::EACCES,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::CrossDevice(_) => libc::EXDEV,
            FsError::ResourceExhausted => libc::ENOSPC,
            FsError::Unauthenticated(_) | FsError::NotLoggedIn => libc::EACCES,
            FsError::TimedOut => libc::ETIMEDOUT,
            FsError::Os(code) => *code,
            FsError::SizeMismatch { .. } | FsError::Internal(_) => libc::EIO,
        }
    }

    /// Classify an I/O error, attaching `context` (usually the path) to the message.
    pub fn from_io(err: io::Error, context: impl Into<String>) -> Self {
        let context = context.into();
        match err.raw_os_error() {
            Some(libc::ENOENT) => FsError::NotFound(context),
            Some(libc::EACCES) | Some(libc::EPERM) => FsError::PermissionDenied(context),
            Some(libc::EEXIST) => FsError::AlreadyExists(context),
            Some(libc::EINVAL) => FsError::InvalidArgument(context),
            Some(libc::ENOTEMPTY) => FsError::NotEmpty(context),
            Some(libc::ENOTDIR) => FsError::NotADirectory(context),
            Some(libc::EISDIR) => FsError::IsADirectory(context),
            Some(libc::EXDEV) => FsError::CrossDevice(context),
            Some(libc::ENOSPC) => FsError::ResourceExhausted,
            Some(libc::ETIMEDOUT) => FsError::TimedOut,
            Some(code) => FsError::Os(code),
            None => match err.kind() {
                io::ErrorKind::NotFound => FsError::NotFound(context),
                io::ErrorKind::PermissionDenied => FsError::PermissionDenied(context),
                io::ErrorKind::AlreadyExists => FsError::AlreadyExists(context),
                io::ErrorKind::InvalidInput => FsError::InvalidArgument(context),
                io::ErrorKind::TimedOut => FsError::TimedOut,
                _ => FsError::Internal(format!("{context}: {err}")),
            },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        let message = err.to_string();
        FsError::from_io(err, message)
    }
}

impl From<PathSanitizerError> for FsError {
    fn from(err: PathSanitizerError) -> Self {
        match err {
            PathSanitizerError::OutsideBoundary(path) => FsError::PermissionDenied(path),
            other => FsError::InvalidArgument(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_keep_their_errno() {
        let err = FsError::from_io(io::Error::from_raw_os_error(libc::ENOTEMPTY), "/a");
        assert!(matches!(err, FsError::NotEmpty(_)));
        assert_eq!(err.errno(), libc::ENOTEMPTY);

        let err = FsError::from_io(io::Error::from_raw_os_error(libc::ENOSPC), "/a");
        assert!(matches!(err, FsError::ResourceExhausted));
        assert_eq!(err.errno(), libc::ENOSPC);

        let err = FsError::from_io(io::Error::from_raw_os_error(libc::ELOOP), "/a");
        assert_eq!(err.errno(), libc::ELOOP);
    }

    #[test]
    fn test_size_mismatch_surfaces_as_eio() {
        let err = FsError::SizeMismatch { expected: 10, received: 4 };
        assert_eq!(err.errno(), libc::EIO);
        assert!(err.to_string().contains("expected 10"));
    }

    #[test]
    fn test_traversal_becomes_invalid_argument() {
        let err: FsError = PathSanitizerError::PathTraversal("../x".into()).into();
        assert!(matches!(err, FsError::InvalidArgument(_)));
    }
}
