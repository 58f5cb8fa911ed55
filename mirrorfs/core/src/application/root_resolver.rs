// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Maps an authenticated caller to the `<data_dir>/<org>/<dept>` subtree it is
//! confined to. The directory must already exist; a missing or misconfigured
//! organization is reported, never replaced by an empty root.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::domain::error::FsError;
use crate::domain::identity::CallerIdentity;
use crate::domain::path_sanitizer::PathSanitizer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoot {
    /// Backing directory on the server host
    pub absolute: PathBuf,
    /// Same directory relative to the data directory, e.g. `/acme/eng`
    pub relative: String,
}

#[derive(Debug, Clone)]
pub struct RootResolver {
    data_dir: PathBuf,
    sanitizer: PathSanitizer,
}

impl RootResolver {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            sanitizer: PathSanitizer::new(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn resolve(&self, caller: Option<&CallerIdentity>) -> Result<ResolvedRoot, FsError> {
        let caller = caller.ok_or(FsError::NotLoggedIn)?;

        for segment in [&caller.org, &caller.dept] {
            if self.sanitizer.validate_name(segment).is_err() {
                warn!(user = %caller.username, segment = %segment, "Identity carries an invalid root segment");
                return Err(FsError::InvalidArgument(format!("invalid root segment: {segment}")));
            }
        }

        let absolute = self.data_dir.join(&caller.org).join(&caller.dept);
        let relative = caller.root_path();
        match std::fs::metadata(&absolute) {
            Ok(meta) if meta.is_dir() => Ok(ResolvedRoot { absolute, relative }),
            Ok(_) => Err(FsError::NotFound(relative)),
            Err(e) => Err(FsError::from_io(e, relative)),
        }
    }
}
