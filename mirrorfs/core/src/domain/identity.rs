// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Caller Identity
//!
//! The authenticated principal behind an RPC call. The authentication
//! interceptor resolves it from the bearer token; every mirror handler then
//! receives it as an explicit argument and derives its storage root from it.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Value object for per-call authentication results

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub username: String,
    pub org: String,
    pub dept: String,
}

impl CallerIdentity {
    pub fn new(
        username: impl Into<String>,
        org: impl Into<String>,
        dept: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            org: org.into(),
            dept: dept.into(),
        }
    }

    /// Root-relative path of the caller's exclusive subtree, `/<org>/<dept>`.
    pub fn root_path(&self) -> String {
        format!("/{}/{}", self.org, self.dept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_path() {
        let caller = CallerIdentity::new("alice", "acme", "eng");
        assert_eq!(caller.root_path(), "/acme/eng");
    }
}
