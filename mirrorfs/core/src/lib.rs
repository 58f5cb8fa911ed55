// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! mirrorfs core
//!
//! A mountable directory tree mirrored to a remote server. The client mount
//! forwards every local mutation to the server in the background, the server
//! fans committed mutations out to connected observers, and observers replay
//! them onto their own backing directories.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Filesystem node, sync protocol, event bus and RPC surface

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
