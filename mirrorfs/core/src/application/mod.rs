// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod node_table;
pub mod node_ops;
pub mod file_handle;
pub mod loopback;

pub mod remote;
pub mod mirror;
pub mod work_queue;
pub mod transfer;
pub mod observer;

pub mod root_resolver;
pub mod mirror_service;
pub mod account_service;

// Re-export the services for convenience
pub use account_service::{AccountError, AccountService};
pub use loopback::LoopbackFs;
pub use mirror_service::{FileMirrorService, ScopedMirror};
pub use observer::RemoteObserver;
pub use transfer::RemoteSync;
