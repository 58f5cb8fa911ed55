// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the mirrorfs CLI

pub mod account;
pub mod config;
pub mod mount;
pub mod server;

pub use self::account::{OrgCommand, UserCommand};
pub use self::config::ConfigCommand;
pub use self::mount::MountArgs;
pub use self::server::ServerArgs;
