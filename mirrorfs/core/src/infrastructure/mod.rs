// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod auth;
pub mod backing_store;
pub mod event_bus;
pub mod fuse;
pub mod grpc_client;
pub mod proto;
pub mod repositories;
pub mod tls;
