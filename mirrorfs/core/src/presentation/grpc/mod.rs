// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! gRPC surface: the account and mirror services plus the bearer-token
//! interceptor guarding the latter.

pub mod auth;
pub mod server;
