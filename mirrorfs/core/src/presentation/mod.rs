// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`mirrorfs-core`)
//!
//! Network surface that translates RPCs into application service calls.
//! No filesystem logic lives here.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`grpc`] | gRPC (Tonic) | Account and mirror services, bearer-token interceptor |

pub mod grpc;
