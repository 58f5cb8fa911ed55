// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Pure types and rules shared by both node roles: attribute records, change
//! events, the differential-transfer state machine, path rules, identities,
//! accounts and configuration.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Technology-free model of the mirrored filesystem

pub mod account;
pub mod attributes;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod node;
pub mod path_sanitizer;
pub mod transfer;
