// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Accounts
//!
//! Users and organizations, their validation rules, and the persistence
//! contract ([`UserRepository`]) the account service depends on. Following the
//! repository pattern, the trait lives here and implementations live in
//! `crate::infrastructure::repositories`.
//!
//! | Rule | Constraint |
//! |------|------------|
//! | username | at least [`MIN_USERNAME_LEN`] characters after trimming |
//! | password | at least [`MIN_PASSWORD_LEN`] characters after trimming |
//! | org / dept | non-empty single path segment |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::identity::CallerIdentity;
use super::path_sanitizer::PathSanitizer;

pub const MIN_USERNAME_LEN: usize = 4;
pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub name: String,
    pub dept: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    /// Hex-encoded HMAC-SHA256 of the password
    pub password_hash: String,
    pub org: String,
    pub dept: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn identity(&self) -> CallerIdentity {
        CallerIdentity::new(&self.username, &self.org, &self.dept)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} is required")]
    Missing { field: &'static str },

    #[error("{field} too short: minimum {min} characters")]
    TooShort { field: &'static str, min: usize },

    #[error("{field} must be a single path segment")]
    NotASegment { field: &'static str },
}

pub fn validate_username(username: &str) -> Result<String, ValidationError> {
    let username = username.trim();
    if username.chars().count() < MIN_USERNAME_LEN {
        return Err(ValidationError::TooShort {
            field: "username",
            min: MIN_USERNAME_LEN,
        });
    }
    Ok(username.to_string())
}

pub fn validate_password(password: &str) -> Result<(), ValidationError> {
    if password.trim().chars().count() < MIN_PASSWORD_LEN {
        return Err(ValidationError::TooShort {
            field: "password",
            min: MIN_PASSWORD_LEN,
        });
    }
    Ok(())
}

/// Organization and department names become directory names under the data root.
pub fn validate_segment(field: &'static str, value: &str) -> Result<String, ValidationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::Missing { field });
    }
    PathSanitizer::new()
        .validate_name(value)
        .map_err(|_| ValidationError::NotASegment { field })?;
    Ok(value.to_string())
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Entity already exists: {0}")]
    Duplicate(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Persistence contract for users and organizations.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Insert a new organization; fails with `Duplicate` if the name is taken.
    async fn create_org(&self, org: Organization) -> Result<(), RepositoryError>;

    async fn find_org(&self, name: &str) -> Result<Option<Organization>, RepositoryError>;

    /// Insert a new user; fails with `Duplicate` if the username is taken.
    async fn create_user(&self, user: User) -> Result<(), RepositoryError>;

    async fn find_user(&self, username: &str) -> Result<Option<User>, RepositoryError>;
}
