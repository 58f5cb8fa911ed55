// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Account Application Service
//!
//! Login, organization provisioning and user registration. Organizations map
//! to directories under the data directory: `<org>` (0751) holding one
//! `<dept>` (0771) that becomes the root of every user registered to it.

use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::account::{
    validate_password, validate_segment, validate_username, Organization, RepositoryError, User,
    UserRepository, ValidationError,
};
use crate::infrastructure::auth::{AuthError, PasswordHasher, TokenService};

const ORG_DIR_MODE: u32 = 0o751;
const DEPT_DIR_MODE: u32 = 0o771;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("organization already exists: {0}")]
    OrgExists(String),

    #[error("organization not found: {0}")]
    OrgNotFound(String),

    #[error("department not found: {0}")]
    DeptNotFound(String),

    #[error("user already exists: {0}")]
    UserExists(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

pub struct AccountService {
    repository: Arc<dyn UserRepository>,
    tokens: TokenService,
    passwords: PasswordHasher,
    data_dir: PathBuf,
}

impl AccountService {
    pub fn new(
        repository: Arc<dyn UserRepository>,
        tokens: TokenService,
        passwords: PasswordHasher,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repository,
            tokens,
            passwords,
            data_dir: data_dir.into(),
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// Verify credentials and issue a bearer token.
    pub async fn auth(&self, username: &str, password: &str) -> Result<String, AccountError> {
        let username = username.trim();
        let Some(user) = self.repository.find_user(username).await? else {
            warn!(user = %username, "Login for unknown user");
            return Err(AccountError::InvalidCredentials);
        };
        if !self.passwords.verify(&user.password_hash, password.trim()) {
            warn!(user = %username, "Login with wrong password");
            return Err(AccountError::InvalidCredentials);
        }
        let token = self.tokens.issue(&user.identity())?;
        info!(user = %username, "User logged in");
        Ok(token)
    }

    pub async fn create_org(&self, name: &str, dept: &str) -> Result<Organization, AccountError> {
        let name = validate_segment("name", name)?;
        let dept = validate_segment("dept", dept)?;

        let org_dir = self.data_dir.join(&name);
        if org_dir.exists() || self.repository.find_org(&name).await?.is_some() {
            return Err(AccountError::OrgExists(name));
        }

        let dept_dir = org_dir.join(&dept);
        tokio::task::spawn_blocking({
            let org_dir = org_dir.clone();
            move || -> std::io::Result<()> {
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(ORG_DIR_MODE)
                    .create(&org_dir)?;
                std::fs::DirBuilder::new().mode(DEPT_DIR_MODE).create(&dept_dir)
            }
        })
        .await
        .map_err(std::io::Error::other)??;

        let org = Organization {
            name,
            dept,
            created_at: Utc::now(),
        };
        match self.repository.create_org(org.clone()).await {
            Ok(()) => {}
            Err(RepositoryError::Duplicate(name)) => return Err(AccountError::OrgExists(name)),
            Err(e) => return Err(e.into()),
        }
        info!(org = %org.name, dept = %org.dept, "Organization created");
        Ok(org)
    }

    pub async fn create_user(
        &self,
        username: &str,
        password: &str,
        org: &str,
        dept: &str,
    ) -> Result<User, AccountError> {
        let username = validate_username(username)?;
        validate_password(password)?;
        let org = validate_segment("org", org)?;
        let dept = validate_segment("dept", dept)?;

        if self.repository.find_org(&org).await?.is_none() {
            return Err(AccountError::OrgNotFound(org));
        }
        if !self.data_dir.join(&org).join(&dept).is_dir() {
            return Err(AccountError::DeptNotFound(format!("{org}/{dept}")));
        }

        let user = User {
            password_hash: self.passwords.hash(password.trim()),
            username,
            org,
            dept,
            created_at: Utc::now(),
        };
        match self.repository.create_user(user.clone()).await {
            Ok(()) => {}
            Err(RepositoryError::Duplicate(name)) => return Err(AccountError::UserExists(name)),
            Err(e) => return Err(e.into()),
        }
        info!(user = %user.username, org = %user.org, dept = %user.dept, "User created");
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::repositories::InMemoryUserRepository;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> AccountService {
        AccountService::new(
            Arc::new(InMemoryUserRepository::new()),
            TokenService::new(b"secret", Duration::from_secs(60)).unwrap(),
            PasswordHasher::new(b"secret"),
            dir.path(),
        )
    }

    #[tokio::test]
    async fn test_create_org_makes_directories() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        service.create_org(" acme ", "eng").await.unwrap();

        let org_mode = std::fs::metadata(dir.path().join("acme")).unwrap().permissions().mode();
        assert!(dir.path().join("acme/eng").is_dir());
        // umask may clear bits but never adds them
        assert_eq!(org_mode & 0o777 & !ORG_DIR_MODE, 0);
        assert!(matches!(
            service.create_org("acme", "ops").await,
            Err(AccountError::OrgExists(_))
        ));
    }

    #[tokio::test]
    async fn test_create_org_requires_names() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        assert!(matches!(
            service.create_org("  ", "eng").await,
            Err(AccountError::Validation(ValidationError::Missing { field: "name" }))
        ));
        assert!(matches!(
            service.create_org("acme", "a/b").await,
            Err(AccountError::Validation(ValidationError::NotASegment { field: "dept" }))
        ));
    }

    #[tokio::test]
    async fn test_user_lifecycle() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        service.create_org("acme", "eng").await.unwrap();

        assert!(matches!(
            service.create_user("alice", "password1", "nope", "eng").await,
            Err(AccountError::OrgNotFound(_))
        ));
        assert!(matches!(
            service.create_user("alice", "password1", "acme", "ops").await,
            Err(AccountError::DeptNotFound(_))
        ));
        service.create_user("alice", "password1", "acme", "eng").await.unwrap();
        assert!(matches!(
            service.create_user("alice", "password2", "acme", "eng").await,
            Err(AccountError::UserExists(_))
        ));

        let token = service.auth("alice", "password1").await.unwrap();
        let caller = service.tokens().verify(&token).unwrap();
        assert_eq!(caller.root_path(), "/acme/eng");

        assert!(matches!(
            service.auth("alice", "wrong-password").await,
            Err(AccountError::InvalidCredentials)
        ));
        assert!(matches!(
            service.auth("mallory", "password1").await,
            Err(AccountError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_short_credentials_are_rejected() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        service.create_org("acme", "eng").await.unwrap();
        assert!(matches!(
            service.create_user("bob", "password1", "acme", "eng").await,
            Err(AccountError::Validation(_))
        ));
        assert!(matches!(
            service.create_user("bobby", "short", "acme", "eng").await,
            Err(AccountError::Validation(_))
        ));
    }
}
