// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Account Repository Implementations
//!
//! - **InMemoryUserRepository** - HashMap-backed storage, optionally
//!   snapshotted to a YAML file after every insert so accounts survive a
//!   server restart

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::domain::account::{Organization, RepositoryError, User, UserRepository};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Accounts {
    #[serde(default)]
    organizations: HashMap<String, Organization>,
    #[serde(default)]
    users: HashMap<String, User>,
}

#[derive(Clone, Default)]
pub struct InMemoryUserRepository {
    accounts: Arc<RwLock<Accounts>>,
    snapshot: Option<PathBuf>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `path` if it exists and write it back after every change.
    pub fn persistent(path: impl Into<PathBuf>) -> Result<Self, RepositoryError> {
        let path = path.into();
        let accounts = match std::fs::read_to_string(&path) {
            Ok(content) => serde_yaml::from_str(&content)
                .map_err(|e| RepositoryError::Storage(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Accounts::default(),
            Err(e) => return Err(RepositoryError::Storage(format!("{}: {e}", path.display()))),
        };
        info!(
            path = %path.display(),
            organizations = accounts.organizations.len(),
            users = accounts.users.len(),
            "Loaded account snapshot"
        );
        Ok(Self {
            accounts: Arc::new(RwLock::new(accounts)),
            snapshot: Some(path),
        })
    }

    async fn save(&self, accounts: &Accounts) -> Result<(), RepositoryError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let yaml = serde_yaml::to_string(accounts).map_err(|e| RepositoryError::Storage(e.to_string()))?;
        write_private(path, yaml.as_bytes())
            .await
            .map_err(|e| RepositoryError::Storage(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "Account snapshot written");
        Ok(())
    }
}

/// Write via a temporary file and rename, mode 0600.
async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    let contents = contents.to_vec();
    let tmp_path = tmp.clone();
    tokio::task::spawn_blocking(move || {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)?;
        file.write_all(&contents)?;
        file.sync_all()
    })
    .await
    .map_err(std::io::Error::other)??;
    tokio::fs::rename(&tmp, path).await
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn create_org(&self, org: Organization) -> Result<(), RepositoryError> {
        let mut accounts = self.accounts.write().await;
        if accounts.organizations.contains_key(&org.name) {
            return Err(RepositoryError::Duplicate(org.name));
        }
        accounts.organizations.insert(org.name.clone(), org);
        self.save(&accounts).await
    }

    async fn find_org(&self, name: &str) -> Result<Option<Organization>, RepositoryError> {
        Ok(self.accounts.read().await.organizations.get(name).cloned())
    }

    async fn create_user(&self, user: User) -> Result<(), RepositoryError> {
        let mut accounts = self.accounts.write().await;
        if accounts.users.contains_key(&user.username) {
            return Err(RepositoryError::Duplicate(user.username));
        }
        accounts.users.insert(user.username.clone(), user);
        self.save(&accounts).await
    }

    async fn find_user(&self, username: &str) -> Result<Option<User>, RepositoryError> {
        Ok(self.accounts.read().await.users.get(username).cloned())
    }
}
