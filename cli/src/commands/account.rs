// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Account commands
//!
//! Commands: login, org create, user create

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use dialoguer::Password;

use mirrorfs_core::domain::config::{default_token_path, NodeConfig};
use mirrorfs_core::infrastructure::grpc_client::{connect, AccountClient};
use mirrorfs_core::infrastructure::tls::client_tls_config;

#[derive(Subcommand)]
pub enum OrgCommand {
    /// Create an organization with its first department
    Create {
        name: String,
        dept: String,

        /// Server URL (default: client.remote_url from the configuration)
        #[arg(long, env = "MIRRORFS_REMOTE_URL")]
        remote: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum UserCommand {
    /// Register a user under an existing organization and department
    Create {
        username: String,

        #[arg(long)]
        org: String,

        #[arg(long)]
        dept: String,

        /// Read from the terminal when omitted
        #[arg(long, env = "MIRRORFS_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        #[arg(long, env = "MIRRORFS_REMOTE_URL")]
        remote: Option<String>,
    },
}

/// Connection settings for the account service.
struct Endpoint {
    url: String,
    client: AccountClient,
    token_path: PathBuf,
}

async fn endpoint(config_path: Option<PathBuf>, remote: Option<String>) -> Result<Endpoint> {
    let config = NodeConfig::load_or_default(config_path).context("Failed to load configuration")?;
    let client_config = config.client;

    let url = remote
        .or_else(|| client_config.as_ref().map(|c| c.remote_url.clone()))
        .context("no server URL: pass --remote or set client.remote_url")?;
    let tls = client_config
        .as_ref()
        .and_then(|c| c.ca_cert_path.as_deref().map(|ca| (ca, c.tls_domain.as_deref())))
        .map(|(ca, domain)| client_tls_config(ca, domain))
        .transpose()?;
    let token_path = client_config
        .as_ref()
        .map(|c| c.token_path())
        .unwrap_or_else(default_token_path);

    let channel = connect(&url, tls).await?;
    Ok(Endpoint {
        url,
        client: AccountClient::new(channel),
        token_path,
    })
}

fn password_or_prompt(password: Option<String>, confirm: bool) -> Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }
    let mut prompt = Password::new().with_prompt("Password");
    if confirm {
        prompt = prompt.with_confirmation("Confirm password", "Passwords do not match");
    }
    prompt.interact().context("Failed to read password")
}

/// Write `token` readable by the owner only.
pub fn store_token(path: &Path, token: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    writeln!(file, "{token}").with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub async fn login(
    config_path: Option<PathBuf>,
    remote: Option<String>,
    username: &str,
    password: Option<String>,
) -> Result<()> {
    let endpoint = endpoint(config_path, remote).await?;
    let password = password_or_prompt(password, false)?;
    let token = endpoint
        .client
        .auth(username, &password)
        .await
        .context("Login failed")?;
    store_token(&endpoint.token_path, &token)?;

    println!(
        "{}",
        format!("✓ Logged in to {} as {}", endpoint.url, username).green()
    );
    println!("  Token stored in {}", endpoint.token_path.display());
    Ok(())
}

pub async fn handle_org(command: OrgCommand, config_path: Option<PathBuf>) -> Result<()> {
    match command {
        OrgCommand::Create { name, dept, remote } => {
            let endpoint = endpoint(config_path, remote).await?;
            let org = endpoint
                .client
                .create_org(&name, &dept)
                .await
                .context("Failed to create organization")?;
            println!(
                "{}",
                format!("✓ Organization {} created with department {}", org.name, org.dept).green()
            );
            Ok(())
        }
    }
}

pub async fn handle_user(command: UserCommand, config_path: Option<PathBuf>) -> Result<()> {
    match command {
        UserCommand::Create {
            username,
            org,
            dept,
            password,
            remote,
        } => {
            let endpoint = endpoint(config_path, remote).await?;
            let password = password_or_prompt(password, true)?;
            let user = endpoint
                .client
                .create_user(&username, &password, &org, &dept)
                .await
                .context("Failed to create user")?;
            println!(
                "{}",
                format!("✓ User {} created in {}/{}", user.username, org, dept).green()
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_token_is_stored_privately() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state/token");
        store_token(&path, "abc.def.ghi").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "abc.def.ghi\n");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);

        store_token(&path, "new").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new\n");
    }

    #[test]
    fn test_explicit_password_skips_the_prompt() {
        assert_eq!(password_or_prompt(Some("password1".into()), true).unwrap(), "password1");
    }
}
