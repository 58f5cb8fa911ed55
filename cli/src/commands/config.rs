// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;

use mirrorfs_core::domain::config::{state_dir, ClientConfig, NodeConfig, ServerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    Server,
    Client,
    Both,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./mirrorfs.yaml)
        #[arg(short, long, default_value = "./mirrorfs.yaml")]
        output: PathBuf,

        #[arg(long, value_enum, default_value = "both")]
        role: Role,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output, role, force } => generate(output, role, force),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = NodeConfig::load_or_default(config_override.clone()).context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        match &config_override {
            Some(path) => println!("  1. --config flag: {}", path.display()),
            None => println!("  1. --config flag: {}", "(not set)".dimmed()),
        }
        println!(
            "  2. MIRRORFS_CONFIG_PATH: {}",
            std::env::var("MIRRORFS_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./mirrorfs.yaml");
        println!("  4. {}", state_dir().join("config.yaml").display());
        println!();
    }

    println!("{}", "Current configuration:".bold());
    println!();

    match &config.server {
        Some(server) => {
            println!("{}", "Server:".bold());
            println!("  Data directory: {}", server.data_dir.display());
            println!("  Listen: {}", server.listen_addr);
            println!("  TLS: {}", if server.tls.is_some() { "enabled" } else { "disabled" });
            println!(
                "  Secret key: {}",
                if server.secret_key.is_some() { "set" } else { "(not set)" }
            );
            if let Some(mount_point) = &server.mount_point {
                println!("  Mount point: {}", mount_point.display());
            }
        }
        None => println!("{} {}", "Server:".bold(), "(not configured)".dimmed()),
    }
    println!();

    match &config.client {
        Some(client) => {
            println!("{}", "Client:".bold());
            println!("  Remote: {}", client.remote_url);
            println!("  Backing directory: {}", client.backing_dir.display());
            println!("  Mount point: {}", client.mount_point.display());
            println!("  Token file: {}", client.token_path().display());
            println!(
                "  Mirror queue: {} slots, {} worker(s)",
                client.mirror.capacity, client.mirror.workers
            );
        }
        None => println!("{} {}", "Client:".bold(), "(not configured)".dimmed()),
    }
    println!();

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = NodeConfig::load_or_default(config_path).context("Failed to load configuration")?;
    if config.server.is_none() && config.client.is_none() {
        anyhow::bail!("configuration has neither a `server` nor a `client` section");
    }
    if let Some(server) = &config.server {
        server.validate().context("Server configuration is invalid")?;
    }
    if let Some(client) = &config.client {
        client.validate().context("Client configuration is invalid")?;
    }

    println!("{}", "✓ Configuration is valid".green());
    Ok(())
}

/// Sample configuration for `role`, with placeholder paths.
pub fn sample(role: Role) -> NodeConfig {
    let home = state_dir();
    let server = || ServerConfig::new("/srv/mirrorfs");
    let client = || ClientConfig::new(home.join("data"), home.join("mnt"), "https://files.example.com:1054");
    match role {
        Role::Server => NodeConfig {
            server: Some(server()),
            client: None,
        },
        Role::Client => NodeConfig {
            server: None,
            client: Some(client()),
        },
        Role::Both => NodeConfig {
            server: Some(server()),
            client: Some(client()),
        },
    }
}

fn generate(output: PathBuf, role: Role, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists; pass --force to overwrite", output.display());
    }
    let yaml = sample(role).to_yaml().context("Failed to render configuration")?;
    let header = "# mirrorfs configuration\n# The server secret is read from MIRRORFS_SECRET_KEY (or ~/.mirrorfs/.env).\n";
    std::fs::write(&output, format!("{header}{yaml}"))
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );
    Ok(())
}
