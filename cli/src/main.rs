// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # mirrorfs
//!
//! One binary for both roles of a mirrored filesystem:
//!
//! - `mirrorfs server` - serve `<data>/<org>/<dept>` roots over gRPC, optionally
//!   mounting the data directory locally
//! - `mirrorfs mount` - mount a local backing directory and mirror it to a server
//! - `mirrorfs login` - obtain and store a bearer token
//! - `mirrorfs org create|user create` - provision accounts
//! - `mirrorfs config show|validate|generate` - configuration management

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use mirrorfs_cli::commands::{self, ConfigCommand, MountArgs, OrgCommand, ServerArgs, UserCommand};
use mirrorfs_core::domain::config::state_dir;

/// Mirrored filesystem server and client
#[derive(Parser)]
#[command(name = "mirrorfs")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(short, long, global = true, env = "MIRRORFS_CONFIG_PATH", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "MIRRORFS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the mirror server
    #[command(name = "server")]
    Server(ServerArgs),

    /// Mount a mirrored directory
    #[command(name = "mount")]
    Mount(MountArgs),

    /// Log in and store the issued token
    #[command(name = "login")]
    Login {
        /// Server URL (default: client.remote_url from the configuration)
        #[arg(long, env = "MIRRORFS_REMOTE_URL")]
        remote: Option<String>,

        #[arg(short, long)]
        username: String,

        /// Read from the terminal when omitted
        #[arg(long, env = "MIRRORFS_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Organization management
    #[command(name = "org")]
    Org {
        #[command(subcommand)]
        command: OrgCommand,
    },

    /// User management
    #[command(name = "user")]
    User {
        #[command(subcommand)]
        command: UserCommand,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_files();
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Server(args) => commands::server::run(args, cli.config).await,
        Commands::Mount(args) => commands::mount::run(args, cli.config).await,
        Commands::Login {
            remote,
            username,
            password,
        } => commands::account::login(cli.config, remote, &username, password).await,
        Commands::Org { command } => commands::account::handle_org(command, cli.config).await,
        Commands::User { command } => commands::account::handle_user(command, cli.config).await,
        Commands::Config { command } => commands::config::handle_command(command, cli.config).await,
    }
}

/// `~/.mirrorfs/.env` first, then `./.env`; variables already set win.
fn load_env_files() {
    let _ = dotenvy::from_path(state_dir().join(".env"));
    let _ = dotenvy::dotenv();
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}
