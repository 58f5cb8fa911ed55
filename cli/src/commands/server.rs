// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `mirrorfs server`
//!
//! Hosts the account and mirror services. With a mount point configured the
//! data directory is also mounted locally; changes made through that mount
//! are published to observers like any RPC mutation.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tokio::net::TcpListener;
use tracing::{info, warn};

use mirrorfs_core::application::mirror::PublishingSink;
use mirrorfs_core::application::root_resolver::RootResolver;
use mirrorfs_core::application::{AccountService, FileMirrorService, LoopbackFs};
use mirrorfs_core::domain::config::{state_dir, NodeConfig, ServerConfig, ServerTlsConfig};
use mirrorfs_core::domain::events::EventPublisher;
use mirrorfs_core::infrastructure::auth::{PasswordHasher, TokenService};
use mirrorfs_core::infrastructure::backing_store::BackingStore;
use mirrorfs_core::infrastructure::event_bus::EventBus;
use mirrorfs_core::infrastructure::fuse;
use mirrorfs_core::infrastructure::repositories::InMemoryUserRepository;
use mirrorfs_core::infrastructure::tls::server_tls_config;
use mirrorfs_core::presentation::grpc::server::{serve, GrpcServices};

#[derive(Args, Debug, Default)]
pub struct ServerArgs {
    /// Directory holding `<org>/<dept>` roots
    #[arg(long, env = "MIRRORFS_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Also mount the data directory here
    #[arg(long)]
    pub mount_point: Option<PathBuf>,

    #[arg(long, env = "MIRRORFS_LISTEN_ADDR")]
    pub listen: Option<SocketAddr>,

    /// PEM certificate; requires --tls-key
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,
}

/// Merge the configuration file with command-line overrides.
pub fn resolve_config(args: ServerArgs, config_path: Option<PathBuf>) -> Result<ServerConfig> {
    let config = NodeConfig::load_or_default(config_path).context("Failed to load configuration")?;
    let mut server = match (config.server, args.data_dir.clone()) {
        (Some(server), _) => server,
        (None, Some(data_dir)) => {
            let mut server = ServerConfig::new(data_dir);
            server.secret_key = std::env::var("MIRRORFS_SECRET_KEY").ok();
            server
        }
        (None, None) => anyhow::bail!("no server configuration: pass --data-dir or add a `server` section"),
    };

    if let Some(data_dir) = args.data_dir {
        server.data_dir = data_dir;
    }
    if args.mount_point.is_some() {
        server.mount_point = args.mount_point;
    }
    if let Some(listen) = args.listen {
        server.listen_addr = listen;
    }
    if let (Some(cert_path), Some(key_path)) = (args.tls_cert, args.tls_key) {
        server.tls = Some(ServerTlsConfig { cert_path, key_path });
    }

    server.validate().context("Configuration validation failed")?;
    Ok(server)
}

pub async fn run(args: ServerArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config = resolve_config(args, config_path)?;
    let secret = config.secret_key.clone().unwrap_or_default();

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {}", config.data_dir.display()))?;
    let data_dir = config
        .data_dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", config.data_dir.display()))?;
    info!(data_dir = %data_dir.display(), "Starting mirrorfs server");

    let tokens = TokenService::new(secret.as_bytes(), Duration::from_secs(config.token_ttl_secs))?;
    let passwords = PasswordHasher::new(secret.as_bytes());
    let repository = InMemoryUserRepository::persistent(state_dir().join("accounts.yaml"))?;
    let accounts = Arc::new(AccountService::new(Arc::new(repository), tokens, passwords, &data_dir));

    let (events, _dispatcher) = EventBus::start(&config.event_bus);
    let mirror = Arc::new(FileMirrorService::new(RootResolver::new(&data_dir), events.clone()));

    let mount = match &config.mount_point {
        Some(mount_point) => {
            let publisher: Arc<dyn EventPublisher> = Arc::new(events.clone());
            let fs = LoopbackFs::new(BackingStore::new(&data_dir), Arc::new(PublishingSink::new(publisher)))?;
            Some(fuse::mount(Arc::new(fs), mount_point, "mirrorfs-server")?)
        }
        None => None,
    };

    let tls = config.tls.as_ref().map(server_tls_config).transpose()?;
    if tls.is_none() {
        warn!("TLS not configured; serving plaintext");
    }
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested");
    };
    let result = serve(listener, GrpcServices { accounts, mirror }, tls, shutdown).await;

    if let Some(mount) = mount {
        tokio::task::spawn_blocking(move || mount.unmount()).await?;
    }
    result
}
