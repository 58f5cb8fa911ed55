// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `mirrorfs mount`
//!
//! Mounts the backing directory, mirrors local mutations to the server in
//! the background and replays the server's change stream locally until
//! interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{info, warn};

use mirrorfs_core::application::mirror::{PendingMirrors, RemoteMirror};
use mirrorfs_core::application::remote::RemoteFs;
use mirrorfs_core::application::transfer::StaleCheck;
use mirrorfs_core::application::work_queue::WorkQueue;
use mirrorfs_core::application::{LoopbackFs, RemoteObserver, RemoteSync};
use mirrorfs_core::domain::config::{ClientConfig, NodeConfig};
use mirrorfs_core::infrastructure::backing_store::BackingStore;
use mirrorfs_core::infrastructure::fuse;
use mirrorfs_core::infrastructure::grpc_client::{connect, RemoteClient};
use mirrorfs_core::infrastructure::tls::client_tls_config;

#[derive(Args, Debug, Default)]
pub struct MountArgs {
    /// Local directory holding the mirrored files
    #[arg(long)]
    pub backing_dir: Option<PathBuf>,

    #[arg(long)]
    pub mount_point: Option<PathBuf>,

    /// e.g. https://files.example.com:1054
    #[arg(long, env = "MIRRORFS_REMOTE_URL")]
    pub remote: Option<String>,

    /// CA certificate for the server; plaintext when omitted
    #[arg(long)]
    pub ca_cert: Option<PathBuf>,

    /// Skip pulling the remote tree after mounting
    #[arg(long)]
    pub no_initial_pull: bool,
}

pub fn resolve_config(args: MountArgs, config_path: Option<PathBuf>) -> Result<ClientConfig> {
    let config = NodeConfig::load_or_default(config_path).context("Failed to load configuration")?;
    let mut client = match (config.client, &args) {
        (Some(client), _) => client,
        (
            None,
            MountArgs {
                backing_dir: Some(backing_dir),
                mount_point: Some(mount_point),
                remote: Some(remote),
                ..
            },
        ) => ClientConfig::new(backing_dir, mount_point, remote.as_str()),
        (None, _) => anyhow::bail!(
            "no client configuration: pass --backing-dir, --mount-point and --remote or add a `client` section"
        ),
    };

    if let Some(backing_dir) = args.backing_dir {
        client.backing_dir = backing_dir;
    }
    if let Some(mount_point) = args.mount_point {
        client.mount_point = mount_point;
    }
    if let Some(remote) = args.remote {
        client.remote_url = remote;
    }
    if args.ca_cert.is_some() {
        client.ca_cert_path = args.ca_cert;
    }
    if args.no_initial_pull {
        client.initial_pull = false;
    }

    client.validate().context("Configuration validation failed")?;
    Ok(client)
}

pub fn read_token(path: &Path) -> Result<String> {
    let token = std::fs::read_to_string(path)
        .with_context(|| format!("No token at {}; run `mirrorfs login` first", path.display()))?;
    let token = token.trim();
    if token.is_empty() {
        anyhow::bail!("{} is empty; run `mirrorfs login` again", path.display());
    }
    Ok(token.to_string())
}

/// Open a channel to the configured remote, over TLS when a CA is set.
pub async fn open_channel(config: &ClientConfig) -> Result<Channel> {
    let tls = config
        .ca_cert_path
        .as_deref()
        .map(|ca| client_tls_config(ca, config.tls_domain.as_deref()))
        .transpose()?;
    connect(&config.remote_url, tls).await
}

pub async fn run(args: MountArgs, config_path: Option<PathBuf>) -> Result<()> {
    let config = resolve_config(args, config_path)?;
    let token = read_token(&config.token_path())?;

    std::fs::create_dir_all(&config.backing_dir)
        .with_context(|| format!("Failed to create {}", config.backing_dir.display()))?;
    let backing_dir = config.backing_dir.canonicalize()?;

    let channel = open_channel(&config).await?;
    let remote: Arc<dyn RemoteFs> = Arc::new(RemoteClient::new(channel, &token)?);

    let runtime = Handle::current();
    let queue = Arc::new(WorkQueue::start(
        "mirror",
        &runtime,
        config.mirror.capacity,
        config.mirror.workers,
    ));
    let pending = Arc::new(PendingMirrors::new());
    let store = BackingStore::new(&backing_dir);

    let sink = RemoteMirror::new(remote.clone(), queue.clone(), pending.clone())
        .with_call_timeout(config.mirror.call_timeout());
    let sync = Arc::new(RemoteSync::new(store.clone(), remote, pending));
    let stale_check = StaleCheck::new(sync.clone(), runtime, config.stale_check_timeout());
    let fs = LoopbackFs::new(store, Arc::new(sink))?.with_read_hook(Arc::new(stale_check));
    let mount = fuse::mount(Arc::new(fs), &config.mount_point, "mirrorfs")?;

    if config.initial_pull {
        let sync = sync.clone();
        tokio::spawn(async move {
            if let Err(e) = sync.pull_tree("/").await {
                warn!(error = %e, "Initial pull failed");
            }
        });
    }

    let cancel = CancellationToken::new();
    let observer = Arc::new(RemoteObserver::new(sync)).start(cancel.clone());
    info!(
        mount_point = %config.mount_point.display(),
        remote = %config.remote_url,
        "Mirror running; press Ctrl-C to unmount"
    );

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    cancel.cancel();
    let report = observer.await.context("Observer task panicked")?;
    info!(
        exit = ?report.exit,
        applied = report.applied,
        failed = report.failed,
        "Observer stopped"
    );

    tokio::task::spawn_blocking(move || mount.unmount()).await?;
    queue.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_flags_alone_are_a_complete_configuration() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty.yaml");
        std::fs::write(&empty, "{}\n").unwrap();

        let args = MountArgs {
            backing_dir: Some(dir.path().join("data")),
            mount_point: Some(dir.path().join("mnt")),
            remote: Some("http://127.0.0.1:1054".to_string()),
            no_initial_pull: true,
            ..Default::default()
        };
        let client = resolve_config(args, Some(empty.clone())).unwrap();
        assert_eq!(client.mount_point, dir.path().join("mnt"));
        assert!(!client.initial_pull);

        assert!(resolve_config(MountArgs::default(), Some(empty)).is_err());
    }

    #[test]
    fn test_token_file_must_hold_a_token() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token");
        assert!(read_token(&path).is_err());

        std::fs::write(&path, "\n").unwrap();
        assert!(read_token(&path).is_err());

        std::fs::write(&path, "abc.def.ghi\n").unwrap();
        assert_eq!(read_token(&path).unwrap(), "abc.def.ghi");
    }
}
