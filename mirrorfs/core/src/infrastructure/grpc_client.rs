// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! gRPC client for the mirror server
//!
//! [`RemoteClient`] is the network implementation of [`RemoteFs`]: every call
//! carries the bearer token and every status is mapped back onto [`FsError`].
//! [`AccountClient`] covers the unauthenticated login and provisioning calls.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tonic::metadata::{AsciiMetadataValue, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Request, Status};
use tracing::{debug, info};

use crate::application::remote::{ChunkStream, EventStream, RemoteFs};
use crate::domain::attributes::{DirEntry, FileAttributes, SetAttributes};
use crate::domain::error::FsError;
use crate::domain::events::FileEvent;
use crate::domain::transfer::Chunk;
use crate::infrastructure::proto::pb;
use crate::infrastructure::proto::pb::account_service_client::AccountServiceClient;
use crate::infrastructure::proto::pb::mirror_service_client::MirrorServiceClient;
use crate::infrastructure::proto::setattr_request;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Bounds each call up to its response headers; streams are not cut off.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a channel to `url`, over TLS when `tls` is given.
pub async fn connect(url: &str, tls: Option<ClientTlsConfig>) -> Result<Channel> {
    let mut endpoint = Endpoint::from_shared(url.to_string())
        .with_context(|| format!("invalid remote URL: {url}"))?
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .tcp_keepalive(Some(KEEPALIVE_INTERVAL))
        .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
        .keep_alive_timeout(KEEPALIVE_TIMEOUT)
        .keep_alive_while_idle(true);
    if let Some(tls) = tls {
        endpoint = endpoint.tls_config(tls).context("invalid TLS configuration")?;
    }
    let channel = endpoint
        .connect()
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    info!(url = %url, "Connected to remote");
    Ok(channel)
}

/// Adds `authorization: Bearer <token>` to every request.
#[derive(Clone)]
pub struct BearerInterceptor {
    header: AsciiMetadataValue,
}

impl BearerInterceptor {
    pub fn new(token: &str) -> Result<Self, FsError> {
        let header = MetadataValue::try_from(format!("Bearer {}", token.trim()))
            .map_err(|_| FsError::Unauthenticated("token contains invalid characters".to_string()))?;
        Ok(Self { header })
    }
}

impl Interceptor for BearerInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        request.metadata_mut().insert("authorization", self.header.clone());
        Ok(request)
    }
}

type MirrorClient = MirrorServiceClient<InterceptedService<Channel, BearerInterceptor>>;

#[derive(Clone)]
pub struct RemoteClient {
    client: MirrorClient,
}

impl RemoteClient {
    pub fn new(channel: Channel, token: &str) -> Result<Self, FsError> {
        let interceptor = BearerInterceptor::new(token)?;
        Ok(Self {
            client: MirrorServiceClient::with_interceptor(channel, interceptor),
        })
    }

    fn client(&self) -> MirrorClient {
        self.client.clone()
    }
}

fn path_request(path: &str) -> pb::PathRequest {
    pb::PathRequest {
        path: path.to_string(),
    }
}

fn entry(response: tonic::Response<pb::DirEntry>) -> Result<DirEntry, FsError> {
    DirEntry::try_from(response.into_inner())
}

#[async_trait]
impl RemoteFs for RemoteClient {
    async fn lookup(&self, parent: &str, name: &str) -> Result<DirEntry, FsError> {
        let request = pb::LookupRequest {
            parent: parent.to_string(),
            name: name.to_string(),
        };
        entry(self.client().lookup(request).await?)
    }

    async fn getattr(&self, path: &str) -> Result<FileAttributes, FsError> {
        let attr = self.client().getattr(path_request(path)).await?.into_inner();
        Ok(attr.into())
    }

    async fn read_dir_all(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let response = self.client().read_dir_all(path_request(path)).await?.into_inner();
        response.entries.into_iter().map(DirEntry::try_from).collect()
    }

    async fn mkdir(&self, path: &str, mode: u32) -> Result<DirEntry, FsError> {
        let request = pb::MkdirRequest {
            path: path.to_string(),
            mode,
        };
        entry(self.client().mkdir(request).await?)
    }

    async fn rmdir(&self, path: &str) -> Result<(), FsError> {
        self.client().rmdir(path_request(path)).await?;
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<(), FsError> {
        self.client().unlink(path_request(path)).await?;
        Ok(())
    }

    async fn create(&self, path: &str, mode: u32, flags: i32) -> Result<DirEntry, FsError> {
        let request = pb::CreateRequest {
            path: path.to_string(),
            mode,
            flags,
        };
        entry(self.client().create(request).await?)
    }

    async fn symlink(&self, target: &str, path: &str) -> Result<DirEntry, FsError> {
        let request = pb::LinkRequest {
            target: target.to_string(),
            path: path.to_string(),
        };
        entry(self.client().symlink(request).await?)
    }

    async fn link(&self, existing: &str, path: &str) -> Result<DirEntry, FsError> {
        let request = pb::LinkRequest {
            target: existing.to_string(),
            path: path.to_string(),
        };
        entry(self.client().link(request).await?)
    }

    async fn readlink(&self, path: &str) -> Result<String, FsError> {
        Ok(self.client().readlink(path_request(path)).await?.into_inner().target)
    }

    async fn read_all(&self, path: &str) -> Result<Vec<u8>, FsError> {
        Ok(self.client().read_all(path_request(path)).await?.into_inner().data)
    }

    async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        let offset = i64::try_from(offset).map_err(|_| FsError::InvalidArgument(format!("offset {offset} too large")))?;
        let request = pb::WriteRequest {
            path: path.to_string(),
            offset,
            data: data.to_vec(),
        };
        let written = self.client().write(request).await?.into_inner().written;
        Ok(written as usize)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        let request = pb::RenameRequest {
            path: from.to_string(),
            new_path: to.to_string(),
        };
        self.client().rename(request).await?;
        Ok(())
    }

    async fn setattr(&self, path: &str, changes: &SetAttributes) -> Result<FileAttributes, FsError> {
        let attr = self.client().setattr(setattr_request(path, changes)).await?.into_inner();
        Ok(attr.into())
    }

    async fn download(&self, path: &str, local_hash: &str) -> Result<ChunkStream, FsError> {
        let request = pb::DownloadRequest {
            path: path.to_string(),
            hash: local_hash.to_string(),
        };
        let stream = self.client().download_file(request).await?.into_inner();
        Ok(stream
            .map(|chunk| chunk.map_err(FsError::from).and_then(Chunk::try_from))
            .boxed())
    }

    async fn observe(&self) -> Result<EventStream, FsError> {
        let stream = self
            .client()
            .observe_file_changes(pb::ObserveRequest {})
            .await?
            .into_inner();
        debug!("Change subscription opened");
        Ok(stream
            .map(|event| event.map_err(FsError::from).and_then(FileEvent::try_from))
            .boxed())
    }
}

/// Login and provisioning calls. No token required.
#[derive(Clone)]
pub struct AccountClient {
    client: AccountServiceClient<Channel>,
}

impl AccountClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: AccountServiceClient::new(channel),
        }
    }

    pub async fn auth(&self, username: &str, password: &str) -> Result<String, FsError> {
        let request = pb::AuthRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        Ok(self.client.clone().auth(request).await?.into_inner().token)
    }

    pub async fn create_org(&self, name: &str, dept: &str) -> Result<pb::CreateOrgResponse, FsError> {
        let request = pb::CreateOrgRequest {
            name: name.to_string(),
            dept: dept.to_string(),
        };
        Ok(self.client.clone().create_org(request).await?.into_inner())
    }

    pub async fn create_user(
        &self,
        username: &str,
        password: &str,
        org: &str,
        dept: &str,
    ) -> Result<pb::CreateUserResponse, FsError> {
        let request = pb::CreateUserRequest {
            username: username.to_string(),
            password: password.to_string(),
            org: org.to_string(),
            dept: dept.to_string(),
        };
        Ok(self.client.clone().create_user(request).await?.into_inner())
    }
}
