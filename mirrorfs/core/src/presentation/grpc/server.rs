// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! gRPC Server Implementation for mirrorfs
//! Exposes AccountService (Auth, CreateOrg, CreateUser) and MirrorService
//! (every mirrored filesystem operation plus DownloadFile and ObserveFileChanges)

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::transport::{Server, ServerTlsConfig};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::application::account_service::{AccountError, AccountService};
use crate::application::mirror_service::FileMirrorService;
use crate::domain::attributes::SetAttributes;
use crate::infrastructure::proto::pb;
use crate::infrastructure::proto::pb::account_service_server::{AccountService as AccountRpc, AccountServiceServer};
use crate::infrastructure::proto::pb::mirror_service_server::{MirrorService as MirrorRpc, MirrorServiceServer};
use crate::presentation::grpc::auth::{caller, AuthInterceptor};

/// Events buffered per observer stream before the forwarder waits on the client.
const OBSERVE_BUFFER: usize = 16;

fn account_status(err: AccountError) -> Status {
    let message = err.to_string();
    match err {
        AccountError::Validation(_) => Status::invalid_argument(message),
        AccountError::InvalidCredentials => Status::unauthenticated(message),
        AccountError::OrgExists(_) | AccountError::UserExists(_) => Status::already_exists(message),
        AccountError::OrgNotFound(_) | AccountError::DeptNotFound(_) => Status::not_found(message),
        AccountError::Repository(_) | AccountError::Auth(_) | AccountError::Storage(_) => {
            warn!(error = %message, "Account operation failed");
            Status::internal(message)
        }
    }
}

/// Implementation of the AccountService gRPC service
pub struct AccountGrpcService {
    accounts: Arc<AccountService>,
}

impl AccountGrpcService {
    pub fn new(accounts: Arc<AccountService>) -> Self {
        Self { accounts }
    }

    pub fn into_server(self) -> AccountServiceServer<Self> {
        AccountServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl AccountRpc for AccountGrpcService {
    async fn auth(&self, request: Request<pb::AuthRequest>) -> Result<Response<pb::AuthResponse>, Status> {
        let req = request.into_inner();
        let token = self
            .accounts
            .auth(&req.username, &req.password)
            .await
            .map_err(account_status)?;
        Ok(Response::new(pb::AuthResponse { token }))
    }

    async fn create_org(
        &self,
        request: Request<pb::CreateOrgRequest>,
    ) -> Result<Response<pb::CreateOrgResponse>, Status> {
        let req = request.into_inner();
        let org = self
            .accounts
            .create_org(&req.name, &req.dept)
            .await
            .map_err(account_status)?;
        Ok(Response::new(pb::CreateOrgResponse {
            name: org.name,
            dept: org.dept,
        }))
    }

    async fn create_user(
        &self,
        request: Request<pb::CreateUserRequest>,
    ) -> Result<Response<pb::CreateUserResponse>, Status> {
        let req = request.into_inner();
        let user = self
            .accounts
            .create_user(&req.username, &req.password, &req.org, &req.dept)
            .await
            .map_err(account_status)?;
        Ok(Response::new(pb::CreateUserResponse { username: user.username }))
    }
}

/// Implementation of the MirrorService gRPC service
pub struct MirrorGrpcService {
    mirror: Arc<FileMirrorService>,
}

impl MirrorGrpcService {
    pub fn new(mirror: Arc<FileMirrorService>) -> Self {
        Self { mirror }
    }
}

fn offset(value: i64) -> Result<u64, Status> {
    u64::try_from(value).map_err(|_| Status::invalid_argument(format!("negative offset {value}")))
}

#[tonic::async_trait]
impl MirrorRpc for MirrorGrpcService {
    type DownloadFileStream = ReceiverStream<Result<pb::FileChunk, Status>>;
    type ObserveFileChangesStream = ReceiverStream<Result<pb::FileEvent, Status>>;

    async fn lookup(&self, request: Request<pb::LookupRequest>) -> Result<Response<pb::DirEntry>, Status> {
        let caller = caller(&request)?;
        let req = request.into_inner();
        let entry = self.mirror.lookup(&caller, &req.parent, &req.name).await?;
        Ok(Response::new((&entry).into()))
    }

    async fn getattr(&self, request: Request<pb::PathRequest>) -> Result<Response<pb::FileAttr>, Status> {
        let caller = caller(&request)?;
        let attr = self.mirror.getattr(&caller, &request.get_ref().path).await?;
        Ok(Response::new((&attr).into()))
    }

    async fn read_dir_all(
        &self,
        request: Request<pb::PathRequest>,
    ) -> Result<Response<pb::ReadDirAllResponse>, Status> {
        let caller = caller(&request)?;
        let entries = self.mirror.read_dir_all(&caller, &request.get_ref().path).await?;
        Ok(Response::new(pb::ReadDirAllResponse {
            entries: entries.iter().map(Into::into).collect(),
        }))
    }

    async fn mkdir(&self, request: Request<pb::MkdirRequest>) -> Result<Response<pb::DirEntry>, Status> {
        let caller = caller(&request)?;
        let req = request.into_inner();
        let entry = self.mirror.mkdir(&caller, &req.path, req.mode).await?;
        Ok(Response::new((&entry).into()))
    }

    async fn rmdir(&self, request: Request<pb::PathRequest>) -> Result<Response<pb::Empty>, Status> {
        let caller = caller(&request)?;
        self.mirror.rmdir(&caller, &request.get_ref().path).await?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn unlink(&self, request: Request<pb::PathRequest>) -> Result<Response<pb::Empty>, Status> {
        let caller = caller(&request)?;
        self.mirror.unlink(&caller, &request.get_ref().path).await?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn create(&self, request: Request<pb::CreateRequest>) -> Result<Response<pb::DirEntry>, Status> {
        let caller = caller(&request)?;
        let req = request.into_inner();
        let entry = self.mirror.create(&caller, &req.path, req.mode, req.flags).await?;
        Ok(Response::new((&entry).into()))
    }

    async fn symlink(&self, request: Request<pb::LinkRequest>) -> Result<Response<pb::DirEntry>, Status> {
        let caller = caller(&request)?;
        let req = request.into_inner();
        let entry = self.mirror.symlink(&caller, &req.target, &req.path).await?;
        Ok(Response::new((&entry).into()))
    }

    async fn link(&self, request: Request<pb::LinkRequest>) -> Result<Response<pb::DirEntry>, Status> {
        let caller = caller(&request)?;
        let req = request.into_inner();
        let entry = self.mirror.link(&caller, &req.target, &req.path).await?;
        Ok(Response::new((&entry).into()))
    }

    async fn readlink(&self, request: Request<pb::PathRequest>) -> Result<Response<pb::ReadlinkResponse>, Status> {
        let caller = caller(&request)?;
        let target = self.mirror.readlink(&caller, &request.get_ref().path).await?;
        Ok(Response::new(pb::ReadlinkResponse { target }))
    }

    async fn read_all(&self, request: Request<pb::PathRequest>) -> Result<Response<pb::ReadAllResponse>, Status> {
        let caller = caller(&request)?;
        let data = self.mirror.read_all(&caller, &request.get_ref().path).await?;
        Ok(Response::new(pb::ReadAllResponse { data }))
    }

    async fn write(&self, request: Request<pb::WriteRequest>) -> Result<Response<pb::WriteResponse>, Status> {
        let caller = caller(&request)?;
        let req = request.into_inner();
        let offset = offset(req.offset)?;
        let written = self.mirror.write(&caller, &req.path, offset, req.data).await?;
        Ok(Response::new(pb::WriteResponse {
            written: u32::try_from(written).unwrap_or(u32::MAX),
        }))
    }

    async fn rename(&self, request: Request<pb::RenameRequest>) -> Result<Response<pb::Empty>, Status> {
        let caller = caller(&request)?;
        let req = request.into_inner();
        self.mirror.rename(&caller, &req.path, &req.new_path).await?;
        Ok(Response::new(pb::Empty {}))
    }

    async fn setattr(&self, request: Request<pb::SetattrRequest>) -> Result<Response<pb::FileAttr>, Status> {
        let caller = caller(&request)?;
        let req = request.into_inner();
        let changes = SetAttributes::from(&req);
        let attr = self.mirror.setattr(&caller, &req.path, &changes).await?;
        Ok(Response::new((&attr).into()))
    }

    async fn download_file(
        &self,
        request: Request<pb::DownloadRequest>,
    ) -> Result<Response<Self::DownloadFileStream>, Status> {
        let caller = caller(&request)?;
        let req = request.into_inner();
        let mut chunks = self.mirror.download(&caller, &req.path, &req.hash).await?;

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            while let Some(chunk) = chunks.next().await {
                let item = chunk.map(pb::FileChunk::from).map_err(Status::from);
                if tx.send(item).await.is_err() {
                    debug!(path = %req.path, "Download abandoned by client");
                    break;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn observe_file_changes(
        &self,
        request: Request<pb::ObserveRequest>,
    ) -> Result<Response<Self::ObserveFileChangesStream>, Status> {
        let caller = caller(&request)?;
        let mut subscription = self.mirror.observe(&caller)?;
        info!(user = %caller.username, root = %subscription.root(), "Observer connected");

        let (tx, rx) = mpsc::channel(OBSERVE_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = subscription.recv() => {
                        let Some(event) = event else { break };
                        if tx.send(Ok(pb::FileEvent::from(&event))).await.is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
            // Dropping the subscription deregisters the observer
            info!(user = %caller.username, "Observer disconnected");
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Services hosted by one server process.
pub struct GrpcServices {
    pub accounts: Arc<AccountService>,
    pub mirror: Arc<FileMirrorService>,
}

/// Serve both services on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    services: GrpcServices,
    tls: Option<ServerTlsConfig>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    let interceptor = AuthInterceptor::new(services.accounts.tokens().clone());
    let accounts = AccountGrpcService::new(services.accounts).into_server();
    let mirror = MirrorServiceServer::with_interceptor(MirrorGrpcService::new(services.mirror), interceptor);

    let mut builder = Server::builder();
    if let Some(tls) = tls {
        builder = builder.tls_config(tls).context("invalid server TLS configuration")?;
    }

    tracing::info!("Starting mirrorfs gRPC server on {}", addr);

    builder
        .add_service(accounts)
        .add_service(mirror)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
        .context("gRPC server failed")?;

    tracing::info!("gRPC server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::account::ValidationError;
    use tonic::Code;

    #[test]
    fn test_account_errors_map_to_status_codes() {
        let cases = [
            (AccountError::Validation(ValidationError::Missing { field: "name" }), Code::InvalidArgument),
            (AccountError::InvalidCredentials, Code::Unauthenticated),
            (AccountError::OrgExists("acme".into()), Code::AlreadyExists),
            (AccountError::UserExists("alice".into()), Code::AlreadyExists),
            (AccountError::DeptNotFound("acme/ops".into()), Code::NotFound),
        ];
        for (err, code) in cases {
            assert_eq!(account_status(err).code(), code);
        }
    }

    #[test]
    fn test_negative_write_offset_is_invalid() {
        assert_eq!(offset(-5).unwrap_err().code(), Code::InvalidArgument);
    }
}
