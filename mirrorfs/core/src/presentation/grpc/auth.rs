// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Bearer-token authentication for the mirror service.
//!
//! The interceptor runs before any handler. A valid token puts the caller's
//! [`CallerIdentity`] into the request extensions; anything else ends the
//! call with `UNAUTHENTICATED` and the handler never runs.

use tonic::service::Interceptor;
use tonic::{Request, Status};
use tracing::debug;

use crate::domain::identity::CallerIdentity;
use crate::infrastructure::auth::TokenService;

const BEARER_PREFIX: &str = "Bearer ";

#[derive(Clone)]
pub struct AuthInterceptor {
    tokens: TokenService,
}

impl AuthInterceptor {
    pub fn new(tokens: TokenService) -> Self {
        Self { tokens }
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let header = request
            .metadata()
            .get("authorization")
            .ok_or_else(|| Status::unauthenticated("missing authorization header"))?
            .to_str()
            .map_err(|_| Status::unauthenticated("malformed authorization header"))?;
        let token = header
            .strip_prefix(BEARER_PREFIX)
            .ok_or_else(|| Status::unauthenticated("expected a bearer token"))?
            .trim();

        let caller = self.tokens.verify(token).map_err(|e| {
            debug!(error = %e, "Rejected token");
            Status::unauthenticated("invalid or expired token")
        })?;
        request.extensions_mut().insert(caller);
        Ok(request)
    }
}

/// The identity the interceptor attached to `request`.
pub fn caller<T>(request: &Request<T>) -> Result<CallerIdentity, Status> {
    request
        .extensions()
        .get::<CallerIdentity>()
        .cloned()
        .ok_or_else(|| Status::unauthenticated("not logged in"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tonic::Code;

    fn tokens() -> TokenService {
        TokenService::new(b"secret", Duration::from_secs(60)).unwrap()
    }

    fn request_with(header: &str) -> Request<()> {
        let mut request = Request::new(());
        request.metadata_mut().insert("authorization", header.parse().unwrap());
        request
    }

    #[test]
    fn test_valid_token_attaches_caller() {
        let token = tokens().issue(&CallerIdentity::new("alice", "acme", "eng")).unwrap();
        let mut interceptor = AuthInterceptor::new(tokens());
        let request = interceptor.call(request_with(&format!("Bearer {token}"))).unwrap();
        assert_eq!(caller(&request).unwrap().root_path(), "/acme/eng");
    }

    #[test]
    fn test_missing_or_bad_tokens_are_unauthenticated() {
        let mut interceptor = AuthInterceptor::new(tokens());
        let cases = [
            interceptor.call(Request::new(())),
            interceptor.call(request_with("Basic abc")),
            interceptor.call(request_with("Bearer not.a.token")),
        ];
        for result in cases {
            assert_eq!(result.unwrap_err().code(), Code::Unauthenticated);
        }
    }

    #[test]
    fn test_token_from_another_secret_is_rejected() {
        let other = TokenService::new(b"other", Duration::from_secs(60)).unwrap();
        let token = other.issue(&CallerIdentity::new("alice", "acme", "eng")).unwrap();
        let mut interceptor = AuthInterceptor::new(tokens());
        assert!(interceptor.call(request_with(&format!("Bearer {token}"))).is_err());
    }

    #[test]
    fn test_handler_without_interceptor_sees_no_caller() {
        assert_eq!(caller(&Request::new(())).unwrap_err().code(), Code::Unauthenticated);
    }
}
