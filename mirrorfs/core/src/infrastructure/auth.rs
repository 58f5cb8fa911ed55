// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Credentials: bearer tokens and password hashing.
//!
//! Tokens are HS256 JWTs signed with the server secret. The subject is the
//! username and the caller's organization and department ride along as
//! private claims, so the interceptor can rebuild a [`CallerIdentity`]
//! without a repository lookup. Passwords are stored as hex HMAC-SHA256
//! digests keyed with the same secret.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::domain::identity::CallerIdentity;

pub const TOKEN_ISSUER: &str = "mirrorfs";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("failed to sign token: {0}")]
    Signing(String),

    #[error("secret key must not be empty")]
    EmptySecret,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    org: String,
    dept: String,
    iss: String,
    iat: u64,
    exp: u64,
}

/// Issues and verifies bearer tokens.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: Duration,
}

impl TokenService {
    pub fn new(secret: &[u8], ttl: Duration) -> Result<Self, AuthError> {
        if secret.is_empty() {
            return Err(AuthError::EmptySecret);
        }
        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            ttl,
        })
    }

    pub fn issue(&self, identity: &CallerIdentity) -> Result<String, AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| AuthError::Signing(e.to_string()))?
            .as_secs();
        let claims = Claims {
            sub: identity.username.clone(),
            org: identity.org.clone(),
            dept: identity.dept.clone(),
            iss: TOKEN_ISSUER.to_string(),
            iat: now,
            exp: now + self.ttl.as_secs(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    pub fn verify(&self, token: &str) -> Result<CallerIdentity, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.set_issuer(&[TOKEN_ISSUER]);

        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        Ok(CallerIdentity::new(data.claims.sub, data.claims.org, data.claims.dept))
    }
}

/// Keyed password digests.
#[derive(Clone)]
pub struct PasswordHasher {
    secret: Vec<u8>,
}

impl PasswordHasher {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    fn mac(&self, password: &str) -> HmacSha256 {
        // HMAC accepts keys of any length
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
        mac.update(password.as_bytes());
        mac
    }

    pub fn hash(&self, password: &str) -> String {
        hex::encode(self.mac(password).finalize().into_bytes())
    }

    /// Constant-time comparison against a stored hex digest.
    pub fn verify(&self, stored: &str, password: &str) -> bool {
        match hex::decode(stored) {
            Ok(expected) => self.mac(password).verify_slice(&expected).is_ok(),
            Err(_) => false,
        }
    }
}
