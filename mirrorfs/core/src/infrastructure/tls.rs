// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// TLS material loading
//
// The server presents a PEM certificate/key pair. Clients trust exactly one
// issuing CA supplied by path instead of the system roots.

use std::path::Path;

use anyhow::{Context, Result};
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::domain::config::ServerTlsConfig as ServerTlsPaths;

pub fn server_tls_config(paths: &ServerTlsPaths) -> Result<ServerTlsConfig> {
    let cert = read_pem(&paths.cert_path)?;
    let key = read_pem(&paths.key_path)?;
    Ok(ServerTlsConfig::new().identity(Identity::from_pem(cert, key)))
}

/// Trust `ca_path` only. `domain` overrides the name checked against the
/// server certificate (defaults to the URL host).
pub fn client_tls_config(ca_path: &Path, domain: Option<&str>) -> Result<ClientTlsConfig> {
    let ca = read_pem(ca_path)?;
    let mut config = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca));
    if let Some(domain) = domain {
        config = config.domain_name(domain);
    }
    Ok(config)
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    let pem = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if !pem.windows(11).any(|w| w == b"-----BEGIN ") {
        anyhow::bail!("{} does not contain PEM data", path.display());
    }
    Ok(pem)
}
