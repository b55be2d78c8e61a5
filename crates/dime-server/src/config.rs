// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! CLI-surface resolution.
//!
//! The binary accepts repeatable `-l proto:address` listeners plus the
//! legacy `-P <proto>` / `-p <port>` TCP shorthand the original tooling
//! shipped with. Everything funnels into plain settings structs here so the
//! rules stay unit-testable away from clap.

use std::path::PathBuf;

use anyhow::{bail, Result};
use dime_proto::{default_socket_path, Endpoint};

/// PEM certificate/key pair for TLS-wrapped TCP listeners.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// Certificate chain (PEM).
    pub cert: PathBuf,
    /// Private key (PEM).
    pub key: PathBuf,
}

/// Resolve the listener set from `-l` values plus the legacy shorthand.
///
/// With no listener flags at all, the broker binds the default Unix socket
/// path. `-P` only ever meant TCP; anything else is a configuration error
/// pointing at the `-l` syntax.
pub fn resolve_listeners(
    listen: &[String],
    protocol: Option<&str>,
    port: Option<u16>,
) -> Result<Vec<Endpoint>> {
    let mut listeners = Vec::with_capacity(listen.len() + 1);
    for spec in listen {
        listeners.push(spec.parse::<Endpoint>()?);
    }
    match (protocol, port) {
        (Some(proto), _) if proto != "tcp" => {
            bail!("legacy -P only supports `tcp`, got `{proto}` (use -l proto:address instead)")
        }
        (Some(_), None) => bail!("legacy -P requires -p <port>"),
        (_, Some(port)) => listeners.push(Endpoint::Tcp(format!("0.0.0.0:{port}"))),
        (None, None) => {}
    }
    if listeners.is_empty() {
        listeners.push(Endpoint::Unix(default_socket_path()));
    }
    Ok(listeners)
}

/// Resolve the TLS flag pair: both paths or neither.
pub fn resolve_tls(cert: Option<PathBuf>, key: Option<PathBuf>) -> Result<Option<TlsSettings>> {
    match (cert, key) {
        (Some(cert), Some(key)) => Ok(Some(TlsSettings { cert, key })),
        (None, None) => Ok(None),
        _ => bail!("must provide both --tls-cert and --tls-key or neither"),
    }
}
