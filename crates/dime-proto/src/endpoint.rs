// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Endpoint strings: `proto:address`.
//!
//! Accepted protocols are `unix` and its alias `ipc` (filesystem path) and
//! `tcp` (`host:port`). The broker binds listeners from these; clients dial
//! them.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A parsed listener/dial target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix-domain stream socket at a filesystem path (`unix:` or `ipc:`).
    Unix(PathBuf),
    /// TCP stream socket at `host:port`.
    Tcp(String),
}

/// Endpoint string rejection reasons.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    /// Input did not match `proto:address`.
    #[error("[ENDPOINT_SYNTAX] expected `proto:address`, got `{0}`")]
    Syntax(String),
    /// Protocol other than `ipc`, `unix`, or `tcp`.
    #[error("[ENDPOINT_PROTO] unsupported protocol `{0}` (expected ipc, unix, or tcp)")]
    UnsupportedProto(String),
    /// TCP address was not `host:port` with a valid port.
    #[error("[ENDPOINT_ADDR] tcp address must be `host:port`, got `{0}`")]
    TcpAddr(String),
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((proto, addr)) = s.split_once(':') else {
            return Err(EndpointError::Syntax(s.to_owned()));
        };
        if addr.is_empty() {
            return Err(EndpointError::Syntax(s.to_owned()));
        }
        match proto {
            "ipc" | "unix" => Ok(Endpoint::Unix(PathBuf::from(addr))),
            "tcp" => {
                let Some((host, port)) = addr.rsplit_once(':') else {
                    return Err(EndpointError::TcpAddr(addr.to_owned()));
                };
                if host.is_empty() || port.parse::<u16>().is_err() {
                    return Err(EndpointError::TcpAddr(addr.to_owned()));
                }
                Ok(Endpoint::Tcp(addr.to_owned()))
            }
            other => Err(EndpointError::UnsupportedProto(other.to_owned())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

/// Default Unix socket path for the broker.
///
/// Prefers a per-user runtime dir (XDG_RUNTIME_DIR) and falls back to `/tmp`
/// when unavailable.
pub fn default_socket_path() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("dime.sock")
}
