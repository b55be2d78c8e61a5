// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Endpoint binding and the accept loop.
//!
//! One [`serve`] task runs per configured endpoint. Every accepted
//! connection gets its own session task; a session failing never takes the
//! accept loop down with it. TLS, when configured, wraps TCP connections
//! before the session sees any bytes and is invisible to the protocol.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use dime_proto::Endpoint;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_rustls::rustls::ServerConfig as RustlsServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::warn;

use crate::config::TlsSettings;
use crate::registry::SharedRegistry;
use crate::session;

/// A bound, not-yet-serving listener.
pub enum Listener {
    /// Plain TCP listener (optionally TLS-wrapped by [`serve`]).
    Tcp(TcpListener),
    /// Unix-domain stream listener.
    Unix(UnixListener),
}

/// Bind an endpoint. For Unix endpoints a stale socket file from a previous
/// run is removed first.
pub async fn bind(endpoint: &Endpoint) -> Result<Listener> {
    match endpoint {
        Endpoint::Unix(path) => {
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)
                .with_context(|| format!("bind unix socket {}", path.display()))?;
            Ok(Listener::Unix(listener))
        }
        Endpoint::Tcp(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("bind tcp listener {addr}"))?;
            Ok(Listener::Tcp(listener))
        }
    }
}

/// Assemble a TLS acceptor from a PEM certificate chain and private key.
pub fn tls_acceptor(settings: &TlsSettings) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(&settings.cert)
            .with_context(|| format!("open tls certificate {}", settings.cert.display()))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .context("read tls certificate chain")?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(&settings.key)
            .with_context(|| format!("open tls key {}", settings.key.display()))?,
    ))
    .context("read tls private key")?
    .ok_or_else(|| anyhow!("no private key found in {}", settings.key.display()))?;
    let config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("assemble tls server config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Accept connections forever, spawning one session per connection.
///
/// Returns only on accept failure, which is fatal for this endpoint. TLS is
/// applied to TCP connections only; Unix endpoints are local and unwrapped.
pub async fn serve(
    listener: Listener,
    tls: Option<TlsAcceptor>,
    registry: SharedRegistry,
    max_segment: usize,
) -> Result<()> {
    match listener {
        Listener::Unix(listener) => loop {
            let (stream, _) = listener.accept().await.context("accept unix connection")?;
            spawn_session(stream, &registry, max_segment);
        },
        Listener::Tcp(listener) => loop {
            let (stream, peer) = listener.accept().await.context("accept tcp connection")?;
            match &tls {
                None => spawn_session(stream, &registry, max_segment),
                Some(acceptor) => {
                    let acceptor = acceptor.clone();
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(stream) => {
                                if let Err(err) = session::run(stream, registry, max_segment).await
                                {
                                    warn!(?err, %peer, "session ended with error");
                                }
                            }
                            Err(err) => warn!(?err, %peer, "tls handshake failed"),
                        }
                    });
                }
            }
        },
    }
}

fn spawn_session<S>(stream: S, registry: &SharedRegistry, max_segment: usize)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let registry = registry.clone();
    tokio::spawn(async move {
        if let Err(err) = session::run(stream, registry, max_segment).await {
            warn!(?err, "session ended with error");
        }
    });
}
