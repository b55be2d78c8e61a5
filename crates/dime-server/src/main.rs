// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The `dime` broker binary: bind the configured endpoints and route until
//! interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use dime_server::config;
use dime_server::listener;
use dime_server::registry::Registry;
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dime", version, about = "DiME exchange broker")]
struct Args {
    /// Listener endpoint as `proto:address` with proto in {ipc, unix, tcp}
    /// (repeatable). Defaults to the per-user Unix socket when omitted.
    #[arg(short = 'l', long = "listen")]
    listen: Vec<String>,
    /// Legacy protocol selector; only `tcp` is accepted, paired with -p.
    #[arg(short = 'P', long = "protocol")]
    protocol: Option<String>,
    /// Legacy TCP port shorthand; binds 0.0.0.0:<port>.
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,
    /// TLS certificate (PEM). If provided, key must also be provided.
    #[arg(long)]
    tls_cert: Option<PathBuf>,
    /// TLS private key (PEM). If provided, cert must also be provided.
    #[arg(long)]
    tls_key: Option<PathBuf>,
    /// Cap on each frame segment (JSON metadata or binary payload) in bytes.
    #[arg(long, default_value_t = dime_proto::frame::DEFAULT_MAX_SEGMENT_BYTES)]
    max_segment_bytes: usize,
    /// Per-client mailbox cap in envelopes; the oldest undelivered envelope
    /// is dropped on overflow. 0 means unbounded.
    #[arg(long, default_value_t = 8192)]
    mailbox_cap: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let listeners = config::resolve_listeners(&args.listen, args.protocol.as_deref(), args.port)?;
    let tls = config::resolve_tls(args.tls_cert, args.tls_key)?;
    let acceptor = tls.as_ref().map(listener::tls_acceptor).transpose()?;

    let registry = Registry::shared(args.mailbox_cap);

    let mut accept_loops = JoinSet::new();
    for endpoint in &listeners {
        let bound = listener::bind(endpoint).await?;
        info!("dime broker listening on {endpoint}");
        accept_loops.spawn(listener::serve(
            bound,
            acceptor.clone(),
            registry.clone(),
            args.max_segment_bytes,
        ));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
        Some(res) = accept_loops.join_next() => {
            res.context("accept loop task")?
        }
    }
}
