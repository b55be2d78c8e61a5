// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-connection client session actor.
//!
//! Each accepted socket gets one [`run`] call, which spawns the session's
//! three duties as tasks:
//!
//! - **reader** — socket bytes → accumulator → complete frames → inbound queue;
//! - **dispatcher** — inbound frames through the NEW → READY state machine
//!   into registry operations and replies;
//! - **writer** — outbound queue → socket, in enqueue order.
//!
//! The first task to finish decides the session's fate: reader EOF or framing
//! error, dispatcher bail-out, or a failed socket write all tear the whole
//! session down. Teardown aborts the stragglers (which is also what cancels a
//! dispatcher parked in `wait`), unregisters the client, and gives the writer
//! a short grace period to flush queued replies.
//!
//! Framing errors close the connection without a reply; protocol errors get a
//! negative-`status` reply and leave the session usable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use dime_proto::command::{self, Command};
use dime_proto::frame::{self, Frame, MetaMap};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::debug;

use crate::envelope::Envelope;
use crate::registry::{ClientId, SharedRegistry};

/// Inbound frame queue depth. A dispatcher parked in `wait` leaves at most
/// this many commands buffered before the reader stops pulling bytes off the
/// socket, which is the per-client backpressure on the request side.
const INBOUND_QUEUE: usize = 64;

/// Outbound frame queue depth between dispatcher and writer.
const OUTBOUND_QUEUE: usize = 256;

/// Grace period for flushing queued outbound frames at teardown.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Identity established by a successful handshake.
struct Identity {
    id: ClientId,
    name: Option<String>,
}

/// Drive one client connection to completion.
///
/// Returns `Ok(())` on an orderly close (EOF from the peer) and an error for
/// framing violations or I/O failures. Either way the client is unregistered
/// and its mailbox discarded before this returns.
pub async fn run<S>(stream: S, registry: SharedRegistry, max_segment: usize) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
    let (in_tx, in_rx) = mpsc::channel::<Frame>(INBOUND_QUEUE);

    // 0 = handshake never completed; ids start at 1.
    let registered = Arc::new(AtomicU64::new(0));

    let mut writer_task = tokio::spawn(write_outbound(writer, out_rx));
    let mut reader_task = tokio::spawn(read_frames(reader, in_tx, max_segment));
    let mut dispatcher_task = tokio::spawn(dispatch(
        in_rx,
        out_tx,
        registry.clone(),
        Arc::clone(&registered),
    ));

    enum Ended {
        Reader,
        Dispatcher,
        Writer,
    }

    let (ended, result) = tokio::select! {
        res = &mut reader_task => (Ended::Reader, flatten("reader", res)),
        res = &mut dispatcher_task => (Ended::Dispatcher, flatten("dispatcher", res)),
        res = &mut writer_task => (Ended::Writer, flatten_void("writer", res)),
    };

    // Aborting a finished task is a no-op; this also cancels a `wait` parked
    // in the dispatcher when the peer hung up.
    reader_task.abort();
    dispatcher_task.abort();

    // Unregister first so no further envelope lands in a dead mailbox.
    let id = registered.load(Ordering::Acquire);
    if id != 0 {
        registry.lock().await.unregister(id);
    }

    // Dispatcher gone means the outbound queue is closed; let the writer
    // drain what it can, then force-cancel slow or broken peers.
    if !matches!(ended, Ended::Writer)
        && tokio::time::timeout(FLUSH_TIMEOUT, &mut writer_task)
            .await
            .is_err()
    {
        writer_task.abort();
    }

    result
}

/// Map a task join result onto the session result, treating cancellation as
/// an orderly end.
fn flatten(name: &'static str, res: Result<Result<()>, JoinError>) -> Result<()> {
    match res {
        Ok(inner) => inner,
        Err(err) if err.is_cancelled() => Ok(()),
        Err(err) => Err(anyhow!("{name} task failed: {err}")),
    }
}

fn flatten_void(name: &'static str, res: Result<(), JoinError>) -> Result<()> {
    flatten(name, res.map(Ok))
}

/// Reader duty: accumulate socket bytes and push complete frames inbound.
///
/// Ends with `Ok` on EOF (or when the dispatcher has gone away) and with an
/// error on I/O failure or any framing violation. Framing violations get no
/// reply on purpose.
async fn read_frames<R>(mut reader: R, in_tx: mpsc::Sender<Frame>, max_segment: usize) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    let mut acc: Vec<u8> = Vec::with_capacity(32 * 1024);
    loop {
        let n = reader.read(&mut buf).await.context("socket read")?;
        if n == 0 {
            return Ok(());
        }
        acc.extend_from_slice(&buf[..n]);
        while let Some(frame) = frame::try_extract(&mut acc, max_segment)? {
            if in_tx.send(frame).await.is_err() {
                return Ok(());
            }
        }
    }
}

/// Writer duty: outbound frames to the socket in enqueue order. A failed
/// write ends the session (transient I/O errors close the connection).
async fn write_outbound<W>(mut writer: W, mut out_rx: mpsc::Receiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(wire) = out_rx.recv().await {
        if writer.write_all(&wire).await.is_err() {
            break;
        }
    }
}

/// Dispatcher duty: the per-client protocol state machine.
///
/// Commands are processed strictly in arrival order. `registered` publishes
/// the client id to the teardown path the moment the handshake commits.
async fn dispatch(
    mut in_rx: mpsc::Receiver<Frame>,
    out_tx: mpsc::Sender<Vec<u8>>,
    registry: SharedRegistry,
    registered: Arc<AtomicU64>,
) -> Result<()> {
    let mut identity: Option<Identity> = None;
    while let Some(frame) = in_rx.recv().await {
        let cmd = match Command::from_meta(&frame.meta) {
            Ok(cmd) => cmd,
            Err(err) => {
                reply(&out_tx, &command::error_reply(&err.to_string())).await?;
                continue;
            }
        };
        let Some(ident) = identity.as_ref() else {
            // NEW state: only a handshake moves the session forward
            if let Command::Handshake {
                serialization,
                name,
                tls,
            } = cmd
            {
                let id = registry.lock().await.register(name.clone());
                registered.store(id, Ordering::Release);
                debug!(client = id, serialization = %serialization, tls, "handshake complete");
                identity = Some(Identity { id, name });
                reply(&out_tx, &command::handshake_reply(&serialization)).await?;
            } else {
                reply(
                    &out_tx,
                    &command::error_reply("handshake required before any other command"),
                )
                .await?;
            }
            continue;
        };
        handle_ready(ident, cmd, frame, &out_tx, &registry).await?;
    }
    Ok(())
}

/// Handle one command in the READY state.
async fn handle_ready(
    ident: &Identity,
    cmd: Command,
    frame: Frame,
    out_tx: &mpsc::Sender<Vec<u8>>,
    registry: &SharedRegistry,
) -> Result<()> {
    match cmd {
        Command::Handshake { .. } => {
            reply(out_tx, &command::error_reply("handshake already complete")).await
        }
        Command::Join { names } => {
            registry.lock().await.join(ident.id, &names);
            reply(out_tx, &command::ok_reply()).await
        }
        Command::Leave { names } => {
            registry.lock().await.leave(ident.id, &names);
            reply(out_tx, &command::ok_reply()).await
        }
        Command::Send { group } => {
            let envelope = Arc::new(Envelope::from_request(
                frame.meta,
                frame.payload,
                ident.id,
                ident.name.as_deref(),
            ));
            registry.lock().await.route_group(&group, &envelope);
            reply(out_tx, &command::ok_reply()).await
        }
        Command::Broadcast => {
            let envelope = Arc::new(Envelope::from_request(
                frame.meta,
                frame.payload,
                ident.id,
                ident.name.as_deref(),
            ));
            registry.lock().await.route_broadcast(&envelope);
            reply(out_tx, &command::ok_reply()).await
        }
        Command::Sync { n } => {
            let envelopes = registry.lock().await.drain(ident.id, n);
            for envelope in envelopes {
                let wire = envelope.encode().context("encode delivery frame")?;
                send_wire(out_tx, wire).await?;
            }
            // sentinel: a frame whose JSON lacks `varname`
            reply(out_tx, &command::ok_reply()).await
        }
        Command::Wait => {
            let queued = wait_nonempty(ident.id, registry).await?;
            reply(out_tx, &command::wait_reply(queued)).await
        }
        Command::Devices => {
            let devices = registry.lock().await.devices();
            reply(out_tx, &command::devices_reply(&devices)).await
        }
    }
}

/// Park until the client's mailbox is non-empty and return its length.
///
/// The wake handle is grabbed under the registry lock and awaited outside
/// it; `Notify`'s stored permit covers the race where the envelope lands in
/// between. Spurious wakeups re-check the length.
async fn wait_nonempty(id: ClientId, registry: &SharedRegistry) -> Result<usize> {
    loop {
        let wake = {
            let reg = registry.lock().await;
            let Some((len, wake)) = reg.mailbox_status(id) else {
                bail!("client unregistered while waiting");
            };
            if len > 0 {
                return Ok(len);
            }
            wake
        };
        wake.notified().await;
    }
}

async fn reply(out_tx: &mpsc::Sender<Vec<u8>>, meta: &MetaMap) -> Result<()> {
    let wire = frame::encode(meta, &[]).context("encode reply frame")?;
    send_wire(out_tx, wire).await
}

async fn send_wire(out_tx: &mpsc::Sender<Vec<u8>>, wire: Vec<u8>) -> Result<()> {
    out_tx
        .send(wire)
        .await
        .map_err(|_| anyhow!("outbound queue closed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use dime_proto::frame::DEFAULT_MAX_SEGMENT_BYTES;
    use serde_json::json;

    fn meta(v: serde_json::Value) -> MetaMap {
        match v {
            serde_json::Value::Object(m) => m,
            other => panic!("expected object literal, got {other}"),
        }
    }

    async fn write_frame(
        client: &mut tokio::io::DuplexStream,
        meta: &MetaMap,
        payload: &[u8],
    ) {
        let wire = frame::encode(meta, payload).unwrap();
        client.write_all(&wire).await.unwrap();
    }

    async fn read_frame(client: &mut tokio::io::DuplexStream) -> Frame {
        let mut acc = Vec::new();
        let mut buf = vec![0u8; 4096];
        loop {
            if let Some(frame) = frame::try_extract(&mut acc, DEFAULT_MAX_SEGMENT_BYTES).unwrap() {
                return frame;
            }
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "peer closed before a full frame arrived");
            acc.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn handshake_registers_and_replies_with_label() {
        let registry = Registry::shared(0);
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let session = tokio::spawn(run(server, registry.clone(), DEFAULT_MAX_SEGMENT_BYTES));

        write_frame(
            &mut client,
            &meta(json!({"command": "handshake", "serialization": "pickle", "tls": false})),
            &[],
        )
        .await;
        let reply = read_frame(&mut client).await;
        assert_eq!(reply.meta["status"], json!(0));
        assert_eq!(reply.meta["serialization"], json!("pickle"));
        assert_eq!(registry.lock().await.client_count(), 1);

        drop(client);
        session.await.unwrap().unwrap();
        assert_eq!(registry.lock().await.client_count(), 0, "disconnect unregisters");
    }

    #[tokio::test]
    async fn command_before_handshake_is_rejected_but_session_survives() {
        let registry = Registry::shared(0);
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let session = tokio::spawn(run(server, registry.clone(), DEFAULT_MAX_SEGMENT_BYTES));

        write_frame(&mut client, &meta(json!({"command": "devices"})), &[]).await;
        let rejected = read_frame(&mut client).await;
        assert!(rejected.meta["status"].as_i64().unwrap() < 0);
        assert!(rejected.meta["error"].as_str().unwrap().contains("handshake"));

        // the same connection can still handshake afterwards
        write_frame(&mut client, &meta(json!({"command": "handshake"})), &[]).await;
        let ok = read_frame(&mut client).await;
        assert_eq!(ok.meta["status"], json!(0));
        assert_eq!(ok.meta["serialization"], json!("matlab"));

        drop(client);
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn framing_error_closes_without_reply() {
        let registry = Registry::shared(0);
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let session = tokio::spawn(run(server, registry.clone(), DEFAULT_MAX_SEGMENT_BYTES));

        client.write_all(b"NOPEnope....").await.unwrap();
        let res = session.await.unwrap();
        assert!(res.is_err(), "bad magic must be fatal to the connection");

        // no reply frame was produced; the stream just ends
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
