// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Rust protocol client for the DiME broker.
//!
//! Speaks the framed DiME wire protocol over a Unix-domain or TCP stream:
//! handshake, group membership, send/broadcast of opaque payloads, and the
//! `sync`/`wait`/`devices` retrieval side. Payload marshalling is the
//! caller's business — this client moves bytes, it does not interpret them.
//!
//! The receive path is layered: broker meta frames (`status > 0`,
//! `meta: true`) are consumed transparently, so callers only ever see their
//! real replies.

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use dime_proto::command;
use dime_proto::frame::{self, Frame, MetaMap, DEFAULT_MAX_SEGMENT_BYTES};
use dime_proto::Endpoint;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

/// One received variable: delivery metadata plus the opaque payload bytes.
#[derive(Debug, Clone)]
pub struct Variable {
    /// Delivery metadata as stored by the broker.
    pub meta: MetaMap,
    /// Payload bytes, byte-identical to what the sender published.
    pub payload: Bytes,
}

impl Variable {
    /// The published variable name.
    pub fn varname(&self) -> Option<&str> {
        self.meta.get("varname").and_then(Value::as_str)
    }

    /// Serialization label recorded by the sender.
    pub fn serialization(&self) -> Option<&str> {
        self.meta.get("serialization").and_then(Value::as_str)
    }

    /// Name of the sending client, when it gave one at handshake.
    pub fn sender(&self) -> Option<&str> {
        self.meta.get("from").and_then(Value::as_str)
    }
}

/// A connected, handshake-complete DiME client.
pub struct DimeClient {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    acc: Vec<u8>,
    serialization: String,
}

impl DimeClient {
    /// Connect anonymously with the default serialization label.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        Self::connect_as(endpoint, None, command::DEFAULT_SERIALIZATION).await
    }

    /// Connect, optionally naming this client, and handshake with the given
    /// serialization label. The broker may negotiate a different label; the
    /// one it replies with is adopted and reported by [`Self::serialization`].
    pub async fn connect_as(
        endpoint: &Endpoint,
        name: Option<&str>,
        serialization: &str,
    ) -> Result<Self> {
        let (reader, writer): (
            Box<dyn AsyncRead + Send + Unpin>,
            Box<dyn AsyncWrite + Send + Unpin>,
        ) = match endpoint {
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .with_context(|| format!("connect unix socket {}", path.display()))?;
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .with_context(|| format!("connect tcp {addr}"))?;
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
        };
        let mut client = Self {
            reader,
            writer,
            acc: Vec::with_capacity(32 * 1024),
            serialization: serialization.to_owned(),
        };

        let mut meta = MetaMap::new();
        meta.insert("command".into(), Value::from("handshake"));
        meta.insert("serialization".into(), Value::from(serialization));
        meta.insert("tls".into(), Value::from(false));
        if let Some(name) = name {
            meta.insert("name".into(), Value::from(name));
        }
        client.send_frame(&meta, &[]).await?;

        let reply = client.recv_reply().await.context("handshake")?;
        if let Some(label) = reply.meta.get("serialization").and_then(Value::as_str) {
            client.serialization = label.to_owned();
        }
        Ok(client)
    }

    /// The serialization label negotiated at handshake.
    pub fn serialization(&self) -> &str {
        &self.serialization
    }

    /// Join one or more named groups.
    pub async fn join(&mut self, groups: &[&str]) -> Result<()> {
        self.membership("join", groups).await
    }

    /// Leave one or more named groups.
    pub async fn leave(&mut self, groups: &[&str]) -> Result<()> {
        self.membership("leave", groups).await
    }

    /// Publish a variable to every member of `group` except this client.
    pub async fn send_var(&mut self, group: &str, varname: &str, payload: &[u8]) -> Result<()> {
        let mut meta = MetaMap::new();
        meta.insert("command".into(), Value::from("send"));
        meta.insert("name".into(), Value::from(group));
        meta.insert("varname".into(), Value::from(varname));
        meta.insert("serialization".into(), Value::from(self.serialization.as_str()));
        self.send_frame(&meta, payload).await?;
        self.recv_reply().await.context("send")?;
        Ok(())
    }

    /// Publish a variable to every other connected client.
    pub async fn broadcast(&mut self, varname: &str, payload: &[u8]) -> Result<()> {
        let mut meta = MetaMap::new();
        meta.insert("command".into(), Value::from("broadcast"));
        meta.insert("varname".into(), Value::from(varname));
        meta.insert("serialization".into(), Value::from(self.serialization.as_str()));
        self.send_frame(&meta, payload).await?;
        self.recv_reply().await.context("broadcast")?;
        Ok(())
    }

    /// Retrieve up to `n` queued variables (negative = everything queued).
    ///
    /// The stream of envelope frames ends with a sentinel frame lacking
    /// `varname`; this returns the envelopes collected up to it.
    pub async fn sync(&mut self, n: i64) -> Result<Vec<Variable>> {
        let mut meta = MetaMap::new();
        meta.insert("command".into(), Value::from("sync"));
        meta.insert("n".into(), Value::from(n));
        self.send_frame(&meta, &[]).await?;

        let mut variables = Vec::new();
        loop {
            let frame = self.next_frame().await?;
            if command::is_meta_frame(&frame.meta) {
                continue;
            }
            if frame.meta.contains_key("varname") {
                variables.push(Variable {
                    meta: frame.meta,
                    payload: frame.payload,
                });
            } else {
                check_status(&frame.meta).context("sync")?;
                return Ok(variables);
            }
        }
    }

    /// Block until this client's mailbox is non-empty; returns its length.
    pub async fn wait(&mut self) -> Result<u64> {
        let mut meta = MetaMap::new();
        meta.insert("command".into(), Value::from("wait"));
        self.send_frame(&meta, &[]).await?;
        let reply = self.recv_reply().await.context("wait")?;
        reply
            .meta
            .get("n")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("wait reply missing `n`"))
    }

    /// List the currently non-empty group names on the broker.
    pub async fn devices(&mut self) -> Result<Vec<String>> {
        let mut meta = MetaMap::new();
        meta.insert("command".into(), Value::from("devices"));
        self.send_frame(&meta, &[]).await?;
        let reply = self.recv_reply().await.context("devices")?;
        let Some(Value::Array(items)) = reply.meta.get("devices") else {
            bail!("devices reply missing `devices` array");
        };
        items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| anyhow!("non-string device name in reply"))
            })
            .collect()
    }

    async fn membership(&mut self, command: &str, groups: &[&str]) -> Result<()> {
        let mut meta = MetaMap::new();
        meta.insert("command".into(), Value::from(command));
        meta.insert(
            "name".into(),
            Value::Array(groups.iter().map(|g| Value::from(*g)).collect()),
        );
        self.send_frame(&meta, &[]).await?;
        self.recv_reply().await.with_context(|| command.to_owned())?;
        Ok(())
    }

    async fn send_frame(&mut self, meta: &MetaMap, payload: &[u8]) -> Result<()> {
        let wire = frame::encode(meta, payload)?;
        self.writer.write_all(&wire).await.context("socket write")?;
        Ok(())
    }

    /// Read the next frame off the wire, buffering partial input.
    async fn next_frame(&mut self) -> Result<Frame> {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            if let Some(frame) = frame::try_extract(&mut self.acc, DEFAULT_MAX_SEGMENT_BYTES)? {
                return Ok(frame);
            }
            let n = self.reader.read(&mut buf).await.context("socket read")?;
            if n == 0 {
                bail!("connection closed by broker");
            }
            self.acc.extend_from_slice(&buf[..n]);
        }
    }

    /// Read the next *reply*, consuming any interleaved meta frames, and
    /// surface negative-`status` replies as errors.
    async fn recv_reply(&mut self) -> Result<Frame> {
        loop {
            let frame = self.next_frame().await?;
            if command::is_meta_frame(&frame.meta) {
                continue;
            }
            check_status(&frame.meta)?;
            return Ok(frame);
        }
    }
}

fn check_status(meta: &MetaMap) -> Result<()> {
    match command::status_of(meta) {
        Some(status) if status < 0 => {
            let message = meta
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unspecified broker error");
            Err(anyhow!("broker error ({status}): {message}"))
        }
        Some(_) => Ok(()),
        None => bail!("reply missing `status`"),
    }
}
