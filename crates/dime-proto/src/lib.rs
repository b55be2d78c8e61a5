// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire schema for the DiME exchange.
//!
//! DiME moves opaque variable payloads between scientific compute clients
//! through a central broker. Everything on the wire is a length-prefixed
//! frame: a 12-byte header (`DiME` magic plus two big-endian `u32` segment
//! lengths), a UTF-8 JSON metadata object, and an opaque binary payload the
//! broker never inspects.
//!
//! This crate is the shared vocabulary of broker and clients:
//!
//! - [`frame`] — the byte-level codec (one-shot encode, incremental decode).
//! - [`command`] — the typed command set parsed from frame metadata, plus
//!   reply-map builders.
//! - [`endpoint`] — `proto:address` endpoint strings for listener and client
//!   configuration.
//!
//! No I/O happens here; both sides feed byte buffers through the codec and
//! keep their sockets to themselves.

pub mod command;
pub mod endpoint;
pub mod frame;

pub use command::{Command, CommandError};
pub use endpoint::{default_socket_path, Endpoint, EndpointError};
pub use frame::{Frame, FrameError, MetaMap};
