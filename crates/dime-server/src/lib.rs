// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! DiME broker internals.
//!
//! The broker accepts many concurrent stream-socket clients, runs a per-client
//! session actor for each, and routes opaque variable payloads between them
//! through a central registry of clients and named groups. Nothing here ever
//! looks inside a payload.
//!
//! Layering, bottom up:
//!
//! - [`envelope`] — the immutable routed-message value shared across mailboxes.
//! - [`registry`] — the serialized directory of clients and groups; all
//!   membership mutation and fanout happens under its single lock.
//! - [`session`] — the per-connection actor (reader / dispatcher / writer).
//! - [`listener`] — endpoint binding and the accept loop, with optional TLS.
//! - [`config`] — CLI-surface resolution into listener/limit settings.
//!
//! The `dime` binary in `src/main.rs` wires these together.

pub mod config;
pub mod envelope;
pub mod listener;
pub mod registry;
pub mod session;
