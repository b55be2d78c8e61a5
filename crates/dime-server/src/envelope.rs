// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The routed-message value type.
//!
//! An [`Envelope`] is built once from a `send`/`broadcast` request and then
//! shared as `Arc<Envelope>` by every recipient mailbox. It is immutable from
//! construction: the payload [`Bytes`] buffer is never copied per recipient,
//! and it is reclaimed when the last holding mailbox drops it.

use bytes::Bytes;
use dime_proto::frame::{self, FrameError, MetaMap};
use serde_json::Value;

use crate::registry::ClientId;

/// Immutable carrier of one routed message: delivery metadata, opaque
/// payload, and the sender's client id (used to exclude the sender from its
/// own fanout).
#[derive(Debug)]
pub struct Envelope {
    meta: MetaMap,
    payload: Bytes,
    sender: ClientId,
}

impl Envelope {
    /// Build the delivery envelope for a request.
    ///
    /// The metadata map is stored as received — receivers key off the
    /// presence of `varname` — with one broker-normalized addition: `from`
    /// is set to the sender's handshake name when one was given.
    pub fn from_request(
        mut meta: MetaMap,
        payload: Bytes,
        sender: ClientId,
        sender_name: Option<&str>,
    ) -> Self {
        if let Some(name) = sender_name {
            meta.insert("from".into(), Value::from(name));
        }
        Self {
            meta,
            payload,
            sender,
        }
    }

    /// Delivery metadata.
    pub fn meta(&self) -> &MetaMap {
        &self.meta
    }

    /// Opaque payload bytes, shared by reference with every recipient.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Client id of the sender.
    pub fn sender(&self) -> ClientId {
        self.sender
    }

    /// Encode the delivery frame: stored metadata plus the original payload,
    /// byte for byte.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        frame::encode(&self.meta, &self.payload)
    }
}
