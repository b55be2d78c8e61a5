// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Typed view of the DiME command set.
//!
//! Every request frame carries its command in the JSON metadata object;
//! [`Command::from_meta`] lifts that object into a typed value the broker can
//! dispatch on. Parsing is deliberately shallow: only the fields the broker
//! routes on are validated, everything else in the map stays opaque and is
//! forwarded to receivers untouched.
//!
//! Replies travel the same way — small JSON maps built by the helpers at the
//! bottom of this module. `status: 0` is success, a negative `status` carries
//! a human-readable `error`, and `status > 0` with `meta: true` marks the
//! reserved out-of-band meta frame clients consume transparently.

use crate::frame::MetaMap;
use serde_json::Value;

/// Serialization label assumed when a handshake does not name one.
pub const DEFAULT_SERIALIZATION: &str = "matlab";

/// `status` value reported for protocol errors.
pub const STATUS_PROTOCOL_ERROR: i64 = -1;

/// A parsed client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// First frame on every connection; negotiates the serialization label.
    Handshake {
        /// Requested payload encoding (opaque to the broker).
        serialization: String,
        /// Optional human-readable client name, echoed to receivers as `from`.
        name: Option<String>,
        /// Informational: whether the client believes the transport is TLS.
        tls: bool,
    },
    /// Add the client to each named group, creating groups as needed.
    Join {
        /// Group names; empty is a successful no-op.
        names: Vec<String>,
    },
    /// Remove the client from each named group, destroying emptied groups.
    Leave {
        /// Group names; empty is a successful no-op.
        names: Vec<String>,
    },
    /// Fan the payload out to every current member of a group but the sender.
    Send {
        /// Target group name.
        group: String,
    },
    /// Fan the payload out to every registered client but the sender.
    Broadcast,
    /// Drain up to `n` queued envelopes, then a sentinel frame.
    Sync {
        /// Maximum envelopes to deliver; negative means unlimited.
        n: i64,
    },
    /// Block until the mailbox is non-empty; reply with its length.
    Wait,
    /// List the currently non-empty group names.
    Devices,
}

/// Request parsing failures. These are protocol errors: the broker replies
/// with a negative `status` and the session stays usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// A required field was absent.
    #[error("[CMD_MISSING] missing required field `{0}`")]
    MissingField(&'static str),
    /// A field was present with an unusable type.
    #[error("[CMD_TYPE] field `{field}` has the wrong type (expected {expected})")]
    WrongType {
        /// Offending field name.
        field: &'static str,
        /// What the protocol expects there.
        expected: &'static str,
    },
    /// The `command` value named no known operation.
    #[error("[CMD_UNKNOWN] unknown command `{0}`")]
    Unknown(String),
}

impl Command {
    /// Parse a request from frame metadata.
    pub fn from_meta(meta: &MetaMap) -> Result<Self, CommandError> {
        let command = meta
            .get("command")
            .ok_or(CommandError::MissingField("command"))?
            .as_str()
            .ok_or(CommandError::WrongType {
                field: "command",
                expected: "string",
            })?;
        match command {
            "handshake" => Ok(Command::Handshake {
                serialization: opt_string(meta, "serialization")?
                    .unwrap_or_else(|| DEFAULT_SERIALIZATION.to_owned()),
                name: opt_string(meta, "name")?,
                tls: opt_bool(meta, "tls")?.unwrap_or(false),
            }),
            "join" => Ok(Command::Join {
                names: group_names(meta)?,
            }),
            "leave" => Ok(Command::Leave {
                names: group_names(meta)?,
            }),
            "send" => {
                let group = opt_string(meta, "name")?.ok_or(CommandError::MissingField("name"))?;
                Ok(Command::Send { group })
            }
            "broadcast" => Ok(Command::Broadcast),
            "sync" => {
                let n = match meta.get("n") {
                    None => -1,
                    Some(v) => v.as_i64().ok_or(CommandError::WrongType {
                        field: "n",
                        expected: "integer",
                    })?,
                };
                Ok(Command::Sync { n })
            }
            "wait" => Ok(Command::Wait),
            "devices" => Ok(Command::Devices),
            other => Err(CommandError::Unknown(other.to_owned())),
        }
    }
}

/// Read `name` as either a single string or an array of strings.
fn group_names(meta: &MetaMap) -> Result<Vec<String>, CommandError> {
    const EXPECTED: &str = "string or array of strings";
    match meta.get("name") {
        None => Err(CommandError::MissingField("name")),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_owned).ok_or(CommandError::WrongType {
                    field: "name",
                    expected: EXPECTED,
                })
            })
            .collect(),
        Some(_) => Err(CommandError::WrongType {
            field: "name",
            expected: EXPECTED,
        }),
    }
}

fn opt_string(meta: &MetaMap, field: &'static str) -> Result<Option<String>, CommandError> {
    match meta.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(CommandError::WrongType {
            field,
            expected: "string",
        }),
    }
}

fn opt_bool(meta: &MetaMap, field: &'static str) -> Result<Option<bool>, CommandError> {
    match meta.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(CommandError::WrongType {
            field,
            expected: "boolean",
        }),
    }
}

/// `{status: 0}` — the plain success reply and the `sync` sentinel.
///
/// The sentinel property is the *absence* of `varname`, which this map
/// satisfies; receivers stop reading the sync stream when they see it.
pub fn ok_reply() -> MetaMap {
    let mut m = MetaMap::new();
    m.insert("status".into(), Value::from(0));
    m
}

/// `{status: <negative>, error: <message>}` — protocol error reply.
pub fn error_reply(message: &str) -> MetaMap {
    let mut m = MetaMap::new();
    m.insert("status".into(), Value::from(STATUS_PROTOCOL_ERROR));
    m.insert("error".into(), Value::from(message));
    m
}

/// Successful handshake reply carrying the negotiated serialization label.
pub fn handshake_reply(serialization: &str) -> MetaMap {
    let mut m = ok_reply();
    m.insert("serialization".into(), Value::from(serialization));
    m
}

/// Reply to `devices`: the sorted list of non-empty group names.
pub fn devices_reply(devices: &[String]) -> MetaMap {
    let mut m = ok_reply();
    m.insert(
        "devices".into(),
        Value::Array(devices.iter().map(|d| Value::from(d.as_str())).collect()),
    );
    m
}

/// Reply to `wait`: the mailbox length observed at wake.
pub fn wait_reply(n: usize) -> MetaMap {
    let mut m = ok_reply();
    m.insert("n".into(), Value::from(n as u64));
    m
}

/// Numeric `status` of a reply, if present and integral.
pub fn status_of(meta: &MetaMap) -> Option<i64> {
    meta.get("status").and_then(Value::as_i64)
}

/// Whether `meta` is a broker-to-client meta frame (`status > 0`,
/// `meta: true`). Clients consume these outside the normal reply flow.
pub fn is_meta_frame(meta: &MetaMap) -> bool {
    status_of(meta).is_some_and(|s| s > 0)
        && meta.get("meta").and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use super::*;
    use serde_json::json;

    fn meta(v: Value) -> MetaMap {
        match v {
            Value::Object(m) => m,
            other => panic!("expected object literal, got {other}"),
        }
    }

    #[test]
    fn handshake_defaults_serialization_and_tls() {
        let cmd = Command::from_meta(&meta(json!({"command": "handshake"}))).unwrap();
        assert_eq!(
            cmd,
            Command::Handshake {
                serialization: "matlab".into(),
                name: None,
                tls: false,
            }
        );
    }

    #[test]
    fn handshake_keeps_requested_label_and_name() {
        let cmd = Command::from_meta(&meta(json!({
            "command": "handshake",
            "serialization": "pickle",
            "name": "solver-1",
            "tls": true,
        })))
        .unwrap();
        assert_eq!(
            cmd,
            Command::Handshake {
                serialization: "pickle".into(),
                name: Some("solver-1".into()),
                tls: true,
            }
        );
    }

    #[test]
    fn join_accepts_single_string_name() {
        let cmd = Command::from_meta(&meta(json!({"command": "join", "name": "g1"}))).unwrap();
        assert_eq!(cmd, Command::Join { names: vec!["g1".into()] });
    }

    #[test]
    fn join_accepts_array_of_names() {
        let cmd =
            Command::from_meta(&meta(json!({"command": "leave", "name": ["g1", "g2"]}))).unwrap();
        assert_eq!(
            cmd,
            Command::Leave {
                names: vec!["g1".into(), "g2".into()]
            }
        );
    }

    #[test]
    fn join_accepts_empty_array() {
        let cmd = Command::from_meta(&meta(json!({"command": "join", "name": []}))).unwrap();
        assert_eq!(cmd, Command::Join { names: vec![] });
    }

    #[test]
    fn join_rejects_missing_name() {
        let err = Command::from_meta(&meta(json!({"command": "join"}))).unwrap_err();
        assert_eq!(err, CommandError::MissingField("name"));
    }

    #[test]
    fn join_rejects_non_string_array_entries() {
        let err = Command::from_meta(&meta(json!({"command": "join", "name": ["g1", 3]})))
            .unwrap_err();
        assert!(matches!(err, CommandError::WrongType { field: "name", .. }));
    }

    #[test]
    fn send_requires_group_name() {
        let err = Command::from_meta(&meta(json!({"command": "send", "varname": "x"})))
            .unwrap_err();
        assert_eq!(err, CommandError::MissingField("name"));
    }

    #[test]
    fn sync_defaults_to_unlimited() {
        let cmd = Command::from_meta(&meta(json!({"command": "sync"}))).unwrap();
        assert_eq!(cmd, Command::Sync { n: -1 });
    }

    #[test]
    fn sync_rejects_non_integer_n() {
        let err = Command::from_meta(&meta(json!({"command": "sync", "n": "three"}))).unwrap_err();
        assert!(matches!(err, CommandError::WrongType { field: "n", .. }));
    }

    #[test]
    fn unknown_command_is_reported_by_name() {
        let err = Command::from_meta(&meta(json!({"command": "frobnicate"}))).unwrap_err();
        assert_eq!(err, CommandError::Unknown("frobnicate".into()));
    }

    #[test]
    fn command_must_be_a_string() {
        let err = Command::from_meta(&meta(json!({"command": 7}))).unwrap_err();
        assert!(matches!(err, CommandError::WrongType { field: "command", .. }));
    }

    #[test]
    fn meta_frame_predicate_requires_positive_status_and_flag() {
        assert!(is_meta_frame(&meta(json!({"status": 1, "meta": true}))));
        assert!(!is_meta_frame(&meta(json!({"status": 0, "meta": true}))));
        assert!(!is_meta_frame(&meta(json!({"status": 1}))));
        assert!(!is_meta_frame(&error_reply("nope")));
    }

    #[test]
    fn error_reply_carries_message_and_negative_status() {
        let m = error_reply("unknown command `frobnicate`");
        assert_eq!(status_of(&m), Some(STATUS_PROTOCOL_ERROR));
        assert_eq!(m["error"], json!("unknown command `frobnicate`"));
    }
}
