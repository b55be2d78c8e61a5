// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! DiME frame codec.
//!
//! Wire layout, big-endian throughout:
//!
//! | offset | size       | meaning                     |
//! |--------|------------|-----------------------------|
//! | 0      | 4          | ASCII magic `DiME`          |
//! | 4      | 4          | `json_len` (u32)            |
//! | 8      | 4          | `bin_len` (u32)             |
//! | 12     | `json_len` | UTF-8 JSON object           |
//! | 12+j   | `bin_len`  | opaque payload              |
//!
//! Decoding is incremental: callers append raw socket bytes to an
//! accumulator and call [`try_extract`] until it returns `None`. A complete
//! frame is drained from the accumulator; partial input is left untouched.
//! Any [`FrameError`] is unrecoverable for the connection that produced it.

use bytes::Bytes;
use serde_json::Value;

/// ASCII magic opening every DiME frame.
pub const MAGIC: [u8; 4] = *b"DiME";

/// Fixed header size: magic + `json_len` + `bin_len`.
pub const HEADER_BYTES: usize = 12;

/// Default cap applied to each segment length (`json_len`, `bin_len`).
pub const DEFAULT_MAX_SEGMENT_BYTES: usize = 512 * 1024 * 1024;

/// JSON metadata map carried by every frame.
pub type MetaMap = serde_json::Map<String, Value>;

/// One decoded DiME frame: metadata object plus opaque payload.
///
/// The payload is [`Bytes`] so downstream consumers (mailbox fanout in the
/// broker) can share one buffer without copying.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// JSON metadata object.
    pub meta: MetaMap,
    /// Opaque binary payload; never interpreted by the broker.
    pub payload: Bytes,
}

/// Framing failures. All of them are fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The first four bytes were not `DiME`.
    #[error("[FRAME_BAD_MAGIC] expected b\"DiME\", got {0:02x?}")]
    BadMagic([u8; 4]),
    /// A declared segment length exceeded the configured cap.
    #[error("[FRAME_TOO_LARGE] segment lengths json={json_len} bin={bin_len} exceed cap {max}")]
    SegmentTooLarge {
        /// Declared JSON segment length.
        json_len: u64,
        /// Declared binary segment length.
        bin_len: u64,
        /// Cap the lengths were checked against.
        max: usize,
    },
    /// The JSON segment failed to parse.
    #[error("[FRAME_BAD_JSON] metadata segment is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The JSON segment parsed to something other than an object.
    #[error("[FRAME_NOT_OBJECT] metadata segment is not a JSON object")]
    NotAnObject,
}

/// Encode a metadata map and payload into one wire-ready buffer.
///
/// Header, JSON, and payload are emitted as a single logical write so the
/// caller can hand the result straight to its socket.
pub fn encode(meta: &MetaMap, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let json = serde_json::to_vec(meta)?;
    let json_len = u32::try_from(json.len());
    let bin_len = u32::try_from(payload.len());
    let (Ok(json_len), Ok(bin_len)) = (json_len, bin_len) else {
        return Err(FrameError::SegmentTooLarge {
            json_len: json.len() as u64,
            bin_len: payload.len() as u64,
            max: u32::MAX as usize,
        });
    };
    let mut out = Vec::with_capacity(HEADER_BYTES + json.len() + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&json_len.to_be_bytes());
    out.extend_from_slice(&bin_len.to_be_bytes());
    out.extend_from_slice(&json);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Extract the next complete frame from `acc`, draining its bytes.
///
/// Returns `Ok(None)` when the accumulator holds only a partial header or
/// partial frame; the bytes are left in place for the next read. Errors do
/// not drain either, but the connection must be dropped after one.
pub fn try_extract(acc: &mut Vec<u8>, max_segment: usize) -> Result<Option<Frame>, FrameError> {
    let Some((json_len, frame_len)) = try_frame_len(acc, max_segment)? else {
        return Ok(None);
    };
    if acc.len() < frame_len {
        return Ok(None);
    }
    let body: Vec<u8> = acc.drain(..frame_len).collect();
    let meta: Value = serde_json::from_slice(&body[HEADER_BYTES..HEADER_BYTES + json_len])?;
    let Value::Object(meta) = meta else {
        return Err(FrameError::NotAnObject);
    };
    let payload = Bytes::copy_from_slice(&body[HEADER_BYTES + json_len..]);
    Ok(Some(Frame { meta, payload }))
}

/// Validate the header at the front of `buf` and compute the total frame
/// length. Returns `Ok(None)` when fewer than [`HEADER_BYTES`] are available.
fn try_frame_len(buf: &[u8], max_segment: usize) -> Result<Option<(usize, usize)>, FrameError> {
    if buf.len() < HEADER_BYTES {
        return Ok(None);
    }
    let magic = [buf[0], buf[1], buf[2], buf[3]];
    if magic != MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    let json_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    let bin_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    if json_len > max_segment || bin_len > max_segment {
        return Err(FrameError::SegmentTooLarge {
            json_len: json_len as u64,
            bin_len: bin_len as u64,
            max: max_segment,
        });
    }
    let frame_len = HEADER_BYTES
        .checked_add(json_len)
        .and_then(|v| v.checked_add(bin_len))
        .ok_or(FrameError::SegmentTooLarge {
            json_len: json_len as u64,
            bin_len: bin_len as u64,
            max: max_segment,
        })?;
    Ok(Some((json_len, frame_len)))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use serde_json::json;

    fn meta_with(command: &str) -> MetaMap {
        let mut m = MetaMap::new();
        m.insert("command".into(), json!(command));
        m
    }

    #[test]
    fn encode_then_extract_round_trips() {
        let meta = meta_with("send");
        let wire = encode(&meta, &[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(&wire[..4], b"DiME");

        let mut acc = wire;
        let frame = try_extract(&mut acc, DEFAULT_MAX_SEGMENT_BYTES)
            .unwrap()
            .expect("complete frame");
        assert!(acc.is_empty());
        assert_eq!(frame.meta, meta);
        assert_eq!(&frame.payload[..], &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn extract_returns_none_for_partial_header() {
        let mut acc = b"DiM".to_vec();
        assert!(try_extract(&mut acc, 1024).unwrap().is_none());
        assert_eq!(acc.len(), 3);
    }

    #[test]
    fn extract_returns_none_for_partial_frame() {
        let meta = meta_with("wait");
        let wire = encode(&meta, b"xyz").unwrap();
        let mut acc = wire[..wire.len() - 1].to_vec();
        assert!(try_extract(&mut acc, 1024).unwrap().is_none());
        assert_eq!(acc.len(), wire.len() - 1);
    }

    #[test]
    fn extract_drains_one_frame_and_preserves_remainder() {
        let f1 = encode(&meta_with("wait"), b"").unwrap();
        let f2 = encode(&meta_with("devices"), b"abc").unwrap();
        let mut acc = [f1, f2.clone()].concat();

        let first = try_extract(&mut acc, 1024).unwrap().expect("first frame");
        assert_eq!(first.meta["command"], json!("wait"));
        assert_eq!(acc, f2);

        let second = try_extract(&mut acc, 1024).unwrap().expect("second frame");
        assert_eq!(second.meta["command"], json!("devices"));
        assert_eq!(&second.payload[..], b"abc");
        assert!(acc.is_empty());
    }

    #[test]
    fn extract_rejects_bad_magic_without_draining() {
        let mut wire = encode(&meta_with("wait"), b"").unwrap();
        wire[0] = b'X';
        let before = wire.len();
        let mut acc = wire;
        let err = try_extract(&mut acc, 1024).expect_err("bad magic");
        assert!(matches!(err, FrameError::BadMagic(_)));
        assert_eq!(acc.len(), before);
    }

    #[test]
    fn extract_rejects_oversized_segment() {
        let wire = encode(&meta_with("send"), &[0u8; 64]).unwrap();
        let mut acc = wire;
        let err = try_extract(&mut acc, 16).expect_err("oversize");
        assert!(matches!(err, FrameError::SegmentTooLarge { .. }));
    }

    #[test]
    fn extract_rejects_non_object_metadata() {
        let json = b"[1,2,3]";
        let mut wire = Vec::new();
        wire.extend_from_slice(&MAGIC);
        wire.extend_from_slice(&(json.len() as u32).to_be_bytes());
        wire.extend_from_slice(&0u32.to_be_bytes());
        wire.extend_from_slice(json);
        let mut acc = wire;
        let err = try_extract(&mut acc, 1024).expect_err("non-object");
        assert!(matches!(err, FrameError::NotAnObject));
    }

    #[test]
    fn extract_rejects_malformed_json() {
        let json = b"{not json";
        let mut wire = Vec::new();
        wire.extend_from_slice(&MAGIC);
        wire.extend_from_slice(&(json.len() as u32).to_be_bytes());
        wire.extend_from_slice(&0u32.to_be_bytes());
        wire.extend_from_slice(json);
        let mut acc = wire;
        let err = try_extract(&mut acc, 1024).expect_err("bad json");
        assert!(matches!(err, FrameError::Json(_)));
    }
}
