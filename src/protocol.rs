//! The data-channel wire protocol.
//!
//! Two kinds of traffic share one ordered, reliable channel: UTF-8 JSON text
//! frames carrying control messages, and binary frames carrying fragment
//! chunks. A chunk frame is laid out as
//!
//! ```text
//! byte 0         session id length L (1..255)
//! byte 1         last-chunk flag (0 or 1)
//! bytes 2..2+L   session id (ASCII)
//! bytes 2+L..    payload
//! ```
//!
//! There is no in-band length field; the payload runs to the end of the
//! frame. Receivers route frames by session id and treat a set flag as
//! end-of-fragment once this payload is consumed.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    error::{Error, Result},
    SessionId, CHUNK_SIZE, MAX_SESSION_ID_LEN,
};

/// Value of the flag byte on the final frame of a fragment.
pub(crate) const LAST_CHUNK: u8 = 1;

/// A control message received on (or sent over) the data channel as a JSON
/// text frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum ControlMessage {
    /// The remote peer requests streaming of a fragment.
    #[serde(rename = "READY_NODE")]
    Ready {
        fragment_id: String,
        session_id: String,
    },
    /// Either side aborts a transfer.
    #[serde(rename = "CANCELED")]
    Canceled {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fragment_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl ControlMessage {
    /// Parses a text frame. `Ok(None)` means the frame was well-formed JSON
    /// with an unrecognized `type`, which the caller logs and ignores.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        match value.get("type").and_then(serde_json::Value::as_str) {
            Some("READY_NODE") | Some("CANCELED") => {
                Ok(Some(serde_json::from_value(value)?))
            }
            _ => Ok(None),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Validates that an id fits the frame header: 1 to 255 bytes of ASCII.
pub(crate) fn validate_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty()
        || session_id.len() > MAX_SESSION_ID_LEN
        || !session_id.is_ascii()
    {
        return Err(Error::InvalidSessionId(session_id.to_string()));
    }
    Ok(())
}

/// Frames one chunk of a fragment for the data channel.
pub(crate) fn encode_chunk(session_id: &str, last: bool, payload: &[u8]) -> Result<Bytes> {
    validate_session_id(session_id)?;
    debug_assert!(payload.len() <= CHUNK_SIZE);

    let id = session_id.as_bytes();
    let mut buf = BytesMut::with_capacity(2 + id.len() + payload.len());
    buf.put_u8(id.len() as u8);
    buf.put_u8(if last { LAST_CHUNK } else { 0 });
    buf.put_slice(id);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// A decoded chunk frame. Only the test-suite and diagnostic tooling decode
/// frames on this side; production receivers live in the consuming peer.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ChunkFrame {
    pub session_id: SessionId,
    pub last: bool,
    pub payload: Bytes,
}

pub(crate) fn decode_chunk(frame: &[u8]) -> Result<ChunkFrame> {
    if frame.len() < 2 {
        return Err(Error::MalformedFrame);
    }
    let id_len = frame[0] as usize;
    if id_len == 0 || frame.len() < 2 + id_len {
        return Err(Error::MalformedFrame);
    }
    let last = match frame[1] {
        0 => false,
        LAST_CHUNK => true,
        _ => return Err(Error::MalformedFrame),
    };
    let session_id = std::str::from_utf8(&frame[2..2 + id_len])
        .map_err(|_| Error::MalformedFrame)?
        .to_string();
    Ok(ChunkFrame {
        session_id,
        last,
        payload: Bytes::copy_from_slice(&frame[2 + id_len..]),
    })
}
