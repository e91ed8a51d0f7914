//! Wire envelopes and the text/binary codecs.
//!
//! Every unit of wire traffic is an [`Envelope`], a tagged variant carried in
//! one of two encodings selected by transport capability:
//!
//! - **Text** (relay and signaling WebSockets): JSON with the `type` tag;
//!   file chunk bytes are base64 so the frame stays valid text.
//! - **Binary** (peer data channel): a 1-byte frame-type prefix —
//!   `0x01` = JSON envelope payload, `0x02` = compact chunk frame — which
//!   eliminates JSON+base64 overhead for bulk data.
//!
//! Binary chunk frame layout:
//!
//! ```text
//! [0x02][sender_len u16 BE][sender][name_len u16 BE][filename]
//!       [mime_len u16 BE][mime][end u8][payload ...]
//! ```
//!
//! Decoding a malformed payload yields [`DecodeError`]; the caller logs and
//! discards the frame.

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Frame type marker for a JSON-encoded envelope on the binary codec.
pub(crate) const FRAME_ENVELOPE: u8 = 0x01;

/// Frame type marker for a compact binary file chunk.
pub(crate) const FRAME_CHUNK: u8 = 0x02;

/// The unit of wire traffic between clients and/or the relay server.
///
/// Field names match the JSON wire format; `users` is the only kind without
/// an originating username.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Announce presence. The signaling endpoint additionally scopes the
    /// join to a room.
    Join {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
    },
    /// Withdraw presence.
    Leave { username: String },
    /// Authoritative snapshot of present usernames (full replace, not merge).
    Users { list: Vec<String> },
    /// A chat line.
    Chat { sender: String, text: String },
    /// Ephemeral typing indicator.
    Typing { sender: String },
    /// One chunk of a file transfer; the final chunk carries `end = true`.
    FileChunk {
        sender: String,
        filename: String,
        #[serde(with = "base64_bytes")]
        chunk: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime: Option<String>,
        #[serde(default)]
        end: bool,
    },
    /// SDP offer, relayed through the signaling endpoint.
    Offer {
        room: String,
        username: String,
        /// JSON-serialized session description.
        sdp: String,
    },
    /// SDP answer, relayed through the signaling endpoint.
    Answer {
        room: String,
        username: String,
        /// JSON-serialized session description.
        sdp: String,
    },
    /// Trickled ICE candidate, relayed through the signaling endpoint.
    Ice {
        room: String,
        username: String,
        /// JSON-serialized candidate init.
        candidate: String,
    },
    /// Signaling notice: another client joined the room.
    #[serde(rename = "peer-joined")]
    PeerJoined { username: String },
    /// Signaling notice: another client left the room.
    #[serde(rename = "peer-left")]
    PeerLeft { username: String },
}

impl Envelope {
    /// The username that originated this envelope, used for self-echo
    /// suppression. `users` is server-synthesized and has no sender.
    pub fn sender(&self) -> Option<&str> {
        match self {
            Envelope::Join { username, .. }
            | Envelope::Leave { username }
            | Envelope::Offer { username, .. }
            | Envelope::Answer { username, .. }
            | Envelope::Ice { username, .. }
            | Envelope::PeerJoined { username }
            | Envelope::PeerLeft { username } => Some(username),
            Envelope::Chat { sender, .. }
            | Envelope::Typing { sender }
            | Envelope::FileChunk { sender, .. } => Some(sender),
            Envelope::Users { .. } => None,
        }
    }
}

// ── Text codec ───────────────────────────────────────────────────────────────

/// Encode an envelope as a JSON text frame.
pub fn encode_text(env: &Envelope) -> Result<String, DecodeError> {
    Ok(serde_json::to_string(env)?)
}

/// Decode a JSON text frame.
pub fn decode_text(text: &str) -> Result<Envelope, DecodeError> {
    Ok(serde_json::from_str(text)?)
}

// ── Binary codec ─────────────────────────────────────────────────────────────

/// Encode an envelope for a binary-capable transport.
///
/// File chunks use the compact `0x02` frame with the payload as raw bytes;
/// everything else is the JSON form behind a `0x01` marker.
pub fn encode_binary(env: &Envelope) -> Result<Vec<u8>, DecodeError> {
    match env {
        Envelope::FileChunk {
            sender,
            filename,
            chunk,
            mime,
            end,
        } => {
            let mime = mime.as_deref().unwrap_or("");
            let mut buf = Vec::with_capacity(
                1 + 6 + sender.len() + filename.len() + mime.len() + 1 + chunk.len(),
            );
            buf.put_u8(FRAME_CHUNK);
            put_str(&mut buf, sender)?;
            put_str(&mut buf, filename)?;
            put_str(&mut buf, mime)?;
            buf.put_u8(u8::from(*end));
            buf.extend_from_slice(chunk);
            Ok(buf)
        }
        _ => {
            let json = serde_json::to_vec(env)?;
            let mut buf = Vec::with_capacity(1 + json.len());
            buf.put_u8(FRAME_ENVELOPE);
            buf.extend_from_slice(&json);
            Ok(buf)
        }
    }
}

/// Decode a frame from a binary-capable transport.
pub fn decode_binary(data: &[u8]) -> Result<Envelope, DecodeError> {
    let (&frame_type, rest) = data.split_first().ok_or(DecodeError::Empty)?;
    match frame_type {
        FRAME_ENVELOPE => Ok(serde_json::from_slice(rest)?),
        FRAME_CHUNK => {
            let mut rest = rest;
            let sender = take_str(&mut rest)?.to_owned();
            let filename = take_str(&mut rest)?.to_owned();
            let mime = take_str(&mut rest)?;
            let mime = (!mime.is_empty()).then(|| mime.to_owned());
            let (&end, payload) = rest.split_first().ok_or(DecodeError::Truncated)?;
            Ok(Envelope::FileChunk {
                sender,
                filename,
                chunk: payload.to_vec(),
                mime,
                end: end != 0,
            })
        }
        other => Err(DecodeError::UnknownFrame(other)),
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> Result<(), DecodeError> {
    let len = s.len();
    if len > u16::MAX as usize {
        return Err(DecodeError::FieldTooLong {
            len,
            max: u16::MAX as usize,
        });
    }
    buf.put_u16(len as u16);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn take_str<'a>(rest: &mut &'a [u8]) -> Result<&'a str, DecodeError> {
    if rest.len() < 2 {
        return Err(DecodeError::Truncated);
    }
    let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    let tail = &rest[2..];
    if tail.len() < len {
        return Err(DecodeError::Truncated);
    }
    let s = std::str::from_utf8(&tail[..len])?;
    *rest = &tail[len..];
    Ok(s)
}

// ── Base64 chunk representation ──────────────────────────────────────────────

/// Serde adapter for chunk bytes on text transports.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
