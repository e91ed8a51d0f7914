//! Error types for the transport core.
//!
//! Two layers: [`DecodeError`] for malformed wire traffic (logged and
//! discarded by the transports, never fatal) and [`ChatError`] for everything
//! surfaced to callers or the event stream.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ChatError>;

/// A wire frame could not be encoded or decoded.
///
/// Transports log these and drop the offending frame; decoding never panics
/// into the caller's control flow.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Malformed JSON envelope.
    #[error("malformed JSON envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary frame with an unrecognized type marker.
    #[error("unknown frame type {0:#04x}")]
    UnknownFrame(u8),

    /// Binary frame shorter than its header claims.
    #[error("truncated binary frame")]
    Truncated,

    /// Zero-length frame.
    #[error("empty frame")]
    Empty,

    /// A header string field does not fit the 16-bit length prefix.
    #[error("frame field too long: {len} bytes (max {max})")]
    FieldTooLong { len: usize, max: usize },

    /// A header string field is not valid UTF-8.
    #[error("invalid utf-8 in binary frame: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Errors surfaced by the connection facade and the file transfer engine.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Wire codec failure.
    #[error("codec error: {0}")]
    Decode(#[from] DecodeError),

    /// File send attempted while the transport is not open. The caller may
    /// retry once the connection reports `Connected` again.
    #[error("transport not ready for file transfer")]
    NotReady,

    /// File exceeds the configured ceiling; rejected before any chunk is
    /// produced.
    #[error("file too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    /// An offer or answer was applied in an invalid negotiation state.
    /// Logged and tolerated; the polite/impolite protocol self-heals.
    #[error("negotiation race: {detail}")]
    NegotiationRace { detail: String },

    /// Underlying transport failure that is not a socket-level error.
    #[error("transport error: {detail}")]
    Transport { detail: String },

    /// WebSocket-level failure (relay or signaling endpoint).
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// WebRTC-level failure (peer connection or data channel).
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    /// The connection was already closed when the operation was attempted.
    #[error("connection closed")]
    Closed,

    /// Initial connect did not complete in time.
    #[error("connect timeout")]
    ConnectTimeout,

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
