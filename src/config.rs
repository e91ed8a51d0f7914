//! Centralized configuration constants for chatlink.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (frame type bytes) stay in the
//! codec module.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Chunk size for file transfer over the peer data channel (16 KB).
///
/// Sized to stay well under the 64 KB SCTP receive buffer used by webrtc-rs,
/// leaving headroom for the binary frame header.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Chunk size for file transfer over the relayed transport (64 KB).
///
/// The relay carries JSON text frames with base64 chunk payloads, so the
/// on-wire frame is roughly 4/3 of this.
pub const RELAY_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum file size accepted for transfer (60 MB).
///
/// Files over this ceiling are rejected before any chunk is produced.
pub const MAX_FILE_SIZE: usize = 60 * 1024 * 1024;

/// Pause between consecutive file chunks.
///
/// A scheduling courtesy, not a protocol requirement: keeps a bulk transfer
/// from starving chat and presence traffic on the same transport.
pub const CHUNK_PACING: Duration = Duration::from_millis(5);

// ── Connection / Network ─────────────────────────────────────────────────────

/// Timeout for the initial WebSocket connect (relay and signaling).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Path of the chat-relay WebSocket endpoint.
pub const RELAY_WS_PATH: &str = "/ws";

/// Path of the signaling WebSocket endpoint.
pub const SIGNAL_WS_PATH: &str = "/signal";

/// STUN server used for ICE candidate discovery.
pub const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Label of the peer-to-peer chat data channel.
pub const DATA_CHANNEL_LABEL: &str = "chat";
