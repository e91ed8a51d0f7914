//! Realtime chat transport client.
//!
//! Two interchangeable transports behind one handle:
//!
//! - **Relay**: a WebSocket to the chat server; every message goes through
//!   the server, which also maintains room presence.
//! - **Peer**: a direct WebRTC data channel, negotiated over a thin
//!   signaling WebSocket with perfect-negotiation glare handling, then
//!   carrying traffic peer to peer.
//!
//! Both speak the same envelope protocol and support chat lines, typing
//! indicators, and chunked file transfer. Consumers open a
//! [`Connection`] and read typed [`ChatEvent`]s off the returned
//! [`EventStream`]:
//!
//! ```no_run
//! use chatlink::{ChatEvent, Connection, RelayConfig};
//!
//! # async fn demo() -> chatlink::Result<()> {
//! let (conn, mut events) = Connection::relay(RelayConfig {
//!     server_addr: "127.0.0.1:8080".into(),
//!     username: "alice".into(),
//! })
//! .await?;
//!
//! conn.send("hello");
//! while let Some(event) = events.recv().await {
//!     if let ChatEvent::Chat { sender, text } = event {
//!         println!("{sender}: {text}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod transfer;

pub use codec::Envelope;
pub use connection::{
    ChatEvent, Connection, EventStream, LifecycleState, PeerConfig, RelayConfig,
};
pub use error::{ChatError, DecodeError, Result};
pub use transfer::{IncomingFile, OutgoingFile};
