//! Typed events published by the transports to the owning consumer.
//!
//! The transports never call back into the UI: every state change and every
//! received message is pushed onto a single unbounded queue, consumed by
//! whoever holds the [`EventStream`](crate::connection::EventStream).

/// Connection lifecycle, owned by the transport task and published through a
/// `tokio::sync::watch` channel. Mutated only in response to transport
/// events, never polled from the transport side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Everything a consumer can observe from a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// The transport is open for traffic. For the peer transport this means
    /// the data channel opened, not that ICE completed.
    Open,
    /// The transport shut down. Published exactly once per connection.
    Closed,
    /// A transport-level failure; an eventual `Closed` follows.
    Error { message: String },
    /// Authoritative presence snapshot (full replace).
    Users { list: Vec<String> },
    /// A participant joined.
    Joined { username: String },
    /// A participant left.
    Left { username: String },
    /// A chat line from a remote participant.
    Chat { sender: String, text: String },
    /// A locally synthesized notice ("bob joined").
    System { text: String },
    /// A remote participant is typing.
    Typing { sender: String },
    /// A fully reassembled incoming file.
    File {
        sender: String,
        filename: String,
        mime: Option<String>,
        payload: Vec<u8>,
    },
}
