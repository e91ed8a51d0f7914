//! Connection facade over the two transports.
//!
//! A [`Connection`] is a handle to one transport task (relayed WebSocket or
//! direct WebRTC peer). Commands are fire-and-forget onto the task's queue;
//! everything observable comes back on the [`EventStream`]. The handle is
//! cheap to keep around and closes the transport on drop.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::Result;
use crate::transfer::OutgoingFile;

mod event;
mod negotiation;
mod peer;
mod relay;
mod signaling;

pub use event::{ChatEvent, LifecycleState};

/// Events published by the transport, in delivery order.
pub type EventStream = mpsc::UnboundedReceiver<ChatEvent>;

/// Settings for the relayed transport.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Chat server address, `host:port`.
    pub server_addr: String,
    pub username: String,
}

/// Settings for the peer transport.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Signaling server address, `host:port`.
    pub server_addr: String,
    pub username: String,
    /// Room both peers must join to find each other.
    pub room: String,
}

/// Commands from the facade to the transport task.
pub(crate) enum Command {
    Send(String),
    Typing,
    SendFile(OutgoingFile),
    Close,
}

/// Handle to a running transport.
pub struct Connection {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<LifecycleState>,
    closed: AtomicBool,
}

impl Connection {
    /// Open a relayed connection: all traffic through the chat server.
    pub async fn relay(cfg: RelayConfig) -> Result<(Self, EventStream)> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LifecycleState::Connecting);
        relay::spawn(cfg, cmd_rx, ev_tx, state_tx).await?;
        Ok((
            Self {
                cmd_tx,
                state_rx,
                closed: AtomicBool::new(false),
            },
            ev_rx,
        ))
    }

    /// Open a peer connection: signaling through the server, traffic over a
    /// direct data channel once negotiation completes.
    pub async fn peer(cfg: PeerConfig) -> Result<(Self, EventStream)> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LifecycleState::Connecting);
        peer::spawn(cfg, cmd_rx, ev_tx, state_tx).await?;
        Ok((
            Self {
                cmd_tx,
                state_rx,
                closed: AtomicBool::new(false),
            },
            ev_rx,
        ))
    }

    /// Current lifecycle state, as last published by the transport.
    pub fn state(&self) -> LifecycleState {
        *self.state_rx.borrow()
    }

    /// Queue a chat line. A no-op before the transport opens or after close.
    pub fn send(&self, text: impl Into<String>) {
        self.command(Command::Send(text.into()));
    }

    /// Queue a typing indicator.
    pub fn send_typing(&self) {
        self.command(Command::Typing);
    }

    /// Queue a file for chunked transfer. Failures (too large, transport not
    /// open) surface as [`ChatEvent::Error`].
    pub fn send_file(&self, file: OutgoingFile) {
        self.command(Command::SendFile(file));
    }

    /// Shut the transport down. Idempotent; the transport publishes exactly
    /// one [`ChatEvent::Closed`] regardless of how many times this runs.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.cmd_tx.send(Command::Close);
        }
    }

    fn command(&self, cmd: Command) {
        if self.closed.load(Ordering::SeqCst) {
            debug!(event = "command_after_close", "Dropping command on closed connection");
            return;
        }
        if self.cmd_tx.send(cmd).is_err() {
            debug!(event = "command_after_shutdown", "Dropping command, transport gone");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
