//! Signaling channel: a thin relayed WebSocket used only for negotiation.
//!
//! Carries `join`, `offer`, `answer`, `ice`, `peer-joined`, `peer-left`, and
//! `users` envelopes scoped to a room. The peer transport owns exactly one
//! signaling session per connection, split into a sender and a receiver so
//! the transport loop can await frames while its handlers keep writing.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::codec::{self, Envelope};
use crate::config::{CONNECT_TIMEOUT, SIGNAL_WS_PATH};
use crate::error::{ChatError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of a room-scoped signaling session.
pub(crate) struct SignalingSender {
    write: SplitSink<WsStream, Message>,
}

/// Read half of a room-scoped signaling session.
pub(crate) struct SignalingReceiver {
    read: SplitStream<WsStream>,
}

/// Connect to the signaling endpoint and announce the room join.
pub(crate) async fn connect(
    server_addr: &str,
    room: &str,
    username: &str,
) -> Result<(SignalingSender, SignalingReceiver)> {
    let url = format!("ws://{server_addr}{SIGNAL_WS_PATH}");
    let (ws, _) = timeout(CONNECT_TIMEOUT, connect_async(&url))
        .await
        .map_err(|_| ChatError::ConnectTimeout)??;
    let (write, read) = ws.split();

    let mut tx = SignalingSender { write };
    tx.send(&Envelope::Join {
        username: username.to_owned(),
        room: Some(room.to_owned()),
    })
    .await?;

    info!(event = "signaling_connected", %url, %room, "Signaling channel open");
    Ok((tx, SignalingReceiver { read }))
}

impl SignalingSender {
    /// Send one envelope to the signaling server.
    pub async fn send(&mut self, env: &Envelope) -> Result<()> {
        let text = codec::encode_text(env)?;
        self.write.send(Message::text(text)).await?;
        Ok(())
    }

    /// Best-effort close of the signaling socket.
    pub async fn close(&mut self) {
        let _ = self.write.send(Message::Close(None)).await;
    }
}

impl SignalingReceiver {
    /// Next decoded envelope. Malformed frames are logged and skipped;
    /// `None` means the signaling session is gone.
    pub async fn next(&mut self) -> Option<Envelope> {
        while let Some(frame) = self.read.next().await {
            match frame {
                Ok(Message::Text(text)) => match codec::decode_text(text.as_str()) {
                    Ok(env) => return Some(env),
                    Err(e) => {
                        warn!(event = "signal_decode_error", %e, "Dropping malformed signaling frame");
                    }
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {
                    // Ping/pong are handled by tungstenite; anything else on
                    // the signaling path is noise.
                    debug!(event = "signal_non_text_frame", "Ignoring non-text signaling frame");
                }
                Err(e) => {
                    warn!(event = "signal_socket_error", %e, "Signaling socket error");
                    return None;
                }
            }
        }
        None
    }
}
