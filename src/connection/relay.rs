//! Relayed transport: a WebSocket connection to the central chat server.
//!
//! One task owns the socket, the presence set, and the in-progress chunk
//! streams. It selects over the socket stream and the facade's command
//! queue; outbound frames go through a small writer task so file transfers
//! can run concurrently without touching the socket from two places.

use std::collections::HashSet;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::codec::{self, Envelope};
use crate::config::{CONNECT_TIMEOUT, RELAY_CHUNK_SIZE, RELAY_WS_PATH};
use crate::error::{ChatError, Result};
use crate::transfer::{self, ChunkSink, ChunkStreams};

use super::{ChatEvent, Command, LifecycleState, RelayConfig};

/// Connect to the relay endpoint and spawn the transport task.
///
/// Returns once the socket is up and the `join` announcement is queued; the
/// caller observes everything else through the event stream.
pub(crate) async fn spawn(
    cfg: RelayConfig,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ChatEvent>,
    state: watch::Sender<LifecycleState>,
) -> Result<()> {
    let url = format!("ws://{}{}", cfg.server_addr, RELAY_WS_PATH);
    let (ws, _) = timeout(CONNECT_TIMEOUT, connect_async(&url))
        .await
        .map_err(|_| ChatError::ConnectTimeout)??;
    info!(event = "relay_connected", %url, username = %cfg.username, "Relay transport connected");

    let (mut write, read) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    // Writer task: drains the outbound queue, then closes the socket.
    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if let Err(e) = write.send(msg).await {
                warn!(event = "relay_write_error", %e, "Relay write failed");
                break;
            }
        }
        let _ = write.send(Message::Close(None)).await;
    });

    let join = codec::encode_text(&Envelope::Join {
        username: cfg.username.clone(),
        room: None,
    })?;
    let _ = out_tx.send(Message::text(join));

    state.send_replace(LifecycleState::Connected);
    let _ = events.send(ChatEvent::Open);

    let session = RelaySession {
        username: cfg.username,
        users: HashSet::new(),
        streams: ChunkStreams::new(),
        events,
    };
    tokio::spawn(run(session, read, out_tx, cmd_rx, state));
    Ok(())
}

async fn run(
    mut session: RelaySession,
    mut read: futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
    out_tx: mpsc::UnboundedSender<Message>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<LifecycleState>,
) {
    let mut errored = false;
    let mut send_leave = true;

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match codec::decode_text(text.as_str()) {
                    Ok(env) => session.handle_envelope(env),
                    Err(e) => {
                        warn!(event = "relay_decode_error", %e, "Dropping malformed relay frame");
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!(event = "relay_closed_by_server", "Relay socket closed by server");
                    send_leave = false;
                    break;
                }
                Some(Ok(_)) => {
                    debug!(event = "relay_non_text_frame", "Ignoring non-text relay frame");
                }
                Some(Err(e)) => {
                    warn!(event = "relay_socket_error", %e, "Relay socket error");
                    let _ = session.events.send(ChatEvent::Error {
                        message: format!("relay socket error: {e}"),
                    });
                    errored = true;
                    send_leave = false;
                    break;
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(text)) => session.send_envelope(&out_tx, Envelope::Chat {
                    sender: session.username.clone(),
                    text,
                }),
                Some(Command::Typing) => session.send_envelope(&out_tx, Envelope::Typing {
                    sender: session.username.clone(),
                }),
                Some(Command::SendFile(file)) => {
                    let mut sink = RelaySink {
                        out: out_tx.clone(),
                        state: state.subscribe(),
                    };
                    let sender = session.username.clone();
                    let events = session.events.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            transfer::send_file(&file, &sender, RELAY_CHUNK_SIZE, &mut sink).await
                        {
                            warn!(event = "relay_file_send_failed", error = %e, filename = %file.filename, "File send failed");
                            let _ = events.send(ChatEvent::Error {
                                message: format!("file send failed: {e}"),
                            });
                        }
                    });
                }
                Some(Command::Close) | None => break,
            },
        }
    }

    // Best-effort leave notice; failures are swallowed so close always
    // succeeds.
    if send_leave {
        if let Ok(leave) = codec::encode_text(&Envelope::Leave {
            username: session.username.clone(),
        }) {
            let _ = out_tx.send(Message::text(leave));
        }
    }
    drop(out_tx);

    session.streams.clear();
    state.send_replace(if errored {
        LifecycleState::Error
    } else {
        LifecycleState::Disconnected
    });
    let _ = session.events.send(ChatEvent::Closed);
    info!(event = "relay_shutdown", "Relay transport shut down");
}

// ── Session state ────────────────────────────────────────────────────────────

/// Per-connection relay state: presence, chunk streams, event publisher.
/// Owned exclusively by the transport task.
struct RelaySession {
    username: String,
    users: HashSet<String>,
    streams: ChunkStreams,
    events: mpsc::UnboundedSender<ChatEvent>,
}

impl RelaySession {
    /// Dispatch one decoded envelope from the relay.
    fn handle_envelope(&mut self, env: Envelope) {
        match env {
            Envelope::Users { list } => {
                // Authoritative snapshot: full replace, never a merge.
                self.users = list.iter().cloned().collect();
                let _ = self.events.send(ChatEvent::Users { list });
            }
            Envelope::Join { username, .. } => {
                if username == self.username {
                    return;
                }
                self.users.insert(username.clone());
                let _ = self.events.send(ChatEvent::Joined {
                    username: username.clone(),
                });
                let _ = self.events.send(ChatEvent::System {
                    text: format!("{username} joined"),
                });
            }
            Envelope::Leave { username } => {
                if username == self.username {
                    return;
                }
                self.users.remove(&username);
                let _ = self.events.send(ChatEvent::Left {
                    username: username.clone(),
                });
                let _ = self.events.send(ChatEvent::System {
                    text: format!("{username} left"),
                });
            }
            Envelope::Chat { sender, text } => {
                if sender == self.username {
                    return;
                }
                let _ = self.events.send(ChatEvent::Chat { sender, text });
            }
            Envelope::Typing { sender } => {
                if sender == self.username {
                    return;
                }
                let _ = self.events.send(ChatEvent::Typing { sender });
            }
            Envelope::FileChunk {
                sender,
                filename,
                chunk,
                mime,
                end,
            } => {
                if sender == self.username {
                    return;
                }
                if let Some(file) = self.streams.accept(sender, filename, chunk, mime, end) {
                    let _ = self.events.send(ChatEvent::File {
                        sender: file.sender,
                        filename: file.filename,
                        mime: file.mime,
                        payload: file.payload,
                    });
                }
            }
            other => {
                debug!(event = "relay_unexpected_envelope", ?other, "Ignoring envelope kind on relay");
            }
        }
    }

    /// Queue an envelope for the writer. A no-op (dropped, not queued) when
    /// the writer is gone; callers surface that as a user-visible failure.
    fn send_envelope(&self, out: &mpsc::UnboundedSender<Message>, env: Envelope) {
        match codec::encode_text(&env) {
            Ok(text) => {
                if out.send(Message::text(text)).is_err() {
                    debug!(event = "relay_send_dropped", "Dropping send on closed relay");
                }
            }
            Err(e) => warn!(event = "relay_encode_error", %e, "Failed to encode outgoing envelope"),
        }
    }
}

// ── File chunk sink ──────────────────────────────────────────────────────────

/// Chunk sink over the relay's outbound queue; text codec, base64 chunks.
struct RelaySink {
    out: mpsc::UnboundedSender<Message>,
    state: watch::Receiver<LifecycleState>,
}

impl ChunkSink for RelaySink {
    fn is_ready(&self) -> bool {
        *self.state.borrow() == LifecycleState::Connected && !self.out.is_closed()
    }

    async fn send(&mut self, env: Envelope) -> Result<()> {
        let text = codec::encode_text(&env)?;
        self.out
            .send(Message::text(text))
            .map_err(|_| ChatError::Closed)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;

    fn session() -> (RelaySession, mpsc::UnboundedReceiver<ChatEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            RelaySession {
                username: "alice".into(),
                users: HashSet::new(),
                streams: ChunkStreams::new(),
                events: tx,
            },
            rx,
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ChatEvent>) -> Vec<ChatEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn users_snapshot_replaces_presence_wholesale() {
        let (mut s, mut rx) = session();
        s.handle_envelope(Envelope::Users {
            list: vec!["alice".into(), "bob".into()],
        });
        s.handle_envelope(Envelope::Users {
            list: vec!["carol".into()],
        });
        assert_eq!(s.users, HashSet::from(["carol".to_string()]));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn users_then_leave_converges() {
        let (mut s, mut rx) = session();
        s.handle_envelope(Envelope::Users {
            list: vec!["a".into(), "b".into()],
        });
        s.handle_envelope(Envelope::Leave { username: "a".into() });
        assert_eq!(s.users, HashSet::from(["b".to_string()]));
        let events = drain(&mut rx);
        assert!(events.contains(&ChatEvent::Left { username: "a".into() }));
        assert!(events.contains(&ChatEvent::System {
            text: "a left".into()
        }));
    }

    #[test]
    fn join_updates_presence_and_synthesizes_notice() {
        let (mut s, mut rx) = session();
        s.handle_envelope(Envelope::Join {
            username: "bob".into(),
            room: None,
        });
        assert!(s.users.contains("bob"));
        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                ChatEvent::Joined {
                    username: "bob".into()
                },
                ChatEvent::System {
                    text: "bob joined".into()
                },
            ]
        );
    }

    #[test]
    fn self_echoes_are_suppressed_except_users() {
        let (mut s, mut rx) = session();
        s.handle_envelope(Envelope::Chat {
            sender: "alice".into(),
            text: "echo".into(),
        });
        s.handle_envelope(Envelope::Typing {
            sender: "alice".into(),
        });
        s.handle_envelope(Envelope::Join {
            username: "alice".into(),
            room: None,
        });
        assert!(drain(&mut rx).is_empty());
        assert!(!s.users.contains("alice"));

        // `users` has no sender and always lands.
        s.handle_envelope(Envelope::Users {
            list: vec!["alice".into()],
        });
        assert_eq!(
            drain(&mut rx),
            vec![ChatEvent::Users {
                list: vec!["alice".into()]
            }]
        );
    }

    #[test]
    fn file_chunks_route_through_reassembly() {
        let (mut s, mut rx) = session();
        s.handle_envelope(Envelope::FileChunk {
            sender: "bob".into(),
            filename: "f.txt".into(),
            chunk: b"hel".to_vec(),
            mime: Some("text/plain".into()),
            end: false,
        });
        assert!(drain(&mut rx).is_empty());
        s.handle_envelope(Envelope::FileChunk {
            sender: "bob".into(),
            filename: "f.txt".into(),
            chunk: b"lo".to_vec(),
            mime: Some("text/plain".into()),
            end: true,
        });
        assert_eq!(
            drain(&mut rx),
            vec![ChatEvent::File {
                sender: "bob".into(),
                filename: "f.txt".into(),
                mime: Some("text/plain".into()),
                payload: b"hello".to_vec(),
            }]
        );
        assert!(!s.streams.in_progress("f.txt"));
    }

    // ── Loopback integration ─────────────────────────────────────────────

    async fn ws_stub<F, Fut>(handler: F) -> SocketAddr
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            handler(ws).await;
        });
        addr
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ChatEvent>) -> ChatEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream ended")
    }

    fn text_of(msg: Message) -> String {
        match msg {
            Message::Text(t) => t.as_str().to_owned(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn relay_announces_join_and_publishes_presence() {
        let addr = ws_stub(|mut ws| async move {
            let join = text_of(ws.next().await.unwrap().unwrap());
            assert_eq!(
                codec::decode_text(&join).unwrap(),
                Envelope::Join {
                    username: "alice".into(),
                    room: None,
                }
            );
            let users = codec::encode_text(&Envelope::Users {
                list: vec!["alice".into(), "bob".into()],
            })
            .unwrap();
            ws.send(Message::text(users)).await.unwrap();

            // Expect the client's chat line, echo it straight back.
            let chat = text_of(ws.next().await.unwrap().unwrap());
            let env = codec::decode_text(&chat).unwrap();
            assert_eq!(
                env,
                Envelope::Chat {
                    sender: "alice".into(),
                    text: "hi".into(),
                }
            );
            ws.send(Message::text(chat)).await.unwrap();

            // Hold the socket open until the client leaves.
            while let Some(Ok(frame)) = ws.next().await {
                if let Message::Text(t) = frame {
                    if matches!(
                        codec::decode_text(t.as_str()),
                        Ok(Envelope::Leave { .. })
                    ) {
                        break;
                    }
                }
            }
        })
        .await;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LifecycleState::Connecting);
        spawn(
            RelayConfig {
                server_addr: addr.to_string(),
                username: "alice".into(),
            },
            cmd_rx,
            ev_tx,
            state_tx,
        )
        .await
        .unwrap();

        assert_eq!(next_event(&mut ev_rx).await, ChatEvent::Open);
        assert_eq!(*state_rx.borrow(), LifecycleState::Connected);
        assert_eq!(
            next_event(&mut ev_rx).await,
            ChatEvent::Users {
                list: vec!["alice".into(), "bob".into()]
            }
        );

        cmd_tx.send(Command::Send("hi".into())).unwrap();
        cmd_tx.send(Command::Close).unwrap();

        // The echoed chat is a self-echo and must not surface; the next
        // event is the close notification.
        assert_eq!(next_event(&mut ev_rx).await, ChatEvent::Closed);
        assert_eq!(
            timeout(Duration::from_secs(5), ev_rx.recv()).await.unwrap(),
            None
        );
        assert_eq!(*state_rx.borrow(), LifecycleState::Disconnected);
    }

    #[tokio::test]
    async fn server_close_surfaces_exactly_one_closed() {
        let addr = ws_stub(|mut ws| async move {
            let _join = ws.next().await;
            let _ = ws.close(None).await;
        })
        .await;

        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let (state_tx, _state_rx) = watch::channel(LifecycleState::Connecting);
        spawn(
            RelayConfig {
                server_addr: addr.to_string(),
                username: "alice".into(),
            },
            cmd_rx,
            ev_tx,
            state_tx,
        )
        .await
        .unwrap();

        assert_eq!(next_event(&mut ev_rx).await, ChatEvent::Open);
        assert_eq!(next_event(&mut ev_rx).await, ChatEvent::Closed);
        assert_eq!(
            timeout(Duration::from_secs(5), ev_rx.recv()).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn connect_refused_is_an_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        let (state_tx, _state_rx) = watch::channel(LifecycleState::Connecting);
        let err = spawn(
            RelayConfig {
                server_addr: addr.to_string(),
                username: "alice".into(),
            },
            cmd_rx,
            ev_tx,
            state_tx,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ChatError::WebSocket(_) | ChatError::Io(_) | ChatError::ConnectTimeout
        ));
    }
}
