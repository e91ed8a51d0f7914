//! Peer transport: a direct WebRTC data channel negotiated over signaling.
//!
//! One task owns the peer connection, the data channel, and the negotiation
//! flags. WebRTC callbacks never touch that state directly; they forward
//! [`PeerEvent`]s onto an internal queue the task drains alongside signaling
//! frames and facade commands. Glare between simultaneous offers is resolved
//! by the role logic in [`negotiation`](super::negotiation).

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::codec::{self, Envelope};
use crate::config::{CHUNK_SIZE, DATA_CHANNEL_LABEL, STUN_SERVER};
use crate::error::{ChatError, DecodeError, Result};
use crate::transfer::{self, ChunkSink, ChunkStreams};

use super::negotiation::Negotiation;
use super::signaling::{self, SignalingSender};
use super::{ChatEvent, Command, LifecycleState, PeerConfig};

/// Raised by WebRTC callbacks, consumed by the transport task.
enum PeerEvent {
    /// A local ICE candidate to trickle out, already JSON-serialized.
    LocalCandidate(String),
    /// The remote side created the channel first; adopt it.
    RemoteChannel(Arc<RTCDataChannel>),
    ChannelOpen,
    ChannelData(Bytes),
    ChannelClosed,
    ConnectionFailed,
}

/// Connect signaling, build the peer connection, and spawn the transport
/// task. Negotiation starts once the signaling server announces a peer.
pub(crate) async fn spawn(
    cfg: PeerConfig,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ChatEvent>,
    state: watch::Sender<LifecycleState>,
) -> Result<()> {
    let (sig_tx, sig_rx) =
        signaling::connect(&cfg.server_addr, &cfg.room, &cfg.username).await?;

    let (peer_tx, peer_rx) = mpsc::unbounded_channel();
    let pc = build_peer_connection(peer_tx.clone()).await?;

    // Create our channel up front so whichever side's offer wins, a channel
    // exists. If the remote's offer wins, its channel replaces this one.
    let dc = pc
        .create_data_channel(
            DATA_CHANNEL_LABEL,
            Some(RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            }),
        )
        .await?;
    wire_channel(&dc, &peer_tx);

    let session = PeerSession {
        username: cfg.username,
        room: cfg.room,
        pc,
        dc,
        negotiation: Negotiation::default(),
        streams: ChunkStreams::new(),
        events,
        peer_tx,
        opened: false,
    };
    tokio::spawn(run(session, sig_tx, sig_rx, peer_rx, cmd_rx, state));
    Ok(())
}

async fn run(
    mut session: PeerSession,
    mut sig_tx: SignalingSender,
    mut sig_rx: signaling::SignalingReceiver,
    mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<LifecycleState>,
) {
    let mut errored = false;

    loop {
        tokio::select! {
            sig = sig_rx.next() => match sig {
                Some(env) => {
                    if let Err(e) = session.handle_signal(env, &mut sig_tx).await {
                        warn!(event = "negotiation_error", %e, "Negotiation step failed");
                        let _ = session.events.send(ChatEvent::Error {
                            message: format!("negotiation failed: {e}"),
                        });
                    }
                }
                None => {
                    // Losing signaling mid-session is fatal for the peer
                    // relationship, channel included.
                    warn!(event = "signaling_lost", "Signaling stream ended");
                    if !session.opened {
                        let _ = session.events.send(ChatEvent::Error {
                            message: "signaling stream ended".into(),
                        });
                        errored = true;
                    }
                    break;
                }
            },
            ev = peer_rx.recv() => match ev {
                Some(PeerEvent::LocalCandidate(candidate)) => {
                    let env = Envelope::Ice {
                        room: session.room.clone(),
                        username: session.username.clone(),
                        candidate,
                    };
                    if let Err(e) = sig_tx.send(&env).await {
                        warn!(event = "ice_send_failed", %e, "Failed to trickle local candidate");
                    }
                }
                Some(PeerEvent::RemoteChannel(dc)) => {
                    info!(event = "remote_channel_adopted", label = %dc.label(), "Adopting remote data channel");
                    wire_channel(&dc, &session.peer_tx);
                    session.dc = dc;
                }
                Some(PeerEvent::ChannelOpen) => {
                    if !session.opened {
                        session.opened = true;
                        state.send_replace(LifecycleState::Connected);
                        let _ = session.events.send(ChatEvent::Open);
                        info!(event = "channel_open", "Data channel open");
                    }
                }
                Some(PeerEvent::ChannelData(data)) => session.handle_channel_data(&data),
                Some(PeerEvent::ChannelClosed) => {
                    info!(event = "channel_closed", "Data channel closed by peer");
                    break;
                }
                Some(PeerEvent::ConnectionFailed) => {
                    let _ = session.events.send(ChatEvent::Error {
                        message: "peer connection failed".into(),
                    });
                    errored = true;
                    break;
                }
                // Unreachable while the session holds a sender clone.
                None => break,
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(text)) => {
                    let env = Envelope::Chat {
                        sender: session.username.clone(),
                        text,
                    };
                    session.send_channel(env).await;
                }
                Some(Command::Typing) => {
                    let env = Envelope::Typing {
                        sender: session.username.clone(),
                    };
                    session.send_channel(env).await;
                }
                Some(Command::SendFile(file)) => {
                    let mut sink = ChannelSink {
                        dc: session.dc.clone(),
                    };
                    let sender = session.username.clone();
                    let events = session.events.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            transfer::send_file(&file, &sender, CHUNK_SIZE, &mut sink).await
                        {
                            warn!(event = "peer_file_send_failed", error = %e, filename = %file.filename, "File send failed");
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

    sig_tx.close().await;
    if let Err(e) = session.dc.close().await {
        debug!(event = "dc_close_error", %e, "Data channel close failed");
    }
    if let Err(e) = session.pc.close().await {
        debug!(event = "pc_close_error", %e, "Peer connection close failed");
    }
    session.streams.clear();
    state.send_replace(if errored {
        LifecycleState::Error
    } else {
        LifecycleState::Disconnected
    });
    let _ = session.events.send(ChatEvent::Closed);
    info!(event = "peer_shutdown", "Peer transport shut down");
}

// ── Peer connection construction ─────────────────────────────────────────────

async fn build_peer_connection(
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
) -> Result<Arc<RTCPeerConnection>> {
    let mut me = MediaEngine::default();
    let registry = register_default_interceptors(Registry::new(), &mut me)?;
    let api = APIBuilder::new()
        .with_media_engine(me)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(
        api.new_peer_connection(RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![STUN_SERVER.into()],
                username: String::new(),
                credential: String::new(),
            }],
            ..Default::default()
        })
        .await?,
    );

    let tx = peer_tx.clone();
    pc.on_ice_candidate(Box::new(move |c| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = c else { return };
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(e) => {
                    warn!(event = "ice_serialize_failed", %e, "Dropping unserializable candidate");
                    return;
                }
            };
            match serde_json::to_string(&init) {
                Ok(json) => {
                    let _ = tx.send(PeerEvent::LocalCandidate(json));
                }
                Err(e) => {
                    warn!(event = "ice_serialize_failed", %e, "Dropping unserializable candidate");
                }
            }
        })
    }));

    let tx = peer_tx.clone();
    pc.on_data_channel(Box::new(move |dc| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::RemoteChannel(dc));
        })
    }));

    let tx = peer_tx;
    pc.on_peer_connection_state_change(Box::new(move |s| {
        let tx = tx.clone();
        Box::pin(async move {
            match s {
                RTCPeerConnectionState::Connected => {
                    info!(event = "webrtc_connected", "Peer connection established");
                }
                RTCPeerConnectionState::Failed => {
                    error!(event = "webrtc_failed", "Peer connection failed");
                    let _ = tx.send(PeerEvent::ConnectionFailed);
                }
                RTCPeerConnectionState::Disconnected => {
                    warn!(
                        event = "webrtc_disconnected",
                        "Peer transient disconnect (ICE may recover)"
                    );
                }
                RTCPeerConnectionState::Closed => {
                    info!(event = "webrtc_closed", "Peer connection closed");
                }
                _ => {}
            }
        })
    }));

    Ok(pc)
}

/// Attach channel callbacks that forward onto the internal queue.
fn wire_channel(dc: &Arc<RTCDataChannel>, peer_tx: &mpsc::UnboundedSender<PeerEvent>) {
    let tx = peer_tx.clone();
    dc.on_open(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::ChannelOpen);
        })
    }));

    let tx = peer_tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::ChannelData(msg.data));
        })
    }));

    let tx = peer_tx.clone();
    let label = dc.label().to_string();
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        let label = label.clone();
        Box::pin(async move {
            warn!(event = "dc_closed", channel = %label, "Data channel closed by transport");
            let _ = tx.send(PeerEvent::ChannelClosed);
        })
    }));

    let label = dc.label().to_string();
    dc.on_error(Box::new(move |e| {
        let label = label.clone();
        Box::pin(async move {
            warn!(event = "dc_error", channel = %label, %e, "Data channel error");
        })
    }));
}

// ── Session state ────────────────────────────────────────────────────────────

/// Per-connection peer state. Owned exclusively by the transport task.
struct PeerSession {
    username: String,
    room: String,
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
    negotiation: Negotiation,
    streams: ChunkStreams,
    events: mpsc::UnboundedSender<ChatEvent>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    opened: bool,
}

impl PeerSession {
    /// Dispatch one envelope from the signaling channel.
    async fn handle_signal(
        &mut self,
        env: Envelope,
        sig_tx: &mut SignalingSender,
    ) -> Result<()> {
        if env.sender() == Some(self.username.as_str()) {
            debug!(event = "signal_self_echo", "Dropping own signaling echo");
            return Ok(());
        }
        match env {
            Envelope::PeerJoined { username } => {
                self.negotiation.peer_joined(&self.username, &username);
                info!(
                    event = "peer_joined",
                    peer = %username,
                    polite = self.negotiation.polite,
                    "Peer joined the room"
                );
                let _ = self.events.send(ChatEvent::Joined {
                    username: username.clone(),
                });
                let _ = self.events.send(ChatEvent::System {
                    text: format!("{username} joined"),
                });
                self.start_offer(sig_tx).await
            }
            Envelope::Offer { username, sdp, .. } => self.handle_offer(&username, &sdp, sig_tx).await,
            Envelope::Answer { username, sdp, .. } => {
                let desc: RTCSessionDescription =
                    serde_json::from_str(&sdp).map_err(DecodeError::Json)?;
                // An answer to an offer the glare logic already superseded
                // fails to apply; tolerated, the surviving round completes.
                if let Err(e) = self.pc.set_remote_description(desc).await {
                    let race = ChatError::NegotiationRace {
                        detail: format!("answer from {username} superseded: {e}"),
                    };
                    warn!(event = "stale_answer", %race, "Ignoring unapplicable answer");
                }
                Ok(())
            }
            Envelope::Ice { candidate, .. } => {
                let init: RTCIceCandidateInit =
                    serde_json::from_str(&candidate).map_err(DecodeError::Json)?;
                // Candidates for an ignored offer have no matching remote
                // description; tolerated.
                if let Err(e) = self.pc.add_ice_candidate(init).await {
                    let race = ChatError::NegotiationRace {
                        detail: format!("candidate without a session: {e}"),
                    };
                    debug!(event = "ice_add_failed", %race, "Dropping unapplicable remote candidate");
                }
                Ok(())
            }
            Envelope::PeerLeft { username } => {
                info!(event = "peer_left", peer = %username, "Peer left the room");
                let _ = self.events.send(ChatEvent::Left {
                    username: username.clone(),
                });
                let _ = self.events.send(ChatEvent::System {
                    text: format!("{username} left"),
                });
                Ok(())
            }
            Envelope::Users { list } => {
                let _ = self.events.send(ChatEvent::Users { list });
                Ok(())
            }
            other => {
                debug!(event = "signal_unexpected_envelope", ?other, "Ignoring envelope kind on signaling");
                Ok(())
            }
        }
    }

    /// Construct and send a local offer. `making_offer` brackets the whole
    /// round so an offer arriving mid-construction is seen as a collision.
    async fn start_offer(&mut self, sig_tx: &mut SignalingSender) -> Result<()> {
        self.negotiation.making_offer = true;
        let result = self.offer_round(sig_tx).await;
        self.negotiation.making_offer = false;
        result
    }

    async fn offer_round(&mut self, sig_tx: &mut SignalingSender) -> Result<()> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        let desc = self.pc.local_description().await.ok_or_else(|| {
            ChatError::Transport {
                detail: "no local description after offer".into(),
            }
        })?;
        let sdp = serde_json::to_string(&desc).map_err(DecodeError::Json)?;
        debug!(event = "offer_sent", "Local offer sent");
        sig_tx
            .send(&Envelope::Offer {
                room: self.room.clone(),
                username: self.username.clone(),
                sdp,
            })
            .await
    }

    async fn handle_offer(
        &mut self,
        peer: &str,
        sdp: &str,
        sig_tx: &mut SignalingSender,
    ) -> Result<()> {
        let stable = self.pc.signaling_state() == RTCSignalingState::Stable;
        if self.negotiation.should_ignore_offer(stable) {
            info!(
                event = "offer_ignored",
                peer = %peer,
                making_offer = self.negotiation.making_offer,
                stable,
                "Offer collision, impolite side dropping remote offer"
            );
            return Ok(());
        }

        if !stable {
            // Polite side yielding mid-offer: webrtc-rs performs no implicit
            // rollback, so the pending local offer must be withdrawn
            // explicitly before the remote offer can be applied.
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            self.pc.set_local_description(rollback).await?;
            info!(event = "local_offer_rolled_back", peer = %peer, "Rolled back pending local offer");
        }

        let desc: RTCSessionDescription = serde_json::from_str(sdp).map_err(DecodeError::Json)?;
        self.pc.set_remote_description(desc).await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        let desc = self.pc.local_description().await.ok_or_else(|| {
            ChatError::Transport {
                detail: "no local description after answer".into(),
            }
        })?;
        let sdp = serde_json::to_string(&desc).map_err(DecodeError::Json)?;
        debug!(event = "answer_sent", peer = %peer, "Answer sent");
        sig_tx
            .send(&Envelope::Answer {
                room: self.room.clone(),
                username: self.username.clone(),
                sdp,
            })
            .await
    }

    /// Dispatch one binary frame from the data channel.
    fn handle_channel_data(&mut self, data: &[u8]) {
        let env = match codec::decode_binary(data) {
            Ok(env) => env,
            Err(e) => {
                warn!(event = "channel_decode_error", %e, "Dropping malformed channel frame");
                return;
            }
        };
        if env.sender() == Some(self.username.as_str()) {
            debug!(event = "channel_self_echo", "Dropping own channel echo");
            return;
        }
        match env {
            Envelope::Chat { sender, text } => {
                let _ = self.events.send(ChatEvent::Chat { sender, text });
            }
            Envelope::Typing { sender } => {
                let _ = self.events.send(ChatEvent::Typing { sender });
            }
            Envelope::FileChunk {
                sender,
                filename,
                chunk,
                mime,
                end,
            } => {
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
                debug!(event = "channel_unexpected_envelope", ?other, "Ignoring envelope kind on channel");
            }
        }
    }

    /// Send one envelope over the data channel; dropped when not open.
    async fn send_channel(&self, env: Envelope) {
        if self.dc.ready_state() != RTCDataChannelState::Open {
            debug!(event = "channel_send_dropped", "Dropping send on non-open channel");
            return;
        }
        match codec::encode_binary(&env) {
            Ok(frame) => {
                if let Err(e) = self.dc.send(&Bytes::from(frame)).await {
                    warn!(event = "channel_send_error", %e, "Channel send failed");
                }
            }
            Err(e) => warn!(event = "channel_encode_error", %e, "Failed to encode channel frame"),
        }
    }
}

// ── File chunk sink ──────────────────────────────────────────────────────────

/// Chunk sink over the data channel; binary codec, raw chunk bytes.
struct ChannelSink {
    dc: Arc<RTCDataChannel>,
}

impl ChunkSink for ChannelSink {
    fn is_ready(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&mut self, env: Envelope) -> Result<()> {
        let frame = codec::encode_binary(&env)?;
        self.dc.send(&Bytes::from(frame)).await?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
