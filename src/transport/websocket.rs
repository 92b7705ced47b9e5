// Socket.IO channel over tokio-tungstenite
// Runs one driver task per session: connect, authenticate, pump frames, reconnect with backoff on loss

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};

use super::events::{InboundEvent, OutboundEvent};
use super::socketio::{self, Packet};
use super::{ChannelHandle, Connector};
use crate::config::SyncConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// Upper bound on the open + auth exchange
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SocketIoConnector {
    config: SyncConfig,
}

impl SocketIoConnector {
    pub fn new(config: SyncConfig) -> Self {
        SocketIoConnector { config }
    }
}

impl Connector for SocketIoConnector {
    fn open(&self, token: &str) -> ChannelHandle {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(self.config.clone(), token.to_string(), out_rx, in_tx));
        ChannelHandle::new(out_tx, in_rx, Some(driver))
    }
}

/// How a single connection ended
enum Ended {
    /// The session dropped its side of the channel
    Closed,
    /// The server refused our credential; reconnecting would not help
    AuthRejected,
    /// Lost after a successful handshake
    Lost(String),
}

async fn drive(
    config: SyncConfig,
    token: String,
    mut outbound: mpsc::UnboundedReceiver<OutboundEvent>,
    inbound: mpsc::UnboundedSender<InboundEvent>,
) {
    let endpoint = config.channel_endpoint();
    let mut attempt: u32 = 0;

    loop {
        info!("Opening realtime channel to {} (attempt {})", endpoint, attempt + 1);
        match run_connection(&endpoint, &token, &mut outbound, &inbound).await {
            Ok(Ended::Closed) => {
                debug!("Channel closed by session");
                return;
            }
            Ok(Ended::AuthRejected) => {
                warn!("Channel credential rejected, not reconnecting");
                return;
            }
            Ok(Ended::Lost(reason)) => {
                warn!("Channel lost: {}", reason);
                // A successful handshake resets the backoff
                attempt = 0;
                if inbound.send(InboundEvent::Disconnected(reason)).is_err() {
                    return;
                }
            }
            Err(e) => {
                error!("Channel connect failed: {}", e);
                if inbound.send(InboundEvent::ConnectError(e.to_string())).is_err() {
                    return;
                }
            }
        }

        attempt += 1;
        if let Some(max) = config.max_reconnect_attempts {
            if attempt > max {
                error!("Giving up on realtime channel after {} attempts", max);
                return;
            }
        }
        let backoff = config.reconnect_delay(attempt);
        info!("Reconnecting in {:?}", backoff);
        tokio::time::sleep(backoff).await;
    }
}

async fn run_connection(
    endpoint: &str,
    token: &str,
    outbound: &mut mpsc::UnboundedReceiver<OutboundEvent>,
    inbound: &mpsc::UnboundedSender<InboundEvent>,
) -> Result<Ended> {
    let (mut ws, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(endpoint))
        .await
        .map_err(|_| anyhow!("timed out connecting to {}", endpoint))??;

    let liveness = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut ws, token)).await {
        Ok(Ok(liveness)) => liveness,
        Ok(Err(HandshakeError::Refused(reason))) => {
            let _ = inbound.send(InboundEvent::AuthRejected(reason));
            return Ok(Ended::AuthRejected);
        }
        Ok(Err(HandshakeError::Other(e))) => return Err(e),
        Err(_) => return Err(anyhow!("timed out during channel handshake")),
    };

    info!("Realtime channel connected");
    if inbound.send(InboundEvent::Connected).is_err() {
        return Ok(Ended::Closed);
    }

    loop {
        tokio::select! {
            frame = tokio::time::timeout(liveness, ws.next()) => {
                let frame = match frame {
                    Err(_) => return Ok(Ended::Lost("ping timeout".to_string())),
                    Ok(None) => return Ok(Ended::Lost("stream ended".to_string())),
                    Ok(Some(Err(e))) => return Ok(Ended::Lost(e.to_string())),
                    Ok(Some(Ok(frame))) => frame,
                };
                let text = match frame {
                    WsMessage::Text(text) => text,
                    WsMessage::Close(_) => return Ok(Ended::Lost("closed by server".to_string())),
                    _ => continue,
                };
                match socketio::decode(&text) {
                    Ok(Packet::Ping) => {
                        if let Err(e) = ws.send(WsMessage::Text(socketio::PONG.to_string())).await {
                            return Ok(Ended::Lost(e.to_string()));
                        }
                    }
                    Ok(Packet::Event { name, payload }) => match InboundEvent::from_named(&name, payload) {
                        Ok(Some(event)) => {
                            if inbound.send(event).is_err() {
                                return Ok(Ended::Closed);
                            }
                        }
                        Ok(None) => debug!("Ignoring unknown channel event {}", name),
                        Err(e) => warn!("Dropping malformed {} event: {}", name, e),
                    },
                    Ok(Packet::Disconnect) | Ok(Packet::Close) => {
                        return Ok(Ended::Lost("disconnected by server".to_string()));
                    }
                    Ok(other) => debug!("Ignoring channel packet {:?}", other),
                    Err(e) => warn!("Undecodable channel frame: {}", e),
                }
            }
            event = outbound.recv() => {
                let event = match event {
                    Some(event) => event,
                    None => {
                        let _ = ws.send(WsMessage::Text(socketio::encode_disconnect())).await;
                        let _ = ws.close(None).await;
                        return Ok(Ended::Closed);
                    }
                };
                let frame = socketio::encode_event(event.name(), &event.payload());
                debug!("Emitting {}", event.name());
                if let Err(e) = ws.send(WsMessage::Text(frame)).await {
                    return Ok(Ended::Lost(e.to_string()));
                }
            }
        }
    }
}

enum HandshakeError {
    Refused(String),
    Other(anyhow::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for HandshakeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        HandshakeError::Other(e.into())
    }
}

impl From<socketio::CodecError> for HandshakeError {
    fn from(e: socketio::CodecError) -> Self {
        HandshakeError::Other(e.into())
    }
}

/// Engine.IO open, then Socket.IO CONNECT with the token.
/// Returns the liveness window derived from the server's ping settings.
async fn handshake(ws: &mut WsStream, token: &str) -> std::result::Result<Duration, HandshakeError> {
    let mut liveness = None;
    while let Some(frame) = ws.next().await {
        let text = match frame? {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        match socketio::decode(&text)? {
            Packet::Open(info) => {
                debug!("Engine.IO session {} opened", info.sid);
                liveness = Some(Duration::from_millis(info.ping_interval + info.ping_timeout));
                ws.send(WsMessage::Text(socketio::encode_connect(token))).await?;
            }
            Packet::Ping => ws.send(WsMessage::Text(socketio::PONG.to_string())).await?,
            Packet::Connect(_) => {
                return Ok(liveness.unwrap_or(Duration::from_secs(45)));
            }
            Packet::ConnectError(reason) => return Err(HandshakeError::Refused(reason)),
            other => debug!("Ignoring packet during handshake: {:?}", other),
        }
    }
    Err(HandshakeError::Other(anyhow!("stream ended during handshake")))
}
