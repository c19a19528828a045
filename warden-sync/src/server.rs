//! WebSocket relay for the sync topic.
//!
//! Architecture:
//! ```text
//! Authority ──┐                          ┌──► Subordinate A
//!             ├── hello ── SyncChannel ──┼──► Subordinate B
//! Sub A ──────┘   (roster)  (broadcast)  └──► ...
//! ```
//!
//! The relay holds no protocol state. It keeps the session roster, fans each
//! envelope out to every other connection, and never echoes a frame back to
//! its origin. A connection must open with a `hello` frame; envelopes whose
//! sender differs from the hello identity are dropped.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use warden_core::{Member, SubordinateDirectory};

use crate::channel::SyncChannel;
use crate::protocol::Frame;

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum simultaneously online peers
    pub max_peers: usize,
    /// Frames buffered per connection before it starts losing them
    pub channel_capacity: usize,
    /// Ping interval in seconds; 0 disables pings
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers: 100,
            channel_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_relayed: u64,
    pub frames_rejected: u64,
}

pub struct RelayServer {
    config: ServerConfig,
    channel: Arc<SyncChannel>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let channel = Arc::new(SyncChannel::new(config.channel_capacity));
        Self {
            config,
            channel,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn channel(&self) -> Arc<SyncChannel> {
        self.channel.clone()
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Bind and accept connections until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let channel = self.channel.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, channel, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        channel: Arc<SyncChannel>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::serve(ws_stream, addr, &channel, &stats, &config).await;
        stats.write().await.active_connections -= 1;
        result
    }

    async fn serve(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        channel: &SyncChannel,
        stats: &RwLock<ServerStats>,
        config: &ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Nothing is relayed until the peer identifies itself
        let mut peer: Option<Member> = None;
        while let Some(msg) = ws_receiver.next().await {
            let bytes = match msg {
                Ok(Message::Binary(data)) => data.to_vec(),
                Ok(Message::Text(text)) => text.as_bytes().to_vec(),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            match Frame::decode(&bytes) {
                Ok(Frame::Hello { peer: hello }) => {
                    peer = Some(hello);
                    break;
                }
                Ok(other) => log::debug!("Ignoring {:?} frame before hello from {addr}", other.origin()),
                Err(e) => log::warn!("Malformed frame before hello from {addr}: {e}"),
            }
        }

        let Some(peer) = peer else {
            return Ok(());
        };

        if channel.online_count() >= config.max_peers {
            log::warn!("Rejecting {} from {addr}: relay full", peer.name);
            let _ = ws_sender.send(Message::Close(None)).await;
            return Ok(());
        }

        let roster = Frame::Roster {
            members: channel.members(),
        }
        .encode()?;
        ws_sender.send(Message::Binary(roster.into())).await?;

        let mut broadcast_rx = channel.subscribe_raw();
        let peer = channel.admit(peer);
        log::info!("{} ({:?}) joined from {addr}", peer.name, peer.role);

        let heartbeat = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let bytes = match msg {
                        Some(Ok(Message::Binary(data))) => data.to_vec(),
                        Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws_sender.send(Message::Pong(data)).await;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::debug!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => continue,
                    };

                    match Frame::decode(&bytes) {
                        Ok(Frame::Message(envelope)) if envelope.sender == peer.id => {
                            channel.publish_raw(Arc::new(bytes));
                            stats.write().await.frames_relayed += 1;
                        }
                        Ok(Frame::Message(envelope)) => {
                            log::warn!("{} tried to publish as {}", peer.id, envelope.sender);
                            stats.write().await.frames_rejected += 1;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            log::warn!("Malformed frame from {addr}: {e}");
                            stats.write().await.frames_rejected += 1;
                        }
                    }
                }

                frame = broadcast_rx.recv() => {
                    match frame {
                        Ok(bytes) => {
                            let from_self = Frame::decode(&bytes)
                                .ok()
                                .and_then(|f| f.origin())
                                .is_some_and(|origin| origin == peer.id);
                            if from_self {
                                continue;
                            }
                            if ws_sender.send(Message::Binary(bytes.to_vec().into())).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("{} lagged, {n} frames lost", peer.name);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                _ = ticker.tick(), if config.heartbeat_interval_secs > 0 => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        channel.leave(&peer.id);
        log::info!("{} disconnected from {addr}", peer.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers, 100);
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_server_config_from_json() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"bind_addr": "0.0.0.0:7000", "max_peers": 8}"#).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.max_peers, 8);
        assert_eq!(config.channel_capacity, 256);
    }

    #[tokio::test]
    async fn test_new_server_has_empty_roster() {
        let server = RelayServer::with_defaults();
        assert!(server.channel().members().is_empty());
        assert_eq!(server.stats().await.total_connections, 0);
    }
}
