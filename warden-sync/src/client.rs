//! WebSocket client bridging a local [`SyncChannel`] to a relay.
//!
//! Envelopes published locally by this client's own member go out to the
//! relay; envelopes arriving from the relay are republished locally, where
//! the sessions pick them up. Roster frames keep the local directory in step
//! with the relay's.
//!
//! There is no offline queue. Frames published while disconnected are lost;
//! subordinates recover through catch-up and reconcile.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use warden_core::Member;

use crate::channel::SyncChannel;
use crate::protocol::{Frame, ProtocolError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct RelayClient {
    member: Member,
    state: Arc<RwLock<ConnectionState>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayClient {
    /// Connect to `url`, announce `member`, and start bridging `local`.
    pub async fn connect(
        url: &str,
        member: Member,
        local: Arc<SyncChannel>,
    ) -> Result<Self, ProtocolError> {
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));

        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            log::warn!("Failed to connect to {url}: {e}");
            ProtocolError::ConnectionClosed
        })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: outgoing queue → socket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let hello = Frame::Hello {
            peer: member.clone(),
        }
        .encode()?;
        out_tx
            .send(hello)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        // Forward task: this member's local envelopes → outgoing queue
        let mut local_rx = local.subscribe_raw();
        let own_id = member.id;
        let forward_tx = out_tx.clone();
        let forward = tokio::spawn(async move {
            loop {
                match local_rx.recv().await {
                    Ok(bytes) => {
                        let ours = matches!(
                            Frame::decode(&bytes),
                            Ok(Frame::Message(ref envelope)) if envelope.sender == own_id
                        );
                        if ours && forward_tx.send(bytes.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => log::warn!("Relay forwarder lagged, {n} frames lost"),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        // Reader task: socket → local channel and directory
        let reader_state = state.clone();
        let reader_member = member.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let bytes = match msg {
                    Ok(Message::Binary(data)) => data.to_vec(),
                    Ok(Message::Text(text)) => text.as_bytes().to_vec(),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match Frame::decode(&bytes) {
                    Ok(Frame::Message(envelope)) if envelope.sender != reader_member.id => {
                        local.publish_raw(Arc::new(bytes));
                    }
                    Ok(Frame::Message(_)) => {}
                    Ok(Frame::Roster { members }) => {
                        log::debug!("Roster received: {} members", members.len());
                        local.replace_roster(members, &reader_member);
                    }
                    Ok(Frame::PeerJoined { peer }) => {
                        local.upsert_member(peer);
                    }
                    Ok(Frame::PeerLeft { peer_id }) => {
                        local.mark_offline(&peer_id);
                    }
                    Ok(Frame::Hello { .. }) => {}
                    Err(e) => log::warn!("Dropping malformed frame from relay: {e}"),
                }
            }

            *reader_state.write().await = ConnectionState::Disconnected;
            log::info!("{} disconnected from relay", reader_member.name);
        });

        *state.write().await = ConnectionState::Connected;
        log::info!("{} connected to {url}", member.name);

        Ok(Self {
            member,
            state,
            tasks: vec![writer, forward, reader],
        })
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Stop bridging. Dropping the writer closes the socket.
    pub async fn disconnect(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
