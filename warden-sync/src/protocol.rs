//! JSON wire protocol for the settings sync topic.
//!
//! Messages carried on the topic:
//! ```text
//! {type:"refresh"}
//! {type:"push", soft, id, namespace, key, value, revision?, targetIds?, requiresReload}
//! {type:"soft-clear", id}
//! {type:"ctrl-refresh"}
//! {type:"ctrl-push", namespace, action, value:[{key, modifiers}], targetIds?, soft?, revision?}
//! {type:"ctrl-soft-clear", namespace, action}
//! ```
//!
//! Every message travels inside an [`Envelope`] naming its sender, and the
//! relay wraps envelopes and roster changes in a [`Frame`]. Decoding
//! validates the message once, at the transport boundary; handlers only
//! ever see well-formed values.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_core::{BindingSet, GovernedId, Member, PeerId, Targets};

/// Scalar setting push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub soft: bool,
    pub id: String,
    pub namespace: String,
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ids: Option<Targets>,
    #[serde(default)]
    pub requires_reload: bool,
}

/// Key-binding push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CtrlPushMessage {
    pub namespace: String,
    pub action: String,
    pub value: BindingSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ids: Option<Targets>,
    #[serde(default)]
    pub soft: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
}

/// Messages published on the sync topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncMessage {
    /// Re-check the lock store.
    Refresh,
    Push(PushMessage),
    /// Ask the authority to drop an advisory record.
    SoftClear { id: String },
    CtrlRefresh,
    CtrlPush(CtrlPushMessage),
    CtrlSoftClear { namespace: String, action: String },
}

impl SyncMessage {
    /// Reject messages that parse but cannot be resolved to an identifier.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            SyncMessage::Refresh | SyncMessage::CtrlRefresh => Ok(()),
            SyncMessage::Push(push) => {
                let id = GovernedId::new(push.namespace.clone(), push.key.clone());
                if !id.is_valid() {
                    return Err(ProtocolError::Malformed(format!(
                        "push {:?} has an empty key or an empty or dotted namespace",
                        push.id
                    )));
                }
                if id.as_key() != push.id {
                    return Err(ProtocolError::Malformed(format!(
                        "push id {:?} does not match {id}",
                        push.id
                    )));
                }
                Ok(())
            }
            SyncMessage::SoftClear { id } => GovernedId::parse(id)
                .map(|_| ())
                .map_err(|e| ProtocolError::Malformed(e.to_string())),
            SyncMessage::CtrlPush(CtrlPushMessage {
                namespace, action, ..
            })
            | SyncMessage::CtrlSoftClear { namespace, action } => {
                if namespace.is_empty() || action.is_empty() {
                    Err(ProtocolError::Malformed(
                        "control message is missing namespace or action".into(),
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SyncMessage::Refresh => "refresh",
            SyncMessage::Push(_) => "push",
            SyncMessage::SoftClear { .. } => "soft-clear",
            SyncMessage::CtrlRefresh => "ctrl-refresh",
            SyncMessage::CtrlPush(_) => "ctrl-push",
            SyncMessage::CtrlSoftClear { .. } => "ctrl-soft-clear",
        }
    }
}

/// A message plus the identity of its publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: PeerId,
    pub message: SyncMessage,
}

impl Envelope {
    pub fn new(sender: PeerId, message: SyncMessage) -> Self {
        Self { sender, message }
    }
}

/// Unit of transfer on the channel and the relay socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "kebab-case")]
pub enum Frame {
    /// First frame a client sends after connecting.
    Hello { peer: Member },
    /// Current membership, sent to a client right after its hello.
    Roster { members: Vec<Member> },
    PeerJoined { peer: Member },
    PeerLeft { peer_id: PeerId },
    Message(Envelope),
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse and validate a frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let frame: Frame = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if let Frame::Message(envelope) = &frame {
            envelope.message.validate()?;
        }
        Ok(frame)
    }

    /// The peer this frame originates from, if it names one.
    pub fn origin(&self) -> Option<PeerId> {
        match self {
            Frame::Hello { peer } | Frame::PeerJoined { peer } => Some(peer.id),
            Frame::PeerLeft { peer_id } => Some(*peer_id),
            Frame::Message(envelope) => Some(envelope.sender),
            Frame::Roster { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}
