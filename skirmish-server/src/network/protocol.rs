//! Protocol Messages
//!
//! Wire format for observer <-> authority traffic over WebSocket. Every frame
//! is a JSON envelope `{type, payload?}`. Commands may carry a request `id`;
//! state events carry the event `seq` and, on the submitter's copy, the
//! `requestId` of the command that caused them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::combat::action::ActionRequest;
use crate::combat::engine::CombatSnapshot;
use crate::combat::error::Rejection;
use crate::combat::events::CombatEvent;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

/// Raw envelope shared by both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

impl Envelope {
    fn new(kind: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            seq: None,
            request_id: None,
            payload,
        }
    }

    /// Build from an adjacently tagged `{type, payload}` value.
    fn from_tagged(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::MissingField("type"));
        };
        let kind = match map.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(ProtocolError::MissingField("type")),
        };
        Ok(Self::new(kind, map.remove("payload")))
    }

    /// Re-join into a `{type, payload}` value for typed decoding.
    fn tagged(&self) -> Value {
        json!({
            "type": self.kind,
            "payload": self.payload.clone().unwrap_or_else(|| json!({})),
        })
    }

    fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from an observer to the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// A combat command (`MOVE`, `ATTACK`, ...).
    Command {
        request_id: Option<String>,
        request: ActionRequest,
    },

    /// Heartbeat.
    Ping { timestamp: u64 },

    /// Ask for a fresh `COMBAT_STATE`.
    Resync,

    /// Detach from the session.
    Leave,
}

#[derive(Serialize, Deserialize)]
struct PingPayload {
    timestamp: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PongPayload {
    timestamp: u64,
    server_time: u64,
}

impl ClientMessage {
    pub fn command(request_id: impl Into<String>, request: ActionRequest) -> Self {
        ClientMessage::Command {
            request_id: Some(request_id.into()),
            request,
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let envelope = match self {
            ClientMessage::Command {
                request_id,
                request,
            } => {
                let mut envelope = Envelope::from_tagged(serde_json::to_value(request)?)?;
                envelope.id = request_id.clone();
                envelope
            }
            ClientMessage::Ping { timestamp } => Envelope::new(
                "PING",
                Some(serde_json::to_value(PingPayload {
                    timestamp: *timestamp,
                })?),
            ),
            ClientMessage::Resync => Envelope::new("RESYNC", None),
            ClientMessage::Leave => Envelope::new("LEAVE", None),
        };
        envelope.to_json()
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(s)?;
        match envelope.kind.as_str() {
            "PING" => {
                let payload = envelope.payload.ok_or(ProtocolError::MissingField("payload"))?;
                let ping: PingPayload = serde_json::from_value(payload)?;
                Ok(ClientMessage::Ping {
                    timestamp: ping.timestamp,
                })
            }
            "RESYNC" => Ok(ClientMessage::Resync),
            "LEAVE" => Ok(ClientMessage::Leave),
            kind if ActionRequest::TYPE_NAMES.contains(&kind) => Ok(ClientMessage::Command {
                request: serde_json::from_value(envelope.tagged())?,
                request_id: envelope.id,
            }),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    /// Request id, for echoing in an `ERROR` when the command is rejected.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Command { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from the authority to an observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// A state event; `seq` is gapless per session.
    Event {
        seq: u64,
        request_id: Option<String>,
        event: CombatEvent,
    },

    /// `COMBAT_STATE`: full snapshot on connect and resync.
    State(Box<CombatSnapshot>),

    /// `ERROR`: rejected command, sent to the submitter only.
    Error {
        request_id: Option<String>,
        rejection: Rejection,
    },

    /// Heartbeat reply.
    Pong { timestamp: u64, server_time: u64 },
}

impl ServerMessage {
    /// Wire `type` name.
    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::Event { event, .. } => event.type_name(),
            ServerMessage::State(_) => "COMBAT_STATE",
            ServerMessage::Error { .. } => "ERROR",
            ServerMessage::Pong { .. } => "PONG",
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let envelope = match self {
            ServerMessage::Event {
                seq,
                request_id,
                event,
            } => {
                let mut envelope = Envelope::from_tagged(serde_json::to_value(event)?)?;
                envelope.seq = Some(*seq);
                envelope.request_id = request_id.clone();
                envelope
            }
            ServerMessage::State(snapshot) => {
                Envelope::new("COMBAT_STATE", Some(serde_json::to_value(snapshot)?))
            }
            ServerMessage::Error {
                request_id,
                rejection,
            } => {
                let mut envelope = Envelope::new("ERROR", Some(serde_json::to_value(rejection)?));
                envelope.request_id = request_id.clone();
                envelope
            }
            ServerMessage::Pong {
                timestamp,
                server_time,
            } => Envelope::new(
                "PONG",
                Some(serde_json::to_value(PongPayload {
                    timestamp: *timestamp,
                    server_time: *server_time,
                })?),
            ),
        };
        envelope.to_json()
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(s)?;
        match envelope.kind.as_str() {
            "COMBAT_STATE" => {
                let payload = envelope.payload.ok_or(ProtocolError::MissingField("payload"))?;
                Ok(ServerMessage::State(Box::new(serde_json::from_value(payload)?)))
            }
            "ERROR" => {
                let payload = envelope.payload.ok_or(ProtocolError::MissingField("payload"))?;
                Ok(ServerMessage::Error {
                    rejection: serde_json::from_value(payload)?,
                    request_id: envelope.request_id,
                })
            }
            "PONG" => {
                let payload = envelope.payload.ok_or(ProtocolError::MissingField("payload"))?;
                let pong: PongPayload = serde_json::from_value(payload)?;
                Ok(ServerMessage::Pong {
                    timestamp: pong.timestamp,
                    server_time: pong.server_time,
                })
            }
            kind if CombatEvent::TYPE_NAMES.contains(&kind) => Ok(ServerMessage::Event {
                event: serde_json::from_value(envelope.tagged())?,
                seq: envelope.seq.ok_or(ProtocolError::MissingField("seq"))?,
                request_id: envelope.request_id,
            }),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
