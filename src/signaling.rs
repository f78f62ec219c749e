//! Messages exchanged with the signaling relay and the channel abstraction
//! the engine sends them through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{NegotiationError, Result};
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::session::Role;
use crate::utils::random_id;

/// Everything the relay can deliver to this endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundSignal {
    #[serde(rename_all = "camelCase")]
    Paired {
        session_id: String,
        #[serde(default)]
        peer_identity: Option<String>,
        role: Role,
    },
    #[serde(rename_all = "camelCase")]
    Offer {
        peer_identity: String,
        description: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        peer_identity: String,
        description: SessionDescription,
    },
    #[serde(rename_all = "camelCase")]
    Candidate {
        peer_identity: String,
        candidate: IceCandidate,
    },
    PartnerDisconnected,
    /// Chat line from the partner.
    ChatMessage { message: String },
    /// System text from the relay (queue position, partner left).
    Notification { message: String },
}

impl InboundSignal {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundSignal::Paired { .. } => "paired",
            InboundSignal::Offer { .. } => "offer",
            InboundSignal::Answer { .. } => "answer",
            InboundSignal::Candidate { .. } => "candidate",
            InboundSignal::PartnerDisconnected => "partnerDisconnected",
            InboundSignal::ChatMessage { .. } => "chatMessage",
            InboundSignal::Notification { .. } => "notification",
        }
    }
}

/// Everything the engine sends. Peer messages are addressed by identity;
/// room control messages are scoped by the relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundSignal {
    Offer {
        to: String,
        description: SessionDescription,
    },
    Answer {
        to: String,
        description: SessionDescription,
    },
    Candidate {
        to: String,
        candidate: IceCandidate,
    },
    JoinQueue,
    #[serde(rename_all = "camelCase")]
    EndSession { session_id: String },
    #[serde(rename_all = "camelCase")]
    ChatMessage { session_id: String, message: String },
}

/// Wire wrapper: message id plus unix timestamp.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignalEnvelope {
    pub id: String,
    pub ts: i64,
    pub message: OutboundSignal,
}

impl SignalEnvelope {
    pub fn new(message: OutboundSignal) -> Self {
        Self {
            id: random_id(),
            ts: chrono::Utc::now().timestamp(),
            message,
        }
    }
}

pub fn encode_envelope(envelope: &SignalEnvelope) -> Result<String> {
    Ok(serde_json::to_string(envelope)?)
}

pub fn decode_inbound(raw: &str) -> Result<InboundSignal> {
    let signal: InboundSignal = serde_json::from_str(raw)?;
    trace!(kind = signal.kind(), "inbound signal decoded");
    Ok(signal)
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, signal: OutboundSignal) -> Result<()>;
}

/// Hands encoded envelopes to whatever task owns the relay connection.
#[derive(Clone)]
pub struct ChannelSignaling {
    outbound: mpsc::UnboundedSender<String>,
}

impl ChannelSignaling {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (Self { outbound }, rx)
    }
}

#[async_trait]
impl SignalingChannel for ChannelSignaling {
    async fn send(&self, signal: OutboundSignal) -> Result<()> {
        let raw = encode_envelope(&SignalEnvelope::new(signal))?;
        self.outbound
            .send(raw)
            .map_err(|_| NegotiationError::Signaling("relay connection closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_pairing_event() {
        let signal = decode_inbound(
            r#"{"type":"paired","sessionId":"room-1","peerIdentity":"bob","role":"initiator"}"#,
        )
        .unwrap();
        assert_eq!(
            signal,
            InboundSignal::Paired {
                session_id: "room-1".into(),
                peer_identity: Some("bob".into()),
                role: Role::Initiator,
            }
        );
    }

    #[test]
    fn pairing_without_peer_identity() {
        let signal =
            decode_inbound(r#"{"type":"paired","sessionId":"r","role":"responder"}"#).unwrap();
        assert!(matches!(
            signal,
            InboundSignal::Paired {
                peer_identity: None,
                role: Role::Responder,
                ..
            }
        ));
    }

    #[test]
    fn decodes_candidate_and_disconnect() {
        let raw = json!({
            "type": "candidate",
            "peerIdentity": "bob",
            "candidate": { "candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host", "sdpMid": "0", "sdpMLineIndex": 0 }
        });
        let signal = decode_inbound(&raw.to_string()).unwrap();
        assert_eq!(signal.kind(), "candidate");

        let gone = decode_inbound(r#"{"type":"partnerDisconnected"}"#).unwrap();
        assert_eq!(gone, InboundSignal::PartnerDisconnected);
    }

    #[test]
    fn unknown_message_is_an_error() {
        assert!(matches!(
            decode_inbound(r#"{"type":"chat","text":"hi"}"#),
            Err(NegotiationError::Json(_))
        ));
    }

    #[test]
    fn envelope_shape() {
        let envelope = SignalEnvelope::new(OutboundSignal::EndSession {
            session_id: "room-1".into(),
        });
        let value: serde_json::Value =
            serde_json::from_str(&encode_envelope(&envelope).unwrap()).unwrap();
        assert_eq!(value["id"].as_str().map(str::len), Some(16));
        assert!(value["ts"].as_i64().unwrap() > 0);
        assert_eq!(
            value["message"],
            json!({ "type": "endSession", "sessionId": "room-1" })
        );

        let offer = serde_json::to_value(OutboundSignal::Offer {
            to: "bob".into(),
            description: SessionDescription::offer("v=0"),
        })
        .unwrap();
        assert_eq!(
            offer,
            json!({ "type": "offer", "to": "bob", "description": { "type": "offer", "sdp": "v=0" } })
        );
    }

    #[test]
    fn chat_and_notification_frames() {
        let chat = decode_inbound(r#"{"type":"chatMessage","message":"hi there"}"#).unwrap();
        assert_eq!(
            chat,
            InboundSignal::ChatMessage {
                message: "hi there".into()
            }
        );
        let note =
            decode_inbound(r#"{"type":"notification","message":"Partner found"}"#).unwrap();
        assert_eq!(note.kind(), "notification");

        let outbound = serde_json::to_value(OutboundSignal::ChatMessage {
            session_id: "room-1".into(),
            message: "hello".into(),
        })
        .unwrap();
        assert_eq!(
            outbound,
            json!({ "type": "chatMessage", "sessionId": "room-1", "message": "hello" })
        );
    }

    #[tokio::test]
    async fn channel_signaling_forwards_envelopes() {
        let (channel, mut rx) = ChannelSignaling::new();
        channel.send(OutboundSignal::JoinQueue).await.unwrap();
        let raw = rx.recv().await.unwrap();
        let envelope: SignalEnvelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(envelope.message, OutboundSignal::JoinQueue);

        drop(rx);
        assert!(matches!(
            channel.send(OutboundSignal::JoinQueue).await,
            Err(NegotiationError::Signaling(_))
        ));
    }
}
