//! Session wire messages.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tally_types::FlowId;

use crate::{Result, SessionError};

/// Globally unique identity of one end of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId {
    /// The flow owning this end.
    pub flow_id: FlowId,
    /// Index of the session within that flow.
    pub index: u32,
}

impl SessionId {
    /// Creates a session id.
    pub const fn new(flow_id: FlowId, index: u32) -> Self {
        Self { flow_id, index }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.flow_id, self.index)
    }
}

/// A typed message body, carried as a JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(serde_json::Value);

impl Payload {
    /// Serializes a value into a payload.
    pub fn of<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self(serde_json::to_value(value)?))
    }

    /// Decodes the payload as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.0.clone())?)
    }

    /// The raw JSON value.
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// A structured failure relayed to a counterparty when a flow aborts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Human readable description.
    pub message: String,
    /// Whether the failure was infrastructural rather than a protocol rejection.
    pub infrastructure: bool,
}

impl ErrorReport {
    /// A protocol-level rejection.
    pub fn rejection(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            infrastructure: false,
        }
    }

    /// An infrastructure failure.
    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            infrastructure: true,
        }
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum MessageType {
    Init = 1,
    Confirm = 2,
    Reject = 3,
    Data = 4,
    End = 5,
}

impl MessageType {
    fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(MessageType::Init),
            2 => Ok(MessageType::Confirm),
            3 => Ok(MessageType::Reject),
            4 => Ok(MessageType::Data),
            5 => Ok(MessageType::End),
            _ => Err(SessionError::InvalidMessage(format!(
                "unknown message type: {}",
                b
            ))),
        }
    }
}

/// A frame exchanged between session endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionMessage {
    /// Opens a session. Carries the initiator's first payload, if it sent first.
    Init {
        /// The initiator's end.
        initiator_session: SessionId,
        /// Protocol identifier selecting the responder logic.
        protocol: String,
        /// First payload (sequence number 0), if any.
        first_payload: Option<Payload>,
    },
    /// Accepts a session.
    Confirm {
        /// The initiator's end.
        initiator_session: SessionId,
        /// The responder's end.
        responder_session: SessionId,
    },
    /// Refuses a session, e.g. because no responder is registered for the protocol.
    Reject {
        /// The initiator's end.
        initiator_session: SessionId,
        /// Why the session was refused.
        reason: String,
    },
    /// A payload on an open session.
    Data {
        /// The receiving end.
        recipient_session: SessionId,
        /// Per-direction sequence number.
        seq: u64,
        /// The payload.
        payload: Payload,
    },
    /// The sender's flow has finished with the session.
    End {
        /// The receiving end.
        recipient_session: SessionId,
        /// Per-direction sequence number.
        seq: u64,
        /// Present if the sender's flow failed.
        error: Option<ErrorReport>,
    },
}

impl SessionMessage {
    fn message_type(&self) -> MessageType {
        match self {
            SessionMessage::Init { .. } => MessageType::Init,
            SessionMessage::Confirm { .. } => MessageType::Confirm,
            SessionMessage::Reject { .. } => MessageType::Reject,
            SessionMessage::Data { .. } => MessageType::Data,
            SessionMessage::End { .. } => MessageType::End,
        }
    }

    /// Short name used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self.message_type() {
            MessageType::Init => "init",
            MessageType::Confirm => "confirm",
            MessageType::Reject => "reject",
            MessageType::Data => "data",
            MessageType::End => "end",
        }
    }

    /// The local flow a received message is addressed to.
    pub fn target_flow(&self) -> Option<FlowId> {
        match self {
            SessionMessage::Init { .. } => None,
            SessionMessage::Confirm {
                initiator_session, ..
            }
            | SessionMessage::Reject {
                initiator_session, ..
            } => Some(initiator_session.flow_id),
            SessionMessage::Data {
                recipient_session, ..
            }
            | SessionMessage::End {
                recipient_session, ..
            } => Some(recipient_session.flow_id),
        }
    }

    /// Encodes the message: one type byte followed by the JSON body.
    pub fn encode(&self) -> Result<Bytes> {
        let body = serde_json::to_vec(self)?;
        let mut buf = BytesMut::with_capacity(body.len() + 1);
        buf.put_u8(self.message_type() as u8);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Decodes a message, checking the type byte against the body.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (&tag, body) = buf
            .split_first()
            .ok_or_else(|| SessionError::InvalidMessage("empty frame".into()))?;
        let expected = MessageType::from_byte(tag)?;
        let message: SessionMessage = serde_json::from_slice(body)
            .map_err(|e| SessionError::InvalidMessage(format!("malformed body: {}", e)))?;
        if message.message_type() != expected {
            return Err(SessionError::InvalidMessage(format!(
                "type byte {} does not match {} body",
                tag,
                message.kind()
            )));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(index: u32) -> SessionId {
        SessionId::new(FlowId::from_bytes([7u8; 16]), index)
    }

    #[test]
    fn test_encode_decode() {
        let message = SessionMessage::Data {
            recipient_session: session(2),
            seq: 9,
            payload: Payload::of(&vec![1u8, 2, 3]).unwrap(),
        };
        let bytes = message.encode().unwrap();
        assert_eq!(bytes[0], 4);
        assert_eq!(SessionMessage::decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(SessionMessage::decode(&[]).is_err());
        assert!(SessionMessage::decode(&[99, b'{', b'}']).is_err());
        assert!(SessionMessage::decode(&[1, b'x']).is_err());
    }

    #[test]
    fn test_decode_rejects_mismatched_tag() {
        let message = SessionMessage::Reject {
            initiator_session: session(0),
            reason: "no".into(),
        };
        let mut bytes = message.encode().unwrap().to_vec();
        bytes[0] = 1;
        assert!(matches!(
            SessionMessage::decode(&bytes),
            Err(SessionError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_target_flow() {
        let init = SessionMessage::Init {
            initiator_session: session(0),
            protocol: "p".into(),
            first_payload: None,
        };
        assert_eq!(init.target_flow(), None);
        let end = SessionMessage::End {
            recipient_session: session(1),
            seq: 0,
            error: None,
        };
        assert_eq!(end.target_flow(), Some(session(1).flow_id));
    }

    #[test]
    fn test_payload_decode_type_mismatch() {
        let payload = Payload::of(&"text").unwrap();
        assert!(payload.decode::<u64>().is_err());
        assert_eq!(payload.decode::<String>().unwrap(), "text");
    }
}
