//! Message model for the delivery protocol.
//!
//! Every frame on the wire is an envelope. After the handshake all
//! envelopes are sealed:
//!
//! ```text
//! {"payload":"<base64(nonce ‖ tag ‖ ciphertext)>"}
//! ```
//!
//! and the ciphertext decrypts to one JSON [`Message`]. The very first
//! message may instead arrive as a bare `{"type":"handshake","clientId":..}`
//! since no session key is negotiated.
//!
//! # Message Types
//!
//! | type           | direction     | fields                          |
//! |----------------|---------------|---------------------------------|
//! | `handshake`    | client→server | `clientId`                      |
//! | `ack`          | client→server | `eventId`                       |
//! | `client-event` | client→server | opaque                          |
//! | `pong`         | client→server | none                            |
//! | `ping`         | server→client | `timestamp`                     |
//! | `server-event` | server→client | `eventId, eventNumber, timestamp` |

use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::crypto::{self, CipherError, CipherKey};
use crate::socket::framing;

/// Every `type` tag this protocol defines.
pub const MESSAGE_TYPES: [&str; 6] = [
    "handshake",
    "ack",
    "client-event",
    "pong",
    "ping",
    "server-event",
];

/// Reasons a decoded frame is rejected. All of them are fatal to the
/// connection that produced the frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is valid JSON but not a usable envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(&'static str),

    /// The sealed payload failed to decrypt.
    #[error(transparent)]
    Cipher(#[from] CipherError),

    /// The decrypted payload is not JSON, or a field has the wrong shape.
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    /// The message has no string `type`.
    #[error("message has no type")]
    MissingType,

    /// The `type` is not one this protocol defines.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// A handshake without a usable `clientId`.
    #[error("handshake missing clientId")]
    MissingClientId,

    /// A message other than a handshake arrived first.
    #[error("expected handshake, got {0}")]
    HandshakeRequired(&'static str),

    /// An unsealed message arrived after the handshake.
    #[error("plaintext {0} message after handshake")]
    PlaintextAfterHandshake(&'static str),

    /// The client sent a message only the server may send.
    #[error("{0} is a server-to-client message")]
    WrongDirection(&'static str),

    /// A second handshake tried to rebind the connection.
    #[error("handshake for {requested} on a connection bound to {current}")]
    IdentityChange {
        /// Identity the connection already has.
        current: String,
        /// Identity the new handshake asked for.
        requested: String,
    },
}

/// A protocol message, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Binds the connection to a client identity.
    Handshake {
        /// Client identity. Numbers on the wire are kept as their decimal text.
        #[serde(
            rename = "clientId",
            default,
            deserialize_with = "deserialize_client_id",
            skip_serializing_if = "Option::is_none"
        )]
        client_id: Option<String>,
    },

    /// Acknowledges a delivered server event.
    Ack {
        /// Id of the acknowledged event. Numbers are kept as their decimal
        /// text; a missing or unusable id never matches.
        #[serde(
            rename = "eventId",
            default,
            deserialize_with = "deserialize_event_id",
            skip_serializing_if = "Option::is_none"
        )]
        event_id: Option<String>,
    },

    /// Opaque client payload, persisted as-is.
    ClientEvent(Map<String, Value>),

    /// Heartbeat reply.
    Pong {},

    /// Heartbeat probe.
    Ping {
        /// Server wall clock in unix milliseconds.
        timestamp: i64,
    },

    /// One event from the client's queue.
    ServerEvent {
        /// Queue entry id.
        #[serde(rename = "eventId")]
        event_id: String,
        /// Sequence number as stored in the queue entry.
        #[serde(rename = "eventNumber", default, skip_serializing_if = "Option::is_none")]
        event_number: Option<String>,
        /// Timestamp as stored in the queue entry.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
}

impl Message {
    /// Build a handshake for `client_id`.
    pub fn handshake(client_id: impl Into<String>) -> Self {
        Self::Handshake {
            client_id: Some(client_id.into()),
        }
    }

    /// Build an ack for `event_id`.
    pub fn ack(event_id: impl Into<String>) -> Self {
        Self::Ack {
            event_id: Some(event_id.into()),
        }
    }

    /// The wire `type` tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::Ack { .. } => "ack",
            Self::ClientEvent(_) => "client-event",
            Self::Pong {} => "pong",
            Self::Ping { .. } => "ping",
            Self::ServerEvent { .. } => "server-event",
        }
    }

    /// Whether only the server may send this message.
    pub fn is_server_originated(&self) -> bool {
        matches!(self, Self::Ping { .. } | Self::ServerEvent { .. })
    }

    /// Parse a decoded JSON object into a message.
    ///
    /// An unrecognized `type` yields [`ProtocolError::UnknownType`] rather
    /// than a generic deserialization error.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;
        if !MESSAGE_TYPES.contains(&kind) {
            return Err(ProtocolError::UnknownType(kind.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Encrypt this message and frame it as `{"payload": ..}\0`.
    pub fn seal(&self, key: &CipherKey) -> Result<Vec<u8>, ProtocolError> {
        let plaintext = serde_json::to_vec(self)?;
        let payload = crypto::encrypt(&plaintext, key)?;
        Ok(framing::encode(&SealedEnvelope { payload })?)
    }
}

/// Accepts a JSON string or number; anything else is a shape error.
fn deserialize_client_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) => Ok(Some(id)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "clientId must be a string or number, got {other}"
        ))),
    }
}

/// Like [`deserialize_client_id`], but any other shape reads as no id so
/// the ack still reaches the invalid-ack policy.
fn deserialize_event_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(id)) => Some(id),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Serialize)]
struct SealedEnvelope {
    payload: String,
}

/// A decoded frame, classified before decryption.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// `{"payload": "<cipher string>"}`.
    Sealed(String),
    /// A bare message object (legal only for the first handshake).
    Plain(Value),
}

impl Envelope {
    /// Classify a frame decoded by the framer.
    pub fn classify(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(object) = value else {
            return Err(ProtocolError::MalformedEnvelope("not a JSON object"));
        };
        match object.get("payload") {
            Some(Value::String(payload)) => Ok(Self::Sealed(payload.clone())),
            Some(_) => Err(ProtocolError::MalformedEnvelope("payload is not a string")),
            None if object.contains_key("type") => Ok(Self::Plain(Value::Object(object))),
            None => Err(ProtocolError::MalformedEnvelope(
                "missing both type and payload",
            )),
        }
    }

    /// Whether this envelope arrived unencrypted.
    pub fn is_plain(&self) -> bool {
        matches!(self, Self::Plain(_))
    }

    /// Decrypt (if sealed) and parse the message inside.
    pub fn open(self, key: &CipherKey) -> Result<Message, ProtocolError> {
        match self {
            Self::Sealed(payload) => {
                let plaintext = crypto::decrypt(&payload, key)?;
                let value: Value = serde_json::from_slice(&plaintext)?;
                Message::from_value(value)
            }
            Self::Plain(value) => Message::from_value(value),
        }
    }
}
