//! Wire protocol message types.
//!
//! All communication between QNet nodes uses JSON-encoded messages carried in
//! length-prefixed frames (see [`crate::transport`]). On the wire a message is
//! a flat envelope whose `payload` is an open key/value map; in memory the
//! payload is a [`Payload`] variant chosen by `message_type`, so handlers get
//! a concrete shape per type. Keys a payload struct does not know about are
//! kept in its `extra` map and written back out unchanged.

use crate::error::DecodeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Recipient id used for messages fanned out to every peer.
pub const BROADCAST: &str = "broadcast";

/// Recipient id used before the remote node's id is known.
pub const UNKNOWN_RECIPIENT: &str = "unknown";

/// The closed set of message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Handshake,
    KeyExchange,
    Application,
    Contract,
    StateSync,
    EvolutionEvent,
    Heartbeat,
}

impl MessageType {
    pub const ALL: [MessageType; 7] = [
        Self::Handshake,
        Self::KeyExchange,
        Self::Application,
        Self::Contract,
        Self::StateSync,
        Self::EvolutionEvent,
        Self::Heartbeat,
    ];

    /// Wire name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::KeyExchange => "quantum_key_exchange",
            Self::Application => "organism_message",
            Self::Contract => "smart_contract",
            Self::StateSync => "consciousness_sync",
            Self::EvolutionEvent => "evolution_event",
            Self::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownType(s.to_string()))
    }
}

/// Identity announcement sent when first contacting a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub node_id: String,
    pub capabilities: Vec<String>,
    pub consciousness_level: f64,
    pub quantum_coherence: f64,
    /// Port the sender listens on, so the receiver can reach it later.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Key material carried in a key exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyOffer {
    pub key_id: String,
    /// Hex-encoded secret material.
    pub secret_material: String,
    /// Unix seconds.
    pub created_at: f64,
    /// Unix seconds.
    pub expires_at: f64,
}

/// Key exchange request (no offer) or key delivery (with offer).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyExchangePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<KeyOffer>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Encrypted application ("organism") message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationPayload {
    pub organism_type: String,
    /// Hex-encoded ciphertext.
    pub encrypted_data: String,
    /// Key the data was encrypted under. Lets the receiver pick the previous
    /// key for messages that were in flight across a rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Governance contract, forwarded untouched to the governance collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Periodic state broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSyncPayload {
    pub consciousness_level: f64,
    pub quantum_coherence: f64,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Evolution event, forwarded untouched to the evolution collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvolutionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Liveness ping, also used as a plain acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consciousness_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantum_coherence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HeartbeatPayload {
    /// The `{status: "acknowledged"}` reply.
    pub fn acknowledged() -> Self {
        Self {
            status: Some("acknowledged".to_string()),
            ..Self::default()
        }
    }
}

/// Typed payload, one variant per [`MessageType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Handshake(HandshakePayload),
    KeyExchange(KeyExchangePayload),
    Application(ApplicationPayload),
    Contract(ContractPayload),
    StateSync(StateSyncPayload),
    EvolutionEvent(EvolutionPayload),
    Heartbeat(HeartbeatPayload),
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Handshake(_) => MessageType::Handshake,
            Self::KeyExchange(_) => MessageType::KeyExchange,
            Self::Application(_) => MessageType::Application,
            Self::Contract(_) => MessageType::Contract,
            Self::StateSync(_) => MessageType::StateSync,
            Self::EvolutionEvent(_) => MessageType::EvolutionEvent,
            Self::Heartbeat(_) => MessageType::Heartbeat,
        }
    }

    /// Parse the open wire map into the shape required by `message_type`.
    pub fn from_map(
        message_type: MessageType,
        map: Map<String, Value>,
    ) -> Result<Self, serde_json::Error> {
        let value = Value::Object(map);
        Ok(match message_type {
            MessageType::Handshake => Self::Handshake(serde_json::from_value(value)?),
            MessageType::KeyExchange => Self::KeyExchange(serde_json::from_value(value)?),
            MessageType::Application => Self::Application(serde_json::from_value(value)?),
            MessageType::Contract => Self::Contract(serde_json::from_value(value)?),
            MessageType::StateSync => Self::StateSync(serde_json::from_value(value)?),
            MessageType::EvolutionEvent => Self::EvolutionEvent(serde_json::from_value(value)?),
            MessageType::Heartbeat => Self::Heartbeat(serde_json::from_value(value)?),
        })
    }

    /// Flatten back into the open wire map.
    pub fn to_map(&self) -> Result<Map<String, Value>, serde_json::Error> {
        let value = match self {
            Self::Handshake(p) => serde_json::to_value(p)?,
            Self::KeyExchange(p) => serde_json::to_value(p)?,
            Self::Application(p) => serde_json::to_value(p)?,
            Self::Contract(p) => serde_json::to_value(p)?,
            Self::StateSync(p) => serde_json::to_value(p)?,
            Self::EvolutionEvent(p) => serde_json::to_value(p)?,
            Self::Heartbeat(p) => serde_json::to_value(p)?,
        };
        match value {
            Value::Object(map) => Ok(map),
            other => Err(serde::ser::Error::custom(format!(
                "payload serialized to non-object: {other}"
            ))),
        }
    }
}

/// One protocol unit exchanged over the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Unique per send.
    pub message_id: String,
    pub sender_id: String,
    /// Peer id, [`BROADCAST`], or [`UNKNOWN_RECIPIENT`].
    pub recipient_id: String,
    pub payload: Payload,
    /// Integrity tag over the plaintext payload; empty when unsigned.
    pub quantum_signature: String,
    /// Unix seconds at send time.
    pub timestamp: f64,
    /// Advisory lifetime in seconds; not enforced by the transport.
    pub ttl: u64,
}

impl Message {
    /// Build an unsigned message stamped with a fresh id and the current time.
    pub fn new(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        payload: Payload,
        ttl: u64,
    ) -> Self {
        Self {
            message_id: new_message_id(),
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            payload,
            quantum_signature: String::new(),
            timestamp: unix_now(),
            ttl,
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.quantum_signature = signature.into();
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Send time as a `DateTime`.
    pub fn sent_at(&self) -> DateTime<Utc> {
        datetime_from_unix(self.timestamp)
    }
}

/// The flat on-the-wire shape of a [`Message`].
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    message_id: String,
    sender_id: String,
    recipient_id: String,
    message_type: String,
    payload: Map<String, Value>,
    quantum_signature: String,
    timestamp: f64,
    ttl: u64,
}

/// Encode a message as JSON (no length prefix).
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, serde_json::Error> {
    let envelope = Envelope {
        message_id: msg.message_id.clone(),
        sender_id: msg.sender_id.clone(),
        recipient_id: msg.recipient_id.clone(),
        message_type: msg.message_type().as_str().to_string(),
        payload: msg.payload.to_map()?,
        quantum_signature: msg.quantum_signature.clone(),
        timestamp: msg.timestamp,
        ttl: msg.ttl,
    };
    serde_json::to_vec(&envelope)
}

/// Encode a message into a complete frame (4-byte big-endian length + JSON).
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, serde_json::Error> {
    let json = encode_message(msg)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Parse a JSON body into a Message.
///
/// Unknown `message_type` values are rejected rather than passed through.
pub fn decode_message(body: &[u8]) -> Result<Message, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(body).map_err(DecodeError::Malformed)?;
    let message_type: MessageType = envelope.message_type.parse()?;
    let payload = Payload::from_map(message_type, envelope.payload)
        .map_err(|source| DecodeError::InvalidPayload {
            message_type,
            source,
        })?;

    Ok(Message {
        message_id: envelope.message_id,
        sender_id: envelope.sender_id,
        recipient_id: envelope.recipient_id,
        payload,
        quantum_signature: envelope.quantum_signature,
        timestamp: envelope.timestamp,
        ttl: envelope.ttl,
    })
}

/// Random 128-bit hex id.
pub fn new_message_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Current time as Unix seconds with microsecond precision.
pub fn unix_now() -> f64 {
    unix_from_datetime(Utc::now())
}

pub fn unix_from_datetime(at: DateTime<Utc>) -> f64 {
    at.timestamp() as f64 + f64::from(at.timestamp_subsec_micros()) / 1_000_000.0
}

/// Convert Unix seconds to a `DateTime`. Non-finite or out-of-range values map to the epoch.
pub fn datetime_from_unix(secs: f64) -> DateTime<Utc> {
    if !secs.is_finite() {
        return DateTime::<Utc>::default();
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1_000_000_000.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos.min(999_999_999)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handshake(node_id: &str) -> Payload {
        Payload::Handshake(HandshakePayload {
            node_id: node_id.to_string(),
            capabilities: vec!["x".to_string()],
            consciousness_level: 0.5,
            quantum_coherence: 0.5,
            listen_port: Some(7777),
            extra: Map::new(),
        })
    }

    fn roundtrip(msg: &Message) -> Message {
        let bytes = encode_message(msg).unwrap();
        decode_message(&bytes).unwrap()
    }

    #[test]
    fn test_encode_decode_roundtrip_all_types() {
        let mut extra = Map::new();
        extra.insert("vote".to_string(), json!({"yes": 3}));
        let payloads = vec![
            handshake("A"),
            Payload::KeyExchange(KeyExchangePayload::default()),
            Payload::KeyExchange(KeyExchangePayload {
                offer: Some(KeyOffer {
                    key_id: "qkey_A_1".to_string(),
                    secret_material: "00ff".to_string(),
                    created_at: 1_700_000_000.5,
                    expires_at: 1_700_000_300.5,
                }),
                extra: Map::new(),
            }),
            Payload::Application(ApplicationPayload {
                organism_type: "cell".to_string(),
                encrypted_data: "deadbeef".to_string(),
                key_id: Some("qkey_A_1".to_string()),
                extra: Map::new(),
            }),
            Payload::Contract(ContractPayload {
                contract_type: Some("proposal".to_string()),
                extra,
            }),
            Payload::StateSync(StateSyncPayload {
                consciousness_level: 0.25,
                quantum_coherence: 0.75,
                capabilities: vec!["consciousness_sync".to_string()],
                extra: Map::new(),
            }),
            Payload::EvolutionEvent(EvolutionPayload::default()),
            Payload::Heartbeat(HeartbeatPayload::acknowledged()),
        ];

        for payload in payloads {
            let msg = Message {
                message_id: "m-1".to_string(),
                sender_id: "A".to_string(),
                recipient_id: BROADCAST.to_string(),
                payload,
                quantum_signature: "sig".to_string(),
                timestamp: 1_700_000_000.25,
                ttl: 60,
            };
            assert_eq!(roundtrip(&msg), msg);
        }
    }

    #[test]
    fn test_frame_prefix_matches_body() {
        let msg = Message::new("A", "B", handshake("A"), 60);
        let bytes = encode_frame(&msg).unwrap();
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        let decoded = decode_message(&bytes[4..]).unwrap();
        assert_eq!(decoded.message_id, msg.message_id);
    }

    #[test]
    fn test_wire_field_names() {
        let msg = Message::new("A", UNKNOWN_RECIPIENT, handshake("A"), 60);
        let value: Value = serde_json::from_slice(&encode_message(&msg).unwrap()).unwrap();
        for field in [
            "message_id",
            "sender_id",
            "recipient_id",
            "message_type",
            "payload",
            "quantum_signature",
            "timestamp",
            "ttl",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert_eq!(value["message_type"], "handshake");
        assert_eq!(value["payload"]["node_id"], "A");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let body = json!({
            "message_id": "m-1",
            "sender_id": "A",
            "recipient_id": "B",
            "message_type": "bogus",
            "payload": {},
            "quantum_signature": "",
            "timestamp": 1.0,
            "ttl": 60
        });
        let err = decode_message(body.to_string().as_bytes()).unwrap_err();
        match err {
            DecodeError::UnknownType(t) => assert_eq!(t, "bogus"),
            other => panic!("Expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_envelope_field_rejected() {
        let body = json!({
            "message_id": "m-1",
            "sender_id": "A",
            "message_type": "heartbeat",
            "payload": {},
            "quantum_signature": "",
            "timestamp": 1.0,
            "ttl": 60
        });
        assert!(matches!(
            decode_message(body.to_string().as_bytes()),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_missing_payload_key_rejected() {
        let body = json!({
            "message_id": "m-1",
            "sender_id": "A",
            "recipient_id": "B",
            "message_type": "handshake",
            "payload": {"node_id": "A", "capabilities": []},
            "quantum_signature": "",
            "timestamp": 1.0,
            "ttl": 60
        });
        match decode_message(body.to_string().as_bytes()) {
            Err(DecodeError::InvalidPayload { message_type, .. }) => {
                assert_eq!(message_type, MessageType::Handshake)
            }
            other => panic!("Expected InvalidPayload, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_payload_keys_preserved() {
        let body = json!({
            "message_id": "m-1",
            "sender_id": "A",
            "recipient_id": "B",
            "message_type": "evolution_event",
            "payload": {"event_type": "mutation", "generation": 42, "genes": ["a", "b"]},
            "quantum_signature": "",
            "timestamp": 1.0,
            "ttl": 60
        });
        let msg = decode_message(body.to_string().as_bytes()).unwrap();
        match &msg.payload {
            Payload::EvolutionEvent(event) => {
                assert_eq!(event.event_type.as_deref(), Some("mutation"));
                assert_eq!(event.extra["generation"], json!(42));
            }
            other => panic!("Expected EvolutionEvent, got {other:?}"),
        }

        let reencoded: Value = serde_json::from_slice(&encode_message(&msg).unwrap()).unwrap();
        assert_eq!(reencoded["payload"], body["payload"]);
    }

    #[test]
    fn test_message_type_names() {
        for t in MessageType::ALL {
            assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
        }
        assert_eq!(MessageType::KeyExchange.to_string(), "quantum_key_exchange");
        assert_eq!(MessageType::Application.to_string(), "organism_message");
    }

    #[test]
    fn test_datetime_conversion() {
        let at = datetime_from_unix(1_700_000_000.5);
        assert_eq!(at.timestamp(), 1_700_000_000);
        assert_eq!(at.timestamp_subsec_millis(), 500);
        assert_eq!(unix_from_datetime(at), 1_700_000_000.5);
        assert_eq!(datetime_from_unix(f64::NAN).timestamp(), 0);
    }
}
