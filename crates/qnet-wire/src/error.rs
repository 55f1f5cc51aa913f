//! Error types for the QNet wire layer.
//!
//! Each concern has its own enum so callers can match on the failure that
//! matters to them; [`WireError`] wraps them all for the node-level API.

use crate::message::MessageType;
use std::net::SocketAddr;
use thiserror::Error;

/// Framing failures. Contained to the single connection that produced them.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: u32, received: usize },
    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u32 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures turning frame bytes into a [`Message`](crate::message::Message).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Invalid {message_type} payload: {source}")]
    InvalidPayload {
        message_type: MessageType,
        #[source]
        source: serde_json::Error,
    },
}

/// Peer registry failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),
}

/// Key engine failures. A message that hits one of these is dropped.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Entropy source failed: {0}")]
    Entropy(String),
    #[error("No key installed for peer {0}")]
    NoKey(String),
    #[error("Key {key_id} has expired")]
    KeyExpired { key_id: String },
    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),
    #[error("Invalid ciphertext: {0}")]
    InvalidCiphertext(String),
    #[error("Signature verification failed")]
    SignatureMismatch,
}

/// Which step of an outbound send ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    Connect,
    Write,
    Read,
}

impl std::fmt::Display for SendPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Write => write!(f, "write"),
            Self::Read => write!(f, "read"),
        }
    }
}

/// Top-level error for node operations.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("Send to {addr} timed out during {phase}")]
    SendTimeout { addr: SocketAddr, phase: SendPhase },
    #[error("Peer {0} has no known address")]
    NoAddress(String),
    #[error("Peer at {0} closed the connection without replying")]
    NoReply(SocketAddr),
    #[error("Unexpected reply: expected {expected}, got {got}")]
    UnexpectedReply {
        expected: MessageType,
        got: MessageType,
    },
    #[error("Node is already running")]
    AlreadyRunning,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Alias for results from the wire layer.
pub type WireResult<T> = Result<T, WireError>;
