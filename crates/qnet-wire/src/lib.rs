//! QNet wire protocol: peer-to-peer node networking.
//!
//! Nodes exchange typed, JSON-encoded messages in length-prefixed frames over
//! TCP, keep a registry of known peers, negotiate and rotate per-peer
//! symmetric keys, and run periodic heartbeats, key rotation and state
//! broadcasts.
//!
//! ## Architecture
//!
//! - **QnetNode**: Listener, bounded worker pool and outbound client
//! - **Dispatcher**: Routes each inbound message by type
//! - **PeerRegistry**: Tracks known peers, their keys and liveness
//! - **KeyEngine**: Key generation, rotation and the pluggable cipher
//! - **Scheduler**: Heartbeat, key-rotation and state-sync cycles
//! - **NodeHandle**: Trait for the collaborators that consume application,
//!   contract and evolution messages

pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod local;
pub mod message;
pub mod node;
pub mod outbound;
pub mod registry;
pub mod scheduler;
pub mod transport;

pub use crypto::{Cipher, Key, KeyEngine, OsRandom, RandomSource, XorDigestCipher};
pub use dispatch::{Dispatcher, LoggingHandle, NodeHandle};
pub use error::{CryptoError, DecodeError, FrameError, RegistryError, WireError, WireResult};
pub use message::{Message, MessageType, Payload};
pub use node::QnetNode;
pub use outbound::BroadcastReport;
pub use registry::{Peer, PeerRegistry, PeerUpdate};
