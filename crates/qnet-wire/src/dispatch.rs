//! Message dispatcher: routes one decoded inbound message to its handler.
//!
//! The dispatcher owns no connection. A worker reads a message, calls
//! [`Dispatcher::dispatch`], and writes back whatever reply comes out. Any
//! failure inside a handler is logged and the message dropped; it never
//! reaches the worker or the accept loop.
//!
//! Collaborators outside the network layer (organism delivery, governance,
//! evolution tracking) sit behind the [`NodeHandle`] trait.

use crate::crypto::{Key, KeyEngine};
use crate::error::{CryptoError, RegistryError, WireError};
use crate::local::{LocalNode, CONTROL_TTL_SECS};
use crate::message::{
    ApplicationPayload, ContractPayload, EvolutionPayload, HandshakePayload, HeartbeatPayload,
    KeyExchangePayload, Message, Payload, StateSyncPayload,
};
use crate::registry::{PeerRegistry, PeerUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives the messages the network layer does not interpret itself.
#[async_trait]
pub trait NodeHandle: Send + Sync + 'static {
    /// A decrypted, signature-checked application message.
    async fn deliver_application(&self, sender_id: &str, organism_type: &str, plaintext: Vec<u8>);

    /// A governance contract, untouched.
    async fn submit_contract(&self, sender_id: &str, contract: &ContractPayload);

    /// An evolution event, untouched.
    async fn record_evolution(&self, sender_id: &str, event: &EvolutionPayload);
}

/// [`NodeHandle`] that only logs what it receives.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandle;

#[async_trait]
impl NodeHandle for LoggingHandle {
    async fn deliver_application(&self, sender_id: &str, organism_type: &str, plaintext: Vec<u8>) {
        info!(
            peer = %sender_id,
            organism_type = %organism_type,
            bytes = plaintext.len(),
            "Received organism message"
        );
    }

    async fn submit_contract(&self, sender_id: &str, contract: &ContractPayload) {
        info!(
            peer = %sender_id,
            contract_type = contract.contract_type.as_deref().unwrap_or("unknown"),
            "Smart contract received"
        );
    }

    async fn record_evolution(&self, sender_id: &str, event: &EvolutionPayload) {
        info!(
            peer = %sender_id,
            event_type = event.event_type.as_deref().unwrap_or("unknown"),
            "Evolution event"
        );
    }
}

/// Routes inbound messages by type.
#[derive(Clone)]
pub struct Dispatcher {
    local: Arc<LocalNode>,
    registry: PeerRegistry,
    engine: Arc<KeyEngine>,
    handle: Arc<dyn NodeHandle>,
}

impl Dispatcher {
    pub fn new(
        local: Arc<LocalNode>,
        registry: PeerRegistry,
        engine: Arc<KeyEngine>,
        handle: Arc<dyn NodeHandle>,
    ) -> Self {
        Self {
            local,
            registry,
            engine,
            handle,
        }
    }

    /// Handle one message received from `remote_addr`. Returns the reply to
    /// write back on the same connection, if any.
    pub async fn dispatch(&self, message: Message, remote_addr: SocketAddr) -> Option<Message> {
        let message_type = message.message_type();
        debug!(
            peer = %message.sender_id,
            remote = %remote_addr,
            message_id = %message.message_id,
            message_type = %message_type,
            "Dispatching message"
        );

        // Liveness is judged on our clock, never the sender's.
        let seen_at = Utc::now();
        let result = match &message.payload {
            Payload::Handshake(payload) => self.on_handshake(payload, remote_addr, seen_at),
            Payload::KeyExchange(payload) => self.on_key_exchange(&message, payload, seen_at),
            Payload::Application(payload) => {
                self.on_application(&message, payload, seen_at).await
            }
            Payload::Contract(payload) => {
                self.touch_if_known(&message.sender_id, seen_at);
                self.handle.submit_contract(&message.sender_id, payload).await;
                Ok(None)
            }
            Payload::StateSync(payload) => Ok(self.on_state_sync(&message, payload, seen_at)),
            Payload::EvolutionEvent(payload) => {
                self.touch_if_known(&message.sender_id, seen_at);
                self.handle.record_evolution(&message.sender_id, payload).await;
                Ok(None)
            }
            Payload::Heartbeat(payload) => Ok(self.on_heartbeat(&message, payload, seen_at)),
        };

        match result {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    peer = %message.sender_id,
                    message_id = %message.message_id,
                    message_type = %message_type,
                    error = %e,
                    "Dropped message"
                );
                None
            }
        }
    }

    fn on_handshake(
        &self,
        payload: &HandshakePayload,
        remote_addr: SocketAddr,
        seen_at: DateTime<Utc>,
    ) -> Result<Option<Message>, WireError> {
        if payload.node_id.is_empty() {
            warn!(remote = %remote_addr, "Handshake without node_id ignored");
            return Ok(None);
        }
        let address = match payload.listen_port {
            Some(port) => SocketAddr::new(remote_addr.ip(), port),
            None => remote_addr,
        };
        let peer = self.registry.upsert(
            &payload.node_id,
            PeerUpdate::seen_at(seen_at)
                .with_address(address)
                .with_capabilities(payload.capabilities.clone())
                .with_scores(payload.consciousness_level, payload.quantum_coherence),
        );
        info!(
            peer = %peer.peer_id,
            addr = %address,
            consciousness_level = peer.consciousness_level,
            "Peer connected"
        );

        Ok(Some(self.local.message(
            peer.peer_id,
            Payload::Handshake(self.local.handshake_payload()),
            CONTROL_TTL_SECS,
        )))
    }

    fn on_key_exchange(
        &self,
        message: &Message,
        payload: &KeyExchangePayload,
        seen_at: DateTime<Utc>,
    ) -> Result<Option<Message>, WireError> {
        let sender = &message.sender_id;
        if !self.registry.contains(sender) {
            debug!(peer = %sender, "Key exchange from unknown peer ignored");
            return Ok(None);
        }

        let reply = match &payload.offer {
            None => {
                let key = self.engine.generate_key(sender)?;
                let offer = key.to_offer();
                self.registry.set_key(sender, key)?;
                info!(peer = %sender, key_id = %offer.key_id, "Key established");
                Payload::KeyExchange(KeyExchangePayload {
                    offer: Some(offer),
                    ..KeyExchangePayload::default()
                })
            }
            Some(offer) => {
                let key = Key::from_offer(offer)?;
                if self.registry.offer_key(sender, key)? {
                    info!(peer = %sender, key_id = %offer.key_id, "Installed offered key");
                } else {
                    debug!(
                        peer = %sender,
                        key_id = %offer.key_id,
                        "Offered key is older than ours"
                    );
                }
                Payload::Heartbeat(HeartbeatPayload::acknowledged())
            }
        };
        self.registry.touch(sender, seen_at)?;

        Ok(Some(self.local.message(sender.clone(), reply, CONTROL_TTL_SECS)))
    }

    async fn on_application(
        &self,
        message: &Message,
        payload: &ApplicationPayload,
        seen_at: DateTime<Utc>,
    ) -> Result<Option<Message>, WireError> {
        let sender = &message.sender_id;
        let peer = self
            .registry
            .get(sender)
            .ok_or_else(|| RegistryError::UnknownPeer(sender.clone()))?;
        let key = peer
            .key_for(payload.key_id.as_deref())
            .ok_or_else(|| CryptoError::NoKey(sender.clone()))?;

        let ciphertext = hex::decode(&payload.encrypted_data)
            .map_err(|e| CryptoError::InvalidCiphertext(e.to_string()))?;
        let plaintext = self.engine.decrypt(&ciphertext, key)?;
        if !self
            .engine
            .verify(&plaintext, &message.quantum_signature, key)
        {
            return Err(CryptoError::SignatureMismatch.into());
        }

        self.registry.touch(sender, seen_at)?;
        self.handle
            .deliver_application(sender, &payload.organism_type, plaintext)
            .await;
        Ok(None)
    }

    fn on_state_sync(
        &self,
        message: &Message,
        payload: &StateSyncPayload,
        seen_at: DateTime<Utc>,
    ) -> Option<Message> {
        let level = self.local.blend(payload.consciousness_level);
        info!(peer = %message.sender_id, consciousness_level = level, "Consciousness sync");

        let mut update = PeerUpdate::seen_at(seen_at)
            .with_scores(payload.consciousness_level, payload.quantum_coherence);
        if !payload.capabilities.is_empty() {
            update = update.with_capabilities(payload.capabilities.clone());
        }
        // Only peers that completed a handshake are tracked.
        let _ = self.registry.update(&message.sender_id, update);
        None
    }

    fn on_heartbeat(
        &self,
        message: &Message,
        payload: &HeartbeatPayload,
        seen_at: DateTime<Utc>,
    ) -> Option<Message> {
        let update = PeerUpdate {
            consciousness_level: payload.consciousness_level,
            quantum_coherence: payload.quantum_coherence,
            ..PeerUpdate::seen_at(seen_at)
        };
        if self.registry.update(&message.sender_id, update).is_err() {
            debug!(peer = %message.sender_id, "Heartbeat from unknown peer ignored");
        }
        None
    }

    fn touch_if_known(&self, peer_id: &str, seen_at: DateTime<Utc>) {
        let _ = self.registry.touch(peer_id, seen_at);
    }
}
