//! Outbound sends to registered peers.

use crate::crypto::Key;
use crate::error::{RegistryError, WireError, WireResult};
use crate::local::{LocalNode, CONTROL_TTL_SECS};
use crate::message::{KeyExchangePayload, Message, Payload, BROADCAST};
use crate::registry::PeerRegistry;
use crate::transport::connect_and_send;
use futures::future::join_all;
use qnet_types::config::TransportConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of a fan-out send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub sent: usize,
    pub failed: usize,
    /// Peers with no known address.
    pub skipped: usize,
}

/// Sends messages from this node to peers in the registry.
#[derive(Clone)]
pub struct Outbound {
    local: Arc<LocalNode>,
    registry: PeerRegistry,
    transport: Arc<TransportConfig>,
}

impl Outbound {
    pub fn new(local: Arc<LocalNode>, registry: PeerRegistry, transport: TransportConfig) -> Self {
        Self {
            local,
            registry,
            transport: Arc::new(transport),
        }
    }

    pub fn local(&self) -> &LocalNode {
        &self.local
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    /// Send an already-built message to an address.
    pub async fn send_message(
        &self,
        addr: SocketAddr,
        message: &Message,
        expect_reply: bool,
    ) -> WireResult<Option<Message>> {
        connect_and_send(addr, message, expect_reply, &self.transport).await
    }

    /// Build and send a message to a registered peer.
    pub async fn send_to_peer(
        &self,
        peer_id: &str,
        payload: Payload,
        ttl: u64,
        expect_reply: bool,
    ) -> WireResult<Option<Message>> {
        let addr = self.peer_address(peer_id)?;
        let message = self.local.message(peer_id, payload, ttl);
        self.send_message(addr, &message, expect_reply).await
    }

    /// Push a key to the peer as a key-exchange offer.
    pub async fn offer_key(&self, peer_id: &str, key: &Key) -> WireResult<()> {
        let payload = Payload::KeyExchange(KeyExchangePayload {
            offer: Some(key.to_offer()),
            ..KeyExchangePayload::default()
        });
        self.send_to_peer(peer_id, payload, CONTROL_TTL_SECS, true)
            .await?;
        debug!(peer = %peer_id, key_id = %key.key_id, "Key offer delivered");
        Ok(())
    }

    /// Send `payload` to every peer with a known address, concurrently.
    ///
    /// Each peer gets its own message. A failed send is logged and counted;
    /// it does not affect the others.
    pub async fn broadcast(&self, payload: &Payload, ttl: u64) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut targets = Vec::new();
        for peer in self.registry.all() {
            match peer.address {
                Some(addr) => targets.push((peer.peer_id, addr)),
                None => report.skipped += 1,
            }
        }

        let sends = targets.into_iter().map(|(peer_id, addr)| async move {
            let message = self.local.message(BROADCAST, payload.clone(), ttl);
            let result = self.send_message(addr, &message, false).await;
            if let Err(ref e) = result {
                warn!(
                    peer = %peer_id,
                    addr = %addr,
                    message_type = %message.message_type(),
                    error = %e,
                    "Send to peer failed"
                );
            }
            result.is_ok()
        });

        for ok in join_all(sends).await {
            if ok {
                report.sent += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }

    /// Listen address of a registered peer.
    pub fn peer_address(&self, peer_id: &str) -> WireResult<SocketAddr> {
        let peer = self
            .registry
            .get(peer_id)
            .ok_or_else(|| RegistryError::UnknownPeer(peer_id.to_string()))?;
        peer.address
            .ok_or_else(|| WireError::NoAddress(peer_id.to_string()))
    }
}
