//! This node's own identity and soft state.

use crate::message::{HandshakePayload, HeartbeatPayload, Message, Payload, StateSyncPayload};
use qnet_types::config::NodeConfig;
use serde_json::Map;
use std::sync::RwLock;

/// Lifetime stamped on handshakes, heartbeats and key exchanges.
pub const CONTROL_TTL_SECS: u64 = 60;

/// Lifetime stamped on application and state-sync messages.
pub const DATA_TTL_SECS: u64 = 300;

#[derive(Debug, Clone, Copy)]
struct LocalState {
    consciousness_level: f64,
    quantum_coherence: f64,
    listen_port: Option<u16>,
}

/// Identity, capabilities and mutable scores of the local node.
///
/// Shared by the dispatcher, the scheduler and the node. The lock is only
/// held for plain reads and writes, never across an `.await`.
#[derive(Debug)]
pub struct LocalNode {
    node_id: String,
    capabilities: Vec<String>,
    blend_factor: f64,
    state: RwLock<LocalState>,
}

impl LocalNode {
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            node_id: config.node_id.clone(),
            capabilities: config.capabilities.clone(),
            blend_factor: config.blend_factor,
            state: RwLock::new(LocalState {
                consciousness_level: config.consciousness_level,
                quantum_coherence: config.quantum_coherence,
                listen_port: None,
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn consciousness_level(&self) -> f64 {
        self.read().consciousness_level
    }

    pub fn quantum_coherence(&self) -> f64 {
        self.read().quantum_coherence
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.read().listen_port
    }

    pub fn set_listen_port(&self, port: Option<u16>) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .listen_port = port;
    }

    /// Move our consciousness level toward a peer's by `blend_factor`,
    /// clamped to [0, 1]. Returns the new level.
    ///
    /// Non-finite peer values are ignored.
    pub fn blend(&self, peer_level: f64) -> f64 {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if peer_level.is_finite() {
            let delta = (peer_level - state.consciousness_level) * self.blend_factor;
            state.consciousness_level = (state.consciousness_level + delta).clamp(0.0, 1.0);
        }
        state.consciousness_level
    }

    pub fn handshake_payload(&self) -> HandshakePayload {
        let state = self.read();
        HandshakePayload {
            node_id: self.node_id.clone(),
            capabilities: self.capabilities.clone(),
            consciousness_level: state.consciousness_level,
            quantum_coherence: state.quantum_coherence,
            listen_port: state.listen_port,
            extra: Map::new(),
        }
    }

    pub fn heartbeat_payload(&self) -> HeartbeatPayload {
        let state = self.read();
        HeartbeatPayload {
            consciousness_level: Some(state.consciousness_level),
            quantum_coherence: Some(state.quantum_coherence),
            ..HeartbeatPayload::default()
        }
    }

    pub fn state_sync_payload(&self) -> StateSyncPayload {
        let state = self.read();
        StateSyncPayload {
            consciousness_level: state.consciousness_level,
            quantum_coherence: state.quantum_coherence,
            capabilities: self.capabilities.clone(),
            extra: Map::new(),
        }
    }

    /// New unsigned message from this node.
    pub fn message(&self, recipient_id: impl Into<String>, payload: Payload, ttl: u64) -> Message {
        Message::new(self.node_id.clone(), recipient_id, payload, ttl)
    }

    fn read(&self) -> LocalState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }
}
