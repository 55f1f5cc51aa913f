//! Status snapshot exposed to supervisory callers.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Point-in-time view of a running (or stopped) node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub running: bool,
    pub consciousness_level: f64,
    pub quantum_coherence: f64,
    /// Number of peers currently in the registry.
    pub peer_count: usize,
    pub capabilities: Vec<String>,
    /// Actual bound address, once the listener is up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_addr: Option<SocketAddr>,
}
