//! Node configuration.
//!
//! Every section uses `#[serde(default)]`, so a partial TOML file only needs
//! the keys it wants to override.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 7777;

/// Default maximum frame payload (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Capabilities advertised when none are configured.
pub const DEFAULT_CAPABILITIES: &[&str] =
    &["quantum_communication", "smart_contracts", "consciousness_sync"];

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique identifier of this node on the network.
    pub node_id: String,
    /// Address the listener binds to.
    pub bind_address: SocketAddr,
    /// Capabilities advertised in handshakes and state syncs.
    pub capabilities: Vec<String>,
    /// Initial self-reported affinity score (0..1).
    pub consciousness_level: f64,
    /// Initial self-reported quality score (0..1).
    pub quantum_coherence: f64,
    /// Step size used when blending a peer's state into our own.
    pub blend_factor: f64,
    pub transport: TransportConfig,
    pub crypto: CryptoConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: format!("qnet-{}", uuid::Uuid::new_v4().simple()),
            bind_address: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            capabilities: DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            consciousness_level: 0.85,
            quantum_coherence: 0.90,
            blend_factor: 0.01,
            transport: TransportConfig::default(),
            crypto: CryptoConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Validate the configuration.
    ///
    /// - `node_id` must be non-empty.
    /// - soft scores and `blend_factor` must lie in `[0, 1]`.
    /// - pool size, intervals and key length must be non-zero.
    pub fn validate(&self) -> Result<(), String> {
        if self.node_id.trim().is_empty() {
            return Err("node_id must not be empty".to_string());
        }
        for (name, value) in [
            ("consciousness_level", self.consciousness_level),
            ("quantum_coherence", self.quantum_coherence),
            ("blend_factor", self.blend_factor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("{name} must be between 0 and 1 (got {value})"));
            }
        }
        if self.transport.worker_pool_size == 0 {
            return Err("transport.worker_pool_size must be at least 1".to_string());
        }
        if self.transport.max_frame_len == 0 {
            return Err("transport.max_frame_len must be at least 1".to_string());
        }
        if self.crypto.rotation_interval_secs == 0 {
            return Err("crypto.rotation_interval_secs must be at least 1".to_string());
        }
        if self.crypto.key_bytes == 0 {
            return Err("crypto.key_bytes must be at least 1".to_string());
        }
        if self.scheduler.heartbeat_interval_secs == 0
            || self.scheduler.key_rotation_interval_secs == 0
            || self.scheduler.state_sync_interval_secs == 0
        {
            return Err("scheduler intervals must be at least 1 second".to_string());
        }
        Ok(())
    }
}

/// Socket, framing and worker-pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest frame payload accepted from a peer, in bytes.
    pub max_frame_len: u32,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Number of inbound connections handled concurrently.
    pub worker_pool_size: usize,
    /// How long `stop()` waits for in-flight workers before aborting them.
    pub shutdown_grace_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            connect_timeout_ms: 5_000,
            read_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            worker_pool_size: 10,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Key lifetime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Lifetime of a freshly generated key.
    pub rotation_interval_secs: u64,
    /// How long after expiry a key may still decrypt in-flight messages.
    pub decrypt_grace_secs: u64,
    /// Bytes of entropy drawn per key.
    pub key_bytes: usize,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            rotation_interval_secs: 300,
            decrypt_grace_secs: 30,
            key_bytes: 32,
        }
    }
}

/// Periodic maintenance cycle settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub heartbeat_interval_secs: u64,
    pub key_rotation_interval_secs: u64,
    pub state_sync_interval_secs: u64,
    /// Peers silent for this many heartbeat intervals are evicted. 0 disables eviction.
    pub stale_after_missed_heartbeats: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            key_rotation_interval_secs: 60,
            state_sync_interval_secs: 120,
            stale_after_missed_heartbeats: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn key_rotation_interval(&self) -> Duration {
        Duration::from_secs(self.key_rotation_interval_secs)
    }

    pub fn state_sync_interval(&self) -> Duration {
        Duration::from_secs(self.state_sync_interval_secs)
    }

    /// Age after which a silent peer is considered stale, if eviction is enabled.
    pub fn stale_after(&self) -> Option<Duration> {
        if self.stale_after_missed_heartbeats == 0 {
            return None;
        }
        self.heartbeat_interval()
            .checked_mul(self.stale_after_missed_heartbeats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.bind_address.port(), 7777);
        assert!(config.bind_address.ip().is_unspecified());
        assert_eq!(config.capabilities.len(), 3);
        assert_eq!(config.transport.worker_pool_size, 10);
        assert_eq!(config.crypto.rotation_interval_secs, 300);
        assert_eq!(config.scheduler.heartbeat_interval_secs, 30);
        assert_eq!(config.scheduler.key_rotation_interval_secs, 60);
        assert_eq!(config.scheduler.state_sync_interval_secs, 120);
        assert!(config.node_id.starts_with("qnet-"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
            node_id = "alpha"
            bind_address = "127.0.0.1:9000"

            [scheduler]
            heartbeat_interval_secs = 5
        "#;
        let config: NodeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node_id, "alpha");
        assert_eq!(config.bind_address.port(), 9000);
        assert_eq!(config.scheduler.heartbeat_interval_secs, 5);
        assert_eq!(config.scheduler.state_sync_interval_secs, 120);
        assert_eq!(config.transport, TransportConfig::default());
    }

    #[test]
    fn test_validate_rejects_out_of_range_scores() {
        let config = NodeConfig {
            consciousness_level: 1.5,
            ..NodeConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("consciousness_level"));
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let mut config = NodeConfig::default();
        config.transport.worker_pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stale_after() {
        let mut scheduler = SchedulerConfig::default();
        assert_eq!(scheduler.stale_after(), Some(Duration::from_secs(300)));
        scheduler.stale_after_missed_heartbeats = 0;
        assert_eq!(scheduler.stale_after(), None);
    }
}
