//! Peer registry: tracks known peers, their keys, and liveness.
//!
//! The [`PeerRegistry`] is a thread-safe, concurrent map. Every mutation goes
//! through the map's entry lock for that `peer_id`, so writes to one peer are
//! serialised while writes to different peers proceed in parallel. Only
//! [`PeerRegistry::evict_stale`] ever removes a peer.

use crate::crypto::Key;
use crate::error::{CryptoError, RegistryError, WireError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

/// Trust assigned to a newly registered peer.
pub const DEFAULT_TRUST_SCORE: f64 = 0.5;

/// Soft score assumed until a peer reports its own.
pub const DEFAULT_PEER_SCORE: f64 = 0.5;

/// A remote node known to this node.
#[derive(Debug, Clone)]
pub struct Peer {
    pub peer_id: String,
    /// Address the peer listens on, once known.
    pub address: Option<SocketAddr>,
    pub capabilities: BTreeSet<String>,
    pub consciousness_level: f64,
    pub quantum_coherence: f64,
    pub trust_score: f64,
    /// Symmetric key shared with this peer, if one has been exchanged.
    pub key: Option<Key>,
    /// Key replaced by the last rotation, kept for in-flight decryption.
    pub previous_key: Option<Key>,
    pub first_seen: DateTime<Utc>,
    /// Never moves backwards.
    pub last_seen: DateTime<Utc>,
}

impl Peer {
    fn new(peer_id: &str, seen_at: DateTime<Utc>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            address: None,
            capabilities: BTreeSet::new(),
            consciousness_level: DEFAULT_PEER_SCORE,
            quantum_coherence: DEFAULT_PEER_SCORE,
            trust_score: DEFAULT_TRUST_SCORE,
            key: None,
            previous_key: None,
            first_seen: seen_at,
            last_seen: seen_at,
        }
    }

    /// Pick the key to decrypt with: the named key if it is the current or
    /// previous one, the current key when no id is given.
    pub fn key_for(&self, key_id: Option<&str>) -> Option<&Key> {
        match key_id {
            None => self.key.as_ref(),
            Some(id) => [self.key.as_ref(), self.previous_key.as_ref()]
                .into_iter()
                .flatten()
                .find(|key| key.key_id == id),
        }
    }

    fn install_key(&mut self, key: Key) {
        self.previous_key = self.key.replace(key);
    }

    fn apply(&mut self, update: PeerUpdate) {
        if let Some(address) = update.address {
            self.address = Some(address);
        }
        if let Some(capabilities) = update.capabilities {
            self.capabilities = capabilities.into_iter().collect();
        }
        if let Some(level) = update.consciousness_level {
            self.consciousness_level = clamp_unit(level);
        }
        if let Some(coherence) = update.quantum_coherence {
            self.quantum_coherence = clamp_unit(coherence);
        }
        self.advance_last_seen(update.seen_at);
    }

    fn advance_last_seen(&mut self, seen_at: DateTime<Utc>) {
        if seen_at > self.last_seen {
            self.last_seen = seen_at;
        }
    }
}

/// Fields to merge into a peer record. `None` leaves a field untouched.
#[derive(Debug, Clone)]
pub struct PeerUpdate {
    pub address: Option<SocketAddr>,
    pub capabilities: Option<Vec<String>>,
    pub consciousness_level: Option<f64>,
    pub quantum_coherence: Option<f64>,
    /// When the triggering message was seen.
    pub seen_at: DateTime<Utc>,
}

impl PeerUpdate {
    /// An update that only records liveness.
    pub fn seen_at(seen_at: DateTime<Utc>) -> Self {
        Self {
            address: None,
            capabilities: None,
            consciousness_level: None,
            quantum_coherence: None,
            seen_at,
        }
    }

    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn with_scores(mut self, consciousness_level: f64, quantum_coherence: f64) -> Self {
        self.consciousness_level = Some(consciousness_level);
        self.quantum_coherence = Some(quantum_coherence);
        self
    }
}

/// Thread-safe registry of all known peers.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<DashMap<String, Peer>>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the peer if absent, otherwise merge `update` into it.
    pub fn upsert(&self, peer_id: &str, update: PeerUpdate) -> Peer {
        let mut entry = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| Peer::new(peer_id, update.seen_at));
        entry.apply(update);
        entry.clone()
    }

    /// Merge `update` into an existing peer. Never creates a peer.
    pub fn update(&self, peer_id: &str, update: PeerUpdate) -> Result<Peer, RegistryError> {
        let mut peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| RegistryError::UnknownPeer(peer_id.to_string()))?;
        peer.apply(update);
        Ok(peer.clone())
    }

    /// Get a snapshot of a specific peer.
    pub fn get(&self, peer_id: &str) -> Option<Peer> {
        self.peers.get(peer_id).map(|p| p.clone())
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Snapshot of every peer, in no particular order.
    pub fn all(&self) -> Vec<Peer> {
        self.peers.iter().map(|p| p.value().clone()).collect()
    }

    /// Ids of peers that currently hold a key.
    pub fn keyed_peer_ids(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|entry| entry.value().key.is_some())
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Replace the peer's key.
    pub fn set_key(&self, peer_id: &str, key: Key) -> Result<(), RegistryError> {
        let mut peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| RegistryError::UnknownPeer(peer_id.to_string()))?;
        peer.install_key(key);
        Ok(())
    }

    /// Install a key offered by the peer, unless the installed key is newer.
    ///
    /// Keys are ordered by `created_at`, then `key_id`. Returns whether the
    /// offered key was installed. When both sides rotate at once, each ends
    /// up holding the newer of the two keys.
    pub fn offer_key(&self, peer_id: &str, key: Key) -> Result<bool, RegistryError> {
        let mut peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| RegistryError::UnknownPeer(peer_id.to_string()))?;
        let newer = match &peer.key {
            None => true,
            Some(current) => {
                (key.created_at, key.key_id.as_str())
                    > (current.created_at, current.key_id.as_str())
            }
        };
        if newer {
            peer.install_key(key);
        }
        Ok(newer)
    }

    /// Atomically replace the peer's key if it has expired at `now`.
    ///
    /// `generate` runs under the peer's lock, so two callers cannot both
    /// rotate the same expired key.
    pub fn replace_key_if_expired<F>(
        &self,
        peer_id: &str,
        now: DateTime<Utc>,
        generate: F,
    ) -> Result<Option<Key>, WireError>
    where
        F: FnOnce() -> Result<Key, CryptoError>,
    {
        let mut peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| RegistryError::UnknownPeer(peer_id.to_string()))?;
        match &peer.key {
            Some(current) if current.is_expired(now) => {
                let fresh = generate()?;
                peer.install_key(fresh.clone());
                Ok(Some(fresh))
            }
            _ => Ok(None),
        }
    }

    /// Record liveness for a known peer. Never creates a peer.
    ///
    /// Returns the peer's `last_seen` after the update.
    pub fn touch(
        &self,
        peer_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, RegistryError> {
        let mut peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| RegistryError::UnknownPeer(peer_id.to_string()))?;
        peer.advance_last_seen(seen_at);
        Ok(peer.last_seen)
    }

    /// Remove peers not seen within `max_age` of `now`. Returns their ids.
    pub fn evict_stale(&self, max_age: chrono::Duration, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = now - max_age;
        let mut evicted = Vec::new();
        self.peers.retain(|peer_id, peer| {
            let keep = peer.last_seen >= cutoff;
            if !keep {
                evicted.push(peer_id.clone());
            }
            keep
        });
        evicted
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return DEFAULT_PEER_SCORE;
    }
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key(id: &str, created_at: DateTime<Utc>) -> Key {
        Key::new(id, vec![1, 2, 3], created_at, created_at + Duration::seconds(300))
    }

    #[test]
    fn test_upsert_creates_then_merges() {
        let registry = PeerRegistry::new();
        let t0 = Utc::now();
        let created = registry.upsert(
            "A",
            PeerUpdate::seen_at(t0)
                .with_capabilities(vec!["x".to_string()])
                .with_scores(0.5, 0.5)
                .with_address("127.0.0.1:7777".parse().unwrap()),
        );
        assert_eq!(created.peer_id, "A");
        assert_eq!(created.trust_score, DEFAULT_TRUST_SCORE);
        assert!(created.capabilities.contains("x"));
        assert!(created.key.is_none());

        let merged = registry.upsert(
            "A",
            PeerUpdate::seen_at(t0 + Duration::seconds(1)).with_scores(0.7, 0.6),
        );
        assert_eq!(registry.len(), 1);
        assert_eq!(merged.consciousness_level, 0.7);
        assert_eq!(merged.quantum_coherence, 0.6);
        // Fields not in the update are kept.
        assert!(merged.capabilities.contains("x"));
        assert_eq!(merged.address, Some("127.0.0.1:7777".parse().unwrap()));
        assert_eq!(merged.first_seen, t0);
    }

    #[test]
    fn test_scores_are_clamped() {
        let registry = PeerRegistry::new();
        let peer = registry.upsert("A", PeerUpdate::seen_at(Utc::now()).with_scores(3.0, -1.0));
        assert_eq!(peer.consciousness_level, 1.0);
        assert_eq!(peer.quantum_coherence, 0.0);
    }

    #[test]
    fn test_last_seen_never_regresses() {
        let registry = PeerRegistry::new();
        let t0 = Utc::now();
        registry.upsert("A", PeerUpdate::seen_at(t0 + Duration::seconds(10)));
        let peer = registry.upsert("A", PeerUpdate::seen_at(t0));
        assert_eq!(peer.last_seen, t0 + Duration::seconds(10));
        let last = registry.touch("A", t0 + Duration::seconds(5)).unwrap();
        assert_eq!(last, t0 + Duration::seconds(10));
        let last = registry.touch("A", t0 + Duration::seconds(20)).unwrap();
        assert_eq!(last, t0 + Duration::seconds(20));
    }

    #[test]
    fn test_concurrent_upserts_keep_latest_last_seen() {
        let registry = PeerRegistry::new();
        let t0 = Utc::now();
        registry.upsert("A", PeerUpdate::seen_at(t0));

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let offset = i * 8 + worker;
                        let seen_at = t0 + Duration::milliseconds(offset);
                        registry.upsert("A", PeerUpdate::seen_at(seen_at));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("A").unwrap().last_seen,
            t0 + Duration::milliseconds(199 * 8 + 7)
        );
    }

    #[test]
    fn test_set_key_unknown_peer() {
        let registry = PeerRegistry::new();
        match registry.set_key("ghost", key("k1", Utc::now())) {
            Err(RegistryError::UnknownPeer(id)) => assert_eq!(id, "ghost"),
            other => panic!("Expected UnknownPeer, got {other:?}"),
        }
    }

    #[test]
    fn test_set_key_replaces() {
        let registry = PeerRegistry::new();
        let now = Utc::now();
        registry.upsert("A", PeerUpdate::seen_at(now));
        registry.set_key("A", key("k1", now)).unwrap();
        registry.set_key("A", key("k2", now)).unwrap();
        assert_eq!(registry.get("A").unwrap().key.unwrap().key_id, "k2");
        assert_eq!(registry.keyed_peer_ids(), vec!["A".to_string()]);
    }

    #[test]
    fn test_rotation_keeps_previous_key() {
        let registry = PeerRegistry::new();
        let now = Utc::now();
        registry.upsert("A", PeerUpdate::seen_at(now));
        registry.set_key("A", key("k1", now)).unwrap();
        registry.set_key("A", key("k2", now)).unwrap();

        let peer = registry.get("A").unwrap();
        assert_eq!(peer.previous_key.as_ref().unwrap().key_id, "k1");
        assert_eq!(peer.key_for(None).unwrap().key_id, "k2");
        assert_eq!(peer.key_for(Some("k1")).unwrap().key_id, "k1");
        assert!(peer.key_for(Some("k0")).is_none());
    }

    #[test]
    fn test_update_requires_known_peer() {
        let registry = PeerRegistry::new();
        assert!(registry
            .update("ghost", PeerUpdate::seen_at(Utc::now()).with_scores(0.1, 0.1))
            .is_err());
        assert!(registry.is_empty());

        registry.upsert("A", PeerUpdate::seen_at(Utc::now()));
        let peer = registry
            .update("A", PeerUpdate::seen_at(Utc::now()).with_scores(0.1, 0.2))
            .unwrap();
        assert_eq!(peer.quantum_coherence, 0.2);
    }

    #[test]
    fn test_touch_does_not_create() {
        let registry = PeerRegistry::new();
        assert!(registry.touch("ghost", Utc::now()).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_offer_key_keeps_newest() {
        let registry = PeerRegistry::new();
        let now = Utc::now();
        registry.upsert("A", PeerUpdate::seen_at(now));

        assert!(registry.offer_key("A", key("k-old", now)).unwrap());
        assert!(registry
            .offer_key("A", key("k-new", now + Duration::seconds(1)))
            .unwrap());
        assert!(!registry.offer_key("A", key("k-older", now)).unwrap());
        assert_eq!(registry.get("A").unwrap().key.unwrap().key_id, "k-new");
    }

    #[test]
    fn test_replace_key_if_expired() {
        let registry = PeerRegistry::new();
        let now = Utc::now();
        registry.upsert("A", PeerUpdate::seen_at(now));
        registry.set_key("A", key("k1", now)).unwrap();

        let untouched = registry
            .replace_key_if_expired("A", now, || Ok(key("k2", now)))
            .unwrap();
        assert!(untouched.is_none());

        let later = now + Duration::seconds(300);
        let rotated = registry
            .replace_key_if_expired("A", later, || Ok(key("k2", later)))
            .unwrap()
            .unwrap();
        assert_eq!(rotated.key_id, "k2");
        assert_eq!(registry.get("A").unwrap().key.unwrap().key_id, "k2");
    }

    #[test]
    fn test_evict_stale() {
        let registry = PeerRegistry::new();
        let now = Utc::now();
        registry.upsert("old", PeerUpdate::seen_at(now - Duration::seconds(600)));
        registry.upsert("fresh", PeerUpdate::seen_at(now - Duration::seconds(10)));

        let evicted = registry.evict_stale(Duration::seconds(300), now);
        assert_eq!(evicted, vec!["old".to_string()]);
        assert!(registry.contains("fresh"));
        assert!(!registry.contains("old"));
    }

    #[test]
    fn test_all_peers() {
        let registry = PeerRegistry::new();
        let now = Utc::now();
        for id in ["A", "B", "C"] {
            registry.upsert(id, PeerUpdate::seen_at(now));
        }
        let mut ids: Vec<_> = registry.all().into_iter().map(|p| p.peer_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }
}
