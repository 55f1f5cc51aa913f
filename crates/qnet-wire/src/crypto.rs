//! Key exchange engine: per-peer symmetric keys.
//!
//! Entropy and the cipher are both behind small traits ([`RandomSource`],
//! [`Cipher`]) so a hardware generator or an authenticated cipher can be
//! dropped in without touching the protocol. The default [`XorDigestCipher`]
//! XORs data with the key's SHA-256 digest and offers no confidentiality
//! against an active adversary; it exists to keep the message contract
//! stable, not as a security mechanism.

use crate::error::{CryptoError, WireError};
use crate::message::{datetime_from_unix, unix_from_datetime, KeyOffer};
use crate::registry::PeerRegistry;
use chrono::{DateTime, Utc};
use qnet_types::config::CryptoConfig;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::info;
use zeroize::Zeroize;

/// Length of the derived working key.
pub const DIGEST_LEN: usize = 32;

/// A symmetric secret shared with one peer. Replaced, never mutated, on rotation.
#[derive(Clone, PartialEq, Eq)]
pub struct Key {
    pub key_id: String,
    pub secret_material: Vec<u8>,
    /// SHA-256 of `secret_material`; the working cipher key.
    pub derived_digest: [u8; DIGEST_LEN],
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("key_id", &self.key_id)
            .field("secret_material", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Drop for Key {
    fn drop(&mut self) {
        self.secret_material.zeroize();
        self.derived_digest.zeroize();
    }
}

impl Key {
    /// Build a key, deriving the digest from the secret material.
    pub fn new(
        key_id: impl Into<String>,
        secret_material: Vec<u8>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let derived_digest: [u8; DIGEST_LEN] = Sha256::digest(&secret_material).into();
        Self {
            key_id: key_id.into(),
            secret_material,
            derived_digest,
            created_at,
            expires_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Wire form of this key for a key-exchange payload.
    pub fn to_offer(&self) -> KeyOffer {
        KeyOffer {
            key_id: self.key_id.clone(),
            secret_material: hex::encode(&self.secret_material),
            created_at: unix_from_datetime(self.created_at),
            expires_at: unix_from_datetime(self.expires_at),
        }
    }

    /// Rebuild a key received in a key-exchange payload.
    pub fn from_offer(offer: &KeyOffer) -> Result<Self, CryptoError> {
        let secret = hex::decode(&offer.secret_material)
            .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
        if secret.is_empty() {
            return Err(CryptoError::InvalidKeyMaterial(
                "empty secret material".to_string(),
            ));
        }
        let created_at = datetime_from_unix(offer.created_at);
        let expires_at = datetime_from_unix(offer.expires_at);
        if expires_at <= created_at {
            return Err(CryptoError::InvalidKeyMaterial(format!(
                "key {} expires before it is created",
                offer.key_id
            )));
        }
        Ok(Self::new(offer.key_id.clone(), secret, created_at, expires_at))
    }
}

/// Source of key entropy.
pub trait RandomSource: Send + Sync {
    fn next_bytes(&self, n: usize) -> Result<Vec<u8>, CryptoError>;
}

/// Operating-system CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn next_bytes(&self, n: usize) -> Result<Vec<u8>, CryptoError> {
        let mut buf = vec![0u8; n];
        rand::rngs::OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| CryptoError::Entropy(e.to_string()))?;
        Ok(buf)
    }
}

/// Symmetric cipher and integrity tag over a [`Key`].
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], key: &Key) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, ciphertext: &[u8], key: &Key) -> Result<Vec<u8>, CryptoError>;
    fn sign(&self, plaintext: &[u8], key: &Key) -> String;
    fn verify(&self, plaintext: &[u8], signature: &str, key: &Key) -> bool;
}

/// XOR with the repeating key digest; SHA-256 based integrity tag.
#[derive(Debug, Clone, Copy, Default)]
pub struct XorDigestCipher;

impl XorDigestCipher {
    fn apply(data: &[u8], key: &Key) -> Vec<u8> {
        data.iter()
            .zip(key.derived_digest.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect()
    }
}

impl Cipher for XorDigestCipher {
    fn encrypt(&self, plaintext: &[u8], key: &Key) -> Result<Vec<u8>, CryptoError> {
        Ok(Self::apply(plaintext, key))
    }

    fn decrypt(&self, ciphertext: &[u8], key: &Key) -> Result<Vec<u8>, CryptoError> {
        Ok(Self::apply(ciphertext, key))
    }

    /// `hex(SHA256(SHA256(plaintext) || digest))`
    fn sign(&self, plaintext: &[u8], key: &Key) -> String {
        let inner = Sha256::digest(plaintext);
        let mut hasher = Sha256::new();
        hasher.update(inner);
        hasher.update(key.derived_digest);
        hex::encode(hasher.finalize())
    }

    fn verify(&self, plaintext: &[u8], signature: &str, key: &Key) -> bool {
        let expected = self.sign(plaintext, key);
        expected.as_bytes().ct_eq(signature.as_bytes()).into()
    }
}

/// Generates keys and applies the configured cipher.
pub struct KeyEngine {
    random: Arc<dyn RandomSource>,
    cipher: Arc<dyn Cipher>,
    rotation_interval: chrono::Duration,
    decrypt_grace: chrono::Duration,
    key_bytes: usize,
}

impl KeyEngine {
    /// Engine backed by the OS random source and [`XorDigestCipher`].
    pub fn new(config: &CryptoConfig) -> Self {
        Self::with_parts(config, Arc::new(OsRandom), Arc::new(XorDigestCipher))
    }

    pub fn with_parts(
        config: &CryptoConfig,
        random: Arc<dyn RandomSource>,
        cipher: Arc<dyn Cipher>,
    ) -> Self {
        Self {
            random,
            cipher,
            rotation_interval: secs(config.rotation_interval_secs),
            decrypt_grace: secs(config.decrypt_grace_secs),
            key_bytes: config.key_bytes,
        }
    }

    pub fn rotation_interval(&self) -> chrono::Duration {
        self.rotation_interval
    }

    /// Fresh key for `peer_id`, valid for one rotation interval from now.
    pub fn generate_key(&self, peer_id: &str) -> Result<Key, CryptoError> {
        self.generate_key_at(peer_id, Utc::now())
    }

    pub fn generate_key_at(&self, peer_id: &str, now: DateTime<Utc>) -> Result<Key, CryptoError> {
        let secret = self.random.next_bytes(self.key_bytes)?;
        let key_id = format!("qkey_{peer_id}_{}", uuid::Uuid::new_v4().simple());
        let key = Key::new(key_id, secret, now, now + self.rotation_interval);
        info!(peer = %peer_id, key_id = %key.key_id, "Generated key");
        Ok(key)
    }

    /// Encrypt with a key that has not yet expired.
    pub fn encrypt(&self, plaintext: &[u8], key: &Key) -> Result<Vec<u8>, CryptoError> {
        self.encrypt_at(plaintext, key, Utc::now())
    }

    pub fn encrypt_at(
        &self,
        plaintext: &[u8],
        key: &Key,
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>, CryptoError> {
        if key.is_expired(now) {
            return Err(CryptoError::KeyExpired {
                key_id: key.key_id.clone(),
            });
        }
        self.cipher.encrypt(plaintext, key)
    }

    /// Decrypt; an expired key is still accepted during the grace window.
    pub fn decrypt(&self, ciphertext: &[u8], key: &Key) -> Result<Vec<u8>, CryptoError> {
        self.decrypt_at(ciphertext, key, Utc::now())
    }

    pub fn decrypt_at(
        &self,
        ciphertext: &[u8],
        key: &Key,
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>, CryptoError> {
        if key.expires_at + self.decrypt_grace <= now {
            return Err(CryptoError::KeyExpired {
                key_id: key.key_id.clone(),
            });
        }
        self.cipher.decrypt(ciphertext, key)
    }

    pub fn sign(&self, plaintext: &[u8], key: &Key) -> String {
        self.cipher.sign(plaintext, key)
    }

    pub fn verify(&self, plaintext: &[u8], signature: &str, key: &Key) -> bool {
        self.cipher.verify(plaintext, signature, key)
    }

    /// Replace the peer's key if it has expired, returning the new key.
    ///
    /// Peers without a key are left alone (`Ok(None)`).
    pub fn rotate_if_expired(
        &self,
        registry: &PeerRegistry,
        peer_id: &str,
    ) -> Result<Option<Key>, WireError> {
        self.rotate_if_expired_at(registry, peer_id, Utc::now())
    }

    pub fn rotate_if_expired_at(
        &self,
        registry: &PeerRegistry,
        peer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Key>, WireError> {
        let rotated =
            registry.replace_key_if_expired(peer_id, now, || self.generate_key_at(peer_id, now))?;
        if let Some(ref key) = rotated {
            info!(peer = %peer_id, key_id = %key.key_id, "Rotated expired key");
        }
        Ok(rotated)
    }
}

/// Upper bound on configured lifetimes (100 years) so date arithmetic cannot overflow.
const MAX_LIFETIME_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn secs(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(value.min(MAX_LIFETIME_SECS) as i64)
}
