//! Crypto Helper (C11): decrypts the short authentication payload exchanged
//! during the secure two-step handshake.
//!
//! The source scheme XORs `ciphertext[i] ^ key[i % keyLen] ^ iv[i % ivLen]`,
//! which is unauthenticated and reversible without server state. This keeps
//! the wire shape (base64 of a prefix followed by ciphertext) but replaces
//! the cipher with AES-256-GCM keyed by a rotating key ring indexed by the
//! client-supplied `keyId`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use dashmap::DashMap;

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("unknown keyId")]
    UnknownKeyId,
    #[error("payload too short to contain a nonce")]
    PayloadTooShort,
    #[error("invalid base64 payload")]
    InvalidBase64,
    #[error("decryption failed: authentication tag mismatch")]
    DecryptionFailed,
}

/// Holds the per-gateway rotating key ring. `keyId -> 32-byte key`.
pub struct KeyRing {
    keys: DashMap<String, [u8; 32]>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
        }
    }

    /// Seeds the ring with a single key derived from `ENCRYPTION_KEY`, under
    /// the well-known id `"default"`, for deployments that don't rotate keys.
    pub fn with_default_key(raw: &str) -> Self {
        let ring = Self::new();
        if !raw.is_empty() {
            ring.insert("default", derive_key(raw));
        }
        ring
    }

    pub fn insert(&self, key_id: impl Into<String>, key: [u8; 32]) {
        self.keys.insert(key_id.into(), key);
    }

    /// Decrypts `base64(nonce || ciphertext || tag)` using the key for `key_id`.
    pub fn decrypt(&self, key_id: &str, payload_b64: &str) -> Result<Vec<u8>, CryptoError> {
        let key_bytes = self
            .keys
            .get(key_id)
            .map(|entry| *entry.value())
            .ok_or(CryptoError::UnknownKeyId)?;

        let raw = base64::engine::general_purpose::STANDARD
            .decode(payload_b64)
            .map_err(|_| CryptoError::InvalidBase64)?;

        if raw.len() < NONCE_LEN {
            return Err(CryptoError::PayloadTooShort);
        }

        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(nonce_bytes);
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Encrypts under the named key; used only by tests and by operators
    /// minting payloads out-of-band.
    pub fn encrypt(
        &self,
        key_id: &str,
        nonce_bytes: [u8; NONCE_LEN],
        plaintext: &[u8],
    ) -> Result<String, CryptoError> {
        let key_bytes = self
            .keys
            .get(key_id)
            .map(|entry| *entry.value())
            .ok_or(CryptoError::UnknownKeyId)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(out))
    }
}

impl Default for KeyRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Stretches an arbitrary-length configured secret into a 32-byte AES key
/// via repeated XOR folding, so operators can set `ENCRYPTION_KEY` to any
/// passphrase length without a KDF dependency.
fn derive_key(raw: &str) -> [u8; 32] {
    let bytes = raw.as_bytes();
    let mut key = [0u8; 32];
    if bytes.is_empty() {
        return key;
    }
    for (i, byte) in bytes.iter().enumerate() {
        key[i % 32] ^= byte;
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let ring = KeyRing::new();
        ring.insert("k1", [7u8; 32]);
        let nonce = [1u8; NONCE_LEN];
        let payload = ring.encrypt("k1", nonce, b"{\"address\":\"10.0.0.2\"}").unwrap();
        let plaintext = ring.decrypt("k1", &payload).unwrap();
        assert_eq!(plaintext, b"{\"address\":\"10.0.0.2\"}");
    }

    #[test]
    fn unknown_key_id_is_rejected() {
        let ring = KeyRing::new();
        assert!(matches!(
            ring.decrypt("missing", "AAAA"),
            Err(CryptoError::UnknownKeyId)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let ring = KeyRing::new();
        ring.insert("k1", [7u8; 32]);
        let nonce = [1u8; NONCE_LEN];
        let mut payload = ring.encrypt("k1", nonce, b"hello").unwrap();
        payload.push('A');
        assert!(ring.decrypt("k1", &payload).is_err());
    }
}
