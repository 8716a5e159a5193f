//! Key and secret types shared by the ratchet engine and both key-exchange
//! subsystems. Mirrors the shape of the teacher's `utils.rs` wrapper types
//! (`PublicKey`, `PrivateKey`, `SharedSecret`, `Signature`) but trims it down
//! to the primitives this workspace actually needs and adds the symmetric
//! `AeadKey` used for both header and message encryption.

use crate::constants::{AES256_NONCE_LENGTH, AES256_SECRET_LENGTH, CURVE25519_PUBLIC_LENGTH};
use crate::errors::CryptoError;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use base64::{engine::general_purpose, Engine as _};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::convert::TryInto;
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A Curve25519 public key used for ratchet and key-exchange Diffie-Hellman.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; CURVE25519_PUBLIC_LENGTH]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; CURVE25519_PUBLIC_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", general_purpose::STANDARD.encode(self.0))
    }
}

impl From<&PrivateKey> for PublicKey {
    fn from(sk: &PrivateKey) -> Self {
        let secret = StaticSecret::from(sk.0);
        PublicKey(*XPublicKey::from(&secret).as_bytes())
    }
}

/// A Curve25519 private scalar. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct PrivateKey([u8; 32]);

impl PrivateKey {
    /// Generates a fresh random private key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        PrivateKey(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PrivateKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(self)
    }

    /// X25519 Diffie-Hellman with a peer's public key.
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> SharedSecret {
        let secret = StaticSecret::from(self.0);
        let their = XPublicKey::from(their_public.0);
        SharedSecret(secret.diffie_hellman(&their).to_bytes())
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey(<redacted>)")
    }
}

/// A 32-byte secret produced by a Diffie-Hellman exchange or a KDF step.
/// Used as KDF input, never directly as an AEAD key.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct SharedSecret(pub [u8; 32]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// A symmetric AES-256-GCM key, used for both ratchet header keys and
/// per-message keys, and for group keys and erasure-storage keys in the
/// state store. The nonce is supplied by the caller (it is derived from a
/// monotonic counter everywhere this type is used) rather than generated
/// here, so that encryption stays deterministic for replay-free decoding.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct AeadKey([u8; AES256_SECRET_LENGTH]);

impl AeadKey {
    pub fn from_bytes(bytes: [u8; AES256_SECRET_LENGTH]) -> Self {
        AeadKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; AES256_SECRET_LENGTH] {
        &self.0
    }

    pub fn seal(
        &self,
        nonce: &[u8; AES256_NONCE_LENGTH],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.0).map_err(|_| CryptoError::InvalidKeyMaterial)?;
        cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(CryptoError::from)
    }

    /// Constant-time comparison of the raw key bytes, used to find the
    /// bucket a skipped message key was cached under.
    pub fn constant_time_eq(&self, other: &AeadKey) -> bool {
        let mut diff: u8 = 0;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }

    pub fn open(
        &self,
        nonce: &[u8; AES256_NONCE_LENGTH],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(&self.0).map_err(|_| CryptoError::InvalidKeyMaterial)?;
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(CryptoError::from)
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AeadKey(<redacted>)")
    }
}

/// An Ed25519 signature over a handshake blob or a PANDA card.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes")] pub [u8; 64]);

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 64] = bytes.try_into().map_err(|_| CryptoError::Truncated)?;
        Ok(Signature(arr))
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", general_purpose::STANDARD.encode(self.0))
    }
}

/// Derives a nonce from a monotonic counter. Safe to reuse a key across many
/// calls as long as the counter never repeats for that key, which both the
/// ratchet's header-key epochs and its per-message keys guarantee.
pub fn nonce_from_counter(counter: u32) -> [u8; AES256_NONCE_LENGTH] {
    let mut nonce = [0u8; AES256_NONCE_LENGTH];
    nonce[AES256_NONCE_LENGTH - 4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_round_trip() {
        let a = PrivateKey::generate();
        let b = PrivateKey::generate();
        let shared_a = a.diffie_hellman(&b.public_key());
        let shared_b = b.diffie_hellman(&a.public_key());
        assert_eq!(shared_a.0, shared_b.0);
    }

    #[test]
    fn aead_round_trip() {
        let key = AeadKey::from_bytes([7u8; 32]);
        let nonce = nonce_from_counter(42);
        let ct = key.seal(&nonce, b"aad", b"hello").unwrap();
        let pt = key.open(&nonce, b"aad", &ct).unwrap();
        assert_eq!(pt, b"hello");
    }

    #[test]
    fn aead_rejects_tamper() {
        let key = AeadKey::from_bytes([7u8; 32]);
        let nonce = nonce_from_counter(1);
        let mut ct = key.seal(&nonce, b"aad", b"hello").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xff;
        assert!(key.open(&nonce, b"aad", &ct).is_err());
    }
}
