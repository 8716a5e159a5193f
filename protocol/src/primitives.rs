//! The crypto primitives adapter (4.A): the only module in this crate that
//! touches `hkdf`, `scrypt` or `rand` directly. Everything above this layer
//! (ratchet, key exchange) works exclusively in terms of `PublicKey`,
//! `PrivateKey`, `SharedSecret` and `AeadKey` and never imports a crypto
//! crate itself. Mirrors the role the teacher's free `hkdf_rk`/`hkdf_ck`
//! functions played in `protocol/src/ratchet.rs`, generalised to the
//! three-output root-key step the header-key ratchet needs.

use crate::constants::{AES256_SECRET_LENGTH, SCRYPT_LOG_N, SCRYPT_P, SCRYPT_R};
use crate::errors::CryptoError;
use crate::keys::{AeadKey, SharedSecret};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use scrypt::Params as ScryptParams;
use sha2::Sha256;

/// Domain-separation prefix used ahead of the root key whenever a DH
/// ratchet step is performed. Matches the 32x0xFF convention the teacher's
/// `hkdf_rk` used to keep root-key derivation distinguishable from chain-key
/// derivation even though both run through the same hash function.
const ROOT_STEP_PREFIX: [u8; 32] = [0xFFu8; 32];

/// Derives the next root key, the new chain key, and the new header key for
/// the direction that just performed a DH ratchet step.
///
/// `ikm` is the DH output; `root_key` salts the derivation so repeated DH
/// outputs (which should never happen, but defense in depth) still diverge
/// across sessions.
pub fn kdf_root_step(
    root_key: &SharedSecret,
    dh_output: &SharedSecret,
) -> Result<(SharedSecret, AeadKey, AeadKey), CryptoError> {
    let mut ikm = Vec::with_capacity(32 + 32);
    ikm.extend_from_slice(&ROOT_STEP_PREFIX);
    ikm.extend_from_slice(dh_output.as_bytes());
    let hk = Hkdf::<Sha256>::new(Some(root_key.as_bytes()), &ikm);

    let mut root_out = [0u8; 32];
    hk.expand(b"pond-ratchet-root", &mut root_out)?;
    let mut chain_out = [0u8; 32];
    hk.expand(b"pond-ratchet-chain", &mut chain_out)?;
    let mut header_out = [0u8; 32];
    hk.expand(b"pond-ratchet-header", &mut header_out)?;

    Ok((
        SharedSecret(root_out),
        AeadKey::from_bytes(chain_out),
        AeadKey::from_bytes(header_out),
    ))
}

/// Advances a symmetric chain key one step, returning `(next_chain_key,
/// message_key)`. Pure HKDF expansion of the chain key with two distinct
/// info labels, the same shape as the teacher's `hkdf_ck`.
pub fn kdf_chain_step(chain_key: &AeadKey) -> Result<(AeadKey, AeadKey), CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, chain_key.as_bytes());
    let mut next_chain = [0u8; 32];
    hk.expand(b"pond-ratchet-chain-next", &mut next_chain)?;
    let mut message_key = [0u8; 32];
    hk.expand(b"pond-ratchet-message-key", &mut message_key)?;
    Ok((AeadKey::from_bytes(next_chain), AeadKey::from_bytes(message_key)))
}

/// Derives a key of arbitrary length from initial keying material with a
/// domain-separating label, used by the direct key exchange to turn the two
/// DH outputs into a root key and by the state store to expand a passphrase
/// key into the smear and erasure sub-keys.
pub fn hkdf_expand_labeled(
    salt: Option<&[u8]>,
    ikm: &[u8],
    label: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(label, out)?;
    Ok(())
}

/// scrypt-derives an `AES256_SECRET_LENGTH`-byte key from a low-entropy
/// secret (a PANDA shared phrase, or a state-file passphrase) and a salt.
/// `log_n` is log2(N); the state-file header and the PANDA handshake both
/// default to `SCRYPT_LOG_N`/`SCRYPT_R`/`SCRYPT_P`.
pub fn scrypt_derive(
    secret: &[u8],
    salt: &[u8],
    log_n: u8,
    r: u32,
    p: u32,
) -> Result<[u8; AES256_SECRET_LENGTH], CryptoError> {
    let params = ScryptParams::new(log_n, r, p, AES256_SECRET_LENGTH)?;
    let mut out = [0u8; AES256_SECRET_LENGTH];
    scrypt::scrypt(secret, salt, &params, &mut out)?;
    Ok(out)
}

/// scrypt with the workspace's default cost parameters.
pub fn scrypt_derive_default(secret: &[u8], salt: &[u8]) -> Result<[u8; AES256_SECRET_LENGTH], CryptoError> {
    scrypt_derive(secret, salt, SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P)
}

/// Fills `out` with cryptographically secure random bytes.
pub fn random_bytes(out: &mut [u8]) {
    OsRng.fill_bytes(out);
}

/// Constant-time byte slice comparison. Used anywhere two MACs, tags or
/// derived secrets are compared so that a mismatch cannot be timed.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PrivateKey;

    #[test]
    fn root_step_diverges_from_inputs() {
        let root = SharedSecret([1u8; 32]);
        let alice = PrivateKey::generate();
        let bob = PrivateKey::generate();
        let dh = alice.diffie_hellman(&bob.public_key());
        let (new_root, chain, header) = kdf_root_step(&root, &dh).unwrap();
        assert_ne!(new_root.0, root.0);
        assert_ne!(chain.as_bytes(), header.as_bytes());
    }

    #[test]
    fn scrypt_is_deterministic() {
        let a = scrypt_derive(b"secret", b"salt", 10, 8, 1).unwrap();
        let b = scrypt_derive(b"secret", b"salt", 10, 8, 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn ct_eq_detects_mismatch() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abd"));
        assert!(!ct_eq(b"abc", b"ab"));
    }
}
