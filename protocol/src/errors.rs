//! Error types for the crypto primitives adapter, the ratchet engine and the
//! two key-exchange subsystems. Each enum is hand-rolled `Display` +
//! `std::error::Error`, matching the rest of the workspace rather than
//! pulling in a derive-macro crate for it.

use std::fmt::{Display, Formatter};

/// Errors from the primitives adapter (4.A): AEAD, KDF and scrypt failures
/// that are not specific to the ratchet or a key-exchange flow.
#[derive(Debug)]
pub enum CryptoError {
    /// AEAD open failed: wrong key, wrong nonce, or tampered ciphertext.
    AuthenticationFailed,

    /// A key derivation step was given material of the wrong length.
    InvalidKeyMaterial,

    /// Ciphertext or encoded key was shorter than the format requires.
    Truncated,

    /// scrypt was called with parameters it refuses (e.g. N not a power of two).
    InvalidKdfParams,
}

impl Display for CryptoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::AuthenticationFailed => write!(f, "authentication failed"),
            CryptoError::InvalidKeyMaterial => write!(f, "invalid key material length"),
            CryptoError::Truncated => write!(f, "truncated input"),
            CryptoError::InvalidKdfParams => write!(f, "invalid kdf parameters"),
        }
    }
}

impl std::error::Error for CryptoError {}

impl From<aes_gcm::Error> for CryptoError {
    fn from(_: aes_gcm::Error) -> Self {
        CryptoError::AuthenticationFailed
    }
}

impl From<hkdf::InvalidLength> for CryptoError {
    fn from(_: hkdf::InvalidLength) -> Self {
        CryptoError::InvalidKeyMaterial
    }
}

impl From<scrypt::errors::InvalidParams> for CryptoError {
    fn from(_: scrypt::errors::InvalidParams) -> Self {
        CryptoError::InvalidKdfParams
    }
}

impl From<scrypt::errors::InvalidOutputLen> for CryptoError {
    fn from(_: scrypt::errors::InvalidOutputLen) -> Self {
        CryptoError::InvalidKdfParams
    }
}

/// Errors from the ratchet engine (4.B). Each variant maps to exactly one
/// of the named failure kinds in the error-handling design.
#[derive(Debug)]
pub enum RatchetError {
    /// AEAD open of the message body failed under an otherwise-valid header.
    AuthFailed,

    /// Neither header key, nor any cached header key, opened the header.
    HeaderAuthFailed,

    /// The header decrypted but its counter has already been consumed and no
    /// skipped-key cache entry covers it: a replay or a duplicate delivery.
    DuplicateMessage,

    /// Advancing the chain to reach the header's counter would derive more
    /// than `MAX_SKIP` message keys in one step.
    SkipGapExceeded,

    /// Underlying crypto primitive failure (KDF, AEAD) not specific to the
    /// ratchet's own bookkeeping.
    Crypto(CryptoError),
}

impl Display for RatchetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RatchetError::AuthFailed => write!(f, "message authentication failed"),
            RatchetError::HeaderAuthFailed => write!(f, "header authentication failed"),
            RatchetError::DuplicateMessage => write!(f, "duplicate or already-consumed message"),
            RatchetError::SkipGapExceeded => write!(f, "skipped message key gap exceeds limit"),
            RatchetError::Crypto(e) => write!(f, "crypto error: {}", e),
        }
    }
}

impl std::error::Error for RatchetError {}

impl From<CryptoError> for RatchetError {
    fn from(value: CryptoError) -> Self {
        RatchetError::Crypto(value)
    }
}

/// Errors from the direct handshake (4.C) and PANDA rendezvous (4.D) key
/// exchange subsystems.
#[derive(Debug)]
pub enum KxError {
    /// The handshake blob's signature did not verify under the claimed
    /// identity key.
    BadSignature,

    /// The peer's identity key matches our own: a reflected or looped-back
    /// handshake.
    SelfExchange,

    /// The blob could not be parsed into the expected handshake fields.
    Malformed,

    /// The peer advertised a `supported_version` we do not implement.
    UnsupportedVersion,

    /// The PANDA exchange's sealed blob failed to open: the shared secret
    /// the two sides used does not match.
    PandaAuthFailed,

    /// The PANDA state machine received an update that is not valid from
    /// its current state (e.g. a second post after already exchanging).
    PandaProtocol,

    /// Underlying crypto primitive failure.
    Crypto(CryptoError),
}

impl Display for KxError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            KxError::BadSignature => write!(f, "handshake signature invalid"),
            KxError::SelfExchange => write!(f, "handshake reflects our own identity"),
            KxError::Malformed => write!(f, "malformed handshake blob"),
            KxError::UnsupportedVersion => write!(f, "unsupported protocol version"),
            KxError::PandaAuthFailed => write!(f, "panda exchange authentication failed"),
            KxError::PandaProtocol => write!(f, "panda exchange used out of sequence"),
            KxError::Crypto(e) => write!(f, "crypto error: {}", e),
        }
    }
}

impl std::error::Error for KxError {}

impl From<CryptoError> for KxError {
    fn from(value: CryptoError) -> Self {
        KxError::Crypto(value)
    }
}

impl From<ed25519_dalek::SignatureError> for KxError {
    fn from(_: ed25519_dalek::SignatureError) -> Self {
        KxError::BadSignature
    }
}
