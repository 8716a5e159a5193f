//! The unified error type surfaced by `store` and `client` to their callers.
//! Groups every leaf error along the four buckets of the error-handling
//! design (`UserRecoverable`, `Transient`, `Protocol`, `Fatal`), the same
//! layering the teacher's `ClientError::ProtocolError(X3DHError)` and
//! `ServerError::X3DHError(X3DHError)` use, hand-rolled rather than built
//! with `thiserror` since the teacher never reaches for it either.

use protocol::{CryptoError, KxError, RatchetError};
use std::fmt::{Display, Formatter};

/// The specific named failure behind a `CoreError`, independent of which
/// bucket it landed in. Logged at the level the bucket implies (see the
/// workspace's logging conventions).
#[derive(Debug)]
pub enum Reason {
    BadPassphrase,
    KxBadSignature,
    KxSelf,
    KxMalformed,
    KxVersionUnsupported,
    RatchetAuth,
    RatchetHeaderAuth,
    RatchetDup,
    RatchetGapExceeded,
    CryptoAuth,
    PandaFailed,
    PandaProtocolMisuse,
    StoreIo,
    StoreLocked,
    TransportTimeout,
    Other(String),
}

impl Display for Reason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::BadPassphrase => write!(f, "bad_passphrase"),
            Reason::KxBadSignature => write!(f, "kx_bad_signature"),
            Reason::KxSelf => write!(f, "kx_self"),
            Reason::KxMalformed => write!(f, "kx_malformed"),
            Reason::KxVersionUnsupported => write!(f, "kx_version_unsupported"),
            Reason::RatchetAuth => write!(f, "ratchet_auth"),
            Reason::RatchetHeaderAuth => write!(f, "ratchet_header_auth"),
            Reason::RatchetDup => write!(f, "ratchet_dup"),
            Reason::RatchetGapExceeded => write!(f, "ratchet_gap_exceeded"),
            Reason::CryptoAuth => write!(f, "crypto_auth"),
            Reason::PandaFailed => write!(f, "panda_failed"),
            Reason::PandaProtocolMisuse => write!(f, "panda_protocol_misuse"),
            Reason::StoreIo => write!(f, "store_io"),
            Reason::StoreLocked => write!(f, "store_locked"),
            Reason::TransportTimeout => write!(f, "transport_timeout"),
            Reason::Other(s) => write!(f, "{}", s),
        }
    }
}

/// The four error buckets of the error-handling design: whether the caller
/// should ask the user to fix something, retry automatically, treat it as a
/// peer/data integrity problem, or stop.
#[derive(Debug)]
pub enum CoreError {
    UserRecoverable(Reason),
    Transient(Reason),
    Protocol(Reason),
    Fatal(Reason),
}

impl CoreError {
    pub fn reason(&self) -> &Reason {
        match self {
            CoreError::UserRecoverable(r)
            | CoreError::Transient(r)
            | CoreError::Protocol(r)
            | CoreError::Fatal(r) => r,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        CoreError::Fatal(Reason::Other(message.into()))
    }

    pub fn user_recoverable(message: impl Into<String>) -> Self {
        CoreError::UserRecoverable(Reason::Other(message.into()))
    }

    pub fn transient(message: impl Into<String>) -> Self {
        CoreError::Transient(Reason::Other(message.into()))
    }
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::UserRecoverable(r) => write!(f, "user recoverable: {}", r),
            CoreError::Transient(r) => write!(f, "transient: {}", r),
            CoreError::Protocol(r) => write!(f, "protocol: {}", r),
            CoreError::Fatal(r) => write!(f, "fatal: {}", r),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<RatchetError> for CoreError {
    fn from(value: RatchetError) -> Self {
        match value {
            RatchetError::AuthFailed => CoreError::Protocol(Reason::RatchetAuth),
            RatchetError::HeaderAuthFailed => CoreError::Protocol(Reason::RatchetHeaderAuth),
            RatchetError::DuplicateMessage => CoreError::Protocol(Reason::RatchetDup),
            RatchetError::SkipGapExceeded => CoreError::Protocol(Reason::RatchetGapExceeded),
            RatchetError::Crypto(_) => CoreError::Protocol(Reason::CryptoAuth),
        }
    }
}

impl From<KxError> for CoreError {
    fn from(value: KxError) -> Self {
        match value {
            KxError::BadSignature => CoreError::Protocol(Reason::KxBadSignature),
            KxError::SelfExchange => CoreError::Protocol(Reason::KxSelf),
            KxError::Malformed => CoreError::Protocol(Reason::KxMalformed),
            KxError::UnsupportedVersion => CoreError::Protocol(Reason::KxVersionUnsupported),
            // A PANDA card that won't open means the two sides do not share
            // the secret they think they do: the user mistyped or misread
            // it, not something a retry fixes.
            KxError::PandaAuthFailed => CoreError::UserRecoverable(Reason::PandaFailed),
            KxError::PandaProtocol => CoreError::Fatal(Reason::PandaProtocolMisuse),
            KxError::Crypto(_) => CoreError::Protocol(Reason::CryptoAuth),
        }
    }
}

impl From<CryptoError> for CoreError {
    fn from(_: CryptoError) -> Self {
        CoreError::Protocol(Reason::CryptoAuth)
    }
}

impl From<std::io::Error> for CoreError {
    fn from(value: std::io::Error) -> Self {
        CoreError::Fatal(Reason::Other(format!("io error: {}", value)))
    }
}
