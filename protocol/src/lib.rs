//! Crypto primitives adapter, double-ratchet engine, and the two
//! contact key-exchange subsystems (direct handshake and PANDA rendezvous).
//!
//! Module layout mirrors the component breakdown: `primitives` is the only
//! module that imports a crypto crate directly, `keys` holds the typed
//! wrappers everything else passes around, `ratchet` is the per-session
//! state machine, and `kx_direct`/`kx_panda` are the two ways two parties
//! arrive at a `ratchet::Ratchet`.

pub mod constants;
pub mod errors;
pub mod keys;
pub mod kx_direct;
pub mod kx_panda;
pub mod primitives;
pub mod ratchet;

pub use errors::{CryptoError, KxError, RatchetError};
pub use keys::{nonce_from_counter, AeadKey, PrivateKey, PublicKey, SharedSecret, Signature};
pub use kx_direct::{complete_handshake, HandshakeBlob, HandshakeMaterial, Identity, SUPPORTED_VERSION};
pub use kx_panda::{Card, PandaExchange, PandaSecret, PandaStatus};
pub use ratchet::Ratchet;
