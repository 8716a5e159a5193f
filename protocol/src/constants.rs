//! Sizes and protocol constants shared by the primitives, ratchet and key
//! exchange modules.

// byte size of a Curve25519 private key
pub const CURVE25519_SECRET_LENGTH: usize = 32;
// byte size of a Curve25519 public key
pub const CURVE25519_PUBLIC_LENGTH: usize = CURVE25519_SECRET_LENGTH;

pub const SIGNATURE_LENGTH: usize = 64;
// byte size of a sha256 hash
pub const SHA256_HASH_LENGTH: usize = 32;
// byte size of an aes256 key
pub const AES256_SECRET_LENGTH: usize = 32;
// byte size of aes256 nonce
pub const AES256_NONCE_LENGTH: usize = 12;

/// A ratchet will refuse to derive more than this many skipped message keys
/// for a single header key in one call. Bounds the cost of a deliberately
/// out-of-order or malicious peer.
pub const MAX_SKIP: u32 = 1000;

/// Skipped message keys older than this are dropped by `prune_expired_keys`
/// rather than retained indefinitely.
pub const MESSAGE_KEY_LIFETIME_SECS: i64 = 7 * 24 * 3600;

/// Default PANDA / state-store scrypt cost parameters
/// (`examples/original_source/client/disk/client.pb.go`'s `Header_SCrypt` defaults).
pub const SCRYPT_LOG_N: u8 = 15; // N = 32768
pub const SCRYPT_R: u32 = 16;
pub const SCRYPT_P: u32 = 1;

/// Default number of nonce-smear copies written to the state file header.
pub const DEFAULT_NONCE_SMEAR_COPIES: u32 = 1365;

/// Upper bound on PANDA rendezvous retry backoff.
pub const PANDA_MAX_BACKOFF_SECS: u64 = 3600;
