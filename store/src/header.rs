//! The state file's header: everything needed to re-derive the key that
//! opens the rest of the file, plus the nonce-smear count. Field names and
//! defaults are carried over from the original `Header`/`Header_SCrypt`/
//! `Header_TPM` protobuf messages this format replaces.

use serde::{Deserialize, Serialize};

/// How the file's encryption key is derived from the caller-supplied
/// passphrase. `Scrypt` is the default; `TpmNvram` additionally requires an
/// `ErasureAnchor` capable of reaching the named NVRAM index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KdfParams {
    Scrypt { log_n: u8, r: u32, p: u32 },
    TpmNvram { index: u32 },
}

impl KdfParams {
    pub fn default_scrypt() -> Self {
        KdfParams::Scrypt {
            log_n: protocol::constants::SCRYPT_LOG_N,
            r: protocol::constants::SCRYPT_R,
            p: protocol::constants::SCRYPT_P,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    /// Number of random components XOR'd together to produce the AEAD
    /// nonce. Defaults to `DEFAULT_NONCE_SMEAR_COPIES`; a value of 1 is a
    /// plain random nonce.
    pub nonce_smear_copies: u32,

    #[serde(with = "serde_bytes")]
    pub kdf_salt: Vec<u8>,

    pub kdf: KdfParams,

    /// When true, the file does not depend on an `ErasureAnchor` at all:
    /// the passphrase alone derives the key. When false, the derived key is
    /// combined with the anchor's erasure key, so destroying the anchor
    /// makes the file permanently unreadable even with the right passphrase.
    pub no_erasure_storage: bool,
}

impl Header {
    pub fn new(kdf_salt: Vec<u8>, no_erasure_storage: bool) -> Self {
        Header {
            nonce_smear_copies: protocol::constants::DEFAULT_NONCE_SMEAR_COPIES,
            kdf_salt,
            kdf: KdfParams::default_scrypt(),
            no_erasure_storage,
        }
    }
}
