//! Encodes and decodes the on-disk state file: passphrase-derived,
//! erasure-augmented encryption of an opaque blob handed in by the caller,
//! with a smeared nonce and an atomic write path. `store` never looks inside
//! the blob it is given — `client` is the only crate that knows it is
//! bincode-encoded `State`.

use crate::erasure::ErasureAnchor;
use crate::errors::StoreError;
use crate::header::Header;
use log::{info, warn};
use protocol::constants::AES256_NONCE_LENGTH;
use protocol::keys::AeadKey;
use protocol::primitives::{random_bytes, scrypt_derive};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

const AAD: &[u8] = b"pond-state-file-v1";

#[derive(Serialize, Deserialize)]
struct Envelope {
    header: Header,
    /// `header.nonce_smear_copies` random components; XOR'd together at open
    /// time to reconstruct the nonce actually used to seal `ciphertext`.
    #[serde(with = "serde_bytes")]
    smear_components: Vec<u8>,
    #[serde(with = "serde_bytes")]
    ciphertext: Vec<u8>,
}

fn smear_nonce(components: &[u8], copies: u32) -> Result<[u8; AES256_NONCE_LENGTH], StoreError> {
    if copies == 0 || components.len() != AES256_NONCE_LENGTH * copies as usize {
        return Err(StoreError::Corrupt);
    }
    let mut nonce = [0u8; AES256_NONCE_LENGTH];
    for chunk in components.chunks_exact(AES256_NONCE_LENGTH) {
        for (n, c) in nonce.iter_mut().zip(chunk.iter()) {
            *n ^= c;
        }
    }
    Ok(nonce)
}

fn generate_smear_components(copies: u32) -> Vec<u8> {
    let mut components = vec![0u8; AES256_NONCE_LENGTH * copies as usize];
    random_bytes(&mut components);
    components
}

/// Combines the passphrase-derived key with the erasure anchor's key, unless
/// the header opts out of erasure binding entirely.
fn derive_file_key(
    passphrase: &[u8],
    header: &Header,
    anchor: &dyn ErasureAnchor,
) -> Result<AeadKey, StoreError> {
    let scrypt_key = match &header.kdf {
        crate::header::KdfParams::Scrypt { log_n, r, p } => {
            scrypt_derive(passphrase, &header.kdf_salt, *log_n, *r, *p).map_err(|_| StoreError::Corrupt)?
        }
        crate::header::KdfParams::TpmNvram { .. } => {
            return Err(StoreError::ErasureAnchorUnavailable);
        }
    };

    if header.no_erasure_storage {
        return Ok(AeadKey::from_bytes(scrypt_key));
    }

    let erasure_key = anchor.erasure_key(header)?;
    let mut combined = [0u8; 32];
    for ((c, a), b) in combined.iter_mut().zip(scrypt_key.iter()).zip(erasure_key.iter()) {
        *c = a ^ b;
    }
    Ok(AeadKey::from_bytes(combined))
}

/// Encrypts `plaintext` and atomically replaces the file at `path`: writes
/// to a sibling temp file, `fsync`s it, then renames over the destination so
/// a crash mid-write never leaves a half-written state file.
pub fn write_state(
    path: &Path,
    passphrase: &[u8],
    header: &Header,
    anchor: &dyn ErasureAnchor,
    plaintext: &[u8],
) -> Result<(), StoreError> {
    let key = derive_file_key(passphrase, header, anchor)?;
    let components = generate_smear_components(header.nonce_smear_copies);
    let nonce = smear_nonce(&components, header.nonce_smear_copies)?;
    let ciphertext = key.seal(&nonce, AAD, plaintext).map_err(|_| StoreError::Corrupt)?;

    let envelope = Envelope {
        header: header.clone(),
        smear_components: components,
        ciphertext,
    };
    let bytes = bincode::serialize(&envelope).map_err(|_| StoreError::Corrupt)?;

    let tmp_path = sibling_tmp_path(path);
    {
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(&bytes)?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    info!("wrote state file {}", path.display());
    Ok(())
}

/// Decrypts the file at `path`. A wrong passphrase and a corrupted file are
/// both surfaced as `StoreError::BadPassphrase` when the envelope itself
/// parses — only a malformed envelope is reported as `Corrupt`.
pub fn read_state(path: &Path, passphrase: &[u8], anchor: &dyn ErasureAnchor) -> Result<Vec<u8>, StoreError> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let envelope: Envelope = bincode::deserialize(&bytes).map_err(|_| StoreError::Corrupt)?;

    let key = derive_file_key(passphrase, &envelope.header, anchor)?;
    let nonce = smear_nonce(&envelope.smear_components, envelope.header.nonce_smear_copies)?;
    key.open(&nonce, AAD, &envelope.ciphertext).map_err(|_| {
        warn!("state file {} did not open: bad passphrase or corrupt erasure key", path.display());
        StoreError::BadPassphrase
    })
}

/// Reads just the header, without a passphrase, so callers can decide which
/// `ErasureAnchor` to construct before attempting to open the file.
pub fn read_header(path: &Path) -> Result<Header, StoreError> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let envelope: Envelope = bincode::deserialize(&bytes).map_err(|_| StoreError::Corrupt)?;
    Ok(envelope.header)
}

fn sibling_tmp_path(path: &Path) -> std::path::PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    std::path::PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erasure::SoftwareAnchor;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("pond-store-codec-test-{}-{}", std::process::id(), name))
    }

    #[test]
    fn round_trips_plaintext() {
        let path = temp_path("roundtrip");
        let header = Header::new(b"some-salt".to_vec(), false);
        let anchor = SoftwareAnchor;
        write_state(&path, b"correct horse", &header, &anchor, b"hello state").unwrap();
        let out = read_state(&path, b"correct horse", &anchor).unwrap();
        assert_eq!(out, b"hello state");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let path = temp_path("wrongpass");
        let header = Header::new(b"some-salt".to_vec(), false);
        let anchor = SoftwareAnchor;
        write_state(&path, b"correct horse", &header, &anchor, b"hello state").unwrap();
        let out = read_state(&path, b"wrong horse", &anchor);
        assert!(matches!(out, Err(StoreError::BadPassphrase)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn no_erasure_storage_skips_the_anchor() {
        let path = temp_path("noerasure");
        let header = Header::new(b"salt".to_vec(), true);
        // An anchor that always fails must not be consulted.
        struct Refusing;
        impl ErasureAnchor for Refusing {
            fn erasure_key(&self, _: &Header) -> Result<[u8; 32], StoreError> {
                Err(StoreError::ErasureAnchorUnavailable)
            }
            fn erase(&self) -> Result<(), StoreError> {
                Err(StoreError::ErasureAnchorUnavailable)
            }
        }
        write_state(&path, b"pw", &header, &Refusing, b"data").unwrap();
        let out = read_state(&path, b"pw", &Refusing).unwrap();
        assert_eq!(out, b"data");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn header_is_readable_without_a_passphrase() {
        let path = temp_path("headeronly");
        let header = Header::new(b"salt-xyz".to_vec(), false);
        let anchor = SoftwareAnchor;
        write_state(&path, b"pw", &header, &anchor, b"data").unwrap();
        let read_back = read_header(&path).unwrap();
        assert_eq!(read_back.kdf_salt, b"salt-xyz");
        let _ = std::fs::remove_file(&path);
    }
}
