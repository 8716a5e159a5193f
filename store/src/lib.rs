//! The encrypted state store (4.E): passphrase-locked, erasure-augmented
//! persistence for an opaque blob. Grounded on the original implementation's
//! `disk` package (`client.pb.go`'s `Header`/`Header_SCrypt`/`Header_TPM`),
//! reworked here as a small Rust module rather than a protobuf schema, using
//! `bincode` the way the rest of this workspace encodes wire and disk
//! structures.
//!
//! `store` knows nothing about `Contact`, `Inbox`, or any other part of the
//! client's data model — it persists whatever bytes it is given and returns
//! whatever bytes it reads back. That separation keeps this crate reusable
//! and keeps `client`'s data model free to change without touching the file
//! format's crypto.

pub mod codec;
pub mod erasure;
pub mod errors;
pub mod header;
pub mod lock;

use std::path::{Path, PathBuf};

pub use erasure::{ErasureAnchor, SoftwareAnchor, UnavailableTpmAnchor};
pub use errors::StoreError;
pub use header::{Header, KdfParams};

/// Owns the lock on a single state file for as long as it is open. Created
/// fresh with a random salt, or opened against an existing file on disk.
pub struct StateStore {
    path: PathBuf,
    header: Header,
    _lock: lock::FileLock,
}

impl StateStore {
    /// Creates a brand new state file at `path`, failing if one already
    /// exists. `no_erasure_storage` matches the caller's choice for
    /// `Header::new`; the salt is generated here.
    pub fn create(
        path: &Path,
        passphrase: &[u8],
        anchor: &dyn ErasureAnchor,
        no_erasure_storage: bool,
        initial_plaintext: &[u8],
    ) -> Result<Self, StoreError> {
        if path.exists() {
            return Err(StoreError::Corrupt);
        }
        let lock = lock::FileLock::acquire(path)?;
        let mut salt = [0u8; 32];
        protocol::primitives::random_bytes(&mut salt);
        let header = Header::new(salt.to_vec(), no_erasure_storage);
        codec::write_state(path, passphrase, &header, anchor, initial_plaintext)?;
        Ok(StateStore {
            path: path.to_path_buf(),
            header,
            _lock: lock,
        })
    }

    /// Opens an existing state file, acquiring its lock and reading its
    /// plaintext. Fails with `StoreError::Locked` if another process already
    /// holds the lock, and `StoreError::BadPassphrase` if `passphrase` or
    /// `anchor` is wrong.
    pub fn open(path: &Path, passphrase: &[u8], anchor: &dyn ErasureAnchor) -> Result<(Self, Vec<u8>), StoreError> {
        let lock = lock::FileLock::acquire(path)?;
        let header = codec::read_header(path)?;
        let plaintext = codec::read_state(path, passphrase, anchor)?;
        Ok((
            StateStore {
                path: path.to_path_buf(),
                header,
                _lock: lock,
            },
            plaintext,
        ))
    }

    /// Re-encrypts and atomically replaces the file's contents with
    /// `plaintext`, reusing the header (and therefore the salt and KDF
    /// parameters) this store was opened or created with.
    pub fn save(&self, passphrase: &[u8], anchor: &dyn ErasureAnchor, plaintext: &[u8]) -> Result<(), StoreError> {
        codec::write_state(&self.path, passphrase, &self.header, anchor, plaintext)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Destroys the erasure anchor backing this file. After this call the
    /// file is unrecoverable even with the correct passphrase, unless the
    /// header has `no_erasure_storage` set, in which case this is a no-op.
    pub fn erase(&self, anchor: &dyn ErasureAnchor) -> Result<(), StoreError> {
        if self.header.no_erasure_storage {
            return Ok(());
        }
        anchor.erase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pond-store-lib-test-{}-{}", std::process::id(), name))
    }

    #[test]
    fn create_then_open_round_trips() {
        let path = temp_path("create-open");
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("lock"));
        let anchor = SoftwareAnchor;
        {
            let store = StateStore::create(&path, b"pw", &anchor, false, b"v1").unwrap();
            store.save(b"pw", &anchor, b"v2").unwrap();
        }
        let (_, plaintext) = StateStore::open(&path, b"pw", &anchor).unwrap();
        assert_eq!(plaintext, b"v2");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn open_while_locked_fails() {
        let path = temp_path("locked");
        let _ = std::fs::remove_file(&path);
        let anchor = SoftwareAnchor;
        let _store = StateStore::create(&path, b"pw", &anchor, false, b"v1").unwrap();
        let second = StateStore::open(&path, b"pw", &anchor);
        assert!(matches!(second, Err(StoreError::Locked)));
        let _ = std::fs::remove_file(&path);
    }
}
