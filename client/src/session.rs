//! Binds the message lifecycle manager (`Core`) to the encrypted state
//! store (`store::StateStore`), completing the save discipline of §5: "the
//! core task calls `save()`, which enqueues a full snapshot to the writer
//! task". This workspace's writer task is `Scheduler`'s coordinator loop
//! (see `scheduler.rs`); `Session` is the synchronous half that knows how
//! to turn `Core::state` into the plaintext bytes `StateStore` persists and
//! back, the same boundary `store`'s own doc comment draws between "opaque
//! bytes" and "the client's data model".

use crate::lifecycle::Core;
use crate::model::State;
use common::Clock;
use log::info;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use store::{ErasureAnchor, StateStore, StoreError};
use zeroize::Zeroizing;

/// An open session: the in-memory `Core` plus the encrypted file it is
/// persisted to. Every public mutator on `Core` is synchronous and leaves
/// `Core::state` internally consistent; callers that need a mutation to
/// survive a restart call `Session::save` afterward (directly, or via the
/// scheduler's coordinator, which calls it after applying each
/// `CoreEvent`).
pub struct Session {
    pub core: Core,
    store: StateStore,
    passphrase: Zeroizing<Vec<u8>>,
    path: PathBuf,
}

impl Session {
    /// Creates a brand-new state file at `path` seeded with `state`, failing
    /// if a file already exists there.
    pub fn create(
        path: &Path,
        passphrase: &[u8],
        anchor: &dyn ErasureAnchor,
        no_erasure_storage: bool,
        state: State,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let plaintext = bincode::serialize(&state).expect("State always serializes");
        let store = StateStore::create(path, passphrase, anchor, no_erasure_storage, &plaintext)?;
        Ok(Session {
            core: Core::new(state, clock),
            store,
            passphrase: Zeroizing::new(passphrase.to_vec()),
            path: path.to_path_buf(),
        })
    }

    /// Opens an existing state file, decrypting it with `passphrase` and
    /// `anchor` and decoding the resulting plaintext into a `State`.
    /// Fails with `StoreError::BadPassphrase` exactly as `StateStore::open`
    /// does — this layer adds no new way to get that answer wrong.
    pub fn open(path: &Path, passphrase: &[u8], anchor: &dyn ErasureAnchor, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let (store, plaintext) = StateStore::open(path, passphrase, anchor)?;
        let state: State = bincode::deserialize(&plaintext).map_err(|_| StoreError::Corrupt)?;
        Ok(Session {
            core: Core::new(state, clock),
            store,
            passphrase: Zeroizing::new(passphrase.to_vec()),
            path: path.to_path_buf(),
        })
    }

    /// Serialises the current `State` snapshot and atomically replaces the
    /// file's contents, reusing the header this session was opened or
    /// created with (same salt, same KDF cost). Call after any mutation of
    /// `core.state` that must survive a restart.
    pub fn save(&self, anchor: &dyn ErasureAnchor) -> Result<(), StoreError> {
        let plaintext = bincode::serialize(&self.core.state).map_err(|_| StoreError::Corrupt)?;
        self.store.save(&self.passphrase, anchor, &plaintext)?;
        info!("session snapshot saved to {}", self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GroupKeyPair;
    use common::TestClock;
    use store::SoftwareAnchor;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pond-session-test-{}-{}", std::process::id(), name))
    }

    fn fresh_state() -> State {
        let group_private = protocol::PrivateKey::generate();
        let group_public = group_private.public_key();
        State::new(
            protocol::Identity::generate(),
            "wss://relay.example".into(),
            GroupKeyPair {
                public: group_public,
                private: group_private,
            },
        )
    }

    #[test]
    fn create_mutate_save_then_reopen_round_trips() {
        let path = temp_path("round-trip");
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("lock"));
        let anchor = SoftwareAnchor;
        let clock = Arc::new(TestClock::new(1_700_000_000));

        {
            let mut session = Session::create(&path, b"hunter2", &anchor, false, fresh_state(), clock.clone()).unwrap();
            session.core.begin_direct_kx("bob".into(), "wss://relay.example".into()).unwrap();
            session.save(&anchor).unwrap();
        }

        let reopened = Session::open(&path, b"hunter2", &anchor, clock).unwrap();
        assert_eq!(reopened.core.state.contacts.len(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn reopen_with_wrong_passphrase_fails() {
        let path = temp_path("wrong-pass");
        let _ = std::fs::remove_file(&path);
        let anchor = SoftwareAnchor;
        let clock = Arc::new(TestClock::new(0));
        let _session = Session::create(&path, b"correct", &anchor, false, fresh_state(), clock.clone()).unwrap();
        drop(_session);

        let result = Session::open(&path, b"incorrect", &anchor, clock);
        assert!(matches!(result, Err(StoreError::BadPassphrase)));
        let _ = std::fs::remove_file(&path);
    }
}
