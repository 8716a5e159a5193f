//! The message lifecycle manager and transport scheduler (4.F, 4.G): the
//! two outermost layers of the core, sitting on top of `protocol`'s ratchet
//! and key-exchange engines and `store`'s encrypted persistence. Grounded
//! on the teacher's `client` crate, which played the same "owns the
//! session, drives the network" role for a single WebSocket session rather
//! than a contact-per-session ratchet store.

pub mod detachment;
pub mod errors;
pub mod lifecycle;
pub mod model;
pub mod scheduler;
pub mod session;

pub use detachment::{CancelHandle, DetachmentErrorKind, DetachmentEvent, DETACHMENT_CHUNK_SIZE};
pub use errors::{LifecycleError, SchedulerError};
pub use lifecycle::{Core, DraftUsage, SendResult};
pub use model::*;
pub use scheduler::{CoreEvent, MockRelay, RelayEnvelope, RelayTransport, Scheduler};
pub use session::Session;

#[cfg(test)]
mod tests {
    use super::*;
    use common::TestClock;
    use std::sync::Arc;

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

    fn core() -> Core {
        Core::new(fresh_state(), Arc::new(TestClock::new(0)))
    }

    #[test]
    fn draft_lifecycle_and_size_cap() {
        let mut core = core();
        let draft_id = core.create_draft(vec![]);
        core.edit_draft(draft_id, b"hello".to_vec()).unwrap();
        let usage = core.usage(draft_id).unwrap();
        assert!(usage.fits);

        core.edit_draft(draft_id, vec![0u8; MAX_SERIALIZED_MESSAGE + 1]).unwrap();
        let usage = core.usage(draft_id).unwrap();
        assert!(!usage.fits);
    }

    #[test]
    fn contact_name_conflict_is_rejected() {
        let mut core = core();
        core.begin_direct_kx("alice".into(), "wss://relay.example".into()).unwrap();
        let err = core.begin_direct_kx("alice".into(), "wss://relay.example".into());
        assert!(matches!(err, Err(LifecycleError::ContactNameConflict)));
    }

    #[test]
    fn expire_inbox_drops_stale_entries_unless_retained() {
        let mut core = core();
        let (contact_id, _) = core.begin_direct_kx("bob".into(), "wss://relay.example/a".into()).unwrap();

        let stale_id = core.state.allocate_inbox_id();
        core.state.inbox.insert(
            stale_id,
            InboxEntry {
                id: stale_id,
                from: contact_id,
                received_time: 0,
                acked: false,
                read: false,
                retained: false,
                content: InboxContent::Sealed(Vec::new()),
                decryptions: Default::default(),
            },
        );
        let retained_id = core.state.allocate_inbox_id();
        core.state.inbox.insert(
            retained_id,
            InboxEntry {
                id: retained_id,
                from: contact_id,
                received_time: 0,
                acked: false,
                read: false,
                retained: true,
                content: InboxContent::Sealed(Vec::new()),
                decryptions: Default::default(),
            },
        );

        core.expire_inbox();
        assert!(!core.state.inbox.contains_key(&stale_id));
        assert!(core.state.inbox.contains_key(&retained_id));
    }
}
