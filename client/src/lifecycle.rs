//! The message lifecycle manager (4.F): drafts, the outbox/inbox state
//! machines, acks, revocations, and key-exchange completion. `Core` owns a
//! `State` exclusively — the single logical owner the concurrency model of
//! §5 calls for — and every mutation here is synchronous, matching the
//! "core task suspends only at its event loop receive" contract the
//! scheduler (see `scheduler.rs`) is built around.

use crate::errors::LifecycleError;
use crate::model::*;
use common::Clock;
use log::{info, warn};
use protocol::{complete_handshake, HandshakeMaterial, PandaExchange};
use std::sync::Arc;

pub struct Core {
    pub state: State,
    clock: Arc<dyn Clock>,
}

/// What `send` hands back to the caller: the outbox id plus whether the
/// caller should prompt the scheduler to wake immediately.
pub struct SendResult {
    pub outbox_id: OutboxId,
}

/// A size/attachment summary for a draft, surfaced to the UI so it can show
/// a live indicator as the user composes.
pub struct DraftUsage {
    pub serialized_size: usize,
    pub max_size: usize,
    pub fits: bool,
}

impl Core {
    pub fn new(state: State, clock: Arc<dyn Clock>) -> Self {
        Core { state, clock }
    }

    fn now(&self) -> i64 {
        self.clock.now().timestamp()
    }

    // ---- Drafts -----------------------------------------------------

    pub fn create_draft(&mut self, to_normal: Vec<ContactId>) -> DraftId {
        let id = self.state.allocate_draft_id();
        let draft = Draft {
            id,
            created: self.now(),
            to_normal,
            to_introduce: Vec::new(),
            body: Vec::new(),
            in_reply_to: None,
            attachments: Vec::new(),
            detachments: Vec::new(),
        };
        self.state.drafts.insert(id, draft);
        id
    }

    pub fn edit_draft(&mut self, draft_id: DraftId, body: Vec<u8>) -> Result<(), LifecycleError> {
        let draft = self.state.drafts.get_mut(&draft_id).ok_or(LifecycleError::ContactNotFound)?;
        draft.body = body;
        Ok(())
    }

    pub fn attach(&mut self, draft_id: DraftId, attachment: InlineAttachment) -> Result<(), LifecycleError> {
        let draft = self.state.drafts.get_mut(&draft_id).ok_or(LifecycleError::ContactNotFound)?;
        draft.attachments.push(attachment);
        Ok(())
    }

    /// Registers an external file as a detachment. Actually streaming and
    /// encrypting its bytes is the scheduler's concern (out of scope: see
    /// the workspace's Non-goals on streaming upload); this records the key
    /// and metadata the message will carry.
    pub fn attach_external(&mut self, draft_id: DraftId, detachment: Detachment) -> Result<(), LifecycleError> {
        let draft = self.state.drafts.get_mut(&draft_id).ok_or(LifecycleError::ContactNotFound)?;
        draft.detachments.push(detachment);
        Ok(())
    }

    pub fn usage(&self, draft_id: DraftId) -> Result<DraftUsage, LifecycleError> {
        let draft = self.state.drafts.get(&draft_id).ok_or(LifecycleError::ContactNotFound)?;
        let message = self.draft_to_message(draft, 0, None);
        let size = bincode::serialized_size(&message).unwrap_or(u64::MAX) as usize;
        Ok(DraftUsage {
            serialized_size: size,
            max_size: MAX_SERIALIZED_MESSAGE,
            fits: size <= MAX_SERIALIZED_MESSAGE,
        })
    }

    fn draft_to_message(&self, draft: &Draft, id: u64, next_dh: Option<protocol::PublicKey>) -> Message {
        Message {
            id,
            time: self.now(),
            body: draft.body.clone(),
            in_reply_to: draft.in_reply_to,
            my_next_dh: next_dh,
            files: draft.attachments.clone(),
            detached_files: draft.detachments.clone(),
            supported_version: protocol::kx_direct::SUPPORTED_VERSION,
        }
    }

    /// Composes the draft into a `Message`, ratchet-encrypts it per
    /// recipient, and enqueues one outbox entry per `to_normal` contact.
    /// Only the first recipient's outbox id is returned — callers sending
    /// to multiple contacts should inspect `state.outbox` for the rest.
    pub fn send(&mut self, draft_id: DraftId) -> Result<SendResult, LifecycleError> {
        let draft = self.state.drafts.get(&draft_id).ok_or(LifecycleError::ContactNotFound)?.clone();
        let message = self.draft_to_message(&draft, self.now() as u64, None);
        let size = bincode::serialized_size(&message).unwrap_or(u64::MAX) as usize;
        if size > MAX_SERIALIZED_MESSAGE {
            return Err(LifecycleError::OversizeMessage {
                size,
                max: MAX_SERIALIZED_MESSAGE,
            });
        }

        let mut first_id = None;
        for contact_id in &draft.to_normal {
            let outbox_id = self.queue_message(*contact_id, message.clone())?;
            first_id.get_or_insert(outbox_id);
        }
        self.state.drafts.remove(&draft_id);
        first_id
            .map(|outbox_id| SendResult { outbox_id })
            .ok_or(LifecycleError::ContactNotFound)
    }

    fn queue_message(&mut self, contact_id: ContactId, message: Message) -> Result<OutboxId, LifecycleError> {
        let plaintext = bincode::serialize(&message).map_err(|_| LifecycleError::ContactNotFound)?;
        let contact = self.state.contacts.get_mut(&contact_id).ok_or(LifecycleError::ContactNotFound)?;
        let ratchet = contact.ratchet.as_mut().ok_or(LifecycleError::ContactNotPending)?;
        let ciphertext = ratchet.encrypt(&plaintext)?;
        let server = contact.peer_relay_server.clone().unwrap_or_default();

        let id = self.state.allocate_outbox_id();
        self.state.outbox.insert(
            id,
            OutboxEntry {
                id,
                to: contact_id,
                server,
                created: self.now(),
                sent: None,
                acked: None,
                ciphertext,
                payload: OutboxPayload::Message(message),
                revocation: false,
                status: OutboxStatus::Queued,
            },
        );
        Ok(id)
    }

    /// Marks an outbox entry as sent by the scheduler. `ciphertext` has
    /// already left the process; this only updates bookkeeping.
    pub fn mark_sent(&mut self, outbox_id: OutboxId) {
        let now = self.now();
        if let Some(entry) = self.state.outbox.get_mut(&outbox_id) {
            entry.sent = Some(now);
            entry.status = OutboxStatus::Sent;
            info!("outbox {outbox_id} marked sent");
        }
    }

    pub fn mark_revoked_by_peer(&mut self, outbox_id: OutboxId) {
        if let Some(entry) = self.state.outbox.get_mut(&outbox_id) {
            entry.status = OutboxStatus::FailedRevokedByPeer;
            warn!("outbox {outbox_id} failed: peer revoked this session");
        }
    }

    /// Aborts a queued outbox entry. Only `Queued` entries can be aborted —
    /// once the scheduler has taken the `Sending` flag the send is
    /// committed.
    pub fn abort_send(&mut self, outbox_id: OutboxId) -> Result<(), LifecycleError> {
        let entry = self.state.outbox.get(&outbox_id).ok_or(LifecycleError::ContactNotFound)?;
        if entry.status != OutboxStatus::Queued {
            return Err(LifecycleError::NotPending);
        }
        self.state.outbox.remove(&outbox_id);
        Ok(())
    }

    // ---- Inbox --------------------------------------------------------

    /// Routes a sealed envelope to the owning contact and attempts
    /// decryption. If the contact is still pending key exchange, the
    /// ciphertext is retained as `Sealed` for `unseal_pending_messages` to
    /// retry later.
    pub fn receive_sealed(&mut self, from: ContactId, bytes: Vec<u8>) -> Result<InboxId, LifecycleError> {
        let now = self.now();
        let id = self.state.allocate_inbox_id();

        let decoded = match self.state.contacts.get_mut(&from) {
            Some(contact) if !contact.is_pending() => {
                let ratchet = contact.ratchet.as_mut().expect("checked not pending");
                match ratchet.decrypt(&bytes, now) {
                    Ok(plaintext) => {
                        let message: Message = bincode::deserialize(&plaintext).map_err(|_| LifecycleError::ContactNotFound)?;
                        Some(message)
                    }
                    Err(e) => {
                        warn!("inbound message from contact {from} rejected: {e}");
                        return Err(e.into());
                    }
                }
            }
            _ => None,
        };

        if let Some(message) = &decoded {
            if message.is_ack() {
                if let Some(acked_id) = message.in_reply_to {
                    self.apply_ack(from, acked_id, now);
                }
            }
        }

        let content = match decoded {
            Some(message) => InboxContent::Decoded(message),
            None => InboxContent::Sealed(bytes),
        };
        self.state.inbox.insert(
            id,
            InboxEntry {
                id,
                from,
                received_time: now,
                acked: false,
                read: false,
                retained: false,
                content,
                decryptions: Default::default(),
            },
        );
        Ok(id)
    }

    /// Marks the outbox entry carrying `message_id` to `from` as acked, per
    /// the outbox monotonicity rule: `acked` only transitions once, and only
    /// after `sent`.
    fn apply_ack(&mut self, from: ContactId, message_id: u64, now: i64) {
        if let Some(entry) = self.state.outbox.values_mut().find(|e| {
            e.to == from
                && e.acked.is_none()
                && matches!(&e.payload, OutboxPayload::Message(m) if m.id == message_id)
        }) {
            entry.acked = Some(now);
            entry.status = OutboxStatus::Acked;
        }
    }

    /// Retries decryption for every sealed inbox entry from `contact_id`,
    /// called once that contact's key exchange completes.
    pub fn unseal_pending_messages(&mut self, contact_id: ContactId) -> Result<usize, LifecycleError> {
        let now = self.now();
        let mut unsealed = 0;
        let entry_ids: Vec<InboxId> = self
            .state
            .inbox
            .iter()
            .filter(|(_, e)| e.from == contact_id && matches!(e.content, InboxContent::Sealed(_)))
            .map(|(id, _)| *id)
            .collect();

        for entry_id in entry_ids {
            let sealed_bytes = match &self.state.inbox[&entry_id].content {
                InboxContent::Sealed(bytes) => bytes.clone(),
                InboxContent::Decoded(_) => continue,
            };
            let contact = self.state.contacts.get_mut(&contact_id).ok_or(LifecycleError::ContactNotFound)?;
            let ratchet = contact.ratchet.as_mut().ok_or(LifecycleError::ContactNotPending)?;
            if let Ok(plaintext) = ratchet.decrypt(&sealed_bytes, now) {
                if let Ok(message) = bincode::deserialize::<Message>(&plaintext) {
                    self.state.inbox.get_mut(&entry_id).unwrap().content = InboxContent::Decoded(message);
                    unsealed += 1;
                }
            }
        }
        Ok(unsealed)
    }

    pub fn ack(&mut self, inbox_id: InboxId) -> Result<(), LifecycleError> {
        let entry = self.state.inbox.get_mut(&inbox_id).ok_or(LifecycleError::ContactNotFound)?;
        entry.acked = true;
        let contact_id = entry.from;
        let acked_message_id = match &entry.content {
            InboxContent::Decoded(message) => Some(message.id),
            InboxContent::Sealed(_) => None,
        };

        // An ack is itself a zero-body message through the same ratchet,
        // carrying the acked message's id so the sender can match it back
        // to an outbox entry.
        let ack = Message {
            id: self.now() as u64,
            time: self.now(),
            body: Vec::new(),
            in_reply_to: acked_message_id,
            my_next_dh: None,
            files: Vec::new(),
            detached_files: Vec::new(),
            supported_version: protocol::kx_direct::SUPPORTED_VERSION,
        };
        self.queue_message(contact_id, ack)?;
        Ok(())
    }

    pub fn delete(&mut self, inbox_id: InboxId) -> Result<(), LifecycleError> {
        self.state.inbox.remove(&inbox_id).ok_or(LifecycleError::ContactNotFound)?;
        Ok(())
    }

    pub fn retain(&mut self, inbox_id: InboxId, retained: bool) -> Result<(), LifecycleError> {
        let entry = self.state.inbox.get_mut(&inbox_id).ok_or(LifecycleError::ContactNotFound)?;
        entry.retained = retained;
        Ok(())
    }

    /// Drops inbox entries past their retention window unless `retained`,
    /// and prunes every contact's skipped-message-key cache of entries past
    /// `MESSAGE_KEY_LIFETIME_SECS`. Both are periodic housekeeping on the
    /// same maintenance tick, not triggered by any single message.
    pub fn expire_inbox(&mut self) {
        let now = self.now();
        self.state
            .inbox
            .retain(|_, entry| entry.retained || entry.expires_at() > now);
        for contact in self.state.contacts.values_mut() {
            if let Some(ratchet) = contact.ratchet.as_mut() {
                ratchet.prune_expired_keys(now);
            }
        }
    }

    // ---- Contacts & key exchange ---------------------------------------

    pub fn begin_direct_kx(
        &mut self,
        name: String,
        relay_server: String,
    ) -> Result<(ContactId, protocol::HandshakeBlob), LifecycleError> {
        if self.state.contact_name_taken(&name) {
            return Err(LifecycleError::ContactNameConflict);
        }
        let material = HandshakeMaterial {
            identity: self.state.identity.clone(),
            ratchet_private: protocol::PrivateKey::generate(),
            group_key: self.state.group_key.public,
            relay_server,
        };
        let outbound = material.build_blob();
        let ratchet_private = material.ratchet_private.clone();

        let id = self.state.allocate_contact_id();
        let now = self.now();
        let mut contact = Contact {
            id,
            name,
            revoked_us: false,
            peer_identity_public: None,
            peer_dh_public: None,
            peer_relay_server: None,
            peer_group_key: None,
            peer_supported_version: None,
            pending: Some(PendingKeyExchange::Direct {
                outbound: outbound.clone(),
                ratchet_private,
            }),
            ratchet: None,
            previous_tags: Vec::new(),
            events: Vec::new(),
            introduced_by: None,
            reintroduced_by: Vec::new(),
            introduced_to: Vec::new(),
        };
        contact.log_event(now, "direct key exchange started");
        info!("contact {id} created: direct key exchange started");
        self.state.contacts.insert(id, contact);
        Ok((id, outbound))
    }

    /// Completes a direct handshake begun with `begin_direct_kx`, using the
    /// process identity that produced the outbound blob.
    pub fn complete_direct_kx(
        &mut self,
        contact_id: ContactId,
        their_blob: protocol::HandshakeBlob,
    ) -> Result<(), LifecycleError> {
        let now = self.now();
        let identity = self.state.identity.clone();
        let contact = self.state.contacts.get_mut(&contact_id).ok_or(LifecycleError::ContactNotFound)?;
        let (outbound, ratchet_private) = match contact.pending.take() {
            Some(PendingKeyExchange::Direct { outbound, ratchet_private }) => (outbound, ratchet_private),
            other => {
                contact.pending = other;
                return Err(LifecycleError::ContactNotPending);
            }
        };

        let material = HandshakeMaterial {
            identity,
            ratchet_private,
            group_key: outbound.group_key,
            relay_server: outbound.relay_server.clone(),
        };
        let ratchet = complete_handshake(&material, &their_blob)?;

        contact.peer_identity_public = Some(their_blob.identity_public);
        contact.peer_dh_public = Some(their_blob.identity_dh_public);
        contact.peer_relay_server = Some(their_blob.relay_server);
        contact.peer_group_key = Some(their_blob.group_key);
        contact.peer_supported_version = Some(their_blob.supported_version);
        contact.ratchet = Some(ratchet);
        contact.log_event(now, "direct key exchange completed");
        info!("contact {contact_id} ready: direct key exchange completed");
        self.unseal_pending_messages(contact_id)?;
        Ok(())
    }

    /// Starts a PANDA rendezvous: builds our own handshake blob from the
    /// process identity and seals it under the shared secret, ready to post.
    pub fn begin_panda_kx(&mut self, name: String, shared_secret: &protocol::PandaSecret) -> Result<ContactId, LifecycleError> {
        if self.state.contact_name_taken(&name) {
            return Err(LifecycleError::ContactNameConflict);
        }
        let ratchet_private = protocol::PrivateKey::generate();
        let material = HandshakeMaterial {
            identity: self.state.identity.clone(),
            ratchet_private: ratchet_private.clone(),
            group_key: self.state.group_key.public,
            relay_server: self.state.server.clone(),
        };
        let my_blob = material.build_blob();
        let exchange = PandaExchange::new(shared_secret, &my_blob)?;

        let id = self.state.allocate_contact_id();
        let now = self.now();
        let mut contact = Contact {
            id,
            name,
            revoked_us: false,
            peer_identity_public: None,
            peer_dh_public: None,
            peer_relay_server: None,
            peer_group_key: None,
            peer_supported_version: None,
            pending: Some(PendingKeyExchange::Panda {
                exchange,
                ratchet_private,
                error: None,
            }),
            ratchet: None,
            previous_tags: Vec::new(),
            events: Vec::new(),
            introduced_by: None,
            reintroduced_by: Vec::new(),
            introduced_to: Vec::new(),
        };
        contact.log_event(now, "PANDA rendezvous started");
        self.state.contacts.insert(id, contact);
        Ok(id)
    }

    /// The meeting tag and outgoing card a PANDA-pending contact still needs
    /// posted to the rendezvous service, if it hasn't been posted yet.
    pub fn panda_outgoing_card(&self, contact_id: ContactId) -> Option<([u8; 16], Vec<u8>)> {
        match self.state.contacts.get(&contact_id)?.pending.as_ref()? {
            PendingKeyExchange::Panda { exchange, .. } if matches!(exchange.status(), protocol::PandaStatus::Init) => {
                Some((*exchange.meeting_tag(), exchange.outgoing_card().to_vec()))
            }
            _ => None,
        }
    }

    pub fn mark_panda_posted(&mut self, contact_id: ContactId) {
        let now = self.now();
        if let Some(Some(PendingKeyExchange::Panda { exchange, .. })) =
            self.state.contacts.get_mut(&contact_id).map(|c| c.pending.as_mut())
        {
            exchange.mark_posted(now);
        }
    }

    /// Feeds one rendezvous poll result into a contact's PANDA exchange.
    /// Returns the peer's blob once the exchange lands on `Exchanged`, ready
    /// for the caller to hand to `complete_panda_kx`.
    pub fn apply_panda_poll(
        &mut self,
        contact_id: ContactId,
        card: Option<&[u8]>,
    ) -> Result<Option<protocol::HandshakeBlob>, LifecycleError> {
        let now = self.now();
        let contact = self.state.contacts.get_mut(&contact_id).ok_or(LifecycleError::ContactNotFound)?;
        let (exchange, error) = match &mut contact.pending {
            Some(PendingKeyExchange::Panda { exchange, error, .. }) => (exchange, error),
            _ => return Err(LifecycleError::ContactNotPending),
        };
        match exchange.poll_result(card, now) {
            Ok(Some(blob)) => {
                exchange.mark_done();
                Ok(Some(blob))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                *error = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    pub fn complete_panda_kx(&mut self, contact_id: ContactId, their_blob: protocol::HandshakeBlob) -> Result<(), LifecycleError> {
        let now = self.now();
        let identity = self.state.identity.clone();
        let contact = self.state.contacts.get_mut(&contact_id).ok_or(LifecycleError::ContactNotFound)?;
        let ratchet_private = match &contact.pending {
            Some(PendingKeyExchange::Panda { ratchet_private, .. }) => ratchet_private.clone(),
            _ => return Err(LifecycleError::ContactNotPending),
        };

        let material = HandshakeMaterial {
            identity,
            ratchet_private,
            group_key: self.state.group_key.public,
            relay_server: self.state.server.clone(),
        };
        let ratchet = complete_handshake(&material, &their_blob)?;

        contact.peer_identity_public = Some(their_blob.identity_public);
        contact.peer_dh_public = Some(their_blob.identity_dh_public);
        contact.peer_relay_server = Some(their_blob.relay_server);
        contact.peer_group_key = Some(their_blob.group_key);
        contact.peer_supported_version = Some(their_blob.supported_version);
        contact.ratchet = Some(ratchet);
        contact.pending = None;
        contact.log_event(now, "PANDA key exchange completed");
        info!("contact {contact_id} ready: PANDA key exchange completed");
        self.unseal_pending_messages(contact_id)?;
        Ok(())
    }

    /// Marks a contact revoked locally, enqueues a revocation request, purges
    /// other queued sends to that contact, and grace-periods the current
    /// group key.
    pub fn revoke_contact(&mut self, contact_id: ContactId) -> Result<OutboxId, LifecycleError> {
        let now = self.now();
        let contact = self.state.contacts.get_mut(&contact_id).ok_or(LifecycleError::ContactNotFound)?;
        contact.revoked_us = true;
        let server = contact.peer_relay_server.clone().unwrap_or_default();
        contact.log_event(now, "revoked by us");
        info!("contact {contact_id} revoked: group key rotated");

        self.state
            .outbox
            .retain(|_, entry| !(entry.to == contact_id && entry.status == OutboxStatus::Queued));

        let id = self.state.allocate_outbox_id();
        self.state.outbox.insert(
            id,
            OutboxEntry {
                id,
                to: contact_id,
                server,
                created: now,
                sent: None,
                acked: None,
                ciphertext: Vec::new(),
                payload: OutboxPayload::Request(Vec::new()),
                revocation: true,
                status: OutboxStatus::Queued,
            },
        );

        self.state.previous_group_private_keys.push(PreviousGroupKey {
            pair: self.state.group_key.clone(),
            expired: now + GROUP_GRACE_SECS,
        });
        let new_private = protocol::PrivateKey::generate();
        self.state.group_key = GroupKeyPair {
            public: new_private.public_key(),
            private: new_private,
        };
        self.state.generation += 1;

        Ok(id)
    }

    pub fn mark_revoked_by_peer_contact(&mut self, contact_id: ContactId) {
        let now = self.now();
        if let Some(contact) = self.state.contacts.get_mut(&contact_id) {
            contact.revoked_us = true;
            contact.log_event(now, "peer revoked us");
        }
    }
}
