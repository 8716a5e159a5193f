//! The data model of §3: `Identity`, `Contact`, `Inbox`/`Outbox` entries,
//! `Draft`, and the `State` that owns all of them. Field shapes follow the
//! original implementation's `client.pb.go` message layout (optionality
//! included) rather than inventing a fresh shape, re-expressed as plain
//! `serde`-derived structs instead of generated protobuf bindings, the way
//! every other on-disk structure in this workspace is encoded.

use protocol::primitives::random_bytes;
use protocol::{HandshakeBlob, PandaExchange, PrivateKey, PublicKey, Ratchet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const MAX_SERIALIZED_MESSAGE: usize = 64 * 1024;
pub const MESSAGE_LIFETIME_SECS: i64 = 7 * 24 * 3600;
pub const GROUP_GRACE_SECS: i64 = 7 * 24 * 3600;

pub type ContactId = u64;
pub type InboxId = u64;
pub type OutboxId = u64;
pub type DraftId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupKeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviousGroupKey {
    pub pair: GroupKeyPair,
    pub expired: i64,
}

/// The process-wide long-term identity: `protocol::Identity` already models
/// exactly the shape §3 describes (a signing keypair whose public half is
/// the server-facing identity tag, plus a DH keypair). The anonymous group
/// credential used to authenticate fetches lives alongside it on `State`.
pub type Identity = protocol::Identity;

#[derive(Clone, Serialize, Deserialize)]
pub enum PendingKeyExchange {
    Direct {
        /// Our outbound handshake blob, held until the peer's blob arrives.
        outbound: HandshakeBlob,
        /// The ratchet DH private key `outbound` advertises; needed again
        /// when the peer's blob arrives to actually derive the session.
        ratchet_private: PrivateKey,
    },
    Panda {
        exchange: PandaExchange,
        ratchet_private: PrivateKey,
        error: Option<String>,
    },
}

impl std::fmt::Debug for PendingKeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingKeyExchange::Direct { .. } => write!(f, "PendingKeyExchange::Direct"),
            PendingKeyExchange::Panda { error, .. } => {
                write!(f, "PendingKeyExchange::Panda {{ error: {:?} }}", error)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetiredTag {
    pub tag: [u8; 16],
    pub expired: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactEvent {
    pub time: i64,
    pub message: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub name: String,
    pub revoked_us: bool,

    pub peer_identity_public: Option<[u8; 32]>,
    pub peer_dh_public: Option<PublicKey>,
    pub peer_relay_server: Option<String>,
    pub peer_group_key: Option<PublicKey>,
    pub peer_supported_version: Option<u32>,

    /// Exactly one of `pending` or `ratchet` is populated; `is_pending()`
    /// reflects that invariant rather than storing a redundant flag.
    pub pending: Option<PendingKeyExchange>,
    pub ratchet: Option<Ratchet>,

    pub previous_tags: Vec<RetiredTag>,
    pub events: Vec<ContactEvent>,

    pub introduced_by: Option<ContactId>,
    pub reintroduced_by: Vec<ContactId>,
    pub introduced_to: Vec<ContactId>,
}

impl std::fmt::Debug for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Contact")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("is_pending", &self.is_pending())
            .field("revoked_us", &self.revoked_us)
            .finish()
    }
}

impl Contact {
    pub fn is_pending(&self) -> bool {
        self.ratchet.is_none()
    }

    pub fn log_event(&mut self, now: i64, message: impl Into<String>) {
        self.events.push(ContactEvent {
            time: now,
            message: message.into(),
        });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub time: i64,
    pub body: Vec<u8>,
    pub in_reply_to: Option<u64>,
    pub my_next_dh: Option<PublicKey>,
    pub files: Vec<InlineAttachment>,
    pub detached_files: Vec<Detachment>,
    pub supported_version: u32,
}

impl Message {
    /// A zero-length body is reserved to mean "this ciphertext is only an
    /// acknowledgement" — it carries no user-visible content.
    pub fn is_ack(&self) -> bool {
        self.body.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineAttachment {
    pub filename: String,
    pub contents: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detachment {
    pub filename: String,
    pub size: u64,
    pub url: Option<String>,
    pub key: protocol::AeadKey,
    pub chunks: Vec<u64>,
}

/// A pending out-of-band detachment decryption, keyed by detachment id on
/// the owning inbox entry. Never persisted: a restart simply re-offers the
/// detachment for download.
#[derive(Debug, Clone)]
pub struct PendingDecryption {
    pub filename: String,
    pub total: u64,
    pub done: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxEntry {
    pub id: InboxId,
    pub from: ContactId,
    pub received_time: i64,
    pub acked: bool,
    pub read: bool,
    pub retained: bool,
    pub content: InboxContent,
    #[serde(skip)]
    pub decryptions: HashMap<u64, PendingDecryption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InboxContent {
    Sealed(Vec<u8>),
    Decoded(Message),
}

impl InboxEntry {
    pub fn expires_at(&self) -> i64 {
        self.received_time + MESSAGE_LIFETIME_SECS
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutboxPayload {
    Message(Message),
    Request(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Queued,
    Sending,
    Sent,
    Acked,
    FailedRevokedByPeer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: OutboxId,
    pub to: ContactId,
    pub server: String,
    pub created: i64,
    pub sent: Option<i64>,
    pub acked: Option<i64>,
    /// The ratchet-sealed bytes ready to hand to the transport. Stored
    /// rather than re-derived on each send attempt: the ratchet's `encrypt`
    /// is not idempotent, so recomputing it would advance the chain again.
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    pub payload: OutboxPayload,
    pub revocation: bool,
    pub status: OutboxStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub id: DraftId,
    pub created: i64,
    pub to_normal: Vec<ContactId>,
    pub to_introduce: Vec<ContactId>,
    pub body: Vec<u8>,
    pub in_reply_to: Option<u64>,
    pub attachments: Vec<InlineAttachment>,
    pub detachments: Vec<Detachment>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct State {
    pub identity: Identity,
    pub server: String,
    pub group_key: GroupKeyPair,
    pub previous_group_private_keys: Vec<PreviousGroupKey>,
    pub generation: u64,
    pub last_erasure_storage_time: Option<i64>,

    pub contacts: HashMap<ContactId, Contact>,
    pub inbox: HashMap<InboxId, InboxEntry>,
    pub outbox: HashMap<OutboxId, OutboxEntry>,
    pub drafts: HashMap<DraftId, Draft>,

    pub next_inbox_id: InboxId,
    pub next_outbox_id: OutboxId,
    pub next_draft_id: DraftId,
}

impl State {
    pub fn new(identity: Identity, server: String, group_key: GroupKeyPair) -> Self {
        State {
            identity,
            server,
            group_key,
            previous_group_private_keys: Vec::new(),
            generation: 0,
            last_erasure_storage_time: None,
            contacts: HashMap::new(),
            inbox: HashMap::new(),
            outbox: HashMap::new(),
            drafts: HashMap::new(),
            next_inbox_id: 1,
            next_outbox_id: 1,
            next_draft_id: 1,
        }
    }

    pub fn contact_name_taken(&self, name: &str) -> bool {
        self.contacts.values().any(|c| c.name == name)
    }

    /// A fresh random 64-bit contact id, per the metadata-minimisation
    /// property of §3 (contact ids carry no ordering or count information).
    /// Retries on the astronomically unlikely event of a collision with an
    /// id already in use.
    pub fn allocate_contact_id(&mut self) -> ContactId {
        loop {
            let mut bytes = [0u8; 8];
            random_bytes(&mut bytes);
            let id = ContactId::from_be_bytes(bytes);
            if id != 0 && !self.contacts.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn allocate_inbox_id(&mut self) -> InboxId {
        let id = self.next_inbox_id;
        self.next_inbox_id += 1;
        id
    }

    pub fn allocate_outbox_id(&mut self) -> OutboxId {
        let id = self.next_outbox_id;
        self.next_outbox_id += 1;
        id
    }

    pub fn allocate_draft_id(&mut self) -> DraftId {
        let id = self.next_draft_id;
        self.next_draft_id += 1;
        id
    }
}
