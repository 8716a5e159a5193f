//! PANDA rendezvous key exchange (4.D): lets two parties who share only a
//! short, low-entropy secret (read aloud over the phone, or written on a
//! card) find each other through an untrusted rendezvous service and land
//! on the same ratchet session `kx_direct` produces from a handshake blob.
//!
//! This module is the pure state machine: deriving the meeting point and
//! sealing/opening cards from the shared secret, and tracking retry
//! backoff. It has no network code of its own — actually reaching the
//! rendezvous service is explicitly out of scope (see the workspace's
//! Non-goals); callers drive the machine with whatever `post`/`poll`
//! transport they have (the `client` crate's scheduler, or a test double).
//! Grounded on the teacher's scrypt-free KDF usage in `x3dh.rs`'s `hkdf()`
//! helper, generalised here to scrypt because PANDA's input entropy is far
//! below a DH secret's.

use crate::errors::KxError;
use crate::keys::AeadKey;
use crate::kx_direct::HandshakeBlob;
use crate::primitives::{random_bytes, scrypt_derive_default};
use crate::constants::PANDA_MAX_BACKOFF_SECS;
use serde::{Deserialize, Serialize};

/// A single playing card in a PANDA shared-secret "card stack": two parties
/// meeting in person shuffle one or more decks together and each keep half,
/// using the resulting multiset (order discarded) as part of their shared
/// secret. `0..=51` are the standard deck in rank-major order; `52`/`53` are
/// the two jokers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Card(pub u8);

/// A low-entropy secret shared out of band between two parties who have
/// never otherwise exchanged keys: a memorable phrase, optionally
/// strengthened by a shuffled card stack and/or a pre-agreed meeting time.
/// `min_decks` bounds how many copies of the same card the stack may
/// legitimately contain (one shuffled-together deck per party who
/// contributed one) — anything beyond that many duplicates is almost
/// certainly a transcription error and is dropped during canonicalization
/// rather than treated as significant.
#[derive(Debug, Clone)]
pub struct PandaSecret {
    pub phrase: String,
    pub card_stack: Vec<Card>,
    pub min_decks: usize,
    pub time: Option<i64>,
}

impl PandaSecret {
    pub fn new(phrase: impl Into<String>) -> Self {
        PandaSecret {
            phrase: phrase.into(),
            card_stack: Vec::new(),
            min_decks: 1,
            time: None,
        }
    }

    pub fn with_card_stack(mut self, card_stack: Vec<Card>, min_decks: usize) -> Self {
        self.card_stack = card_stack;
        self.min_decks = min_decks.max(1);
        self
    }

    pub fn with_time(mut self, time: i64) -> Self {
        self.time = Some(time);
        self
    }

    /// Sorts the card stack and drops any card beyond the `min_decks`th
    /// repeat of its value, so that two parties who shuffled the same cards
    /// together converge on one canonical ordering regardless of how they
    /// happened to split and read back their own half.
    fn canonical_card_stack(&self) -> Vec<Card> {
        let mut sorted = self.card_stack.clone();
        sorted.sort();
        let mut counts = std::collections::HashMap::new();
        let mut kept = Vec::with_capacity(sorted.len());
        for card in sorted {
            let count = counts.entry(card.0).or_insert(0usize);
            if *count < self.min_decks {
                kept.push(card);
                *count += 1;
            }
        }
        kept
    }

    /// The canonical byte encoding both sides derive identically from: the
    /// phrase, the deduplicated sorted card stack, and the optional meeting
    /// time, each length-delimited so no concatenation can be reinterpreted
    /// across a field boundary.
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        let phrase_bytes = self.phrase.as_bytes();
        let cards = self.canonical_card_stack();
        let mut buf = Vec::with_capacity(4 + phrase_bytes.len() + 1 + cards.len() + 9);

        buf.extend_from_slice(&(phrase_bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(phrase_bytes);

        buf.push(cards.len() as u8);
        for card in &cards {
            buf.push(card.0);
        }

        match self.time {
            Some(t) => {
                buf.push(1);
                buf.extend_from_slice(&t.to_be_bytes());
            }
            None => buf.push(0),
        }
        buf
    }
}

impl From<&str> for PandaSecret {
    fn from(phrase: &str) -> Self {
        PandaSecret::new(phrase)
    }
}

/// Where a `PandaExchange` is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PandaStatus {
    /// Constructed, card sealed, nothing sent yet.
    Init,
    /// Our card has been posted to the rendezvous service.
    Posted,
    /// Posted and waiting for the peer's card to appear; `next_retry_at`
    /// says when the caller should poll again.
    Waiting,
    /// The peer's card was found and opened.
    Exchanged,
    /// Exchange complete and consumed by the caller.
    Done,
    /// The exchange cannot proceed: auth failure, cancellation, or protocol
    /// misuse. Carries a short, human-readable reason.
    Failed(String),
}

/// One side of a PANDA exchange. Constructed from a shared low-entropy
/// secret and the local `HandshakeBlob` to publish once the peer is found.
/// Persisted on `Contact` between polls, so this serialises the same way
/// the rest of the state file does.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PandaExchange {
    meeting_tag: [u8; 16],
    meeting_key: AeadKey,
    outgoing_card: Vec<u8>,
    status: PandaStatus,
    attempt: u32,
    next_retry_at: i64,
}

impl PandaExchange {
    /// Derives the meeting tag and key from `shared_secret`'s canonical
    /// encoding via scrypt (the state store uses the same KDF for the same
    /// reason: the input is attacker-guessable unless made expensive to
    /// try) and seals `my_blob` under the meeting key, ready to post.
    pub fn new(shared_secret: &PandaSecret, my_blob: &HandshakeBlob) -> Result<Self, KxError> {
        let canonical = shared_secret.to_canonical_bytes();
        let key_material =
            scrypt_derive_default(&canonical, b"pond-panda-meeting-key").map_err(|_| KxError::Malformed)?;
        let tag_material =
            scrypt_derive_default(&canonical, b"pond-panda-meeting-tag").map_err(|_| KxError::Malformed)?;
        let mut meeting_tag = [0u8; 16];
        meeting_tag.copy_from_slice(&tag_material[..16]);

        let meeting_key = AeadKey::from_bytes(key_material);
        let plaintext = bincode::serialize(my_blob).map_err(|_| KxError::Malformed)?;
        // The meeting key seals exactly one card per exchange instance, so a
        // fixed nonce introduces no reuse.
        let outgoing_card = meeting_key
            .seal(&[0u8; 12], &meeting_tag, &plaintext)
            .map_err(|_| KxError::Malformed)?;

        Ok(PandaExchange {
            meeting_tag,
            meeting_key,
            outgoing_card,
            status: PandaStatus::Init,
            attempt: 0,
            next_retry_at: 0,
        })
    }

    pub fn meeting_tag(&self) -> &[u8; 16] {
        &self.meeting_tag
    }

    pub fn outgoing_card(&self) -> &[u8] {
        &self.outgoing_card
    }

    pub fn status(&self) -> &PandaStatus {
        &self.status
    }

    pub fn next_retry_at(&self) -> i64 {
        self.next_retry_at
    }

    /// Records that `outgoing_card` has been handed to the rendezvous
    /// transport.
    pub fn mark_posted(&mut self, now: i64) {
        self.status = PandaStatus::Posted;
        self.next_retry_at = now;
    }

    /// Feeds the result of one poll of the rendezvous service. `card` is
    /// `Some` if the service returned a card under our meeting tag.
    ///
    /// On `None`, advances the exponential backoff (capped at
    /// `PANDA_MAX_BACKOFF_SECS`, jittered) and moves to `Waiting`. On
    /// `Some`, attempts to open it with the meeting key; success moves to
    /// `Exchanged` and returns the peer's blob, failure moves to `Failed`
    /// and returns an error — a wrong card cannot be retried, since it
    /// proves the two sides do not share the secret they think they do.
    pub fn poll_result(&mut self, card: Option<&[u8]>, now: i64) -> Result<Option<HandshakeBlob>, KxError> {
        if matches!(self.status, PandaStatus::Done | PandaStatus::Exchanged) {
            return Err(KxError::PandaProtocol);
        }
        let Some(card) = card else {
            self.status = PandaStatus::Waiting;
            self.next_retry_at = now + self.backoff_secs() as i64;
            self.attempt += 1;
            return Ok(None);
        };

        let plaintext = match self.meeting_key.open(&[0u8; 12], &self.meeting_tag, card) {
            Ok(pt) => pt,
            Err(_) => {
                self.status = PandaStatus::Failed("meeting key did not open peer card".into());
                return Err(KxError::PandaAuthFailed);
            }
        };
        let blob: HandshakeBlob = match bincode::deserialize(&plaintext) {
            Ok(blob) => blob,
            Err(_) => {
                self.status = PandaStatus::Failed("peer card was not a valid handshake blob".into());
                return Err(KxError::Malformed);
            }
        };
        if blob.verify().is_err() {
            self.status = PandaStatus::Failed("peer card failed signature check".into());
            return Err(KxError::BadSignature);
        }

        self.status = PandaStatus::Exchanged;
        Ok(Some(blob))
    }

    /// Marks the exchange consumed once the caller has completed the
    /// handshake from the returned blob.
    pub fn mark_done(&mut self) {
        self.status = PandaStatus::Done;
    }

    /// Cancels an in-progress exchange; polling must stop.
    pub fn cancel(&mut self) {
        self.status = PandaStatus::Failed("cancelled".into());
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self.status, PandaStatus::Posted | PandaStatus::Waiting)
    }

    fn backoff_secs(&self) -> u64 {
        let base: u64 = 1;
        let exp = base.saturating_mul(1u64 << self.attempt.min(20));
        let capped = exp.min(PANDA_MAX_BACKOFF_SECS);
        let mut jitter_byte = [0u8; 1];
        random_bytes(&mut jitter_byte);
        let jitter = (jitter_byte[0] as u64) % (capped.max(1));
        capped.saturating_add(jitter).min(PANDA_MAX_BACKOFF_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kx_direct::HandshakeMaterial;
    use crate::keys::PrivateKey;

    fn blob_for(label: &str) -> HandshakeBlob {
        let material = HandshakeMaterial::new(PrivateKey::generate().public_key(), format!("wss://relay/{label}"));
        material.build_blob()
    }

    #[test]
    fn matching_secrets_exchange_successfully() {
        let secret = PandaSecret::new("correct horse battery staple")
            .with_card_stack(vec![Card(10), Card(3), Card(3)], 2)
            .with_time(1_704_110_400);
        let alice_blob = blob_for("alice");
        let bob_blob = blob_for("bob");

        let mut alice = PandaExchange::new(&secret, &alice_blob).unwrap();
        let mut bob = PandaExchange::new(&secret, &bob_blob).unwrap();
        assert_eq!(alice.meeting_tag(), bob.meeting_tag());

        alice.mark_posted(0);
        bob.mark_posted(0);

        let opened = alice.poll_result(Some(bob.outgoing_card()), 1).unwrap();
        assert!(opened.is_some());
        assert_eq!(opened.unwrap().identity_public, bob_blob.identity_public);
    }

    /// The same card multiset, read back in a different order and split
    /// differently between the two parties, still canonicalizes to the
    /// same meeting point.
    #[test]
    fn card_stack_order_does_not_affect_meeting_point() {
        let alice_blob = blob_for("alice");
        let bob_blob = blob_for("bob");
        let alice_secret =
            PandaSecret::new("north-by-northwest").with_card_stack(vec![Card(1), Card(40)], 1);
        let bob_secret =
            PandaSecret::new("north-by-northwest").with_card_stack(vec![Card(40), Card(1)], 1);

        let alice = PandaExchange::new(&alice_secret, &alice_blob).unwrap();
        let bob = PandaExchange::new(&bob_secret, &bob_blob).unwrap();
        assert_eq!(alice.meeting_tag(), bob.meeting_tag());
    }

    /// Duplicate cards beyond `min_decks` are dropped during
    /// canonicalization rather than treated as part of the secret.
    #[test]
    fn excess_duplicate_cards_are_ignored() {
        let alice_blob = blob_for("alice");
        let bob_blob = blob_for("bob");
        let alice_secret =
            PandaSecret::new("shared phrase").with_card_stack(vec![Card(5), Card(5), Card(5)], 1);
        let bob_secret = PandaSecret::new("shared phrase").with_card_stack(vec![Card(5)], 1);

        let alice = PandaExchange::new(&alice_secret, &alice_blob).unwrap();
        let bob = PandaExchange::new(&bob_secret, &bob_blob).unwrap();
        assert_eq!(alice.meeting_tag(), bob.meeting_tag());
    }

    #[test]
    fn mismatched_secrets_never_meet() {
        let alice_blob = blob_for("alice");
        let bob_blob = blob_for("bob");
        let alice = PandaExchange::new(&PandaSecret::new("secret one"), &alice_blob).unwrap();
        let bob = PandaExchange::new(&PandaSecret::new("secret two"), &bob_blob).unwrap();
        assert_ne!(alice.meeting_tag(), bob.meeting_tag());
    }

    #[test]
    fn empty_poll_backs_off_and_stays_waiting() {
        let blob = blob_for("alice");
        let mut exchange = PandaExchange::new(&PandaSecret::new("shared secret"), &blob).unwrap();
        exchange.mark_posted(0);
        let result = exchange.poll_result(None, 0).unwrap();
        assert!(result.is_none());
        assert_eq!(*exchange.status(), PandaStatus::Waiting);
        assert!(exchange.next_retry_at() >= 0);
    }

    #[test]
    fn cancel_stops_further_polling() {
        let blob = blob_for("alice");
        let mut exchange = PandaExchange::new(&PandaSecret::new("shared secret"), &blob).unwrap();
        exchange.mark_posted(0);
        assert!(exchange.is_cancellable());
        exchange.cancel();
        assert!(!exchange.is_cancellable());
    }
}
