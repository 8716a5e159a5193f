//! The double-ratchet engine (4.B): per-contact forward-secret message
//! encryption with encrypted headers. Generalises the teacher's
//! `protocol/src/ratchet.rs` (which ratchets on plaintext headers keyed by
//! `(PublicKey, counter)`) to the richer header-key-chain model: headers are
//! themselves AEAD-sealed under a rotating header key, and the skipped-key
//! cache is keyed by `(header_key, counter)` so a late message can still be
//! recognised after its epoch's header key has been superseded.
//!
//! A ratchet holds at most two live DH private keys at a time (`private0`,
//! the one in current use, and `private1`, the one it is about to retire):
//! this is the "two queued private keys" shape recovered from the original
//! `RatchetState.Private0`/`Private1` fields.

use crate::constants::{MAX_SKIP, MESSAGE_KEY_LIFETIME_SECS};
use crate::errors::RatchetError;
use crate::keys::{nonce_from_counter, AeadKey, PrivateKey, PublicKey, SharedSecret};
use crate::primitives::{kdf_chain_step, kdf_root_step};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

const HEADER_PLAINTEXT_LEN: usize = 4 + 4 + 32;
const HEADER_CIPHERTEXT_LEN: usize = HEADER_PLAINTEXT_LEN + 16;

/// How far past the receiver's own position `open_header` searches. Twice
/// `MAX_SKIP` so a header whose gap exceeds the limit is still found (and
/// rejected with `SkipGapExceeded`) rather than merely failing to open.
const HEADER_SEARCH_WIDTH: u32 = MAX_SKIP * 2;

/// The plaintext ratchet header: its only job is to let the receiver locate
/// the right chain and message key. Authenticity of the header comes from
/// sealing it under the epoch's header key, not from the message AEAD.
#[derive(Clone, Copy, Debug)]
struct Header {
    send_count: u32,
    prev_send_count: u32,
    dh_pub: PublicKey,
}

impl Header {
    fn to_bytes(self) -> [u8; HEADER_PLAINTEXT_LEN] {
        let mut out = [0u8; HEADER_PLAINTEXT_LEN];
        out[0..4].copy_from_slice(&self.send_count.to_be_bytes());
        out[4..8].copy_from_slice(&self.prev_send_count.to_be_bytes());
        out[8..40].copy_from_slice(&self.dh_pub.0);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, RatchetError> {
        if bytes.len() != HEADER_PLAINTEXT_LEN {
            return Err(RatchetError::HeaderAuthFailed);
        }
        let send_count = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let prev_send_count = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        let mut pk = [0u8; 32];
        pk.copy_from_slice(&bytes[8..40]);
        Ok(Header {
            send_count,
            prev_send_count,
            dh_pub: PublicKey(pk),
        })
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedMessageKey {
    counter: u32,
    message_key: AeadKey,
    created_at: i64,
}

/// One bucket of skipped message keys, all derived under the same header
/// key. A message arriving late is recognised by trying to open its header
/// under each bucket's `header_key` in turn.
#[derive(Clone, Serialize, Deserialize)]
struct SkippedBucket {
    header_key: AeadKey,
    entries: Vec<SkippedMessageKey>,
}

/// Full ratchet state for one contact's session, as persisted in
/// `RatchetState` (see `store`). The type is the sole owner of the ratchet
/// invariants and exposes only `encrypt`/`decrypt` plus the two
/// initializers.
#[derive(Clone, Serialize, Deserialize)]
pub struct Ratchet {
    root_key: SharedSecret,

    send_header_key: AeadKey,
    recv_header_key: Option<AeadKey>,
    next_send_header_key: AeadKey,
    next_recv_header_key: AeadKey,

    send_chain_key: Option<AeadKey>,
    recv_chain_key: Option<AeadKey>,

    send_ratchet_private: PrivateKey,
    recv_ratchet_public: Option<PublicKey>,

    send_count: u32,
    recv_count: u32,
    prev_send_count: u32,

    /// True when the next call to `encrypt` must perform a DH ratchet step
    /// before deriving a message key: set for the responder at
    /// construction, and for either side right after it learns a new
    /// `recv_ratchet_public` from the peer.
    ratchet_pending: bool,

    /// Codec version flag, carried over from the original `RatchetState.V2`
    /// field: distinguishes sessions using this header-key KDF from any
    /// future chain change.
    v2: bool,

    /// The DH private key currently in use.
    private0: Option<PrivateKey>,
    /// The DH private key an in-flight ratchet step is retiring, kept so a
    /// very late message from the previous epoch can still be answered.
    private1: Option<PrivateKey>,

    skipped: Vec<SkippedBucket>,
}

fn aad_for(send_count: u32) -> Vec<u8> {
    send_count.to_be_bytes().to_vec()
}

impl Ratchet {
    /// Initializes a ratchet as the initiator: the side whose first message
    /// needs no DH step because the header keys for its first epoch were
    /// already fixed by the key-exchange transcript.
    pub fn initialize_as_initiator(
        root_key: SharedSecret,
        send_header_key: AeadKey,
        recv_header_key: AeadKey,
        next_send_header_key: AeadKey,
        next_recv_header_key: AeadKey,
        send_chain_key: AeadKey,
        send_ratchet_private: PrivateKey,
        peer_initial_ratchet_public: PublicKey,
    ) -> Self {
        Ratchet {
            root_key,
            send_header_key,
            recv_header_key: Some(recv_header_key),
            next_send_header_key,
            next_recv_header_key,
            send_chain_key: Some(send_chain_key),
            recv_chain_key: None,
            private0: Some(send_ratchet_private.clone()),
            private1: None,
            send_ratchet_private,
            recv_ratchet_public: Some(peer_initial_ratchet_public),
            send_count: 0,
            recv_count: 0,
            prev_send_count: 0,
            ratchet_pending: false,
            v2: true,
            skipped: Vec::new(),
        }
    }

    /// Initializes a ratchet as the responder: the side that must perform a
    /// DH step using a fresh key pair before its first send, since it did
    /// not contribute the DH key the initiator's first epoch is keyed to.
    pub fn initialize_as_responder(
        root_key: SharedSecret,
        send_header_key: AeadKey,
        recv_header_key: AeadKey,
        next_send_header_key: AeadKey,
        next_recv_header_key: AeadKey,
        recv_chain_key: AeadKey,
        peer_initial_ratchet_public: PublicKey,
    ) -> Self {
        let _ = &send_header_key; // superseded by next_send_header_key before first use
        Ratchet {
            root_key,
            send_header_key: next_send_header_key.clone(),
            recv_header_key: Some(recv_header_key),
            next_send_header_key,
            next_recv_header_key,
            send_chain_key: None,
            recv_chain_key: Some(recv_chain_key),
            private0: None,
            private1: None,
            send_ratchet_private: PrivateKey::generate(),
            recv_ratchet_public: Some(peer_initial_ratchet_public),
            send_count: 0,
            recv_count: 0,
            prev_send_count: 0,
            ratchet_pending: true,
            v2: true,
            skipped: Vec::new(),
        }
    }

    /// Encrypts `plaintext`, performing a DH ratchet step first if one is
    /// pending. Returns the wire message: sealed header followed by sealed
    /// body.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, RatchetError> {
        if self.ratchet_pending {
            debug!("ratchet: performing pending DH send step before encrypt");
            self.dh_ratchet_send()?;
        }
        debug!("ratchet: encrypting message {}", self.send_count);

        let chain = self.send_chain_key.take().ok_or(RatchetError::HeaderAuthFailed)?;
        let (next_chain, message_key) = kdf_chain_step(&chain)?;
        self.send_chain_key = Some(next_chain);

        let header = Header {
            send_count: self.send_count,
            prev_send_count: self.prev_send_count,
            dh_pub: self.send_ratchet_private.public_key(),
        };
        let header_nonce = nonce_from_counter(self.send_count);
        let header_ct = self
            .send_header_key
            .seal(&header_nonce, b"", &header.to_bytes())?;

        let body_nonce = nonce_from_counter(self.send_count);
        let aad = aad_for(self.send_count);
        let body_ct = message_key.seal(&body_nonce, &aad, plaintext)?;

        self.send_count += 1;

        let mut out = Vec::with_capacity(header_ct.len() + body_ct.len());
        out.extend_from_slice(&header_ct);
        out.extend_from_slice(&body_ct);
        Ok(out)
    }

    /// Decrypts a wire message produced by the peer's `encrypt`. Tries, in
    /// order: the current receive header key, the next (post-ratchet)
    /// receive header key, then every cached skipped-key bucket. `now` (unix
    /// seconds) stamps any message key this call caches for later
    /// out-of-order recovery.
    pub fn decrypt(&mut self, message: &[u8], now: i64) -> Result<Vec<u8>, RatchetError> {
        if message.len() < HEADER_CIPHERTEXT_LEN {
            return Err(RatchetError::HeaderAuthFailed);
        }
        let (header_ct, body_ct) = message.split_at(HEADER_CIPHERTEXT_LEN);

        if let Some(recv_header_key) = self.recv_header_key.clone() {
            // Reaches `MAX_SKIP` behind `recv_count` to recognise duplicates
            // of already-consumed or already-cached messages, and
            // `HEADER_SEARCH_WIDTH` ahead so a header whose gap exceeds
            // `MAX_SKIP` is still found (and rejected with
            // `SkipGapExceeded`) instead of merely failing to open.
            let start = self.recv_count.saturating_sub(MAX_SKIP);
            let end = self.recv_count.saturating_add(HEADER_SEARCH_WIDTH);
            if let Some(header_pt) = self.open_header(&recv_header_key, header_ct, start, end) {
                let header = Header::from_bytes(&header_pt)?;
                if header.send_count < self.recv_count {
                    return self.decrypt_from_cache(&recv_header_key, header, body_ct);
                }
                let gap = header.send_count - self.recv_count;
                if gap > MAX_SKIP {
                    warn!("ratchet: gap {gap} exceeds MAX_SKIP, rejecting without state change");
                    return Err(RatchetError::SkipGapExceeded);
                }
                return self.decrypt_within_epoch(header, body_ct, now);
            }
        }

        let next_recv_header_key = self.next_recv_header_key.clone();
        if let Some(header_pt) = self.open_header(&next_recv_header_key, header_ct, 0, HEADER_SEARCH_WIDTH) {
            let header = Header::from_bytes(&header_pt)?;
            if header.send_count > MAX_SKIP {
                warn!("ratchet: post-ratchet gap {} exceeds MAX_SKIP, rejecting without state change", header.send_count);
                return Err(RatchetError::SkipGapExceeded);
            }
            return self.decrypt_after_dh_ratchet(header, body_ct, next_recv_header_key, now);
        }

        if let Some(plaintext) = self.decrypt_from_any_cached_epoch(header_ct, body_ct)? {
            debug!("ratchet: decrypted message from a cached epoch");
            return Ok(plaintext);
        }
        warn!("ratchet: message rejected, no header key opened it");
        Err(RatchetError::HeaderAuthFailed)
    }

    /// Brute-forces the header key's nonce space over `start..=end`: the
    /// receiver does not yet know the sender's counter for this message, so
    /// it tries every counter a header could plausibly carry, relative to
    /// the receiver's own position rather than always starting at zero.
    fn open_header(&self, key: &AeadKey, header_ct: &[u8], start: u32, end: u32) -> Option<Vec<u8>> {
        for counter in start..=end {
            let nonce = nonce_from_counter(counter);
            if let Ok(pt) = key.open(&nonce, b"", header_ct) {
                return Some(pt);
            }
        }
        None
    }

    fn decrypt_within_epoch(&mut self, header: Header, body_ct: &[u8], now: i64) -> Result<Vec<u8>, RatchetError> {
        let mut chain = self.recv_chain_key.take().ok_or(RatchetError::HeaderAuthFailed)?;
        let header_key = self.recv_header_key.clone().ok_or(RatchetError::HeaderAuthFailed)?;
        let mut bucket = SkippedBucket {
            header_key,
            entries: Vec::new(),
        };
        let mut message_key = None;
        for counter in self.recv_count..=header.send_count {
            let (next_chain, mk) = kdf_chain_step(&chain)?;
            chain = next_chain;
            if counter == header.send_count {
                message_key = Some(mk);
            } else {
                bucket.entries.push(SkippedMessageKey {
                    counter,
                    message_key: mk,
                    created_at: now,
                });
            }
        }
        self.recv_chain_key = Some(chain);
        if !bucket.entries.is_empty() {
            self.skipped.push(bucket);
        }

        let message_key = message_key.ok_or(RatchetError::HeaderAuthFailed)?;
        let body_nonce = nonce_from_counter(header.send_count);
        let aad = aad_for(header.send_count);
        let plaintext = message_key
            .open(&body_nonce, &aad, body_ct)
            .map_err(|_| RatchetError::AuthFailed)?;
        self.recv_count = header.send_count + 1;
        Ok(plaintext)
    }

    fn decrypt_after_dh_ratchet(
        &mut self,
        header: Header,
        body_ct: &[u8],
        opened_with: AeadKey,
        now: i64,
    ) -> Result<Vec<u8>, RatchetError> {
        debug!("ratchet: peer's DH ratchet step detected, advancing to new epoch");
        // Any messages from the outgoing epoch that never arrived are still
        // recoverable: cache keys for the unconsumed tail, up to the
        // sender's own declared `prev_send_count`.
        if let (Some(mut chain), Some(old_header_key)) =
            (self.recv_chain_key.take(), self.recv_header_key.clone())
        {
            let mut bucket = SkippedBucket {
                header_key: old_header_key,
                entries: Vec::new(),
            };
            while self.recv_count < header.prev_send_count {
                let (next_chain, mk) = kdf_chain_step(&chain)?;
                chain = next_chain;
                bucket.entries.push(SkippedMessageKey {
                    counter: self.recv_count,
                    message_key: mk,
                    created_at: now,
                });
                self.recv_count += 1;
            }
            if !bucket.entries.is_empty() {
                self.skipped.push(bucket);
            }
        }

        let dh_output = self.send_ratchet_private.diffie_hellman(&header.dh_pub);
        let (new_root, new_recv_chain, new_next_recv_header_key) = kdf_root_step(&self.root_key, &dh_output)?;

        self.root_key = new_root;
        self.recv_header_key = Some(opened_with);
        self.next_recv_header_key = new_next_recv_header_key;
        self.recv_chain_key = Some(new_recv_chain);
        self.recv_ratchet_public = Some(header.dh_pub);
        self.recv_count = 0;
        self.ratchet_pending = true;

        self.decrypt_within_epoch(header, body_ct, now)
    }

    fn dh_ratchet_send(&mut self) -> Result<(), RatchetError> {
        let recv_pub = self.recv_ratchet_public.ok_or(RatchetError::HeaderAuthFailed)?;
        let new_private = PrivateKey::generate();
        let dh_output = new_private.diffie_hellman(&recv_pub);
        let (new_root, new_send_chain, new_next_send_header_key) = kdf_root_step(&self.root_key, &dh_output)?;

        self.private1 = self.private0.take();
        self.private0 = Some(new_private.clone());
        self.send_ratchet_private = new_private;

        self.root_key = new_root;
        self.prev_send_count = self.send_count;
        self.send_count = 0;
        self.send_chain_key = Some(new_send_chain);
        self.send_header_key = self.next_send_header_key.clone();
        self.next_send_header_key = new_next_send_header_key;
        self.ratchet_pending = false;
        Ok(())
    }

    /// Looks up a message key previously cached under `header_key` for
    /// `counter`, the path taken when a header opens under a header key we
    /// already hold but its counter is behind our current position.
    fn decrypt_from_cache(
        &mut self,
        header_key: &AeadKey,
        header: Header,
        body_ct: &[u8],
    ) -> Result<Vec<u8>, RatchetError> {
        let message_key = self
            .take_cached(header_key, header.send_count)
            .ok_or(RatchetError::DuplicateMessage)?;
        let body_nonce = nonce_from_counter(header.send_count);
        let aad = aad_for(header.send_count);
        message_key
            .open(&body_nonce, &aad, body_ct)
            .map_err(|_| RatchetError::AuthFailed)
    }

    /// Fallback for messages whose epoch has already been superseded twice
    /// (neither the current nor the next header key opens it): scans every
    /// cached bucket's header key directly.
    fn decrypt_from_any_cached_epoch(
        &mut self,
        header_ct: &[u8],
        body_ct: &[u8],
    ) -> Result<Option<Vec<u8>>, RatchetError> {
        for idx in 0..self.skipped.len() {
            let header_key = self.skipped[idx].header_key.clone();
            let (start, end) = self.skipped[idx]
                .entries
                .iter()
                .map(|e| e.counter)
                .fold((u32::MAX, 0u32), |(lo, hi), c| (lo.min(c), hi.max(c)));
            if start > end {
                continue;
            }
            let header_pt = match self.open_header(&header_key, header_ct, start, end) {
                Some(pt) => pt,
                None => continue,
            };
            let header = Header::from_bytes(&header_pt)?;
            let message_key = self
                .take_cached(&header_key, header.send_count)
                .ok_or(RatchetError::DuplicateMessage)?;
            let body_nonce = nonce_from_counter(header.send_count);
            let aad = aad_for(header.send_count);
            let plaintext = message_key
                .open(&body_nonce, &aad, body_ct)
                .map_err(|_| RatchetError::AuthFailed)?;
            return Ok(Some(plaintext));
        }
        Ok(None)
    }

    fn take_cached(&mut self, header_key: &AeadKey, counter: u32) -> Option<AeadKey> {
        let mut found = None;
        for bucket in &mut self.skipped {
            if !bucket.header_key.constant_time_eq(header_key) {
                continue;
            }
            if let Some(pos) = bucket.entries.iter().position(|e| e.counter == counter) {
                found = Some(bucket.entries.remove(pos).message_key);
            }
            break;
        }
        self.skipped.retain(|b| !b.entries.is_empty());
        found
    }

    /// Drops skipped message keys older than `MESSAGE_KEY_LIFETIME_SECS`
    /// relative to `now` (unix seconds). Called periodically by the message
    /// lifecycle manager, not on every decrypt.
    pub fn prune_expired_keys(&mut self, now: i64) {
        for bucket in &mut self.skipped {
            bucket
                .entries
                .retain(|e| now - e.created_at < MESSAGE_KEY_LIFETIME_SECS);
        }
        self.skipped.retain(|b| !b.entries.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::hkdf_expand_labeled;

    fn session_pair() -> (Ratchet, Ratchet) {
        let root = SharedSecret([9u8; 32]);
        let mut shk = [0u8; 32];
        hkdf_expand_labeled(None, &root.0, b"a->b header", &mut shk).unwrap();
        let mut rhk = [0u8; 32];
        hkdf_expand_labeled(None, &root.0, b"b->a header", &mut rhk).unwrap();
        let mut nshk = [0u8; 32];
        hkdf_expand_labeled(None, &root.0, b"a->b next header", &mut nshk).unwrap();
        let mut nrhk = [0u8; 32];
        hkdf_expand_labeled(None, &root.0, b"b->a next header", &mut nrhk).unwrap();
        let mut sck = [0u8; 32];
        hkdf_expand_labeled(None, &root.0, b"a->b chain", &mut sck).unwrap();

        let alice_ratchet_private = PrivateKey::generate();
        let alice_ratchet_public = alice_ratchet_private.public_key();

        let alice = Ratchet::initialize_as_initiator(
            root.clone(),
            AeadKey::from_bytes(shk),
            AeadKey::from_bytes(rhk),
            AeadKey::from_bytes(nshk),
            AeadKey::from_bytes(nrhk),
            AeadKey::from_bytes(sck),
            alice_ratchet_private,
            alice_ratchet_public,
        );

        let bob = Ratchet::initialize_as_responder(
            root,
            AeadKey::from_bytes(rhk),
            AeadKey::from_bytes(shk),
            AeadKey::from_bytes(nrhk),
            AeadKey::from_bytes(nshk),
            AeadKey::from_bytes(sck),
            alice_ratchet_public,
        );

        (alice, bob)
    }

    const T0: i64 = 1_700_000_000;

    #[test]
    fn bob_first_send_ratchets_then_alice_decrypts() {
        let (mut alice, mut bob) = session_pair();
        let ct = bob.encrypt(b"hello alice").unwrap();
        let pt = alice.decrypt(&ct, T0).unwrap();
        assert_eq!(pt, b"hello alice");
    }

    #[test]
    fn alice_first_send_needs_no_ratchet() {
        let (mut alice, mut bob) = session_pair();
        let ct = alice.encrypt(b"hi bob").unwrap();
        let pt = bob.decrypt(&ct, T0).unwrap();
        assert_eq!(pt, b"hi bob");
    }

    #[test]
    fn out_of_order_delivery_is_recovered_via_skip_cache() {
        let (mut alice, mut bob) = session_pair();
        let first = bob.encrypt(b"one").unwrap();
        alice.decrypt(&first, T0).unwrap();

        let second = bob.encrypt(b"two").unwrap();
        let third = bob.encrypt(b"three").unwrap();

        let pt3 = alice.decrypt(&third, T0).unwrap();
        assert_eq!(pt3, b"three");
        let pt2 = alice.decrypt(&second, T0).unwrap();
        assert_eq!(pt2, b"two");
    }

    #[test]
    fn duplicate_delivery_is_rejected() {
        let (mut alice, mut bob) = session_pair();
        let ct = bob.encrypt(b"once").unwrap();
        alice.decrypt(&ct, T0).unwrap();
        assert!(alice.decrypt(&ct, T0).is_err());
    }

    #[test]
    fn conversation_round_trips_after_mutual_ratchets() {
        let (mut alice, mut bob) = session_pair();
        let m1 = bob.encrypt(b"bob epoch 0").unwrap();
        assert_eq!(alice.decrypt(&m1, T0).unwrap(), b"bob epoch 0");

        let m2 = alice.encrypt(b"alice epoch 0").unwrap();
        assert_eq!(bob.decrypt(&m2, T0).unwrap(), b"alice epoch 0");

        let m3 = bob.encrypt(b"bob epoch 1").unwrap();
        assert_eq!(alice.decrypt(&m3, T0).unwrap(), b"bob epoch 1");

        let m4 = alice.encrypt(b"alice epoch 1").unwrap();
        assert_eq!(bob.decrypt(&m4, T0).unwrap(), b"alice epoch 1");
    }

    #[test]
    fn gap_beyond_max_skip_is_rejected_without_mutating_state() {
        let (mut alice, mut bob) = session_pair();
        let mut last = None;
        for i in 0..=MAX_SKIP + 1 {
            last = Some(bob.encrypt(format!("msg {i}").as_bytes()).unwrap());
        }
        let recv_count_before = alice.recv_count;
        let result = alice.decrypt(&last.unwrap(), T0);
        assert!(matches!(result, Err(RatchetError::SkipGapExceeded)));
        assert_eq!(alice.recv_count, recv_count_before);
        assert!(alice.skipped.is_empty());
    }

    #[test]
    fn skipped_keys_are_stamped_with_real_time_and_pruned_after_lifetime() {
        let (mut alice, mut bob) = session_pair();
        let _first = bob.encrypt(b"one").unwrap();
        let second = bob.encrypt(b"two").unwrap();
        let third = bob.encrypt(b"three").unwrap();

        // Skip "two": its key is cached with `created_at == T0`.
        alice.decrypt(&third, T0).unwrap();
        assert_eq!(alice.skipped[0].entries[0].created_at, T0);

        alice.prune_expired_keys(T0 + MESSAGE_KEY_LIFETIME_SECS - 1);
        assert!(!alice.skipped.is_empty(), "key must survive before its lifetime elapses");

        alice.prune_expired_keys(T0 + MESSAGE_KEY_LIFETIME_SECS + 1);
        assert!(alice.skipped.is_empty(), "key must be evicted once its lifetime elapses");
        assert!(alice.decrypt(&second, T0).is_err());
    }
}
