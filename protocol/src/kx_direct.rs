//! Direct key exchange (4.C): a signed handshake blob exchanged out of band
//! (over the relay, or pasted by hand) that lets two parties who already
//! know each other's identity establish a ratchet session without a
//! rendezvous service. Replaces the teacher's X3DH prekey-bundle flow
//! (`protocol/src/x3dh.rs`, which negotiates ephemeral and one-time keys for
//! parties who have *not* met) with the simpler signed-tuple model this
//! workspace's handshake calls for: identity key, group key, a single DH
//! public key, a supported-version tag and the sender's relay URL, signed
//! as one unit.
//!
//! Role assignment and label derivation both tie-break on the two parties'
//! identity public keys so that, without any further negotiation, both
//! sides converge on the same initiator/responder split and the same four
//! header keys: the lexicographically smaller identity key is always the
//! ratchet initiator.

use crate::errors::KxError;
use crate::keys::{PrivateKey, PublicKey, Signature};
use crate::primitives::hkdf_expand_labeled;
use crate::ratchet::Ratchet;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// The protocol versions this build understands. A peer advertising
/// anything else is rejected rather than silently downgraded.
pub const SUPPORTED_VERSION: u32 = 1;

/// An identity: a long-lived Ed25519 signing keypair (the contact's stable
/// public identifier and the key that authenticates handshake blobs) paired
/// with an X25519 keypair used only for the root-key Diffie-Hellman term.
/// The two are generated together but serve distinct purposes, the same
/// split the teacher's `utils.rs` draws between `verifying_key`/`SigningKey`
/// (authentication) and `ik`/`spk` (key agreement).
#[derive(Clone, Serialize, Deserialize)]
#[serde(into = "IdentityRepr", try_from = "IdentityRepr")]
pub struct Identity {
    signing_key: SigningKey,
    dh_private: PrivateKey,
}

impl Identity {
    pub fn generate() -> Self {
        Identity {
            signing_key: SigningKey::generate(&mut OsRng),
            dh_private: PrivateKey::generate(),
        }
    }

    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn dh_public(&self) -> PublicKey {
        self.dh_private.public_key()
    }
}

/// `Identity`'s persisted form: `SigningKey` has no `serde` impl in this
/// workspace's build of `ed25519-dalek` (the `serde` feature isn't enabled),
/// so the state file stores the raw 32-byte seed instead and reconstructs
/// the signing key on load.
#[derive(Serialize, Deserialize)]
struct IdentityRepr {
    signing_seed: [u8; 32],
    dh_private: PrivateKey,
}

impl From<Identity> for IdentityRepr {
    fn from(id: Identity) -> Self {
        IdentityRepr {
            signing_seed: id.signing_key.to_bytes(),
            dh_private: id.dh_private,
        }
    }
}

impl TryFrom<IdentityRepr> for Identity {
    type Error = std::convert::Infallible;

    fn try_from(repr: IdentityRepr) -> Result<Self, Self::Error> {
        Ok(Identity {
            signing_key: SigningKey::from_bytes(&repr.signing_seed),
            dh_private: repr.dh_private,
        })
    }
}

/// Everything one side needs to build its handshake blob and, once it has
/// the peer's blob, complete the exchange.
pub struct HandshakeMaterial {
    pub identity: Identity,
    pub ratchet_private: PrivateKey,
    pub group_key: PublicKey,
    pub relay_server: String,
}

impl HandshakeMaterial {
    pub fn new(group_key: PublicKey, relay_server: String) -> Self {
        HandshakeMaterial {
            identity: Identity::generate(),
            ratchet_private: PrivateKey::generate(),
            group_key,
            relay_server,
        }
    }

    pub fn build_blob(&self) -> HandshakeBlob {
        self.build_blob_with_version(SUPPORTED_VERSION)
    }

    /// Builds and signs a blob advertising an arbitrary version. Only
    /// exercised by tests that need a blob claiming an unsupported version
    /// while still carrying a valid signature over that claim.
    pub fn build_blob_with_version(&self, version: u32) -> HandshakeBlob {
        let mut unsigned = HandshakeBlob {
            identity_public: self.identity.verifying_key_bytes(),
            identity_dh_public: self.identity.dh_public(),
            ratchet_dh_public: self.ratchet_private.public_key(),
            group_key: self.group_key,
            supported_version: version,
            relay_server: self.relay_server.clone(),
            signature: Signature([0u8; 64]),
        };
        let signature = self.identity.signing_key.sign(&unsigned.signing_bytes());
        unsigned.signature = Signature(signature.to_bytes());
        unsigned
    }
}

/// The signed handshake tuple exchanged between two parties.
#[derive(Clone, Serialize, Deserialize)]
pub struct HandshakeBlob {
    pub identity_public: [u8; 32],
    pub identity_dh_public: PublicKey,
    pub ratchet_dh_public: PublicKey,
    pub group_key: PublicKey,
    pub supported_version: u32,
    pub relay_server: String,
    pub signature: Signature,
}

impl HandshakeBlob {
    fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.identity_public);
        buf.extend_from_slice(self.identity_dh_public.as_bytes());
        buf.extend_from_slice(self.ratchet_dh_public.as_bytes());
        buf.extend_from_slice(self.group_key.as_bytes());
        buf.extend_from_slice(&self.supported_version.to_be_bytes());
        buf.extend_from_slice(self.relay_server.as_bytes());
        buf
    }

    pub fn verify(&self) -> Result<(), KxError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.identity_public).map_err(|_| KxError::Malformed)?;
        let signature = ed25519_dalek::Signature::from_bytes(&self.signature.0);
        verifying_key
            .verify(&self.signing_bytes(), &signature)
            .map_err(KxError::from)
    }
}

struct EpochKeys {
    root: [u8; 32],
    lo_to_hi_header: [u8; 32],
    hi_to_lo_header: [u8; 32],
    lo_to_hi_next_header: [u8; 32],
    hi_to_lo_next_header: [u8; 32],
    lo_to_hi_chain: [u8; 32],
}

fn derive_epoch_keys(transcript: &[u8], lo_id: &[u8], hi_id: &[u8]) -> Result<EpochKeys, KxError> {
    let mut salt = Vec::with_capacity(lo_id.len() + hi_id.len());
    salt.extend_from_slice(lo_id);
    salt.extend_from_slice(hi_id);

    let mut root = [0u8; 32];
    hkdf_expand_labeled(Some(&salt), transcript, b"pond-direct-root", &mut root)
        .map_err(|_| KxError::Malformed)?;
    let mut lo_to_hi_header = [0u8; 32];
    hkdf_expand_labeled(Some(&salt), transcript, b"pond-direct-lo-header", &mut lo_to_hi_header)
        .map_err(|_| KxError::Malformed)?;
    let mut hi_to_lo_header = [0u8; 32];
    hkdf_expand_labeled(Some(&salt), transcript, b"pond-direct-hi-header", &mut hi_to_lo_header)
        .map_err(|_| KxError::Malformed)?;
    let mut lo_to_hi_next_header = [0u8; 32];
    hkdf_expand_labeled(
        Some(&salt),
        transcript,
        b"pond-direct-lo-next-header",
        &mut lo_to_hi_next_header,
    )
    .map_err(|_| KxError::Malformed)?;
    let mut hi_to_lo_next_header = [0u8; 32];
    hkdf_expand_labeled(
        Some(&salt),
        transcript,
        b"pond-direct-hi-next-header",
        &mut hi_to_lo_next_header,
    )
    .map_err(|_| KxError::Malformed)?;
    let mut lo_to_hi_chain = [0u8; 32];
    hkdf_expand_labeled(Some(&salt), transcript, b"pond-direct-lo-chain", &mut lo_to_hi_chain)
        .map_err(|_| KxError::Malformed)?;

    Ok(EpochKeys {
        root,
        lo_to_hi_header,
        hi_to_lo_header,
        lo_to_hi_next_header,
        hi_to_lo_next_header,
        lo_to_hi_chain,
    })
}

/// Verifies `theirs`, checks it against `mine`, and builds the ratchet
/// session both initializers derive identically from the handshake
/// transcript.
pub fn complete_handshake(
    mine: &HandshakeMaterial,
    theirs: &HandshakeBlob,
) -> Result<Ratchet, KxError> {
    theirs.verify()?;

    let my_id = mine.identity.verifying_key_bytes();
    if my_id == theirs.identity_public
        || theirs.identity_dh_public == mine.identity.dh_public()
        || theirs.ratchet_dh_public == mine.ratchet_private.public_key()
    {
        return Err(KxError::SelfExchange);
    }
    if theirs.supported_version != SUPPORTED_VERSION {
        return Err(KxError::UnsupportedVersion);
    }

    let identity_dh = mine
        .identity
        .dh_private
        .diffie_hellman(&theirs.identity_dh_public);
    let ratchet_dh = mine.ratchet_private.diffie_hellman(&theirs.ratchet_dh_public);
    let mut transcript = Vec::with_capacity(64);
    transcript.extend_from_slice(identity_dh.as_bytes());
    transcript.extend_from_slice(ratchet_dh.as_bytes());

    let i_am_lo = my_id.as_slice() < theirs.identity_public.as_slice();
    let (lo_id, hi_id): (&[u8], &[u8]) = if i_am_lo {
        (&my_id, &theirs.identity_public)
    } else {
        (&theirs.identity_public, &my_id)
    };
    let epoch = derive_epoch_keys(&transcript, lo_id, hi_id)?;

    use crate::keys::{AeadKey, SharedSecret};
    let root = SharedSecret(epoch.root);

    if i_am_lo {
        Ok(Ratchet::initialize_as_initiator(
            root,
            AeadKey::from_bytes(epoch.lo_to_hi_header),
            AeadKey::from_bytes(epoch.hi_to_lo_header),
            AeadKey::from_bytes(epoch.lo_to_hi_next_header),
            AeadKey::from_bytes(epoch.hi_to_lo_next_header),
            AeadKey::from_bytes(epoch.lo_to_hi_chain),
            mine.ratchet_private.clone(),
            theirs.ratchet_dh_public,
        ))
    } else {
        Ok(Ratchet::initialize_as_responder(
            root,
            AeadKey::from_bytes(epoch.hi_to_lo_header),
            AeadKey::from_bytes(epoch.lo_to_hi_header),
            AeadKey::from_bytes(epoch.hi_to_lo_next_header),
            AeadKey::from_bytes(epoch.lo_to_hi_next_header),
            AeadKey::from_bytes(epoch.lo_to_hi_chain),
            theirs.ratchet_dh_public,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PrivateKey as PK;

    fn group_key() -> PublicKey {
        PK::generate().public_key()
    }

    #[test]
    fn mutual_handshake_yields_compatible_ratchets() {
        let alice = HandshakeMaterial::new(group_key(), "wss://relay.example/alice".into());
        let bob = HandshakeMaterial::new(group_key(), "wss://relay.example/bob".into());

        let alice_blob = alice.build_blob();
        let bob_blob = bob.build_blob();

        let mut alice_ratchet = complete_handshake(&alice, &bob_blob).unwrap();
        let mut bob_ratchet = complete_handshake(&bob, &alice_blob).unwrap();

        let from_alice = alice_ratchet.encrypt(b"from alice").unwrap();
        assert_eq!(bob_ratchet.decrypt(&from_alice, 0).unwrap(), b"from alice");

        let from_bob = bob_ratchet.encrypt(b"from bob").unwrap();
        assert_eq!(alice_ratchet.decrypt(&from_bob, 0).unwrap(), b"from bob");
    }

    #[test]
    fn tampered_blob_is_rejected() {
        let alice = HandshakeMaterial::new(group_key(), "wss://relay.example/alice".into());
        let bob = HandshakeMaterial::new(group_key(), "wss://relay.example/bob".into());
        let mut bob_blob = bob.build_blob();
        bob_blob.relay_server = "wss://evil.example/bob".into();
        assert!(complete_handshake(&alice, &bob_blob).is_err());
    }

    #[test]
    fn self_handshake_is_rejected() {
        let alice = HandshakeMaterial::new(group_key(), "wss://relay.example/alice".into());
        let alice_blob = alice.build_blob();
        assert!(matches!(
            complete_handshake(&alice, &alice_blob),
            Err(KxError::SelfExchange)
        ));
    }

    #[test]
    fn reflected_dh_public_with_different_identity_is_rejected() {
        let alice = HandshakeMaterial::new(group_key(), "wss://relay.example/alice".into());
        let mut reflected = alice.build_blob();
        // A different identity key, but the same DH public keys as `alice`'s
        // own blob: still a reflection of what `alice` is about to send.
        let impostor_identity = Identity::generate();
        reflected.identity_public = impostor_identity.verifying_key_bytes();
        let signature = impostor_identity.signing_key.sign(&reflected.signing_bytes());
        reflected.signature = Signature(signature.to_bytes());
        assert!(matches!(
            complete_handshake(&alice, &reflected),
            Err(KxError::SelfExchange)
        ));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let alice = HandshakeMaterial::new(group_key(), "wss://relay.example/alice".into());
        let bob = HandshakeMaterial::new(group_key(), "wss://relay.example/bob".into());
        let blob = bob.build_blob_with_version(SUPPORTED_VERSION + 1);
        assert!(matches!(
            complete_handshake(&alice, &blob),
            Err(KxError::UnsupportedVersion)
        ));
    }
}
