//! Pluggable source of an "erasure key": an extra 32 bytes mixed into the
//! file's encryption key so that destroying the anchor, independent of the
//! passphrase, makes the file permanently unreadable. The protobuf header
//! this format replaces carried both a `SCrypt` and a `TPM` variant for the
//! same reason; `ErasureAnchor` generalizes that choice into a trait so a
//! real TPM/NVRAM binding can be dropped in without touching the codec.

use crate::errors::StoreError;
use crate::header::{Header, KdfParams};

/// A source of erasure-bound key material keyed off a state file's header.
/// Implementations are expected to be deterministic for a given header and
/// anchor state: the same un-erased anchor must always return the same key.
pub trait ErasureAnchor: Send + Sync {
    fn erasure_key(&self, header: &Header) -> Result<[u8; 32], StoreError>;

    /// Destroys whatever the anchor holds. After this call,
    /// `erasure_key` must either fail or return different bytes.
    fn erase(&self) -> Result<(), StoreError>;
}

/// The default anchor when no hardware-backed store is available: derives
/// the erasure key from the header's own salt, so it's stable across
/// re-opens of an un-erased file but carries no protection beyond the
/// passphrase itself. `erase()` is a no-op — there is nothing to destroy.
///
/// This is the honest fallback, not a simulation of hardware erasure: a
/// `Header { no_erasure_storage: true }` is the correct way to say "this
/// file has no erasure binding" rather than wiring up `SoftwareAnchor` and
/// pretending it provides one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareAnchor;

impl ErasureAnchor for SoftwareAnchor {
    fn erasure_key(&self, header: &Header) -> Result<[u8; 32], StoreError> {
        let mut out = [0u8; 32];
        protocol::primitives::hkdf_expand_labeled(
            Some(&header.kdf_salt),
            b"software-anchor-has-no-secret",
            b"pond-store-software-anchor",
            &mut out,
        )
        .map_err(|_| StoreError::Corrupt)?;
        Ok(out)
    }

    fn erase(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Stands in for a TPM NVRAM index: the kind of anchor `Header::TpmNvram`
/// describes. Nothing in this workspace talks to a real TPM, so this type
/// only exists to give `KdfParams::TpmNvram` a caller that fails loudly
/// instead of silently behaving like `SoftwareAnchor`.
#[derive(Debug)]
pub struct UnavailableTpmAnchor;

impl ErasureAnchor for UnavailableTpmAnchor {
    fn erasure_key(&self, header: &Header) -> Result<[u8; 32], StoreError> {
        match &header.kdf {
            KdfParams::TpmNvram { .. } => Err(StoreError::ErasureAnchorUnavailable),
            KdfParams::Scrypt { .. } => Err(StoreError::ErasureAnchorUnavailable),
        }
    }

    fn erase(&self) -> Result<(), StoreError> {
        Err(StoreError::ErasureAnchorUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_anchor_is_stable_for_same_header() {
        let header = Header::new(vec![1, 2, 3, 4], false);
        let anchor = SoftwareAnchor;
        let a = anchor.erasure_key(&header).unwrap();
        let b = anchor.erasure_key(&header).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn software_anchor_differs_across_salts() {
        let anchor = SoftwareAnchor;
        let a = anchor.erasure_key(&Header::new(vec![1], false)).unwrap();
        let b = anchor.erasure_key(&Header::new(vec![2], false)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn unavailable_tpm_anchor_always_fails() {
        let header = Header::new(vec![9], false);
        let anchor = UnavailableTpmAnchor;
        assert!(anchor.erasure_key(&header).is_err());
        assert!(anchor.erase().is_err());
    }
}
