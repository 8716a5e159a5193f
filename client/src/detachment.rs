//! Out-of-band detachment encryption (4.F): large attachments are AEAD
//! encrypted under a per-file random key and streamed in fixed-size chunks,
//! so a detachment worker reports progress without holding the whole file
//! in memory twice over. The key and chunk sizes travel with the message as
//! a `Detachment`; the ciphertext itself moves over a separate upload/
//! download channel this workspace does not implement (see the Non-goals on
//! streaming transport to the recipient's server).
//!
//! Chunks are AEAD-sealed the same way ratchet message bodies are: a
//! monotonic counter turned into a nonce (`protocol::nonce_from_counter`),
//! so no chunk key ever reuses a nonce within one file.

use crate::model::Detachment;
use log::{error, info, warn};
use protocol::AeadKey;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Plaintext is split into chunks of this size before encryption, the same
/// way the scheduler's transport timeout bounds one network round trip
/// rather than one whole file transfer.
pub const DETACHMENT_CHUNK_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachmentErrorKind {
    Cancelled,
    Crypto,
}

/// Progress and terminal events a detachment worker reports to the core.
/// Exactly one terminal event (`Complete` or `Error`) is ever sent per id.
#[derive(Debug, Clone)]
pub enum DetachmentEvent {
    Progress { id: u64, done: u64, total: u64 },
    Complete { id: u64, detachment: Detachment },
    Error { id: u64, kind: DetachmentErrorKind },
}

/// A shared cancellation flag for one in-flight detachment job, handed to
/// the caller when the job starts and checked by the worker between chunks.
/// Cloning shares the same underlying flag: the `Core` stores one clone on
/// the owning draft or pending-decryption entry, the worker task holds the
/// other.
#[derive(Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        CancelHandle(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Encrypts `plaintext` under a fresh random key, chunk by chunk, reporting
/// progress on `events` and honoring `cancel` between chunks. Returns the
/// ciphertext chunks (handed to the out-of-scope upload transport) and the
/// `Detachment` metadata the message will carry, or `None` if cancelled —
/// in which case the terminal event has already been sent.
pub async fn encrypt_detachment(
    id: u64,
    filename: String,
    plaintext: &[u8],
    events: &mpsc::Sender<DetachmentEvent>,
    cancel: &CancelHandle,
) -> Option<(Vec<Vec<u8>>, Detachment)> {
    let total = plaintext.len() as u64;
    let mut key_bytes = [0u8; 32];
    protocol::primitives::random_bytes(&mut key_bytes);
    let key = AeadKey::from_bytes(key_bytes);

    let mut ciphertext_chunks = Vec::new();
    let mut chunk_sizes = Vec::new();
    let mut done: u64 = 0;

    for (counter, chunk) in plaintext.chunks(DETACHMENT_CHUNK_SIZE).enumerate() {
        if cancel.is_cancelled() {
            info!("detachment {id} encryption cancelled");
            let _ = events
                .send(DetachmentEvent::Error {
                    id,
                    kind: DetachmentErrorKind::Cancelled,
                })
                .await;
            return None;
        }

        let nonce = protocol::nonce_from_counter(counter as u32);
        let sealed = match key.seal(&nonce, filename.as_bytes(), chunk) {
            Ok(ct) => ct,
            Err(_) => {
                error!("detachment {id} chunk {counter} failed to seal");
                let _ = events
                    .send(DetachmentEvent::Error {
                        id,
                        kind: DetachmentErrorKind::Crypto,
                    })
                    .await;
                return None;
            }
        };
        chunk_sizes.push(sealed.len() as u64);
        ciphertext_chunks.push(sealed);
        done += chunk.len() as u64;
        let _ = events.send(DetachmentEvent::Progress { id, done, total }).await;
    }

    let detachment = Detachment {
        filename,
        size: total,
        url: None,
        key,
        chunks: chunk_sizes,
    };
    info!("detachment {id} encrypted: {total} bytes in {} chunks", ciphertext_chunks.len());
    let _ = events
        .send(DetachmentEvent::Complete {
            id,
            detachment: detachment.clone(),
        })
        .await;
    Some((ciphertext_chunks, detachment))
}

/// Decrypts ciphertext chunks already fetched or read from a local copy
/// (the out-of-scope download/local-file step has already produced them),
/// reporting progress the same way `encrypt_detachment` does.
pub async fn decrypt_detachment(
    id: u64,
    detachment: &Detachment,
    ciphertext_chunks: &[Vec<u8>],
    events: &mpsc::Sender<DetachmentEvent>,
    cancel: &CancelHandle,
) -> Option<Vec<u8>> {
    let total = detachment.size;
    let mut plaintext = Vec::with_capacity(total as usize);
    let mut done: u64 = 0;

    for (counter, chunk) in ciphertext_chunks.iter().enumerate() {
        if cancel.is_cancelled() {
            info!("detachment {id} decryption cancelled");
            let _ = events
                .send(DetachmentEvent::Error {
                    id,
                    kind: DetachmentErrorKind::Cancelled,
                })
                .await;
            return None;
        }

        let nonce = protocol::nonce_from_counter(counter as u32);
        let opened = match detachment.key.open(&nonce, detachment.filename.as_bytes(), chunk) {
            Ok(pt) => pt,
            Err(_) => {
                warn!("detachment {id} chunk {counter} failed to open: tampered or wrong key");
                let _ = events
                    .send(DetachmentEvent::Error {
                        id,
                        kind: DetachmentErrorKind::Crypto,
                    })
                    .await;
                return None;
            }
        };
        done += opened.len() as u64;
        plaintext.extend_from_slice(&opened);
        let _ = events.send(DetachmentEvent::Progress { id, done, total }).await;
    }

    let _ = events
        .send(DetachmentEvent::Complete {
            id,
            detachment: detachment.clone(),
        })
        .await;
    Some(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut rx: mpsc::Receiver<DetachmentEvent>) -> Vec<DetachmentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn encrypt_then_decrypt_round_trips() {
        let plaintext = vec![7u8; DETACHMENT_CHUNK_SIZE * 2 + 17];
        let (tx, rx) = mpsc::channel(32);
        let cancel = CancelHandle::new();
        let (ciphertext_chunks, detachment) =
            encrypt_detachment(1, "photo.bin".into(), &plaintext, &tx, &cancel).await.unwrap();
        assert_eq!(ciphertext_chunks.len(), 3);
        assert_eq!(detachment.size, plaintext.len() as u64);

        let events = drain(rx).await;
        assert!(matches!(events.last(), Some(DetachmentEvent::Complete { .. })));

        let (tx2, rx2) = mpsc::channel(32);
        let decrypted = decrypt_detachment(1, &detachment, &ciphertext_chunks, &tx2, &cancel)
            .await
            .unwrap();
        assert_eq!(decrypted, plaintext);
        let events2 = drain(rx2).await;
        assert!(matches!(events2.last(), Some(DetachmentEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn cancelling_before_first_chunk_reports_cancelled_exactly_once() {
        let plaintext = vec![1u8; DETACHMENT_CHUNK_SIZE + 1];
        let (tx, rx) = mpsc::channel(32);
        let cancel = CancelHandle::new();
        cancel.cancel();

        let result = encrypt_detachment(2, "big.bin".into(), &plaintext, &tx, &cancel).await;
        assert!(result.is_none());

        let events = drain(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            DetachmentEvent::Error {
                id: 2,
                kind: DetachmentErrorKind::Cancelled
            }
        ));
    }

    #[tokio::test]
    async fn tampered_chunk_fails_decryption_with_crypto_error() {
        let plaintext = vec![9u8; 64];
        let (tx, rx) = mpsc::channel(32);
        let cancel = CancelHandle::new();
        let (mut chunks, detachment) = encrypt_detachment(3, "note.txt".into(), &plaintext, &tx, &cancel)
            .await
            .unwrap();
        let _ = drain(rx).await;

        let last = chunks[0].len() - 1;
        chunks[0][last] ^= 0xff;

        let (tx2, rx2) = mpsc::channel(32);
        let result = decrypt_detachment(3, &detachment, &chunks, &tx2, &cancel).await;
        assert!(result.is_none());
        let events2 = drain(rx2).await;
        assert!(matches!(
            events2.last(),
            Some(DetachmentEvent::Error {
                kind: DetachmentErrorKind::Crypto,
                ..
            })
        ));
    }
}
