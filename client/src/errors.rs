//! Leaf error types specific to the message lifecycle manager and the
//! transport scheduler, converted into `common::CoreError` at the boundary
//! the way `protocol`'s `RatchetError`/`KxError` already are. Hand-rolled
//! `Display` + `std::error::Error`, matching the teacher's `ClientError`.

use common::{CoreError, Reason};
use std::fmt::{Display, Formatter};
use store::StoreError;

#[derive(Debug)]
pub enum LifecycleError {
    ContactNameConflict,
    ContactNotFound,
    ContactNotPending,
    OversizeMessage { size: usize, max: usize },
    NotPending,
    Kx(protocol::KxError),
    Ratchet(protocol::RatchetError),
    Store(StoreError),
}

impl Display for LifecycleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleError::ContactNameConflict => write!(f, "a contact with that name already exists"),
            LifecycleError::ContactNotFound => write!(f, "no such contact"),
            LifecycleError::ContactNotPending => write!(f, "contact is not pending a key exchange"),
            LifecycleError::OversizeMessage { size, max } => {
                write!(f, "message of {} bytes exceeds the {} byte limit", size, max)
            }
            LifecycleError::NotPending => write!(f, "entry is not in a pending state"),
            LifecycleError::Kx(e) => write!(f, "key exchange error: {}", e),
            LifecycleError::Ratchet(e) => write!(f, "ratchet error: {}", e),
            LifecycleError::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl std::error::Error for LifecycleError {}

impl From<protocol::KxError> for LifecycleError {
    fn from(value: protocol::KxError) -> Self {
        LifecycleError::Kx(value)
    }
}

impl From<protocol::RatchetError> for LifecycleError {
    fn from(value: protocol::RatchetError) -> Self {
        LifecycleError::Ratchet(value)
    }
}

impl From<StoreError> for LifecycleError {
    fn from(value: StoreError) -> Self {
        LifecycleError::Store(value)
    }
}

impl From<LifecycleError> for CoreError {
    fn from(value: LifecycleError) -> Self {
        match value {
            LifecycleError::ContactNameConflict => CoreError::UserRecoverable(Reason::Other("contact_name_conflict".into())),
            LifecycleError::ContactNotFound => CoreError::Fatal(Reason::Other("contact_not_found".into())),
            LifecycleError::ContactNotPending => CoreError::Fatal(Reason::Other("contact_not_pending".into())),
            LifecycleError::OversizeMessage { .. } => CoreError::UserRecoverable(Reason::Other("oversize_message".into())),
            LifecycleError::NotPending => CoreError::Fatal(Reason::Other("not_pending".into())),
            LifecycleError::Kx(e) => e.into(),
            LifecycleError::Ratchet(e) => e.into(),
            LifecycleError::Store(e) => e.into(),
        }
    }
}

/// Errors the transport scheduler can raise while driving a send or fetch.
/// Transient variants are retried with backoff by the scheduler itself and
/// never escape to the caller.
#[derive(Debug)]
pub enum SchedulerError {
    Timeout,
    RevokedByPeer,
    Transport(String),
}

impl Display for SchedulerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::Timeout => write!(f, "transport operation timed out"),
            SchedulerError::RevokedByPeer => write!(f, "peer has revoked us"),
            SchedulerError::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<SchedulerError> for CoreError {
    fn from(value: SchedulerError) -> Self {
        match value {
            SchedulerError::Timeout => CoreError::Transient(Reason::TransportTimeout),
            SchedulerError::RevokedByPeer => CoreError::Protocol(Reason::Other("revoked_by_peer".into())),
            SchedulerError::Transport(msg) => CoreError::Transient(Reason::Other(msg)),
        }
    }
}
