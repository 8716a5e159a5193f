use common::{CoreError, Reason};
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum StoreError {
    /// The derived key did not open the file: wrong passphrase, wrong
    /// erasure anchor, or a corrupted file. Indistinguishable by design —
    /// telling the two apart would leak which guess was closer.
    BadPassphrase,

    /// Another process holds the state file's lock.
    Locked,

    /// The erasure anchor could not be reached or has already been erased.
    ErasureAnchorUnavailable,

    Io(std::io::Error),

    /// The file's bytes did not decode as a valid envelope.
    Corrupt,
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::BadPassphrase => write!(f, "incorrect passphrase"),
            StoreError::Locked => write!(f, "state file is locked by another process"),
            StoreError::ErasureAnchorUnavailable => write!(f, "erasure anchor unavailable"),
            StoreError::Io(e) => write!(f, "io error: {}", e),
            StoreError::Corrupt => write!(f, "state file is corrupt"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        StoreError::Io(value)
    }
}

impl From<StoreError> for CoreError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::BadPassphrase => CoreError::UserRecoverable(Reason::BadPassphrase),
            StoreError::Locked => CoreError::Fatal(Reason::StoreLocked),
            StoreError::ErasureAnchorUnavailable => CoreError::Fatal(Reason::StoreIo),
            StoreError::Io(e) => CoreError::Fatal(Reason::Other(format!("io error: {}", e))),
            StoreError::Corrupt => CoreError::Fatal(Reason::StoreIo),
        }
    }
}
