//! A cooperative, advisory lock on the state file, implemented with a
//! sidecar `<path>.lock` file created with `O_CREAT | O_EXCL` rather than a
//! platform `flock`: nothing in this workspace's dependency set offers file
//! locking, and `O_EXCL`'s atomic create-if-absent is already exactly the
//! primitive a single-writer lock needs.

use crate::errors::StoreError;
use log::{error, warn};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Attempts to acquire the lock for `state_path`, writing the current
    /// process id into the sidecar file for diagnostics. Fails with
    /// `StoreError::Locked` if the sidecar already exists.
    pub fn acquire(state_path: &Path) -> Result<Self, StoreError> {
        let lock_path = lock_path_for(state_path);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                warn!("state file {} already locked", state_path.display());
                return Err(StoreError::Locked);
            }
            Err(e) => {
                error!("failed to create lock file {}: {e}", lock_path.display());
                return Err(StoreError::Io(e));
            }
        };
        let _ = write!(file, "{}", std::process::id());
        Ok(FileLock { path: lock_path })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_path_for(state_path: &Path) -> PathBuf {
    let mut os = state_path.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_rejected_while_held() {
        let dir = std::env::temp_dir().join(format!("pond-store-lock-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&dir);
        let first = FileLock::acquire(&dir).unwrap();
        let second = FileLock::acquire(&dir);
        assert!(matches!(second, Err(StoreError::Locked)));
        drop(first);
        let third = FileLock::acquire(&dir);
        assert!(third.is_ok());
    }
}
