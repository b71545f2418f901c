//! Reference-counted temporary attachment files.
//!
//! One downloaded file is shared by every job created for a message. Each
//! job releases its reference exactly once when it finishes (or is dropped
//! at shutdown); the file is unlinked when the last reference goes.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct SharedAttachment {
    path: PathBuf,
    remaining: Mutex<usize>,
}

impl SharedAttachment {
    /// `holders` is the number of jobs that will call `release`.
    pub fn new(path: impl Into<PathBuf>, holders: usize) -> Self {
        Self {
            path: path.into(),
            remaining: Mutex::new(holders),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remaining(&self) -> usize {
        *self.remaining.lock().await
    }

    /// Drop one reference. Returns true if this call deleted the file.
    pub async fn release(&self) -> bool {
        let mut remaining = self.remaining.lock().await;
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        if *remaining > 0 {
            return false;
        }
        delete_file(&self.path).await;
        true
    }
}

impl Drop for SharedAttachment {
    /// Holders that vanished without releasing (an aborted worker) must not leak the file.
    fn drop(&mut self) {
        if *self.remaining.get_mut() > 0 {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Remove a temporary file. Missing files and I/O errors are ignored.
pub async fn delete_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Deleted attachment"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete attachment"),
    }
}
