// pgbackup/src/backup/cleanup.rs
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Files created by one backup invocation. Removed on `remove_all` or drop.
#[derive(Debug, Default)]
pub struct TempFiles {
    paths: Vec<PathBuf>,
}

impl TempFiles {
    pub fn track(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }

    /// Best-effort removal. Failures are logged, never returned, so they
    /// cannot hide the error that caused the cleanup.
    pub fn remove_all(&mut self) -> usize {
        let mut removed = 0;
        for path in self.paths.drain(..) {
            if remove_quietly(&path) {
                removed += 1;
            }
        }
        removed
    }
}

impl Drop for TempFiles {
    fn drop(&mut self) {
        self.remove_all();
    }
}

fn remove_quietly(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "🧹 Removed temporary file");
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "⚠️ Failed to remove temporary file");
            false
        }
    }
}
