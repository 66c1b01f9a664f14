use std::path::{Path, PathBuf};

use tracing::debug;

/// Removes the registered paths when dropped unless disarmed first. Paths are
/// removed newest first, so nested entries go before their parents.
#[derive(Debug)]
pub struct CleanupGuard {
    paths: Vec<PathBuf>,
    armed: bool,
}

impl CleanupGuard {
    pub fn new() -> Self {
        Self {
            paths: Vec::new(),
            armed: true,
        }
    }

    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        let mut guard = Self::new();
        guard.push(path);
        guard
    }

    pub fn push(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Keeps everything on disk.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Default for CleanupGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for path in self.paths.iter().rev() {
            remove_path(path);
        }
    }
}

pub(crate) fn remove_path(path: &Path) {
    let Ok(meta) = path.symlink_metadata() else {
        return;
    };
    let result = if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    if let Err(err) = result {
        debug!(path = %path.display(), error = %err, "cleanup failed");
    }
}
