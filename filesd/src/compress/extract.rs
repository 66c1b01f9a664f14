use std::collections::HashSet;
use std::fs::File;
use std::path::{Component, Path, PathBuf};

use super::ArchiveError;
use crate::cleanup::CleanupGuard;

/// Extraction destination that rolls back on drop. A destination created by
/// this run is removed entirely; inside an existing one, every file and
/// directory the run created is removed, at any depth, and nothing else.
pub(crate) struct ExtractTarget {
    dest: PathBuf,
    created_dest: bool,
    created: HashSet<PathBuf>,
    guard: CleanupGuard,
}

impl ExtractTarget {
    pub(crate) fn prepare(dest: &Path) -> Result<Self, ArchiveError> {
        let created_dest = !dest.exists();
        let guard = if created_dest {
            std::fs::create_dir_all(dest).map_err(|err| ArchiveError::io(dest, err))?;
            CleanupGuard::for_path(dest)
        } else {
            CleanupGuard::new()
        };
        Ok(Self {
            dest: dest.to_path_buf(),
            created_dest,
            created: HashSet::new(),
            guard,
        })
    }

    pub(crate) fn dest(&self) -> &Path {
        &self.dest
    }

    /// Maps an archive entry name below the destination.
    pub(crate) fn resolve(&self, entry: &str) -> Result<PathBuf, ArchiveError> {
        Ok(self.dest.join(sanitize_entry(entry)?))
    }

    pub(crate) fn create_dir(&mut self, path: &Path) -> Result<(), ArchiveError> {
        self.track(path);
        std::fs::create_dir_all(path).map_err(|err| ArchiveError::io(path, err))
    }

    /// Creates (or truncates) a file, creating missing parents first.
    pub(crate) fn create_file(&mut self, path: &Path) -> Result<File, ArchiveError> {
        if let Some(parent) = path.parent() {
            self.create_dir(parent)?;
        }
        self.track(path);
        File::create(path).map_err(|err| ArchiveError::io(path, err))
    }

    /// Records entries an external extractor is about to write.
    pub(crate) fn expect_entries<'a>(
        &mut self,
        entries: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), ArchiveError> {
        for entry in entries {
            let path = self.resolve(entry)?;
            self.track(&path);
        }
        Ok(())
    }

    pub(crate) fn commit(mut self) {
        self.guard.disarm();
    }

    /// Registers `path` and its missing ancestors below the destination,
    /// outermost first so rollback removes children before parents.
    fn track(&mut self, path: &Path) {
        if self.created_dest {
            return;
        }
        let mut missing = Vec::new();
        for ancestor in path.ancestors() {
            if ancestor == self.dest || !ancestor.starts_with(&self.dest) {
                break;
            }
            if self.created.contains(ancestor) || ancestor.symlink_metadata().is_ok() {
                break;
            }
            missing.push(ancestor.to_path_buf());
        }
        for path in missing.into_iter().rev() {
            self.created.insert(path.clone());
            self.guard.push(path);
        }
    }
}

/// Relative, `..`-free form of an archive entry name.
pub(crate) fn sanitize_entry(entry: &str) -> Result<PathBuf, ArchiveError> {
    let path = Path::new(entry);
    if path.is_absolute() {
        return Err(ArchiveError::UnsafeEntry(entry.to_string()));
    }
    let mut sanitized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(segment) => sanitized.push(segment),
            Component::CurDir => {}
            _ => return Err(ArchiveError::UnsafeEntry(entry.to_string())),
        }
    }
    if sanitized.as_os_str().is_empty() {
        return Err(ArchiveError::UnsafeEntry(entry.to_string()));
    }
    Ok(sanitized)
}
