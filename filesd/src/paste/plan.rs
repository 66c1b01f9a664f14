use std::future::Future;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::stream::download_response;
use super::{PasteError, PhaseContext};

/// File of a remote tree, `rel` relative to the copied root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RemoteFile {
    pub remote: String,
    pub rel: String,
    pub size: u64,
}

/// Flattened remote tree in breadth-first order: every directory precedes
/// its children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RemotePlan {
    pub dirs: Vec<String>,
    pub files: Vec<RemoteFile>,
    pub total: u64,
}

impl RemotePlan {
    pub fn single(remote: String, size: u64) -> Self {
        Self {
            dirs: Vec::new(),
            files: vec![RemoteFile {
                remote,
                rel: String::new(),
                size,
            }],
            total: size,
        }
    }

    pub fn push_dir(&mut self, rel: String) {
        self.dirs.push(rel);
    }

    pub fn push_file(&mut self, remote: String, rel: String, size: u64) {
        self.total += size;
        self.files.push(RemoteFile { remote, rel, size });
    }

    /// Recreates the plan under `target`, fetching each file's body with
    /// `open`. For a single-file plan `target` is the file itself.
    pub async fn download<F, Fut>(
        &self,
        ctx: &PhaseContext,
        target: &Path,
        is_dir: bool,
        open: F,
    ) -> Result<(), PasteError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<reqwest::Response, PasteError>>,
    {
        if is_dir {
            tokio::fs::create_dir_all(target)
                .await
                .map_err(|err| PasteError::io(target, err))?;
        }
        for rel in &self.dirs {
            ctx.check()?;
            let dir = target.join(rel);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|err| PasteError::io(&dir, err))?;
        }
        for file in &self.files {
            ctx.check()?;
            let path = if is_dir {
                target.join(&file.rel)
            } else {
                target.to_path_buf()
            };
            let response = open(file.remote.clone()).await?;
            download_response(response, &path, ctx).await?;
        }
        Ok(())
    }
}

/// Entry of a local tree, `rel` relative to the scanned root.
#[derive(Debug, Clone)]
pub(crate) struct LocalEntry {
    pub path: PathBuf,
    pub rel: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Everything below `root` (directories before their contents) and the
/// total size of the regular files. A file root yields itself with an empty
/// `rel`.
pub(crate) async fn scan_local(root: &Path) -> Result<(Vec<LocalEntry>, u64), PasteError> {
    let owned = root.to_path_buf();
    tokio::task::spawn_blocking(move || scan_local_blocking(&owned))
        .await
        .map_err(|err| PasteError::io(root, std::io::Error::other(err)))?
}

fn scan_local_blocking(root: &Path) -> Result<(Vec<LocalEntry>, u64), PasteError> {
    let mut entries = Vec::new();
    let mut total = 0;
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(root).to_path_buf();
            PasteError::io(&path, std::io::Error::other(err))
        })?;
        let file_type = entry.file_type();
        if entry.depth() == 0 && file_type.is_dir() {
            continue;
        }
        if !file_type.is_dir() && !file_type.is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let size = if file_type.is_file() {
            entry
                .metadata()
                .map_err(|err| PasteError::io(entry.path(), std::io::Error::other(err)))?
                .len()
        } else {
            0
        };
        total += size;
        entries.push(LocalEntry {
            path: entry.path().to_path_buf(),
            rel,
            is_dir: file_type.is_dir(),
            size,
        });
    }
    Ok((entries, total))
}

/// Joins a directory path ending in `/` with a relative path.
pub(crate) fn join_remote(dir: &str, rel: &str) -> String {
    let mut out = dir.to_string();
    if !out.ends_with('/') {
        out.push('/');
    }
    out.push_str(rel.trim_start_matches('/'));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scans_tree_with_directories_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("docs");
        std::fs::create_dir_all(root.join("sub/empty")).unwrap();
        std::fs::write(root.join("a.txt"), b"abc").unwrap();
        std::fs::write(root.join("sub/b.txt"), b"hello").unwrap();

        let (entries, total) = scan_local(&root).await.unwrap();
        let rels: Vec<_> = entries.iter().map(|e| e.rel.as_str()).collect();
        assert_eq!(rels, vec!["a.txt", "sub", "sub/b.txt", "sub/empty"]);
        assert_eq!(total, 8);
    }

    #[tokio::test]
    async fn scanning_a_file_yields_itself() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.bin");
        std::fs::write(&file, vec![0u8; 42]).unwrap();
        let (entries, total) = scan_local(&file).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].rel, "");
        assert_eq!(total, 42);
    }

    #[test]
    fn plan_accumulates_sizes() {
        let mut plan = RemotePlan::default();
        plan.push_dir("sub".into());
        plan.push_file("/r/a".into(), "a".into(), 3);
        plan.push_file("/r/sub/b".into(), "sub/b".into(), 4);
        assert_eq!(plan.total, 7);
        assert_eq!(join_remote("/Docs/", "sub/b"), "/Docs/sub/b");
        assert_eq!(join_remote("/Docs", "/x"), "/Docs/x");
    }
}
