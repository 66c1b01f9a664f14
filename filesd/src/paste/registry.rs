use dashmap::DashMap;
use sha2::{Digest, Sha256};

/// Confirmed offsets of chunked uploads, keyed by the identity of the file
/// being uploaded. Lets a resumed task continue after the last confirmed
/// chunk instead of starting over.
#[derive(Debug, Default)]
pub struct UploadRegistry {
    entries: DashMap<String, UploadProgress>,
}

#[derive(Debug, Clone)]
struct UploadProgress {
    task_id: String,
    next_offset: u64,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stable key for one upload: destination, local source and its size and
    /// modification time. A changed source yields a different key.
    pub fn key(repo: &str, dst_path: &str, source: &str, size: u64, mtime: i64) -> String {
        let mut hasher = Sha256::new();
        for part in [repo, dst_path, source] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(size.to_le_bytes());
        hasher.update(mtime.to_le_bytes());
        hex(&hasher.finalize())
    }

    /// Offset of the first unconfirmed byte, 0 when unknown.
    pub fn offset(&self, key: &str) -> u64 {
        self.entries
            .get(key)
            .map(|entry| entry.next_offset)
            .unwrap_or(0)
    }

    pub fn record(&self, key: &str, task_id: &str, next_offset: u64) {
        self.entries.insert(
            key.to_string(),
            UploadProgress {
                task_id: task_id.to_string(),
                next_offset,
            },
        );
    }

    pub fn finish(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drops every entry written by `task_id`.
    pub fn forget_task(&self, task_id: &str) {
        self.entries.retain(|_, entry| entry.task_id != task_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_forgets_per_task() {
        let registry = UploadRegistry::new();
        let a = UploadRegistry::key("repo", "/Docs/a.bin", "/home/u/a.bin", 100, 1);
        let b = UploadRegistry::key("repo", "/Docs/b.bin", "/home/u/b.bin", 100, 1);
        registry.record(&a, "t1", 40);
        registry.record(&b, "t2", 80);
        assert_eq!(registry.offset(&a), 40);

        registry.forget_task("t1");
        assert_eq!(registry.offset(&a), 0);
        assert_eq!(registry.offset(&b), 80);
        registry.finish(&b);
        assert!(registry.is_empty());
    }

    #[test]
    fn key_changes_with_source_identity() {
        let first = UploadRegistry::key("repo", "/a", "/src/a", 10, 1);
        assert_eq!(first, UploadRegistry::key("repo", "/a", "/src/a", 10, 1));
        assert_ne!(first, UploadRegistry::key("repo", "/a", "/src/a", 11, 1));
        assert_ne!(first, UploadRegistry::key("repo", "/a", "/src/a", 10, 2));
        assert_eq!(first.len(), 64);
    }
}
