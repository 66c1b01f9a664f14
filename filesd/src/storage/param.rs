use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::LocatorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Drive,
    Cache,
    External,
    Sync,
    Google,
    Dropbox,
    Awss3,
    Tencent,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Drive => "drive",
            FileType::Cache => "cache",
            FileType::External => "external",
            FileType::Sync => "sync",
            FileType::Google => "google",
            FileType::Dropbox => "dropbox",
            FileType::Awss3 => "awss3",
            FileType::Tencent => "tencent",
        }
    }

    /// Backed by a directory on some node's filesystem.
    pub fn is_posix(&self) -> bool {
        matches!(self, FileType::Drive | FileType::Cache | FileType::External)
    }

    pub fn is_cloud(&self) -> bool {
        matches!(
            self,
            FileType::Google | FileType::Dropbox | FileType::Awss3 | FileType::Tencent
        )
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = LocatorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value.trim().to_ascii_lowercase().as_str() {
            "drive" => FileType::Drive,
            "cache" => FileType::Cache,
            "external" => FileType::External,
            "sync" => FileType::Sync,
            "google" => FileType::Google,
            "dropbox" => FileType::Dropbox,
            "awss3" => FileType::Awss3,
            "tencent" => FileType::Tencent,
            other => return Err(LocatorError::UnknownFileType(other.to_string())),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Copy,
    Move,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Copy => "copy",
            Action::Move => "move",
        })
    }
}

/// One side of a transfer. `extend` is the node name for posix kinds, the
/// repo id for sync and the account name for cloud drives. A path ending in
/// `/` denotes a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileParam {
    pub owner: String,
    pub file_type: FileType,
    pub extend: String,
    pub path: String,
}

impl FileParam {
    pub fn new(
        owner: impl Into<String>,
        file_type: FileType,
        extend: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            file_type,
            extend: extend.into(),
            path: path.into(),
        }
    }

    /// Parses a `type:extend:path` locator, e.g. `drive:node-1:/Home/a.txt`.
    pub fn parse(owner: &str, value: &str) -> Result<Self, LocatorError> {
        let mut parts = value.splitn(3, ':');
        let (Some(kind), Some(extend), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(LocatorError::InvalidPath(value.to_string()));
        };
        Ok(Self::new(owner, kind.parse()?, extend, path))
    }

    pub fn is_dir(&self) -> bool {
        self.path.ends_with('/')
    }

    /// Last path component without the trailing slash.
    pub fn name(&self) -> &str {
        self.path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }

    /// Directory containing this entry, always ending in `/`.
    pub fn parent_path(&self) -> String {
        let trimmed = self.path.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(idx) => trimmed[..=idx].to_string(),
            None => "/".to_string(),
        }
    }

    /// Entry `name` inside this directory.
    pub fn child(&self, name: &str, is_dir: bool) -> Self {
        let mut path = self.path.clone();
        if !path.ends_with('/') {
            path.push('/');
        }
        path.push_str(name.trim_matches('/'));
        if is_dir {
            path.push('/');
        }
        Self {
            path,
            ..self.clone()
        }
    }

    pub fn with_path(&self, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..self.clone()
        }
    }

    pub fn same_backend(&self, other: &FileParam) -> bool {
        self.file_type == other.file_type && self.extend == other.extend
    }
}

impl fmt::Display for FileParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file_type, self.extend, self.path)
    }
}

/// A copy or move request. `dst.path` names the destination directory; the
/// source's base name is appended there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasteParam {
    pub owner: String,
    pub action: Action,
    pub src: FileParam,
    pub dst: FileParam,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_and_parent_of_file_and_dir() {
        let file = FileParam::new("u", FileType::Drive, "n1", "/a/b.txt");
        assert_eq!(file.name(), "b.txt");
        assert_eq!(file.parent_path(), "/a/");
        assert!(!file.is_dir());

        let dir = FileParam::new("u", FileType::Drive, "n1", "/a/b/");
        assert_eq!(dir.name(), "b");
        assert_eq!(dir.parent_path(), "/a/");
        assert!(dir.is_dir());

        let top = FileParam::new("u", FileType::Sync, "repo", "/x.bin");
        assert_eq!(top.parent_path(), "/");
    }

    #[test]
    fn child_joins_with_single_separator() {
        let dir = FileParam::new("u", FileType::Cache, "n1", "/stage");
        assert_eq!(dir.child("a.txt", false).path, "/stage/a.txt");
        assert_eq!(dir.child("sub", true).path, "/stage/sub/");
    }

    #[test]
    fn parses_locator_triplets() {
        let param = FileParam::parse("alice", "google:work:/Docs/").unwrap();
        assert_eq!(param.file_type, FileType::Google);
        assert_eq!(param.extend, "work");
        assert_eq!(param.path, "/Docs/");
        assert!(FileParam::parse("alice", "drive:/only-two").is_err());
        assert!(FileParam::parse("alice", "floppy:a:/b").is_err());
    }
}
