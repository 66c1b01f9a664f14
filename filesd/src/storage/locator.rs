use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use super::{FileParam, FileType};
use crate::config::EngineConfig;

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("backend not found: {file_type} {extend:?}")]
    BackendNotFound { file_type: FileType, extend: String },
    #[error("unknown file type: {0}")]
    UnknownFileType(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("{0} is not stored on this node")]
    NotLocal(String),
}

/// Where the bytes behind a [`FileParam`] live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    Peer {
        node: String,
        path: String,
    },
    Sync {
        repo: String,
        path: String,
    },
    Cloud {
        kind: FileType,
        account: String,
        path: String,
    },
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(path) => write!(f, "file://{}", path.display()),
            Location::Peer { node, path } => write!(f, "node://{node}{path}"),
            Location::Sync { repo, path } => write!(f, "sync://{repo}{path}"),
            Location::Cloud {
                kind,
                account,
                path,
            } => write!(f, "{kind}://{account}{path}"),
        }
    }
}

/// Maps `(owner, file type, extend, path)` onto concrete locations. Holds
/// only immutable configuration, so it is freely shared between tasks.
#[derive(Debug, Clone)]
pub struct StorageLocator {
    node_name: String,
    drive_root: PathBuf,
    cache_root: PathBuf,
    external_root: PathBuf,
    peers: BTreeSet<String>,
    sync_enabled: bool,
    drive_enabled: bool,
}

impl StorageLocator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            node_name: config.node_name.clone(),
            drive_root: config.drive_root.clone(),
            cache_root: config.cache_root.clone(),
            external_root: config.external_root.clone(),
            peers: config.peers.keys().cloned().collect(),
            sync_enabled: config.sync.is_some(),
            drive_enabled: config.drive.is_some(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn locate(&self, param: &FileParam) -> Result<Location, LocatorError> {
        let path = normalize_path(&param.path)?;
        let not_found = || LocatorError::BackendNotFound {
            file_type: param.file_type,
            extend: param.extend.clone(),
        };
        match param.file_type {
            FileType::Drive | FileType::Cache | FileType::External => {
                if self.is_local_node(param) {
                    let root = match param.file_type {
                        FileType::Drive => self.drive_root.join(&param.owner),
                        FileType::Cache => self.cache_root.join(&param.owner),
                        _ => self.external_root.clone(),
                    };
                    Ok(Location::Local(map_under(&root, &path)?))
                } else if self.peers.contains(param.extend.trim()) {
                    Ok(Location::Peer {
                        node: param.extend.trim().to_string(),
                        path,
                    })
                } else {
                    Err(not_found())
                }
            }
            FileType::Sync => {
                if !self.sync_enabled || param.extend.trim().is_empty() {
                    return Err(not_found());
                }
                Ok(Location::Sync {
                    repo: param.extend.trim().to_string(),
                    path,
                })
            }
            kind => {
                if !self.drive_enabled || param.extend.trim().is_empty() {
                    return Err(not_found());
                }
                Ok(Location::Cloud {
                    kind,
                    account: param.extend.trim().to_string(),
                    path,
                })
            }
        }
    }

    pub fn resource_uri(&self, param: &FileParam) -> Result<String, LocatorError> {
        Ok(self.locate(param)?.to_string())
    }

    /// Mount path of a posix entry stored on this node.
    pub fn local_path(&self, param: &FileParam) -> Result<PathBuf, LocatorError> {
        match self.locate(param)? {
            Location::Local(path) => Ok(path),
            _ => Err(LocatorError::NotLocal(param.to_string())),
        }
    }

    /// An empty node name refers to this node.
    pub fn is_local_node(&self, param: &FileParam) -> bool {
        if !param.file_type.is_posix() {
            return false;
        }
        let node = param.extend.trim();
        node.is_empty() || node == self.node_name
    }

    /// Staging directory used to chain phases of task `task_id`.
    pub fn staging_param(&self, owner: &str, task_id: &str) -> FileParam {
        FileParam::new(
            owner,
            FileType::Cache,
            self.node_name.clone(),
            format!("/.paste-staging/{task_id}/"),
        )
    }
}

/// Rejects relative and `..` paths; keeps a trailing `/`.
fn normalize_path(path: &str) -> Result<String, LocatorError> {
    if !path.starts_with('/') {
        return Err(LocatorError::InvalidPath(path.to_string()));
    }
    let mut out = String::from("/");
    let mut first = true;
    for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
        if part == ".." {
            return Err(LocatorError::InvalidPath(path.to_string()));
        }
        if !first {
            out.push('/');
        }
        out.push_str(part);
        first = false;
    }
    if path.ends_with('/') && !out.ends_with('/') {
        out.push('/');
    }
    Ok(out)
}

fn map_under(root: &Path, path: &str) -> Result<PathBuf, LocatorError> {
    let mut out = root.to_path_buf();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(LocatorError::InvalidPath(path.to_string()));
            }
        }
    }
    Ok(out)
}
