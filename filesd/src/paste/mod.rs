//! Transfer handlers: one implementation per backend pair, selected from the
//! [`TaskType`] computed when a task is created.

mod archive;
mod backends;
mod cloud;
mod context;
mod direct;
pub mod dupname;
mod error;
mod plan;
mod posix;
mod registry;
mod retry;
pub mod space;
mod stream;
mod sync;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

pub use backends::Backends;
pub use context::PhaseContext;
pub(crate) use context::PhaseSetup;
pub(crate) use posix::remove_local;
pub use error::PasteError;
pub use registry::UploadRegistry;

use crate::storage::{FileParam, FileType, Location, PasteParam, StorageLocator};
use error::ApiContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Posix to posix on this node.
    Rsync,
    SyncUpload,
    SyncDownload,
    SyncCopy,
    CloudUpload,
    CloudDownload,
    /// Server-side job between accounts of the same cloud kind.
    CloudCopy,
    /// Peer node to this node.
    DirectFiles,
    SyncToCloud,
    CloudToSync,
    /// Cloud to cloud of a different kind, through local staging.
    CloudRelay,
    PeerToSync,
    PeerToCloud,
    Compress,
    Uncompress { overwrite: bool },
}

impl TaskType {
    /// Picks the transfer for a paste request from the two endpoints.
    pub fn classify(locator: &StorageLocator, param: &PasteParam) -> Result<Self, PasteError> {
        let (src, dst) = (&param.src, &param.dst);
        let src_location = locator.locate(src)?;
        let dst_location = locator.locate(dst)?;
        if matches!(dst_location, Location::Peer { .. }) {
            return Err(PasteError::Unsupported(format!(
                "pasting into another node ({}) is not supported",
                dst.extend
            )));
        }
        let from_peer = matches!(src_location, Location::Peer { .. });

        let kind = match (src.file_type, dst.file_type) {
            (s, d) if s.is_posix() && d.is_posix() => {
                if from_peer {
                    TaskType::DirectFiles
                } else {
                    TaskType::Rsync
                }
            }
            (s, FileType::Sync) if s.is_posix() => {
                if from_peer {
                    TaskType::PeerToSync
                } else {
                    TaskType::SyncUpload
                }
            }
            (s, d) if s.is_posix() && d.is_cloud() => {
                if from_peer {
                    TaskType::PeerToCloud
                } else {
                    TaskType::CloudUpload
                }
            }
            (FileType::Sync, d) if d.is_posix() => TaskType::SyncDownload,
            (FileType::Sync, FileType::Sync) => TaskType::SyncCopy,
            (FileType::Sync, _) => TaskType::SyncToCloud,
            (_, d) if d.is_posix() => TaskType::CloudDownload,
            (_, FileType::Sync) => TaskType::CloudToSync,
            _ if same_arch(src, dst) => TaskType::CloudCopy,
            _ => TaskType::CloudRelay,
        };
        debug!(src = %src, dst = %dst, task_type = kind.as_str(), "classified paste");
        Ok(kind)
    }

    /// Single-handler types making up this transfer, in execution order.
    /// Consecutive legs are chained through a staging directory.
    pub fn legs(&self) -> Vec<TaskType> {
        match self {
            TaskType::SyncToCloud => vec![TaskType::SyncDownload, TaskType::CloudUpload],
            TaskType::CloudToSync => vec![TaskType::CloudDownload, TaskType::SyncUpload],
            TaskType::CloudRelay => vec![TaskType::CloudDownload, TaskType::CloudUpload],
            TaskType::PeerToSync => vec![TaskType::DirectFiles, TaskType::SyncUpload],
            TaskType::PeerToCloud => vec![TaskType::DirectFiles, TaskType::CloudUpload],
            single => vec![*single],
        }
    }

    /// Whether every leg can stop at a resumable point.
    pub fn supports_pause(&self) -> bool {
        self.legs().iter().all(|leg| {
            matches!(
                leg,
                TaskType::SyncUpload | TaskType::DirectFiles | TaskType::Compress
            )
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Rsync => "rsync",
            TaskType::SyncUpload => "sync_upload",
            TaskType::SyncDownload => "sync_download",
            TaskType::SyncCopy => "sync_copy",
            TaskType::CloudUpload => "cloud_upload",
            TaskType::CloudDownload => "cloud_download",
            TaskType::CloudCopy => "cloud_copy",
            TaskType::DirectFiles => "direct_files",
            TaskType::SyncToCloud => "sync_to_cloud",
            TaskType::CloudToSync => "cloud_to_sync",
            TaskType::CloudRelay => "cloud_relay",
            TaskType::PeerToSync => "peer_to_sync",
            TaskType::PeerToCloud => "peer_to_cloud",
            TaskType::Compress => "compress",
            TaskType::Uncompress { .. } => "uncompress",
        }
    }
}

/// Two cloud endpoints can be served by one server-side job when they are
/// the same kind of drive. Account names are compared after trimming and
/// case-sensitively.
pub fn same_arch(src: &FileParam, dst: &FileParam) -> bool {
    src.file_type.is_cloud()
        && src.file_type == dst.file_type
        && !src.extend.trim().is_empty()
        && !dst.extend.trim().is_empty()
}

/// Where a phase left the item and whether it already removed the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub output: FileParam,
    pub source_consumed: bool,
}

impl PhaseOutcome {
    pub fn copied(output: FileParam) -> Self {
        Self {
            output,
            source_consumed: false,
        }
    }

    pub fn moved(output: FileParam) -> Self {
        Self {
            output,
            source_consumed: true,
        }
    }
}

#[async_trait]
pub trait TransferHandler: Send + Sync {
    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutcome, PasteError>;
}

pub fn handler_for(kind: TaskType) -> Result<Box<dyn TransferHandler>, PasteError> {
    let handler: Box<dyn TransferHandler> = match kind {
        TaskType::Rsync => Box::new(posix::RsyncHandler),
        TaskType::SyncUpload => Box::new(sync::SyncUploadHandler),
        TaskType::SyncDownload => Box::new(sync::SyncDownloadHandler),
        TaskType::SyncCopy => Box::new(sync::SyncCopyHandler),
        TaskType::CloudUpload => Box::new(cloud::CloudUploadHandler),
        TaskType::CloudDownload => Box::new(cloud::CloudDownloadHandler),
        TaskType::CloudCopy => Box::new(cloud::CloudCopyHandler),
        TaskType::DirectFiles => Box::new(direct::DirectFilesHandler),
        TaskType::Compress => Box::new(archive::CompressHandler),
        TaskType::Uncompress { overwrite } => Box::new(archive::UncompressHandler { overwrite }),
        pipeline => {
            return Err(PasteError::Invalid(format!(
                "{} runs as several phases and has no single handler",
                pipeline.as_str()
            )));
        }
    };
    Ok(handler)
}

/// Deletes an entry from whichever backend holds it. A missing entry counts
/// as removed.
pub async fn remove_entry(backends: &Backends, param: &FileParam) -> Result<(), PasteError> {
    match backends.locator().locate(param)? {
        Location::Local(path) => posix::remove_local(&path).await,
        Location::Peer { node, path } => backends
            .peer(&node)?
            .delete(&param.owner, &path)
            .await
            .or_else(ignore_not_found)
            .with_api_context(|| format!("delete {path} on {node}")),
        Location::Sync { repo, path } => {
            let name = param.name().to_string();
            backends
                .sync(&repo)?
                .batch_delete(&repo, &param.parent_path(), &[name])
                .await
                .or_else(ignore_not_found)
                .with_api_context(|| format!("delete {path} from repo {repo}"))
        }
        Location::Cloud {
            kind,
            account,
            path,
        } => backends
            .drive(kind, &account)?
            .delete(&account, &path)
            .await
            .or_else(ignore_not_found)
            .with_api_context(|| format!("delete {path} from {kind} account {account}")),
    }
}

fn ignore_not_found(err: files_core::ApiError) -> Result<(), files_core::ApiError> {
    if err.is_not_found() { Ok(()) } else { Err(err) }
}
