mod client;
mod drive;
mod peer;
mod sync;

pub use client::{ApiError, ApiErrorClass, http_client, parse_retry_after};
pub use drive::{
    DriveClient, DriveItem, DriveTransfer, DriveUsage, JobId, JobStats, JobStatus,
};
pub use peer::{PeerClient, PeerEntry, SseParser};
pub use sync::{
    AccountInfo, BatchTarget, Dirent, DirentType, FileDetail, SyncClient, UploadChunk,
};
