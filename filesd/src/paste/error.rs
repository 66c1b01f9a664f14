use std::io;
use std::path::{Path, PathBuf};

use files_core::{ApiError, JobId};
use thiserror::Error;

use super::space::SpaceError;
use crate::compress::ArchiveError;
use crate::storage::LocatorError;

#[derive(Debug, Error)]
pub enum PasteError {
    #[error(transparent)]
    Locator(#[from] LocatorError),
    #[error(transparent)]
    Space(#[from] SpaceError),
    #[error("{context}: {source}")]
    Api {
        context: String,
        #[source]
        source: ApiError,
    },
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Archive(ArchiveError),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("unsupported transfer: {0}")]
    Unsupported(String),
    #[error("no write permission on {0}")]
    NotWritable(PathBuf),
    #[error("{tool} failed: {message}")]
    Tool { tool: &'static str, message: String },
    #[error("remote job {job} failed: {message}")]
    JobFailed { job: JobId, message: String },
    #[error("upload of {name} was not confirmed: remote has {remote} of {expected} bytes")]
    UploadIncomplete {
        name: String,
        remote: u64,
        expected: u64,
    },
    #[error("task cancelled")]
    Cancelled,
    #[error("task paused")]
    Paused,
}

impl PasteError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn api(context: impl Into<String>, source: ApiError) -> Self {
        Self::Api {
            context: context.into(),
            source,
        }
    }

    /// Interrupted by the user rather than failed.
    pub fn is_interruption(&self) -> bool {
        matches!(self, PasteError::Cancelled | PasteError::Paused)
    }
}

impl From<ArchiveError> for PasteError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Cancelled => PasteError::Cancelled,
            other => PasteError::Archive(other),
        }
    }
}

/// Attaches a description of the failed call to an [`ApiError`].
pub(crate) trait ApiContext<T> {
    fn api_context(self, context: &str) -> Result<T, PasteError>;

    fn with_api_context(self, context: impl FnOnce() -> String) -> Result<T, PasteError>;
}

impl<T> ApiContext<T> for Result<T, ApiError> {
    fn api_context(self, context: &str) -> Result<T, PasteError> {
        self.map_err(|source| PasteError::api(context, source))
    }

    fn with_api_context(self, context: impl FnOnce() -> String) -> Result<T, PasteError> {
        self.map_err(|source| PasteError::api(context(), source))
    }
}
