//! Archive creation and extraction with progress, cancellation and, for zip,
//! pause/resume between files.

mod external;
mod extract;
mod progress;
mod tar;
mod zip;

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

pub use external::{ArchiveTool, locate_binary};
pub use progress::ProgressFn;
pub(crate) use progress::ProgressMeter;

const COPY_BUFFER: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("zip error: {0}")]
    Zip(#[from] ::zip::result::ZipError),
    #[error("failed to scan {path}: {message}")]
    Walk { path: PathBuf, message: String },
    #[error("unsupported archive format: {0}")]
    Unsupported(String),
    #[error("unsafe archive entry: {0}")]
    UnsafeEntry(String),
    #[error("file list has {files} entries but relative path list has {rel_paths}")]
    ListMismatch { files: usize, rel_paths: usize },
    #[error("{binary} is not installed; install it ({hint}) or point {env} at the binary")]
    MissingBinary {
        binary: &'static str,
        hint: &'static str,
        env: &'static str,
    },
    #[error("{tool} failed: {message}")]
    Tool { tool: &'static str, message: String },
    #[error("archive operation cancelled")]
    Cancelled,
    #[error("archive worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ArchiveError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    Rar,
    SevenZ,
}

impl ArchiveFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        let format = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            ArchiveFormat::TarGz
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            ArchiveFormat::TarBz2
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            ArchiveFormat::TarXz
        } else if name.ends_with(".tar") {
            ArchiveFormat::Tar
        } else if name.ends_with(".zip") {
            ArchiveFormat::Zip
        } else if name.ends_with(".rar") {
            ArchiveFormat::Rar
        } else if name.ends_with(".7z") {
            ArchiveFormat::SevenZ
        } else {
            return None;
        };
        Some(format)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarBz2 => "tar.bz2",
            ArchiveFormat::TarXz => "tar.xz",
            ArchiveFormat::Rar => "rar",
            ArchiveFormat::SevenZ => "7z",
        }
    }

    /// File name without the archive extension, used as the default
    /// extraction folder.
    pub fn strip_extension<'a>(&self, name: &'a str) -> &'a str {
        let suffix_len = self.extension().len() + 1;
        if name.len() > suffix_len && name.is_char_boundary(name.len() - suffix_len) {
            &name[..name.len() - suffix_len]
        } else {
            name
        }
    }

    pub fn supports_pause(&self) -> bool {
        matches!(self, ArchiveFormat::Zip)
    }

    pub async fn compress(
        &self,
        job: CompressJob,
        control: ArchiveControl,
        progress: ProgressFn,
    ) -> Result<CompressOutcome, ArchiveError> {
        job.validate()?;
        match *self {
            ArchiveFormat::Zip => {
                tokio::task::spawn_blocking(move || zip::compress(&job, &control, progress))
                    .await?
            }
            format @ (ArchiveFormat::Tar
            | ArchiveFormat::TarGz
            | ArchiveFormat::TarBz2
            | ArchiveFormat::TarXz) => {
                tokio::task::spawn_blocking(move || {
                    tar::compress(format, &job, &control, progress)
                })
                .await??;
                Ok(CompressOutcome::Finished)
            }
            ArchiveFormat::Rar => {
                external::compress(ArchiveTool::Rar, &job, &control, progress).await?;
                Ok(CompressOutcome::Finished)
            }
            ArchiveFormat::SevenZ => {
                external::compress(ArchiveTool::SevenZip, &job, &control, progress).await?;
                Ok(CompressOutcome::Finished)
            }
        }
    }

    /// Extracts `src` into `dest`. With `overwrite` unset, existing files are
    /// left untouched and skipped.
    pub async fn uncompress(
        &self,
        src: &Path,
        dest: &Path,
        overwrite: bool,
        control: ArchiveControl,
        progress: ProgressFn,
    ) -> Result<(), ArchiveError> {
        let src = src.to_path_buf();
        let dest = dest.to_path_buf();
        match *self {
            ArchiveFormat::Zip => {
                tokio::task::spawn_blocking(move || {
                    zip::uncompress(&src, &dest, overwrite, &control, progress)
                })
                .await?
            }
            format @ (ArchiveFormat::Tar
            | ArchiveFormat::TarGz
            | ArchiveFormat::TarBz2
            | ArchiveFormat::TarXz) => {
                tokio::task::spawn_blocking(move || {
                    tar::uncompress(format, &src, &dest, overwrite, &control, progress)
                })
                .await?
            }
            ArchiveFormat::Rar => {
                external::uncompress(ArchiveTool::Rar, &src, &dest, overwrite, &control, progress)
                    .await
            }
            ArchiveFormat::SevenZ => {
                external::uncompress(
                    ArchiveTool::SevenZip,
                    &src,
                    &dest,
                    overwrite,
                    &control,
                    progress,
                )
                .await
            }
        }
    }

    /// Bytes the regular files take once extracted, when the format lets
    /// that be read from headers alone.
    pub async fn extracted_size(&self, src: &Path) -> Result<Option<u64>, ArchiveError> {
        let src = src.to_path_buf();
        match *self {
            ArchiveFormat::Zip => {
                tokio::task::spawn_blocking(move || zip::extracted_size(&src).map(Some)).await?
            }
            format @ (ArchiveFormat::Tar
            | ArchiveFormat::TarGz
            | ArchiveFormat::TarBz2
            | ArchiveFormat::TarXz) => {
                tokio::task::spawn_blocking(move || {
                    tar::regular_file_bytes(format, &src).map(Some)
                })
                .await?
            }
            ArchiveFormat::Rar | ArchiveFormat::SevenZ => Ok(None),
        }
    }
}

/// Position to continue a paused compression from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub resume_index: usize,
    pub resume_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompressOutcome {
    Finished,
    Paused(Checkpoint),
}

/// Input of a compression run. `rel_paths[i]` is the archive name of
/// `files[i]`; names ending in `/` are directories.
#[derive(Debug, Clone, Default)]
pub struct CompressJob {
    pub output: PathBuf,
    pub files: Vec<PathBuf>,
    pub rel_paths: Vec<String>,
    pub total_size: u64,
    pub checkpoint: Option<Checkpoint>,
}

impl CompressJob {
    /// Collects `sources` recursively; each source keeps its own name as the
    /// top-level archive entry.
    pub fn from_sources(sources: &[PathBuf], output: &Path) -> Result<Self, ArchiveError> {
        let mut job = CompressJob {
            output: output.to_path_buf(),
            ..Default::default()
        };
        for source in sources {
            let base = source.parent().unwrap_or(Path::new(""));
            for entry in WalkDir::new(source).sort_by_file_name() {
                let entry = entry.map_err(|err| ArchiveError::Walk {
                    path: source.clone(),
                    message: err.to_string(),
                })?;
                let rel = entry
                    .path()
                    .strip_prefix(base)
                    .unwrap_or(entry.path())
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if entry.file_type().is_dir() {
                    job.files.push(entry.path().to_path_buf());
                    job.rel_paths.push(format!("{rel}/"));
                } else if entry.file_type().is_file() {
                    let size = entry
                        .metadata()
                        .map_err(|err| ArchiveError::Walk {
                            path: entry.path().to_path_buf(),
                            message: err.to_string(),
                        })?
                        .len();
                    job.total_size += size;
                    job.files.push(entry.path().to_path_buf());
                    job.rel_paths.push(rel);
                }
            }
        }
        Ok(job)
    }

    fn validate(&self) -> Result<(), ArchiveError> {
        if self.files.len() != self.rel_paths.len() {
            return Err(ArchiveError::ListMismatch {
                files: self.files.len(),
                rel_paths: self.rel_paths.len(),
            });
        }
        Ok(())
    }
}

/// Cancellation and pause signals shared with a running archive job. A pause
/// is a cancellation with the pause flag raised; formats that cannot pause
/// treat it as a plain cancel.
#[derive(Debug, Clone, Default)]
pub struct ArchiveControl {
    cancel: CancellationToken,
    pause: Arc<AtomicBool>,
}

impl ArchiveControl {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            pause: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_pause(cancel: CancellationToken, pause: Arc<AtomicBool>) -> Self {
        Self { cancel, pause }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn pause_requested(&self) -> bool {
        self.cancel.is_cancelled() && self.pause.load(Ordering::SeqCst)
    }

    /// Stop without the intent to resume.
    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled() && !self.pause.load(Ordering::SeqCst)
    }
}

/// Copies until EOF, polling `stop` between buffers.
pub(crate) fn copy_with_cancel<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    path: &Path,
    stop: impl Fn() -> bool,
    meter: &mut ProgressMeter,
) -> Result<u64, ArchiveError> {
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut copied = 0u64;
    loop {
        if stop() {
            return Err(ArchiveError::Cancelled);
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(ArchiveError::io(path, err)),
        };
        writer
            .write_all(&buf[..n])
            .map_err(|err| ArchiveError::io(path, err))?;
        copied += n as u64;
        meter.advance(n as u64);
    }
    Ok(copied)
}

#[cfg(unix)]
pub(crate) fn apply_mode(path: &Path, mode: Option<u32>) {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777));
    }
}

#[cfg(not(unix))]
pub(crate) fn apply_mode(_path: &Path, _mode: Option<u32>) {}
