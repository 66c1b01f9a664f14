use std::io;
use std::path::{Path, PathBuf};

use files_core::ApiError;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;

use super::{PasteError, PhaseContext};
use crate::cleanup::CleanupGuard;

const COPY_BUFFER: usize = 1024 * 1024;

/// Sibling of `target` that receives bytes until the download completes.
pub(crate) fn partial_path(target: &Path) -> PathBuf {
    let mut partial = target.as_os_str().to_os_string();
    partial.push(".partial");
    PathBuf::from(partial)
}

/// Streams a response body into `target` through a partial file that is
/// renamed once the body ends. An interrupted or failed download leaves
/// nothing behind.
pub(crate) async fn download_response(
    response: reqwest::Response,
    target: &Path,
    ctx: &PhaseContext,
) -> Result<u64, PasteError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| PasteError::io(parent, err))?;
    }
    let partial = partial_path(target);
    let mut guard = CleanupGuard::for_path(&partial);
    let mut file = tokio::fs::File::create(&partial)
        .await
        .map_err(|err| PasteError::io(&partial, err))?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(ctx.interrupted()),
            next = stream.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk.map_err(|err| {
            PasteError::api(
                format!("download {}", target.display()),
                ApiError::Request(err),
            )
        })?;
        file.write_all(&chunk)
            .await
            .map_err(|err| PasteError::io(&partial, err))?;
        written += chunk.len() as u64;
        ctx.add_transferred(chunk.len() as u64);
    }

    file.flush()
        .await
        .map_err(|err| PasteError::io(&partial, err))?;
    file.sync_all()
        .await
        .map_err(|err| PasteError::io(&partial, err))?;
    drop(file);
    tokio::fs::rename(&partial, target)
        .await
        .map_err(|err| PasteError::io(target, err))?;
    guard.disarm();
    Ok(written)
}

/// Request body reading `path` that counts bytes as they are sent and aborts
/// once the phase is interrupted.
pub(crate) async fn upload_body(path: &Path, ctx: &PhaseContext) -> Result<reqwest::Body, PasteError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|err| PasteError::io(path, err))?;
    let ctx = ctx.clone();
    let stream = ReaderStream::new(file).map(move |chunk| {
        if ctx.is_stopped() {
            return Err(io::Error::other("transfer interrupted"));
        }
        if let Ok(bytes) = &chunk {
            ctx.add_transferred(bytes.len() as u64);
        }
        chunk
    });
    Ok(reqwest::Body::wrap_stream(stream))
}

/// Copies one local file through a partial file, checking for interruption
/// between buffers.
pub(crate) async fn copy_file(src: &Path, target: &Path, ctx: &PhaseContext) -> Result<u64, PasteError> {
    let partial = partial_path(target);
    let mut guard = CleanupGuard::for_path(&partial);
    let mut input = tokio::fs::File::open(src)
        .await
        .map_err(|err| PasteError::io(src, err))?;
    let mut output = tokio::fs::File::create(&partial)
        .await
        .map_err(|err| PasteError::io(&partial, err))?;
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut copied = 0u64;
    loop {
        ctx.check()?;
        let n = input
            .read(&mut buf)
            .await
            .map_err(|err| PasteError::io(src, err))?;
        if n == 0 {
            break;
        }
        output
            .write_all(&buf[..n])
            .await
            .map_err(|err| PasteError::io(&partial, err))?;
        copied += n as u64;
        ctx.add_transferred(n as u64);
    }
    output
        .sync_all()
        .await
        .map_err(|err| PasteError::io(&partial, err))?;
    drop(output);
    if let Ok(meta) = tokio::fs::metadata(src).await {
        let _ = tokio::fs::set_permissions(&partial, meta.permissions()).await;
    }
    tokio::fs::rename(&partial, target)
        .await
        .map_err(|err| PasteError::io(target, err))?;
    guard.disarm();
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/tmp/a.txt")),
            PathBuf::from("/tmp/a.txt.partial")
        );
    }
}
