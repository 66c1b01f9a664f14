use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::dupname::local_dup_name;
use super::plan::scan_local;
use super::space::{check_disk_space, check_usage_ceiling};
use super::stream::copy_file;
use super::{PasteError, PhaseContext, PhaseOutcome, TransferHandler};
use crate::cleanup::CleanupGuard;
use crate::config::EngineConfig;
use crate::storage::{Action, FileType};

/// Posix to posix on this node: `rsync` for copies (or a native copy when
/// rsync is disabled or missing), a rename for moves within a filesystem.
pub(crate) struct RsyncHandler;

#[async_trait]
impl TransferHandler for RsyncHandler {
    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutcome, PasteError> {
        let locator = ctx.locator();
        let src = locator.local_path(ctx.src())?;
        let dst_dir = locator.local_path(ctx.dst())?;
        let meta = tokio::fs::symlink_metadata(&src)
            .await
            .map_err(|err| PasteError::io(&src, err))?;
        let is_dir = meta.is_dir();

        tokio::fs::create_dir_all(&dst_dir)
            .await
            .map_err(|err| PasteError::io(&dst_dir, err))?;
        if ctx.dst().file_type == FileType::External {
            ensure_writable(&dst_dir).await?;
        }
        if is_dir && dst_dir.starts_with(&src) {
            return Err(PasteError::Invalid(format!(
                "cannot paste {} into itself",
                src.display()
            )));
        }

        let name = match ctx.resumed_destination() {
            Some(param) => param.name().to_string(),
            None => local_dup_name(&dst_dir, ctx.src().name(), !is_dir),
        };
        let target = dst_dir.join(&name);
        let output = ctx.dst().child(&name, is_dir);
        ctx.remember_destination(&output);

        let (_, total) = scan_local(&src).await?;
        ctx.set_total(total);

        if ctx.action() == Action::Move {
            match tokio::fs::rename(&src, &target).await {
                Ok(()) => {
                    ctx.set_transferred(total);
                    info!(task_id = ctx.task_id(), src = %src.display(), dst = %target.display(), "moved by rename");
                    return Ok(PhaseOutcome::moved(output));
                }
                Err(err) => {
                    debug!(error = %err, "rename failed, falling back to copy and delete");
                }
            }
        }

        check_usage_ceiling(&dst_dir, ctx.config().disk_usage_ceiling)?;
        check_disk_space(&dst_dir, total, true)?;

        let mut guard = CleanupGuard::for_path(&target);
        match rsync_binary(ctx.config()) {
            Some(binary) => run_rsync(&binary, &src, &target, is_dir, ctx).await?,
            None => native_copy(&src, &target, is_dir, ctx).await?,
        }
        guard.disarm();
        ctx.set_transferred(total);

        if ctx.action() == Action::Move {
            remove_local(&src).await?;
            return Ok(PhaseOutcome::moved(output));
        }
        Ok(PhaseOutcome::copied(output))
    }
}

fn rsync_binary(config: &EngineConfig) -> Option<PathBuf> {
    if !config.use_rsync {
        return None;
    }
    which::which("rsync").ok()
}

async fn run_rsync(
    binary: &Path,
    src: &Path,
    target: &Path,
    is_dir: bool,
    ctx: &PhaseContext,
) -> Result<(), PasteError> {
    let mut command = Command::new(binary);
    command.args(["-a", "--info=progress2", "--no-inc-recursive"]);
    if is_dir {
        command.arg(dir_arg(src)).arg(dir_arg(target));
    } else {
        command.arg(src).arg(target);
    }
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| PasteError::Tool {
            tool: "rsync",
            message: err.to_string(),
        })?;
    debug!(task_id = ctx.task_id(), src = %src.display(), dst = %target.display(), "rsync started");

    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut text = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut text).await;
        }
        text
    });

    if let Some(mut stdout) = child.stdout.take() {
        let mut buf = [0u8; 4096];
        let mut pending = Vec::new();
        loop {
            let read = tokio::select! {
                _ = ctx.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    stderr_task.abort();
                    return Err(ctx.interrupted());
                }
                read = stdout.read(&mut buf) => read,
            };
            let n = read.map_err(|err| PasteError::io(src, err))?;
            if n == 0 {
                break;
            }
            pending.extend_from_slice(&buf[..n]);
            while let Some(pos) = pending.iter().position(|b| *b == b'\r' || *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                if let Some(bytes) = parse_rsync_progress(&String::from_utf8_lossy(&line)) {
                    ctx.set_transferred(bytes);
                }
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|err| PasteError::io(src, err))?;
    let stderr = stderr_task.await.unwrap_or_default();
    if !status.success() {
        return Err(PasteError::Tool {
            tool: "rsync",
            message: format!("{status}: {}", stderr.trim()),
        });
    }
    Ok(())
}

fn dir_arg(path: &Path) -> std::ffi::OsString {
    let mut arg = path.as_os_str().to_os_string();
    arg.push("/");
    arg
}

/// Bytes copied so far from an `--info=progress2` line such as
/// `  1,234,567  42%   10.00MB/s    0:00:01`.
pub(crate) fn parse_rsync_progress(line: &str) -> Option<u64> {
    let mut fields = line.split_whitespace();
    let bytes = fields.next()?;
    let percent = fields.next()?;
    let digits = percent.strip_suffix('%')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if bytes.is_empty() || !bytes.bytes().all(|b| b.is_ascii_digit() || b == b',') {
        return None;
    }
    bytes.replace(',', "").parse().ok()
}

async fn native_copy(
    src: &Path,
    target: &Path,
    is_dir: bool,
    ctx: &PhaseContext,
) -> Result<(), PasteError> {
    if !is_dir {
        copy_file(src, target, ctx).await?;
        return Ok(());
    }
    let (entries, _) = scan_local(src).await?;
    tokio::fs::create_dir_all(target)
        .await
        .map_err(|err| PasteError::io(target, err))?;
    for entry in entries {
        ctx.check()?;
        let out = target.join(&entry.rel);
        if entry.is_dir {
            tokio::fs::create_dir_all(&out)
                .await
                .map_err(|err| PasteError::io(&out, err))?;
        } else {
            copy_file(&entry.path, &out, ctx).await?;
        }
    }
    Ok(())
}

/// Creates and removes a scratch file to surface permission problems before
/// any byte is copied.
async fn ensure_writable(dir: &Path) -> Result<(), PasteError> {
    let marker = dir.join(format!(".filesd-write-check-{}", std::process::id()));
    match tokio::fs::File::create(&marker).await {
        Ok(file) => {
            drop(file);
            if let Err(err) = tokio::fs::remove_file(&marker).await {
                warn!(path = %marker.display(), error = %err, "failed to remove write check");
            }
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            Err(PasteError::NotWritable(dir.to_path_buf()))
        }
        Err(err) => Err(PasteError::io(dir, err)),
    }
}

pub(crate) async fn remove_local(path: &Path) -> Result<(), PasteError> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(PasteError::io(path, err)),
    };
    let result = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PasteError::io(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paste::TaskType;
    use crate::paste::context::testing::{context, local};
    use crate::task::TaskState;
    use rstest::rstest;
    use std::sync::Arc;

    #[rstest]
    #[case("     32,768 100%   31.25MB/s    0:00:00 (xfr#1, to-chk=0/1)", Some(32_768))]
    #[case("  1,234,567  42%   10.00MB/s    0:00:01", Some(1_234_567))]
    #[case("0   0%    0.00kB/s    0:00:00", Some(0))]
    #[case("sending incremental file list", None)]
    #[case("", None)]
    fn parses_progress2_lines(#[case] line: &str, #[case] expected: Option<u64>) {
        assert_eq!(parse_rsync_progress(line), expected);
    }

    fn setup(use_rsync: bool, action: Action) -> (tempfile::TempDir, PhaseContext, Arc<TaskState>) {
        let dir = tempfile::tempdir().unwrap();
        let drive = dir.path().join("drive");
        let mut config = EngineConfig::for_roots("node-a", &drive, &dir.path().join("cache"));
        config.use_rsync = use_rsync;
        config.disk_usage_ceiling = None;
        std::fs::create_dir_all(drive.join("alice/a")).unwrap();
        std::fs::create_dir_all(drive.join("alice/c")).unwrap();
        std::fs::write(drive.join("alice/a/b.txt"), b"fresh").unwrap();
        std::fs::write(drive.join("alice/c/b.txt"), b"old").unwrap();
        let (ctx, state) = context(
            config,
            TaskType::Rsync,
            action,
            local("alice", "/a/b.txt"),
            local("alice", "/c/"),
        );
        (dir, ctx, state)
    }

    #[tokio::test]
    async fn native_copy_picks_dup_name() {
        let (dir, ctx, state) = setup(false, Action::Copy);
        let outcome = RsyncHandler.execute(&ctx).await.unwrap();
        assert_eq!(outcome.output.path, "/c/b(1).txt");
        assert!(!outcome.source_consumed);
        let alice = dir.path().join("drive/alice");
        assert_eq!(std::fs::read(alice.join("c/b(1).txt")).unwrap(), b"fresh");
        assert_eq!(std::fs::read(alice.join("c/b.txt")).unwrap(), b"old");
        let record = state.snapshot();
        assert_eq!(record.transferred, 5);
        assert_eq!(record.total_size, 5);
    }

    #[tokio::test]
    async fn move_renames_and_consumes_source() {
        let (dir, ctx, _) = setup(false, Action::Move);
        let outcome = RsyncHandler.execute(&ctx).await.unwrap();
        assert!(outcome.source_consumed);
        let alice = dir.path().join("drive/alice");
        assert!(!alice.join("a/b.txt").exists());
        assert_eq!(std::fs::read(alice.join("c/b(1).txt")).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn cancelled_copy_leaves_no_target() {
        let (dir, ctx, _) = setup(false, Action::Copy);
        ctx.token().cancel();
        let err = RsyncHandler.execute(&ctx).await.unwrap_err();
        assert!(matches!(err, PasteError::Cancelled));
        let alice = dir.path().join("drive/alice");
        assert!(!alice.join("c/b(1).txt").exists());
        assert!(!alice.join("c/b(1).txt.partial").exists());
    }

    #[tokio::test]
    async fn rejects_folder_into_itself() {
        let dir = tempfile::tempdir().unwrap();
        let drive = dir.path().join("drive");
        std::fs::create_dir_all(drive.join("alice/a/inner")).unwrap();
        let mut config = EngineConfig::for_roots("node-a", &drive, &dir.path().join("cache"));
        config.use_rsync = false;
        let (ctx, _) = context(
            config,
            TaskType::Rsync,
            Action::Copy,
            local("alice", "/a/"),
            local("alice", "/a/inner/"),
        );
        assert!(matches!(
            RsyncHandler.execute(&ctx).await,
            Err(PasteError::Invalid(_))
        ));
    }
}
