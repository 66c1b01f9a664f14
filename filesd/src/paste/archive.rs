use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::dupname::generate_dup_name;
use super::plan::join_remote;
use super::space::{check_disk_space, check_usage_ceiling};
use super::{PasteError, PhaseContext, PhaseOutcome, TransferHandler};
use crate::compress::{ArchiveFormat, CompressJob, CompressOutcome, ProgressFn};

/// Keeps the whole archive suffix together: `out.tar.gz` becomes
/// `out(1).tar.gz`.
fn archive_dup_name(parent: &Path, name: &str, format: ArchiveFormat) -> String {
    let full = format!(".{}", format.extension());
    let suffix_len = if name.to_ascii_lowercase().ends_with(&full) {
        full.len()
    } else {
        name.rfind('.').map(|idx| name.len() - idx).unwrap_or(0)
    };
    let (stem, ext) = name.split_at(name.len() - suffix_len);
    let stem = generate_dup_name(
        |candidate| parent.join(format!("{candidate}{ext}")).symlink_metadata().is_ok(),
        stem,
        false,
    );
    format!("{stem}{ext}")
}

fn archive_format(path: &Path) -> Result<ArchiveFormat, PasteError> {
    ArchiveFormat::from_path(path).ok_or_else(|| {
        PasteError::Unsupported(format!("{} is not a supported archive", path.display()))
    })
}

/// Packs the task's sources into the archive named by `dst`. The format
/// follows the archive's extension.
pub(crate) struct CompressHandler;

#[async_trait]
impl TransferHandler for CompressHandler {
    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutcome, PasteError> {
        let locator = ctx.locator();
        let sources = ctx
            .sources()
            .iter()
            .map(|param| locator.local_path(param))
            .collect::<Result<Vec<PathBuf>, _>>()?;
        let requested = locator.local_path(ctx.dst())?;
        let format = archive_format(&requested)?;
        let parent = requested
            .parent()
            .map(PathBuf::from)
            .ok_or_else(|| PasteError::Invalid(format!("{} has no parent", requested.display())))?;
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|err| PasteError::io(&parent, err))?;

        let name = match ctx.resumed_destination() {
            Some(param) => param.name().to_string(),
            None => archive_dup_name(&parent, ctx.dst().name(), format),
        };
        let output_path = parent.join(&name);
        let output = ctx
            .dst()
            .with_path(join_remote(&ctx.dst().parent_path(), &name));
        ctx.remember_destination(&output);

        let scan_output = output_path.clone();
        let mut job = tokio::task::spawn_blocking(move || {
            CompressJob::from_sources(&sources, &scan_output)
        })
        .await
        .map_err(|err| PasteError::io(&output_path, std::io::Error::other(err)))??;
        ctx.set_total(job.total_size);
        check_usage_ceiling(&parent, ctx.config().disk_usage_ceiling)?;
        check_disk_space(&parent, job.total_size, true)?;

        job.checkpoint = ctx.checkpoint();
        if let Some(checkpoint) = job.checkpoint {
            ctx.set_transferred(checkpoint.resume_bytes);
        }
        match format
            .compress(job, ctx.archive_control(), ctx.archive_progress())
            .await?
        {
            CompressOutcome::Finished => {
                ctx.set_checkpoint(None);
                info!(task_id = ctx.task_id(), output = %output_path.display(), format = format.extension(), "archive written");
                Ok(PhaseOutcome::copied(output))
            }
            CompressOutcome::Paused(checkpoint) => {
                info!(task_id = ctx.task_id(), resume_index = checkpoint.resume_index, "compression paused");
                ctx.set_checkpoint(Some(checkpoint));
                Err(PasteError::Paused)
            }
        }
    }
}

/// Extracts the archive named by `src` into the `dst` folder.
pub(crate) struct UncompressHandler {
    pub overwrite: bool,
}

#[async_trait]
impl TransferHandler for UncompressHandler {
    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutcome, PasteError> {
        let archive = ctx.locator().local_path(ctx.src())?;
        let dest = ctx.locator().local_path(ctx.dst())?;
        let format = archive_format(&archive)?;
        let archive_size = tokio::fs::metadata(&archive)
            .await
            .map_err(|err| PasteError::io(&archive, err))?
            .len();
        // 7z and rar listings need the archiver itself; the archive size
        // stands in for them.
        let size = format
            .extracted_size(&archive)
            .await?
            .unwrap_or(archive_size);
        ctx.set_total(size);
        check_usage_ceiling(&dest, ctx.config().disk_usage_ceiling)?;
        check_disk_space(&dest, size, true)?;

        let sink = ctx.clone();
        let progress: ProgressFn = Arc::new(move |percent, _| {
            sink.set_transferred(size * u64::from(percent) / 100);
        });
        format
            .uncompress(&archive, &dest, self.overwrite, ctx.archive_control(), progress)
            .await?;
        ctx.set_transferred(size);
        info!(task_id = ctx.task_id(), archive = %archive.display(), dest = %dest.display(), "archive extracted");
        Ok(PhaseOutcome::copied(ctx.dst().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::paste::TaskType;
    use crate::paste::context::testing::{context, local};
    use crate::storage::Action;

    #[tokio::test]
    async fn compresses_then_extracts_through_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let drive = dir.path().join("drive");
        std::fs::create_dir_all(drive.join("alice/docs/empty")).unwrap();
        std::fs::write(drive.join("alice/docs/a.txt"), b"alpha").unwrap();
        std::fs::write(drive.join("alice/out.tar.gz"), b"taken").unwrap();
        let mut config = EngineConfig::for_roots("n", &drive, &dir.path().join("cache"));
        config.disk_usage_ceiling = None;

        let (ctx, state) = context(
            config.clone(),
            TaskType::Compress,
            Action::Copy,
            local("alice", "/docs/"),
            local("alice", "/out.tar.gz"),
        );
        let outcome = CompressHandler.execute(&ctx).await.unwrap();
        assert_eq!(outcome.output.path, "/out(1).tar.gz");
        assert_eq!(state.snapshot().transferred, 5);

        let (ctx, _) = context(
            config,
            TaskType::Uncompress { overwrite: false },
            Action::Copy,
            local("alice", "/out(1).tar.gz"),
            local("alice", "/restored/"),
        );
        UncompressHandler { overwrite: false }
            .execute(&ctx)
            .await
            .unwrap();
        let restored = drive.join("alice/restored/docs");
        assert_eq!(std::fs::read(restored.join("a.txt")).unwrap(), b"alpha");
        assert!(restored.join("empty").is_dir());
    }

    #[tokio::test]
    async fn extraction_larger_than_free_space_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let drive = dir.path().join("drive");
        std::fs::create_dir_all(drive.join("alice")).unwrap();
        let archive = drive.join("alice/huge.7z");
        // Sparse, so it takes no real space.
        std::fs::File::create(&archive)
            .unwrap()
            .set_len(8 << 40)
            .unwrap();
        let mut config = EngineConfig::for_roots("n", &drive, &dir.path().join("cache"));
        config.disk_usage_ceiling = None;

        let (ctx, state) = context(
            config,
            TaskType::Uncompress { overwrite: false },
            Action::Copy,
            local("alice", "/huge.7z"),
            local("alice", "/out/"),
        );
        let err = UncompressHandler { overwrite: false }
            .execute(&ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, PasteError::Space(_)), "{err:?}");
        assert_eq!(state.snapshot().total_size, 8 << 40);
        assert!(!drive.join("alice/out").exists());
    }

    #[tokio::test]
    async fn extraction_total_is_the_uncompressed_size() {
        let dir = tempfile::tempdir().unwrap();
        let drive = dir.path().join("drive");
        std::fs::create_dir_all(drive.join("alice/docs")).unwrap();
        std::fs::write(drive.join("alice/docs/a.txt"), vec![b'a'; 3000]).unwrap();
        let mut config = EngineConfig::for_roots("n", &drive, &dir.path().join("cache"));
        config.disk_usage_ceiling = None;

        let (ctx, _) = context(
            config.clone(),
            TaskType::Compress,
            Action::Copy,
            local("alice", "/docs/"),
            local("alice", "/docs.tar.gz"),
        );
        CompressHandler.execute(&ctx).await.unwrap();
        assert!(std::fs::metadata(drive.join("alice/docs.tar.gz")).unwrap().len() < 3000);

        let (ctx, state) = context(
            config,
            TaskType::Uncompress { overwrite: false },
            Action::Copy,
            local("alice", "/docs.tar.gz"),
            local("alice", "/restored/"),
        );
        UncompressHandler { overwrite: false }
            .execute(&ctx)
            .await
            .unwrap();
        let snapshot = state.snapshot();
        assert_eq!(snapshot.total_size, 3000);
        assert_eq!(snapshot.transferred, 3000);
    }

    #[test]
    fn archive_names_keep_their_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("out.tar.gz"), b"").unwrap();
        std::fs::write(dir.path().join("pack.tgz"), b"").unwrap();
        assert_eq!(
            archive_dup_name(dir.path(), "out.tar.gz", ArchiveFormat::TarGz),
            "out(1).tar.gz"
        );
        assert_eq!(
            archive_dup_name(dir.path(), "pack.tgz", ArchiveFormat::TarGz),
            "pack(1).tgz"
        );
        assert_eq!(
            archive_dup_name(dir.path(), "new.zip", ArchiveFormat::Zip),
            "new.zip"
        );
    }

    #[tokio::test]
    async fn rejects_unknown_archive_names() {
        let dir = tempfile::tempdir().unwrap();
        let drive = dir.path().join("drive");
        std::fs::create_dir_all(drive.join("alice/docs")).unwrap();
        let config = EngineConfig::for_roots("n", &drive, &dir.path().join("cache"));
        let (ctx, _) = context(
            config,
            TaskType::Compress,
            Action::Copy,
            local("alice", "/docs/"),
            local("alice", "/out.gz"),
        );
        assert!(matches!(
            CompressHandler.execute(&ctx).await,
            Err(PasteError::Unsupported(_))
        ));
    }
}
