use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;

use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::extract::ExtractTarget;
use super::{
    ArchiveControl, ArchiveError, Checkpoint, CompressJob, CompressOutcome, ProgressFn,
    ProgressMeter, apply_mode, copy_with_cancel,
};
use crate::cleanup::CleanupGuard;

pub(super) fn compress(
    job: &CompressJob,
    control: &ArchiveControl,
    progress: ProgressFn,
) -> Result<CompressOutcome, ArchiveError> {
    let written = match job.checkpoint {
        Some(_) if job.output.exists() => written_entries(&job.output),
        _ => None,
    };
    match written {
        Some(written) => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&job.output)
                .map_err(|err| ArchiveError::io(&job.output, err))?;
            let writer = ZipWriter::new_append(file)?;
            debug!(output = %job.output.display(), entries = written.len(), "resuming zip");
            write_entries(writer, job, control, progress, &written)
        }
        None => {
            let file =
                File::create(&job.output).map_err(|err| ArchiveError::io(&job.output, err))?;
            let writer = ZipWriter::new(BufWriter::new(file));
            write_entries(writer, job, control, progress, &HashSet::new())
        }
    }
}

/// Entry names of an archive left behind by a paused run. An unreadable
/// archive is rebuilt from scratch.
fn written_entries(output: &Path) -> Option<HashSet<String>> {
    let file = File::open(output).ok()?;
    match ZipArchive::new(BufReader::new(file)) {
        Ok(archive) => Some(archive.file_names().map(str::to_string).collect()),
        Err(err) => {
            warn!(output = %output.display(), error = %err, "paused zip is unreadable, starting over");
            None
        }
    }
}

fn write_entries<W: Write + Seek>(
    mut writer: ZipWriter<W>,
    job: &CompressJob,
    control: &ArchiveControl,
    progress: ProgressFn,
    written: &HashSet<String>,
) -> Result<CompressOutcome, ArchiveError> {
    let mut guard = CleanupGuard::for_path(&job.output);
    let already: u64 = job
        .files
        .iter()
        .zip(&job.rel_paths)
        .filter(|(_, rel)| written.contains(rel.as_str()))
        .filter_map(|(file, _)| file.metadata().ok())
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
        .sum();
    let mut meter = ProgressMeter::new(job.total_size, progress).resumed(already);
    let start = job
        .rel_paths
        .iter()
        .position(|rel| !written.contains(rel.as_str()))
        .unwrap_or(job.rel_paths.len());

    for index in start..job.files.len() {
        if control.pause_requested() {
            writer.finish()?;
            guard.disarm();
            return Ok(CompressOutcome::Paused(Checkpoint {
                resume_index: index,
                resume_bytes: meter.done(),
            }));
        }
        if control.stop_requested() {
            drop(writer);
            return Err(ArchiveError::Cancelled);
        }

        let rel = &job.rel_paths[index];
        if written.contains(rel.as_str()) {
            continue;
        }
        let source = &job.files[index];
        if rel.ends_with('/') {
            writer.add_directory(rel.as_str(), SimpleFileOptions::default())?;
            continue;
        }
        let meta = source
            .metadata()
            .map_err(|err| ArchiveError::io(source, err))?;
        let mut options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(meta.len() >= u32::MAX as u64);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            options = options.unix_permissions(meta.permissions().mode());
        }
        writer.start_file(rel.as_str(), options)?;
        let mut input = File::open(source).map_err(|err| ArchiveError::io(source, err))?;
        // A pause waits for the current entry; only a cancel aborts it.
        copy_with_cancel(
            &mut input,
            &mut writer,
            source,
            || control.cancel_requested(),
            &mut meter,
        )?;
    }

    writer.finish()?;
    guard.disarm();
    meter.finish();
    Ok(CompressOutcome::Finished)
}

pub(super) fn uncompress(
    src: &Path,
    dest: &Path,
    overwrite: bool,
    control: &ArchiveControl,
    progress: ProgressFn,
) -> Result<(), ArchiveError> {
    let mut archive = open_archive(src)?;
    let total = file_bytes(&mut archive)?;

    let mut target = ExtractTarget::prepare(dest)?;
    let mut meter = ProgressMeter::new(total, progress);
    for index in 0..archive.len() {
        if control.stop_requested() {
            return Err(ArchiveError::Cancelled);
        }
        let mut entry = archive.by_index(index)?;
        let out = target.resolve(entry.name())?;
        if entry.is_dir() {
            target.create_dir(&out)?;
            continue;
        }
        if !overwrite && out.exists() {
            meter.advance(entry.size());
            continue;
        }
        let mut output = target.create_file(&out)?;
        copy_entry(&mut entry, &mut output, &out, control, &mut meter)?;
        apply_mode(&out, entry.unix_mode());
    }
    target.commit();
    meter.finish();
    Ok(())
}

pub(super) fn extracted_size(src: &Path) -> Result<u64, ArchiveError> {
    file_bytes(&mut open_archive(src)?)
}

fn open_archive(src: &Path) -> Result<ZipArchive<BufReader<File>>, ArchiveError> {
    let file = File::open(src).map_err(|err| ArchiveError::io(src, err))?;
    Ok(ZipArchive::new(BufReader::new(file))?)
}

/// Declared size of the regular entries, read from the central directory.
fn file_bytes<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<u64, ArchiveError> {
    let mut total = 0u64;
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;
        if !entry.is_dir() {
            total = total.saturating_add(entry.size());
        }
    }
    Ok(total)
}

fn copy_entry<R: Read>(
    entry: &mut R,
    output: &mut File,
    out: &Path,
    control: &ArchiveControl,
    meter: &mut ProgressMeter,
) -> Result<(), ArchiveError> {
    copy_with_cancel(entry, output, out, || control.stop_requested(), meter)?;
    output.flush().map_err(|err| ArchiveError::io(out, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::ArchiveFormat;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use tokio_util::sync::CancellationToken;

    fn no_progress() -> ProgressFn {
        Arc::new(|_, _| {})
    }

    fn sample_tree(root: &Path) -> PathBuf {
        let src = root.join("src");
        std::fs::create_dir_all(src.join("empty")).unwrap();
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("a.txt"), b"alpha").unwrap();
        std::fs::write(src.join("nested/b.bin"), vec![7u8; 4096]).unwrap();
        std::fs::write(src.join("zero.txt"), b"").unwrap();
        src
    }

    fn entries(path: &Path) -> Vec<(String, Vec<u8>)> {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut out = Vec::new();
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).unwrap();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            out.push((entry.name().to_string(), data));
        }
        out.sort();
        out
    }

    #[test]
    fn paused_and_resumed_zip_matches_uninterrupted_zip() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());

        let full = dir.path().join("full.zip");
        let job = CompressJob::from_sources(&[src.clone()], &full).unwrap();
        let control = ArchiveControl::default();
        assert_eq!(
            compress(&job, &control, no_progress()).unwrap(),
            CompressOutcome::Finished
        );

        let resumed = dir.path().join("resumed.zip");
        let mut job = CompressJob::from_sources(&[src], &resumed).unwrap();
        let token = CancellationToken::new();
        let pause = Arc::new(AtomicBool::new(true));
        let control = ArchiveControl::with_pause(token.clone(), pause);
        let trigger = token.clone();
        // Pause as soon as the first bytes are reported.
        let progress: ProgressFn = Arc::new(move |_, _| trigger.cancel());
        let checkpoint = match compress(&job, &control, progress).unwrap() {
            CompressOutcome::Paused(checkpoint) => checkpoint,
            other => panic!("expected pause, got {other:?}"),
        };
        assert!(checkpoint.resume_index > 0);
        assert!(checkpoint.resume_index < job.files.len());
        assert!(resumed.exists());

        job.checkpoint = Some(checkpoint);
        let control = ArchiveControl::default();
        assert_eq!(
            compress(&job, &control, no_progress()).unwrap(),
            CompressOutcome::Finished
        );
        assert_eq!(entries(&full), entries(&resumed));
    }

    #[test]
    fn cancel_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        let output = dir.path().join("out.zip");
        let job = CompressJob::from_sources(&[src], &output).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let control = ArchiveControl::new(token);
        let err = compress(&job, &control, no_progress()).unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn round_trip_keeps_empty_dirs_and_zero_byte_files() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        let output = dir.path().join("out.zip");
        let job = CompressJob::from_sources(&[src], &output).unwrap();
        ArchiveFormat::Zip
            .compress(job, ArchiveControl::default(), no_progress())
            .await
            .unwrap();

        let dest = dir.path().join("extracted");
        ArchiveFormat::Zip
            .uncompress(&output, &dest, true, ArchiveControl::default(), no_progress())
            .await
            .unwrap();
        assert_eq!(std::fs::read(dest.join("src/a.txt")).unwrap(), b"alpha");
        assert_eq!(std::fs::read(dest.join("src/nested/b.bin")).unwrap().len(), 4096);
        assert_eq!(std::fs::read(dest.join("src/zero.txt")).unwrap().len(), 0);
        assert!(dest.join("src/empty").is_dir());
    }

    #[tokio::test]
    async fn skips_existing_files_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        let output = dir.path().join("out.zip");
        let job = CompressJob::from_sources(&[src], &output).unwrap();
        ArchiveFormat::Zip
            .compress(job, ArchiveControl::default(), no_progress())
            .await
            .unwrap();

        let dest = dir.path().join("extracted");
        std::fs::create_dir_all(dest.join("src")).unwrap();
        std::fs::write(dest.join("src/a.txt"), b"mine").unwrap();
        ArchiveFormat::Zip
            .uncompress(&output, &dest, false, ArchiveControl::default(), no_progress())
            .await
            .unwrap();
        assert_eq!(std::fs::read(dest.join("src/a.txt")).unwrap(), b"mine");
        assert!(dest.join("src/nested/b.bin").exists());
    }

    #[test]
    fn cancelled_extraction_leaves_no_destination() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        let output = dir.path().join("out.zip");
        let job = CompressJob::from_sources(&[src], &output).unwrap();
        compress(&job, &ArchiveControl::default(), no_progress()).unwrap();

        let dest = dir.path().join("extracted");
        let token = CancellationToken::new();
        let control = ArchiveControl::new(token.clone());
        let progress: ProgressFn = Arc::new(move |_, _| token.cancel());
        let err = uncompress(&output, &dest, true, &control, progress).unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled));
        assert!(!dest.exists());
    }

    #[test]
    fn cancelled_extraction_into_existing_folder_removes_only_new_entries() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        let output = dir.path().join("out.zip");
        let job = CompressJob::from_sources(&[src], &output).unwrap();
        compress(&job, &ArchiveControl::default(), no_progress()).unwrap();

        let dest = dir.path().join("extracted");
        std::fs::create_dir_all(dest.join("src")).unwrap();
        std::fs::write(dest.join("src/mine.txt"), b"mine").unwrap();
        let token = CancellationToken::new();
        let control = ArchiveControl::new(token.clone());
        let progress: ProgressFn = Arc::new(move |_, _| token.cancel());
        let err = uncompress(&output, &dest, true, &control, progress).unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled));

        let left: Vec<PathBuf> = walkdir::WalkDir::new(&dest)
            .sort_by_file_name()
            .into_iter()
            .map(|entry| entry.unwrap().into_path())
            .collect();
        assert_eq!(
            left,
            vec![dest.clone(), dest.join("src"), dest.join("src/mine.txt")]
        );
    }
}
