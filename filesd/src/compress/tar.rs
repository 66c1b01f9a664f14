use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tar::{Archive, Builder, EntryType, Header};
use tracing::debug;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use super::extract::ExtractTarget;
use super::{
    ArchiveControl, ArchiveError, ArchiveFormat, CompressJob, ProgressFn, ProgressMeter,
    apply_mode, copy_with_cancel,
};
use crate::cleanup::CleanupGuard;

const XZ_LEVEL: u32 = 6;

/// Output stream of a tarball with its compression filter.
enum TarSink {
    Plain(BufWriter<File>),
    Gz(GzEncoder<BufWriter<File>>),
    Bz2(BzEncoder<BufWriter<File>>),
    Xz(XzEncoder<BufWriter<File>>),
}

impl TarSink {
    fn create(format: ArchiveFormat, path: &Path) -> Result<Self, ArchiveError> {
        let file = File::create(path).map_err(|err| ArchiveError::io(path, err))?;
        let file = BufWriter::new(file);
        Ok(match format {
            ArchiveFormat::Tar => TarSink::Plain(file),
            ArchiveFormat::TarGz => TarSink::Gz(GzEncoder::new(file, flate2::Compression::default())),
            ArchiveFormat::TarBz2 => {
                TarSink::Bz2(BzEncoder::new(file, bzip2::Compression::default()))
            }
            ArchiveFormat::TarXz => TarSink::Xz(XzEncoder::new(file, XZ_LEVEL)),
            other => return Err(ArchiveError::Unsupported(other.extension().to_string())),
        })
    }

    fn finish(self) -> io::Result<()> {
        let mut inner = match self {
            TarSink::Plain(file) => file,
            TarSink::Gz(encoder) => encoder.finish()?,
            TarSink::Bz2(encoder) => encoder.finish()?,
            TarSink::Xz(encoder) => encoder.finish()?,
        };
        inner.flush()?;
        inner.get_ref().sync_all()
    }
}

impl Write for TarSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TarSink::Plain(w) => w.write(buf),
            TarSink::Gz(w) => w.write(buf),
            TarSink::Bz2(w) => w.write(buf),
            TarSink::Xz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TarSink::Plain(w) => w.flush(),
            TarSink::Gz(w) => w.flush(),
            TarSink::Bz2(w) => w.flush(),
            TarSink::Xz(w) => w.flush(),
        }
    }
}

fn open_source(format: ArchiveFormat, path: &Path) -> Result<Box<dyn Read>, ArchiveError> {
    let file = File::open(path).map_err(|err| ArchiveError::io(path, err))?;
    let file = BufReader::new(file);
    Ok(match format {
        ArchiveFormat::Tar => Box::new(file),
        ArchiveFormat::TarGz => Box::new(GzDecoder::new(file)),
        ArchiveFormat::TarBz2 => Box::new(BzDecoder::new(file)),
        ArchiveFormat::TarXz => Box::new(XzDecoder::new(file)),
        other => return Err(ArchiveError::Unsupported(other.extension().to_string())),
    })
}

/// File reader that counts bytes into the meter and fails once a stop is
/// requested.
struct MeteredReader<'a> {
    inner: File,
    control: &'a ArchiveControl,
    meter: &'a mut ProgressMeter,
}

impl Read for MeteredReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.control.stop_requested() {
            return Err(io::Error::other("archive operation cancelled"));
        }
        let n = self.inner.read(buf)?;
        self.meter.advance(n as u64);
        Ok(n)
    }
}

pub(super) fn compress(
    format: ArchiveFormat,
    job: &CompressJob,
    control: &ArchiveControl,
    progress: ProgressFn,
) -> Result<(), ArchiveError> {
    let mut guard = CleanupGuard::for_path(&job.output);
    let mut builder = Builder::new(TarSink::create(format, &job.output)?);
    builder.follow_symlinks(false);
    let mut meter = ProgressMeter::new(job.total_size, progress);

    for (source, rel) in job.files.iter().zip(&job.rel_paths) {
        if control.stop_requested() {
            return Err(ArchiveError::Cancelled);
        }
        let result = if rel.ends_with('/') {
            builder.append_dir(rel.trim_end_matches('/'), source)
        } else {
            let meta = source
                .metadata()
                .map_err(|err| ArchiveError::io(source, err))?;
            let mut header = Header::new_gnu();
            header.set_metadata(&meta);
            header.set_entry_type(EntryType::Regular);
            header.set_size(meta.len());
            let inner = File::open(source).map_err(|err| ArchiveError::io(source, err))?;
            let reader = MeteredReader {
                inner,
                control,
                meter: &mut meter,
            };
            builder.append_data(&mut header, rel, reader)
        };
        if let Err(err) = result {
            if control.stop_requested() {
                return Err(ArchiveError::Cancelled);
            }
            return Err(ArchiveError::io(source, err));
        }
    }

    let sink = builder
        .into_inner()
        .map_err(|err| ArchiveError::io(&job.output, err))?;
    sink.finish()
        .map_err(|err| ArchiveError::io(&job.output, err))?;
    guard.disarm();
    meter.finish();
    Ok(())
}

pub(super) fn uncompress(
    format: ArchiveFormat,
    src: &Path,
    dest: &Path,
    overwrite: bool,
    control: &ArchiveControl,
    progress: ProgressFn,
) -> Result<(), ArchiveError> {
    let total = regular_file_bytes(format, src)?;
    let mut target = ExtractTarget::prepare(dest)?;
    let mut meter = ProgressMeter::new(total, progress);

    let mut archive = Archive::new(open_source(format, src)?);
    let entries = archive.entries().map_err(|err| ArchiveError::io(src, err))?;
    for entry in entries {
        if control.stop_requested() {
            return Err(ArchiveError::Cancelled);
        }
        let mut entry = entry.map_err(|err| ArchiveError::io(src, err))?;
        let name = entry
            .path()
            .map_err(|err| ArchiveError::io(src, err))?
            .to_string_lossy()
            .into_owned();
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            let out = target.resolve(&name)?;
            target.create_dir(&out)?;
            continue;
        }
        if !kind.is_file() {
            debug!(entry = %name, kind = ?kind, "skipping non-regular tar entry");
            continue;
        }
        let out = target.resolve(&name)?;
        let size = entry.size();
        if !overwrite && out.exists() {
            meter.advance(size);
            continue;
        }
        let mut output = target.create_file(&out)?;
        copy_with_cancel(
            &mut entry,
            &mut output,
            &out,
            || control.stop_requested(),
            &mut meter,
        )?;
        apply_mode(&out, entry.header().mode().ok());
    }
    target.commit();
    meter.finish();
    Ok(())
}

/// First pass: sizes of the regular files, read from headers only.
pub(super) fn regular_file_bytes(format: ArchiveFormat, src: &Path) -> Result<u64, ArchiveError> {
    let mut archive = Archive::new(open_source(format, src)?);
    let mut total = 0u64;
    for entry in archive.entries().map_err(|err| ArchiveError::io(src, err))? {
        let entry = entry.map_err(|err| ArchiveError::io(src, err))?;
        if entry.header().entry_type().is_file() {
            total += entry.size();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;

    fn sample_tree(root: &Path) -> PathBuf {
        let src = root.join("photos");
        std::fs::create_dir_all(src.join("empty")).unwrap();
        std::fs::create_dir_all(src.join("2024")).unwrap();
        std::fs::write(src.join("2024/a.jpg"), vec![1u8; 10_000]).unwrap();
        std::fs::write(src.join("notes.txt"), b"trip notes").unwrap();
        std::fs::write(src.join("zero"), b"").unwrap();
        src
    }

    #[rstest]
    #[case(ArchiveFormat::Tar, "out.tar")]
    #[case(ArchiveFormat::TarGz, "out.tar.gz")]
    #[case(ArchiveFormat::TarBz2, "out.tar.bz2")]
    #[case(ArchiveFormat::TarXz, "out.tar.xz")]
    fn round_trips_every_filter(#[case] format: ArchiveFormat, #[case] name: &str) {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        let output = dir.path().join(name);
        let job = CompressJob::from_sources(&[src], &output).unwrap();

        let percents = Arc::new(Mutex::new(Vec::new()));
        let sink = percents.clone();
        let progress: ProgressFn = Arc::new(move |p, _| sink.lock().unwrap().push(p));
        compress(format, &job, &ArchiveControl::default(), progress).unwrap();
        assert_eq!(percents.lock().unwrap().last(), Some(&100));

        let dest = dir.path().join("out");
        let none: ProgressFn = Arc::new(|_, _| {});
        uncompress(format, &output, &dest, true, &ArchiveControl::default(), none).unwrap();
        assert_eq!(std::fs::read(dest.join("photos/2024/a.jpg")).unwrap().len(), 10_000);
        assert_eq!(std::fs::read(dest.join("photos/notes.txt")).unwrap(), b"trip notes");
        assert_eq!(std::fs::metadata(dest.join("photos/zero")).unwrap().len(), 0);
        assert!(dest.join("photos/empty").is_dir());
    }

    #[test]
    fn cancelled_compress_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        let output = dir.path().join("out.tar.gz");
        let job = CompressJob::from_sources(&[src], &output).unwrap();
        let token = CancellationToken::new();
        let control = ArchiveControl::new(token.clone());
        let progress: ProgressFn = Arc::new(move |_, _| token.cancel());
        let err = compress(ArchiveFormat::TarGz, &job, &control, progress).unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled));
        assert!(!output.exists());
    }

    #[test]
    fn cancelled_extract_keeps_existing_destination_clean() {
        let dir = tempfile::tempdir().unwrap();
        let src = sample_tree(dir.path());
        let output = dir.path().join("out.tar");
        let job = CompressJob::from_sources(&[src], &output).unwrap();
        compress(ArchiveFormat::Tar, &job, &ArchiveControl::default(), Arc::new(|_, _| {}))
            .unwrap();

        let dest = dir.path().join("dest");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("mine.txt"), b"keep").unwrap();
        let token = CancellationToken::new();
        let control = ArchiveControl::new(token.clone());
        let progress: ProgressFn = Arc::new(move |_, _| token.cancel());
        let err = uncompress(ArchiveFormat::Tar, &output, &dest, true, &control, progress)
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled));
        assert!(dest.join("mine.txt").exists());
        assert!(!dest.join("photos").exists());
    }
}
