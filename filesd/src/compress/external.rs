use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::extract::ExtractTarget;
use super::{ArchiveControl, ArchiveError, CompressJob, ProgressFn, ProgressMeter};
use crate::cleanup::CleanupGuard;

const STDERR_TAIL: usize = 5;

const ERROR_MARKERS: &[&str] = &[
    "error:",
    "cannot open",
    "can not open",
    "cannot create",
    "can not create",
    "is not archive",
    "is not rar archive",
    "unexpected end of archive",
    "checksum error",
    "crc failed",
    "data error",
    "wrong password",
    "incorrect password",
];

/// Archivers driven as subprocesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveTool {
    SevenZip,
    Rar,
}

impl ArchiveTool {
    pub fn name(&self) -> &'static str {
        match self {
            ArchiveTool::SevenZip => "7z",
            ArchiveTool::Rar => "rar",
        }
    }

    fn env_var(&self) -> &'static str {
        match self {
            ArchiveTool::SevenZip => "FILES_7Z_BIN",
            ArchiveTool::Rar => "FILES_RAR_BIN",
        }
    }

    fn executables(&self) -> &'static [&'static str] {
        match self {
            ArchiveTool::SevenZip => &["7z", "7zz", "7za"],
            ArchiveTool::Rar => &["rar"],
        }
    }

    fn standard_paths(&self) -> &'static [&'static str] {
        match self {
            ArchiveTool::SevenZip => &[
                "/usr/bin/7z",
                "/usr/local/bin/7z",
                "/opt/homebrew/bin/7z",
                "/usr/lib/p7zip/7z",
            ],
            ArchiveTool::Rar => &["/usr/bin/rar", "/usr/local/bin/rar", "/opt/homebrew/bin/rar"],
        }
    }

    fn install_hint(&self) -> &'static str {
        match self {
            ArchiveTool::SevenZip => "e.g. `apt install p7zip-full`",
            ArchiveTool::Rar => "e.g. `apt install rar`",
        }
    }

    fn missing(&self) -> ArchiveError {
        ArchiveError::MissingBinary {
            binary: self.name(),
            hint: self.install_hint(),
            env: self.env_var(),
        }
    }
}

/// Finds the archiver: environment override first, then well-known install
/// locations, then `PATH`.
pub fn locate_binary(tool: ArchiveTool) -> Result<PathBuf, ArchiveError> {
    locate_with_override(tool, std::env::var_os(tool.env_var()))
}

fn locate_with_override(
    tool: ArchiveTool,
    override_path: Option<OsString>,
) -> Result<PathBuf, ArchiveError> {
    if let Some(value) = override_path.filter(|value| !value.is_empty()) {
        let path = PathBuf::from(value);
        if path.is_file() {
            return Ok(path);
        }
        warn!(tool = tool.name(), path = %path.display(), "configured archiver does not exist");
        return Err(tool.missing());
    }
    if let Some(path) = tool
        .standard_paths()
        .iter()
        .map(Path::new)
        .find(|path| path.is_file())
    {
        return Ok(path.to_path_buf());
    }
    tool.executables()
        .iter()
        .find_map(|exe| which::which(exe).ok())
        .ok_or_else(|| tool.missing())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Extract,
}

pub(super) async fn compress(
    tool: ArchiveTool,
    job: &CompressJob,
    control: &ArchiveControl,
    progress: ProgressFn,
) -> Result<(), ArchiveError> {
    let binary = locate_binary(tool)?;
    let output =
        std::path::absolute(&job.output).map_err(|err| ArchiveError::io(&job.output, err))?;
    let staging = tempfile::Builder::new()
        .prefix(".archive-staging-")
        .tempdir()
        .map_err(|err| ArchiveError::io(&std::env::temp_dir(), err))?;

    let files = job.files.clone();
    let rel_paths = job.rel_paths.clone();
    let stage_root = staging.path().to_path_buf();
    let stage_control = control.clone();
    tokio::task::spawn_blocking(move || {
        stage_inputs(&files, &rel_paths, &stage_root, &stage_control)
    })
    .await??;

    if output.exists() {
        std::fs::remove_file(&output).map_err(|err| ArchiveError::io(&output, err))?;
    }
    let mut guard = CleanupGuard::for_path(&output);

    let mut args: Vec<OsString> = match tool {
        ArchiveTool::SevenZip => ["a", "-y", "-bb1", "-bsp0"].map(OsString::from).to_vec(),
        ArchiveTool::Rar => ["a", "-r", "-y", "-idcdp"].map(OsString::from).to_vec(),
    };
    args.push(output.clone().into_os_string());
    args.extend(top_level_names(&job.rel_paths).into_iter().map(OsString::from));

    let sizes: HashMap<&str, u64> = job
        .files
        .iter()
        .zip(&job.rel_paths)
        .filter(|(_, rel)| !rel.ends_with('/'))
        .map(|(file, rel)| (rel.as_str(), file.metadata().map(|m| m.len()).unwrap_or(0)))
        .collect();
    let mut meter = ProgressMeter::new(job.total_size, progress);
    run_tool(tool, &binary, &args, Some(staging.path()), control, |line| {
        if let Some(size) = parse_marker(tool, Op::Add, line)
            .and_then(|path| sizes.get(path.as_str()).copied())
        {
            meter.advance(size);
        }
    })
    .await?;

    guard.disarm();
    meter.finish();
    Ok(())
}

pub(super) async fn uncompress(
    tool: ArchiveTool,
    src: &Path,
    dest: &Path,
    overwrite: bool,
    control: &ArchiveControl,
    progress: ProgressFn,
) -> Result<(), ArchiveError> {
    let binary = locate_binary(tool)?;
    let src = std::path::absolute(src).map_err(|err| ArchiveError::io(src, err))?;
    let dest = std::path::absolute(dest).map_err(|err| ArchiveError::io(dest, err))?;

    let list_args: Vec<OsString> = match tool {
        ArchiveTool::SevenZip => vec!["l".into(), "-slt".into(), src.clone().into_os_string()],
        ArchiveTool::Rar => vec!["lt".into(), src.clone().into_os_string()],
    };
    let mut listing = Vec::new();
    run_tool(tool, &binary, &list_args, None, control, |line| {
        listing.push(line.to_string())
    })
    .await?;
    let entries = match tool {
        ArchiveTool::SevenZip => parse_7z_listing(&listing),
        ArchiveTool::Rar => parse_rar_listing(&listing),
    };
    let sizes: HashMap<String, u64> = entries
        .iter()
        .filter(|entry| !entry.is_dir)
        .map(|entry| (entry.path.clone(), entry.size))
        .collect();
    let total = sizes.values().sum();

    let mut target = ExtractTarget::prepare(&dest)?;
    target.expect_entries(entries.iter().map(|entry| entry.path.as_str()))?;
    let extract_args: Vec<OsString> = match tool {
        ArchiveTool::SevenZip => vec![
            "x".into(),
            "-y".into(),
            "-bb1".into(),
            "-bsp0".into(),
            OsString::from(if overwrite { "-aoa" } else { "-aos" }),
            prefixed("-o", target.dest()),
            src.clone().into_os_string(),
        ],
        ArchiveTool::Rar => {
            let mut dest_arg = target.dest().as_os_str().to_owned();
            dest_arg.push("/");
            vec![
                "x".into(),
                OsString::from(if overwrite { "-o+" } else { "-o-" }),
                "-idcdp".into(),
                src.clone().into_os_string(),
                dest_arg,
            ]
        }
    };
    let dest_prefix = format!("{}/", target.dest().display());
    let mut meter = ProgressMeter::new(total, progress);
    run_tool(tool, &binary, &extract_args, None, control, |line| {
        if let Some(path) = parse_marker(tool, Op::Extract, line) {
            let rel = path.strip_prefix(&dest_prefix).unwrap_or(&path);
            if let Some(size) = sizes.get(rel) {
                meter.advance(*size);
            }
        }
    })
    .await?;

    target.commit();
    meter.finish();
    Ok(())
}

fn prefixed(flag: &str, path: &Path) -> OsString {
    let mut arg = OsString::from(flag);
    arg.push(path.as_os_str());
    arg
}

/// Copies (or hard-links) the inputs under their archive names, keeping
/// empty directories.
fn stage_inputs(
    files: &[PathBuf],
    rel_paths: &[String],
    root: &Path,
    control: &ArchiveControl,
) -> Result<(), ArchiveError> {
    for (source, rel) in files.iter().zip(rel_paths) {
        if control.stop_requested() {
            return Err(ArchiveError::Cancelled);
        }
        let target = root.join(super::extract::sanitize_entry(rel.trim_end_matches('/'))?);
        if rel.ends_with('/') {
            std::fs::create_dir_all(&target).map_err(|err| ArchiveError::io(&target, err))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|err| ArchiveError::io(parent, err))?;
        }
        if std::fs::hard_link(source, &target).is_err() {
            std::fs::copy(source, &target).map_err(|err| ArchiveError::io(source, err))?;
        }
    }
    Ok(())
}

fn top_level_names(rel_paths: &[String]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for rel in rel_paths {
        let first = rel.split('/').next().unwrap_or_default();
        if !first.is_empty() && !names.iter().any(|name| name == first) {
            names.push(first.to_string());
        }
    }
    names
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Runs the archiver once. Output lines are pumped by two reader tasks; the
/// loop here parses them and watches for cancellation, killing the child on
/// cancel or on a recognised error line. Readers are joined before return.
async fn run_tool(
    tool: ArchiveTool,
    binary: &Path,
    args: &[OsString],
    cwd: Option<&Path>,
    control: &ArchiveControl,
    mut on_line: impl FnMut(&str),
) -> Result<(), ArchiveError> {
    debug!(tool = tool.name(), args = ?args, "running archiver");
    let mut command = Command::new(binary);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    let mut child = command.spawn().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            tool.missing()
        } else {
            ArchiveError::io(binary, err)
        }
    })?;

    let (tx, mut rx) = mpsc::channel::<(Stream, String)>(256);
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(pump_lines(stdout, Stream::Stdout, tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(pump_lines(stderr, Stream::Stderr, tx.clone())));
    }
    drop(tx);

    let mut cancelled = false;
    let mut failure: Option<String> = None;
    let mut stderr_tail: Vec<String> = Vec::new();
    loop {
        tokio::select! {
            _ = control.token().cancelled(), if !cancelled => {
                cancelled = true;
                let _ = child.start_kill();
            }
            line = rx.recv() => {
                let Some((stream, line)) = line else { break };
                if let Some(message) = detect_error(tool, &line) {
                    if failure.is_none() {
                        failure = Some(message);
                        let _ = child.start_kill();
                    }
                    continue;
                }
                match stream {
                    Stream::Stdout => on_line(&line),
                    Stream::Stderr if !line.trim().is_empty() => {
                        if stderr_tail.len() == STDERR_TAIL {
                            stderr_tail.remove(0);
                        }
                        stderr_tail.push(line);
                    }
                    Stream::Stderr => {}
                }
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|err| ArchiveError::io(binary, err))?;
    for reader in readers {
        reader.await?;
    }

    if cancelled || control.stop_requested() {
        return Err(ArchiveError::Cancelled);
    }
    if let Some(message) = failure {
        return Err(ArchiveError::Tool {
            tool: tool.name(),
            message,
        });
    }
    if !status.success() {
        let detail = if stderr_tail.is_empty() {
            String::new()
        } else {
            format!(": {}", stderr_tail.join("; "))
        };
        return Err(ArchiveError::Tool {
            tool: tool.name(),
            message: format!("exited with {status}{detail}"),
        });
    }
    Ok(())
}

async fn pump_lines<R: AsyncRead + Unpin>(
    reader: R,
    stream: Stream,
    tx: mpsc::Sender<(Stream, String)>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                if tx.send((stream, line)).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Error text reported by the archiver. Lines naming an entry are never
/// errors, whatever the entry is called.
fn detect_error(tool: ArchiveTool, line: &str) -> Option<String> {
    if names_entry(tool, line) {
        return None;
    }
    let lower = line.to_ascii_lowercase();
    ERROR_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
        .then(|| line.trim().to_string())
}

fn names_entry(tool: ArchiveTool, line: &str) -> bool {
    if [Op::Add, Op::Extract]
        .into_iter()
        .any(|op| parse_marker(tool, op, line).is_some())
    {
        return true;
    }
    let line = line.trim_start();
    match tool {
        ArchiveTool::SevenZip => line.starts_with("Path = "),
        ArchiveTool::Rar => line.starts_with("Name:"),
    }
}

/// Path reported for one processed entry, if the line is a per-file marker.
fn parse_marker(tool: ArchiveTool, op: Op, line: &str) -> Option<String> {
    let path = match (tool, op) {
        (ArchiveTool::SevenZip, Op::Add) => line.strip_prefix("+ ")?,
        (ArchiveTool::SevenZip, Op::Extract) => line.strip_prefix("- ")?,
        (ArchiveTool::Rar, Op::Add) => strip_ok(line.strip_prefix("Adding")?)?,
        (ArchiveTool::Rar, Op::Extract) => {
            if line.starts_with("Extracting from") {
                return None;
            }
            strip_ok(line.strip_prefix("Extracting")?)?
        }
    };
    let path = path.trim();
    (!path.is_empty()).then(|| path.to_string())
}

fn strip_ok(rest: &str) -> Option<&str> {
    rest.trim_end().strip_suffix("OK")
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ListedEntry {
    path: String,
    size: u64,
    is_dir: bool,
}

/// `7z l -slt`: technical blocks after the `----------` separator.
fn parse_7z_listing(lines: &[String]) -> Vec<ListedEntry> {
    let mut entries = Vec::new();
    let mut current: Option<ListedEntry> = None;
    let mut in_body = false;
    for line in lines {
        if line.starts_with("----------") {
            in_body = true;
            continue;
        }
        if !in_body {
            continue;
        }
        if let Some(path) = line.strip_prefix("Path = ") {
            entries.extend(current.take());
            current = Some(ListedEntry {
                path: path.to_string(),
                size: 0,
                is_dir: false,
            });
        } else if let Some(entry) = current.as_mut() {
            if let Some(size) = line.strip_prefix("Size = ") {
                entry.size = size.trim().parse().unwrap_or(0);
            } else if let Some(folder) = line.strip_prefix("Folder = ") {
                entry.is_dir = folder.trim() == "+";
            } else if let Some(attributes) = line.strip_prefix("Attributes = ") {
                entry.is_dir |= attributes.starts_with('D');
            }
        }
    }
    entries.extend(current);
    entries
}

/// `rar lt`: indented `Name:`/`Type:`/`Size:` records.
fn parse_rar_listing(lines: &[String]) -> Vec<ListedEntry> {
    let mut entries = Vec::new();
    let mut current: Option<ListedEntry> = None;
    for line in lines {
        let line = line.trim();
        if let Some(name) = line.strip_prefix("Name:") {
            entries.extend(current.take());
            current = Some(ListedEntry {
                path: name.trim().to_string(),
                size: 0,
                is_dir: false,
            });
        } else if let Some(entry) = current.as_mut() {
            if let Some(kind) = line.strip_prefix("Type:") {
                entry.is_dir = kind.trim().eq_ignore_ascii_case("directory");
            } else if let Some(size) = line.strip_prefix("Size:") {
                entry.size = size.trim().parse().unwrap_or(0);
            }
        }
    }
    entries.extend(current);
    entries
}
