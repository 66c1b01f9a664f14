use std::time::Duration;

use anyhow::Context;
use filesd::{Action, EngineConfig, FileParam, PasteParam, TaskManager, TaskStatus};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Paste {
        action: Action,
        src: String,
        dst: String,
    },
    Compress {
        output: String,
        sources: Vec<String>,
    },
    Extract {
        archive: String,
        dest: String,
        overwrite: bool,
    },
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().skip(1).collect();
    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        return Ok(CliMode::Help);
    }
    let Some((command, rest)) = args.split_first() else {
        return Ok(CliMode::Help);
    };
    match command.as_str() {
        "copy" | "move" => {
            let [src, dst] = rest else {
                anyhow::bail!("usage: filesd {command} <src> <dst>");
            };
            let action = if command == "copy" {
                Action::Copy
            } else {
                Action::Move
            };
            Ok(CliMode::Paste {
                action,
                src: src.clone(),
                dst: dst.clone(),
            })
        }
        "compress" => {
            let Some((output, sources)) = rest.split_first() else {
                anyhow::bail!("usage: filesd compress <out> <paths...>");
            };
            anyhow::ensure!(!sources.is_empty(), "compress needs at least one path");
            Ok(CliMode::Compress {
                output: output.clone(),
                sources: sources.to_vec(),
            })
        }
        "extract" => {
            let overwrite = rest.iter().any(|arg| arg == "--overwrite");
            let positional: Vec<&String> =
                rest.iter().filter(|arg| *arg != "--overwrite").collect();
            let [archive, dest] = positional.as_slice() else {
                anyhow::bail!("usage: filesd extract <archive> <dest> [--overwrite]");
            };
            Ok(CliMode::Extract {
                archive: (*archive).clone(),
                dest: (*dest).clone(),
                overwrite,
            })
        }
        other => anyhow::bail!("unknown command: {other}"),
    }
}

fn print_help() {
    println!("Usage:");
    println!("  filesd copy <src> <dst>");
    println!("  filesd move <src> <dst>");
    println!("  filesd compress <out> <paths...>");
    println!("  filesd extract <archive> <dest> [--overwrite]");
    println!();
    println!("Locations are written as type:extend:path, e.g. drive:node-1:/Home/a.txt");
    println!("A path ending in / is a folder.");
}

fn owner() -> String {
    std::env::var("FILES_OWNER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "admin".to_string())
}

fn locator(owner: &str, value: &str) -> anyhow::Result<FileParam> {
    FileParam::parse(owner, value).with_context(|| format!("invalid location {value:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        print_help();
        return Ok(());
    }

    let config = EngineConfig::from_env()?;
    let manager = TaskManager::from_config(config).context("failed to set up backends")?;
    let owner = owner();
    let task = match mode {
        CliMode::Paste { action, src, dst } => manager.create_task(PasteParam {
            owner: owner.clone(),
            action,
            src: locator(&owner, &src)?,
            dst: locator(&owner, &dst)?,
        })?,
        CliMode::Compress { output, sources } => {
            let sources = sources
                .iter()
                .map(|value| locator(&owner, value))
                .collect::<anyhow::Result<Vec<_>>>()?;
            manager.create_compress_task(&owner, sources, locator(&owner, &output)?)?
        }
        CliMode::Extract {
            archive,
            dest,
            overwrite,
        } => manager.create_uncompress_task(
            &owner,
            locator(&owner, &archive)?,
            locator(&owner, &dest)?,
            overwrite,
        )?,
        CliMode::Help => return Ok(()),
    };
    task.run()?;

    let mut last_progress = None;
    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("failed to listen for ctrl-c")?;
                warn!(task_id = task.id(), "interrupted, cancelling task");
                interrupted = true;
                manager.cancel_task(task.id()).await?;
            }
        }
        let info = task.info();
        if last_progress != Some(info.progress) {
            info!(task_id = %info.id, progress = info.progress, transferred = info.transferred, total = info.total_file_size, phase = info.current_phase, "progress");
            last_progress = Some(info.progress);
        }
        if info.status.is_terminal() {
            match info.status {
                TaskStatus::Completed => {
                    info!(task_id = %info.id, dst = %info.dst_path, "done");
                    return Ok(());
                }
                status => anyhow::bail!("task {} {status}: {}", info.id, info.error_message),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("filesd")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parse_cli_mode_defaults_to_help() {
        assert_eq!(parse_cli_mode(args(&[])).unwrap(), CliMode::Help);
        assert_eq!(parse_cli_mode(args(&["copy", "--help"])).unwrap(), CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_supports_paste() {
        let mode = parse_cli_mode(args(&["move", "drive:n:/a.txt", "drive:n:/b/"])).unwrap();
        assert_eq!(
            mode,
            CliMode::Paste {
                action: Action::Move,
                src: "drive:n:/a.txt".into(),
                dst: "drive:n:/b/".into(),
            }
        );
        assert!(parse_cli_mode(args(&["copy", "drive:n:/a.txt"])).is_err());
    }

    #[test]
    fn parse_cli_mode_supports_archives() {
        let mode = parse_cli_mode(args(&["compress", "drive:n:/o.zip", "drive:n:/a/", "drive:n:/b"])).unwrap();
        assert_eq!(
            mode,
            CliMode::Compress {
                output: "drive:n:/o.zip".into(),
                sources: vec!["drive:n:/a/".into(), "drive:n:/b".into()],
            }
        );
        let mode = parse_cli_mode(args(&["extract", "drive:n:/o.zip", "--overwrite", "drive:n:/x/"])).unwrap();
        assert_eq!(
            mode,
            CliMode::Extract {
                archive: "drive:n:/o.zip".into(),
                dest: "drive:n:/x/".into(),
                overwrite: true,
            }
        );
        assert!(parse_cli_mode(args(&["compress", "drive:n:/o.zip"])).is_err());
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_commands() {
        assert!(parse_cli_mode(args(&["sync"])).is_err());
    }
}
