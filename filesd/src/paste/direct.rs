use std::path::{Path, PathBuf};

use async_trait::async_trait;
use files_core::PeerEntry;
use tracing::{debug, info};

use super::dupname::local_dup_name;
use super::error::ApiContext;
use super::plan::join_remote;
use super::space::{check_disk_space, check_usage_ceiling};
use super::stream::download_response;
use super::{PasteError, PhaseContext, PhaseOutcome, TransferHandler};
use crate::cleanup::CleanupGuard;
use crate::storage::Location;

/// Posix entry on a peer node to this node. The peer streams a recursive
/// listing, then every file is fetched raw. A paused run keeps what it has;
/// the resumed run reuses the destination and skips completed files.
pub(crate) struct DirectFilesHandler;

#[async_trait]
impl TransferHandler for DirectFilesHandler {
    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutcome, PasteError> {
        let (node, src_path) = match ctx.locator().locate(ctx.src())? {
            Location::Peer { node, path } => (node, path),
            other => {
                return Err(PasteError::Invalid(format!(
                    "{other} is not on another node"
                )));
            }
        };
        let client = ctx.backends().peer(&node)?;
        let dst_dir = ctx.locator().local_path(ctx.dst())?;
        let is_dir = ctx.src().is_dir();

        let entries = client
            .list_tree(ctx.owner(), &src_path)
            .await
            .with_api_context(|| format!("list {src_path} on {node}"))?;
        if entries.is_empty() {
            return Err(PasteError::Invalid(format!(
                "{src_path} does not exist on {node}"
            )));
        }
        let total: u64 = entries
            .iter()
            .filter(|entry| !entry.is_dir)
            .map(|entry| entry.size)
            .sum();
        ctx.set_total(total);

        tokio::fs::create_dir_all(&dst_dir)
            .await
            .map_err(|err| PasteError::io(&dst_dir, err))?;
        check_usage_ceiling(&dst_dir, ctx.config().disk_usage_ceiling)?;
        check_disk_space(&dst_dir, total, false)?;

        let resumed_param = ctx.resumed_destination();
        let resumed = resumed_param.is_some();
        let name = match resumed_param {
            Some(param) => param.name().to_string(),
            None => local_dup_name(&dst_dir, ctx.src().name(), !is_dir),
        };
        let target = dst_dir.join(&name);
        let output = ctx.dst().child(&name, is_dir);
        ctx.remember_destination(&output);

        let mut guard = CleanupGuard::for_path(&target);
        let src_parent = ctx.src().parent_path();
        let result = fetch_entries(ctx, &node, &src_parent, &entries, &target, resumed).await;
        match &result {
            Ok(()) | Err(PasteError::Paused) => guard.disarm(),
            Err(_) => {}
        }
        result?;
        info!(task_id = ctx.task_id(), node = %node, src = %src_path, dst = %target.display(), bytes = total, "direct copy finished");
        Ok(PhaseOutcome::copied(output))
    }
}

async fn fetch_entries(
    ctx: &PhaseContext,
    node: &str,
    src_parent: &str,
    entries: &[PeerEntry],
    target: &Path,
    resumed: bool,
) -> Result<(), PasteError> {
    let client = ctx.backends().peer(node)?;
    for entry in entries {
        ctx.check()?;
        let local = local_target(target, &entry.path);
        if entry.is_dir {
            tokio::fs::create_dir_all(&local)
                .await
                .map_err(|err| PasteError::io(&local, err))?;
            continue;
        }
        if resumed {
            let done = tokio::fs::metadata(&local)
                .await
                .map(|meta| meta.len() == entry.size)
                .unwrap_or(false);
            if done {
                debug!(task_id = ctx.task_id(), path = %entry.path, "already copied, skipping");
                ctx.add_transferred(entry.size);
                continue;
            }
        }
        let remote = join_remote(src_parent, &entry.path);
        let response = client
            .open_raw(ctx.owner(), &remote)
            .await
            .with_api_context(|| format!("fetch {remote} from {node}"))?;
        download_response(response, &local, ctx).await?;
    }
    Ok(())
}

/// Listing paths start with the source's own name, which is swapped for the
/// name picked at the destination.
fn local_target(target: &Path, listed: &str) -> PathBuf {
    match listed.trim_matches('/').split_once('/') {
        Some((_, rest)) => target.join(rest),
        None => target.to_path_buf(),
    }
}
