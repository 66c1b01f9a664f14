use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use files_core::{DriveClient, DriveTransfer, JobId};
use tracing::{debug, info, warn};

use super::dupname::{dup_name_in, local_dup_name};
use super::error::ApiContext;
use super::plan::{RemotePlan, join_remote, scan_local};
use super::space::{CROSS_BACKEND_FACTOR, check_disk_space, check_space, check_usage_ceiling};
use super::stream::upload_body;
use super::{PasteError, PhaseContext, PhaseOutcome, TransferHandler};
use crate::cleanup::CleanupGuard;
use crate::storage::{Action, FileParam, FileType, Location, StorageLocator};

struct CloudLocation {
    kind: FileType,
    account: String,
    path: String,
}

fn cloud_location(locator: &StorageLocator, param: &FileParam) -> Result<CloudLocation, PasteError> {
    match locator.locate(param)? {
        Location::Cloud {
            kind,
            account,
            path,
        } => Ok(CloudLocation {
            kind,
            account,
            path,
        }),
        other => Err(PasteError::Invalid(format!("{other} is not a cloud location"))),
    }
}

/// Names in a cloud folder; a missing folder is created and reads as empty.
async fn folder_names(
    client: &DriveClient,
    account: &str,
    dir: &str,
) -> Result<HashSet<String>, PasteError> {
    match client.list(account, dir).await {
        Ok(items) => Ok(items.into_iter().map(|item| item.name).collect()),
        Err(err) if err.is_not_found() => {
            client
                .create_folder(account, dir)
                .await
                .with_api_context(|| format!("create folder {dir} on {account}"))?;
            Ok(HashSet::new())
        }
        Err(err) => Err(PasteError::api(format!("list {dir} on {account}"), err)),
    }
}

/// Breadth-first listing of a cloud entry; folders are queued in listing
/// order.
async fn remote_plan(
    ctx: &PhaseContext,
    client: &DriveClient,
    account: &str,
    path: &str,
    is_dir: bool,
) -> Result<RemotePlan, PasteError> {
    if !is_dir {
        let item = client
            .stat(account, path)
            .await
            .with_api_context(|| format!("stat {path} on {account}"))?
            .ok_or_else(|| PasteError::Invalid(format!("{path} does not exist on {account}")))?;
        return Ok(RemotePlan::single(path.to_string(), item.size));
    }
    let mut plan = RemotePlan::default();
    let mut queue = VecDeque::from([(path.to_string(), String::new())]);
    while let Some((dir, rel)) = queue.pop_front() {
        ctx.check()?;
        let items = client
            .list(account, &dir)
            .await
            .with_api_context(|| format!("list {dir} on {account}"))?;
        for item in items {
            let child_rel = if rel.is_empty() {
                item.name.clone()
            } else {
                format!("{rel}/{}", item.name)
            };
            let child = join_remote(&dir, &item.name);
            if item.is_dir {
                plan.push_dir(child_rel.clone());
                queue.push_back((format!("{child}/"), child_rel));
            } else {
                plan.push_file(child, child_rel, item.size);
            }
        }
    }
    Ok(plan)
}

/// Polls a gateway job until it finishes. With `track` set, job stats drive
/// the phase progress starting from that byte offset. The job is stopped
/// when the phase is interrupted or polling fails.
async fn wait_job(
    ctx: &PhaseContext,
    client: &DriveClient,
    job: JobId,
    track: Option<u64>,
) -> Result<(), PasteError> {
    loop {
        let status = match client.job_status(job).await {
            Ok(status) => status,
            Err(err) => {
                stop_job(client, job).await;
                return Err(PasteError::api(format!("poll job {job}"), err));
            }
        };
        if let Some(base) = track {
            match client.job_stats(job).await {
                Ok(stats) => ctx.set_transferred(base + stats.bytes),
                Err(err) => debug!(job = %job, error = %err, "job stats unavailable"),
            }
        }
        if status.finished {
            if status.success {
                return Ok(());
            }
            return Err(PasteError::JobFailed {
                job,
                message: status.error.unwrap_or_else(|| "unknown error".to_string()),
            });
        }
        if let Err(err) = ctx.sleep(ctx.config().job_poll_interval).await {
            stop_job(client, job).await;
            return Err(err);
        }
    }
}

async fn stop_job(client: &DriveClient, job: JobId) {
    if let Err(err) = client.stop_job(job).await {
        warn!(job = %job, error = %err, "failed to stop job");
    }
}

/// Local tree into a cloud account: folders first, then one upload job per
/// file.
pub(crate) struct CloudUploadHandler;

#[async_trait]
impl TransferHandler for CloudUploadHandler {
    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutcome, PasteError> {
        let src = ctx.locator().local_path(ctx.src())?;
        let dst = cloud_location(ctx.locator(), ctx.dst())?;
        let client = ctx.backends().drive(dst.kind, &dst.account)?;
        let meta = tokio::fs::symlink_metadata(&src)
            .await
            .map_err(|err| PasteError::io(&src, err))?;
        let is_dir = meta.is_dir();
        let (entries, total) = scan_local(&src).await?;
        ctx.set_total(total);

        let usage = client
            .usage(&dst.account)
            .await
            .with_api_context(|| format!("read usage of {}", dst.account))?;
        check_space(usage.free, total, CROSS_BACKEND_FACTOR)?;

        let names = folder_names(client, &dst.account, &dst.path).await?;
        let name = dup_name_in(&names, ctx.src().name(), !is_dir);
        let output = ctx.dst().child(&name, is_dir);
        ctx.remember_destination(&output);
        let root = join_remote(&dst.path, &name);

        let result: Result<(), PasteError> = async {
            if !is_dir {
                return upload_file(ctx, client, &dst.account, &src, &root, meta.len()).await;
            }
            client
                .create_folder(&dst.account, &root)
                .await
                .with_api_context(|| format!("create folder {root}"))?;
            for entry in entries.iter().filter(|entry| entry.is_dir) {
                ctx.check()?;
                let folder = join_remote(&root, &entry.rel);
                client
                    .create_folder(&dst.account, &folder)
                    .await
                    .with_api_context(|| format!("create folder {folder}"))?;
            }
            for entry in entries.iter().filter(|entry| !entry.is_dir) {
                ctx.check()?;
                let remote = join_remote(&root, &entry.rel);
                upload_file(ctx, client, &dst.account, &entry.path, &remote, entry.size).await?;
            }
            Ok(())
        }
        .await;

        if let Err(err) = &result {
            if err.is_interruption() {
                if let Err(cleanup) = client.delete(&dst.account, &root).await {
                    warn!(task_id = ctx.task_id(), path = %root, error = %cleanup, "failed to remove interrupted upload");
                }
            }
        }
        result?;
        info!(task_id = ctx.task_id(), account = %dst.account, dst = %root, bytes = total, "cloud upload finished");
        Ok(PhaseOutcome::copied(output))
    }
}

async fn upload_file(
    ctx: &PhaseContext,
    client: &DriveClient,
    account: &str,
    local: &std::path::Path,
    remote: &str,
    size: u64,
) -> Result<(), PasteError> {
    ctx.check()?;
    let body = upload_body(local, ctx).await?;
    let job = match client.upload(account, remote, size, body).await {
        Ok(job) => job,
        Err(_) if ctx.is_stopped() => return Err(ctx.interrupted()),
        Err(err) => return Err(PasteError::api(format!("upload {remote}"), err)),
    };
    debug!(task_id = ctx.task_id(), job = %job, path = %remote, "upload committed as job");
    wait_job(ctx, client, job, None).await
}

/// Cloud entry to this node, walked breadth-first.
pub(crate) struct CloudDownloadHandler;

#[async_trait]
impl TransferHandler for CloudDownloadHandler {
    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutcome, PasteError> {
        let src = cloud_location(ctx.locator(), ctx.src())?;
        let client = ctx.backends().drive(src.kind, &src.account)?;
        let dst_dir = ctx.locator().local_path(ctx.dst())?;
        let is_dir = ctx.src().is_dir();

        let plan = remote_plan(ctx, client, &src.account, &src.path, is_dir).await?;
        ctx.set_total(plan.total);
        tokio::fs::create_dir_all(&dst_dir)
            .await
            .map_err(|err| PasteError::io(&dst_dir, err))?;
        check_usage_ceiling(&dst_dir, ctx.config().disk_usage_ceiling)?;
        check_disk_space(&dst_dir, plan.total, false)?;

        let name = local_dup_name(&dst_dir, ctx.src().name(), !is_dir);
        let target = dst_dir.join(&name);
        let output = ctx.dst().child(&name, is_dir);
        ctx.remember_destination(&output);

        let mut guard = CleanupGuard::for_path(&target);
        let account = src.account.as_str();
        plan.download(ctx, &target, is_dir, |remote| async move {
            client
                .open_content(account, &remote)
                .await
                .with_api_context(|| format!("download {remote} from {account}"))
        })
        .await?;
        guard.disarm();
        info!(task_id = ctx.task_id(), account = %src.account, src = %src.path, dst = %target.display(), "cloud download finished");
        Ok(PhaseOutcome::copied(output))
    }
}

/// Same-kind cloud copy or move, done by the gateway as one job.
pub(crate) struct CloudCopyHandler;

#[async_trait]
impl TransferHandler for CloudCopyHandler {
    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutcome, PasteError> {
        let src = cloud_location(ctx.locator(), ctx.src())?;
        let dst = cloud_location(ctx.locator(), ctx.dst())?;
        let client = ctx.backends().drive(dst.kind, &dst.account)?;
        let is_dir = ctx.src().is_dir();
        if is_dir && src.account == dst.account && dst.path.starts_with(&src.path) {
            return Err(PasteError::Invalid(format!(
                "cannot paste {} into itself",
                src.path
            )));
        }

        let plan = remote_plan(ctx, client, &src.account, &src.path, is_dir).await?;
        ctx.set_total(plan.total);
        if src.account != dst.account {
            let usage = client
                .usage(&dst.account)
                .await
                .with_api_context(|| format!("read usage of {}", dst.account))?;
            check_space(usage.free, plan.total, CROSS_BACKEND_FACTOR)?;
        }

        let names = folder_names(client, &dst.account, &dst.path).await?;
        let name = dup_name_in(&names, ctx.src().name(), !is_dir);
        let output = ctx.dst().child(&name, is_dir);
        ctx.remember_destination(&output);
        let target = join_remote(&dst.path, &name);
        ctx.check()?;

        let transfer = DriveTransfer {
            src_drive: &src.account,
            src_path: src.path.trim_end_matches('/'),
            dst_drive: &dst.account,
            dst_path: &target,
        };
        let job = match ctx.action() {
            Action::Copy => client.copy(transfer).await,
            Action::Move => client.move_item(transfer).await,
        }
        .with_api_context(|| format!("{} {} to {target}", ctx.action(), src.path))?;
        wait_job(ctx, client, job, Some(0)).await?;
        ctx.set_transferred(plan.total);
        info!(task_id = ctx.task_id(), job = %job, dst = %target, action = %ctx.action(), "cloud job finished");

        Ok(match ctx.action() {
            Action::Copy => PhaseOutcome::copied(output),
            Action::Move => PhaseOutcome::moved(output),
        })
    }
}
