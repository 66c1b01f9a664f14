use std::collections::{HashSet, VecDeque};
use std::io::SeekFrom;
use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use files_core::{BatchTarget, SyncClient, UploadChunk};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};
use url::Url;

use super::dupname::{dup_name_in, local_dup_name};
use super::error::ApiContext;
use super::plan::{RemotePlan, join_remote, scan_local};
use super::retry::ChunkRetry;
use super::space::{CROSS_BACKEND_FACTOR, check_disk_space, check_space, check_usage_ceiling};
use super::{PasteError, PhaseContext, PhaseOutcome, TransferHandler, UploadRegistry};
use crate::cleanup::CleanupGuard;
use crate::storage::{Action, FileParam, Location, StorageLocator};

const CONFIRM_POLLS: u32 = 3;

fn sync_location(locator: &StorageLocator, param: &FileParam) -> Result<(String, String), PasteError> {
    match locator.locate(param)? {
        Location::Sync { repo, path } => Ok((repo, path)),
        other => Err(PasteError::Invalid(format!("{other} is not a sync location"))),
    }
}

/// Names in a sync directory; a missing directory is created and reads as
/// empty.
async fn dir_names(client: &SyncClient, repo: &str, dir: &str) -> Result<HashSet<String>, PasteError> {
    match client.list_dir(repo, dir).await {
        Ok(entries) => Ok(entries.into_iter().map(|entry| entry.name).collect()),
        Err(err) if err.is_not_found() => {
            ensure_dir(client, repo, dir).await?;
            Ok(HashSet::new())
        }
        Err(err) => Err(PasteError::api(format!("list {dir} in repo {repo}"), err)),
    }
}

async fn ensure_dir(client: &SyncClient, repo: &str, dir: &str) -> Result<(), PasteError> {
    match client.create_dir(repo, dir).await {
        Ok(()) => Ok(()),
        Err(err) => {
            // Already there after a resumed run.
            if client.list_dir(repo, dir).await.is_ok() {
                return Ok(());
            }
            Err(PasteError::api(format!("create {dir} in repo {repo}"), err))
        }
    }
}

/// Breadth-first listing of a sync entry.
async fn remote_plan(
    ctx: &PhaseContext,
    client: &SyncClient,
    repo: &str,
    path: &str,
    is_dir: bool,
) -> Result<RemotePlan, PasteError> {
    if !is_dir {
        let detail = client
            .file_detail(repo, path)
            .await
            .with_api_context(|| format!("stat {path} in repo {repo}"))?
            .ok_or_else(|| PasteError::Invalid(format!("{path} does not exist in repo {repo}")))?;
        return Ok(RemotePlan::single(path.to_string(), detail.size));
    }
    let mut plan = RemotePlan::default();
    let mut queue = VecDeque::from([(path.to_string(), String::new())]);
    while let Some((dir, rel)) = queue.pop_front() {
        ctx.check()?;
        let entries = client
            .list_dir(repo, &dir)
            .await
            .with_api_context(|| format!("list {dir} in repo {repo}"))?;
        for entry in entries {
            let child_rel = if rel.is_empty() {
                entry.name.clone()
            } else {
                format!("{rel}/{}", entry.name)
            };
            let child = join_remote(&dir, &entry.name);
            if entry.is_dir() {
                plan.push_dir(child_rel.clone());
                queue.push_back((format!("{child}/"), child_rel));
            } else {
                plan.push_file(child, child_rel, entry.size);
            }
        }
    }
    Ok(plan)
}

/// Local tree into a sync repo in fixed-size chunks. Confirmed offsets are
/// kept in the [`UploadRegistry`] so a paused task resumes at the next
/// unconfirmed chunk.
pub(crate) struct SyncUploadHandler;

#[async_trait]
impl TransferHandler for SyncUploadHandler {
    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutcome, PasteError> {
        let src = ctx.locator().local_path(ctx.src())?;
        let (repo, dst_dir) = sync_location(ctx.locator(), ctx.dst())?;
        let client = ctx.backends().sync(&repo)?;
        let meta = tokio::fs::symlink_metadata(&src)
            .await
            .map_err(|err| PasteError::io(&src, err))?;
        let is_dir = meta.is_dir();
        let (entries, total) = scan_local(&src).await?;
        ctx.set_total(total);

        let account = client
            .account_info()
            .await
            .api_context("read sync account quota")?;
        if let Some(available) = account.available() {
            check_space(available, total, CROSS_BACKEND_FACTOR)?;
        }

        let name = match ctx.resumed_destination() {
            Some(param) => param.name().to_string(),
            None => {
                let names = dir_names(client, &repo, &dst_dir).await?;
                dup_name_in(&names, ctx.src().name(), !is_dir)
            }
        };
        let output = ctx.dst().child(&name, is_dir);
        ctx.remember_destination(&output);

        let upload = Upload {
            ctx,
            client,
            repo: &repo,
            dst_dir: &dst_dir,
            link: client
                .upload_link(&repo, &dst_dir)
                .await
                .with_api_context(|| format!("get upload link for {dst_dir}"))?,
        };
        let result = if is_dir {
            upload.tree(&name, &entries).await
        } else {
            upload.file(&src, &name, None, meta.len()).await
        };

        if let Err(err) = &result {
            if matches!(err, PasteError::Cancelled) {
                // A resumed name is still this task's own partial output.
                ctx.backends().uploads().forget_task(ctx.task_id());
                let names = [name.clone()];
                if let Err(cleanup) = client.batch_delete(&repo, &dst_dir, &names).await {
                    warn!(task_id = ctx.task_id(), entry = %name, error = %cleanup, "failed to remove cancelled upload");
                }
            }
        }
        result?;
        info!(task_id = ctx.task_id(), repo = %repo, dst = %output.path, bytes = total, "sync upload finished");
        Ok(PhaseOutcome::copied(output))
    }
}

struct Upload<'a> {
    ctx: &'a PhaseContext,
    client: &'a SyncClient,
    repo: &'a str,
    dst_dir: &'a str,
    link: Url,
}

impl Upload<'_> {
    async fn tree(&self, name: &str, entries: &[super::plan::LocalEntry]) -> Result<(), PasteError> {
        let root = join_remote(self.dst_dir, name);
        ensure_dir(self.client, self.repo, &format!("{root}/")).await?;
        for entry in entries.iter().filter(|entry| entry.is_dir) {
            self.ctx.check()?;
            ensure_dir(self.client, self.repo, &format!("{}/", join_remote(&root, &entry.rel))).await?;
        }
        for entry in entries.iter().filter(|entry| !entry.is_dir) {
            let (parent, file_name) = match entry.rel.rsplit_once('/') {
                Some((parent, file_name)) => (format!("{name}/{parent}"), file_name),
                None => (name.to_string(), entry.rel.as_str()),
            };
            self.file(&entry.path, file_name, Some(parent), entry.size)
                .await?;
        }
        Ok(())
    }

    /// Uploads one file as `file_name` under `dst_dir`/`relative`.
    async fn file(
        &self,
        path: &Path,
        file_name: &str,
        relative: Option<String>,
        size: u64,
    ) -> Result<(), PasteError> {
        let ctx = self.ctx;
        let remote_path = match &relative {
            Some(relative) => join_remote(&join_remote(self.dst_dir, relative), file_name),
            None => join_remote(self.dst_dir, file_name),
        };
        let mtime = tokio::fs::metadata(path)
            .await
            .ok()
            .and_then(|meta| meta.modified().ok())
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or_default();
        let key = UploadRegistry::key(
            self.repo,
            &remote_path,
            &path.to_string_lossy(),
            size,
            mtime,
        );
        let registry = ctx.backends().uploads();

        let mut offset = registry.offset(&key).min(size);
        if offset > 0 {
            info!(task_id = ctx.task_id(), path = %remote_path, offset, "resuming chunked upload");
            ctx.add_transferred(offset);
        } else if ctx.was_paused() && self.remote_size(&remote_path).await == Some(size) {
            debug!(task_id = ctx.task_id(), path = %remote_path, "already uploaded, skipping");
            ctx.add_transferred(size);
            return Ok(());
        }

        let mut input = tokio::fs::File::open(path)
            .await
            .map_err(|err| PasteError::io(path, err))?;
        input
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|err| PasteError::io(path, err))?;
        let chunk_size = ctx.config().chunk_size.max(1);
        loop {
            ctx.check()?;
            let len = chunk_size.min(size - offset) as usize;
            let mut bytes = vec![0u8; len];
            input
                .read_exact(&mut bytes)
                .await
                .map_err(|err| PasteError::io(path, err))?;
            let chunk = UploadChunk {
                parent_dir: self.dst_dir.to_string(),
                file_name: file_name.to_string(),
                relative_path: relative.clone(),
                start: offset,
                bytes,
                total: size,
            };
            self.send(&chunk, &remote_path).await?;
            offset += len as u64;
            registry.record(&key, ctx.task_id(), offset);
            ctx.add_transferred(len as u64);
            if offset >= size {
                break;
            }
        }
        registry.finish(&key);
        Ok(())
    }

    /// Sends one chunk with retries. A timed-out final chunk may still have
    /// been committed, so the remote file is polled before deciding.
    async fn send(&self, chunk: &UploadChunk, remote_path: &str) -> Result<(), PasteError> {
        let mut retry = ChunkRetry::for_uploads(self.ctx.config());
        loop {
            let err = match self.client.upload_chunk(&self.link, chunk).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            let mut unconfirmed = None;
            if chunk.is_last() && err.is_timeout() {
                let remote = self.confirm(remote_path, chunk.total).await?;
                if remote == Some(chunk.total) {
                    info!(task_id = self.ctx.task_id(), path = %remote_path, "final chunk confirmed after timeout");
                    return Ok(());
                }
                unconfirmed = Some(remote.unwrap_or(0));
            } else if !err.is_retryable() {
                return Err(PasteError::api(
                    format!("upload {} of {remote_path}", chunk.content_range()),
                    err,
                ));
            }
            let Some(delay) = retry.next_delay(&err) else {
                return Err(match unconfirmed {
                    Some(remote) => PasteError::UploadIncomplete {
                        name: remote_path.to_string(),
                        remote,
                        expected: chunk.total,
                    },
                    None => PasteError::api(
                        format!("upload {} of {remote_path}", chunk.content_range()),
                        err,
                    ),
                });
            };
            warn!(
                task_id = self.ctx.task_id(),
                path = %remote_path,
                attempt = retry.attempts_made(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "chunk upload failed, retrying"
            );
            self.ctx.sleep(delay).await?;
        }
    }

    /// Polls the remote size a few times, giving the service a moment to
    /// commit the assembled file.
    async fn confirm(&self, remote_path: &str, expected: u64) -> Result<Option<u64>, PasteError> {
        let mut last = None;
        for poll in 0..CONFIRM_POLLS {
            if poll > 0 {
                self.ctx
                    .sleep(self.ctx.config().retry_base.max(Duration::from_millis(10)))
                    .await?;
            }
            last = self.remote_size(remote_path).await;
            if last == Some(expected) {
                break;
            }
        }
        Ok(last)
    }

    async fn remote_size(&self, remote_path: &str) -> Option<u64> {
        match self.client.file_detail(self.repo, remote_path).await {
            Ok(detail) => detail.map(|detail| detail.size),
            Err(err) => {
                debug!(path = %remote_path, error = %err, "file status poll failed");
                None
            }
        }
    }
}

/// Sync repo entry to this node through download links.
pub(crate) struct SyncDownloadHandler;

#[async_trait]
impl TransferHandler for SyncDownloadHandler {
    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutcome, PasteError> {
        let (repo, src_path) = sync_location(ctx.locator(), ctx.src())?;
        let client = ctx.backends().sync(&repo)?;
        let dst_dir = ctx.locator().local_path(ctx.dst())?;
        let is_dir = ctx.src().is_dir();

        let plan = remote_plan(ctx, client, &repo, &src_path, is_dir).await?;
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
        plan.download(ctx, &target, is_dir, |remote| {
            let repo = repo.clone();
            async move {
                let link = client
                    .download_link(&repo, &remote)
                    .await
                    .with_api_context(|| format!("get download link for {remote}"))?;
                client
                    .open_download(link)
                    .await
                    .with_api_context(|| format!("download {remote}"))
            }
        })
        .await?;
        guard.disarm();
        info!(task_id = ctx.task_id(), repo = %repo, src = %src_path, dst = %target.display(), "sync download finished");
        Ok(PhaseOutcome::copied(output))
    }
}

/// Copy or move inside the sync service through its batch API.
pub(crate) struct SyncCopyHandler;

#[async_trait]
impl TransferHandler for SyncCopyHandler {
    async fn execute(&self, ctx: &PhaseContext) -> Result<PhaseOutcome, PasteError> {
        let (src_repo, src_path) = sync_location(ctx.locator(), ctx.src())?;
        let (dst_repo, dst_dir) = sync_location(ctx.locator(), ctx.dst())?;
        let client = ctx.backends().sync(&dst_repo)?;
        let is_dir = ctx.src().is_dir();
        if is_dir && src_repo == dst_repo && dst_dir.starts_with(&src_path) {
            return Err(PasteError::Invalid(format!(
                "cannot paste {src_path} into itself"
            )));
        }

        let plan = remote_plan(ctx, client, &src_repo, &src_path, is_dir).await?;
        ctx.set_total(plan.total);
        if src_repo != dst_repo {
            let account = client
                .account_info()
                .await
                .api_context("read sync account quota")?;
            if let Some(available) = account.available() {
                check_space(available, plan.total, CROSS_BACKEND_FACTOR)?;
            }
        }

        let names = dir_names(client, &dst_repo, &dst_dir).await?;
        let src_name = ctx.src().name().to_string();
        let name = dup_name_in(&names, &src_name, !is_dir);
        let output = ctx.dst().child(&name, is_dir);
        ctx.remember_destination(&output);
        ctx.check()?;

        let src_parent = ctx.src().parent_path();
        let target = BatchTarget {
            src_repo: &src_repo,
            src_parent: &src_parent,
            dst_repo: &dst_repo,
            dst_parent: &dst_dir,
        };
        let sources = [src_name.clone()];
        let renamed = [name.clone()];
        let result = match (ctx.action(), name == src_name) {
            (Action::Copy, true) => client.batch_copy(target, &sources).await,
            (Action::Copy, false) => client.batch_copy_as(target, &sources, &renamed).await,
            (Action::Move, true) => client.batch_move(target, &sources).await,
            (Action::Move, false) => client.batch_move_as(target, &sources, &renamed).await,
        };
        result.with_api_context(|| format!("{} {src_path} to {dst_dir}", ctx.action()))?;
        ctx.set_transferred(plan.total);
        info!(task_id = ctx.task_id(), src = %src_path, dst = %output.path, action = %ctx.action(), "sync batch finished");

        Ok(match ctx.action() {
            Action::Copy => PhaseOutcome::copied(output),
            Action::Move => PhaseOutcome::moved(output),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, RemoteConfig};
    use crate::paste::TaskType;
    use crate::paste::context::testing::{context, local};
    use crate::storage::FileType;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    const UPLOAD_PATH: &str = "/upload-api/u1";

    struct CancelOnRequest {
        token: CancellationToken,
        response: ResponseTemplate,
    }

    impl Respond for CancelOnRequest {
        fn respond(&self, _: &Request) -> ResponseTemplate {
            self.token.cancel();
            self.response.clone()
        }
    }

    fn config(root: &Path, server: &MockServer) -> EngineConfig {
        let mut config = EngineConfig::for_roots("node-a", &root.join("drive"), &root.join("cache"));
        config.disk_usage_ceiling = None;
        config.chunk_size = 4;
        config.upload_retries = 3;
        config.retry_base = Duration::from_millis(10);
        config.sync = Some(RemoteConfig {
            base_url: server.uri(),
            token: "sync-token".into(),
        });
        config
    }

    fn repo(path: &str) -> FileParam {
        FileParam::new("alice", FileType::Sync, "repo-1", path)
    }

    async fn requests_to(server: &MockServer, verb: &str, route: &str) -> Vec<Request> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|request| request.method.as_str() == verb && request.url.path() == route)
            .collect()
    }

    fn content_ranges(requests: &[Request]) -> Vec<String> {
        requests
            .iter()
            .filter_map(|request| request.headers.get("content-range"))
            .filter_map(|value| value.to_str().ok().map(str::to_string))
            .collect()
    }

    /// Upload endpoints for a six-byte file whose last chunk times out at
    /// the gateway.
    async fn timeout_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/account/info/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "total": -1, "usage": 0 })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/repos/repo-1/dir/"))
            .and(query_param("p", "/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/repos/repo-1/upload-link/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!(format!("{}{UPLOAD_PATH}", server.uri()))),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(UPLOAD_PATH))
            .and(header("content-range", "bytes 4-5/6"))
            .respond_with(ResponseTemplate::new(504))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(UPLOAD_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "name": "a.txt" }])))
            .mount(&server)
            .await;
        server
    }

    fn six_bytes(root: &Path) {
        let home = root.join("drive/alice");
        std::fs::create_dir_all(&home).unwrap();
        std::fs::write(home.join("a.txt"), b"abcdef").unwrap();
    }

    #[tokio::test]
    async fn timed_out_final_chunk_is_confirmed_by_remote_size() {
        let server = timeout_server().await;
        Mock::given(method("GET"))
            .and(path("/api2/repos/repo-1/file/detail/"))
            .and(query_param("p", "/a.txt"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "name": "a.txt", "size": 6 })),
            )
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        six_bytes(dir.path());
        let (ctx, state) = context(
            config(dir.path(), &server),
            TaskType::SyncUpload,
            Action::Copy,
            local("alice", "/a.txt"),
            repo("/"),
        );

        let outcome = SyncUploadHandler.execute(&ctx).await.unwrap();

        assert_eq!(outcome.output.path, "/a.txt");
        assert_eq!(state.snapshot().transferred, 6);
        let uploads = requests_to(&server, "POST", UPLOAD_PATH).await;
        assert_eq!(
            content_ranges(&uploads),
            vec!["bytes 0-3/6".to_string(), "bytes 4-5/6".to_string()]
        );
    }

    #[tokio::test]
    async fn unconfirmed_final_chunk_fails_after_the_retry_budget() {
        let server = timeout_server().await;
        Mock::given(method("GET"))
            .and(path("/api2/repos/repo-1/file/detail/"))
            .and(query_param("p", "/a.txt"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "name": "a.txt", "size": 4 })),
            )
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        six_bytes(dir.path());
        let (ctx, _) = context(
            config(dir.path(), &server),
            TaskType::SyncUpload,
            Action::Copy,
            local("alice", "/a.txt"),
            repo("/"),
        );

        let err = SyncUploadHandler.execute(&ctx).await.unwrap_err();

        match err {
            PasteError::UploadIncomplete {
                name,
                remote,
                expected,
            } => {
                assert_eq!(name, "/a.txt");
                assert_eq!(remote, 4);
                assert_eq!(expected, 6);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let uploads = requests_to(&server, "POST", UPLOAD_PATH).await;
        let finals = content_ranges(&uploads)
            .into_iter()
            .filter(|range| range == "bytes 4-5/6")
            .count();
        assert_eq!(finals, 3);
    }

    async fn download_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/repos/repo-1/file/detail/"))
            .and(query_param("p", "/docs/a.txt"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "name": "a.txt", "size": 5 })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/repos/repo-1/file/"))
            .and(query_param("p", "/docs/a.txt"))
            .and(query_param("reuse", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!(format!("{}/files/abc/a.txt", server.uri()))),
            )
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn downloads_through_a_download_link() {
        let server = download_server().await;
        Mock::given(method("GET"))
            .and(path("/files/abc/a.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let copies = dir.path().join("drive/alice/Copies");
        std::fs::create_dir_all(&copies).unwrap();
        std::fs::write(copies.join("a.txt"), b"older").unwrap();
        let (ctx, state) = context(
            config(dir.path(), &server),
            TaskType::SyncDownload,
            Action::Copy,
            repo("/docs/a.txt"),
            local("alice", "/Copies/"),
        );

        let outcome = SyncDownloadHandler.execute(&ctx).await.unwrap();

        assert_eq!(outcome.output.path, "/Copies/a(1).txt");
        assert_eq!(std::fs::read(copies.join("a(1).txt")).unwrap(), b"hello");
        assert_eq!(std::fs::read(copies.join("a.txt")).unwrap(), b"older");
        assert_eq!(state.snapshot().transferred, 5);
    }

    #[tokio::test]
    async fn cancelled_download_removes_the_partial_file() {
        let server = download_server().await;
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context(
            config(dir.path(), &server),
            TaskType::SyncDownload,
            Action::Copy,
            repo("/docs/a.txt"),
            local("alice", "/Copies/"),
        );
        Mock::given(method("GET"))
            .and(path("/files/abc/a.txt"))
            .respond_with(CancelOnRequest {
                token: ctx.token().clone(),
                response: ResponseTemplate::new(200).set_body_string("hello"),
            })
            .mount(&server)
            .await;

        let err = SyncDownloadHandler.execute(&ctx).await.unwrap_err();

        assert!(matches!(err, PasteError::Cancelled), "{err:?}");
        let copies = dir.path().join("drive/alice/Copies");
        assert_eq!(std::fs::read_dir(copies).unwrap().count(), 0);
    }

    async fn batch_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/repos/repo-1/file/detail/"))
            .and(query_param("p", "/docs/a.txt"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "name": "a.txt", "size": 5 })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/repos/repo-1/dir/"))
            .and(query_param("p", "/backup/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{ "type": "file", "name": "a.txt", "size": 1 }])),
            )
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn copies_inside_the_service_under_a_free_name() {
        let server = batch_server().await;
        Mock::given(method("POST"))
            .and(path("/api/v2.1/repos/sync-batch-copy-item/"))
            .and(body_json(json!({
                "src_repo_id": "repo-1",
                "src_parent_dir": "/docs/",
                "src_dirents": ["a.txt"],
                "dst_repo_id": "repo-1",
                "dst_parent_dir": "/backup/",
                "dst_dirents": ["a(1).txt"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let (ctx, state) = context(
            config(dir.path(), &server),
            TaskType::SyncCopy,
            Action::Copy,
            repo("/docs/a.txt"),
            repo("/backup/"),
        );

        let outcome = SyncCopyHandler.execute(&ctx).await.unwrap();

        assert_eq!(outcome.output.path, "/backup/a(1).txt");
        assert!(!outcome.source_consumed);
        assert_eq!(state.snapshot().transferred, 5);
    }

    #[tokio::test]
    async fn cancelled_move_sends_no_batch_request() {
        let server = batch_server().await;
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context(
            config(dir.path(), &server),
            TaskType::SyncCopy,
            Action::Move,
            repo("/docs/a.txt"),
            repo("/backup/"),
        );
        ctx.token().cancel();

        let err = SyncCopyHandler.execute(&ctx).await.unwrap_err();

        assert!(matches!(err, PasteError::Cancelled), "{err:?}");
        assert!(
            requests_to(&server, "POST", "/api/v2.1/repos/sync-batch-move-item/")
                .await
                .is_empty()
        );
    }
}
