use reqwest::{
    Client, StatusCode,
    multipart::{Form, Part},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::client::{ApiError, Endpoint, ensure_success, handle_response};

/// Client for the repository-based sync service.
#[derive(Clone)]
pub struct SyncClient {
    endpoint: Endpoint,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DirentType {
    File,
    Dir,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Dirent {
    #[serde(rename = "type")]
    pub dirent_type: DirentType,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mtime: Option<i64>,
    #[serde(default)]
    pub id: Option<String>,
}

impl Dirent {
    pub fn is_dir(&self) -> bool {
        self.dirent_type == DirentType::Dir
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FileDetail {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mtime: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountInfo {
    pub total: i64,
    pub usage: i64,
}

impl AccountInfo {
    /// Remaining quota in bytes, `None` when the account is unlimited.
    pub fn available(&self) -> Option<u64> {
        if self.total < 0 {
            return None;
        }
        Some(self.total.saturating_sub(self.usage).max(0) as u64)
    }
}

/// One `Content-Range` slice of a resumable upload.
#[derive(Debug, Clone)]
pub struct UploadChunk {
    pub parent_dir: String,
    pub file_name: String,
    pub relative_path: Option<String>,
    pub start: u64,
    pub bytes: Vec<u8>,
    pub total: u64,
}

impl UploadChunk {
    pub fn end(&self) -> u64 {
        (self.start + self.bytes.len() as u64).saturating_sub(1)
    }

    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end(), self.total)
    }

    pub fn is_last(&self) -> bool {
        self.start + self.bytes.len() as u64 >= self.total
    }
}

#[derive(Debug, Serialize)]
struct BatchCopyRequest<'a> {
    src_repo_id: &'a str,
    src_parent_dir: &'a str,
    src_dirents: &'a [String],
    dst_repo_id: &'a str,
    dst_parent_dir: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dst_dirents: Option<&'a [String]>,
}

#[derive(Debug, Serialize)]
struct BatchDeleteRequest<'a> {
    repo_id: &'a str,
    parent_dir: &'a str,
    dirents: &'a [String],
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error_msg: Option<String>,
}

/// Source and destination of a batch copy or move inside the sync service.
#[derive(Debug, Clone, Copy)]
pub struct BatchTarget<'a> {
    pub src_repo: &'a str,
    pub src_parent: &'a str,
    pub dst_repo: &'a str,
    pub dst_parent: &'a str,
}

impl SyncClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, ApiError> {
        Self::with_http(Client::new(), base_url, token)
    }

    pub fn with_http(http: Client, base_url: &str, token: &str) -> Result<Self, ApiError> {
        Ok(Self {
            endpoint: Endpoint::new(http, base_url, format!("Token {token}"))?,
        })
    }

    pub async fn list_dir(&self, repo: &str, path: &str) -> Result<Vec<Dirent>, ApiError> {
        let mut url = self.endpoint.url(&format!("/api2/repos/{repo}/dir/"))?;
        url.query_pairs_mut().append_pair("p", path);
        let response = self.endpoint.get(url).send().await?;
        handle_response(response).await
    }

    /// Returns `None` when the file does not exist.
    pub async fn file_detail(&self, repo: &str, path: &str) -> Result<Option<FileDetail>, ApiError> {
        let mut url = self
            .endpoint
            .url(&format!("/api2/repos/{repo}/file/detail/"))?;
        url.query_pairs_mut().append_pair("p", path);
        let response = self.endpoint.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(handle_response(response).await?))
    }

    pub async fn create_dir(&self, repo: &str, path: &str) -> Result<(), ApiError> {
        let mut url = self.endpoint.url(&format!("/api2/repos/{repo}/dir/"))?;
        url.query_pairs_mut().append_pair("p", path);
        let response = self
            .endpoint
            .post(url)
            .form(&[("operation", "mkdir")])
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    pub async fn upload_link(&self, repo: &str, parent_dir: &str) -> Result<Url, ApiError> {
        let mut url = self
            .endpoint
            .url(&format!("/api2/repos/{repo}/upload-link/"))?;
        url.query_pairs_mut().append_pair("p", parent_dir);
        let response = self.endpoint.get(url).send().await?;
        let link: String = handle_response(response).await?;
        Ok(Url::parse(&link)?)
    }

    pub async fn download_link(&self, repo: &str, path: &str) -> Result<Url, ApiError> {
        let mut url = self.endpoint.url(&format!("/api2/repos/{repo}/file/"))?;
        url.query_pairs_mut()
            .append_pair("p", path)
            .append_pair("reuse", "1");
        let response = self.endpoint.get(url).send().await?;
        let link: String = handle_response(response).await?;
        Ok(Url::parse(&link)?)
    }

    /// Opens the body of a previously issued download link.
    pub async fn open_download(&self, link: Url) -> Result<reqwest::Response, ApiError> {
        let response = self.endpoint.get(link).send().await?;
        ensure_success(response).await
    }

    pub async fn upload_chunk(&self, link: &Url, chunk: &UploadChunk) -> Result<(), ApiError> {
        let mut url = link.clone();
        url.query_pairs_mut().append_pair("ret-json", "1");
        let part = Part::bytes(chunk.bytes.clone()).file_name(chunk.file_name.clone());
        let mut form = Form::new()
            .text("parent_dir", chunk.parent_dir.clone())
            .part("file", part);
        if let Some(relative) = &chunk.relative_path {
            form = form.text("relative_path", relative.clone());
        }
        let mut request = self.endpoint.post(url).header(
            "Content-Disposition",
            format!("attachment; filename=\"{}\"", chunk.file_name),
        );
        // Empty files go up as a single plain multipart request.
        if chunk.total > 0 {
            request = request.header("Content-Range", chunk.content_range());
        }
        let response = request.multipart(form).send().await?;
        ensure_success(response).await?;
        Ok(())
    }

    pub async fn batch_copy(
        &self,
        target: BatchTarget<'_>,
        names: &[String],
    ) -> Result<(), ApiError> {
        self.batch("/api/v2.1/repos/sync-batch-copy-item/", target, names, None)
            .await
    }

    /// Copies `names` and stores them under `new_names` (same order) in the
    /// destination directory.
    pub async fn batch_copy_as(
        &self,
        target: BatchTarget<'_>,
        names: &[String],
        new_names: &[String],
    ) -> Result<(), ApiError> {
        self.batch(
            "/api/v2.1/repos/sync-batch-copy-item/",
            target,
            names,
            Some(new_names),
        )
        .await
    }

    pub async fn batch_move(
        &self,
        target: BatchTarget<'_>,
        names: &[String],
    ) -> Result<(), ApiError> {
        self.batch("/api/v2.1/repos/sync-batch-move-item/", target, names, None)
            .await
    }

    pub async fn batch_move_as(
        &self,
        target: BatchTarget<'_>,
        names: &[String],
        new_names: &[String],
    ) -> Result<(), ApiError> {
        self.batch(
            "/api/v2.1/repos/sync-batch-move-item/",
            target,
            names,
            Some(new_names),
        )
        .await
    }

    pub async fn batch_delete(
        &self,
        repo: &str,
        parent_dir: &str,
        names: &[String],
    ) -> Result<(), ApiError> {
        let url = self.endpoint.url("/api/v2.1/repos/batch-delete-item/")?;
        let response = self
            .endpoint
            .delete(url)
            .json(&BatchDeleteRequest {
                repo_id: repo,
                parent_dir,
                dirents: names,
            })
            .send()
            .await?;
        let payload: BatchResponse = handle_response(response).await?;
        batch_result(payload)
    }

    pub async fn account_info(&self) -> Result<AccountInfo, ApiError> {
        let url = self.endpoint.url("/api2/account/info/")?;
        let response = self.endpoint.get(url).send().await?;
        handle_response(response).await
    }

    async fn batch(
        &self,
        path: &str,
        target: BatchTarget<'_>,
        names: &[String],
        new_names: Option<&[String]>,
    ) -> Result<(), ApiError> {
        if new_names.is_some_and(|renamed| renamed.len() != names.len()) {
            return Err(ApiError::Malformed(
                "renamed entries do not match source entries".to_string(),
            ));
        }
        let url = self.endpoint.url(path)?;
        let response = self
            .endpoint
            .post(url)
            .json(&BatchCopyRequest {
                src_repo_id: target.src_repo,
                src_parent_dir: target.src_parent,
                src_dirents: names,
                dst_repo_id: target.dst_repo,
                dst_parent_dir: target.dst_parent,
                dst_dirents: new_names,
            })
            .send()
            .await?;
        let payload: BatchResponse = handle_response(response).await?;
        batch_result(payload)
    }
}

fn batch_result(payload: BatchResponse) -> Result<(), ApiError> {
    if payload.success {
        Ok(())
    } else {
        Err(ApiError::Malformed(
            payload
                .error_msg
                .unwrap_or_else(|| "batch operation reported failure".to_string()),
        ))
    }
}
