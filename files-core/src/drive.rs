use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::client::{ApiError, Endpoint, ensure_success, handle_response};

/// Client for the cloud-drive gateway. Every account the gateway knows about is
/// addressed by its drive name.
#[derive(Clone)]
pub struct DriveClient {
    endpoint: Endpoint,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct DriveItem {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveItemList {
    items: Vec<DriveItem>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Deserialize)]
struct JobCreated {
    job_id: JobId,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct JobStatus {
    pub finished: bool,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct JobStats {
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct DriveUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    src_drive: &'a str,
    src_path: &'a str,
    dst_drive: &'a str,
    dst_path: &'a str,
}

#[derive(Debug, Serialize)]
struct FolderRequest<'a> {
    path: &'a str,
}

/// Endpoints of a server-side transfer.
#[derive(Debug, Clone, Copy)]
pub struct DriveTransfer<'a> {
    pub src_drive: &'a str,
    pub src_path: &'a str,
    pub dst_drive: &'a str,
    pub dst_path: &'a str,
}

impl DriveClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, ApiError> {
        Self::with_http(Client::new(), base_url, token)
    }

    pub fn with_http(http: Client, base_url: &str, token: &str) -> Result<Self, ApiError> {
        Ok(Self {
            endpoint: Endpoint::new(http, base_url, format!("Bearer {token}"))?,
        })
    }

    pub async fn list(&self, drive: &str, path: &str) -> Result<Vec<DriveItem>, ApiError> {
        let mut url = self.endpoint.url(&format!("/v1/drives/{drive}/items"))?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self.endpoint.get(url).send().await?;
        let list: DriveItemList = handle_response(response).await?;
        Ok(list.items)
    }

    /// Returns `None` when nothing exists at `path`.
    pub async fn stat(&self, drive: &str, path: &str) -> Result<Option<DriveItem>, ApiError> {
        let mut url = self.endpoint.url(&format!("/v1/drives/{drive}/item"))?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self.endpoint.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(handle_response(response).await?))
    }

    pub async fn create_folder(&self, drive: &str, path: &str) -> Result<DriveItem, ApiError> {
        let url = self.endpoint.url(&format!("/v1/drives/{drive}/folders"))?;
        let response = self
            .endpoint
            .post(url)
            .json(&FolderRequest { path })
            .send()
            .await?;
        handle_response(response).await
    }

    pub async fn delete(&self, drive: &str, path: &str) -> Result<(), ApiError> {
        let mut url = self.endpoint.url(&format!("/v1/drives/{drive}/item"))?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self.endpoint.delete(url).send().await?;
        ensure_success(response).await?;
        Ok(())
    }

    pub async fn copy(&self, transfer: DriveTransfer<'_>) -> Result<JobId, ApiError> {
        self.start_job("/v1/jobs/copy", transfer).await
    }

    pub async fn move_item(&self, transfer: DriveTransfer<'_>) -> Result<JobId, ApiError> {
        self.start_job("/v1/jobs/move", transfer).await
    }

    pub async fn usage(&self, drive: &str) -> Result<DriveUsage, ApiError> {
        let url = self.endpoint.url(&format!("/v1/drives/{drive}/about"))?;
        let response = self.endpoint.get(url).send().await?;
        handle_response(response).await
    }

    pub async fn open_content(
        &self,
        drive: &str,
        path: &str,
    ) -> Result<reqwest::Response, ApiError> {
        let mut url = self.endpoint.url(&format!("/v1/drives/{drive}/content"))?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self.endpoint.get(url).send().await?;
        ensure_success(response).await
    }

    /// Streams `body` to `path`. The gateway commits the object asynchronously
    /// and answers with the job tracking that commit.
    pub async fn upload(
        &self,
        drive: &str,
        path: &str,
        size: u64,
        body: reqwest::Body,
    ) -> Result<JobId, ApiError> {
        let mut url = self.endpoint.url(&format!("/v1/drives/{drive}/content"))?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .endpoint
            .put(url)
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await?;
        let created: JobCreated = handle_response(response).await?;
        Ok(created.job_id)
    }

    pub async fn job_status(&self, job: JobId) -> Result<JobStatus, ApiError> {
        let url = self.endpoint.url(&format!("/v1/jobs/{job}/status"))?;
        let response = self.endpoint.get(url).send().await?;
        handle_response(response).await
    }

    pub async fn job_stats(&self, job: JobId) -> Result<JobStats, ApiError> {
        let url = self.endpoint.url(&format!("/v1/jobs/{job}/stats"))?;
        let response = self.endpoint.get(url).send().await?;
        handle_response(response).await
    }

    pub async fn stop_job(&self, job: JobId) -> Result<(), ApiError> {
        let url = self.endpoint.url(&format!("/v1/jobs/{job}/stop"))?;
        let response = self.endpoint.post(url).send().await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn start_job(&self, path: &str, transfer: DriveTransfer<'_>) -> Result<JobId, ApiError> {
        let url = self.endpoint.url(path)?;
        let response = self
            .endpoint
            .post(url)
            .json(&TransferRequest {
                src_drive: transfer.src_drive,
                src_path: transfer.src_path,
                dst_drive: transfer.dst_drive,
                dst_path: transfer.dst_path,
            })
            .send()
            .await?;
        let created: JobCreated = handle_response(response).await?;
        Ok(created.job_id)
    }
}
