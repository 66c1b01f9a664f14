use std::collections::HashMap;

use files_core::{ApiError, DriveClient, PeerClient, SyncClient, http_client};

use super::registry::UploadRegistry;
use crate::config::EngineConfig;
use crate::storage::{FileType, LocatorError, StorageLocator};

/// Everything a handler needs to reach storage: the locator, one client per
/// configured collaborator and the upload bookkeeping. Built once and shared
/// by every task.
pub struct Backends {
    config: EngineConfig,
    locator: StorageLocator,
    sync: Option<SyncClient>,
    drive: Option<DriveClient>,
    peers: HashMap<String, PeerClient>,
    uploads: UploadRegistry,
}

impl Backends {
    pub fn new(config: EngineConfig) -> Result<Self, ApiError> {
        let http = http_client(Some(config.http_timeout))?;
        let sync = config
            .sync
            .as_ref()
            .map(|remote| SyncClient::with_http(http.clone(), &remote.base_url, &remote.token))
            .transpose()?;
        let drive = config
            .drive
            .as_ref()
            .map(|remote| DriveClient::with_http(http.clone(), &remote.base_url, &remote.token))
            .transpose()?;
        let mut peers = HashMap::new();
        for (name, remote) in &config.peers {
            peers.insert(
                name.clone(),
                PeerClient::with_http(http.clone(), &remote.base_url, &remote.token)?,
            );
        }
        Ok(Self {
            locator: StorageLocator::new(&config),
            config,
            sync,
            drive,
            peers,
            uploads: UploadRegistry::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn locator(&self) -> &StorageLocator {
        &self.locator
    }

    pub fn uploads(&self) -> &UploadRegistry {
        &self.uploads
    }

    pub fn sync(&self, repo: &str) -> Result<&SyncClient, LocatorError> {
        self.sync.as_ref().ok_or_else(|| LocatorError::BackendNotFound {
            file_type: FileType::Sync,
            extend: repo.to_string(),
        })
    }

    pub fn drive(&self, kind: FileType, account: &str) -> Result<&DriveClient, LocatorError> {
        self.drive.as_ref().ok_or_else(|| LocatorError::BackendNotFound {
            file_type: kind,
            extend: account.to_string(),
        })
    }

    pub fn peer(&self, node: &str) -> Result<&PeerClient, LocatorError> {
        self.peers.get(node).ok_or_else(|| LocatorError::BackendNotFound {
            file_type: FileType::Drive,
            extend: node.to_string(),
        })
    }
}
