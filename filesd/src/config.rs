use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

const DEFAULT_NODE_NAME: &str = "local";
const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;
const DEFAULT_UPLOAD_RETRIES: u64 = 3;
const DEFAULT_RETRY_BASE_MS: u64 = 500;
const DEFAULT_JOB_POLL_MS: u64 = 5_000;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 120;
const DEFAULT_USAGE_CEILING: u64 = 98;

/// Base URL and credential of one REST collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteConfig {
    pub base_url: String,
    pub token: String,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub node_name: String,
    pub drive_root: PathBuf,
    pub cache_root: PathBuf,
    pub external_root: PathBuf,
    pub sync: Option<RemoteConfig>,
    pub drive: Option<RemoteConfig>,
    pub peers: BTreeMap<String, RemoteConfig>,
    pub chunk_size: u64,
    pub upload_retries: u32,
    pub retry_base: Duration,
    pub job_poll_interval: Duration,
    pub http_timeout: Duration,
    /// Destinations whose used percentage already exceeds this are refused.
    pub disk_usage_ceiling: Option<u8>,
    pub use_rsync: bool,
}

impl EngineConfig {
    /// Defaults for a single node rooted at the given directories, with no
    /// remote collaborators configured.
    pub fn for_roots(node_name: impl Into<String>, drive_root: &Path, cache_root: &Path) -> Self {
        Self {
            node_name: node_name.into(),
            drive_root: drive_root.to_path_buf(),
            cache_root: cache_root.to_path_buf(),
            external_root: drive_root.join("External"),
            sync: None,
            drive: None,
            peers: BTreeMap::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            upload_retries: DEFAULT_UPLOAD_RETRIES as u32,
            retry_base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            job_poll_interval: Duration::from_millis(DEFAULT_JOB_POLL_MS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            disk_usage_ceiling: Some(DEFAULT_USAGE_CEILING as u8),
            use_rsync: true,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let drive_root = std::env::var("FILES_DRIVE_ROOT")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join("Files"));
        let cache_root = std::env::var("FILES_CACHE_ROOT")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_cache_root);
        let node_name =
            std::env::var("FILES_NODE_NAME").unwrap_or_else(|_| DEFAULT_NODE_NAME.to_string());

        let mut config = Self::for_roots(node_name, &drive_root, &cache_root);
        if let Ok(value) = std::env::var("FILES_EXTERNAL_ROOT") {
            config.external_root = expand_with_home(&value, &home);
        }
        config.sync = read_remote_env("FILES_SYNC_URL", "FILES_SYNC_TOKEN")?;
        config.drive = read_remote_env("FILES_DRIVE_URL", "FILES_DRIVE_TOKEN")?;
        if let Ok(value) = std::env::var("FILES_PEERS") {
            let token = std::env::var("FILES_PEER_TOKEN").unwrap_or_default();
            config.peers = parse_peers(&value, &token)?;
        }
        config.chunk_size = read_u64_env("FILES_CHUNK_SIZE", DEFAULT_CHUNK_SIZE);
        config.upload_retries =
            read_u64_env("FILES_UPLOAD_RETRIES", DEFAULT_UPLOAD_RETRIES).min(u32::MAX as u64) as u32;
        config.job_poll_interval =
            Duration::from_millis(read_u64_env("FILES_JOB_POLL_MS", DEFAULT_JOB_POLL_MS));
        config.http_timeout = Duration::from_secs(read_u64_env(
            "FILES_HTTP_TIMEOUT_SECS",
            DEFAULT_HTTP_TIMEOUT_SECS,
        ));
        config.disk_usage_ceiling = read_ceiling_env("FILES_DISK_USAGE_CEILING")?;
        config.use_rsync = read_bool_env("FILES_USE_RSYNC", true);
        Ok(config)
    }
}

fn read_remote_env(url_var: &str, token_var: &str) -> anyhow::Result<Option<RemoteConfig>> {
    let Ok(base_url) = std::env::var(url_var) else {
        return Ok(None);
    };
    let token = std::env::var(token_var).with_context(|| format!("{token_var} is not set"))?;
    Ok(Some(RemoteConfig { base_url, token }))
}

/// Parses `name=url,name=url`. Every peer shares the same node token.
pub(crate) fn parse_peers(value: &str, token: &str) -> anyhow::Result<BTreeMap<String, RemoteConfig>> {
    let mut peers = BTreeMap::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, url) = entry
            .split_once('=')
            .with_context(|| format!("peer entry {entry:?} must look like name=url"))?;
        let name = name.trim();
        anyhow::ensure!(!name.is_empty(), "peer entry {entry:?} has an empty name");
        peers.insert(
            name.to_string(),
            RemoteConfig {
                base_url: url.trim().to_string(),
                token: token.to_string(),
            },
        );
    }
    Ok(peers)
}

fn read_ceiling_env(name: &str) -> anyhow::Result<Option<u8>> {
    match std::env::var(name) {
        Err(_) => Ok(Some(DEFAULT_USAGE_CEILING as u8)),
        Ok(value) if matches!(value.trim(), "" | "off" | "none") => Ok(None),
        Ok(value) => {
            let percent: u8 = value
                .trim()
                .parse()
                .with_context(|| format!("{name} must be a percentage, got {value:?}"))?;
            anyhow::ensure!(percent <= 100, "{name} must not exceed 100");
            Ok(Some(percent))
        }
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("filesd")
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_numbers_from_env_or_default() {
        assert_eq!(read_u64_env("NO_SUCH_ENV_FOR_FILESD_TEST", 42), 42);
    }

    #[test]
    fn rsync_is_enabled_by_default() {
        assert!(read_bool_env("NO_SUCH_BOOL_ENV_FOR_FILESD_TEST", true));
    }

    #[test]
    fn expands_home_prefix() {
        let home = PathBuf::from("/home/u");
        assert_eq!(expand_with_home("~/Files", &home), PathBuf::from("/home/u/Files"));
        assert_eq!(expand_with_home("/srv", &home), PathBuf::from("/srv"));
    }

    #[test]
    fn parses_peer_list() {
        let peers = parse_peers("node-b=http://10.0.0.2:8080, node-c=http://c", "t").unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers["node-b"].base_url, "http://10.0.0.2:8080");
        assert_eq!(peers["node-c"].token, "t");
        assert!(parse_peers("broken", "t").is_err());
    }

    #[test]
    fn defaults_match_transfer_policy() {
        let config = EngineConfig::for_roots("n1", Path::new("/d"), Path::new("/c"));
        assert_eq!(config.chunk_size, 8 * 1024 * 1024);
        assert_eq!(config.upload_retries, 3);
        assert_eq!(config.job_poll_interval, Duration::from_secs(5));
    }
}
