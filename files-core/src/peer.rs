use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::client::{ApiError, Endpoint, ensure_success};

/// Client for another node's files API, used for direct node-to-node copies.
#[derive(Clone)]
pub struct PeerClient {
    endpoint: Endpoint,
}

/// One entry of a peer's recursive listing. `path` is relative to the listed
/// root and uses `/` separators.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct PeerEntry {
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub is_dir: bool,
}

impl PeerClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, ApiError> {
        Self::with_http(Client::new(), base_url, token)
    }

    pub fn with_http(http: Client, base_url: &str, token: &str) -> Result<Self, ApiError> {
        Ok(Self {
            endpoint: Endpoint::new(http, base_url, format!("Bearer {token}"))?,
        })
    }

    /// Reads the server-sent-events listing of `path` until the stream ends.
    pub async fn list_tree(&self, owner: &str, path: &str) -> Result<Vec<PeerEntry>, ApiError> {
        let mut url = self.endpoint.url("/api/paste/stream")?;
        url.query_pairs_mut()
            .append_pair("owner", owner)
            .append_pair("path", path);
        let response = self
            .endpoint
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let mut parser = SseParser::default();
        let mut entries = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            for event in parser.feed(&chunk?) {
                entries.push(parse_entry(&event)?);
            }
        }
        if let Some(event) = parser.finish() {
            entries.push(parse_entry(&event)?);
        }
        Ok(entries)
    }

    pub async fn open_raw(&self, owner: &str, path: &str) -> Result<reqwest::Response, ApiError> {
        let mut url = self.endpoint.url("/api/raw")?;
        url.query_pairs_mut()
            .append_pair("owner", owner)
            .append_pair("path", path);
        let response = self.endpoint.get(url).send().await?;
        ensure_success(response).await
    }

    pub async fn delete(&self, owner: &str, path: &str) -> Result<(), ApiError> {
        let mut url = self.endpoint.url("/api/resources")?;
        url.query_pairs_mut()
            .append_pair("owner", owner)
            .append_pair("path", path);
        let response = self.endpoint.delete(url).send().await?;
        ensure_success(response).await?;
        Ok(())
    }
}

fn parse_entry(data: &str) -> Result<PeerEntry, ApiError> {
    serde_json::from_str(data)
        .map_err(|err| ApiError::Malformed(format!("invalid listing event {data:?}: {err}")))
}

/// Incremental `text/event-stream` decoder yielding the `data` payload of each
/// complete event. Comment lines and other fields are ignored.
#[derive(Debug, Default)]
pub struct SseParser {
    pending: Vec<u8>,
    data: Vec<String>,
}

impl SseParser {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if line.is_empty() {
                if let Some(event) = self.take_event() {
                    events.push(event);
                }
                continue;
            }
            if let Some(value) = line.strip_prefix("data:") {
                self.data
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        events
    }

    /// Flushes an event left unterminated when the stream closed.
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending.is_empty() {
            let mut tail = std::mem::take(&mut self.pending);
            tail.push(b'\n');
            let _ = self.feed(&tail);
        }
        self.take_event()
    }

    fn take_event(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.data).join("\n"))
    }
}
