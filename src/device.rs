//! HTTP client for the upstream receiver and its account service.
//!
//! This is the gateway's only upstream boundary: watch requests that turn
//! a device-hosted channel into a playable URL, device metadata (tuner
//! count), and the raw lineup / guide payloads the refresh tasks consume.
//! No credential exchange lives here; the account token is handed in at
//! construction.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::directory::{ChannelDescriptor, SourceKind};

/// Errors from upstream requests. Every variant maps to a 5xx at the
/// request boundary; none are fatal to the gateway.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upstream returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

/// Configuration for the upstream client.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Base URL of the receiver's API, e.g. `https://device.example/api`.
    pub base_url: String,
    /// Bearer token for the account service.
    pub token: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

/// Client for the tuner-bearing receiver.
pub struct DeviceClient {
    http: reqwest::Client,
    config: DeviceConfig,
}

#[derive(Debug, Deserialize)]
struct WatchResponse {
    playlist_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServerInfoResponse {
    tuner_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct LineupEntry {
    channel_id: String,
    number: String,
    name: String,
    #[serde(default)]
    stream_url: Option<String>,
}

impl DeviceClient {
    pub fn new(config: DeviceConfig) -> Result<Self, DeviceError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Two-phase watch request: ask the receiver to start streaming the
    /// channel, returning the playlist URL the transcoder should consume.
    pub async fn watch(&self, channel_id: &str) -> Result<String, DeviceError> {
        let url = self.url(&format!("guide/channels/{}/watch", channel_id));
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DeviceError::Status(response.status()));
        }

        let body: WatchResponse = response.json().await?;
        body.playlist_url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| DeviceError::Malformed("watch response missing playlist_url".into()))
    }

    /// Number of tuners the receiver reports. Used once at startup to size
    /// the admission pool.
    pub async fn tuner_count(&self) -> Result<u32, DeviceError> {
        let url = self.url("server/info");
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DeviceError::Status(response.status()));
        }

        let body: ServerInfoResponse = response.json().await?;
        body.tuner_count
            .ok_or_else(|| DeviceError::Malformed("server info missing tuner_count".into()))
    }

    /// Fetch the full channel lineup and shape it into directory entries.
    pub async fn fetch_lineup(
        &self,
    ) -> Result<HashMap<String, ChannelDescriptor>, DeviceError> {
        let url = self.url("guide/channels");
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DeviceError::Status(response.status()));
        }

        let entries: Vec<LineupEntry> = response.json().await?;
        Ok(entries
            .into_iter()
            .map(|e| {
                let descriptor = match e.stream_url {
                    Some(url) if !url.is_empty() => ChannelDescriptor {
                        id: e.channel_id.clone(),
                        display_number: e.number,
                        display_name: e.name,
                        source: SourceKind::DirectUrl,
                        locator: url,
                    },
                    _ => ChannelDescriptor {
                        id: e.channel_id.clone(),
                        display_number: e.number,
                        display_name: e.name,
                        source: SourceKind::DeviceHosted,
                        locator: e.channel_id.clone(),
                    },
                };
                (e.channel_id, descriptor)
            })
            .collect())
    }

    /// Fetch the raw program-guide payload (served as-is at /guide.xml).
    pub async fn fetch_guide(&self) -> Result<String, DeviceError> {
        let url = self.url("guide/xmltv");
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DeviceError::Status(response.status()));
        }

        Ok(response.text().await?)
    }
}
