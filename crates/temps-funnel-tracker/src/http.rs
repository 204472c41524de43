//! HTTP collaborator for definition reads and event writes

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{TrackerError, TrackerResult};

/// Background send started by [`HttpClient::send_beacon`]
pub type BeaconHandle = JoinHandle<TrackerResult<()>>;

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// GET a JSON document. Non-2xx statuses are errors.
    async fn get_json(&self, url: &str) -> TrackerResult<Value>;

    /// POST a JSON body and wait for the response.
    async fn post_json(&self, url: &str, body: String) -> TrackerResult<()>;

    /// Start a POST that keeps running even if the caller's future is
    /// dropped. The handle resolves to the delivery result.
    ///
    /// `None` means the client cannot send this way and the caller should
    /// fall back to [`HttpClient::post_json`].
    fn send_beacon(&self, _url: &str, _body: String) -> Option<BeaconHandle> {
        None
    }
}

/// `reqwest` backed client.
///
/// No cookie store is configured and no auth headers are set, so requests
/// never carry credentials. Pooled connections are kept alive so that a
/// request started right before shutdown still has a warm connection.
#[derive(Clone)]
pub struct ReqwestClient {
    client: Client,
}

impl ReqwestClient {
    pub fn new(timeout: Duration) -> TrackerResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| TrackerError::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn post(client: &Client, url: &str, body: String) -> TrackerResult<()> {
        let response = client
            .post(url)
            .header("Content-Type", "application/json")
            .header("Connection", "keep-alive")
            .body(body)
            .send()
            .await
            .map_err(|e| TrackerError::Network(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get_json(&self, url: &str) -> TrackerResult<Value> {
        debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| TrackerError::Network(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| TrackerError::Network(format!("Failed to read response: {}", e)))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn post_json(&self, url: &str, body: String) -> TrackerResult<()> {
        debug!("POST {}", url);
        Self::post(&self.client, url, body).await
    }

    fn send_beacon(&self, url: &str, body: String) -> Option<BeaconHandle> {
        let handle = tokio::runtime::Handle::try_current().ok()?;

        debug!("Beacon POST {}", url);
        let client = self.client.clone();
        let url = url.to_string();
        Some(handle.spawn(async move { Self::post(&client, &url, body).await }))
    }
}
