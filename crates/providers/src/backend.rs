use async_trait::async_trait;
use deskmate_core::capability::RemoteBackend;
use deskmate_core::config::BackendConfig;
use deskmate_core::{Error, Result};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::client::{build_http_client, normalize_base};

/// The remote orchestration service, reached over HTTP.
///
/// `GET {url}/health` answers the reachability probe and
/// `POST {url}/classify` with `{"message": ...}` returns an intent payload.
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(url: &str, config: &BackendConfig) -> Self {
        let base_url = normalize_base(url);
        let client = build_http_client(&base_url, Duration::from_secs(config.timeout_secs.max(1)));
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn is_available(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, url = %url, "Backend health check failed");
                false
            }
        }
    }

    async fn classify(&self, message: &str) -> Result<Value> {
        let url = format!("{}/classify", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "message": message }))
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Backend request failed: {}", e)))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            warn!(status = %status, "Backend classify error");
            return Err(Error::Provider(format!("Backend error {}: {}", status, raw_body)));
        }

        // Some deployments answer with a bare intent string instead of JSON.
        Ok(serde_json::from_str(&raw_body).unwrap_or(Value::String(raw_body)))
    }
}
