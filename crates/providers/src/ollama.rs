use async_trait::async_trait;
use deskmate_core::capability::{LlmReply, LocalLlm};
use deskmate_core::config::LocalLlmConfig;
use deskmate_core::{Error, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::client::{build_http_client, normalize_base};

/// Ollama-backed implementation of the local model interface.
pub struct OllamaClient {
    client: Client,
    probe: Client,
    api_base: String,
    model: String,
    temperature: f32,
}

impl OllamaClient {
    pub fn new(config: &LocalLlmConfig) -> Self {
        let api_base = normalize_base(&config.api_base);
        // Local inference is slow on CPU, the query timeout is configurable.
        let client = build_http_client(&api_base, Duration::from_secs(config.timeout_secs.max(1)));
        let probe = build_http_client(&api_base, Duration::from_secs(3));
        Self {
            client,
            probe,
            api_base,
            model: config.model.clone(),
            temperature: config.temperature,
        }
    }

    /// Strip an "ollama/" prefix; the API expects the bare model tag.
    fn normalize_model(model: &str) -> &str {
        model.strip_prefix("ollama/").unwrap_or(model)
    }

    fn build_request(&self, prompt: &str, options: &Value) -> ChatRequest {
        let model = options
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.model);
        let temperature = options
            .get("temperature")
            .and_then(|v| v.as_f64())
            .map(|t| t as f32)
            .unwrap_or(self.temperature);

        let mut messages = Vec::new();
        if let Some(system) = options.get("system").and_then(|v| v.as_str()) {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.to_string(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });

        let json_mode = options.get("json").and_then(|v| v.as_bool()).unwrap_or(false)
            || options.get("format").and_then(|v| v.as_str()) == Some("json");

        ChatRequest {
            model: Self::normalize_model(model).to_string(),
            messages,
            stream: false,
            format: json_mode.then(|| "json".to_string()),
            options: ChatOptions {
                temperature,
                num_predict: options.get("maxTokens").and_then(|v| v.as_u64()),
            },
        }
    }
}

#[async_trait]
impl LocalLlm for OllamaClient {
    async fn query(&self, prompt: &str, options: &Value) -> Result<LlmReply> {
        let url = format!("{}/api/chat", self.api_base);
        let request = self.build_request(prompt, options);

        info!(url = %url, model = %request.model, prompt_len = prompt.len(), "Calling Ollama API");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Ollama request failed: {}", e)))?;

        let status = response.status();
        let raw_body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            error!(status = %status, body = %raw_body, "Ollama API error");
            return Err(Error::Provider(format!("Ollama API error {}: {}", status, raw_body)));
        }

        debug!(body_len = raw_body.len(), "Ollama raw response");

        let resp: ChatResponse = serde_json::from_str(&raw_body).map_err(|e| {
            let preview_end = raw_body
                .char_indices()
                .nth(500)
                .map(|(i, _)| i)
                .unwrap_or(raw_body.len());
            Error::Provider(format!(
                "Failed to parse Ollama response: {}. Body: {}",
                e,
                &raw_body[..preview_end]
            ))
        })?;

        let text = resp.message.content.trim().to_string();
        Ok(LlmReply {
            success: !text.is_empty(),
            response: text,
            model: resp.model.or(Some(request.model)),
        })
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.api_base);
        match self.probe.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "Ollama not reachable");
                false
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    options: ChatOptions,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_model() {
        assert_eq!(OllamaClient::normalize_model("ollama/llama3"), "llama3");
        assert_eq!(OllamaClient::normalize_model("qwen2.5:7b"), "qwen2.5:7b");
    }

    #[test]
    fn test_build_request_options() {
        let client = OllamaClient::new(&LocalLlmConfig::default());
        let req = client.build_request(
            "hello",
            &json!({"system": "be brief", "json": true, "temperature": 0.0, "model": "ollama/phi3"}),
        );
        assert_eq!(req.model, "phi3");
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, "system");
        assert_eq!(req.format.as_deref(), Some("json"));
        assert_eq!(req.options.temperature, 0.0);

        let req = client.build_request("hello", &Value::Null);
        assert_eq!(req.model, "llama3.2");
        assert_eq!(req.messages.len(), 1);
        assert!(req.format.is_none());
    }

    #[test]
    fn test_parse_response() {
        let raw = r#"{
            "model": "llama3.2",
            "message": { "role": "assistant", "content": " Hi there! " },
            "done": true
        }"#;
        let resp: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.message.content.trim(), "Hi there!");
        assert_eq!(resp.model.as_deref(), Some("llama3.2"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let config = LocalLlmConfig {
            api_base: "http://127.0.0.1:9".to_string(),
            ..LocalLlmConfig::default()
        };
        let client = OllamaClient::new(&config);
        assert!(!client.is_available().await);
        assert!(client.query("ping", &Value::Null).await.is_err());
    }
}
