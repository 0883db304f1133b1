//! Message handling when the remote backend is out of reach.

use deskmate_core::{AgentContext, IntentPayload};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::classifier::GREETING_REPLY;
use crate::orchestrator::{describe_step, Orchestrator};
use crate::router::{build_params, normalize_intent_payload};
use crate::workflow::StepResult;

pub const LIMITED_MODE_REPLY: &str = "I'm running in limited local mode right now, so I can't answer \
that yet. I can still remember things, set reminders and run simple commands.";

/// Structured reply from the local path. `message` is always readable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalResponse {
    pub success: bool,
    pub intent: String,
    pub message: String,
    #[serde(default)]
    pub data: Value,
    /// `local` or `remote`.
    pub mode: String,
}

impl LocalResponse {
    fn local(success: bool, intent: &str, message: impl Into<String>, data: Value) -> Self {
        Self {
            success,
            intent: intent.to_string(),
            message: message.into(),
            data,
            mode: "local".to_string(),
        }
    }

    fn from_ask(intent: &str, outcome: Value, mode: &str) -> Self {
        Self {
            success: outcome.get("success").and_then(|v| v.as_bool()).unwrap_or(false),
            intent: intent.to_string(),
            message: outcome
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or(LIMITED_MODE_REPLY)
                .to_string(),
            data: outcome,
            mode: mode.to_string(),
        }
    }
}

impl Orchestrator {
    async fn classify_locally(&self, message: &str, context: &Map<String, Value>) -> IntentPayload {
        let output = self
            .run_agent(
                "intent_classifier",
                json!({"message": message}),
                AgentContext::new().with_shared(context.clone()),
            )
            .await;
        if output.success {
            let mut payload = normalize_intent_payload(&output.result);
            if payload.source_text.trim().is_empty() {
                payload.source_text = message.to_string();
            }
            return payload;
        }
        debug!(error = ?output.error, "Classifier agent unavailable, using built-in rules");
        self.inner.rules.classify(message)
    }

    /// Answer `message` without the remote backend. A `pre_classified`
    /// payload skips classification.
    pub async fn handle_local_orchestration(
        &self,
        message: &str,
        pre_classified: Option<&Value>,
        context: Map<String, Value>,
    ) -> LocalResponse {
        let payload = match pre_classified {
            Some(raw) => {
                let mut payload = normalize_intent_payload(raw);
                if payload.source_text.trim().is_empty() {
                    payload.source_text = message.to_string();
                }
                payload
            }
            None => self.classify_locally(message, &context).await,
        };
        let intent = payload.primary_intent.clone();
        info!(intent = %intent, "Handling message locally");

        match intent.as_str() {
            "memory_store" | "memory_retrieve" => {
                let params = build_params("memory", &intent, &payload, &context);
                let output = self
                    .run_agent("memory", params, AgentContext::new().with_shared(context))
                    .await;
                if !output.success {
                    warn!(error = ?output.error, "Memory agent failed on the local path");
                    return LocalResponse::local(
                        false,
                        &intent,
                        "I couldn't reach my memory right now.",
                        json!({"error": output.error}),
                    );
                }
                let step = StepResult {
                    agent: "memory".to_string(),
                    step: 0,
                    success: true,
                    result: output.result.clone(),
                    error: None,
                    timestamp: chrono::Utc::now().to_rfc3339(),
                };
                let message = describe_step(&step).unwrap_or_else(|| "Done.".to_string());
                LocalResponse::local(true, &intent, message, output.result)
            }
            "greeting" => LocalResponse::local(
                true,
                &intent,
                payload.suggested_response.clone().unwrap_or_else(|| GREETING_REPLY.to_string()),
                Value::Null,
            ),
            "question" => {
                let params = build_params("local_llm", &intent, &payload, &context);
                let output = self
                    .run_agent("local_llm", params, AgentContext::new().with_shared(context))
                    .await;
                match output.result.get("response").and_then(|v| v.as_str()) {
                    Some(response) if output.success && !response.trim().is_empty() => {
                        LocalResponse::local(true, &intent, response, output.result.clone())
                    }
                    _ => {
                        debug!(error = ?output.error, "Local model unavailable, sending limited-mode reply");
                        LocalResponse::local(true, &intent, LIMITED_MODE_REPLY, json!({"limited": true}))
                    }
                }
            }
            _ => {
                let raw = json!(payload);
                LocalResponse::from_ask(&intent, self.ask(&raw, context).await, "local")
            }
        }
    }

    /// Prefer the remote backend for classification; fall back to the local
    /// path when it is unreachable or fails.
    pub async fn process_message(&self, message: &str, context: Map<String, Value>) -> LocalResponse {
        if let Some(backend) = self.inner.services.backend.clone() {
            if backend.is_available().await {
                match backend.classify(message).await {
                    Ok(raw) => {
                        let mut payload = normalize_intent_payload(&raw);
                        if payload.source_text.trim().is_empty() {
                            payload.source_text = message.to_string();
                        }
                        let intent = payload.primary_intent.clone();
                        info!(intent = %intent, "Message classified remotely");
                        return LocalResponse::from_ask(&intent, self.ask(&json!(payload), context).await, "remote");
                    }
                    Err(e) => warn!(error = %e, "Remote classification failed, handling locally"),
                }
            } else {
                debug!("Remote backend unreachable, handling locally");
            }
        }
        self.handle_local_orchestration(message, None, context).await
    }
}
