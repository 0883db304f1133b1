use async_trait::async_trait;
use deskmate_core::{Agent, AgentContext, AgentOutput, IntentPayload, LocalLlm, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use super::str_param;
use crate::classifier::{is_supported_intent, RuleClassifier};
use crate::router::normalize_intent_payload;

const SYSTEM_PROMPT: &str = "You classify messages for a desktop assistant. \
Reply with JSON only: {\"intents\":[{\"intent\":string,\"confidence\":number}],\
\"primaryIntent\":string,\"entities\":[],\"requiresMemoryAccess\":bool,\
\"captureScreen\":bool,\"suggestedResponse\":string|null}. \
Allowed intents: greeting, question, memory_store, memory_retrieve, schedule, \
reminder, command, screen_capture.";

/// Classifies free text, preferring the local model and falling back to rules.
pub struct IntentClassifierAgent {
    llm: Option<Arc<dyn LocalLlm>>,
    rules: RuleClassifier,
}

impl IntentClassifierAgent {
    pub fn new(llm: Option<Arc<dyn LocalLlm>>) -> Self {
        Self {
            llm,
            rules: RuleClassifier::new(),
        }
    }

    async fn classify_with_model(&self, llm: &dyn LocalLlm, message: &str) -> Option<IntentPayload> {
        let options = json!({"system": SYSTEM_PROMPT, "json": true, "temperature": 0.0});
        let reply = match llm.query(message, &options).await {
            Ok(reply) if reply.success => reply,
            Ok(_) => return None,
            Err(e) => {
                warn!(error = %e, "Model classification failed, using rules");
                return None;
            }
        };
        let raw: Value = serde_json::from_str(strip_fences(&reply.response)).ok()?;
        let mut payload = normalize_intent_payload(&raw);
        if !is_supported_intent(&payload.primary_intent) {
            debug!(intent = %payload.primary_intent, "Model produced an unsupported intent");
            return None;
        }
        payload.intents.retain(|i| is_supported_intent(&i.intent));
        if payload.source_text.trim().is_empty() {
            payload.source_text = message.to_string();
        }
        Some(payload.ensure_invariants())
    }
}

fn strip_fences(text: &str) -> &str {
    let text = text.trim();
    let text = text.strip_prefix("```json").or_else(|| text.strip_prefix("```")).unwrap_or(text);
    text.strip_suffix("```").unwrap_or(text).trim()
}

#[async_trait]
impl Agent for IntentClassifierAgent {
    fn name(&self) -> &str {
        "intent_classifier"
    }

    fn description(&self) -> &str {
        "Classifies a message into intents"
    }

    async fn execute(&self, params: Value, ctx: AgentContext) -> Result<AgentOutput> {
        let Some(message) = str_param(&params, &["message", "text", "sourceText"])
            .or_else(|| params.as_str())
            .or_else(|| ctx.get_str("sourceText"))
            .map(String::from)
        else {
            return Ok(AgentOutput::failure("intent_classifier requires a 'message'"));
        };

        let mut source = "rules";
        let mut payload = None;
        if let Some(llm) = &self.llm {
            if llm.is_available().await {
                payload = self.classify_with_model(llm.as_ref(), &message).await;
                if payload.is_some() {
                    source = "llm";
                }
            }
        }
        let payload = payload.unwrap_or_else(|| self.rules.classify(&message));
        debug!(intent = %payload.primary_intent, source, "Message classified");

        let mut result = serde_json::to_value(&payload)?;
        if let Some(obj) = result.as_object_mut() {
            obj.insert("source".to_string(), json!(source));
        }
        Ok(AgentOutput::ok(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskmate_core::LlmReply;

    struct Canned(&'static str);

    #[async_trait]
    impl LocalLlm for Canned {
        async fn query(&self, _prompt: &str, _options: &Value) -> Result<LlmReply> {
            Ok(LlmReply {
                success: true,
                response: self.0.to_string(),
                model: None,
            })
        }
    }

    #[tokio::test]
    async fn test_model_classification_used_when_valid() {
        let agent = IntentClassifierAgent::new(Some(Arc::new(Canned(
            "```json\n{\"primaryIntent\": \"schedule\", \"intents\": [\"schedule\"]}\n```",
        ))));
        let out = agent
            .execute(json!({"message": "lunch with Sam on Friday"}), AgentContext::new())
            .await
            .unwrap();
        assert_eq!(out.result["primaryIntent"], "schedule");
        assert_eq!(out.result["source"], "llm");
        assert_eq!(out.result["sourceText"], "lunch with Sam on Friday");
    }

    #[tokio::test]
    async fn test_falls_back_to_rules() {
        let agent = IntentClassifierAgent::new(Some(Arc::new(Canned("{\"primaryIntent\": \"dance\"}"))));
        let out = agent.execute(json!({"message": "hello"}), AgentContext::new()).await.unwrap();
        assert_eq!(out.result["primaryIntent"], "greeting");
        assert_eq!(out.result["source"], "rules");

        let agent = IntentClassifierAgent::new(None);
        let out = agent.execute(json!({"message": "remind me at 5pm"}), AgentContext::new()).await.unwrap();
        assert_eq!(out.result["primaryIntent"], "reminder");
    }

    #[tokio::test]
    async fn test_missing_message() {
        let out = IntentClassifierAgent::new(None)
            .execute(json!({}), AgentContext::new())
            .await
            .unwrap();
        assert!(!out.success);
    }
}
