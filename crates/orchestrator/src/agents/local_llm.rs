use async_trait::async_trait;
use deskmate_core::{Agent, AgentContext, AgentOutput, LocalLlm, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

use super::{action, str_param};

/// Answers prompts with the on-device model.
pub struct LocalLlmAgent {
    llm: Arc<dyn LocalLlm>,
}

impl LocalLlmAgent {
    pub fn new(llm: Arc<dyn LocalLlm>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Agent for LocalLlmAgent {
    fn name(&self) -> &str {
        "local_llm"
    }

    fn description(&self) -> &str {
        "Queries the local language model"
    }

    async fn execute(&self, params: Value, ctx: AgentContext) -> Result<AgentOutput> {
        match action(&params) {
            "query" | "execute" => {
                let prompt = str_param(&params, &["prompt", "text", "query"])
                    .or_else(|| ctx.get_str("sourceText"))
                    .unwrap_or_default();
                if prompt.trim().is_empty() {
                    return Ok(AgentOutput::failure("local_llm.query requires a prompt"));
                }
                let options = params.get("options").cloned().unwrap_or_else(|| json!({}));
                let reply = self.llm.query(prompt, &options).await?;
                if !reply.success {
                    warn!("Local model returned an unsuccessful reply");
                    return Ok(AgentOutput::failure(if reply.response.is_empty() {
                        "Local model query failed".to_string()
                    } else {
                        reply.response
                    }));
                }
                Ok(AgentOutput::ok(json!({"response": reply.response, "model": reply.model})))
            }
            "status" => Ok(AgentOutput::ok(json!({"available": self.llm.is_available().await}))),
            other => Ok(AgentOutput::failure(format!("local_llm: unsupported action '{}'", other))),
        }
    }
}
