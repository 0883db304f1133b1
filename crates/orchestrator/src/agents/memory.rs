use async_trait::async_trait;
use deskmate_core::{Agent, AgentContext, AgentOutput, ConversationStore, Error, Result, StoredMessage};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::{action, str_param};

const DEFAULT_LIMIT: usize = 10;

const STOP_WORDS: [&str; 24] = [
    "what", "whats", "what's", "where", "when", "which", "who", "how", "the", "is", "was", "are", "my",
    "me", "you", "did", "do", "tell", "about", "that", "this", "remember", "your", "for",
];

/// Stores and recalls conversation snippets for the current session.
pub struct MemoryAgent {
    store: Arc<dyn ConversationStore>,
}

impl MemoryAgent {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ConversationStore) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(store.as_ref()))
            .await
            .map_err(|e| Error::StoreUnavailable(format!("Store task failed: {}", e)))?
    }

    /// Search by each meaningful word of `query`, newest first, deduplicated.
    async fn recall(&self, session: String, query: String, limit: usize) -> Result<Vec<StoredMessage>> {
        let terms = search_terms(&query);
        if terms.is_empty() {
            return self.blocking(move |s| s.list_messages(&session, limit, 0)).await;
        }
        self.blocking(move |s| {
            let mut seen = HashSet::new();
            let mut hits = Vec::new();
            for term in &terms {
                for message in s.search_messages(&session, term, limit)? {
                    if seen.insert(message.id.clone()) {
                        hits.push(message);
                    }
                }
            }
            hits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            hits.truncate(limit);
            Ok(hits)
        })
        .await
    }
}

fn search_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|w| w.trim_matches('\'').to_lowercase())
        .filter(|w| w.chars().count() >= 3 && !STOP_WORDS.contains(&w.as_str()))
        .collect();
    terms.dedup();
    terms
}

fn session_of(params: &Value, ctx: &AgentContext) -> String {
    str_param(params, &["sessionId", "session_id"])
        .map(String::from)
        .unwrap_or_else(|| ctx.session_id())
}

#[async_trait]
impl Agent for MemoryAgent {
    fn name(&self) -> &str {
        "memory"
    }

    fn description(&self) -> &str {
        "Stores and retrieves conversation memory"
    }

    async fn execute(&self, params: Value, ctx: AgentContext) -> Result<AgentOutput> {
        let session = session_of(&params, &ctx);
        let limit = params
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|l| l as usize)
            .unwrap_or(DEFAULT_LIMIT);

        match action(&params) {
            "store" => {
                let Some(text) = str_param(&params, &["text", "message", "content"]).map(String::from) else {
                    return Ok(AgentOutput::failure("memory.store requires non-empty 'text'"));
                };
                let sender = str_param(&params, &["sender"]).unwrap_or("user").to_string();
                let metadata = params.get("metadata").cloned().unwrap_or(Value::Null);
                let stored = self
                    .blocking(move |s| s.add_message(&session, &text, &sender, metadata))
                    .await?;
                debug!(id = %stored.id, session = %stored.session_id, "Memory stored");
                Ok(AgentOutput::ok(json!({"stored": true, "id": stored.id, "message": stored})))
            }
            "retrieve" | "search" => {
                let query = str_param(&params, &["query", "text"]).unwrap_or_default().to_string();
                let messages = self.recall(session, query, limit).await?;
                Ok(AgentOutput::ok(json!({"count": messages.len(), "messages": messages})))
            }
            "list" => {
                let offset = params.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                let messages = self
                    .blocking(move |s| s.list_messages(&session, limit, offset))
                    .await?;
                Ok(AgentOutput::ok(json!({"count": messages.len(), "messages": messages})))
            }
            other => Ok(AgentOutput::failure(format!("memory: unsupported action '{}'", other))),
        }
    }
}
