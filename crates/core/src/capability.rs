use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// A runtime capability injected into an agent for one of its declared
/// dependencies. Calls are method-name dispatched with JSON arguments.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    /// Methods this capability answers to, for diagnostics.
    fn methods(&self) -> Vec<&'static str> {
        Vec::new()
    }

    async fn invoke(&self, method: &str, args: Value) -> Result<Value>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub text: String,
    pub sender: String,
    #[serde(default)]
    pub metadata: Value,
    /// RFC 3339.
    pub created_at: String,
}

/// Session/conversation persistence used by the memory agent.
pub trait ConversationStore: Send + Sync {
    fn add_message(&self, session_id: &str, text: &str, sender: &str, metadata: Value) -> Result<StoredMessage>;

    /// Newest first.
    fn list_messages(&self, session_id: &str, limit: usize, offset: usize) -> Result<Vec<StoredMessage>>;

    /// Substring match on message text, newest first.
    fn search_messages(&self, session_id: &str, query: &str, limit: usize) -> Result<Vec<StoredMessage>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmReply {
    pub success: bool,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A model running on this machine.
#[async_trait]
pub trait LocalLlm: Send + Sync {
    async fn query(&self, prompt: &str, options: &Value) -> Result<LlmReply>;

    async fn is_available(&self) -> bool {
        true
    }
}

/// Screen capture + OCR, provided by the host application.
#[async_trait]
pub trait ScreenCapturer: Send + Sync {
    async fn capture_and_extract(&self, options: Value) -> Result<Value>;
}

/// Window-visibility controls of the host application.
#[async_trait]
pub trait HostControls: Send + Sync {
    async fn hide_all_windows(&self) -> Result<()>;
    async fn show_all_windows(&self, info: Value) -> Result<()>;
}

/// The remote orchestration backend the local path stands in for.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn is_available(&self) -> bool;

    /// Classify a message; the reply may be any intent-payload shape.
    async fn classify(&self, message: &str) -> Result<Value>;
}
