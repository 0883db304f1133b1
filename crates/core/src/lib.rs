pub mod agent;
pub mod capability;
pub mod config;
pub mod error;
pub mod paths;
pub mod types;

pub use agent::{
    Agent, AgentContext, AgentInvoker, AgentOutput, ControlAction, ControlDirective,
    WorkflowControl,
};
pub use capability::{
    Capability, ConversationStore, HostControls, LlmReply, LocalLlm, RemoteBackend,
    ScreenCapturer, StoredMessage,
};
pub use config::Config;
pub use error::{Error, Result};
pub use paths::Paths;
pub use types::{AgentDefinition, DatabaseKind, ExecutionTarget, IntentPayload, IntentScore};
