//! Native agents registered by the orchestrator at initialization.

pub mod command_executor;
pub mod intent_classifier;
pub mod local_llm;
pub mod memory;
pub mod scheduler;
pub mod screen_capture;

pub use command_executor::CommandExecutorAgent;
pub use intent_classifier::IntentClassifierAgent;
pub use local_llm::LocalLlmAgent;
pub use memory::MemoryAgent;
pub use scheduler::SchedulerAgent;
pub use screen_capture::ScreenCaptureAgent;

use serde_json::Value;

pub(crate) fn action(params: &Value) -> &str {
    params.get("action").and_then(|v| v.as_str()).unwrap_or("execute")
}

pub(crate) fn str_param<'a>(params: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| params.get(*k).and_then(|v| v.as_str()))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
