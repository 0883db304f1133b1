use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::capability::{Capability, HostControls};
use crate::error::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Start,
    Next,
    Stop,
    Pause,
}

/// An instruction an agent issues to alter workflow progression.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlDirective {
    pub action: ControlAction,
    #[serde(default, alias = "target_step", skip_serializing_if = "Option::is_none")]
    pub target_step: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ControlDirective {
    pub fn new(action: ControlAction) -> Self {
        Self {
            action,
            target_step: None,
            reason: None,
        }
    }

    /// Read a `workflowControl` (or `workflow_control`) object out of a result value.
    pub fn from_result(value: &Value) -> Option<Self> {
        let raw = value
            .get("workflowControl")
            .or_else(|| value.get("workflow_control"))?;
        serde_json::from_value(raw.clone()).ok()
    }
}

/// Control handle injected into every step's context. Agents call it to
/// jump, pause or stop; the workflow engine drains it after the step.
#[derive(Clone, Default)]
pub struct WorkflowControl {
    pending: Arc<Mutex<Option<ControlDirective>>>,
}

impl WorkflowControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, directive: ControlDirective) {
        if let Ok(mut slot) = self.pending.lock() {
            *slot = Some(directive);
        }
    }

    pub fn start(&self) {
        self.set(ControlDirective::new(ControlAction::Start));
    }

    /// Advance to `target` if given, otherwise to the next step.
    pub fn next(&self, target: Option<usize>) {
        self.set(ControlDirective {
            action: ControlAction::Next,
            target_step: target,
            reason: None,
        });
    }

    pub fn jump_to(&self, step: usize) {
        self.next(Some(step));
    }

    pub fn stop(&self, reason: &str) {
        self.set(ControlDirective {
            action: ControlAction::Stop,
            target_step: None,
            reason: Some(reason.to_string()),
        });
    }

    pub fn pause(&self, reason: &str) {
        self.set(ControlDirective {
            action: ControlAction::Pause,
            target_step: None,
            reason: Some(reason.to_string()),
        });
    }

    pub fn take(&self) -> Option<ControlDirective> {
        self.pending.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Result of one agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentOutput {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub control: Option<ControlDirective>,
}

impl AgentOutput {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result,
            error: None,
            control: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: Some(error.into()),
            control: None,
        }
    }

    pub fn with_control(mut self, directive: ControlDirective) -> Self {
        self.control = Some(directive);
        self
    }

    /// Interpret a loosely shaped value returned by a scripted agent.
    ///
    /// Objects carrying a boolean `success` are taken at face value, with
    /// `result`/`data` as the payload; anything else counts as a success
    /// whose payload is the value itself.
    pub fn from_value(value: Value) -> Self {
        let control = ControlDirective::from_result(&value);
        let Some(obj) = value.as_object() else {
            return Self {
                success: true,
                result: value,
                error: None,
                control,
            };
        };

        let Some(success) = obj.get("success").and_then(|v| v.as_bool()) else {
            return Self {
                success: true,
                result: value,
                error: None,
                control,
            };
        };

        let error = obj.get("error").and_then(|e| match e {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        });
        let result = obj
            .get("result")
            .or_else(|| obj.get("data"))
            .cloned()
            .unwrap_or_else(|| {
                let mut rest = obj.clone();
                rest.remove("success");
                rest.remove("error");
                rest.remove("workflowControl");
                rest.remove("workflow_control");
                Value::Object(rest)
            });

        Self {
            success,
            result,
            error: if success { None } else { error.or_else(|| Some("Agent reported failure".to_string())) },
            control,
        }
    }
}

/// Lets an agent call back into the orchestrator that is running it.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke_agent(&self, name: &str, params: Value, ctx: AgentContext) -> Result<AgentOutput>;
}

/// Everything an agent sees while executing.
#[derive(Clone, Default)]
pub struct AgentContext {
    /// Workflow shared context merged with step-local context.
    pub shared: Map<String, Value>,
    /// Resolved dependencies, keyed by camelCase name.
    pub dependencies: HashMap<String, Arc<dyn Capability>>,
    pub invoker: Option<Arc<dyn AgentInvoker>>,
    pub control: WorkflowControl,
    pub host: Option<Arc<dyn HostControls>>,
    /// Agents currently waiting on a nested `call_agent`, outermost first.
    pub call_chain: Vec<String>,
}

impl AgentContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shared(mut self, shared: Map<String, Value>) -> Self {
        self.shared = shared;
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.shared.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.shared.get(key).and_then(|v| v.as_str())
    }

    pub fn session_id(&self) -> String {
        self.get_str("sessionId")
            .or_else(|| self.get_str("session_id"))
            .unwrap_or("default")
            .to_string()
    }

    /// Whether `name` is already running further up this call chain.
    pub fn is_calling(&self, name: &str) -> bool {
        self.call_chain.iter().any(|n| n == name)
    }

    pub fn dependency(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.dependencies.get(name)
    }

    /// JSON projection handed to scripted agents.
    pub fn to_json(&self) -> Value {
        let mut obj = self.shared.clone();
        let mut deps: Vec<&String> = self.dependencies.keys().collect();
        deps.sort();
        obj.insert("dependencies".to_string(), serde_json::json!(deps));
        Value::Object(obj)
    }
}

/// The fixed `{bootstrap, execute}` contract every agent implements.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Declared dependency names, resolved before bootstrap.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn bootstrap(&self, _config: &Value, _ctx: &AgentContext) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, params: Value, ctx: AgentContext) -> Result<AgentOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_handle_take_clears() {
        let control = WorkflowControl::new();
        control.jump_to(2);
        let d = control.take().unwrap();
        assert_eq!(d.action, ControlAction::Next);
        assert_eq!(d.target_step, Some(2));
        assert!(control.take().is_none());
    }

    #[test]
    fn test_output_from_value_with_control() {
        let out = AgentOutput::from_value(json!({
            "success": true,
            "result": {"n": 1},
            "workflowControl": {"action": "next", "targetStep": 0}
        }));
        assert!(out.success);
        assert_eq!(out.result, json!({"n": 1}));
        let control = out.control.unwrap();
        assert_eq!(control.action, ControlAction::Next);
        assert_eq!(control.target_step, Some(0));
    }

    #[test]
    fn test_output_from_value_failure() {
        let out = AgentOutput::from_value(json!({"success": false, "error": "boom"}));
        assert!(!out.success);
        assert_eq!(out.error.as_deref(), Some("boom"));

        let out = AgentOutput::from_value(json!({"success": false}));
        assert!(out.error.is_some());
    }

    #[test]
    fn test_output_from_plain_value() {
        let out = AgentOutput::from_value(json!("hello"));
        assert!(out.success);
        assert_eq!(out.result, json!("hello"));

        let out = AgentOutput::from_value(json!({"success": true, "count": 3}));
        assert_eq!(out.result, json!({"count": 3}));
    }

    #[test]
    fn test_context_session_id() {
        let mut shared = Map::new();
        assert_eq!(AgentContext::new().session_id(), "default");
        shared.insert("sessionId".into(), json!("s-1"));
        assert_eq!(AgentContext::new().with_shared(shared).session_id(), "s-1");
    }
}
