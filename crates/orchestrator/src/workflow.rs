use async_trait::async_trait;
use deskmate_core::config::OrchestratorConfig;
use deskmate_core::{AgentContext, AgentOutput, ControlAction, ControlDirective, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One step of a workflow: which agent to run and with what.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    #[serde(alias = "agent_name", alias = "agent")]
    pub agent_name: String,
    #[serde(default)]
    pub params: Value,
    /// Merged into the shared context before the step runs.
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default, alias = "continue_on_error")]
    pub continue_on_error: bool,
}

impl WorkflowStep {
    pub fn new(agent_name: &str, params: Value) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            params,
            context: Map::new(),
            continue_on_error: false,
        }
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Paused,
    Stopped,
    Failed,
    Completed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Stopped => "stopped",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Completed => "completed",
        }
    }
}

/// How the workflow proceeds after a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Continue,
    JumpTo(usize),
    Pause(String),
    Stop(String),
    Fail(String),
}

impl StepOutcome {
    /// Derive the outcome from an agent output and the directive it issued
    /// (through the control handle or a `workflowControl` result field).
    /// An out-of-range jump is returned as `Err` since it fails the whole
    /// workflow regardless of `continueOnError`.
    pub fn derive(
        output: &AgentOutput,
        directive: Option<ControlDirective>,
        total_steps: usize,
    ) -> std::result::Result<Self, String> {
        if !output.success {
            let error = output.error.clone().unwrap_or_else(|| "Step failed".to_string());
            return Ok(StepOutcome::Fail(error));
        }
        let Some(directive) = directive else {
            return Ok(StepOutcome::Continue);
        };
        match directive.action {
            ControlAction::Start => Ok(StepOutcome::JumpTo(0)),
            ControlAction::Next => match directive.target_step {
                None => Ok(StepOutcome::Continue),
                Some(target) if target < total_steps => Ok(StepOutcome::JumpTo(target)),
                Some(target) => Err(format!(
                    "Jump target {} is out of range (workflow has {} steps)",
                    target, total_steps
                )),
            },
            ControlAction::Stop => Ok(StepOutcome::Stop(
                directive.reason.unwrap_or_else(|| "Stopped by agent".to_string()),
            )),
            ControlAction::Pause => Ok(StepOutcome::Pause(
                directive.reason.unwrap_or_else(|| "Paused by agent".to_string()),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub agent: String,
    pub step: usize,
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

/// Everything needed to continue a workflow later, in this process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub steps: Vec<WorkflowStep>,
    pub current_step: usize,
    pub results: Vec<StepResult>,
    pub shared_context: Map<String, Value>,
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WorkflowState {
    pub fn new(steps: Vec<WorkflowStep>, shared_context: Map<String, Value>) -> Self {
        Self {
            steps,
            current_step: 0,
            results: Vec::new(),
            shared_context,
            status: WorkflowStatus::Running,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub success: bool,
    pub status: WorkflowStatus,
    /// Number of step executions recorded.
    pub steps: usize,
    pub total_steps: usize,
    pub results: Vec<StepResult>,
    pub shared_context: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_state: Option<WorkflowState>,
}

impl WorkflowResult {
    fn from_state(state: WorkflowState) -> Self {
        let success = state.status == WorkflowStatus::Completed && state.results.iter().all(|r| r.success);
        let error = match state.status {
            WorkflowStatus::Failed | WorkflowStatus::Stopped => state.reason.clone(),
            _ => None,
        };
        let paused_state = (state.status == WorkflowStatus::Paused).then(|| state.clone());
        Self {
            success,
            status: state.status,
            steps: state.results.len(),
            total_steps: state.steps.len(),
            results: state.results,
            shared_context: state.shared_context,
            error,
            paused_state,
        }
    }
}

/// Runs a single agent on behalf of the workflow engine.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Never fails: errors are reported through the returned output.
    async fn run_step(&self, agent: &str, params: Value, ctx: AgentContext) -> AgentOutput;
}

/// Sequential step executor with control directives and shared context.
#[derive(Debug, Clone)]
pub struct WorkflowEngine {
    step_timeout: Option<Duration>,
    max_step_executions: usize,
}

impl WorkflowEngine {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            step_timeout: (config.step_timeout_secs > 0).then(|| Duration::from_secs(config.step_timeout_secs)),
            max_step_executions: config.max_step_executions.max(1),
        }
    }

    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub async fn execute(
        &self,
        runner: &dyn StepRunner,
        steps: Vec<WorkflowStep>,
        shared_context: Map<String, Value>,
    ) -> WorkflowResult {
        info!(steps = steps.len(), "Starting workflow");
        self.run(runner, WorkflowState::new(steps, shared_context)).await
    }

    /// Continue a paused workflow from the step after the pause.
    pub async fn resume(&self, runner: &dyn StepRunner, mut state: WorkflowState) -> Result<WorkflowResult> {
        if state.status != WorkflowStatus::Paused {
            return Err(Error::Validation(format!(
                "Only paused workflows can be resumed (status is {})",
                state.status.as_str()
            )));
        }
        info!(step = state.current_step, "Resuming workflow");
        state.status = WorkflowStatus::Running;
        state.reason = None;
        Ok(self.run(runner, state).await)
    }

    async fn run(&self, runner: &dyn StepRunner, mut state: WorkflowState) -> WorkflowResult {
        let total = state.steps.len();
        let mut executions = 0usize;

        while state.current_step < total {
            if executions >= self.max_step_executions {
                warn!(executions, "Workflow exceeded its step execution budget");
                state.status = WorkflowStatus::Failed;
                state.reason = Some(format!(
                    "Workflow exceeded {} step executions",
                    self.max_step_executions
                ));
                break;
            }
            executions += 1;

            let index = state.current_step;
            let step = state.steps[index].clone();
            for (key, value) in &step.context {
                state.shared_context.insert(key.clone(), value.clone());
            }

            let ctx = AgentContext::new().with_shared(state.shared_context.clone());
            let control = ctx.control.clone();
            debug!(step = index, agent = %step.agent_name, "Running workflow step");

            let run = runner.run_step(&step.agent_name, step.params.clone(), ctx);
            let output = match self.step_timeout {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(output) => output,
                    Err(_) => AgentOutput::failure(format!("Step timed out after {:?}", limit)),
                },
                None => run.await,
            };
            let directive = control.take().or_else(|| output.control.clone());

            let record = StepResult {
                agent: step.agent_name.clone(),
                step: index,
                success: output.success,
                result: output.result.clone(),
                error: output.error.clone(),
                timestamp: chrono::Utc::now().to_rfc3339(),
            };
            let record_json = serde_json::to_value(&record).unwrap_or_else(|_| json!({}));
            state
                .shared_context
                .insert(format!("{}_result", step.agent_name), record_json.clone());
            state.shared_context.insert(format!("step_{}_result", index), record_json);
            state.results.push(record);

            let outcome = match StepOutcome::derive(&output, directive, total) {
                Ok(outcome) => outcome,
                Err(reason) => {
                    warn!(step = index, agent = %step.agent_name, %reason, "Invalid workflow control");
                    state.status = WorkflowStatus::Failed;
                    state.reason = Some(reason);
                    break;
                }
            };

            match outcome {
                StepOutcome::Continue => state.current_step += 1,
                StepOutcome::JumpTo(target) => {
                    debug!(step = index, target, "Workflow jump");
                    state.current_step = target;
                }
                StepOutcome::Pause(reason) => {
                    info!(step = index, %reason, "Workflow paused");
                    state.current_step = index + 1;
                    state.status = WorkflowStatus::Paused;
                    state.reason = Some(reason);
                    break;
                }
                StepOutcome::Stop(reason) => {
                    info!(step = index, %reason, "Workflow stopped");
                    state.status = WorkflowStatus::Stopped;
                    state.reason = Some(reason);
                    break;
                }
                StepOutcome::Fail(error) if step.continue_on_error => {
                    warn!(step = index, agent = %step.agent_name, %error, "Step failed, continuing");
                    state.current_step += 1;
                }
                StepOutcome::Fail(error) => {
                    warn!(step = index, agent = %step.agent_name, %error, "Step failed, aborting workflow");
                    state.status = WorkflowStatus::Failed;
                    state.reason = Some(error);
                    break;
                }
            }
        }

        if state.status == WorkflowStatus::Running {
            state.status = WorkflowStatus::Completed;
        }
        info!(status = state.status.as_str(), executed = state.results.len(), "Workflow finished");
        WorkflowResult::from_state(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Plays back scripted outputs per agent name.
    struct Scripted {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StepRunner for Scripted {
        async fn run_step(&self, agent: &str, params: Value, ctx: AgentContext) -> AgentOutput {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match agent {
                "fail" => AgentOutput::failure("boom"),
                "loop_once" if call == 1 => {
                    ctx.control.jump_to(0);
                    AgentOutput::ok(json!({"call": call}))
                }
                "forever" => {
                    ctx.control.start();
                    AgentOutput::ok(Value::Null)
                }
                "pause" => {
                    ctx.control.pause("need input");
                    AgentOutput::ok(Value::Null)
                }
                "stop" => AgentOutput::from_value(json!({
                    "success": true,
                    "workflowControl": {"action": "stop", "reason": "done early"}
                })),
                "far" => AgentOutput::from_value(json!({
                    "success": true,
                    "workflowControl": {"action": "next", "targetStep": 99}
                })),
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    AgentOutput::ok(Value::Null)
                }
                "echo_shared" => AgentOutput::ok(json!({"seen": ctx.get("flag"), "params": params})),
                _ => AgentOutput::ok(json!({"agent": agent, "call": call})),
            }
        }
    }

    fn runner() -> Scripted {
        Scripted {
            calls: AtomicUsize::new(0),
        }
    }

    fn engine() -> WorkflowEngine {
        WorkflowEngine::new(&OrchestratorConfig::default())
    }

    fn steps(names: &[&str]) -> Vec<WorkflowStep> {
        names.iter().map(|n| WorkflowStep::new(n, Value::Null)).collect()
    }

    #[test]
    fn test_outcome_derivation() {
        let ok = AgentOutput::ok(Value::Null);
        assert_eq!(StepOutcome::derive(&ok, None, 3), Ok(StepOutcome::Continue));
        let next = ControlDirective::new(ControlAction::Next);
        assert_eq!(StepOutcome::derive(&ok, Some(next), 3), Ok(StepOutcome::Continue));
        let start = ControlDirective::new(ControlAction::Start);
        assert_eq!(StepOutcome::derive(&ok, Some(start), 3), Ok(StepOutcome::JumpTo(0)));
        let far = ControlDirective {
            action: ControlAction::Next,
            target_step: Some(3),
            reason: None,
        };
        assert!(StepOutcome::derive(&ok, Some(far), 3).is_err());

        let failed = AgentOutput::failure("x");
        let stop = ControlDirective::new(ControlAction::Stop);
        assert_eq!(
            StepOutcome::derive(&failed, Some(stop), 3),
            Ok(StepOutcome::Fail("x".to_string()))
        );
    }

    #[tokio::test]
    async fn test_ordering_and_shared_results() {
        let result = engine().execute(&runner(), steps(&["a", "b", "c"]), Map::new()).await;
        assert!(result.success);
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.steps, 3);
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            assert_eq!(result.results[i].agent, *name);
            let stored: StepResult =
                serde_json::from_value(result.shared_context[&format!("step_{}_result", i)].clone()).unwrap();
            assert_eq!(stored, result.results[i]);
            assert!(result.shared_context.contains_key(&format!("{}_result", name)));
        }
    }

    #[tokio::test]
    async fn test_step_context_is_merged() {
        let mut ctx = Map::new();
        ctx.insert("flag".into(), json!("on"));
        let wf = vec![WorkflowStep::new("echo_shared", json!({"x": 1})).with_context(ctx)];
        let result = engine().execute(&runner(), wf, Map::new()).await;
        assert_eq!(result.results[0].result["seen"], "on");
        assert_eq!(result.shared_context["flag"], "on");
    }

    #[tokio::test]
    async fn test_failure_stops_unless_continue_on_error() {
        let result = engine().execute(&runner(), steps(&["a", "fail", "c"]), Map::new()).await;
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.results.len(), 2);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert!(!result.success);

        let mut wf = steps(&["a", "fail", "c"]);
        wf[1].continue_on_error = true;
        let result = engine().execute(&runner(), wf, Map::new()).await;
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.results.len(), 3);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_jump_reruns_earlier_step() {
        let result = engine().execute(&runner(), steps(&["a", "loop_once"]), Map::new()).await;
        let agents: Vec<&str> = result.results.iter().map(|r| r.agent.as_str()).collect();
        assert_eq!(agents, vec!["a", "loop_once", "a", "loop_once"]);
        assert_eq!(result.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_runaway_loop_hits_budget() {
        let mut config = OrchestratorConfig::default();
        config.max_step_executions = 10;
        let result = WorkflowEngine::new(&config)
            .execute(&runner(), steps(&["forever"]), Map::new())
            .await;
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.results.len(), 10);
    }

    #[tokio::test]
    async fn test_out_of_range_jump_fails_despite_continue_on_error() {
        let mut wf = steps(&["far", "b"]);
        wf[0].continue_on_error = true;
        let result = engine().execute(&runner(), wf, Map::new()).await;
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.results.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_directive() {
        let result = engine().execute(&runner(), steps(&["stop", "b"]), Map::new()).await;
        assert_eq!(result.status, WorkflowStatus::Stopped);
        assert_eq!(result.error.as_deref(), Some("done early"));
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_pause_then_resume() {
        let runner = runner();
        let result = engine().execute(&runner, steps(&["pause", "b"]), Map::new()).await;
        assert_eq!(result.status, WorkflowStatus::Paused);
        let state = result.paused_state.unwrap();
        assert_eq!(state.current_step, 1);

        let resumed = engine().resume(&runner, state).await.unwrap();
        assert_eq!(resumed.status, WorkflowStatus::Completed);
        assert_eq!(resumed.results.len(), 2);
        assert!(resumed.paused_state.is_none());

        let not_paused = WorkflowState::new(steps(&["a"]), Map::new());
        assert!(engine().resume(&runner, not_paused).await.is_err());
    }

    #[tokio::test]
    async fn test_step_timeout_is_a_failure() {
        let engine = engine().with_step_timeout(Some(Duration::from_millis(50)));
        let result = engine.execute(&runner(), steps(&["slow", "b"]), Map::new()).await;
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.results[0].error.as_deref().unwrap().contains("timed out after 50ms"));
    }

    #[test]
    fn test_step_deserializes_snake_case() {
        let step: WorkflowStep = serde_json::from_value(json!({
            "agent_name": "memory",
            "params": {"action": "store"},
            "continue_on_error": true
        }))
        .unwrap();
        assert_eq!(step.agent_name, "memory");
        assert!(step.continue_on_error);
    }
}
