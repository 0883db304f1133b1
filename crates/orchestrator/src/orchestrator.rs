use async_trait::async_trait;
use deskmate_core::{
    Agent, AgentContext, AgentDefinition, AgentInvoker, AgentOutput, Config, ConversationStore, Error,
    HostControls, LocalLlm, RemoteBackend, Result, ScreenCapturer,
};
use deskmate_loader::{AgentLoader, DependencyResolver, LoaderStats};
use deskmate_storage::AgentRegistry;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::{debug, error, info, warn};

use crate::agents::{
    CommandExecutorAgent, IntentClassifierAgent, LocalLlmAgent, MemoryAgent, SchedulerAgent, ScreenCaptureAgent,
};
use crate::classifier::{RuleClassifier, GREETING_REPLY};
use crate::router;
use crate::workflow::{StepResult, StepRunner, WorkflowEngine, WorkflowResult, WorkflowState, WorkflowStep, WorkflowStatus};

/// Host-provided collaborators. Each one is optional; agents that need a
/// missing collaborator are simply not registered.
#[derive(Clone, Default)]
pub struct Services {
    pub conversations: Option<Arc<dyn ConversationStore>>,
    pub local_llm: Option<Arc<dyn LocalLlm>>,
    pub screen: Option<Arc<dyn ScreenCapturer>>,
    pub host: Option<Arc<dyn HostControls>>,
    pub backend: Option<Arc<dyn RemoteBackend>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_conversation_store(&mut self, store: Arc<dyn ConversationStore>) {
        self.conversations = Some(store);
    }

    pub fn set_local_llm(&mut self, llm: Arc<dyn LocalLlm>) {
        self.local_llm = Some(llm);
    }

    pub fn set_screen_capturer(&mut self, screen: Arc<dyn ScreenCapturer>) {
        self.screen = Some(screen);
    }

    pub fn set_host_controls(&mut self, host: Arc<dyn HostControls>) {
        self.host = Some(host);
    }

    pub fn set_remote_backend(&mut self, backend: Arc<dyn RemoteBackend>) {
        self.backend = Some(backend);
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub name: String,
    pub description: String,
    /// `native`, `registry` or `legacy`.
    pub source: String,
    pub loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) loader: AgentLoader,
    pub(crate) engine: WorkflowEngine,
    pub(crate) services: Services,
    pub(crate) rules: RuleClassifier,
    natives: RwLock<BTreeMap<String, String>>,
    initialized: AtomicBool,
}

/// Owns the agent cache and runs agents, workflows and intent payloads.
/// Cloning is cheap; clones share one cache.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) inner: Arc<Inner>,
}

/// Gives running agents a way back into the orchestrator without keeping
/// it alive.
struct Invoker(Weak<Inner>);

#[async_trait]
impl AgentInvoker for Invoker {
    async fn invoke_agent(&self, name: &str, params: Value, ctx: AgentContext) -> Result<AgentOutput> {
        let inner = self
            .0
            .upgrade()
            .ok_or_else(|| Error::Other("Orchestrator has shut down".to_string()))?;
        let limit = inner.config.orchestrator.max_call_depth;
        if ctx.call_chain.len() > limit {
            warn!(agent = %name, depth = ctx.call_chain.len(), "call_agent nesting too deep");
            return Ok(AgentOutput::failure(format!(
                "call_agent nesting exceeds {} levels ({} -> {})",
                limit,
                ctx.call_chain.join(" -> "),
                name
            )));
        }
        Ok(Orchestrator { inner }.run_agent(name, params, ctx).await)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl Orchestrator {
    pub fn new(config: Config, registry: Arc<AgentRegistry>, legacy_dir: PathBuf, services: Services) -> Self {
        Self::with_resolver(config, registry, legacy_dir, Arc::new(DependencyResolver::new()), services)
    }

    pub fn with_resolver(
        config: Config,
        registry: Arc<AgentRegistry>,
        legacy_dir: PathBuf,
        resolver: Arc<DependencyResolver>,
        services: Services,
    ) -> Self {
        let loader = AgentLoader::new(registry, resolver, config.sandbox.clone(), legacy_dir);
        let engine = WorkflowEngine::new(&config.orchestrator);
        Self {
            inner: Arc::new(Inner {
                config,
                loader,
                engine,
                services,
                rules: RuleClassifier::new(),
                natives: RwLock::new(BTreeMap::new()),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn loader(&self) -> &AgentLoader {
        &self.inner.loader
    }

    pub fn resolver(&self) -> &Arc<DependencyResolver> {
        self.inner.loader.resolver()
    }

    pub fn stats(&self) -> LoaderStats {
        self.inner.loader.stats()
    }

    /// Make a Rust agent available under its own name. Replaces any
    /// cached instance with the same name.
    pub fn register_native(&self, agent: Arc<dyn Agent>) {
        if let Ok(mut natives) = self.inner.natives.write() {
            natives.insert(agent.name().to_string(), agent.description().to_string());
        }
        self.inner.loader.register_native(agent);
    }

    fn register_builtin_agents(&self) {
        let services = &self.inner.services;
        if let Some(store) = &services.conversations {
            self.register_native(Arc::new(MemoryAgent::new(store.clone())));
        }
        if let Some(llm) = &services.local_llm {
            self.register_native(Arc::new(LocalLlmAgent::new(llm.clone())));
        }
        if let Some(screen) = &services.screen {
            self.register_native(Arc::new(ScreenCaptureAgent::new(screen.clone())));
        }
        self.register_native(Arc::new(IntentClassifierAgent::new(services.local_llm.clone())));
        self.register_native(Arc::new(CommandExecutorAgent));
        self.register_native(Arc::new(SchedulerAgent::new()));
    }

    /// Register the built-in agents. Repeated calls are no-ops.
    pub async fn initialize(&self) -> Value {
        if !self.inner.initialized.swap(true, Ordering::SeqCst) {
            self.register_builtin_agents();
        }
        match self.list_agents().await {
            Ok(agents) => {
                info!(agents = agents.len(), "Orchestrator initialized");
                json!({"success": true, "agentCount": agents.len()})
            }
            Err(e) => {
                error!(error = %e, "Failed to enumerate agents during initialization");
                json!({"success": false, "agentCount": 0, "error": e.to_string()})
            }
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Store `definition` under `name`. The next load uses the new
    /// definition.
    pub async fn register_agent(&self, name: &str, mut definition: AgentDefinition) -> Result<AgentDefinition> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("Agent name must not be empty".to_string()));
        }
        definition.name = name.to_string();
        let saved = self.inner.loader.registry().upsert(definition.normalized())?;
        self.inner.loader.unload_agent(name);
        info!(agent = %name, version = %saved.version, "Agent registered");
        Ok(saved)
    }

    /// Add orchestrator services to a context before handing it to an agent.
    fn enhance(&self, mut ctx: AgentContext) -> AgentContext {
        if ctx.invoker.is_none() {
            ctx.invoker = Some(Arc::new(Invoker(Arc::downgrade(&self.inner))));
        }
        if ctx.host.is_none() {
            ctx.host = self.inner.services.host.clone();
        }
        ctx
    }

    /// Load and run one agent. Errors and panics come back as a failed
    /// output.
    pub(crate) async fn run_agent(&self, name: &str, params: Value, ctx: AgentContext) -> AgentOutput {
        let loaded = match self.inner.loader.load_agent(name).await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(agent = %name, error = %e, "Agent could not be loaded");
                return AgentOutput::failure(e.to_string());
            }
        };
        let ctx = self.enhance(ctx);
        match AssertUnwindSafe(loaded.execute(params, ctx)).catch_unwind().await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(agent = %name, error = %e, "Agent execution failed");
                AgentOutput::failure(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(agent = %name, panic = %message, "Agent panicked");
                AgentOutput::failure(format!("Agent '{}' panicked: {}", name, message))
            }
        }
    }

    /// Run `name` with `params`. Always returns
    /// `{success, result|error, agent, action, timestamp}`.
    pub async fn execute_agent(&self, name: &str, params: Value, context: Map<String, Value>) -> Value {
        let action = params
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or("execute")
            .to_string();
        debug!(agent = %name, action = %action, "Executing agent");
        let output = self
            .run_agent(name, params, AgentContext::new().with_shared(context))
            .await;

        let mut response = json!({
            "success": output.success,
            "agent": name,
            "action": action,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Some(obj) = response.as_object_mut() {
            if output.success {
                obj.insert("result".to_string(), output.result);
            } else {
                obj.insert(
                    "error".to_string(),
                    json!(output.error.unwrap_or_else(|| "Agent failed".to_string())),
                );
            }
        }
        response
    }

    pub async fn execute_workflow(&self, steps: Vec<WorkflowStep>, shared_context: Map<String, Value>) -> WorkflowResult {
        self.inner.engine.execute(self, steps, shared_context).await
    }

    pub async fn resume_workflow(&self, state: WorkflowState) -> Result<WorkflowResult> {
        self.inner.engine.resume(self, state).await
    }

    /// Route an intent payload of any accepted shape through the workflow
    /// engine.
    pub async fn ask(&self, payload: &Value, context: Map<String, Value>) -> Value {
        let plan = router::route(payload, &context);
        let primary = plan.payload.primary_intent.clone();
        info!(intent = %primary, steps = plan.steps.len(), "Handling intent payload");

        if plan.steps.is_empty() {
            let message = plan
                .payload
                .suggested_response
                .clone()
                .unwrap_or_else(|| canned_reply(&primary));
            return json!({
                "success": true,
                "primaryIntent": primary,
                "intentsProcessed": [],
                "workflowStatus": WorkflowStatus::Completed.as_str(),
                "message": message,
            });
        }

        let mut shared = context;
        shared.insert("intentPayload".to_string(), json!(plan.payload));
        shared.insert("sourceText".to_string(), json!(plan.payload.source_text));
        let result = self.execute_workflow(plan.steps, shared).await;
        let message = summarize(&plan.payload.suggested_response, &result);

        json!({
            "success": result.success,
            "primaryIntent": primary,
            "intentsProcessed": plan.intents_processed,
            "workflowStatus": result.status.as_str(),
            "message": message,
            "results": result.results,
            "error": result.error,
        })
    }

    pub fn unload_agent(&self, name: &str) -> bool {
        self.inner.loader.unload_agent(name)
    }

    pub async fn reload_agent(&self, name: &str) -> Result<Value> {
        let loaded = self.inner.loader.reload_agent(name).await?;
        Ok(loaded.summary())
    }

    /// Every agent that can be loaded by name, sorted.
    pub async fn list_agents(&self) -> Result<Vec<AgentSummary>> {
        let mut agents: BTreeMap<String, AgentSummary> = BTreeMap::new();
        let loader = &self.inner.loader;

        let legacy = loader.legacy().clone();
        let legacy_defs = tokio::task::spawn_blocking(move || {
            legacy
                .names()
                .into_iter()
                .filter_map(|n| legacy.load(&n).ok().flatten())
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| Error::Other(format!("Legacy scan failed: {}", e)))?;
        for def in legacy_defs {
            agents.insert(def.name.clone(), summary(&def, "legacy"));
        }
        for def in loader.registry().list()? {
            agents.insert(def.name.clone(), summary(&def, "registry"));
        }
        if let Ok(natives) = self.inner.natives.read() {
            for (name, description) in natives.iter() {
                agents.insert(
                    name.clone(),
                    AgentSummary {
                        name: name.clone(),
                        description: description.clone(),
                        source: "native".to_string(),
                        loaded: false,
                        version: None,
                    },
                );
            }
        }

        let loaded = loader.loaded_agents();
        Ok(agents
            .into_values()
            .map(|mut a| {
                a.loaded = loaded.contains(&a.name);
                a
            })
            .collect())
    }

    /// Drop every cached instance. The orchestrator can be initialized again.
    pub fn shutdown(&self) {
        let stats = self.inner.loader.stats();
        self.inner.loader.clear();
        self.inner.initialized.store(false, Ordering::SeqCst);
        info!(cached = stats.cached, evaluations = stats.evaluations, "Orchestrator shut down");
    }
}

fn summary(def: &AgentDefinition, source: &str) -> AgentSummary {
    AgentSummary {
        name: def.name.clone(),
        description: def.description.clone(),
        source: source.to_string(),
        loaded: false,
        version: Some(def.version.clone()),
    }
}

#[async_trait]
impl StepRunner for Orchestrator {
    async fn run_step(&self, agent: &str, params: Value, ctx: AgentContext) -> AgentOutput {
        self.run_agent(agent, params, ctx).await
    }
}

pub(crate) fn canned_reply(intent: &str) -> String {
    match intent {
        "greeting" => GREETING_REPLY.to_string(),
        other => format!("I understood that as '{}', but nothing is set up to handle it yet.", other),
    }
}

/// A one-line, human-readable description of a step's result.
pub(crate) fn describe_step(step: &StepResult) -> Option<String> {
    if !step.success {
        return None;
    }
    let result = &step.result;
    if let Some(response) = result.get("response").and_then(|v| v.as_str()) {
        return Some(response.to_string());
    }
    match step.agent.as_str() {
        "memory" if result.get("stored").is_some() => Some("Got it, I'll remember that.".to_string()),
        "memory" => {
            let texts: Vec<&str> = result
                .get("messages")
                .and_then(|v| v.as_array())
                .map(|m| m.iter().filter_map(|x| x.get("text").and_then(|t| t.as_str())).collect())
                .unwrap_or_default();
            Some(if texts.is_empty() {
                "I don't have anything saved about that yet.".to_string()
            } else {
                format!("Here's what I remember: {}", texts.join("; "))
            })
        }
        "scheduler" => result
            .get("reminder")
            .and_then(|r| r.get("text"))
            .and_then(|t| t.as_str())
            .map(|t| format!("Reminder set: {}", t)),
        "command_executor" if result.get("executed") == Some(&json!(true)) => Some("Done.".to_string()),
        "command_executor" => result
            .get("command")
            .and_then(|c| c.as_str())
            .map(|c| format!("Command received: {}", c)),
        "screen_capture" => Some("Captured the screen.".to_string()),
        _ => None,
    }
}

fn summarize(suggested: &Option<String>, result: &WorkflowResult) -> String {
    match result.status {
        WorkflowStatus::Failed => {
            return format!(
                "Sorry, I couldn't finish that: {}",
                result.error.as_deref().unwrap_or("a step failed")
            )
        }
        WorkflowStatus::Stopped => {
            return format!("Stopped: {}", result.error.as_deref().unwrap_or("no reason given"))
        }
        WorkflowStatus::Paused => return "Waiting for more input before continuing.".to_string(),
        _ => {}
    }
    result
        .results
        .iter()
        .rev()
        .filter(|r| r.agent != "screen_capture")
        .find_map(describe_step)
        .or_else(|| suggested.clone())
        .unwrap_or_else(|| format!("Processed {} step(s).", result.results.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(agent: &str, result: Value) -> StepResult {
        StepResult {
            agent: agent.to_string(),
            step: 0,
            success: true,
            result,
            error: None,
            timestamp: String::new(),
        }
    }

    #[test]
    fn test_describe_step() {
        assert_eq!(
            describe_step(&step("local_llm", json!({"response": "42"}))).as_deref(),
            Some("42")
        );
        assert_eq!(
            describe_step(&step("memory", json!({"messages": [{"text": "a"}, {"text": "b"}]}))).as_deref(),
            Some("Here's what I remember: a; b")
        );
        assert_eq!(
            describe_step(&step("command_executor", json!({"executed": true}))).as_deref(),
            Some("Done.")
        );
        assert!(describe_step(&step("custom", json!({}))).is_none());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("bad state");
        assert_eq!(panic_message(payload.as_ref()), "bad state");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
    }
}
