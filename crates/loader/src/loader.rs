use deskmate_core::config::SandboxConfig;
use deskmate_core::{Agent, AgentContext, AgentDefinition, AgentOutput, Capability, Error, Result};
use deskmate_storage::AgentRegistry;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::engine::SandboxEngine;
use crate::legacy::LegacyAgentDir;
use crate::resolver::{DependencyResolver, ResolutionReport};
use crate::script::{load_script_agent, DegradedAgent};

/// A materialized agent plus its resolved dependencies.
pub struct LoadedAgent {
    pub definition: AgentDefinition,
    pub agent: Arc<dyn Agent>,
    pub dependencies: HashMap<String, Arc<dyn Capability>>,
    pub resolution: ResolutionReport,
    pub loaded_at: i64,
    bootstrapped: tokio::sync::Mutex<bool>,
}

impl LoadedAgent {
    fn new(
        definition: AgentDefinition,
        agent: Arc<dyn Agent>,
        dependencies: HashMap<String, Arc<dyn Capability>>,
        resolution: ResolutionReport,
    ) -> Self {
        Self {
            definition,
            agent,
            dependencies,
            resolution,
            loaded_at: chrono::Utc::now().timestamp_millis(),
            bootstrapped: tokio::sync::Mutex::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub async fn is_bootstrapped(&self) -> bool {
        *self.bootstrapped.lock().await
    }

    /// `ctx` with this agent's dependencies merged in. Entries already in
    /// the context win over resolved ones.
    pub fn context_for(&self, mut ctx: AgentContext) -> AgentContext {
        for (key, dep) in &self.dependencies {
            ctx.dependencies.entry(key.clone()).or_insert_with(|| dep.clone());
        }
        ctx
    }

    /// Run bootstrap if it has not yet succeeded. Concurrent callers wait
    /// for the first attempt instead of bootstrapping twice.
    pub async fn ensure_bootstrapped(&self, ctx: &AgentContext) -> Result<()> {
        let mut done = self.bootstrapped.lock().await;
        if *done {
            return Ok(());
        }
        self.agent.bootstrap(&self.definition.config, ctx).await?;
        *done = true;
        debug!(agent = %self.definition.name, "Agent bootstrapped");
        Ok(())
    }

    pub async fn execute(&self, params: Value, ctx: AgentContext) -> Result<AgentOutput> {
        let ctx = self.context_for(ctx);
        self.ensure_bootstrapped(&ctx).await?;
        self.agent.execute(params, ctx).await
    }

    pub fn summary(&self) -> Value {
        json!({
            "name": self.definition.name,
            "description": self.definition.description,
            "version": self.definition.version,
            "native": self.definition.is_native(),
            "dependencies": self.resolution,
            "loadedAt": self.loaded_at,
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoaderStats {
    pub cached: usize,
    pub evaluations: u64,
    pub native_agents: usize,
}

type Slot = Arc<OnceCell<Arc<LoadedAgent>>>;

/// Turns agent names into live, cached [`LoadedAgent`]s.
///
/// Lookup order: native agents, registry definitions, legacy files.
pub struct AgentLoader {
    registry: Arc<AgentRegistry>,
    resolver: Arc<DependencyResolver>,
    sandbox: SandboxEngine,
    legacy: LegacyAgentDir,
    natives: RwLock<HashMap<String, Arc<dyn Agent>>>,
    cache: Mutex<HashMap<String, Slot>>,
    evaluations: AtomicU64,
}

impl AgentLoader {
    pub fn new(
        registry: Arc<AgentRegistry>,
        resolver: Arc<DependencyResolver>,
        sandbox: SandboxConfig,
        legacy_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            resolver,
            sandbox: SandboxEngine::new(sandbox),
            legacy: LegacyAgentDir::new(legacy_dir),
            natives: RwLock::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            evaluations: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<DependencyResolver> {
        &self.resolver
    }

    pub fn legacy(&self) -> &LegacyAgentDir {
        &self.legacy
    }

    pub fn register_native(&self, agent: Arc<dyn Agent>) {
        let name = agent.name().to_string();
        if let Ok(mut natives) = self.natives.write() {
            natives.insert(name.clone(), agent);
        }
        // A replaced native must not keep serving the old instance.
        self.unload_agent(&name);
    }

    pub fn native_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .natives
            .read()
            .map(|n| n.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn native(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.natives.read().ok()?.get(name).cloned()
    }

    fn slot(&self, name: &str) -> Result<Slot> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|e| Error::Other(format!("Loader cache poisoned: {}", e)))?;
        Ok(cache
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone())
    }

    /// Load `name`, reusing the cached instance when there is one.
    pub async fn load_agent(&self, name: &str) -> Result<Arc<LoadedAgent>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("Agent name must not be empty".to_string()));
        }

        let slot = self.slot(name)?;
        match slot.get_or_try_init(|| self.materialize(name)).await {
            Ok(loaded) => Ok(loaded.clone()),
            Err(e) => {
                // Drop the empty slot so unknown names do not accumulate.
                if let Ok(mut cache) = self.cache.lock() {
                    if cache
                        .get(name)
                        .map_or(false, |s| Arc::ptr_eq(s, &slot) && s.get().is_none())
                    {
                        cache.remove(name);
                    }
                }
                Err(e)
            }
        }
    }

    async fn materialize(&self, name: &str) -> Result<Arc<LoadedAgent>> {
        if let Some(agent) = self.native(name) {
            let definition = AgentDefinition::new(name, agent.description())
                .with_dependencies(&agent.dependencies())
                .with_metadata(json!({"native": true}));
            let (deps, report) = self.resolver.resolve(&definition.dependencies).await;
            info!(agent = %name, "Native agent loaded");
            return Ok(Arc::new(LoadedAgent::new(definition, agent, deps, report)));
        }

        let definition = match self.registry.find(name)? {
            Some(def) => def,
            None => self
                .legacy
                .load(name)?
                .ok_or_else(|| Error::AgentNotFound(name.to_string()))?,
        };

        let code = match definition.code.clone().filter(|c| !c.trim().is_empty()) {
            Some(code) => code,
            None => self
                .legacy
                .source(name)?
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| Error::NoExecutableCode(name.to_string()))?,
        };

        let (deps, report) = self.resolver.resolve(&definition.dependencies).await;

        self.evaluations.fetch_add(1, Ordering::SeqCst);
        let description = definition.description.clone();
        let agent = {
            let definition = definition.clone();
            let sandbox = self.sandbox.clone();
            let agent_dir = self.legacy.path().to_string_lossy().to_string();
            let handle = tokio::runtime::Handle::current();
            tokio::task::spawn_blocking(move || {
                load_script_agent(&definition, &code, &sandbox, &agent_dir, handle)
            })
            .await
            .unwrap_or_else(|e| {
                warn!(agent = %name, error = %e, "Agent evaluation panicked");
                Arc::new(DegradedAgent::new(
                    name,
                    &description,
                    format!("evaluation failed: {}", e),
                ))
            })
        };

        info!(
            agent = %name,
            dependencies = report.resolved.len(),
            unresolved = report.failed.len(),
            "Agent loaded"
        );
        Ok(Arc::new(LoadedAgent::new(definition, agent, deps, report)))
    }

    /// Names of agents currently materialized in the cache.
    pub fn loaded_agents(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .cache
            .lock()
            .map(|cache| {
                cache
                    .iter()
                    .filter(|(_, slot)| slot.initialized())
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn cached(&self, name: &str) -> Option<Arc<LoadedAgent>> {
        self.cache.lock().ok()?.get(name)?.get().cloned()
    }

    /// Drop the cached instance. Returns whether one was loaded.
    pub fn unload_agent(&self, name: &str) -> bool {
        let removed = self
            .cache
            .lock()
            .ok()
            .and_then(|mut cache| cache.remove(name));
        let was_loaded = removed.map_or(false, |slot| slot.initialized());
        if was_loaded {
            debug!(agent = %name, "Agent unloaded");
        }
        was_loaded
    }

    /// Discard the cached instance and load a fresh one.
    pub async fn reload_agent(&self, name: &str) -> Result<Arc<LoadedAgent>> {
        self.unload_agent(name);
        self.load_agent(name).await
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }

    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            cached: self.loaded_agents().len(),
            evaluations: self.evaluations.load(Ordering::SeqCst),
            native_agents: self.natives.read().map(|n| n.len()).unwrap_or(0),
        }
    }
}
