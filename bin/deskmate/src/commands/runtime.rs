use anyhow::Context;
use deskmate_core::{Config, Paths};
use deskmate_orchestrator::{Orchestrator, Services};
use deskmate_providers::{HttpBackend, OllamaClient};
use deskmate_storage::{AgentRegistry, SqliteConversationStore};
use std::sync::Arc;
use tracing::{debug, warn};

/// Build and initialize an orchestrator from `~/.deskmate`.
pub async fn orchestrator() -> anyhow::Result<Orchestrator> {
    let paths = Paths::default();
    paths
        .ensure_dirs()
        .with_context(|| format!("Failed to create {}", paths.base.display()))?;
    let config = Config::load_or_default(&paths)
        .with_context(|| format!("Failed to load {}", paths.config_file().display()))?;

    let registry = Arc::new(AgentRegistry::open(&paths.registry_db()));
    if registry.is_degraded() {
        warn!("Agent registry unavailable, registrations will not persist");
    }

    let mut services = Services::new();
    match SqliteConversationStore::open(&paths.conversations_db()) {
        Ok(store) => services.set_conversation_store(Arc::new(store)),
        Err(e) => warn!(error = %e, "Conversation store unavailable, memory agent disabled"),
    }
    services.set_local_llm(Arc::new(OllamaClient::new(&config.local_llm)));
    if let Some(url) = config.backend_url() {
        debug!(url = %url, "Remote backend configured");
        services.set_remote_backend(Arc::new(HttpBackend::new(&url, &config.backend)));
    }

    let legacy_dir = config.legacy_agents_dir(&paths);
    let orchestrator = Orchestrator::new(config, registry, legacy_dir, services);
    let init = orchestrator.initialize().await;
    debug!(agents = %init["agentCount"], "Orchestrator ready");
    Ok(orchestrator)
}
