use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Upper bound for a single agent execute call. 0 disables the timeout.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// Total step executions allowed per workflow call, jumps included.
    #[serde(default = "default_max_step_executions")]
    pub max_step_executions: usize,
    /// Deepest `call_agent` nesting allowed below a top-level execute.
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
    /// Directory holding file-backed agent definitions not yet in the registry.
    #[serde(default)]
    pub legacy_agents_dir: Option<String>,
}

fn default_step_timeout_secs() -> u64 {
    60
}

fn default_max_step_executions() -> usize {
    256
}

fn default_max_call_depth() -> usize {
    8
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout_secs(),
            max_step_executions: default_max_step_executions(),
            max_call_depth: default_max_call_depth(),
            legacy_agents_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
    #[serde(default = "default_sandbox_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,
    #[serde(default = "default_max_collection_size")]
    pub max_array_size: usize,
    #[serde(default = "default_max_collection_size")]
    pub max_map_size: usize,
    #[serde(default = "default_max_call_levels")]
    pub max_call_levels: usize,
}

fn default_max_operations() -> u64 {
    500_000
}

fn default_sandbox_timeout_secs() -> u64 {
    30
}

fn default_max_string_size() -> usize {
    1_000_000
}

fn default_max_collection_size() -> usize {
    10_000
}

fn default_max_call_levels() -> usize {
    64
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
            timeout_secs: default_sandbox_timeout_secs(),
            max_string_size: default_max_string_size(),
            max_array_size: default_max_collection_size(),
            max_map_size: default_max_collection_size(),
            max_call_levels: default_max_call_levels(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalLlmConfig {
    #[serde(default = "default_llm_api_base")]
    pub api_base: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_llm_api_base() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_llm_timeout_secs() -> u64 {
    120
}

impl Default for LocalLlmConfig {
    fn default() -> Self {
        Self {
            api_base: default_llm_api_base(),
            model: default_llm_model(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Remote orchestration backend. When unset every message is handled locally.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_backend_timeout_secs() -> u64 {
    5
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: default_backend_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub local_llm: LocalLlmConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Legacy agents directory, expanding a leading `~`.
    pub fn legacy_agents_dir(&self, paths: &Paths) -> PathBuf {
        match self.orchestrator.legacy_agents_dir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => expand_home(dir),
            _ => paths.legacy_agents_dir(),
        }
    }

    pub fn backend_url(&self) -> Option<String> {
        self.backend
            .url
            .as_ref()
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let raw = r#"{ "orchestrator": { "stepTimeoutSecs": 5 }, "backend": { "url": "http://api.local/" } }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.orchestrator.step_timeout_secs, 5);
        assert_eq!(cfg.orchestrator.max_step_executions, 256);
        assert_eq!(cfg.orchestrator.max_call_depth, 8);
        assert_eq!(cfg.sandbox.max_call_levels, 64);
        assert_eq!(cfg.backend_url().as_deref(), Some("http://api.local"));
    }

    #[test]
    fn test_blank_backend_url_is_none() {
        let mut cfg = Config::default();
        cfg.backend.url = Some("   ".to_string());
        assert!(cfg.backend_url().is_none());
    }

    #[test]
    fn test_legacy_dir_override() {
        let paths = Paths::with_base(PathBuf::from("/tmp/deskmate-test"));
        let mut cfg = Config::default();
        assert_eq!(cfg.legacy_agents_dir(&paths), PathBuf::from("/tmp/deskmate-test/agents"));
        cfg.orchestrator.legacy_agents_dir = Some("/opt/agents".to_string());
        assert_eq!(cfg.legacy_agents_dir(&paths), PathBuf::from("/opt/agents"));
    }
}
