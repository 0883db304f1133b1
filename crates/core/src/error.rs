use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent '{0}' has no executable code")]
    NoExecutableCode(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Dependency '{name}' could not be resolved: {reason}")]
    DependencyUnresolved { name: String, reason: String },

    #[error("Step failure in '{agent}': {reason}")]
    StepFailure { agent: String, reason: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors the orchestrator recovers from locally instead of surfacing.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Evaluation(_) | Error::DependencyUnresolved { .. } | Error::StoreUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
