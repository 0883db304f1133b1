use deskmate_core::config::SandboxConfig;
use deskmate_core::{Error, Result};
use rhai::{Dynamic, Engine, EvalAltResult, AST};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Factory for resource-limited Rhai engines.
///
/// Every evaluation gets a fresh engine so the operation counter and the
/// wall-clock budget start from zero for each call.
#[derive(Debug, Clone)]
pub struct SandboxEngine {
    limits: SandboxConfig,
}

impl SandboxEngine {
    pub fn new(limits: SandboxConfig) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SandboxConfig {
        &self.limits
    }

    fn base_engine(&self) -> Engine {
        let mut engine = Engine::new();
        engine.set_max_string_size(self.limits.max_string_size);
        engine.set_max_array_size(self.limits.max_array_size);
        engine.set_max_map_size(self.limits.max_map_size);
        engine.set_max_call_levels(self.limits.max_call_levels);
        engine.set_max_expr_depths(64, 64);
        engine
    }

    /// An engine with the operation and time limits armed.
    pub fn build(&self) -> Engine {
        let mut engine = self.base_engine();

        let operations = Arc::new(AtomicU64::new(0));
        let started = Instant::now();
        let max_ops = self.limits.max_operations;
        let timeout = Duration::from_secs(self.limits.timeout_secs);

        engine.on_progress(move |_| {
            let count = operations.fetch_add(1, Ordering::Relaxed);
            if count >= max_ops {
                return Some(Dynamic::from(format!("Operation limit exceeded: {} operations", max_ops)));
            }
            if started.elapsed() > timeout {
                return Some(Dynamic::from(format!("Timeout exceeded: {} seconds", timeout.as_secs())));
            }
            None
        });

        engine
    }

    pub fn compile(&self, source: &str) -> Result<AST> {
        self.base_engine()
            .compile(source)
            .map_err(|e| Error::Evaluation(format!("Compilation error: {}", e)))
    }

    /// Map a Rhai failure onto the crate error type.
    pub fn describe_error(err: Box<EvalAltResult>) -> Error {
        if let EvalAltResult::ErrorTerminated(ref reason, _) = *err {
            warn!(reason = %reason, "Script terminated");
            return Error::Evaluation(format!("Script terminated: {}", reason));
        }
        Error::Evaluation(format!("Runtime error: {}", err))
    }
}

impl Default for SandboxEngine {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}
