pub mod builtin;
pub mod convert;
pub mod engine;
pub mod host;
pub mod legacy;
pub mod loader;
pub mod resolver;
pub mod script;

pub use engine::SandboxEngine;
pub use legacy::LegacyAgentDir;
pub use loader::{AgentLoader, LoadedAgent, LoaderStats};
pub use resolver::{dependency_key, DependencyResolver, ResolutionReport};
pub use script::{load_script_agent, DegradedAgent, ScriptAgent};
