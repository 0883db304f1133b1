pub mod agents;
pub mod ask;
pub mod runtime;
pub mod workflow;

use serde_json::{json, Map, Value};

/// Shared context for a CLI invocation.
pub fn session_context(session: &str) -> Map<String, Value> {
    let mut ctx = Map::new();
    ctx.insert("sessionId".to_string(), json!(session));
    ctx.insert("source".to_string(), json!("cli"));
    ctx
}

pub fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
