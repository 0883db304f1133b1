use anyhow::{anyhow, Context};
use deskmate_core::AgentDefinition;
use serde_json::{json, Value};
use std::path::Path;

use super::{print_json, runtime, session_context};

/// Read an agent definition from `.rhai` source or a JSON / YAML definition.
pub fn read_definition(file: &Path, name: Option<String>) -> anyhow::Result<AgentDefinition> {
    let content =
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let stem = file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();
    let ext = file.extension().and_then(|e| e.to_str()).unwrap_or_default();

    let mut def = match ext {
        "rhai" => AgentDefinition::new(&stem, "").with_code(&content),
        "json" | "yaml" | "yml" => {
            let mut raw: Value = if ext == "json" {
                serde_json::from_str(&content)?
            } else {
                serde_yaml::from_str(&content)?
            };
            if let Some(obj) = raw.as_object_mut() {
                obj.entry("name").or_insert_with(|| json!(stem));
            }
            serde_json::from_value(raw).with_context(|| format!("Invalid agent definition in {}", file.display()))?
        }
        other => return Err(anyhow!("Unsupported agent file type '.{}'", other)),
    };
    if let Some(name) = name {
        def.name = name;
    }
    if def.name.trim().is_empty() {
        return Err(anyhow!("Agent definition in {} has no name", file.display()));
    }
    Ok(def)
}

pub async fn list() -> anyhow::Result<()> {
    let orchestrator = runtime::orchestrator().await?;
    let agents = orchestrator.list_agents().await?;
    if agents.is_empty() {
        println!("(No agents)");
        return Ok(());
    }
    for agent in agents {
        println!("  {:<20} {:<9} {}", agent.name, agent.source, agent.description);
    }
    Ok(())
}

pub async fn show(name: &str) -> anyhow::Result<()> {
    let orchestrator = runtime::orchestrator().await?;
    let loader = orchestrator.loader();
    let def = match loader.registry().find(name)? {
        Some(def) => def,
        None => loader
            .legacy()
            .load(name)?
            .ok_or_else(|| anyhow!("Agent '{}' not found", name))?,
    };
    print_json(&def)
}

pub async fn register(file: &Path, name: Option<String>) -> anyhow::Result<()> {
    let def = read_definition(file, name)?;
    let orchestrator = runtime::orchestrator().await?;
    let name = def.name.clone();
    let saved = orchestrator.register_agent(&name, def).await?;
    println!("Registered '{}' ({})", saved.name, saved.version);
    if !saved.dependencies.is_empty() {
        println!("  dependencies: {}", saved.dependencies.join(", "));
    }
    Ok(())
}

pub async fn run(name: &str, params: &str, session: &str) -> anyhow::Result<()> {
    let params: Value = serde_json::from_str(params).context("--params must be valid JSON")?;
    let orchestrator = runtime::orchestrator().await?;
    let outcome = orchestrator.execute_agent(name, params, session_context(session)).await;
    print_json(&outcome)
}

pub async fn unload(name: &str) -> anyhow::Result<()> {
    let orchestrator = runtime::orchestrator().await?;
    orchestrator.unload_agent(name);
    if orchestrator.loader().registry().remove(name)? {
        println!("Removed '{}'", name);
    } else {
        println!("'{}' is not registered", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_rhai_definition() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("notes.rhai");
        std::fs::write(&file, "fn execute(p, c) { p }").unwrap();
        let def = read_definition(&file, None).unwrap();
        assert_eq!(def.name, "notes");
        assert!(def.code.is_some());

        let def = read_definition(&file, Some("renamed".into())).unwrap();
        assert_eq!(def.name, "renamed");
    }

    #[test]
    fn test_read_yaml_definition() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("weather.yaml");
        std::fs::write(&file, "description: Weather\ndependencies: fs, path\ncode: 'fn execute(p, c) { 1 }'\n")
            .unwrap();
        let def = read_definition(&file, None).unwrap();
        assert_eq!(def.name, "weather");
        assert_eq!(def.dependencies, vec!["fs", "path"]);
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("agent.txt");
        std::fs::write(&file, "").unwrap();
        assert!(read_definition(&file, None).is_err());
    }
}
