use anyhow::{anyhow, Context};
use deskmate_orchestrator::{WorkflowStatus, WorkflowStep};
use serde_json::{Map, Value};
use std::path::Path;

use super::{print_json, runtime, session_context};

/// Steps and initial shared context from a workflow file. Accepts a bare
/// list of steps or an object with `steps` and optional `sharedContext`.
pub fn parse_workflow(content: &str, yaml: bool) -> anyhow::Result<(Vec<WorkflowStep>, Map<String, Value>)> {
    let raw: Value = if yaml {
        serde_yaml::from_str(content)?
    } else {
        serde_json::from_str(content)?
    };
    let (steps, shared) = match raw {
        Value::Array(_) => (raw, Map::new()),
        Value::Object(mut obj) => {
            let steps = obj.remove("steps").ok_or_else(|| anyhow!("Workflow file has no 'steps'"))?;
            let shared = match obj.remove("sharedContext").or_else(|| obj.remove("shared_context")) {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            };
            (steps, shared)
        }
        _ => return Err(anyhow!("Workflow file must be a list of steps or an object")),
    };
    let steps: Vec<WorkflowStep> = serde_json::from_value(steps).context("Invalid workflow steps")?;
    Ok((steps, shared))
}

pub async fn run(file: &Path, session: &str) -> anyhow::Result<()> {
    let content =
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let yaml = matches!(file.extension().and_then(|e| e.to_str()), Some("yaml" | "yml"));
    let (steps, shared) = parse_workflow(&content, yaml)?;

    let mut context = session_context(session);
    context.extend(shared);

    let orchestrator = runtime::orchestrator().await?;
    let result = orchestrator.execute_workflow(steps, context).await;
    print_json(&result)?;
    if result.status == WorkflowStatus::Paused {
        eprintln!("Workflow paused: resume is only possible within the same process.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_step_list() {
        let (steps, shared) = parse_workflow(r#"[{"agentName": "memory", "params": {"action": "list"}}]"#, false).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].agent_name, "memory");
        assert!(shared.is_empty());
    }

    #[test]
    fn test_parse_yaml_object() {
        let yaml = "steps:\n  - agentName: a\n  - agentName: b\n    continueOnError: true\nsharedContext:\n  user: sam\n";
        let (steps, shared) = parse_workflow(yaml, true).unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps[1].continue_on_error);
        assert_eq!(shared["user"], "sam");
    }

    #[test]
    fn test_parse_rejects_scalars() {
        assert!(parse_workflow("42", false).is_err());
        assert!(parse_workflow(r#"{"shared": {}}"#, false).is_err());
    }
}
