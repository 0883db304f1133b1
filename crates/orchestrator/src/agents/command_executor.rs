use async_trait::async_trait;
use deskmate_core::{Agent, AgentContext, AgentOutput, Result};
use serde_json::{json, Value};
use tracing::info;

use super::{action, str_param};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowCommand {
    Hide,
    Show,
}

fn window_command(command: &str) -> Option<WindowCommand> {
    let lower = command.to_lowercase();
    let mentions_windows = ["window", "yourself", "assistant", "everything"]
        .iter()
        .any(|w| lower.contains(w));
    let starts = |verbs: &[&str]| {
        verbs
            .iter()
            .any(|v| lower.trim_start_matches("please ").starts_with(v))
    };
    if starts(&["hide", "minimize"]) && (mentions_windows || lower.split_whitespace().count() == 1) {
        return Some(WindowCommand::Hide);
    }
    if starts(&["show", "restore", "unhide"]) && (mentions_windows || lower.split_whitespace().count() == 1) {
        return Some(WindowCommand::Show);
    }
    None
}

/// Carries out desktop commands. Window visibility is handled through the
/// host; anything else is acknowledged for the host application to act on.
pub struct CommandExecutorAgent;

#[async_trait]
impl Agent for CommandExecutorAgent {
    fn name(&self) -> &str {
        "command_executor"
    }

    fn description(&self) -> &str {
        "Executes desktop commands"
    }

    async fn execute(&self, params: Value, ctx: AgentContext) -> Result<AgentOutput> {
        if !matches!(action(&params), "execute" | "run") {
            return Ok(AgentOutput::failure(format!(
                "command_executor: unsupported action '{}'",
                action(&params)
            )));
        }
        let Some(command) = str_param(&params, &["command", "text"]).or_else(|| ctx.get_str("sourceText")) else {
            return Ok(AgentOutput::failure("command_executor requires a 'command'"));
        };

        match (window_command(command), &ctx.host) {
            (Some(WindowCommand::Hide), Some(host)) => {
                host.hide_all_windows().await?;
                info!(command, "Windows hidden");
                Ok(AgentOutput::ok(json!({"executed": true, "command": command, "effect": "windows_hidden"})))
            }
            (Some(WindowCommand::Show), Some(host)) => {
                host.show_all_windows(json!({"reason": "command"})).await?;
                info!(command, "Windows shown");
                Ok(AgentOutput::ok(json!({"executed": true, "command": command, "effect": "windows_shown"})))
            }
            _ => Ok(AgentOutput::ok(json!({
                "executed": false,
                "acknowledged": true,
                "command": command,
            }))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_command_detection() {
        assert_eq!(window_command("hide all windows"), Some(WindowCommand::Hide));
        assert_eq!(window_command("please minimize yourself"), Some(WindowCommand::Hide));
        assert_eq!(window_command("Show"), Some(WindowCommand::Show));
        assert_eq!(window_command("restore the window"), Some(WindowCommand::Show));
        assert_eq!(window_command("hide the file report.pdf"), None);
        assert_eq!(window_command("open the browser"), None);
    }

    #[tokio::test]
    async fn test_other_commands_are_acknowledged() {
        let out = CommandExecutorAgent
            .execute(json!({"action": "execute", "command": "open the browser"}), AgentContext::new())
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.result["acknowledged"], true);
        assert_eq!(out.result["executed"], false);
    }
}
