use async_trait::async_trait;
use deskmate_core::{Agent, AgentContext, AgentOutput, Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Mutex;
use tracing::info;

use super::{action, str_param};

static WHEN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:at|on|in|by|tomorrow|tonight|next)\b.*$").ok()
});

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reminder {
    pub id: String,
    pub text: String,
    /// Free-form time expression, e.g. "at 5pm" or "tomorrow".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<String>,
    pub created_at: String,
}

/// Keeps reminders and appointments for the lifetime of the process.
#[derive(Default)]
pub struct SchedulerAgent {
    reminders: Mutex<Vec<Reminder>>,
}

impl SchedulerAgent {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_reminders<T>(&self, f: impl FnOnce(&mut Vec<Reminder>) -> T) -> Result<T> {
        let mut reminders = self
            .reminders
            .lock()
            .map_err(|e| Error::Other(format!("Scheduler state poisoned: {}", e)))?;
        Ok(f(&mut reminders))
    }
}

/// Time expression from typed entities, an explicit field, or the text.
fn due_of(params: &Value, text: &str) -> Option<String> {
    if let Some(due) = str_param(params, &["due", "when", "time"]) {
        return Some(due.to_string());
    }
    let from_entities = params
        .get("entities")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .find_map(|e| {
            let kind = e.get("type").and_then(|t| t.as_str())?;
            matches!(kind, "time" | "date" | "datetime")
                .then(|| e.get("value").or_else(|| e.get("text")).and_then(|v| v.as_str()))
                .flatten()
        });
    if let Some(due) = from_entities {
        return Some(due.to_string());
    }
    WHEN.as_ref()
        .and_then(|re| re.find(text))
        .map(|m| m.as_str().trim().to_string())
}

#[async_trait]
impl Agent for SchedulerAgent {
    fn name(&self) -> &str {
        "scheduler"
    }

    fn description(&self) -> &str {
        "Keeps reminders and appointments"
    }

    async fn execute(&self, params: Value, _ctx: AgentContext) -> Result<AgentOutput> {
        match action(&params) {
            "create" => {
                let Some(text) = str_param(&params, &["text", "title"]) else {
                    return Ok(AgentOutput::failure("scheduler.create requires 'text'"));
                };
                let reminder = Reminder {
                    id: uuid::Uuid::new_v4().to_string(),
                    text: text.to_string(),
                    due: due_of(&params, text),
                    created_at: chrono::Utc::now().to_rfc3339(),
                };
                info!(id = %reminder.id, due = ?reminder.due, "Reminder created");
                let stored = reminder.clone();
                self.with_reminders(|r| r.push(stored))?;
                Ok(AgentOutput::ok(json!({"created": true, "reminder": reminder})))
            }
            "list" => {
                let reminders = self.with_reminders(|r| r.clone())?;
                Ok(AgentOutput::ok(json!({"count": reminders.len(), "reminders": reminders})))
            }
            "cancel" | "delete" => {
                let Some(id) = str_param(&params, &["id"]).map(String::from) else {
                    return Ok(AgentOutput::failure("scheduler.cancel requires 'id'"));
                };
                let removed = self.with_reminders(|r| {
                    let before = r.len();
                    r.retain(|item| item.id != id);
                    before != r.len()
                })?;
                Ok(AgentOutput::ok(json!({"cancelled": removed, "id": id})))
            }
            other => Ok(AgentOutput::failure(format!("scheduler: unsupported action '{}'", other))),
        }
    }
}
