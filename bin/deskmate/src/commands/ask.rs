use serde_json::Value;

use super::{print_json, runtime, session_context};

/// A JSON payload if the argument parses as one, otherwise the raw text.
pub fn parse_payload(payload: &str) -> Value {
    serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_string()))
}

pub async fn ask(payload: &str, session: &str) -> anyhow::Result<()> {
    let orchestrator = runtime::orchestrator().await?;
    let reply = orchestrator.ask(&parse_payload(payload), session_context(session)).await;
    print_json(&reply)
}

pub async fn local(message: &str, session: &str) -> anyhow::Result<()> {
    let orchestrator = runtime::orchestrator().await?;
    let reply = orchestrator
        .handle_local_orchestration(message, None, session_context(session))
        .await;
    println!("{}", reply.message);
    Ok(())
}

pub async fn chat(message: &str, session: &str) -> anyhow::Result<()> {
    let orchestrator = runtime::orchestrator().await?;
    let reply = orchestrator.process_message(message, session_context(session)).await;
    println!("{}", reply.message);
    tracing::debug!(mode = %reply.mode, intent = %reply.intent, "Reply sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_payload() {
        assert_eq!(parse_payload(r#"{"primaryIntent": "greeting"}"#), json!({"primaryIntent": "greeting"}));
        assert_eq!(parse_payload("remind me at 5"), json!("remind me at 5"));
    }
}
