//! Intent payload normalization and intent → agent routing.

use deskmate_core::{IntentPayload, IntentScore};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::workflow::WorkflowStep;

/// How many wrapper layers (`intentPayload`, `payload`, `message`, JSON
/// strings) are peeled off before the input is taken as-is.
const MAX_UNWRAP_DEPTH: usize = 5;

const WRAPPER_KEYS: [&str; 4] = ["intentPayload", "intent_payload", "payload", "message"];

/// Keys checked, in order, for the text a payload carries.
const TEXT_KEYS: [&str; 8] = [
    "sourceText",
    "source_text",
    "text",
    "message",
    "content",
    "query",
    "prompt",
    "input",
];

/// Agents run for each intent, in fan-out order.
const INTENT_TABLE: &[(&str, &[&str])] = &[
    ("memory_store", &["memory"]),
    ("memory_retrieve", &["memory"]),
    ("command", &["memory", "command_executor"]),
    ("schedule", &["scheduler"]),
    ("reminder", &["scheduler"]),
    ("question", &["local_llm"]),
    ("screen_capture", &["screen_capture"]),
];

/// Intents understood without any agent behind them.
const KNOWN_UNMAPPED: [&str; 1] = ["greeting"];

pub fn agents_for_intent(intent: &str) -> &'static [&'static str] {
    INTENT_TABLE
        .iter()
        .find(|(name, _)| *name == intent)
        .map(|(_, agents)| *agents)
        .unwrap_or(&[])
}

pub fn is_known_intent(intent: &str) -> bool {
    KNOWN_UNMAPPED.contains(&intent) || INTENT_TABLE.iter().any(|(name, _)| *name == intent)
}

/// Bring any accepted payload shape into canonical form.
pub fn normalize_intent_payload(input: &Value) -> IntentPayload {
    normalize_at(input, 0).ensure_invariants()
}

fn normalize_at(input: &Value, depth: usize) -> IntentPayload {
    match input {
        Value::String(s) => {
            let text = s.trim();
            if depth < MAX_UNWRAP_DEPTH {
                if let Ok(parsed) = serde_json::from_str::<Value>(text) {
                    if parsed.is_object() || parsed.is_array() {
                        return normalize_at(&parsed, depth + 1);
                    }
                }
            }
            if is_known_intent(text) {
                IntentPayload::single(text, "")
            } else {
                IntentPayload::fallback(text)
            }
        }
        Value::Object(obj) => {
            if depth < MAX_UNWRAP_DEPTH {
                if let Some(inner) = WRAPPER_KEYS.iter().find_map(|k| obj.get(*k).filter(|v| is_wrapped(v))) {
                    return normalize_at(inner, depth + 1);
                }
            }
            if looks_like_payload(obj) {
                from_object(obj)
            } else {
                IntentPayload::fallback(&plausible_text(input))
            }
        }
        Value::Array(items) => {
            let intents = parse_intents(items);
            if intents.is_empty() {
                IntentPayload::fallback(&plausible_text(input))
            } else {
                IntentPayload {
                    primary_intent: String::new(),
                    intents,
                    ..IntentPayload::fallback("")
                }
            }
        }
        Value::Null => IntentPayload::fallback(""),
        other => IntentPayload::fallback(&other.to_string()),
    }
}

/// A wrapper value worth unwrapping: an object, or a string holding one.
fn is_wrapped(value: &Value) -> bool {
    match value {
        Value::Object(_) => true,
        Value::String(s) => serde_json::from_str::<Value>(s.trim()).map_or(false, |v| v.is_object()),
        _ => false,
    }
}

fn looks_like_payload(obj: &Map<String, Value>) -> bool {
    ["intents", "primaryIntent", "primary_intent", "intent"]
        .iter()
        .any(|k| obj.contains_key(*k))
}

fn get<'a>(obj: &'a Map<String, Value>, camel: &str, snake: &str) -> Option<&'a Value> {
    obj.get(camel).or_else(|| obj.get(snake))
}

fn parse_intents(items: &[Value]) -> Vec<IntentScore> {
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) if !s.trim().is_empty() => Some(IntentScore::new(s.trim(), 1.0)),
            Value::Object(o) => {
                let name = ["intent", "name", "type"]
                    .iter()
                    .find_map(|k| o.get(*k).and_then(|v| v.as_str()))
                    .map(str::trim)
                    .filter(|s| !s.is_empty())?;
                let confidence = ["confidence", "score"]
                    .iter()
                    .find_map(|k| o.get(*k).and_then(|v| v.as_f64()))
                    .unwrap_or(1.0);
                let mut score = IntentScore::new(name, confidence);
                score.reasoning = o.get("reasoning").and_then(|v| v.as_str()).map(String::from);
                Some(score)
            }
            _ => None,
        })
        .collect()
}

fn from_object(obj: &Map<String, Value>) -> IntentPayload {
    let mut intents = obj
        .get("intents")
        .and_then(|v| v.as_array())
        .map(|items| parse_intents(items))
        .unwrap_or_default();

    let single = obj
        .get("intent")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let primary = get(obj, "primaryIntent", "primary_intent")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or(single)
        .map(String::from)
        .unwrap_or_default();

    if !primary.is_empty() && !intents.iter().any(|i| i.intent == primary) {
        let confidence = get(obj, "confidence", "score").and_then(|v| v.as_f64()).unwrap_or(1.0);
        intents.insert(0, IntentScore::new(&primary, confidence));
    }

    let entities = match obj.get("entities") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![other.clone()],
    };

    let source_text = TEXT_KEYS
        .iter()
        .filter_map(|key| obj.get(*key).and_then(|v| v.as_str()))
        .find(|s| !s.trim().is_empty())
        .unwrap_or_default()
        .to_string();

    IntentPayload {
        intents,
        primary_intent: primary,
        entities,
        requires_memory_access: get(obj, "requiresMemoryAccess", "requires_memory_access")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        capture_screen: get(obj, "captureScreen", "capture_screen").and_then(|v| v.as_bool()),
        source_text,
        suggested_response: get(obj, "suggestedResponse", "suggested_response")
            .and_then(|v| v.as_str())
            .map(String::from),
    }
}

/// Best guess at the user's text inside an unrecognized value.
pub fn plausible_text(value: &Value) -> String {
    if let Value::Object(obj) = value {
        if let Some(text) = TEXT_KEYS
            .iter()
            .find_map(|k| obj.get(*k).and_then(|v| v.as_str()).filter(|s| !s.trim().is_empty()))
        {
            return text.to_string();
        }
    }
    first_string(value)
        .map(String::from)
        .unwrap_or_else(|| value.to_string())
}

fn first_string(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Array(items) => items.iter().find_map(first_string),
        Value::Object(obj) => obj.values().find_map(first_string),
        _ => None,
    }
}

/// Parameters handed to `agent` for `intent`.
pub fn build_params(agent: &str, intent: &str, payload: &IntentPayload, context: &Map<String, Value>) -> Value {
    let text = payload.source_text.as_str();
    match agent {
        "memory" => {
            let action = if matches!(intent, "memory_retrieve" | "question") {
                "retrieve"
            } else {
                "store"
            };
            json!({
                "action": action,
                "text": text,
                "query": text,
                "sessionId": context.get("sessionId").cloned().unwrap_or_else(|| json!("default")),
                "entities": payload.entities,
                "metadata": {"intent": intent},
            })
        }
        "scheduler" => json!({
            "action": "create",
            "text": text,
            "entities": payload.entities,
            "intent": intent,
        }),
        "screen_capture" => json!({
            "action": "capture_and_extract",
            "options": {
                "includeOCR": true,
                "ocrOptions": {"languages": ["eng"], "confidence": 0.6},
            },
        }),
        "local_llm" => json!({
            "action": "query",
            "prompt": text,
            "options": {},
        }),
        "command_executor" => json!({
            "action": "execute",
            "command": text,
            "entities": payload.entities,
        }),
        _ => json!({
            "action": intent,
            "data": payload,
        }),
    }
}

/// A canonical payload plus the steps it fans out to.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePlan {
    pub payload: IntentPayload,
    pub steps: Vec<WorkflowStep>,
    /// Intents that produced at least one step, in order.
    pub intents_processed: Vec<String>,
    pub unmapped: Vec<String>,
}

/// Normalize `input` and build the workflow that serves it.
pub fn route(input: &Value, context: &Map<String, Value>) -> RoutePlan {
    let payload = normalize_intent_payload(input);
    let mut steps = Vec::new();
    let mut intents_processed = Vec::new();
    let mut unmapped = Vec::new();

    let mut ordered: Vec<&str> = Vec::new();
    for intent in std::iter::once(payload.primary_intent.as_str()).chain(payload.intents.iter().map(|i| i.intent.as_str())) {
        if !ordered.contains(&intent) {
            ordered.push(intent);
        }
    }

    let captures_already = ordered.contains(&"screen_capture");
    if payload.wants_screen_capture() && !captures_already {
        steps.push(
            WorkflowStep::new(
                "screen_capture",
                build_params("screen_capture", "screen_capture", &payload, context),
            )
            .continue_on_error(),
        );
    }

    for intent in ordered {
        let agents = agents_for_intent(intent);
        if agents.is_empty() {
            debug!(intent, "No agents mapped for intent");
            unmapped.push(intent.to_string());
            continue;
        }
        for agent in agents {
            let mut step_context = Map::new();
            step_context.insert("intent".into(), json!(intent));
            step_context.insert("sourceText".into(), json!(payload.source_text));
            steps.push(
                WorkflowStep::new(agent, build_params(agent, intent, &payload, context))
                    .with_context(step_context),
            );
        }
        intents_processed.push(intent.to_string());
    }

    if steps.is_empty() {
        warn!(primary = %payload.primary_intent, "Payload routed to no agents");
    }
    RoutePlan {
        payload,
        steps,
        intents_processed,
        unmapped,
    }
}

/// The steps alone, for callers that only need the workflow.
pub fn route_to_workflow(input: &Value, context: &Map<String, Value>) -> Vec<WorkflowStep> {
    route(input, context).steps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agents(steps: &[WorkflowStep]) -> Vec<&str> {
        steps.iter().map(|s| s.agent_name.as_str()).collect()
    }

    #[test]
    fn test_unknown_shape_falls_back_to_question() {
        let p = normalize_intent_payload(&json!({"foo": "bar"}));
        assert_eq!(p.primary_intent, "question");
        assert_eq!(p.source_text, "bar");
        assert_eq!(p.intents.len(), 1);
    }

    #[test]
    fn test_known_text_keys_win_over_depth_first() {
        let p = normalize_intent_payload(&json!({"meta": {"id": "x1"}, "content": "what time is it"}));
        assert_eq!(p.source_text, "what time is it");

        let p = normalize_intent_payload(&json!({"count": 3, "flags": [true]}));
        assert_eq!(p.source_text, r#"{"count":3,"flags":[true]}"#);
    }

    #[test]
    fn test_wrapped_and_json_string_payloads() {
        let inner = json!({"primary_intent": "memory_store", "source_text": "locker 42"});
        let wrapped = json!({"payload": {"intentPayload": inner.to_string()}});
        let p = normalize_intent_payload(&wrapped);
        assert_eq!(p.primary_intent, "memory_store");
        assert_eq!(p.source_text, "locker 42");

        let p = normalize_intent_payload(&json!(inner.to_string()));
        assert_eq!(p.primary_intent, "memory_store");
    }

    #[test]
    fn test_recognized_payload_reads_every_text_key() {
        let p = normalize_intent_payload(&json!({"primaryIntent": "memory_store", "content": "my pin is 1234"}));
        assert_eq!(p.primary_intent, "memory_store");
        assert_eq!(p.source_text, "my pin is 1234");

        let p = normalize_intent_payload(&json!({"primaryIntent": "command", "text": " ", "input": "hide windows"}));
        assert_eq!(p.source_text, "hide windows");

        let steps = route_to_workflow(&json!({"primaryIntent": "command", "prompt": "show windows"}), &Map::new());
        assert_eq!(steps[1].params["command"], "show windows");
    }

    #[test]
    fn test_wrapper_precedence() {
        let p = normalize_intent_payload(&json!({
            "message": {"primaryIntent": "greeting"},
            "intentPayload": {"primaryIntent": "schedule"},
        }));
        assert_eq!(p.primary_intent, "schedule");
    }

    #[test]
    fn test_plain_message_string_is_not_unwrapped() {
        let p = normalize_intent_payload(&json!({"message": "hello there"}));
        assert_eq!(p.primary_intent, "question");
        assert_eq!(p.source_text, "hello there");
    }

    #[test]
    fn test_string_intents_and_primary_default() {
        let p = normalize_intent_payload(&json!({
            "intents": ["schedule", {"name": "question", "score": 0.9}],
            "captureScreen": false,
        }));
        assert_eq!(p.intents.len(), 2);
        assert_eq!(p.primary_intent, "schedule");
        assert_eq!(p.capture_screen, Some(false));
        assert_eq!(p.intents[1].confidence, 0.9);

        let p = normalize_intent_payload(&json!("greeting"));
        assert_eq!(p.primary_intent, "greeting");
        let p = normalize_intent_payload(&json!("remind me later"));
        assert_eq!(p.primary_intent, "question");
        assert_eq!(p.source_text, "remind me later");
    }

    #[test]
    fn test_command_fan_out_order() {
        let steps = route_to_workflow(&json!({"primaryIntent": "command", "sourceText": "hide"}), &Map::new());
        assert_eq!(agents(&steps), vec!["memory", "command_executor"]);
        assert_eq!(steps[0].params["action"], "store");
        assert_eq!(steps[1].params["command"], "hide");
    }

    #[test]
    fn test_screen_capture_prepended() {
        let plan = route(
            &json!({"primaryIntent": "memory_retrieve", "requiresMemoryAccess": true}),
            &Map::new(),
        );
        assert_eq!(agents(&plan.steps), vec!["screen_capture", "memory"]);
        assert!(plan.steps[0].continue_on_error);
        assert_eq!(plan.steps[0].params["options"]["ocrOptions"]["languages"], json!(["eng"]));
        assert_eq!(plan.steps[1].params["action"], "retrieve");

        let plan = route(
            &json!({"primaryIntent": "memory_retrieve", "requiresMemoryAccess": true, "captureScreen": false}),
            &Map::new(),
        );
        assert_eq!(agents(&plan.steps), vec!["memory"]);
    }

    #[test]
    fn test_unmapped_intents_are_skipped() {
        let plan = route(&json!({"intents": ["greeting", "reminder"]}), &Map::new());
        assert_eq!(agents(&plan.steps), vec!["scheduler"]);
        assert_eq!(plan.unmapped, vec!["greeting"]);
        assert_eq!(plan.intents_processed, vec!["reminder"]);
        assert_eq!(plan.steps[0].params["action"], "create");
    }

    #[test]
    fn test_generic_params() {
        let payload = IntentPayload::single("translate", "hola");
        let params = build_params("translator", "translate", &payload, &Map::new());
        assert_eq!(params["action"], "translate");
        assert_eq!(params["data"]["sourceText"], "hola");
    }
}
