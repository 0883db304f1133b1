use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Intent used whenever a payload cannot be classified.
pub const FALLBACK_INTENT: &str = "question";

pub const DEFAULT_AGENT_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTarget {
    Frontend,
    #[default]
    Backend,
}

impl ExecutionTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionTarget::Frontend => "frontend",
            ExecutionTarget::Backend => "backend",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "frontend" => Some(ExecutionTarget::Frontend),
            "backend" => Some(ExecutionTarget::Backend),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseKind {
    Sqlite,
    Postgres,
    Mongodb,
    Redis,
    Other,
}

impl DatabaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::Sqlite => "sqlite",
            DatabaseKind::Postgres => "postgres",
            DatabaseKind::Mongodb => "mongodb",
            DatabaseKind::Redis => "redis",
            DatabaseKind::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Some(DatabaseKind::Sqlite),
            "postgres" | "postgresql" => Some(DatabaseKind::Postgres),
            "mongodb" | "mongo" => Some(DatabaseKind::Mongodb),
            "redis" => Some(DatabaseKind::Redis),
            "" => None,
            _ => Some(DatabaseKind::Other),
        }
    }
}

/// A registry row: everything needed to materialize an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, deserialize_with = "deserialize_dependencies")]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub execution_target: ExecutionTarget,
    #[serde(default)]
    pub requires_database: bool,
    #[serde(default)]
    pub database_kind: Option<DatabaseKind>,
    #[serde(default)]
    pub bootstrap_source: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub secrets: Value,
    #[serde(default)]
    pub metadata: Value,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

fn default_version() -> String {
    DEFAULT_AGENT_VERSION.to_string()
}

impl AgentDefinition {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: Value::Null,
            dependencies: Vec::new(),
            execution_target: ExecutionTarget::Backend,
            requires_database: false,
            database_kind: None,
            bootstrap_source: None,
            code: None,
            version: default_version(),
            config: Value::Null,
            secrets: Value::Null,
            metadata: Value::Null,
            created_at: 0,
            updated_at: 0,
        }
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    pub fn with_dependencies<S: AsRef<str>>(mut self, deps: &[S]) -> Self {
        self.dependencies = normalize_dependencies(deps.iter().map(|d| d.as_ref()));
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Fill derived fields: normalized dependencies, a bootstrap snippet pulled
    /// out of `code` when none was supplied, and the default version.
    pub fn normalized(mut self) -> Self {
        self.name = self.name.trim().to_string();
        self.dependencies = normalize_dependencies(self.dependencies.iter().map(String::as_str));
        if self.bootstrap_source.as_deref().map_or(true, |s| s.trim().is_empty()) {
            self.bootstrap_source = self.code.as_deref().and_then(extract_bootstrap);
        }
        if self.version.trim().is_empty() {
            self.version = default_version();
        }
        self
    }

    pub fn is_native(&self) -> bool {
        self.metadata
            .get("native")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Split comma-joined entries, trim, drop empties, keep first occurrence order.
pub fn normalize_dependencies<'a>(raw: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for entry in raw {
        for part in entry.split(',') {
            let part = part.trim();
            if !part.is_empty() && !out.iter().any(|d| d == part) {
                out.push(part.to_string());
            }
        }
    }
    out
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DependencyList {
    Joined(String),
    List(Vec<String>),
}

fn deserialize_dependencies<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<DependencyList> = Option::deserialize(deserializer)?;
    Ok(match raw {
        None => Vec::new(),
        Some(DependencyList::Joined(s)) => normalize_dependencies([s.as_str()]),
        Some(DependencyList::List(items)) => normalize_dependencies(items.iter().map(String::as_str)),
    })
}

/// Extract the text of `fn bootstrap(...) { ... }` from agent source.
pub fn extract_bootstrap(code: &str) -> Option<String> {
    extract_function(code, "bootstrap")
}

/// Extract the full text of the first `fn <name>(...) { ... }` in `code`.
pub fn extract_function(code: &str, name: &str) -> Option<String> {
    let needle = format!("fn {}", name);
    let mut search_from = 0;
    let start = loop {
        let found = search_from + code[search_from..].find(&needle)?;
        let rest = code[found + needle.len()..].trim_start();
        if rest.starts_with('(') {
            break found;
        }
        search_from = found + needle.len();
    };
    let open = start + code[start..].find('{')?;

    let bytes = code.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[open..].iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(code[start..open + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IntentScore {
    pub intent: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

fn default_confidence() -> f64 {
    1.0
}

impl IntentScore {
    pub fn new(intent: &str, confidence: f64) -> Self {
        Self {
            intent: intent.to_string(),
            confidence,
            reasoning: None,
        }
    }
}

/// Canonical classification result consumed by the router.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IntentPayload {
    pub intents: Vec<IntentScore>,
    pub primary_intent: String,
    #[serde(default)]
    pub entities: Vec<Value>,
    #[serde(default)]
    pub requires_memory_access: bool,
    /// `None` means "not specified", which differs from an explicit `false`.
    #[serde(default)]
    pub capture_screen: Option<bool>,
    #[serde(default)]
    pub source_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_response: Option<String>,
}

impl IntentPayload {
    pub fn single(intent: &str, source_text: &str) -> Self {
        Self {
            intents: vec![IntentScore::new(intent, 1.0)],
            primary_intent: intent.to_string(),
            entities: Vec::new(),
            requires_memory_access: false,
            capture_screen: None,
            source_text: source_text.to_string(),
            suggested_response: None,
        }
    }

    /// Payload for input that matched no recognizable shape.
    pub fn fallback(source_text: &str) -> Self {
        Self::single(FALLBACK_INTENT, source_text)
    }

    /// Enforce: at least one intent, non-empty primary intent.
    pub fn ensure_invariants(mut self) -> Self {
        self.intents.retain(|i| !i.intent.trim().is_empty());
        if self.primary_intent.trim().is_empty() {
            self.primary_intent = self
                .intents
                .iter()
                .max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal))
                .map(|i| i.intent.clone())
                .unwrap_or_else(|| FALLBACK_INTENT.to_string());
        }
        if self.intents.is_empty() {
            self.intents.push(IntentScore::new(&self.primary_intent, 1.0));
        }
        self
    }

    pub fn wants_screen_capture(&self) -> bool {
        self.capture_screen == Some(true)
            || (self.requires_memory_access && self.capture_screen != Some(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dependencies_from_joined_string() {
        let def: AgentDefinition = serde_json::from_value(json!({
            "name": "memory",
            "dependencies": "a, b, c"
        }))
        .unwrap();
        assert_eq!(def.dependencies, vec!["a", "b", "c"]);
        assert_eq!(def.version, "v1");
        assert_eq!(def.execution_target, ExecutionTarget::Backend);
    }

    #[test]
    fn test_dependencies_from_list_with_blanks() {
        let def: AgentDefinition = serde_json::from_value(json!({
            "name": "x",
            "dependencies": ["fs", " ", "path, fs", "child_process"]
        }))
        .unwrap();
        assert_eq!(def.dependencies, vec!["fs", "path", "child_process"]);
    }

    #[test]
    fn test_extract_bootstrap() {
        let code = r#"
            fn bootstrap(config, context) {
                let s = "}";
                #{ success: true }
            }

            fn execute(params, context) { #{ success: true } }
        "#;
        let snippet = extract_bootstrap(code).unwrap();
        assert!(snippet.starts_with("fn bootstrap"));
        assert!(snippet.ends_with('}'));
        assert!(!snippet.contains("fn execute"));
    }

    #[test]
    fn test_extract_function_skips_prefixed_names() {
        let code = "fn execute_later(a) { 0 }\nfn execute(params, context) { params }";
        assert_eq!(
            extract_function(code, "execute").as_deref(),
            Some("fn execute(params, context) { params }")
        );
        assert!(extract_function(code, "bootstrap").is_none());
    }

    #[test]
    fn test_normalized_fills_bootstrap() {
        let def = AgentDefinition::new("a", "")
            .with_code("fn bootstrap(c, x) { 1 } fn execute(p, x) { 2 }")
            .normalized();
        assert_eq!(def.bootstrap_source.as_deref(), Some("fn bootstrap(c, x) { 1 }"));
    }

    #[test]
    fn test_intent_payload_invariants() {
        let payload = IntentPayload {
            intents: vec![],
            primary_intent: String::new(),
            entities: vec![],
            requires_memory_access: false,
            capture_screen: None,
            source_text: "hi".into(),
            suggested_response: None,
        }
        .ensure_invariants();
        assert_eq!(payload.primary_intent, FALLBACK_INTENT);
        assert_eq!(payload.intents.len(), 1);
    }

    #[test]
    fn test_wants_screen_capture() {
        let mut p = IntentPayload::single("memory_store", "x");
        assert!(!p.wants_screen_capture());
        p.requires_memory_access = true;
        assert!(p.wants_screen_capture());
        p.capture_screen = Some(false);
        assert!(!p.wants_screen_capture());
        p.requires_memory_access = false;
        p.capture_screen = Some(true);
        assert!(p.wants_screen_capture());
    }
}
