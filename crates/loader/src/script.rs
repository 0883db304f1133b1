//! Agents whose source is stored as a Rhai script.
//!
//! Three layouts are recognised, in this order:
//!
//! 1. top-level `fn execute(params, context)` with an optional
//!    `fn bootstrap(config, context)`;
//! 2. a variable named `agent` holding an object map;
//! 3. the script's final expression evaluating to an object map.
//!
//! An object map either carries function pointers (`execute: |p, c| ...`
//! or `execute: Fn("run")`, called with the map bound as `this`) or, in the
//! older string layout, source fragments under `code` / `bootstrap` that are
//! wrapped into function bodies. Anything that cannot produce a working
//! `execute` yields a [`DegradedAgent`].

use async_trait::async_trait;
use deskmate_core::types::extract_function;
use deskmate_core::{Agent, AgentContext, AgentDefinition, AgentOutput, Error, Result};
use rhai::{CallFnOptions, Dynamic, FnPtr, Map, AST};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::convert::{dynamic_to_json, json_to_dynamic};
use crate::engine::SandboxEngine;
use crate::host::{register_host_api, HostEnv};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Bootstrap,
    Execute,
}

impl Phase {
    fn fn_name(self) -> &'static str {
        match self {
            Phase::Bootstrap => "bootstrap",
            Phase::Execute => "execute",
        }
    }
}

enum Entry {
    Functions {
        has_bootstrap: bool,
    },
    Object {
        state: Mutex<Map>,
        execute: FnPtr,
        bootstrap: Option<FnPtr>,
    },
}

struct Program {
    name: String,
    description: String,
    dependencies: Vec<String>,
    agent_dir: String,
    ast: AST,
    entry: Entry,
    sandbox: SandboxEngine,
}

impl Program {
    fn has_phase(&self, phase: Phase) -> bool {
        match (&self.entry, phase) {
            (_, Phase::Execute) => true,
            (Entry::Functions { has_bootstrap }, Phase::Bootstrap) => *has_bootstrap,
            (Entry::Object { bootstrap, .. }, Phase::Bootstrap) => bootstrap.is_some(),
        }
    }

    /// Run one phase synchronously. Must be called off the async runtime.
    fn call(&self, phase: Phase, arg: Value, ctx: AgentContext, handle: Handle) -> Result<Value> {
        let ctx_json = ctx.to_json();
        let env = Arc::new(HostEnv::new(&self.name, &self.agent_dir, ctx, handle));
        let mut scope = env.scope();
        let mut engine = self.sandbox.build();
        register_host_api(&mut engine, env);

        let args = vec![json_to_dynamic(&arg), json_to_dynamic(&ctx_json)];

        let out = match &self.entry {
            Entry::Functions { .. } => engine.call_fn_with_options::<Dynamic>(
                CallFnOptions::new().eval_ast(false),
                &mut scope,
                &self.ast,
                phase.fn_name(),
                args,
            ),
            Entry::Object {
                state,
                execute,
                bootstrap,
            } => {
                let ptr = match phase {
                    Phase::Execute => execute,
                    Phase::Bootstrap => match bootstrap {
                        Some(ptr) => ptr,
                        None => return Ok(Value::Null),
                    },
                };
                let snapshot = state
                    .lock()
                    .map_err(|e| Error::Evaluation(format!("Agent state poisoned: {}", e)))?
                    .clone();
                let mut this = Dynamic::from_map(snapshot);

                let mut full_args: Vec<Dynamic> = ptr.curry().to_vec();
                full_args.extend(args);

                let result = engine.call_fn_with_options::<Dynamic>(
                    CallFnOptions::new().eval_ast(false).bind_this_ptr(&mut this),
                    &mut scope,
                    &self.ast,
                    ptr.fn_name(),
                    full_args,
                );

                // Field writes through `this` persist across calls.
                if let Some(map) = this.try_cast::<Map>() {
                    if let Ok(mut guard) = state.lock() {
                        *guard = map;
                    }
                }
                result
            }
        };

        out.map(|d| dynamic_to_json(&d)).map_err(SandboxEngine::describe_error)
    }
}

/// A loaded script agent.
pub struct ScriptAgent {
    program: Arc<Program>,
}

impl ScriptAgent {
    async fn run(&self, phase: Phase, arg: Value, ctx: AgentContext) -> Result<Value> {
        let program = self.program.clone();
        let handle = Handle::current();
        tokio::task::spawn_blocking(move || program.call(phase, arg, ctx, handle))
            .await
            .map_err(|e| Error::Evaluation(format!("Agent '{}' panicked: {}", self.program.name, e)))?
    }

    pub fn has_bootstrap(&self) -> bool {
        self.program.has_phase(Phase::Bootstrap)
    }
}

#[async_trait]
impl Agent for ScriptAgent {
    fn name(&self) -> &str {
        &self.program.name
    }

    fn description(&self) -> &str {
        &self.program.description
    }

    fn dependencies(&self) -> Vec<String> {
        self.program.dependencies.clone()
    }

    async fn bootstrap(&self, config: &Value, ctx: &AgentContext) -> Result<()> {
        if !self.has_bootstrap() {
            return Ok(());
        }
        let out = self.run(Phase::Bootstrap, config.clone(), ctx.clone()).await?;
        if out.get("success").and_then(|v| v.as_bool()) == Some(false) {
            let reason = out
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("bootstrap reported failure");
            return Err(Error::Evaluation(format!("Bootstrap of '{}' failed: {}", self.program.name, reason)));
        }
        Ok(())
    }

    async fn execute(&self, params: Value, ctx: AgentContext) -> Result<AgentOutput> {
        let out = self.run(Phase::Execute, params, ctx).await?;
        Ok(AgentOutput::from_value(out))
    }
}

/// Stand-in for an agent whose source could not produce a usable `execute`.
pub struct DegradedAgent {
    name: String,
    description: String,
    reason: String,
}

impl DegradedAgent {
    pub fn new(name: &str, description: &str, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

#[async_trait]
impl Agent for DegradedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, _params: Value, _ctx: AgentContext) -> Result<AgentOutput> {
        Ok(AgentOutput::failure(format!("DummyAgent: {}", self.reason)))
    }
}

/// Remove `//` and `/* */` comments, leaving code and string contents.
fn strip_comments(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars().peekable();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                '\\' => {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                out.push(c);
            }
            ('/', Some('/')) => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for skipped in chars.by_ref() {
                    if prev == '*' && skipped == '/' {
                        break;
                    }
                    prev = skipped;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn is_placeholder_fragment(fragment: &str) -> bool {
    strip_comments(fragment).trim().is_empty()
}

/// True when the body of `fn <name>(...)` is empty or comments only.
fn has_placeholder_body(source: &str, name: &str) -> bool {
    let Some(text) = extract_function(source, name) else {
        return false;
    };
    match (text.find('{'), text.rfind('}')) {
        (Some(open), Some(close)) if close > open => is_placeholder_fragment(&text[open + 1..close]),
        _ => false,
    }
}

fn has_fn(ast: &AST, name: &str, arity: usize) -> bool {
    ast.iter_functions().any(|f| f.name == name && f.params.len() == arity)
}

fn has_fn_named(ast: &AST, name: &str) -> bool {
    ast.iter_functions().any(|f| f.name == name)
}

/// A pointer is callable when it names a closure or a function in the script.
fn callable(ptr: &FnPtr, ast: &AST) -> bool {
    ptr.is_anonymous() || has_fn_named(ast, ptr.fn_name())
}

struct Detection {
    ast: AST,
    entry: Entry,
}

fn detect_functions(source: &str, ast: AST) -> std::result::Result<Option<Detection>, String> {
    if !has_fn(&ast, "execute", 2) {
        return Ok(None);
    }
    if has_placeholder_body(source, "execute") {
        return Err("execute is a placeholder with an empty body".to_string());
    }
    let has_bootstrap = has_fn(&ast, "bootstrap", 2);
    Ok(Some(Detection {
        ast,
        entry: Entry::Functions { has_bootstrap },
    }))
}

fn detect_object(map: Map, ast: AST, sandbox: &SandboxEngine) -> std::result::Result<Detection, String> {
    if let Some(execute) = map.get("execute").and_then(|v| v.clone().try_cast::<FnPtr>()) {
        if !callable(&execute, &ast) {
            return Err(format!(
                "execute points to undefined function '{}'",
                execute.fn_name()
            ));
        }
        let bootstrap = map
            .get("bootstrap")
            .and_then(|v| v.clone().try_cast::<FnPtr>())
            .filter(|ptr| callable(ptr, &ast));
        return Ok(Detection {
            ast,
            entry: Entry::Object {
                state: Mutex::new(map),
                execute,
                bootstrap,
            },
        });
    }

    let fragment = |key: &str| map.get(key).and_then(|v| v.clone().into_string().ok());
    let Some(code) = fragment("execute").or_else(|| fragment("code")) else {
        return Err("no execute function found: define fn execute(params, context) or export an object with an execute member".to_string());
    };
    if is_placeholder_fragment(&code) {
        return Err("execute is a placeholder with an empty body".to_string());
    }

    let mut wrapped = String::new();
    if let Some(boot) = fragment("bootstrap").filter(|b| !is_placeholder_fragment(b)) {
        wrapped.push_str(&format!("fn bootstrap(config, context) {{\n{}\n}}\n\n", boot));
    }
    wrapped.push_str(&format!("fn execute(params, context) {{\n{}\n}}\n", code));

    let ast = sandbox
        .compile(&wrapped)
        .map_err(|e| format!("evaluation failed: {}", e))?;
    let has_bootstrap = has_fn(&ast, "bootstrap", 2);
    Ok(Detection {
        ast,
        entry: Entry::Functions { has_bootstrap },
    })
}

fn detect(
    def: &AgentDefinition,
    code: &str,
    sandbox: &SandboxEngine,
    agent_dir: &str,
    handle: Handle,
) -> std::result::Result<Detection, String> {
    // A separately supplied bootstrap is prepended when the code lacks one.
    let source = match def.bootstrap_source.as_deref() {
        Some(boot) if extract_function(code, "bootstrap").is_none() && boot.contains("fn bootstrap") => {
            format!("{}\n\n{}", boot, code)
        }
        _ => code.to_string(),
    };

    let ast = sandbox
        .compile(&source)
        .map_err(|e| format!("evaluation failed: {}", e))?;

    let ast = match detect_functions(&source, ast.clone())? {
        Some(found) => return Ok(found),
        None => ast,
    };

    let env = Arc::new(HostEnv::new(&def.name, agent_dir, AgentContext::new(), handle));
    let mut scope = env.scope();
    let mut engine = sandbox.build();
    register_host_api(&mut engine, env);
    let value = engine
        .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
        .map_err(|e| format!("evaluation failed: {}", SandboxEngine::describe_error(e)))?;

    let exported = scope
        .get_value::<Map>("agent")
        .or_else(|| value.try_cast::<Map>());
    match exported {
        Some(map) => detect_object(map, ast, sandbox),
        None => Err("no execute function found: define fn execute(params, context) or export an object with an execute member".to_string()),
    }
}

/// Materialize an agent from stored source. Never fails: problems produce a
/// [`DegradedAgent`]. Runs script top-level code, so call it off the runtime.
pub fn load_script_agent(
    def: &AgentDefinition,
    code: &str,
    sandbox: &SandboxEngine,
    agent_dir: &str,
    handle: Handle,
) -> Arc<dyn Agent> {
    match detect(def, code, sandbox, agent_dir, handle) {
        Ok(Detection { ast, entry }) => {
            debug!(agent = %def.name, "Script agent loaded");
            Arc::new(ScriptAgent {
                program: Arc::new(Program {
                    name: def.name.clone(),
                    description: def.description.clone(),
                    dependencies: def.dependencies.clone(),
                    agent_dir: agent_dir.to_string(),
                    ast,
                    entry,
                    sandbox: sandbox.clone(),
                }),
            })
        }
        Err(reason) => {
            warn!(agent = %def.name, reason = %reason, "Agent degraded");
            Arc::new(DegradedAgent::new(&def.name, &def.description, reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn load(code: &str) -> Arc<dyn Agent> {
        let def = AgentDefinition::new("probe", "test agent");
        let code = code.to_string();
        let handle = Handle::current();
        tokio::task::spawn_blocking(move || {
            load_script_agent(&def, &code, &SandboxEngine::default(), "/tmp/agents", handle)
        })
        .await
        .unwrap()
    }

    #[test]
    fn test_strip_comments() {
        assert!(is_placeholder_fragment("  // TODO\n /* later */ "));
        assert!(!is_placeholder_fragment("\"// not a comment\""));
        assert!(has_placeholder_body("fn execute(p, c) {\n  // nothing yet\n}", "execute"));
        assert!(!has_placeholder_body("fn execute(p, c) { p }", "execute"));
    }

    #[tokio::test]
    async fn test_top_level_functions() {
        let agent = load(
            r#"
            fn bootstrap(config, context) { #{ success: true } }
            fn execute(params, context) {
                #{ success: true, result: #{ echoed: params.text, deps: context.dependencies.len() } }
            }
            "#,
        )
        .await;
        agent.bootstrap(&Value::Null, &AgentContext::new()).await.unwrap();
        let out = agent.execute(json!({"text": "hi"}), AgentContext::new()).await.unwrap();
        assert!(out.success);
        assert_eq!(out.result, json!({"echoed": "hi", "deps": 0}));
    }

    #[tokio::test]
    async fn test_convention_variable_with_this() {
        let agent = load(
            r#"
            let agent = #{
                count: 0,
                execute: |params, context| {
                    this.count += 1;
                    #{ success: true, result: this.count }
                }
            };
            "#,
        )
        .await;
        let first = agent.execute(json!({}), AgentContext::new()).await.unwrap();
        let second = agent.execute(json!({}), AgentContext::new()).await.unwrap();
        assert_eq!(first.result, json!(1));
        assert_eq!(second.result, json!(2));
    }

    #[tokio::test]
    async fn test_default_export_named_function() {
        let agent = load(
            r#"
            fn run(params, context) { params.n * 2 }
            #{ execute: Fn("run") }
            "#,
        )
        .await;
        let out = agent.execute(json!({"n": 21}), AgentContext::new()).await.unwrap();
        assert!(out.success);
        assert_eq!(out.result, json!(42));
    }

    #[tokio::test]
    async fn test_legacy_string_fragments() {
        let agent = load(
            r##"
            #{
                bootstrap: "#{ success: true }",
                code: "#{ success: true, result: params.a + params.b }"
            }
            "##,
        )
        .await;
        agent.bootstrap(&Value::Null, &AgentContext::new()).await.unwrap();
        let out = agent.execute(json!({"a": 1, "b": 2}), AgentContext::new()).await.unwrap();
        assert_eq!(out.result, json!(3));
    }

    #[tokio::test]
    async fn test_degraded_shapes() {
        let cases = [
            ("let x = 1;", "no execute"),
            ("fn execute(params, context) { /* soon */ }", "placeholder"),
            ("#{ code: \"// nothing\" }", "placeholder"),
            ("#{ execute: Fn(\"missing\") }", "undefined function"),
            ("let = broken", "evaluation failed"),
        ];
        for (code, expected) in cases {
            let agent = load(code).await;
            let out = agent.execute(json!({}), AgentContext::new()).await.unwrap();
            assert!(!out.success, "{}", code);
            let error = out.error.unwrap();
            assert!(error.starts_with("DummyAgent"), "{}", error);
            assert!(error.contains(expected), "{} -> {}", code, error);
        }
    }

    #[tokio::test]
    async fn test_bootstrap_failure_surfaces() {
        let agent = load(
            r#"
            fn bootstrap(config, context) { #{ success: false, error: "no api key" } }
            fn execute(params, context) { true }
            "#,
        )
        .await;
        let err = agent.bootstrap(&Value::Null, &AgentContext::new()).await.unwrap_err();
        assert!(err.to_string().contains("no api key"));
    }

    #[tokio::test]
    async fn test_runtime_error_is_evaluation_error() {
        let agent = load(r#"fn execute(params, context) { throw "boom"; }"#).await;
        let err = agent.execute(json!({}), AgentContext::new()).await.unwrap_err();
        assert!(matches!(err, Error::Evaluation(_)));
    }
}
