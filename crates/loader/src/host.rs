//! Host functions exposed to agent scripts.
//!
//! Scripts run on blocking threads; bindings that need async work
//! (`call_agent`, `use_dep`, window controls) re-enter the runtime through
//! the captured [`Handle`].

use deskmate_core::AgentContext;
use rhai::{Dynamic, Engine, Map, Scope};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::convert::{dynamic_to_json, json_to_dynamic, map_to_json};

/// Everything a script call can reach on the host side.
pub struct HostEnv {
    pub agent_name: String,
    pub agent_dir: String,
    pub ctx: AgentContext,
    pub handle: Handle,
}

impl HostEnv {
    pub fn new(agent_name: &str, agent_dir: &str, ctx: AgentContext, handle: Handle) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            agent_dir: agent_dir.to_string(),
            ctx,
            handle,
        }
    }

    /// Scope with the `AGENT_NAME` and `AGENT_DIR` constants.
    pub fn scope(&self) -> Scope<'static> {
        let mut scope = Scope::new();
        scope.push_constant("AGENT_NAME", self.agent_name.clone());
        scope.push_constant("AGENT_DIR", self.agent_dir.clone());
        scope
    }

    fn call_agent(&self, name: &str, params: Value) -> Value {
        if name == self.agent_name || self.ctx.is_calling(name) {
            let mut chain = self.ctx.call_chain.clone();
            chain.push(self.agent_name.clone());
            chain.push(name.to_string());
            return json!({
                "success": false,
                "error": format!("call_agent cycle: {}", chain.join(" -> ")),
            });
        }
        let Some(invoker) = self.ctx.invoker.clone() else {
            return json!({"success": false, "error": "No orchestrator available for call_agent"});
        };

        // The callee shares data but not the caller's workflow control.
        let mut call_chain = self.ctx.call_chain.clone();
        call_chain.push(self.agent_name.clone());
        let child = AgentContext {
            shared: self.ctx.shared.clone(),
            dependencies: Default::default(),
            invoker: Some(invoker.clone()),
            control: Default::default(),
            host: self.ctx.host.clone(),
            call_chain,
        };

        debug!(caller = %self.agent_name, callee = %name, "call_agent");
        match self.handle.block_on(invoker.invoke_agent(name, params, child)) {
            Ok(out) => json!({"success": out.success, "result": out.result, "error": out.error}),
            Err(e) => json!({"success": false, "error": e.to_string()}),
        }
    }

    fn use_dep(&self, name: &str, method: &str, args: Value) -> Value {
        let Some(dep) = self.ctx.dependency(name).cloned() else {
            return json!({"error": format!("Dependency '{}' is not available", name)});
        };
        match self.handle.block_on(dep.invoke(method, args)) {
            Ok(v) => v,
            Err(e) => json!({"error": e.to_string()}),
        }
    }

    fn hide_windows(&self) -> bool {
        let Some(host) = self.ctx.host.clone() else {
            return false;
        };
        match self.handle.block_on(host.hide_all_windows()) {
            Ok(()) => true,
            Err(e) => {
                warn!(agent = %self.agent_name, error = %e, "hide_windows failed");
                false
            }
        }
    }

    fn show_windows(&self, info: Value) -> bool {
        let Some(host) = self.ctx.host.clone() else {
            return false;
        };
        match self.handle.block_on(host.show_all_windows(info)) {
            Ok(()) => true,
            Err(e) => {
                warn!(agent = %self.agent_name, error = %e, "show_windows failed");
                false
            }
        }
    }
}

/// Register the host API on `engine`.
pub fn register_host_api(engine: &mut Engine, env: Arc<HostEnv>) {
    {
        let env = env.clone();
        engine.register_fn("log", move |msg: &str| {
            info!(agent = %env.agent_name, "{}", msg);
        });
    }
    {
        let env = env.clone();
        engine.register_fn("log_warn", move |msg: &str| {
            warn!(agent = %env.agent_name, "{}", msg);
        });
    }

    engine.register_fn("to_json", |val: Dynamic| -> String {
        serde_json::to_string(&dynamic_to_json(&val)).unwrap_or_default()
    });
    engine.register_fn("from_json", |s: &str| -> Dynamic {
        serde_json::from_str::<Value>(s)
            .map(|v| json_to_dynamic(&v))
            .unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("timestamp", || -> i64 { chrono::Utc::now().timestamp_millis() });

    {
        let env = env.clone();
        engine.register_fn("call_agent", move |name: &str, params: Map| -> Dynamic {
            json_to_dynamic(&env.call_agent(name, map_to_json(&params)))
        });
    }
    {
        let env = env.clone();
        engine.register_fn("call_agent", move |name: &str| -> Dynamic {
            json_to_dynamic(&env.call_agent(name, json!({})))
        });
    }

    {
        let env = env.clone();
        engine.register_fn("use_dep", move |name: &str, method: &str, args: Dynamic| -> Dynamic {
            json_to_dynamic(&env.use_dep(name, method, dynamic_to_json(&args)))
        });
    }
    {
        let env = env.clone();
        engine.register_fn("use_dep", move |name: &str, method: &str| -> Dynamic {
            json_to_dynamic(&env.use_dep(name, method, Value::Null))
        });
    }

    {
        let env = env.clone();
        engine.register_fn("workflow_start", move || env.ctx.control.start());
    }
    {
        let env = env.clone();
        engine.register_fn("workflow_next", move || env.ctx.control.next(None));
    }
    {
        let env = env.clone();
        engine.register_fn("workflow_jump", move |step: i64| {
            // Negative targets are kept out of range so the engine rejects them.
            let target = usize::try_from(step).unwrap_or(usize::MAX);
            env.ctx.control.jump_to(target);
        });
    }
    {
        let env = env.clone();
        engine.register_fn("workflow_stop", move |reason: &str| env.ctx.control.stop(reason));
    }
    {
        let env = env.clone();
        engine.register_fn("workflow_pause", move |reason: &str| env.ctx.control.pause(reason));
    }

    {
        let env = env.clone();
        engine.register_fn("hide_windows", move || -> bool { env.hide_windows() });
    }
    {
        let env = env.clone();
        engine.register_fn("show_windows", move || -> bool { env.show_windows(Value::Null) });
    }
    engine.register_fn("show_windows", move |info: Map| -> bool { env.show_windows(map_to_json(&info)) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SandboxEngine;
    use deskmate_core::ControlAction;

    fn eval(env: Arc<HostEnv>, script: &str) -> Dynamic {
        let sandbox = SandboxEngine::default();
        let mut engine = sandbox.build();
        let mut scope = env.scope();
        register_host_api(&mut engine, env);
        engine.eval_with_scope::<Dynamic>(&mut scope, script).unwrap()
    }

    #[tokio::test]
    async fn test_constants_and_json_helpers() {
        let env = Arc::new(HostEnv::new("notes", "/tmp/agents", AgentContext::new(), Handle::current()));
        let out = tokio::task::spawn_blocking(move || {
            dynamic_to_json(&eval(
                env,
                r#"
                let parsed = from_json("{\"a\": [1, 2]}");
                #{ name: AGENT_NAME, dir: AGENT_DIR, encoded: to_json(parsed), len: parsed.a.len() }
                "#,
            ))
        })
        .await
        .unwrap();
        assert_eq!(out["name"], "notes");
        assert_eq!(out["dir"], "/tmp/agents");
        assert_eq!(out["encoded"], "{\"a\":[1,2]}");
        assert_eq!(out["len"], 2);
    }

    #[tokio::test]
    async fn test_workflow_control_bindings() {
        let ctx = AgentContext::new();
        let control = ctx.control.clone();
        let env = Arc::new(HostEnv::new("step", "", ctx, Handle::current()));
        tokio::task::spawn_blocking(move || eval(env, "workflow_jump(3); 1"))
            .await
            .unwrap();
        let directive = control.take().unwrap();
        assert_eq!(directive.action, ControlAction::Next);
        assert_eq!(directive.target_step, Some(3));
    }

    #[tokio::test]
    async fn test_missing_dependency_and_invoker() {
        let env = Arc::new(HostEnv::new("lonely", "", AgentContext::new(), Handle::current()));
        let out = tokio::task::spawn_blocking(move || {
            dynamic_to_json(&eval(
                env,
                r#"#{ dep: use_dep("fs", "exists", "/"), called: call_agent("other"), hidden: hide_windows() }"#,
            ))
        })
        .await
        .unwrap();
        assert!(out["dep"]["error"].as_str().unwrap().contains("fs"));
        assert_eq!(out["called"]["success"], false);
        assert_eq!(out["hidden"], false);
    }

    #[tokio::test]
    async fn test_call_agent_rejects_cycles() {
        let mut ctx = AgentContext::new();
        ctx.call_chain = vec!["ping".to_string()];
        let env = Arc::new(HostEnv::new("pong", "", ctx, Handle::current()));
        let out = tokio::task::spawn_blocking(move || {
            dynamic_to_json(&eval(env, r#"#{ back: call_agent("ping"), direct: call_agent("pong") }"#))
        })
        .await
        .unwrap();
        assert_eq!(out["back"]["success"], false);
        assert!(out["back"]["error"].as_str().unwrap().contains("ping -> pong -> ping"));
        assert_eq!(out["direct"]["success"], false);
    }
}
