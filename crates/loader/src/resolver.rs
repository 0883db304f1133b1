use deskmate_core::{Capability, Error, Result};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::builtin::{builtin_capability, ProcessCapability};

/// Outcome of resolving one agent's declared dependencies.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionReport {
    pub resolved: Vec<String>,
    /// `(name, reason)` for each dependency that was omitted.
    pub failed: Vec<(String, String)>,
}

impl ResolutionReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Key under which a dependency is exposed to the agent:
/// `screen-capture` becomes `screenCapture`, `local.llm` becomes `localLlm`.
pub fn dependency_key(name: &str) -> String {
    let bare = name.trim().strip_prefix("node:").unwrap_or(name.trim());
    let bare = bare.strip_prefix('@').unwrap_or(bare);

    let mut key = String::with_capacity(bare.len());
    let mut upper_next = false;
    for ch in bare.chars() {
        if matches!(ch, '-' | '.' | '/') {
            upper_next = !key.is_empty();
            continue;
        }
        if upper_next {
            key.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            key.push(ch);
        }
    }
    key
}

/// Turns declared dependency names into capability objects.
///
/// Lookup order: built-in platform modules, host-registered packages,
/// then an executable of the same name on `PATH`.
pub struct DependencyResolver {
    packages: RwLock<HashMap<String, Arc<dyn Capability>>>,
    search_path_lookup: bool,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self {
            packages: RwLock::new(HashMap::new()),
            search_path_lookup: true,
        }
    }

    /// Resolver that never falls back to executables on `PATH`.
    pub fn without_path_lookup() -> Self {
        Self {
            packages: RwLock::new(HashMap::new()),
            search_path_lookup: false,
        }
    }

    pub fn register_package(&self, name: &str, capability: Arc<dyn Capability>) {
        if let Ok(mut packages) = self.packages.write() {
            packages.insert(name.trim().to_string(), capability);
        }
    }

    fn registered(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.packages.read().ok()?.get(name).cloned()
    }

    pub async fn resolve_one(&self, name: &str) -> Result<Arc<dyn Capability>> {
        let name = name.trim();
        if let Some(cap) = builtin_capability(name) {
            return Ok(cap);
        }
        if let Some(cap) = self.registered(name) {
            return Ok(cap);
        }
        if self.search_path_lookup {
            let program = name.to_string();
            let found = tokio::task::spawn_blocking(move || which::which(program))
                .await
                .map_err(|e| Error::Other(format!("PATH lookup panicked: {}", e)))?;
            if let Ok(path) = found {
                debug!(dependency = %name, path = %path.display(), "Resolved dependency from PATH");
                return Ok(Arc::new(ProcessCapability::new(name, path)));
            }
        }
        Err(Error::DependencyUnresolved {
            name: name.to_string(),
            reason: "not a built-in module, registered package or executable on PATH".to_string(),
        })
    }

    /// Resolve all names concurrently. Failures are logged and reported but
    /// never abort the batch.
    pub async fn resolve(&self, names: &[String]) -> (HashMap<String, Arc<dyn Capability>>, ResolutionReport) {
        let outcomes = join_all(names.iter().map(|name| async move {
            (name.clone(), self.resolve_one(name).await)
        }))
        .await;

        let mut resolved = HashMap::new();
        let mut report = ResolutionReport::default();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(cap) => {
                    resolved.insert(dependency_key(&name), cap);
                    report.resolved.push(name);
                }
                Err(e) => {
                    warn!(dependency = %name, error = %e, "Dependency unavailable, continuing without it");
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        (resolved, report)
    }
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Echo;

    #[async_trait]
    impl Capability for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn invoke(&self, method: &str, args: Value) -> Result<Value> {
            Ok(json!({"method": method, "args": args}))
        }
    }

    #[test]
    fn test_dependency_key() {
        assert_eq!(dependency_key("screen-capture"), "screenCapture");
        assert_eq!(dependency_key("local.llm"), "localLlm");
        assert_eq!(dependency_key("node:fs"), "fs");
        assert_eq!(dependency_key("child_process"), "child_process");
        assert_eq!(dependency_key("@scope/pkg-name"), "scopePkgName");
    }

    #[tokio::test]
    async fn test_failures_are_omitted() {
        let resolver = DependencyResolver::without_path_lookup();
        resolver.register_package("date-utils", Arc::new(Echo));

        let names: Vec<String> = ["fs", "date-utils", "definitely-missing-pkg", "node:path"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (deps, report) = resolver.resolve(&names).await;

        assert_eq!(deps.len(), 3);
        assert!(deps.contains_key("dateUtils"));
        assert!(deps.contains_key("path"));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "definitely-missing-pkg");
        assert!(!report.is_complete());

        let out = deps["dateUtils"].invoke("format", json!([1])).await.unwrap();
        assert_eq!(out["method"], "format");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_path_executable_resolves() {
        let resolver = DependencyResolver::new();
        let cap = resolver.resolve_one("cat").await.unwrap();
        assert_eq!(cap.name(), "cat");
    }
}
