use deskmate_core::{AgentDefinition, Error, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File-backed agent definitions that predate the registry.
///
/// For an agent `notes` the directory may hold `notes.rhai` (source),
/// `notes.json` / `notes.json5` or `notes.yaml` / `notes.yml` (definition).
/// A definition file without inline `code` picks up the sibling `.rhai`.
#[derive(Debug, Clone)]
pub struct LegacyAgentDir {
    dir: PathBuf,
}

const DEFINITION_EXTS: [&str; 4] = ["json", "json5", "yaml", "yml"];

impl LegacyAgentDir {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn is_safe_name(name: &str) -> bool {
        !name.is_empty()
            && !name.contains("..")
            && !name.contains('/')
            && !name.contains('\\')
    }

    fn file(&self, name: &str, ext: &str) -> Option<PathBuf> {
        let path = self.dir.join(format!("{}.{}", name, ext));
        path.is_file().then_some(path)
    }

    /// Source text from `<name>.rhai`, if present.
    pub fn source(&self, name: &str) -> Result<Option<String>> {
        if !Self::is_safe_name(name) {
            return Ok(None);
        }
        match self.file(name, "rhai") {
            Some(path) => Ok(Some(std::fs::read_to_string(path)?)),
            None => Ok(None),
        }
    }

    pub fn load(&self, name: &str) -> Result<Option<AgentDefinition>> {
        if !Self::is_safe_name(name) {
            return Ok(None);
        }

        let definition = DEFINITION_EXTS
            .iter()
            .find_map(|ext| self.file(name, ext).map(|p| (*ext, p)))
            .map(|(ext, path)| parse_definition(name, ext, &path))
            .transpose()?;
        let source = self.source(name)?;

        let def = match (definition, source) {
            (Some(mut def), source) => {
                if def.code.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    def.code = source;
                }
                def
            }
            (None, Some(source)) => AgentDefinition {
                description: leading_doc(&source),
                ..AgentDefinition::new(name, "")
            }
            .with_code(&source),
            (None, None) => return Ok(None),
        };

        debug!(agent = %name, dir = %self.dir.display(), "Loaded legacy agent definition");
        Ok(Some(def.normalized()))
    }

    /// Agent names present in the directory, sorted and deduplicated.
    pub fn names(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map_or(false, |e| e == "rhai" || DEFINITION_EXTS.contains(&e))
            })
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(String::from))
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

fn parse_definition(name: &str, ext: &str, path: &Path) -> Result<AgentDefinition> {
    let content = std::fs::read_to_string(path)?;
    let mut raw: Value = match ext {
        "yaml" | "yml" => serde_yaml::from_str(&content)?,
        _ => json5::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid agent definition {}: {}", path.display(), e)))?,
    };
    if let Some(obj) = raw.as_object_mut() {
        obj.entry("name").or_insert_with(|| Value::String(name.to_string()));
    }
    serde_json::from_value(raw)
        .map_err(|e| Error::Config(format!("Invalid agent definition {}: {}", path.display(), e)))
}

/// First block of `//!` lines, used as the description of a bare script.
fn leading_doc(source: &str) -> String {
    source
        .lines()
        .map(str::trim)
        .skip_while(|l| l.is_empty())
        .take_while(|l| l.starts_with("//!"))
        .map(|l| l.trim_start_matches("//!").trim())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bare_script_definition() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("notes.rhai"),
            "//! Keeps short notes.\nfn execute(params, context) { #{ success: true } }",
        )
        .unwrap();

        let legacy = LegacyAgentDir::new(dir.path().to_path_buf());
        let def = legacy.load("notes").unwrap().unwrap();
        assert_eq!(def.name, "notes");
        assert_eq!(def.description, "Keeps short notes.");
        assert!(def.code.unwrap().contains("fn execute"));
    }

    #[test]
    fn test_json5_definition_takes_sibling_source() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("weather.json"),
            "{ description: 'Weather lookups', dependencies: 'fs, path', // trailing\n }",
        )
        .unwrap();
        std::fs::write(dir.path().join("weather.rhai"), "fn execute(p, c) { 1 }").unwrap();

        let legacy = LegacyAgentDir::new(dir.path().to_path_buf());
        let def = legacy.load("weather").unwrap().unwrap();
        assert_eq!(def.description, "Weather lookups");
        assert_eq!(def.dependencies, vec!["fs", "path"]);
        assert_eq!(def.code.as_deref(), Some("fn execute(p, c) { 1 }"));
        assert_eq!(legacy.names(), vec!["weather"]);
    }

    #[test]
    fn test_yaml_definition_without_code() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("empty.yaml"), "description: nothing here\n").unwrap();

        let legacy = LegacyAgentDir::new(dir.path().to_path_buf());
        let def = legacy.load("empty").unwrap().unwrap();
        assert!(def.code.is_none());
        assert!(legacy.load("missing").unwrap().is_none());
        assert!(legacy.load("../etc/passwd").unwrap().is_none());
    }
}
