//! Platform capabilities available to every agent without installation:
//! `process`, `fs`, `path` and `child_process`, plus the stdio process
//! wrapper used for executables found on `PATH`.

use async_trait::async_trait;
use deskmate_core::{Capability, Error, Result};
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Pull a string argument from a bare string, the first array element, or
/// an object field named `key`.
fn arg_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    match args {
        Value::String(s) => Some(s.as_str()),
        Value::Array(items) => items.first().and_then(|v| v.as_str()),
        Value::Object(obj) => obj.get(key).and_then(|v| v.as_str()),
        _ => None,
    }
}

fn require_str<'a>(cap: &str, method: &str, args: &'a Value, key: &str) -> Result<&'a str> {
    arg_str(args, key).ok_or_else(|| {
        Error::Validation(format!("{}.{} requires a string '{}' argument", cap, method, key))
    })
}

fn unknown_method(cap: &str, method: &str) -> Error {
    Error::Validation(format!("{} has no method '{}'", cap, method))
}

/// Return the capability object for a built-in platform module name.
pub fn builtin_capability(name: &str) -> Option<std::sync::Arc<dyn Capability>> {
    let bare = name.strip_prefix("node:").unwrap_or(name);
    match bare {
        "process" => Some(std::sync::Arc::new(ProcessInfo)),
        "fs" => Some(std::sync::Arc::new(FileSystem)),
        "path" => Some(std::sync::Arc::new(PathOps)),
        "child_process" => Some(std::sync::Arc::new(ChildProcess)),
        _ => None,
    }
}

pub struct ProcessInfo;

#[async_trait]
impl Capability for ProcessInfo {
    fn name(&self) -> &str {
        "process"
    }

    fn methods(&self) -> Vec<&'static str> {
        vec!["cwd", "env", "platform", "arch", "pid"]
    }

    async fn invoke(&self, method: &str, args: Value) -> Result<Value> {
        match method {
            "cwd" => Ok(json!(std::env::current_dir()?.to_string_lossy())),
            "env" => Ok(arg_str(&args, "name")
                .and_then(|k| std::env::var(k).ok())
                .map(Value::String)
                .unwrap_or(Value::Null)),
            "platform" => Ok(json!(std::env::consts::OS)),
            "arch" => Ok(json!(std::env::consts::ARCH)),
            "pid" => Ok(json!(std::process::id())),
            _ => Err(unknown_method("process", method)),
        }
    }
}

pub struct FileSystem;

#[async_trait]
impl Capability for FileSystem {
    fn name(&self) -> &str {
        "fs"
    }

    fn methods(&self) -> Vec<&'static str> {
        vec!["read_to_string", "write", "exists", "read_dir", "mkdir", "remove"]
    }

    async fn invoke(&self, method: &str, args: Value) -> Result<Value> {
        match method {
            "read_to_string" | "readFile" => {
                let path = require_str("fs", method, &args, "path")?;
                Ok(json!(tokio::fs::read_to_string(path).await?))
            }
            "write" | "writeFile" => {
                let path = require_str("fs", method, &args, "path")?;
                let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
                if let Some(parent) = Path::new(path).parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(path, content).await?;
                Ok(json!({"written": content.len()}))
            }
            "exists" => {
                let path = require_str("fs", method, &args, "path")?;
                Ok(json!(tokio::fs::try_exists(path).await.unwrap_or(false)))
            }
            "read_dir" | "readdir" => {
                let path = require_str("fs", method, &args, "path")?;
                let mut entries = tokio::fs::read_dir(path).await?;
                let mut names = Vec::new();
                while let Some(entry) = entries.next_entry().await? {
                    names.push(entry.file_name().to_string_lossy().to_string());
                }
                names.sort();
                Ok(json!(names))
            }
            "mkdir" => {
                let path = require_str("fs", method, &args, "path")?;
                tokio::fs::create_dir_all(path).await?;
                Ok(json!(true))
            }
            "remove" | "unlink" => {
                let path = require_str("fs", method, &args, "path")?;
                let meta = tokio::fs::metadata(path).await?;
                if meta.is_dir() {
                    tokio::fs::remove_dir_all(path).await?;
                } else {
                    tokio::fs::remove_file(path).await?;
                }
                Ok(json!(true))
            }
            _ => Err(unknown_method("fs", method)),
        }
    }
}

pub struct PathOps;

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[async_trait]
impl Capability for PathOps {
    fn name(&self) -> &str {
        "path"
    }

    fn methods(&self) -> Vec<&'static str> {
        vec!["join", "basename", "dirname", "extname", "normalize", "resolve"]
    }

    async fn invoke(&self, method: &str, args: Value) -> Result<Value> {
        let as_text = |p: &Path| json!(p.to_string_lossy());
        match method {
            "join" => {
                let parts: Vec<&str> = match &args {
                    Value::Array(items) => items.iter().filter_map(|v| v.as_str()).collect(),
                    Value::Object(obj) => obj
                        .get("parts")
                        .and_then(|v| v.as_array())
                        .map(|items| items.iter().filter_map(|v| v.as_str()).collect())
                        .unwrap_or_default(),
                    Value::String(s) => vec![s.as_str()],
                    _ => Vec::new(),
                };
                let joined: PathBuf = parts.iter().collect();
                Ok(as_text(&normalize_path(&joined)))
            }
            "basename" => {
                let path = require_str("path", method, &args, "path")?;
                Ok(Path::new(path)
                    .file_name()
                    .map(|n| json!(n.to_string_lossy()))
                    .unwrap_or_else(|| json!("")))
            }
            "dirname" => {
                let path = require_str("path", method, &args, "path")?;
                Ok(Path::new(path).parent().map(as_text).unwrap_or_else(|| json!(".")))
            }
            "extname" => {
                let path = require_str("path", method, &args, "path")?;
                Ok(Path::new(path)
                    .extension()
                    .map(|e| json!(format!(".{}", e.to_string_lossy())))
                    .unwrap_or_else(|| json!("")))
            }
            "normalize" => {
                let path = require_str("path", method, &args, "path")?;
                Ok(as_text(&normalize_path(Path::new(path))))
            }
            "resolve" => {
                let path = require_str("path", method, &args, "path")?;
                let absolute = std::env::current_dir()?.join(path);
                Ok(as_text(&normalize_path(&absolute)))
            }
            _ => Err(unknown_method("path", method)),
        }
    }
}

pub struct ChildProcess;

#[async_trait]
impl Capability for ChildProcess {
    fn name(&self) -> &str {
        "child_process"
    }

    fn methods(&self) -> Vec<&'static str> {
        vec!["exec"]
    }

    async fn invoke(&self, method: &str, args: Value) -> Result<Value> {
        if method != "exec" && method != "execFile" {
            return Err(unknown_method("child_process", method));
        }
        let command = require_str("child_process", method, &args, "command")?;
        let argv: Vec<String> = args
            .get("args")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();

        let mut cmd = Command::new(command);
        cmd.args(&argv).stdin(Stdio::null());
        if let Some(cwd) = args.get("cwd").and_then(|v| v.as_str()) {
            cmd.current_dir(cwd);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::Other(format!("Failed to run '{}': {}", command, e)))?;

        Ok(json!({
            "code": output.status.code(),
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
        }))
    }
}

/// An external executable spoken to with one JSON request on stdin and one
/// JSON reply on stdout: `{"method": ..., "params": ...}`.
pub struct ProcessCapability {
    name: String,
    program: PathBuf,
}

impl ProcessCapability {
    pub fn new(name: &str, program: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            program,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl Capability for ProcessCapability {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, method: &str, args: Value) -> Result<Value> {
        let request = serde_json::to_string(&json!({"method": method, "params": args}))?;

        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Other(format!("Failed to spawn '{}': {}", self.program.display(), e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::Other(format!(
                "'{}' exited with code {:?}: {}",
                self.name,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(serde_json::from_str(stdout.trim()).unwrap_or_else(|_| json!({"output": stdout.trim()})))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_names() {
        for name in ["process", "fs", "path", "child_process", "node:fs", "node:path"] {
            assert!(builtin_capability(name).is_some(), "{}", name);
        }
        assert!(builtin_capability("lodash").is_none());
    }

    #[tokio::test]
    async fn test_fs_round_trip() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("nested/note.txt");
        let file = file.to_str().unwrap();
        let fs = FileSystem;

        fs.invoke("write", json!({"path": file, "content": "hello"})).await.unwrap();
        assert_eq!(fs.invoke("exists", json!(file)).await.unwrap(), json!(true));
        assert_eq!(fs.invoke("read_to_string", json!({"path": file})).await.unwrap(), json!("hello"));
        assert!(fs.invoke("chmod", json!(file)).await.is_err());
    }

    #[tokio::test]
    async fn test_path_ops() {
        let path = PathOps;
        assert_eq!(path.invoke("join", json!(["/a", "b", "../c"])).await.unwrap(), json!("/a/c"));
        assert_eq!(path.invoke("basename", json!("/x/y.rhai")).await.unwrap(), json!("y.rhai"));
        assert_eq!(path.invoke("extname", json!("/x/y.rhai")).await.unwrap(), json!(".rhai"));
        assert_eq!(path.invoke("dirname", json!("/x/y.rhai")).await.unwrap(), json!("/x"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_process_exec() {
        let out = ChildProcess
            .invoke("exec", json!({"command": "echo", "args": ["hi"]}))
            .await
            .unwrap();
        assert_eq!(out["code"], 0);
        assert_eq!(out["stdout"].as_str().unwrap().trim(), "hi");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_capability_wraps_plain_output() {
        let cap = ProcessCapability::new("cat", which::which("cat").unwrap());
        let out = cap.invoke("echo", json!({"x": 1})).await.unwrap();
        assert_eq!(out, json!({"method": "echo", "params": {"x": 1}}));
    }
}
