use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".deskmate"))
            .unwrap_or_else(|| PathBuf::from(".deskmate"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn registry_db(&self) -> PathBuf {
        self.base.join("agents.db")
    }

    pub fn conversations_db(&self) -> PathBuf {
        self.base.join("conversations.db")
    }

    /// File-backed agent definitions (`<name>.rhai`, `<name>.json`, `<name>.yaml`).
    pub fn legacy_agents_dir(&self) -> PathBuf {
        self.base.join("agents")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.legacy_agents_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
