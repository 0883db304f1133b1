use deskmate_core::types::{normalize_dependencies, AgentDefinition, DatabaseKind, ExecutionTarget};
use deskmate_core::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

const AGENT_COLUMNS: &str = "name, description, parameters, dependencies, execution_target,
    requires_database, database_kind, bootstrap_source, code, version, config, secrets,
    metadata, created_at, updated_at";

fn unavailable(context: &str, e: impl std::fmt::Display) -> Error {
    Error::StoreUnavailable(format!("{}: {}", context, e))
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn json_text(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn parse_json_text(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or(Value::Null)
}

/// SQLite-backed table of agent definitions keyed by name.
#[derive(Clone)]
pub struct AgentStore {
    inner: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    db_path: PathBuf,
}

impl AgentStore {
    /// Open (or create) the registry database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| unavailable("Failed to create registry directory", e))?;
        }

        let conn = Connection::open(db_path).map_err(|e| unavailable("Failed to open registry db", e))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

        let store = Self {
            inner: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| unavailable("Failed to open registry db", e))?;
        let store = Self {
            inner: Arc::new(Mutex::new(conn)),
            db_path: PathBuf::from(":memory:"),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.inner.lock().map_err(|e| unavailable("Lock error", e))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS agents (
                name TEXT PRIMARY KEY,
                description TEXT NOT NULL DEFAULT '',
                parameters TEXT NOT NULL DEFAULT 'null',
                dependencies TEXT NOT NULL DEFAULT '[]',
                execution_target TEXT NOT NULL DEFAULT 'backend',
                requires_database INTEGER NOT NULL DEFAULT 0,
                database_kind TEXT,
                bootstrap_source TEXT,
                code TEXT,
                version TEXT NOT NULL DEFAULT 'v1',
                config TEXT NOT NULL DEFAULT 'null',
                secrets TEXT NOT NULL DEFAULT 'null',
                metadata TEXT NOT NULL DEFAULT 'null',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_agents_name ON agents(name);
            CREATE INDEX IF NOT EXISTS idx_agents_execution_target ON agents(execution_target);
            CREATE INDEX IF NOT EXISTS idx_agents_requires_database ON agents(requires_database);
            CREATE INDEX IF NOT EXISTS idx_agents_created_at ON agents(created_at);
            ",
        )
        .map_err(|e| unavailable("Failed to init registry schema", e))?;

        debug!("Agent registry schema initialized");
        Ok(())
    }

    /// Insert the definition, or update every mutable field of the existing
    /// row with the same name. `created_at` of an existing row is kept.
    pub fn upsert(&self, definition: &AgentDefinition) -> Result<AgentDefinition> {
        let def = definition.clone().normalized();
        if def.name.is_empty() {
            return Err(Error::Validation("Agent name must not be empty".to_string()));
        }

        let conn = self.conn()?;
        let now = now_millis();
        let created_at = if def.created_at > 0 { def.created_at } else { now };

        conn.execute(
            "INSERT INTO agents (name, description, parameters, dependencies, execution_target,
                requires_database, database_kind, bootstrap_source, code, version, config, secrets,
                metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(name) DO UPDATE SET
                description = excluded.description,
                parameters = excluded.parameters,
                dependencies = excluded.dependencies,
                execution_target = excluded.execution_target,
                requires_database = excluded.requires_database,
                database_kind = excluded.database_kind,
                bootstrap_source = excluded.bootstrap_source,
                code = excluded.code,
                version = excluded.version,
                config = excluded.config,
                secrets = excluded.secrets,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at",
            params![
                def.name,
                def.description,
                json_text(&def.parameters),
                json_text(&Value::from(def.dependencies.clone())),
                def.execution_target.as_str(),
                def.requires_database,
                def.database_kind.map(|k| k.as_str()),
                def.bootstrap_source,
                def.code,
                def.version,
                json_text(&def.config),
                json_text(&def.secrets),
                json_text(&def.metadata),
                created_at,
                now,
            ],
        )
        .map_err(|e| unavailable("Upsert error", e))?;

        debug!(agent = %def.name, "Agent definition upserted");
        Self::find_inner(&conn, &def.name)?
            .ok_or_else(|| Error::StoreUnavailable(format!("Row for '{}' vanished after upsert", def.name)))
    }

    pub fn find(&self, name: &str) -> Result<Option<AgentDefinition>> {
        let conn = self.conn()?;
        Self::find_inner(&conn, name)
    }

    fn find_inner(conn: &Connection, name: &str) -> Result<Option<AgentDefinition>> {
        conn.query_row(
            &format!("SELECT {} FROM agents WHERE name = ?1", AGENT_COLUMNS),
            params![name],
            row_to_definition,
        )
        .optional()
        .map_err(|e| unavailable("Query error", e))
    }

    pub fn list(&self) -> Result<Vec<AgentDefinition>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM agents ORDER BY name", AGENT_COLUMNS))
            .map_err(|e| unavailable("Prepare error", e))?;

        let rows = stmt
            .query_map([], row_to_definition)
            .map_err(|e| unavailable("Query error", e))?;

        let mut out = Vec::new();
        for row in rows {
            match row {
                Ok(def) => out.push(def),
                Err(e) => warn!(error = %e, "Error reading agent row"),
            }
        }
        Ok(out)
    }

    pub fn remove(&self, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        let affected = conn
            .execute("DELETE FROM agents WHERE name = ?1", params![name])
            .map_err(|e| unavailable("Delete error", e))?;
        Ok(affected > 0)
    }

    #[cfg(test)]
    fn execute_raw(&self, sql: &str) {
        self.conn().unwrap().execute_batch(sql).unwrap();
    }
}

fn row_to_definition(row: &Row<'_>) -> rusqlite::Result<AgentDefinition> {
    let parameters: String = row.get("parameters")?;
    let dependencies: String = row.get("dependencies")?;
    let execution_target: String = row.get("execution_target")?;
    let database_kind: Option<String> = row.get("database_kind")?;
    let config: String = row.get("config")?;
    let secrets: String = row.get("secrets")?;
    let metadata: String = row.get("metadata")?;

    let deps: Vec<String> = serde_json::from_str(&dependencies).unwrap_or_default();

    Ok(AgentDefinition {
        name: row.get("name")?,
        description: row.get("description")?,
        parameters: parse_json_text(&parameters),
        dependencies: normalize_dependencies(deps.iter().map(String::as_str)),
        execution_target: ExecutionTarget::parse(&execution_target).unwrap_or_default(),
        requires_database: row.get("requires_database")?,
        database_kind: database_kind.as_deref().and_then(DatabaseKind::parse),
        bootstrap_source: row.get("bootstrap_source")?,
        code: row.get("code")?,
        version: row.get("version")?,
        config: parse_json_text(&config),
        secrets: parse_json_text(&secrets),
        metadata: parse_json_text(&metadata),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Registry facade. Writes go to the SQLite store; a write the store
/// cannot take lands in an in-memory overlay instead, so registration keeps
/// working. Reads consult the overlay first, then the store.
pub struct AgentRegistry {
    store: Option<AgentStore>,
    memory: RwLock<HashMap<String, AgentDefinition>>,
    degraded: AtomicBool,
}

impl AgentRegistry {
    pub fn with_store(store: AgentStore) -> Self {
        Self {
            store: Some(store),
            memory: RwLock::new(HashMap::new()),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            store: None,
            memory: RwLock::new(HashMap::new()),
            degraded: AtomicBool::new(true),
        }
    }

    /// Open the store at `db_path`, degrading to memory-only when it cannot be opened.
    pub fn open(db_path: &Path) -> Self {
        match AgentStore::open(db_path) {
            Ok(store) => {
                info!(path = %db_path.display(), "Agent registry opened");
                Self::with_store(store)
            }
            Err(e) => {
                warn!(error = %e, "Agent registry store unavailable, using in-memory registry");
                Self::in_memory()
            }
        }
    }

    /// True once any registration lives only in memory.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn degrade(&self, e: &Error) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(error = %e, "Agent registry store failed, keeping registrations in memory (not durable)");
        } else {
            debug!(error = %e, "Agent registry store still failing");
        }
    }

    fn memory_read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, AgentDefinition>>> {
        self.memory.read().map_err(|e| Error::Other(format!("Lock error: {}", e)))
    }

    fn memory_write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, AgentDefinition>>> {
        self.memory.write().map_err(|e| Error::Other(format!("Lock error: {}", e)))
    }

    pub fn upsert(&self, definition: AgentDefinition) -> Result<AgentDefinition> {
        if let Some(store) = &self.store {
            match store.upsert(&definition) {
                Ok(saved) => {
                    // The durable row is newer than any overlay copy.
                    self.memory_write()?.remove(&saved.name);
                    return Ok(saved);
                }
                Err(e @ Error::StoreUnavailable(_)) => self.degrade(&e),
                Err(e) => return Err(e),
            }
        }
        self.upsert_memory(definition)
    }

    fn upsert_memory(&self, definition: AgentDefinition) -> Result<AgentDefinition> {
        let mut def = definition.normalized();
        if def.name.is_empty() {
            return Err(Error::Validation("Agent name must not be empty".to_string()));
        }

        let stored_created_at = match &self.store {
            Some(store) => store.find(&def.name).ok().flatten().map(|d| d.created_at),
            None => None,
        };
        let mut memory = self.memory_write()?;
        let now = now_millis();
        def.created_at = memory
            .get(&def.name)
            .map(|existing| existing.created_at)
            .or(stored_created_at)
            .filter(|ts| *ts > 0)
            .unwrap_or(if def.created_at > 0 { def.created_at } else { now });
        def.updated_at = now;
        memory.insert(def.name.clone(), def.clone());
        debug!(agent = %def.name, "Agent definition stored in memory");
        Ok(def)
    }

    pub fn find(&self, name: &str) -> Result<Option<AgentDefinition>> {
        if let Some(def) = self.memory_read()?.get(name) {
            return Ok(Some(def.clone()));
        }

        match &self.store {
            Some(store) => match store.find(name) {
                Ok(found) => Ok(found),
                Err(e @ Error::StoreUnavailable(_)) => {
                    warn!(agent = %name, error = %e, "Agent registry read failed");
                    Ok(None)
                }
                Err(e) => Err(e),
            },
            None => Ok(None),
        }
    }

    /// All definitions, ordered by name. In-memory entries shadow stored ones.
    pub fn list(&self) -> Result<Vec<AgentDefinition>> {
        let mut by_name: HashMap<String, AgentDefinition> = HashMap::new();

        if let Some(store) = &self.store {
            match store.list() {
                Ok(defs) => by_name.extend(defs.into_iter().map(|d| (d.name.clone(), d))),
                Err(e @ Error::StoreUnavailable(_)) => warn!(error = %e, "Agent registry list failed"),
                Err(e) => return Err(e),
            }
        }

        for (name, def) in self.memory_read()?.iter() {
            by_name.insert(name.clone(), def.clone());
        }

        let mut out: Vec<AgentDefinition> = by_name.into_values().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Drop `name` from the overlay and the store. A store failure is
    /// returned unless the overlay held the only copy.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let removed_memory = self.memory_write()?.remove(name).is_some();

        let removed_store = match &self.store {
            Some(store) => match store.remove(name) {
                Ok(removed) => removed,
                Err(e @ Error::StoreUnavailable(_)) if removed_memory => {
                    warn!(agent = %name, error = %e, "Stored copy could not be removed");
                    false
                }
                Err(e) => return Err(e),
            },
            None => false,
        };

        Ok(removed_memory || removed_store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample(name: &str) -> AgentDefinition {
        let mut def = AgentDefinition::new(name, "Stores and retrieves memories");
        def.parameters = json!({"type": "object"});
        def.config = json!({"limit": 10});
        def.code = Some("fn bootstrap(config, context) { #{ success: true } }\nfn execute(params, context) { params }".to_string());
        def
    }

    #[test]
    fn test_upsert_and_find_round_trip() {
        let store = AgentStore::open_in_memory().unwrap();
        let def: AgentDefinition = serde_json::from_value(json!({
            "name": "memory",
            "description": "memory agent",
            "dependencies": "a, b, c",
            "executionTarget": "frontend",
            "requiresDatabase": true,
            "databaseKind": "sqlite",
            "metadata": {"owner": "core"}
        }))
        .unwrap();

        store.upsert(&def).unwrap();
        let found = store.find("memory").unwrap().unwrap();
        assert_eq!(found.dependencies, vec!["a", "b", "c"]);
        assert_eq!(found.execution_target, ExecutionTarget::Frontend);
        assert!(found.requires_database);
        assert_eq!(found.database_kind, Some(DatabaseKind::Sqlite));
        assert_eq!(found.metadata, json!({"owner": "core"}));
        assert_eq!(found.version, "v1");
        assert!(found.created_at > 0);
    }

    #[test]
    fn test_upsert_updates_and_keeps_created_at() {
        let store = AgentStore::open_in_memory().unwrap();
        let first = store.upsert(&sample("memory")).unwrap();

        let mut changed = sample("memory");
        changed.description = "new description".to_string();
        changed.dependencies = vec!["fs".to_string()];
        let second = store.upsert(&changed).unwrap();

        assert_eq!(second.description, "new description");
        assert_eq!(second.dependencies, vec!["fs"]);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_bootstrap_extracted_on_upsert() {
        let store = AgentStore::open_in_memory().unwrap();
        let saved = store.upsert(&sample("memory")).unwrap();
        assert!(saved.bootstrap_source.unwrap().starts_with("fn bootstrap"));
    }

    #[test]
    fn test_schema_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agents.db");
        {
            let store = AgentStore::open(&path).unwrap();
            store.upsert(&sample("a")).unwrap();
        }
        let store = AgentStore::open(&path).unwrap();
        assert!(store.find("a").unwrap().is_some());
    }

    #[test]
    fn test_list_is_sorted_and_remove() {
        let store = AgentStore::open_in_memory().unwrap();
        store.upsert(&sample("zeta")).unwrap();
        store.upsert(&sample("alpha")).unwrap();
        let names: Vec<String> = store.list().unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);

        assert!(store.remove("alpha").unwrap());
        assert!(!store.remove("alpha").unwrap());
        assert!(store.find("alpha").unwrap().is_none());
    }

    #[test]
    fn test_empty_name_rejected() {
        let store = AgentStore::open_in_memory().unwrap();
        let err = store.upsert(&AgentDefinition::new("  ", "")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_registry_degrades_when_store_cannot_open() {
        let dir = TempDir::new().unwrap();
        // A directory cannot be opened as a database file.
        let registry = AgentRegistry::open(dir.path());
        assert!(registry.is_degraded());

        registry.upsert(sample("memory")).unwrap();
        assert!(registry.find("memory").unwrap().is_some());
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[test]
    fn test_registry_degrades_on_runtime_failure() {
        let store = AgentStore::open_in_memory().unwrap();
        let registry = AgentRegistry::with_store(store.clone());
        registry.upsert(sample("before")).unwrap();
        assert!(!registry.is_degraded());

        store.execute_raw("DROP TABLE agents;");

        let saved = registry.upsert(sample("after")).unwrap();
        assert_eq!(saved.name, "after");
        assert!(registry.is_degraded());
        assert!(registry.find("after").unwrap().is_some());
    }

    #[test]
    fn test_transient_lock_keeps_stored_agents_readable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agents.db");
        let registry = AgentRegistry::open(&path);
        registry.upsert(sample("durable")).unwrap();

        let blocker = Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE;").unwrap();
        registry.upsert(sample("pending")).unwrap();
        assert!(registry.is_degraded());
        blocker.execute_batch("COMMIT;").unwrap();

        assert!(registry.find("durable").unwrap().is_some());
        assert!(registry.find("pending").unwrap().is_some());
        let names: Vec<String> = registry.list().unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["durable", "pending"]);

        // Once the store accepts writes again the overlay copy is retired.
        registry.upsert(sample("pending")).unwrap();
        let reopened = AgentStore::open(&path).unwrap();
        assert!(reopened.find("pending").unwrap().is_some());
        assert!(registry.remove("pending").unwrap());
        assert!(registry.find("pending").unwrap().is_none());
    }

    #[test]
    fn test_memory_upsert_preserves_created_at() {
        let registry = AgentRegistry::in_memory();
        let first = registry.upsert(sample("m")).unwrap();
        let second = registry.upsert(sample("m")).unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert!(registry.remove("m").unwrap());
        assert!(registry.find("m").unwrap().is_none());
    }
}
