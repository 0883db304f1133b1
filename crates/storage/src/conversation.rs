use deskmate_core::capability::{ConversationStore, StoredMessage};
use deskmate_core::{Error, Result};
use rusqlite::{params, Connection, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

fn storage_error(context: &str, e: impl std::fmt::Display) -> Error {
    Error::StoreUnavailable(format!("{}: {}", context, e))
}

/// SQLite-backed conversation log, one row per message.
#[derive(Clone)]
pub struct SqliteConversationStore {
    inner: Arc<Mutex<Connection>>,
}

impl SqliteConversationStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| storage_error("Failed to create db directory", e))?;
        }
        let conn = Connection::open(db_path).map_err(|e| storage_error("Failed to open conversation db", e))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| storage_error("Failed to open conversation db", e))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                text TEXT NOT NULL,
                sender TEXT NOT NULL DEFAULT 'user',
                metadata TEXT NOT NULL DEFAULT 'null',
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
            CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at);
            ",
        )
        .map_err(|e| storage_error("Failed to init conversation schema", e))?;

        Ok(Self {
            inner: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.inner.lock().map_err(|e| storage_error("Lock error", e))
    }

    fn collect(rows: impl Iterator<Item = rusqlite::Result<StoredMessage>>) -> Result<Vec<StoredMessage>> {
        rows.map(|r| r.map_err(|e| storage_error("Row error", e))).collect()
    }
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let metadata: String = row.get("metadata")?;
    Ok(StoredMessage {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        text: row.get("text")?,
        sender: row.get("sender")?,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        created_at: row.get("created_at")?,
    })
}

impl ConversationStore for SqliteConversationStore {
    fn add_message(&self, session_id: &str, text: &str, sender: &str, metadata: Value) -> Result<StoredMessage> {
        let message = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            text: text.to_string(),
            sender: sender.to_string(),
            metadata,
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (id, session_id, text, sender, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.id,
                message.session_id,
                message.text,
                message.sender,
                serde_json::to_string(&message.metadata)?,
                message.created_at,
            ],
        )
        .map_err(|e| storage_error("Insert error", e))?;

        debug!(session = %session_id, id = %message.id, "Message stored");
        Ok(message)
    }

    fn list_messages(&self, session_id: &str, limit: usize, offset: usize) -> Result<Vec<StoredMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM messages WHERE session_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3",
            )
            .map_err(|e| storage_error("Prepare error", e))?;
        let rows = stmt
            .query_map(params![session_id, limit as i64, offset as i64], row_to_message)
            .map_err(|e| storage_error("Query error", e))?;
        Self::collect(rows)
    }

    fn search_messages(&self, session_id: &str, query: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM messages WHERE session_id = ?1 AND text LIKE '%' || ?2 || '%'
                 ORDER BY created_at DESC, rowid DESC LIMIT ?3",
            )
            .map_err(|e| storage_error("Prepare error", e))?;
        let rows = stmt
            .query_map(params![session_id, query, limit as i64], row_to_message)
            .map_err(|e| storage_error("Query error", e))?;
        Self::collect(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_add_and_list_newest_first() {
        let store = SqliteConversationStore::open_in_memory().unwrap();
        store.add_message("s1", "first", "user", json!({})).unwrap();
        store.add_message("s1", "second", "assistant", Value::Null).unwrap();
        store.add_message("s2", "other session", "user", Value::Null).unwrap();

        let messages = store.list_messages("s1", 10, 0).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "second");
        assert_eq!(messages[1].sender, "user");

        let page = store.list_messages("s1", 1, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].text, "first");
    }

    #[test]
    fn test_search_messages() {
        let dir = TempDir::new().unwrap();
        let store = SqliteConversationStore::open(&dir.path().join("conv.db")).unwrap();
        store.add_message("s", "my locker code is 4512", "user", json!({"intent": "memory_store"})).unwrap();
        store.add_message("s", "what's the weather", "user", Value::Null).unwrap();

        let hits = store.search_messages("s", "locker", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata, json!({"intent": "memory_store"}));
        assert!(store.search_messages("s", "nothing", 5).unwrap().is_empty());
    }
}
