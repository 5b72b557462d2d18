//! 持久化：聊天消息、长期事实、运行时配置
//!
//! 管线只依赖 PersistenceStore；SqliteStore 是默认实现，rusqlite 调用都放在
//! spawn_blocking 里，避免在 async 上下文中阻塞。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Store task failed: {0}")]
    Join(String),
}

/// 消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    /// 决策槽位的内部笔记
    InternalNote,
    System,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::InternalNote => "internal_note",
            ChatRole::System => "system",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "user" => ChatRole::User,
            "assistant" => ChatRole::Assistant,
            "internal_note" => ChatRole::InternalNote,
            _ => ChatRole::System,
        }
    }
}

/// 一条已保存的消息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub role: ChatRole,
    pub text: String,
    pub debug: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// 持久化 trait
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn save_message(
        &self,
        chat_id: &str,
        role: ChatRole,
        text: &str,
        debug: Option<Value>,
    ) -> Result<(), StoreError>;

    /// 最近 limit 条消息，按时间正序
    async fn chat_history(&self, chat_id: &str, limit: usize) -> Result<Vec<StoredMessage>, StoreError>;

    async fn set_fact(&self, key: &str, text: &str) -> Result<(), StoreError>;

    /// 全部事实 (key, text)，按 key 排序
    async fn all_facts(&self) -> Result<Vec<(String, String)>, StoreError>;

    async fn get_config(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// SQLite 持久化
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件；父目录不存在时自动创建
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        init_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|p| p.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn init_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            debug TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id);

        CREATE TABLE IF NOT EXISTS facts (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;
    Ok(())
}

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn save_message(
        &self,
        chat_id: &str,
        role: ChatRole,
        text: &str,
        debug: Option<Value>,
    ) -> Result<(), StoreError> {
        let chat_id = chat_id.to_string();
        let text = text.to_string();
        let debug = debug.map(|v| serde_json::to_string(&v)).transpose()?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO messages (chat_id, role, content, debug, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![chat_id, role.as_str(), text, debug, Utc::now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn chat_history(&self, chat_id: &str, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let chat_id = chat_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT role, content, debug, created_at FROM messages
                 WHERE chat_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![chat_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, DateTime<Utc>>(3)?,
                ))
            })?;

            let mut messages = Vec::new();
            for row in rows {
                let (role, text, debug, created_at) = row?;
                messages.push(StoredMessage {
                    role: ChatRole::parse(&role),
                    text,
                    debug: debug.and_then(|d| serde_json::from_str(&d).ok()),
                    created_at,
                });
            }
            messages.reverse();
            Ok(messages)
        })
        .await
    }

    async fn set_fact(&self, key: &str, text: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        let text = text.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO facts (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, text, Utc::now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn all_facts(&self) -> Result<Vec<(String, String)>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM facts ORDER BY key ASC")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_history_returns_latest_in_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .save_message("c1", ChatRole::User, &format!("msg {}", i), None)
                .await
                .unwrap();
        }
        store
            .save_message("c2", ChatRole::User, "other chat", None)
            .await
            .unwrap();

        let history = store.chat_history("c1", 3).await.unwrap();
        let texts: Vec<_> = history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["msg 2", "msg 3", "msg 4"]);
    }

    #[tokio::test]
    async fn test_debug_payload_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .save_message(
                "c1",
                ChatRole::Assistant,
                "hi",
                Some(serde_json::json!({"note": "greet"})),
            )
            .await
            .unwrap();
        let history = store.chat_history("c1", 10).await.unwrap();
        assert_eq!(history[0].role, ChatRole::Assistant);
        assert_eq!(history[0].debug.as_ref().unwrap()["note"], "greet");
    }

    #[tokio::test]
    async fn test_facts_overwrite_and_sort() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set_fact("fact_2", "likes tea").await.unwrap();
        store.set_fact("fact_1", "lives in Pécs").await.unwrap();
        store.set_fact("fact_2", "likes coffee").await.unwrap();

        let facts = store.all_facts().await.unwrap();
        assert_eq!(
            facts,
            vec![
                ("fact_1".to_string(), "lives in Pécs".to_string()),
                ("fact_2".to_string(), "likes coffee".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_config_get_set() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.get_config("user_lang").await.unwrap(), None);
        store.set_config("user_lang", "hu").await.unwrap();
        assert_eq!(
            store.get_config("user_lang").await.unwrap().as_deref(),
            Some("hu")
        );
    }

    #[tokio::test]
    async fn test_open_file_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("soulcore.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.set_fact("k", "v").await.unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.all_facts().await.unwrap().len(), 1);
    }
}
