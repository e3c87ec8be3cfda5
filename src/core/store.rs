//! Conversation persistence.
//!
//! The core needs only CRUD plus an ordered message list; everything else is
//! the front-end's business. The SQLite implementation is the production
//! store; the in-memory one backs tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("conversation {0} not found")]
    ConversationNotFound(i64),

    #[error("message {0} not found")]
    MessageNotFound(i64),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_pinned: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub role: String,
    pub content: String,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub metadata_json: Option<String>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, title: &str) -> Result<i64, StoreError>;
    async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError>;
    async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>, StoreError>;
    async fn rename_conversation(&self, id: i64, title: &str) -> Result<(), StoreError>;
    async fn set_pinned(&self, id: i64, pinned: bool) -> Result<(), StoreError>;
    async fn delete_conversation(&self, id: i64) -> Result<(), StoreError>;

    async fn append_message(
        &self,
        conversation_id: i64,
        role: &str,
        content: &str,
        model: Option<&str>,
    ) -> Result<i64, StoreError>;
    async fn update_message_content(&self, id: i64, content: &str) -> Result<(), StoreError>;
    /// Messages of one conversation in insertion order.
    async fn list_messages(&self, conversation_id: i64) -> Result<Vec<StoredMessage>, StoreError>;
    async fn delete_message(&self, id: i64) -> Result<(), StoreError>;
}

pub struct SqliteConversationStore {
    pool: SqlitePool,
}

impl SqliteConversationStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database; a single connection so the schema survives.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                is_pinned INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                model TEXT,
                created_at TEXT NOT NULL,
                metadata_json TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
             ON messages(conversation_id)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn map_conversation(row: &sqlx::sqlite::SqliteRow) -> Conversation {
        Conversation {
            id: row.get("id"),
            title: row.get("title"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            is_pinned: row.get("is_pinned"),
        }
    }

    fn map_message(row: &sqlx::sqlite::SqliteRow) -> StoredMessage {
        StoredMessage {
            id: row.get("id"),
            conversation_id: row.get("conversation_id"),
            role: row.get("role"),
            content: row.get("content"),
            model: row.get("model"),
            created_at: row.get("created_at"),
            metadata_json: row.get("metadata_json"),
        }
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn create_conversation(&self, title: &str) -> Result<i64, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO conversations (title, created_at, updated_at, is_pinned)
             VALUES (?, ?, ?, 0)",
        )
        .bind(title)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, title, created_at, updated_at, is_pinned
             FROM conversations
             ORDER BY is_pinned DESC, updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::map_conversation).collect())
    }

    async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(
            "SELECT id, title, created_at, updated_at, is_pinned
             FROM conversations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(Self::map_conversation))
    }

    async fn rename_conversation(&self, id: i64, title: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ConversationNotFound(id));
        }
        Ok(())
    }

    async fn set_pinned(&self, id: i64, pinned: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE conversations SET is_pinned = ? WHERE id = ?")
            .bind(pinned)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ConversationNotFound(id));
        }
        Ok(())
    }

    async fn delete_conversation(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_message(
        &self,
        conversation_id: i64,
        role: &str,
        content: &str,
        model: Option<&str>,
    ) -> Result<i64, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO messages (conversation_id, role, content, model, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(conversation_id)
        .bind(role)
        .bind(content)
        .bind(model)
        .bind(now)
        .execute(&self.pool)
        .await?;
        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_message_content(&self, id: i64, content: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE messages SET content = ? WHERE id = ?")
            .bind(content)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::MessageNotFound(id));
        }
        Ok(())
    }

    async fn list_messages(&self, conversation_id: i64) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, role, content, model, created_at, metadata_json
             FROM messages WHERE conversation_id = ? ORDER BY id",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::map_message).collect())
    }

    async fn delete_message(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-memory store used by orchestrator and facade tests.
#[derive(Default)]
pub struct MemoryConversationStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    conversations: Vec<Conversation>,
    messages: Vec<StoredMessage>,
}

impl MemoryInner {
    fn next(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

impl MemoryConversationStore {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Database("store lock poisoned".into()))
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create_conversation(&self, title: &str) -> Result<i64, StoreError> {
        let mut inner = self.lock()?;
        let id = inner.next();
        let now = Utc::now();
        inner.conversations.push(Conversation {
            id,
            title: title.to_string(),
            created_at: now,
            updated_at: now,
            is_pinned: false,
        });
        Ok(id)
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        let inner = self.lock()?;
        let mut conversations = inner.conversations.clone();
        conversations.sort_by(|a, b| {
            b.is_pinned
                .cmp(&a.is_pinned)
                .then(b.updated_at.cmp(&a.updated_at))
        });
        Ok(conversations)
    }

    async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.conversations.iter().find(|c| c.id == id).cloned())
    }

    async fn rename_conversation(&self, id: i64, title: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let conversation = inner
            .conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(StoreError::ConversationNotFound(id))?;
        conversation.title = title.to_string();
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn set_pinned(&self, id: i64, pinned: bool) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let conversation = inner
            .conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(StoreError::ConversationNotFound(id))?;
        conversation.is_pinned = pinned;
        Ok(())
    }

    async fn delete_conversation(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.conversations.retain(|c| c.id != id);
        inner.messages.retain(|m| m.conversation_id != id);
        Ok(())
    }

    async fn append_message(
        &self,
        conversation_id: i64,
        role: &str,
        content: &str,
        model: Option<&str>,
    ) -> Result<i64, StoreError> {
        let mut inner = self.lock()?;
        let id = inner.next();
        inner.messages.push(StoredMessage {
            id,
            conversation_id,
            role: role.to_string(),
            content: content.to_string(),
            model: model.map(str::to_string),
            created_at: Utc::now(),
            metadata_json: None,
        });
        Ok(id)
    }

    async fn update_message_content(&self, id: i64, content: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let message = inner
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(StoreError::MessageNotFound(id))?;
        message.content = content.to_string();
        Ok(())
    }

    async fn list_messages(&self, conversation_id: i64) -> Result<Vec<StoredMessage>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn delete_message(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.messages.retain(|m| m.id != id);
        Ok(())
    }
}
