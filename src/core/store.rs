//! Conversation persistence using SQLite
//!
//! CRUD over conversations and their ordered messages. Owns no business
//! logic; ordering contracts (`updated_at` desc for conversations,
//! `position` asc for messages) live in the queries here.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::conversation::{Conversation, Message, Role};

/// Persistence gateway for conversations and messages.
#[derive(Clone)]
pub struct ChatStore {
    pool: SqlitePool,
}

impl ChatStore {
    /// Open (or create) the database at the given path.
    pub async fn new(db_path: &Path) -> Result<Self, sqlx::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                position INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, position)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert_conversation(&self, conversation: &Conversation) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO conversations (id, title, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&conversation.id)
        .bind(&conversation.title)
        .bind(conversation.created_at.timestamp_millis())
        .bind(conversation.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_conversation(&self, conversation: &Conversation) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?
            "#,
        )
        .bind(&conversation.title)
        .bind(conversation.updated_at.timestamp_millis())
        .bind(&conversation.id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Bump `updated_at` after a completed exchange.
    pub async fn touch_conversation(
        &self,
        conversation_id: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(timestamp.timestamp_millis())
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Delete a conversation and its messages in one transaction, so a
    /// partial failure never leaves orphaned messages behind.
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await
    }

    /// All conversations, most recently updated first.
    pub async fn all_conversations(&self) -> Result<Vec<Conversation>, sqlx::Error> {
        let rows: Vec<(String, String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT id, title, created_at, updated_at
            FROM conversations
            ORDER BY updated_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(conversation_from_row).collect())
    }

    pub async fn conversation_by_id(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, sqlx::Error> {
        let row: Option<(String, String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT id, title, created_at, updated_at
            FROM conversations
            WHERE id = ?
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(conversation_from_row))
    }

    pub async fn insert_message(&self, message: &Message) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, role, content, created_at, position)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.created_at.timestamp_millis())
        .bind(message.position)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All messages in a conversation, ordered by position.
    pub async fn messages_for(&self, conversation_id: &str) -> Result<Vec<Message>, sqlx::Error> {
        let rows: Vec<(String, String, String, String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT id, conversation_id, role, content, created_at, position
            FROM messages
            WHERE conversation_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, conversation_id, role, content, created_at, position)| Message {
                id,
                conversation_id,
                role: Role::parse(&role),
                content,
                created_at: millis_to_datetime(created_at),
                position,
            })
            .collect())
    }

    pub async fn message_count(&self, conversation_id: &str) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE conversation_id = ?")
                .bind(conversation_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }
}

fn conversation_from_row((id, title, created_at, updated_at): (String, String, i64, i64)) -> Conversation {
    Conversation {
        id,
        title,
        created_at: millis_to_datetime(created_at),
        updated_at: millis_to_datetime(updated_at),
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}
