//! SQLite-backed conversation storage
//!
//! One row per message node. Child lists are not stored; they are rebuilt
//! from parent links in id order, which is creation order.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::{ConversationInfo, ConversationStorage};
use crate::ids::{ConversationId, MessageId};
use crate::message::{Message, MessageKind};

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            id INTEGER NOT NULL,
            parent_id INTEGER,
            kind TEXT CHECK(kind IN ('root', 'user', 'assistant')) NOT NULL,
            content TEXT NOT NULL,
            reasoning TEXT,
            extra TEXT NOT NULL DEFAULT '[]',
            model TEXT,
            timings TEXT,
            timestamp INTEGER NOT NULL,
            PRIMARY KEY (conversation_id, id)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_parent ON messages(conversation_id, parent_id);
        "#,
    )
    .context("Failed to initialize conversation schema")?;
    Ok(())
}

type RawRow = (
    i64,
    Option<i64>,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    i64,
);

#[async_trait]
impl ConversationStorage for SqliteStorage {
    async fn load(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, parent_id, kind, content, reasoning, extra, model, timings, timestamp
             FROM messages WHERE conversation_id = ?1 ORDER BY id",
        )?;

        let rows = stmt
            .query_map(params![conversation_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<RawRow>>>()?;

        let mut messages: Vec<Message> = Vec::with_capacity(rows.len());
        for (id, parent, kind, content, reasoning, extra, model, timings, timestamp) in rows {
            let kind: MessageKind = kind
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .with_context(|| format!("Corrupt message {} in {}", id, conversation_id))?;
            let timings = timings
                .map(|t| serde_json::from_str(&t))
                .transpose()
                .context("Corrupt timings")?;
            messages.push(Message {
                id: MessageId::new(id as u64),
                conversation_id: conversation_id.clone(),
                parent: parent.map(|p| MessageId::new(p as u64)),
                children: Vec::new(),
                kind,
                content,
                reasoning,
                extra: serde_json::from_str(&extra).context("Corrupt attachments")?,
                model,
                timings,
                timestamp,
            });
        }

        let index: HashMap<MessageId, usize> =
            messages.iter().enumerate().map(|(i, m)| (m.id, i)).collect();
        for i in 0..messages.len() {
            let child = messages[i].id;
            let parent = messages[i].parent;
            if let Some(&p) = parent.and_then(|p| index.get(&p)) {
                messages[p].children.push(child);
            }
        }

        Ok(messages)
    }

    async fn save(&self, conversation_id: &ConversationId, messages: &[Message]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let updated_at = messages.iter().map(|m| m.timestamp).max().unwrap_or_default();

        tx.execute(
            "INSERT INTO conversations (id, updated_at) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
            params![conversation_id, updated_at],
        )?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO messages
                 (conversation_id, id, parent_id, kind, content, reasoning, extra, model, timings, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for m in messages {
                let timings = m.timings.as_ref().map(serde_json::to_string).transpose()?;
                stmt.execute(params![
                    conversation_id,
                    m.id.get() as i64,
                    m.parent.map(|p| p.get() as i64),
                    m.kind.as_str(),
                    m.content,
                    m.reasoning,
                    serde_json::to_string(&m.extra)?,
                    m.model,
                    timings,
                    m.timestamp,
                ])?;
            }
        }
        tx.commit().context("Failed to save conversation")?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ConversationInfo>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.updated_at,
                    (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id AND m.kind != 'root')
             FROM conversations c
             ORDER BY c.updated_at DESC",
        )?;
        let mut title = conn.prepare(
            "SELECT content FROM messages WHERE conversation_id = ?1 AND kind = 'user' ORDER BY id LIMIT 1",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, ConversationId>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut infos = Vec::with_capacity(rows.len());
        for (id, updated_at, count) in rows {
            let first_user: Option<String> = title
                .query_row(params![id], |row| row.get(0))
                .optional()?;
            infos.push(ConversationInfo {
                id,
                name: first_user.map(|c| ConversationInfo::title(&c)),
                message_count: count as usize,
                last_modified: updated_at,
            });
        }
        Ok(infos)
    }
}
