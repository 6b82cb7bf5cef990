use chrono::{DateTime, NaiveDateTime, Utc};
use inspektor_common::{
    ConversationId, DatastoreId, Error, Message, MessageId, MessagePayload, MessageRole, Result,
    WorkspaceId,
};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::migrations::SESSION_SCHEMA_V1;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// Conversation header. Messages are loaded separately, in append order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub datastore_id: DatastoreId,
    pub workspace_id: Option<WorkspaceId>,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistent, append-only storage for conversations and their messages.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening session store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(SESSION_SCHEMA_V1.sql)
            .map_err(|e| Error::Database(format!("session migration failed: {e}")))?;

        Ok(())
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("session database lock poisoned".into()))
    }

    pub fn create_conversation(
        &self,
        datastore_id: &DatastoreId,
        workspace_id: Option<&WorkspaceId>,
        title: Option<&str>,
    ) -> Result<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: ConversationId::new(),
            datastore_id: datastore_id.clone(),
            workspace_id: workspace_id.cloned(),
            title: title.map(str::to_string),
            created_at: now,
            updated_at: now,
        };

        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO conversations
                (id, datastore_id, workspace_id, title, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                conversation.id.as_str(),
                conversation.datastore_id.as_str(),
                conversation.workspace_id.as_ref().map(WorkspaceId::as_str),
                conversation.title,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Database(format!("failed to insert conversation: {e}")))?;

        info!(
            "created conversation {} for datastore {}",
            conversation.id, conversation.datastore_id
        );
        Ok(conversation)
    }

    pub fn get_conversation(&self, id: &ConversationId) -> Result<Conversation> {
        let conn = self.connection()?;
        conn.query_row(
            "SELECT id, datastore_id, workspace_id, title, created_at, updated_at
             FROM conversations WHERE id = ?",
            params![id.as_str()],
            row_to_conversation,
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to load conversation: {e}")))?
        .ok_or_else(|| Error::NotFound(format!("conversation {id}")))
    }

    /// Conversations ordered by most recent activity.
    pub fn list_conversations(
        &self,
        datastore_id: Option<&DatastoreId>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Conversation>> {
        let limit = if limit == 0 {
            DEFAULT_LIST_LIMIT
        } else {
            limit.min(MAX_LIST_LIMIT)
        };

        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, datastore_id, workspace_id, title, created_at, updated_at
                 FROM conversations
                 WHERE (?1 IS NULL OR datastore_id = ?1)
                 ORDER BY updated_at DESC
                 LIMIT ?2 OFFSET ?3",
            )
            .map_err(|e| Error::Database(format!("failed to prepare conversation list: {e}")))?;

        let rows = stmt
            .query_map(
                params![
                    datastore_id.map(DatastoreId::as_str),
                    limit as i64,
                    offset as i64
                ],
                row_to_conversation,
            )
            .map_err(|e| Error::Database(format!("failed to list conversations: {e}")))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(format!("failed to collect conversations: {e}")))
    }

    pub fn update_title(&self, id: &ConversationId, title: &str) -> Result<()> {
        let conn = self.connection()?;
        let updated = conn
            .execute(
                "UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?",
                params![title, Utc::now().to_rfc3339(), id.as_str()],
            )
            .map_err(|e| Error::Database(format!("failed to update title: {e}")))?;

        if updated == 0 {
            return Err(Error::NotFound(format!("conversation {id}")));
        }
        Ok(())
    }

    /// Deletes the conversation and all of its messages.
    pub fn delete_conversation(&self, id: &ConversationId) -> Result<bool> {
        let conn = self.connection()?;
        let deleted = conn
            .execute("DELETE FROM conversations WHERE id = ?", params![id.as_str()])
            .map_err(|e| Error::Database(format!("failed to delete conversation: {e}")))?;

        if deleted > 0 {
            info!("deleted conversation {id}");
        }
        Ok(deleted > 0)
    }

    /// Append one message. Empty user messages are refused: emptiness is
    /// never a control signal.
    pub fn append_message(
        &self,
        conversation_id: &ConversationId,
        role: MessageRole,
        content: &str,
        payload: Option<MessagePayload>,
    ) -> Result<Message> {
        if role == MessageRole::User && content.trim().is_empty() {
            return Err(Error::Validation("user message content cannot be empty".into()));
        }

        let payload_json = payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::Database(format!("failed to serialize message payload: {e}")))?;

        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin append: {e}")))?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM conversations WHERE id = ?",
                params![conversation_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to look up conversation: {e}")))?;
        if exists.is_none() {
            return Err(Error::NotFound(format!("conversation {conversation_id}")));
        }

        let (last_seq, last_ts): (i64, Option<String>) = tx
            .query_row(
                "SELECT COALESCE(MAX(seq), 0), MAX(timestamp)
                 FROM messages WHERE conversation_id = ?",
                params![conversation_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| Error::Database(format!("failed to read message sequence: {e}")))?;

        // Never let a clock step backwards reorder the conversation.
        let mut timestamp = Utc::now();
        if let Some(previous) = last_ts.as_deref().map(parse_timestamp).transpose()?
            && previous > timestamp
        {
            timestamp = previous;
        }

        let message = Message {
            id: MessageId::new(),
            conversation_id: conversation_id.clone(),
            role,
            content: content.to_string(),
            payload,
            timestamp,
        };

        tx.execute(
            "INSERT INTO messages (id, conversation_id, seq, role, content, payload, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                message.id.as_str(),
                conversation_id.as_str(),
                last_seq + 1,
                role.as_str(),
                message.content,
                payload_json,
                timestamp.to_rfc3339(),
            ],
        )
        .map_err(|e| Error::Database(format!("failed to insert message: {e}")))?;

        tx.execute(
            "UPDATE conversations SET updated_at = ? WHERE id = ?",
            params![timestamp.to_rfc3339(), conversation_id.as_str()],
        )
        .map_err(|e| Error::Database(format!("failed to touch conversation: {e}")))?;

        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit append: {e}")))?;

        debug!(
            conversation_id = %conversation_id,
            role = role.as_str(),
            seq = last_seq + 1,
            "appended message"
        );
        Ok(message)
    }

    /// Every message of the conversation in append order.
    pub fn messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        self.get_conversation(conversation_id)?;
        self.query_messages(conversation_id, None)
    }

    /// The `limit` most recent messages, oldest first.
    pub fn recent_messages(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.get_conversation(conversation_id)?;
        if limit == 0 {
            return self.query_messages(conversation_id, None);
        }
        let mut messages = self.query_messages(conversation_id, Some(limit))?;
        messages.reverse();
        Ok(messages)
    }

    pub fn count_conversations(&self) -> Result<usize> {
        let conn = self.connection()?;
        conn.query_row("SELECT count(*) FROM conversations", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as usize)
        .map_err(|e| Error::Database(format!("failed to count conversations: {e}")))
    }

    fn query_messages(
        &self,
        conversation_id: &ConversationId,
        newest_first_limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        let conn = self.connection()?;
        let sql = match newest_first_limit {
            Some(_) => {
                "SELECT id, conversation_id, role, content, payload, timestamp
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY seq DESC LIMIT ?2"
            }
            None => {
                "SELECT id, conversation_id, role, content, payload, timestamp
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY seq ASC LIMIT ?2"
            }
        };
        let limit = newest_first_limit.map(|l| l as i64).unwrap_or(-1);

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| Error::Database(format!("failed to prepare message query: {e}")))?;

        let rows = stmt
            .query_map(params![conversation_id.as_str(), limit], row_to_message)
            .map_err(|e| Error::Database(format!("failed to query messages: {e}")))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(format!("failed to collect messages: {e}")))
    }
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;

    Ok(Conversation {
        id: ConversationId::from_str(row.get::<_, String>(0)?),
        datastore_id: DatastoreId::from_str(row.get::<_, String>(1)?),
        workspace_id: row.get::<_, Option<String>>(2)?.map(WorkspaceId::from_str),
        title: row.get(3)?,
        created_at: parse_timestamp(&created_at).map_err(to_sql_error)?,
        updated_at: parse_timestamp(&updated_at).map_err(to_sql_error)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role_str: String = row.get(2)?;
    let role = MessageRole::parse(&role_str).map_err(to_sql_error)?;

    let payload_str: Option<String> = row.get(4)?;
    let payload = payload_str
        .as_deref()
        .map(serde_json::from_str::<MessagePayload>)
        .transpose()
        .map_err(|e| to_sql_error(Error::Serialization(e)))?;

    let timestamp_str: String = row.get(5)?;

    Ok(Message {
        id: MessageId::from_str(row.get::<_, String>(0)?),
        conversation_id: ConversationId::from_str(row.get::<_, String>(1)?),
        role,
        content: row.get(3)?,
        payload,
        timestamp: parse_timestamp(&timestamp_str).map_err(to_sql_error)?,
    })
}

fn to_sql_error(e: Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(e.to_string())))
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
    }

    Err(Error::Database(format!("invalid timestamp format: {raw}")))
}
