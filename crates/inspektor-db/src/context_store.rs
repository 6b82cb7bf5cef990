use chrono::{DateTime, Utc};
use inspektor_common::{ConversationId, Error, Result, WorkspaceContext, WorkspaceId};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::migrations::WORKSPACE_CONTEXT_SCHEMA_V1;
use crate::session_store::parse_timestamp;

/// A workspace's context together with its bookkeeping columns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredWorkspaceContext {
    pub workspace_id: WorkspaceId,
    pub context: WorkspaceContext,
    /// Conversation the context was first learned from.
    pub source_conversation_id: Option<ConversationId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Knowledge shared by every conversation of a workspace. Unlike the
/// metadata cache it does not expire.
pub struct WorkspaceContextStore {
    conn: Mutex<Connection>,
}

impl WorkspaceContextStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening workspace context store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open context store: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
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

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute_batch(WORKSPACE_CONTEXT_SCHEMA_V1.sql)
            .map_err(|e| Error::Database(format!("context store migration failed: {e}")))?;
        Ok(())
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Database("context store lock poisoned".into()))
    }

    pub fn get(&self, workspace_id: &WorkspaceId) -> Result<Option<WorkspaceContext>> {
        Ok(self.get_full(workspace_id)?.map(|stored| stored.context))
    }

    pub fn get_full(&self, workspace_id: &WorkspaceId) -> Result<Option<StoredWorkspaceContext>> {
        let conn = self.connection()?;
        load(&conn, workspace_id)
    }

    /// Fold `learned` into the workspace's context, creating it on first use.
    pub fn merge(
        &self,
        workspace_id: &WorkspaceId,
        learned: &WorkspaceContext,
        source_conversation_id: Option<&ConversationId>,
    ) -> Result<WorkspaceContext> {
        let conn = self.connection()?;
        let now = Utc::now().to_rfc3339();

        let merged = match load(&conn, workspace_id)? {
            Some(mut stored) => {
                stored.context.merge(learned);
                conn.execute(
                    "UPDATE workspace_context SET context = ?, updated_at = ?
                     WHERE workspace_id = ?",
                    params![encode(&stored.context)?, now, workspace_id.as_str()],
                )
                .map_err(|e| Error::Database(format!("failed to update context: {e}")))?;
                debug!(workspace_id = %workspace_id, "merged workspace context");
                stored.context
            }
            None => {
                let mut context = WorkspaceContext::default();
                context.merge(learned);
                conn.execute(
                    "INSERT INTO workspace_context
                        (workspace_id, context, source_conversation_id, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?)",
                    params![
                        workspace_id.as_str(),
                        encode(&context)?,
                        source_conversation_id.map(ConversationId::as_str),
                        now,
                        now,
                    ],
                )
                .map_err(|e| Error::Database(format!("failed to insert context: {e}")))?;
                info!("created context for workspace {workspace_id}");
                context
            }
        };
        Ok(merged)
    }

    /// Overwrite an existing context. Returns `false` when the workspace has none.
    pub fn replace(&self, workspace_id: &WorkspaceId, context: &WorkspaceContext) -> Result<bool> {
        let conn = self.connection()?;
        let updated = conn
            .execute(
                "UPDATE workspace_context SET context = ?, updated_at = ? WHERE workspace_id = ?",
                params![
                    encode(context)?,
                    Utc::now().to_rfc3339(),
                    workspace_id.as_str()
                ],
            )
            .map_err(|e| Error::Database(format!("failed to replace context: {e}")))?;
        Ok(updated > 0)
    }

    pub fn delete(&self, workspace_id: &WorkspaceId) -> Result<bool> {
        let conn = self.connection()?;
        let deleted = conn
            .execute(
                "DELETE FROM workspace_context WHERE workspace_id = ?",
                params![workspace_id.as_str()],
            )
            .map_err(|e| Error::Database(format!("failed to delete context: {e}")))?;
        if deleted > 0 {
            info!("deleted context for workspace {workspace_id}");
        }
        Ok(deleted > 0)
    }
}

fn encode(context: &WorkspaceContext) -> Result<String> {
    serde_json::to_string(context)
        .map_err(|e| Error::Database(format!("failed to serialize workspace context: {e}")))
}

fn load(conn: &Connection, workspace_id: &WorkspaceId) -> Result<Option<StoredWorkspaceContext>> {
    let row: Option<(String, Option<String>, String, String)> = conn
        .query_row(
            "SELECT context, source_conversation_id, created_at, updated_at
             FROM workspace_context WHERE workspace_id = ?",
            params![workspace_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
        .map_err(|e| Error::Database(format!("failed to load workspace context: {e}")))?;

    let Some((context_json, source, created_at, updated_at)) = row else {
        return Ok(None);
    };

    let context = serde_json::from_str(&context_json)
        .map_err(|e| Error::Database(format!("corrupt workspace context: {e}")))?;
    Ok(Some(StoredWorkspaceContext {
        workspace_id: workspace_id.clone(),
        context,
        source_conversation_id: source.map(ConversationId::from_str),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use inspektor_common::SqlPattern;

    fn workspace() -> WorkspaceId {
        WorkspaceId::from_str("analytics")
    }

    fn tables(names: &[&str]) -> WorkspaceContext {
        WorkspaceContext {
            tables_used: names.iter().map(|n| n.to_string()).collect(),
            ..WorkspaceContext::default()
        }
    }

    #[test]
    fn merge_creates_then_unions() {
        let store = WorkspaceContextStore::in_memory().expect("store");
        let source = ConversationId::from_str("conv-1");
        assert!(store.get(&workspace()).expect("get").is_none());

        store
            .merge(&workspace(), &tables(&["users"]), Some(&source))
            .expect("first merge");
        let merged = store
            .merge(
                &workspace(),
                &tables(&["orders"]),
                Some(&ConversationId::from_str("conv-2")),
            )
            .expect("second merge");

        assert_eq!(merged.tables_used.len(), 2);
        let stored = store
            .get_full(&workspace())
            .expect("get")
            .expect("context exists");
        assert_eq!(stored.context, merged);
        assert_eq!(stored.source_conversation_id, Some(source));
        assert!(stored.updated_at >= stored.created_at);
    }

    #[test]
    fn replace_requires_existing_context() {
        let store = WorkspaceContextStore::in_memory().expect("store");
        let edited = WorkspaceContext {
            sql_patterns: vec![SqlPattern {
                pattern: "monthly totals".into(),
                example: Some("date_trunc('month', created_at)".into()),
            }],
            ..WorkspaceContext::default()
        };
        assert!(!store.replace(&workspace(), &edited).expect("replace"));

        store
            .merge(&workspace(), &tables(&["users"]), None)
            .expect("merge");
        assert!(store.replace(&workspace(), &edited).expect("replace"));
        assert_eq!(store.get(&workspace()).expect("get"), Some(edited));
    }

    #[test]
    fn delete_removes_context() {
        let store = WorkspaceContextStore::in_memory().expect("store");
        store
            .merge(&workspace(), &tables(&["users"]), None)
            .expect("merge");
        assert!(store.delete(&workspace()).expect("delete"));
        assert!(!store.delete(&workspace()).expect("second delete"));
        assert!(store.get(&workspace()).expect("get").is_none());
    }
}
