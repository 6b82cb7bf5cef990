/// Migration system for tracking and applying database schema changes.
///
/// Each migration has a version number and a SQL statement. Statements are
/// idempotent (`IF NOT EXISTS`) so stores can apply them on every open.
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const SESSION_SCHEMA_V1: Migration = Migration {
    version: 1,
    name: "conversations_and_messages",
    sql: "CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            datastore_id TEXT NOT NULL,
            workspace_id TEXT,
            title TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_datastore
            ON conversations(datastore_id, updated_at);

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            seq INTEGER NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            payload TEXT,
            timestamp TEXT NOT NULL,
            UNIQUE (conversation_id, seq)
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, seq);",
};

pub const METADATA_CACHE_SCHEMA_V1: Migration = Migration {
    version: 2,
    name: "metadata_cache",
    sql: "CREATE TABLE IF NOT EXISTS metadata_cache (
            datastore_id TEXT PRIMARY KEY,
            snapshot TEXT NOT NULL,
            merged_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );",
};

pub const WORKSPACE_CONTEXT_SCHEMA_V1: Migration = Migration {
    version: 3,
    name: "workspace_context",
    sql: "CREATE TABLE IF NOT EXISTS workspace_context (
            workspace_id TEXT PRIMARY KEY,
            context TEXT NOT NULL,
            source_conversation_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
};

pub const MIGRATIONS: &[Migration] = &[
    SESSION_SCHEMA_V1,
    METADATA_CACHE_SCHEMA_V1,
    WORKSPACE_CONTEXT_SCHEMA_V1,
];

/// Highest schema version shipped with this build.
pub fn latest_version() -> u32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}
