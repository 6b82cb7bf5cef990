use std::collections::BTreeMap;

use async_trait::async_trait;
use inspektor_common::{ColumnSchema, DatastoreId, Relationship, Result};
use serde::{Deserialize, Serialize};

/// Credentialed component that introspects datastores and runs statements.
///
/// The negotiation engine only calls the metadata methods. The host calls
/// `execute_read_only_sql` after a `Ready` outcome; implementations enforce
/// the read-only policy and report failures as `Error::Execution`.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn list_tables(&self, datastore: &DatastoreId) -> Result<Vec<String>>;

    /// Column definitions for `tables`; an empty slice means every table.
    async fn get_schema(
        &self,
        datastore: &DatastoreId,
        tables: &[String],
    ) -> Result<BTreeMap<String, Vec<ColumnSchema>>>;

    async fn get_relationships(&self, datastore: &DatastoreId) -> Result<Vec<Relationship>>;

    async fn execute_read_only_sql(&self, datastore: &DatastoreId, sql: &str)
    -> Result<QueryResult>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub elapsed_ms: u64,
}
