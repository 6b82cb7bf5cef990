//! Structural schema facts. These are the only database-derived values that
//! ever reach the planner: names, types and relationship edges, never rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{Error, Result};
use crate::types::DatastoreId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    /// Constraint flavour reported by the executor (e.g. "foreign_key").
    #[serde(default)]
    pub kind: Option<String>,
}

/// Identity of a relationship edge for union merges.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelationshipKey(pub String, pub String, pub String, pub String);

impl Relationship {
    pub fn key(&self) -> RelationshipKey {
        RelationshipKey(
            self.from_table.clone(),
            self.from_column.clone(),
            self.to_table.clone(),
            self.to_column.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MetadataKind {
    Tables,
    Schema,
    Relationships,
}

impl MetadataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tables => "tables",
            Self::Schema => "schema",
            Self::Relationships => "relationships",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value.trim() {
            "tables" => Ok(Self::Tables),
            "schema" | "schemas" => Ok(Self::Schema),
            "relationships" => Ok(Self::Relationships),
            other => Err(Error::Validation(format!("unknown metadata type: {other}"))),
        }
    }
}

impl fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MetadataParams {
    /// Table names a schema request is scoped to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tables: Vec<String>,
}

/// Identity of a fulfilled request: the kind plus its sorted, de-duplicated
/// table names. Name order in the original request does not matter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestKey(pub MetadataKind, pub Vec<String>);

/// A planner's request for one kind of structural metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataRequest {
    pub kind: MetadataKind,
    #[serde(default)]
    pub params: MetadataParams,
    /// Why the planner needs it; shown to the user when approval is asked.
    #[serde(default)]
    pub reason: String,
}

impl MetadataRequest {
    pub fn tables(reason: impl Into<String>) -> Self {
        Self {
            kind: MetadataKind::Tables,
            params: MetadataParams::default(),
            reason: reason.into(),
        }
    }

    pub fn schema(tables: Vec<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: MetadataKind::Schema,
            params: MetadataParams { tables },
            reason: reason.into(),
        }
    }

    pub fn relationships(reason: impl Into<String>) -> Self {
        Self {
            kind: MetadataKind::Relationships,
            params: MetadataParams::default(),
            reason: reason.into(),
        }
    }

    pub fn key(&self) -> RequestKey {
        let tables = match self.kind {
            MetadataKind::Schema => {
                let names: BTreeSet<String> = self
                    .params
                    .tables
                    .iter()
                    .map(|t| t.trim())
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
                names.into_iter().collect()
            }
            MetadataKind::Tables | MetadataKind::Relationships => Vec::new(),
        };
        RequestKey(self.kind, tables)
    }

    /// Short human label, e.g. `schema(users, orders)`.
    pub fn label(&self) -> String {
        if self.params.tables.is_empty() {
            self.kind.to_string()
        } else {
            format!("{}({})", self.kind, self.params.tables.join(", "))
        }
    }
}

/// Executor answer to a metadata request, merged into the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MetadataPayload {
    Tables(Vec<String>),
    Schema(BTreeMap<String, Vec<ColumnSchema>>),
    Relationships(Vec<Relationship>),
}

impl MetadataPayload {
    pub fn kind(&self) -> MetadataKind {
        match self {
            Self::Tables(_) => MetadataKind::Tables,
            Self::Schema(_) => MetadataKind::Schema,
            Self::Relationships(_) => MetadataKind::Relationships,
        }
    }

    /// One-line description recorded in conversation history.
    pub fn summary(&self) -> String {
        match self {
            Self::Tables(tables) if tables.is_empty() => {
                "Metadata received (tables): none".to_string()
            }
            Self::Tables(tables) => format!("Metadata received (tables): {}", tables.join(", ")),
            Self::Schema(schemas) => {
                let names: Vec<&str> = schemas.keys().map(String::as_str).collect();
                format!("Metadata received (schema) for tables: {}", names.join(", "))
            }
            Self::Relationships(edges) => {
                format!("Metadata received (relationships): {} edge(s)", edges.len())
            }
        }
    }
}

/// Accumulated schema knowledge for one datastore.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataSnapshot {
    pub datastore_id: DatastoreId,
    pub tables: BTreeSet<String>,
    pub schemas: BTreeMap<String, Vec<ColumnSchema>>,
    /// Kept sorted by `Relationship::key` and free of duplicate keys.
    pub relationships: Vec<Relationship>,
    pub tables_fetched: bool,
    pub relationships_fetched: bool,
    /// Requests the executor has answered, whatever the answer contained.
    #[serde(default)]
    pub fetched_requests: BTreeSet<RequestKey>,
    pub merged_at: DateTime<Utc>,
}

impl MetadataSnapshot {
    pub fn empty(datastore_id: DatastoreId) -> Self {
        Self {
            datastore_id,
            tables: BTreeSet::new(),
            schemas: BTreeMap::new(),
            relationships: Vec::new(),
            tables_fetched: false,
            relationships_fetched: false,
            fetched_requests: BTreeSet::new(),
            merged_at: Utc::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
            && self.schemas.is_empty()
            && self.relationships.is_empty()
            && !self.tables_fetched
            && !self.relationships_fetched
            && self.fetched_requests.is_empty()
    }

    /// Whether this snapshot already answers `request`: the same request was
    /// fulfilled before, or the facts it asks for are all present.
    pub fn satisfies(&self, request: &MetadataRequest) -> bool {
        if self.fetched_requests.contains(&request.key()) {
            return true;
        }
        match request.kind {
            MetadataKind::Tables => self.tables_fetched,
            MetadataKind::Relationships => self.relationships_fetched,
            MetadataKind::Schema if request.params.tables.is_empty() => {
                !self.tables.is_empty() && self.tables.iter().all(|t| self.schemas.contains_key(t))
            }
            MetadataKind::Schema => request
                .params
                .tables
                .iter()
                .all(|t| self.schemas.contains_key(t)),
        }
    }
}
