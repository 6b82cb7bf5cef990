//! Reusable knowledge learned from earlier conversations in a workspace:
//! tables that proved useful, join paths, casting quirks, business rules and
//! query idioms. Like schema metadata it never contains row data.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::schema::{Relationship, RelationshipKey};

/// A column that needs special handling, e.g. a cast before comparison.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypecastHint {
    pub table: String,
    pub column: String,
    pub hint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SqlPattern {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct WorkspaceContext {
    #[serde(default)]
    pub tables_used: BTreeSet<String>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub column_typecast_hints: Vec<TypecastHint>,
    #[serde(default)]
    pub business_context: BTreeSet<String>,
    #[serde(default)]
    pub sql_patterns: Vec<SqlPattern>,
}

impl WorkspaceContext {
    pub fn is_empty(&self) -> bool {
        self.tables_used.is_empty()
            && self.relationships.is_empty()
            && self.column_typecast_hints.is_empty()
            && self.business_context.is_empty()
            && self.sql_patterns.is_empty()
    }

    /// Fold newer knowledge into this context.
    ///
    /// Tables and business rules are unioned. Relationships are unioned by
    /// edge and the first seen edge wins. Typecast hints are keyed by
    /// `table.column` and SQL patterns by name; for those the newer entry
    /// replaces the older one. Patterns without a name are dropped.
    pub fn merge(&mut self, newer: &WorkspaceContext) {
        self.tables_used
            .extend(newer.tables_used.iter().map(|t| t.trim().to_string()));
        self.tables_used.retain(|t| !t.is_empty());

        let mut edges: BTreeMap<RelationshipKey, Relationship> = BTreeMap::new();
        for edge in self.relationships.drain(..).chain(newer.relationships.iter().cloned()) {
            edges.entry(edge.key()).or_insert(edge);
        }
        self.relationships = edges.into_values().collect();

        let mut hints: BTreeMap<(String, String), TypecastHint> = BTreeMap::new();
        for hint in self
            .column_typecast_hints
            .drain(..)
            .chain(newer.column_typecast_hints.iter().cloned())
        {
            hints.insert((hint.table.clone(), hint.column.clone()), hint);
        }
        self.column_typecast_hints = hints.into_values().collect();

        self.business_context.extend(
            newer
                .business_context
                .iter()
                .map(|rule| rule.trim().to_string()),
        );
        self.business_context.retain(|rule| !rule.is_empty());

        let mut patterns: BTreeMap<String, SqlPattern> = BTreeMap::new();
        for pattern in self.sql_patterns.drain(..).chain(newer.sql_patterns.iter().cloned()) {
            let name = pattern.pattern.trim().to_string();
            if !name.is_empty() {
                patterns.insert(name, pattern);
            }
        }
        self.sql_patterns = patterns.into_values().collect();
    }
}
