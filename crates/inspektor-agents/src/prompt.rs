//! Prompt assembly for the LLM planner: system prompt, cached metadata block
//! and conversation history rendered as chat messages.

use std::fmt::Write as _;

use inspektor_common::{Message, MessagePayload, MessageRole, MetadataSnapshot, WorkspaceContext};

use crate::providers::{ChatMessage, ChatRole};

pub const SYSTEM_PROMPT: &str = "You translate natural-language questions into read-only SQL.

You never see database rows or credentials. You only see structural metadata \
(table names, column definitions, relationships) that the user has approved.

Always answer by calling exactly one tool:
- get_table_names: list the tables of the database
- get_table_schema: column definitions for specific tables
- get_relationships: foreign key edges, when a JOIN is needed
- generate_sql: the final query once the metadata is sufficient
- ask_clarification: only when the question cannot be answered as asked

SQL rules:
- SELECT statements only, never INSERT, UPDATE, DELETE, DROP, ALTER or CREATE
- prefer explicit JOINs and table aliases
- add LIMIT 100 unless the user asks for something else

Metadata rules:
- every request is shown to the user for approval, keep them few and precise
- check the metadata block and the \"Metadata received\" messages first
- never request metadata you already have
- request schemas only for tables you have not seen yet

Confidence: high when the metadata covers the query, medium when the query is \
complex or ambiguous, low for a best-effort guess.";

const CONTINUE_INSTRUCTION: &str =
    "Please continue processing the previous query with the updated metadata.";

/// Render cached metadata as a compact text block.
pub fn format_metadata(snapshot: Option<&MetadataSnapshot>) -> String {
    let Some(snapshot) = snapshot.filter(|s| !s.is_empty()) else {
        return "No metadata available".to_string();
    };

    let mut out = String::new();

    if snapshot.tables_fetched || !snapshot.tables.is_empty() {
        let names: Vec<&str> = snapshot.tables.iter().map(String::as_str).collect();
        if names.is_empty() {
            out.push_str("Tables: none");
        } else {
            let _ = write!(out, "Tables: {}", names.join(", "));
        }
    }

    for (table, columns) in &snapshot.schemas {
        let _ = write!(out, "\n\nTable '{table}':");
        for column in columns {
            let _ = write!(out, "\n  {} ({})", column.name, column.data_type);
            if !column.nullable {
                out.push_str(" NOT NULL");
            }
            if column.is_primary_key {
                out.push_str(" PRIMARY KEY");
            }
        }
    }

    if snapshot.relationships_fetched {
        out.push_str("\n\nRelationships:");
        if snapshot.relationships.is_empty() {
            out.push_str(" none");
        }
        for edge in &snapshot.relationships {
            let _ = write!(
                out,
                "\n  {}.{} -> {}.{}",
                edge.from_table, edge.from_column, edge.to_table, edge.to_column
            );
        }
    }

    let out = out.trim_start();
    if out.is_empty() {
        // only requests that came back empty so far
        return "No metadata available".to_string();
    }
    out.to_string()
}

/// Render knowledge learned in earlier conversations of the workspace.
pub fn format_workspace_context(context: &WorkspaceContext) -> String {
    let mut out = String::new();

    if !context.tables_used.is_empty() {
        let names: Vec<&str> = context.tables_used.iter().map(String::as_str).collect();
        let _ = write!(out, "Tables used in previous queries: {}", names.join(", "));
    }

    if !context.relationships.is_empty() {
        out.push_str("\n\nKnown relationships:");
        for edge in &context.relationships {
            let _ = write!(
                out,
                "\n  - {}.{} -> {}.{} ({})",
                edge.from_table,
                edge.from_column,
                edge.to_table,
                edge.to_column,
                edge.kind.as_deref().unwrap_or("unknown")
            );
        }
    }

    if !context.column_typecast_hints.is_empty() {
        out.push_str("\n\nColumn typecast hints:");
        for hint in &context.column_typecast_hints {
            let _ = write!(out, "\n  - {}.{}: {}", hint.table, hint.column, hint.hint);
            if let Some(example) = &hint.example {
                let _ = write!(out, " (e.g., {example})");
            }
        }
    }

    if !context.business_context.is_empty() {
        out.push_str("\n\nBusiness rules and domain knowledge:");
        for rule in &context.business_context {
            let _ = write!(out, "\n  - {rule}");
        }
    }

    if !context.sql_patterns.is_empty() {
        out.push_str("\n\nUseful SQL patterns:");
        for pattern in &context.sql_patterns {
            let _ = write!(out, "\n  - {}", pattern.pattern);
            if let Some(example) = &pattern.example {
                let _ = write!(out, "\n    Example: {example}");
            }
        }
    }

    let out = out.trim_start();
    if out.is_empty() {
        return "No context available yet".to_string();
    }
    out.to_string()
}

pub fn build_system_prompt(
    snapshot: Option<&MetadataSnapshot>,
    workspace: Option<&WorkspaceContext>,
) -> String {
    let mut prompt = format!(
        "{SYSTEM_PROMPT}\n\nAvailable metadata:\n{}",
        format_metadata(snapshot)
    );
    if let Some(context) = workspace.filter(|c| !c.is_empty()) {
        let _ = write!(
            prompt,
            "\n\nWorkspace context:\n{}",
            format_workspace_context(context)
        );
    }
    prompt
}

/// Map stored conversation messages onto chat turns for the provider.
pub fn history_to_chat(history: &[Message]) -> Vec<ChatMessage> {
    history.iter().filter_map(message_to_chat).collect()
}

fn message_to_chat(message: &Message) -> Option<ChatMessage> {
    match (&message.role, &message.payload) {
        (MessageRole::User, _) => {
            if message.content.trim().is_empty() {
                None
            } else {
                Some(ChatMessage::text(ChatRole::User, message.content.clone()))
            }
        }
        (MessageRole::Assistant, Some(MessagePayload::MetadataRequest { request })) => {
            Some(ChatMessage::text(
                ChatRole::Assistant,
                format!("{}\n[Requested metadata: {}]", message.content, request.label()),
            ))
        }
        (
            MessageRole::Assistant,
            Some(MessagePayload::Sql {
                sql, explanation, ..
            }),
        ) => Some(ChatMessage::text(
            ChatRole::Assistant,
            format!("{explanation}\n\n```sql\n{sql}\n```"),
        )),
        (MessageRole::Assistant, _) => Some(ChatMessage::text(
            ChatRole::Assistant,
            message.content.clone(),
        )),
        (MessageRole::System, Some(MessagePayload::Continue { summary, .. })) => Some(
            ChatMessage::text(ChatRole::User, format!("{summary}\n{CONTINUE_INSTRUCTION}")),
        ),
        (
            MessageRole::System,
            Some(MessagePayload::ExecutionFailure {
                sql, error, intent, ..
            }),
        ) => Some(ChatMessage::text(
            ChatRole::User,
            execution_failure_prompt(intent, sql, error),
        )),
        (MessageRole::System, _) => Some(ChatMessage::text(
            ChatRole::System,
            message.content.clone(),
        )),
    }
}

fn execution_failure_prompt(intent: &str, sql: &str, error: &str) -> String {
    format!(
        "The following SQL query failed when executed:\n\n\
         Original user question: {intent}\n\n\
         Failed SQL:\n```sql\n{sql}\n```\n\n\
         Database error:\n{error}\n\n\
         Correct the query with generate_sql, or request the metadata you are missing."
    )
}
