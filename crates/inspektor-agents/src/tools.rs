//! Planner tool definitions and conversion of model replies into [`Action`]s.

use inspektor_common::{Confidence, MetadataKind, MetadataParams, MetadataRequest};
use serde_json::{Value, json};
use tracing::debug;

use crate::planner::Action;
use crate::providers::{ContentBlock, LlmResponse, ToolDefinition};

pub const GET_TABLE_NAMES: &str = "get_table_names";
pub const GET_TABLE_SCHEMA: &str = "get_table_schema";
pub const GET_RELATIONSHIPS: &str = "get_relationships";
pub const GENERATE_SQL: &str = "generate_sql";
pub const ASK_CLARIFICATION: &str = "ask_clarification";

pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: GET_TABLE_NAMES.to_string(),
            description: "Request the list of all table names in the database. Use this when \
                          you need to know which tables exist."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "reason": {
                        "type": "string",
                        "description": "Why the table list is needed (shown to the user)"
                    }
                },
                "required": ["reason"]
            }),
        },
        ToolDefinition {
            name: GET_TABLE_SCHEMA.to_string(),
            description: "Request column definitions (types, nullability, primary keys) for \
                          specific tables."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "table_names": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Tables to describe"
                    },
                    "reason": {
                        "type": "string",
                        "description": "Why these schemas are needed (shown to the user)"
                    }
                },
                "required": ["table_names", "reason"]
            }),
        },
        ToolDefinition {
            name: GET_RELATIONSHIPS.to_string(),
            description: "Request foreign key relationships between tables. Use this when a \
                          JOIN is needed."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "reason": {
                        "type": "string",
                        "description": "Why relationships are needed (shown to the user)"
                    }
                },
                "required": ["reason"]
            }),
        },
        ToolDefinition {
            name: GENERATE_SQL.to_string(),
            description: "Return the final read-only SQL query once the metadata is sufficient."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "sql": {"type": "string", "description": "The complete SQL query"},
                    "explanation": {
                        "type": "string",
                        "description": "What the query does and how it answers the question"
                    },
                    "confidence": {
                        "type": "string",
                        "enum": ["high", "medium", "low"]
                    }
                },
                "required": ["sql", "explanation", "confidence"]
            }),
        },
        ToolDefinition {
            name: ASK_CLARIFICATION.to_string(),
            description: "Ask the user a question when the request cannot be answered as stated."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "question": {"type": "string"}
                },
                "required": ["question"]
            }),
        },
    ]
}

/// Convert the first tool call of a response, or failing that its text, into an action.
pub fn action_from_response(response: &LlmResponse) -> Action {
    let tool_call = response.content.iter().find_map(|block| match block {
        ContentBlock::ToolUse { name, input, .. } => Some((name, input)),
        ContentBlock::Text { .. } => None,
    });
    if let Some((name, input)) = tool_call {
        return action_from_tool_call(name, input);
    }

    let text: Vec<&str> = response
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            ContentBlock::ToolUse { .. } => None,
        })
        .collect();
    if text.is_empty() {
        return error("planner returned neither a tool call nor text");
    }
    action_from_text(&text.join("\n"))
}

pub fn action_from_tool_call(name: &str, input: &Value) -> Action {
    debug!(tool = name, "planner tool call");
    match name {
        GET_TABLE_NAMES => Action::NeedsMetadata {
            request: MetadataRequest::tables(reason_or(input, "Need to see available tables")),
        },
        GET_TABLE_SCHEMA => match string_list(input, "table_names") {
            Some(tables) => Action::NeedsMetadata {
                request: MetadataRequest::schema(
                    tables,
                    reason_or(input, "Need table schema details"),
                ),
            },
            None => error("get_table_schema called without table_names"),
        },
        GET_RELATIONSHIPS => Action::NeedsMetadata {
            request: MetadataRequest::relationships(reason_or(
                input,
                "Need table relationships for JOINs",
            )),
        },
        GENERATE_SQL => match str_field(input, "sql") {
            Some(sql) => Action::Ready {
                sql: sql.to_string(),
                explanation: str_field(input, "explanation").unwrap_or_default().to_string(),
                confidence: str_field(input, "confidence")
                    .map(Confidence::parse_lenient)
                    .unwrap_or_default(),
            },
            None => error("generate_sql called without sql"),
        },
        ASK_CLARIFICATION => match str_field(input, "question") {
            Some(question) => Action::Clarification {
                question: question.to_string(),
            },
            None => error("ask_clarification called without question"),
        },
        other => error(&format!("planner called unknown tool: {other}")),
    }
}

/// Parse a JSON reply carrying a `status` field, optionally inside a ```json fence.
pub fn action_from_text(text: &str) -> Action {
    let body = strip_fence(text);
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => return error("planner replied with text instead of a tool call"),
    };

    match value.get("status").and_then(Value::as_str) {
        Some("needs_metadata") => match metadata_request_from_value(&value) {
            Some(request) => Action::NeedsMetadata { request },
            None => error("needs_metadata reply without a valid metadata type"),
        },
        Some("ready") => match str_field(&value, "sql") {
            Some(sql) => Action::Ready {
                sql: sql.to_string(),
                explanation: str_field(&value, "explanation").unwrap_or_default().to_string(),
                confidence: str_field(&value, "confidence")
                    .map(Confidence::parse_lenient)
                    .unwrap_or_default(),
            },
            None => error("ready reply without sql"),
        },
        Some("clarification") => match str_field(&value, "question") {
            Some(question) => Action::Clarification {
                question: question.to_string(),
            },
            None => error("clarification reply without question"),
        },
        Some("error") => Action::Error {
            message: str_field(&value, "message")
                .or_else(|| str_field(&value, "error"))
                .unwrap_or("planner reported an error")
                .to_string(),
        },
        Some(other) => error(&format!("unknown planner status: {other}")),
        None => error("planner reply has no status"),
    }
}

fn metadata_request_from_value(value: &Value) -> Option<MetadataRequest> {
    if let Some(request) = value.get("request")
        && let Ok(request) = serde_json::from_value::<MetadataRequest>(request.clone())
    {
        return Some(request);
    }

    let kind = str_field(value, "metadata_type").or_else(|| str_field(value, "kind"))?;
    let kind = MetadataKind::parse(kind).ok()?;
    let tables = value
        .get("params")
        .and_then(|p| string_list(p, "tables"))
        .or_else(|| string_list(value, "tables"))
        .unwrap_or_default();
    Some(MetadataRequest {
        kind,
        params: MetadataParams { tables },
        reason: str_field(value, "reason").unwrap_or_default().to_string(),
    })
}

fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn string_list(value: &Value, key: &str) -> Option<Vec<String>> {
    let items = value.get(key)?.as_array()?;
    Some(
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    )
}

fn reason_or(input: &Value, fallback: &str) -> String {
    str_field(input, "reason").unwrap_or(fallback).to_string()
}

fn error(message: &str) -> Action {
    Action::Error {
        message: message.to_string(),
    }
}
