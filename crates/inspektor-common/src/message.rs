use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::MetadataRequest;
use crate::types::{ConversationId, MessageId};

/// One entry of a conversation. Messages are append-only and never edited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub role: MessageRole,
    pub content: String,
    pub payload: Option<MessagePayload>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(Error::Database(format!("unknown message role: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    #[default]
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Lenient parse used on planner output; unknown values fall back to medium.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Medium,
        }
    }
}

/// Structured data carried next to a message's text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessagePayload {
    /// The planner asked for schema metadata.
    MetadataRequest { request: MetadataRequest },
    /// Internal continuation after a metadata round-trip. Never user input.
    Continue {
        request: MetadataRequest,
        summary: String,
    },
    Sql {
        sql: String,
        explanation: String,
        confidence: Confidence,
    },
    Clarification { question: String },
    ExecutionFailure {
        sql: String,
        error: String,
        intent: String,
        attempt: u32,
    },
    /// The caller ran the generated SQL; ends the failure streak for `intent`.
    ExecutionSuccess { intent: String },
    /// Terminal failure of a turn. `error_kind` is an `Error::kind()` code.
    Failure {
        error_kind: String,
        sql: Option<String>,
    },
}

impl MessagePayload {
    /// True for payloads that close a user turn.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Sql { .. } | Self::Clarification { .. } | Self::Failure { .. }
        )
    }
}

impl Message {
    pub fn is_terminal(&self) -> bool {
        self.payload.as_ref().is_some_and(MessagePayload::is_terminal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{MetadataKind, MetadataParams};

    #[test]
    fn payload_serializes_with_kind_tag() {
        let payload = MessagePayload::Continue {
            request: MetadataRequest {
                kind: MetadataKind::Tables,
                params: MetadataParams::default(),
                reason: "need tables".into(),
            },
            summary: "Metadata received (tables): users".into(),
        };
        let value = serde_json::to_value(&payload).expect("payload should serialize");
        assert_eq!(value["kind"], "continue");
        assert_eq!(value["request"]["kind"], "tables");

        let back: MessagePayload = serde_json::from_value(value).expect("payload should parse");
        assert_eq!(back, payload);
    }

    #[test]
    fn only_outcome_payloads_are_terminal() {
        assert!(
            MessagePayload::Clarification {
                question: "which year?".into()
            }
            .is_terminal()
        );
        assert!(
            MessagePayload::Failure {
                error_kind: "loop_detected".into(),
                sql: None
            }
            .is_terminal()
        );
        assert!(
            !MessagePayload::ExecutionFailure {
                sql: "SELECT 1".into(),
                error: "boom".into(),
                intent: "q".into(),
                attempt: 1,
            }
            .is_terminal()
        );
        assert!(
            !MessagePayload::ExecutionSuccess {
                intent: "q".into()
            }
            .is_terminal()
        );
    }

    #[test]
    fn confidence_parse_is_lenient() {
        assert_eq!(Confidence::parse_lenient("HIGH"), Confidence::High);
        assert_eq!(Confidence::parse_lenient("unsure"), Confidence::Medium);
    }
}
