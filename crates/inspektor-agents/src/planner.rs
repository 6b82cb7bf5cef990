use std::sync::Arc;

use async_trait::async_trait;
use inspektor_common::{
    Confidence, Error, Message, MetadataRequest, MetadataSnapshot, Result, WorkspaceContext,
};
use inspektor_config::PlannerConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::openai::OpenAiProvider;
use crate::prompt;
use crate::providers::{LlmProvider, LlmRequest, ToolChoice};
use crate::tools;

/// What the planner wants to happen next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Action {
    NeedsMetadata {
        request: MetadataRequest,
    },
    Ready {
        sql: String,
        #[serde(default)]
        explanation: String,
        #[serde(default)]
        confidence: Confidence,
    },
    Clarification {
        question: String,
    },
    Error {
        message: String,
    },
}

impl Action {
    /// Reject structurally empty actions before they reach the conversation.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Ready { sql, .. } if sql.trim().is_empty() => {
                Err(Error::Validation("planner returned empty SQL".to_string()))
            }
            Self::Clarification { question } if question.trim().is_empty() => Err(
                Error::Validation("planner returned an empty clarification".to_string()),
            ),
            Self::NeedsMetadata { request }
                if request.params.tables.iter().any(|t| t.trim().is_empty()) =>
            {
                Err(Error::Validation(
                    "metadata request names an empty table".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::NeedsMetadata { .. } => "needs_metadata",
            Self::Ready { .. } => "ready",
            Self::Clarification { .. } => "clarification",
            Self::Error { .. } => "error",
        }
    }
}

/// Decides the next step of a negotiation from history and cached metadata.
///
/// Implementations are stateless per call. An `Err` is a transport-level
/// failure; reasoning failures come back as `Action::Error`.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        history: &[Message],
        snapshot: Option<&MetadataSnapshot>,
    ) -> Result<Action>;

    /// Plan with the knowledge stored for the conversation's workspace.
    /// Planners that have no use for it fall back to [`plan`](Self::plan).
    async fn plan_with_context(
        &self,
        history: &[Message],
        snapshot: Option<&MetadataSnapshot>,
        workspace: Option<&WorkspaceContext>,
    ) -> Result<Action> {
        let _ = workspace;
        self.plan(history, snapshot).await
    }
}

/// Planner backed by a tool-calling LLM.
pub struct LlmPlanner {
    provider: Arc<dyn LlmProvider>,
    model: String,
    max_tokens: u32,
    temperature: f64,
    history_limit: usize,
}

impl LlmPlanner {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        let model = provider.configured_model().unwrap_or_default().to_string();
        Self {
            provider,
            model,
            max_tokens: 2048,
            temperature: 0.0,
            history_limit: 20,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Build the planner described by the `planner` config section.
    pub fn from_config(config: &PlannerConfig) -> Result<Self> {
        let provider: Arc<dyn LlmProvider> = match config.provider.as_str() {
            "openai" => {
                let api_key = config
                    .api_key
                    .clone()
                    .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                    .filter(|k| !k.is_empty());
                let api_key = match (api_key, &config.base_url) {
                    (Some(key), _) => key,
                    // local OpenAI-compatible servers usually run without a key
                    (None, Some(_)) => String::new(),
                    (None, None) => {
                        return Err(Error::Config(
                            "no API key for the openai planner: \
                             set planner.api_key or OPENAI_API_KEY"
                                .to_string(),
                        ));
                    }
                };
                Arc::new(OpenAiProvider::new(
                    api_key,
                    config.model.clone(),
                    config.base_url.clone(),
                ))
            }
            other => {
                return Err(Error::Config(format!("unsupported planner provider: {other}")));
            }
        };

        Ok(Self::new(provider)
            .with_max_tokens(config.max_tokens)
            .with_temperature(config.temperature)
            .with_history_limit(config.history_limit))
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    fn build_request(
        &self,
        history: &[Message],
        snapshot: Option<&MetadataSnapshot>,
        workspace: Option<&WorkspaceContext>,
    ) -> LlmRequest {
        let start = if self.history_limit == 0 {
            0
        } else {
            history.len().saturating_sub(self.history_limit)
        };
        LlmRequest {
            model: self.model.clone(),
            messages: prompt::history_to_chat(&history[start..]),
            system: Some(prompt::build_system_prompt(snapshot, workspace)),
            max_tokens: Some(self.max_tokens),
            temperature: Some(self.temperature),
            tools: tools::definitions(),
            tool_choice: Some(ToolChoice::Required),
        }
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(
        &self,
        history: &[Message],
        snapshot: Option<&MetadataSnapshot>,
    ) -> Result<Action> {
        self.plan_with_context(history, snapshot, None).await
    }

    #[instrument(
        skip_all,
        fields(provider = self.provider.provider_id(), history = history.len())
    )]
    async fn plan_with_context(
        &self,
        history: &[Message],
        snapshot: Option<&MetadataSnapshot>,
        workspace: Option<&WorkspaceContext>,
    ) -> Result<Action> {
        let request = self.build_request(history, snapshot, workspace);

        let action = match self.provider.complete(&request).await {
            Ok(response) => tools::action_from_response(&response),
            Err(e) => {
                warn!("planner provider call failed: {e}");
                Action::Error {
                    message: format!("planner unavailable: {e}"),
                }
            }
        };

        debug!(status = action.label(), "planner decided");
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_serializes_with_status_tag() {
        let action = Action::NeedsMetadata {
            request: MetadataRequest::tables("need tables"),
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["status"], "needs_metadata");
        assert_eq!(value["request"]["kind"], "tables");

        let ready: Action =
            serde_json::from_str(r#"{"status":"ready","sql":"SELECT 1"}"#).unwrap();
        assert_eq!(
            ready,
            Action::Ready {
                sql: "SELECT 1".into(),
                explanation: String::new(),
                confidence: Confidence::Medium,
            }
        );
    }

    #[test]
    fn validate_rejects_empty_outcomes() {
        let empty_sql = Action::Ready {
            sql: "  ".into(),
            explanation: String::new(),
            confidence: Confidence::High,
        };
        assert!(matches!(empty_sql.validate(), Err(Error::Validation(_))));

        let empty_question = Action::Clarification {
            question: String::new(),
        };
        assert!(empty_question.validate().is_err());

        let schema = Action::NeedsMetadata {
            request: MetadataRequest::schema(vec!["users".into()], "columns"),
        };
        assert!(schema.validate().is_ok());

        let blank_table = Action::NeedsMetadata {
            request: MetadataRequest::schema(vec!["".into()], "columns"),
        };
        assert!(blank_table.validate().is_err());
    }

    #[test]
    fn from_config_requires_key_without_base_url() {
        let config = PlannerConfig {
            api_key: Some("sk-test".into()),
            model: Some("gpt-4o".into()),
            ..PlannerConfig::default()
        };
        let planner = LlmPlanner::from_config(&config).unwrap();
        assert_eq!(planner.model, "gpt-4o");
        assert_eq!(planner.provider().provider_id(), "openai");

        let local = PlannerConfig {
            base_url: Some("http://localhost:11434".into()),
            api_key: Some(String::new()),
            ..PlannerConfig::default()
        };
        assert!(LlmPlanner::from_config(&local).is_ok());

        let unknown = PlannerConfig {
            provider: "carrier-pigeon".into(),
            ..PlannerConfig::default()
        };
        assert!(matches!(
            LlmPlanner::from_config(&unknown),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn workspace_context_reaches_the_system_prompt() {
        let provider = Arc::new(OpenAiProvider::new("sk-test", None, None));
        let planner = LlmPlanner::new(provider);
        let workspace = WorkspaceContext {
            business_context: ["revenue excludes refunded orders".to_string()].into(),
            ..WorkspaceContext::default()
        };

        let request = planner.build_request(&[], None, Some(&workspace));
        let system = request.system.unwrap_or_default();
        assert!(system.contains("Workspace context:"));
        assert!(system.contains("revenue excludes refunded orders"));

        let plain = planner.build_request(&[], None, None);
        assert!(!plain.system.unwrap_or_default().contains("Workspace context:"));
    }
}
