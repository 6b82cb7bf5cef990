use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Auto-approval can never be configured past this many requests per conversation.
pub const HARD_AUTO_APPROVE_CAP: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub planner: PlannerConfig,

    #[serde(default)]
    pub negotiation: NegotiationConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            planner: PlannerConfig::default(),
            negotiation: NegotiationConfig::default(),
            cache: CacheConfig::default(),
            data_dir: None,
            log_level: Some("info".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "default_provider")]
    pub provider: String,

    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub temperature: f64,

    /// Most recent messages handed to the planner per call.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: 0.0,
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationConfig {
    #[serde(default)]
    pub auto_approve: bool,

    #[serde(default = "default_auto_approve_bound")]
    pub auto_approve_bound: u32,

    #[serde(default = "default_max_correction_attempts")]
    pub max_correction_attempts: u32,

    #[serde(default = "default_planner_timeout_secs")]
    pub planner_timeout_secs: u64,

    #[serde(default = "default_executor_timeout_secs")]
    pub executor_timeout_secs: u64,

    /// Planning rounds allowed in a single driven turn.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

impl NegotiationConfig {
    /// Configured bound clamped to the hard cap.
    pub fn effective_auto_approve_bound(&self) -> u32 {
        self.auto_approve_bound.min(HARD_AUTO_APPROVE_CAP)
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            auto_approve: false,
            auto_approve_bound: default_auto_approve_bound(),
            max_correction_attempts: default_max_correction_attempts(),
            planner_timeout_secs: default_planner_timeout_secs(),
            executor_timeout_secs: default_executor_timeout_secs(),
            max_rounds: default_max_rounds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_history_limit() -> usize {
    20
}

fn default_auto_approve_bound() -> u32 {
    5
}

fn default_max_correction_attempts() -> u32 {
    3
}

fn default_planner_timeout_secs() -> u64 {
    60
}

fn default_executor_timeout_secs() -> u64 {
    30
}

fn default_max_rounds() -> u32 {
    25
}

fn default_ttl_hours() -> u64 {
    24
}
