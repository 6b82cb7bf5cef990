use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed planner output or invalid caller input.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("metadata request rejected: {0}")]
    Rejected(String),

    /// Auto-approval budget reached; an explicit decision is required.
    #[error("auto-approval budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// The planner asked again for metadata the cache already holds fresh.
    #[error("loop detected: {0}")]
    LoopDetected(String),

    #[error("conversation busy: {0}")]
    Busy(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable snake_case code, persisted alongside terminal failure messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Rejected(_) => "rejected",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::Execution(_) => "execution",
            Self::Timeout(_) => "timeout",
            Self::LoopDetected(_) => "loop_detected",
            Self::Busy(_) => "busy",
            Self::Cancelled(_) => "cancelled",
            Self::Config(_) => "config",
            Self::Database(_) => "database",
            Self::Agent(_) => "agent",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(Error::LoopDetected("x".into()).kind(), "loop_detected");
        assert_eq!(Error::Rejected("x".into()).kind(), "rejected");
        assert_eq!(Error::Execution("x".into()).kind(), "execution");
    }

    #[test]
    fn display_keeps_original_message() {
        let err = Error::Execution(r#"relation "usr" does not exist"#.into());
        assert_eq!(
            err.to_string(),
            r#"execution error: relation "usr" does not exist"#
        );
    }
}
