pub mod openai;
pub mod planner;
pub mod prompt;
pub mod providers;
pub mod tools;

pub use openai::OpenAiProvider;
pub use planner::{Action, LlmPlanner, Planner};
pub use providers::{LlmProvider, LlmRequest, LlmResponse, ToolChoice};
