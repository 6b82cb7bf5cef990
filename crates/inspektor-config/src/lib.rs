pub mod loader;
pub mod model;

pub use loader::ConfigLoader;
pub use model::{AppConfig, CacheConfig, NegotiationConfig, PlannerConfig, HARD_AUTO_APPROVE_CAP};
