pub mod approval;
pub mod correction;
pub mod executor;
pub mod negotiation;

pub use approval::AutoApprovalState;
pub use correction::CorrectionTracker;
pub use executor::{Executor, QueryResult};
pub use negotiation::{
    EngineOptions, EngineState, NegotiationEngine, TurnEvent, TurnOrigin, TurnOutcome,
};
