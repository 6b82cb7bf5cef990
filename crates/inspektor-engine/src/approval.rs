use inspektor_config::HARD_AUTO_APPROVE_CAP;
use serde::{Deserialize, Serialize};

/// Per-conversation auto-approval budget.
///
/// `used` only grows for the lifetime of a conversation and never passes
/// `bound`; `bound` never passes [`HARD_AUTO_APPROVE_CAP`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoApprovalState {
    pub enabled: bool,
    pub bound: u32,
    pub used: u32,
}

impl AutoApprovalState {
    pub fn new(enabled: bool, bound: u32) -> Self {
        Self {
            enabled,
            bound: bound.min(HARD_AUTO_APPROVE_CAP),
            used: 0,
        }
    }

    /// Change the mode. A lowered bound stops at what was already spent.
    pub fn configure(&mut self, enabled: bool, bound: Option<u32>) {
        self.enabled = enabled;
        if let Some(bound) = bound {
            self.bound = bound.min(HARD_AUTO_APPROVE_CAP).max(self.used);
        }
    }

    /// Spend one auto-approval if the mode is on and budget remains.
    pub fn try_consume(&mut self) -> bool {
        if self.enabled && self.used < self.bound {
            self.used += 1;
            true
        } else {
            false
        }
    }

    /// Auto-mode is on but nothing is left to spend.
    pub fn exhausted(&self) -> bool {
        self.enabled && self.used >= self.bound
    }

    pub fn remaining(&self) -> u32 {
        self.bound.saturating_sub(self.used)
    }
}
