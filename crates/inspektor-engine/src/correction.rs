//! Bookkeeping for the execution-failure correction loop.

use std::collections::HashMap;

/// Consecutive execution failures per original intent.
#[derive(Debug, Default, Clone)]
pub struct CorrectionTracker {
    failures: HashMap<String, u32>,
}

impl CorrectionTracker {
    /// Count one more failure for `intent` and return the new streak length.
    pub fn record_failure(&mut self, intent: &str) -> u32 {
        let count = self.failures.entry(intent.trim().to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Set the streak for `intent` from a persisted failure record.
    pub fn restore(&mut self, intent: &str, count: u32) {
        if count == 0 {
            self.reset(intent);
        } else {
            self.failures.insert(intent.trim().to_string(), count);
        }
    }

    pub fn reset(&mut self, intent: &str) {
        self.failures.remove(intent.trim());
    }

    pub fn failures(&self, intent: &str) -> u32 {
        self.failures.get(intent.trim()).copied().unwrap_or(0)
    }
}

/// System message text recorded for a failed statement. The error is kept verbatim.
pub fn failure_message(sql: &str, error: &str) -> String {
    format!("SQL execution failed: {error}\nFailed SQL:\n{sql}")
}

/// Terminal message once the correction budget for an intent is spent.
pub fn exhausted_message(attempts: u32, sql: &str, error: &str) -> String {
    format!(
        "Query still failing after {attempts} attempts, giving up: {error}\nLast SQL:\n{sql}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streak_is_per_intent() {
        let mut tracker = CorrectionTracker::default();
        assert_eq!(tracker.record_failure("count users"), 1);
        assert_eq!(tracker.record_failure("count users"), 2);
        assert_eq!(tracker.record_failure("list orders"), 1);
        assert_eq!(tracker.failures("count users"), 2);

        tracker.reset("count users");
        assert_eq!(tracker.failures("count users"), 0);
        assert_eq!(tracker.failures("list orders"), 1);
    }

    #[test]
    fn restored_streak_continues_counting() {
        let mut tracker = CorrectionTracker::default();
        tracker.restore(" count users ", 2);
        assert_eq!(tracker.record_failure("count users"), 3);
        tracker.restore("count users", 0);
        assert_eq!(tracker.failures("count users"), 0);
    }

    #[test]
    fn messages_keep_error_and_sql_verbatim() {
        let error = "relation \"usr\" does not exist";
        let sql = "SELECT * FROM usr";
        let recorded = failure_message(sql, error);
        assert!(recorded.contains(error));
        assert!(recorded.contains(sql));

        let terminal = exhausted_message(3, sql, error);
        assert!(terminal.contains(error));
        assert!(terminal.contains(sql));
    }
}
