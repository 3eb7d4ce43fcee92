//! Flow metrics collection and aggregation.

use serde::{Deserialize, Serialize};

/// Aggregated execution statistics for a flow and everything nested in it.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMetrics {
    /// Steps that completed with every unit succeeding.
    pub steps_completed: usize,
    /// Units that settled successfully.
    pub units_completed: usize,
    /// Retries performed by retry decorators.
    pub retries: usize,
    /// Flows that were cancelled.
    pub cancellations: usize,
    /// Collected failure messages.
    pub failures: Vec<String>,
}

impl FlowMetrics {
    /// Increment the steps completed counter.
    pub fn record_step(&mut self) {
        self.steps_completed += 1;
    }

    /// Increment the units completed counter.
    pub fn record_unit(&mut self) {
        self.units_completed += 1;
    }

    /// Increment the retry counter.
    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    /// Increment the cancellation counter.
    pub fn record_cancel(&mut self) {
        self.cancellations += 1;
    }

    /// Record a failure message.
    pub fn record_failure(&mut self, error: String) {
        self.failures.push(error);
    }

    /// Check if there were any failures.
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}
