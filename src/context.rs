//! Shared execution context for flow runs.
//!
//! An [`ExecutionContext`] is shared by an engine, the engines it nests and
//! the private engines of its retry decorators, so metrics and traces
//! aggregate across the whole composition.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::events::{FlowEvent, TraceEntry};
use crate::metrics::FlowMetrics;

/// Context shared by every engine of one composition.
///
/// Cloning is cheap and every clone observes the same metrics and trace.
///
/// # Example
///
/// ```rust
/// use reqflow::{ExecutionContext, FlowEvent};
///
/// let ctx = ExecutionContext::new();
/// ctx.emit(FlowEvent::Paused { flow: "checkout".to_string() });
/// assert_eq!(ctx.trace_snapshot().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    metrics: Arc<Mutex<FlowMetrics>>,
    traces: Arc<Mutex<Vec<TraceEntry>>>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ExecutionContext {
    /// Create a new execution context with empty metrics and traces.
    #[must_use]
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(Mutex::new(FlowMetrics::default())),
            traces: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Apply an update to the shared metrics.
    pub fn record(&self, f: impl FnOnce(&mut FlowMetrics)) {
        f(&mut lock(&self.metrics));
    }

    /// Get a snapshot of the current metrics.
    #[must_use]
    pub fn snapshot(&self) -> FlowMetrics {
        lock(&self.metrics).clone()
    }

    /// Emit a structured flow event to the trace log.
    pub fn emit(&self, event: FlowEvent) {
        lock(&self.traces).push(TraceEntry::new(event));
    }

    /// Get a snapshot of the current trace log.
    #[must_use]
    pub fn trace_snapshot(&self) -> Vec<TraceEntry> {
        lock(&self.traces).clone()
    }

    /// Export the trace log as a JSON array, e.g. for attaching to a bug report.
    pub fn trace_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(&*lock(&self.traces))
    }

    /// Clear all trace entries.
    pub fn clear_traces(&self) {
        lock(&self.traces).clear();
    }
}
