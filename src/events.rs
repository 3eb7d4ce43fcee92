//! Structured flow execution events for tracing and observability.
//!
//! Every engine records these into its [`ExecutionContext`](crate::ExecutionContext)
//! trace, so a host can inspect exactly how a flow progressed.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Events emitted while a flow executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum FlowEvent {
    /// The engine left `Idle`.
    FlowStart {
        /// Name of the flow.
        flow: String,
        /// Number of declared steps.
        steps: usize,
    },
    /// A step dispatched its fan-out group.
    StepStart {
        /// Name of the flow.
        flow: String,
        /// Step position.
        step: usize,
        /// Number of units in the step.
        units: usize,
    },
    /// Every unit of a step succeeded.
    StepEnd {
        /// Name of the flow.
        flow: String,
        /// Step position.
        step: usize,
        /// Time from dispatch to join, in milliseconds.
        duration_ms: u128,
    },
    /// A unit failed, failing its step and the flow.
    UnitFailed {
        /// Name of the flow.
        flow: String,
        /// Step position.
        step: usize,
        /// Unit position inside the step.
        unit: usize,
        /// Error message.
        message: String,
    },
    /// A retry decorator is about to re-run its unit.
    Retry {
        /// Name of the decorated unit.
        unit: String,
        /// Retry number, starting at 1.
        attempt: u32,
    },
    /// The engine was paused.
    Paused {
        /// Name of the flow.
        flow: String,
    },
    /// The engine was resumed.
    Resumed {
        /// Name of the flow.
        flow: String,
    },
    /// The engine was cancelled.
    Cancelled {
        /// Name of the flow.
        flow: String,
    },
    /// The engine reached `Done` or `Failed`.
    FlowEnd {
        /// Name of the flow.
        flow: String,
        /// Whether every step succeeded.
        success: bool,
    },
}

/// A timestamped trace entry containing a flow event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Unix epoch timestamp in milliseconds when this event occurred.
    pub timestamp: u128,
    /// The recorded event.
    #[serde(flatten)]
    pub event: FlowEvent,
}

impl TraceEntry {
    /// Create a new trace entry with the current timestamp.
    #[must_use]
    pub fn new(event: FlowEvent) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self { timestamp, event }
    }
}
