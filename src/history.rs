//! Response aggregation and typed queries.

use std::any::Any;

use crate::Response;

/// The ordered per-step response lists of a flow.
///
/// Index `n` holds the responses of the `n`th completed step, in unit
/// declaration order. Only fully successful steps are ever appended.
///
/// A [`FlowUnit`](crate::FlowUnit) delivers the history of its nested engine
/// as its payload, so nested results are reachable through
/// `data::<History>()`. The queries here do not descend into them.
#[derive(Debug, Clone, Default)]
pub struct History {
    steps: Vec<Vec<Response>>,
}

impl History {
    /// Create an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, responses: Vec<Response>) {
        self.steps.push(responses);
    }

    /// Number of completed steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// `true` when no step has completed yet.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// All completed steps.
    pub fn steps(&self) -> &[Vec<Response>] {
        &self.steps
    }

    /// The responses of step `index`.
    pub fn step(&self, index: usize) -> Option<&[Response]> {
        self.steps.get(index).map(Vec::as_slice)
    }

    /// The responses of the most recently completed step.
    pub fn last_step(&self) -> &[Response] {
        self.steps.last().map(Vec::as_slice).unwrap_or_default()
    }

    /// Every response in execution order, flattened.
    pub fn responses(&self) -> impl Iterator<Item = &Response> {
        self.steps.iter().flatten()
    }

    /// The first `T` delivered by the most recently completed step.
    pub fn last_data<T: Any>(&self) -> Option<&T> {
        self.last_step().iter().find_map(Response::data::<T>)
    }

    /// Every `T` delivered by the most recently completed step.
    pub fn last_data_list<T: Any>(&self) -> Vec<&T> {
        self.last_step().iter().filter_map(Response::data::<T>).collect()
    }

    /// Every `T` delivered across the whole history.
    pub fn data_list<T: Any>(&self) -> Vec<&T> {
        self.responses().filter_map(Response::data::<T>).collect()
    }
}
