//! Flow blueprints and the builder surface.

use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::unit::nested::FlowUnit;
use crate::unit::switch::{MissingBranch, Selector};
use crate::unit::SharedUnit;
use crate::{ExecutionContext, FlowEngine, History, Response, Unit};

pub(crate) type StepListener = Arc<dyn Fn(&FlowEngine, &[Response]) + Send + Sync>;
pub(crate) type SuccessListener = Arc<dyn Fn(&FlowEngine, &History) + Send + Sync>;
pub(crate) type FailureListener = Arc<dyn Fn(&FlowEngine, &Response) + Send + Sync>;
pub(crate) type StateListener = Arc<dyn Fn(&FlowEngine) + Send + Sync>;

#[derive(Clone)]
pub(crate) enum StepKind {
    Units(Vec<SharedUnit>),
    Switch(Vec<Selector>),
}

#[derive(Clone)]
pub(crate) struct StepDecl {
    pub(crate) kind: StepKind,
    pub(crate) next: Option<StepListener>,
}

#[derive(Clone, Default)]
pub(crate) struct Listeners {
    pub(crate) step: Option<StepListener>,
    pub(crate) success: Option<SuccessListener>,
    pub(crate) failure: Option<FailureListener>,
    pub(crate) cancel: Option<StateListener>,
    pub(crate) pause: Option<StateListener>,
    pub(crate) resume: Option<StateListener>,
}

/// A reusable description of a flow: its steps, listeners and settings.
///
/// A `Flow` is built fluently and turned into a single-use [`FlowEngine`]
/// with [`build`](Self::build). Because it is cheap to clone, the same
/// blueprint can be built any number of times, nested inside other flows or
/// spliced into them.
///
/// # Example
///
/// ```rust
/// use reqflow::{Flow, FlowState, FnUnit, UnitExt};
///
/// let engine = Flow::new()
///     .with_name("greeting")
///     .then(FnUnit::new(|session| session.done("hello".to_string())))
///     .then_all(vec![
///         FnUnit::new(|session| session.done(1u32)).shared(),
///         FnUnit::new(|session| session.done(2u32)).shared(),
///     ])
///     .build();
///
/// engine.start().unwrap();
/// assert_eq!(engine.state(), FlowState::Done);
/// assert_eq!(engine.last_data_list::<u32>(), vec![1, 2]);
/// ```
#[derive(Clone)]
pub struct Flow {
    pub(crate) name: String,
    pub(crate) steps: Vec<StepDecl>,
    pub(crate) listeners: Listeners,
    pub(crate) missing_branch: MissingBranch,
    pub(crate) context: Option<ExecutionContext>,
}

impl Default for Flow {
    fn default() -> Self {
        Self::new()
    }
}

impl Flow {
    /// Create an empty flow.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "flow".to_string(),
            steps: Vec::new(),
            listeners: Listeners::default(),
            missing_branch: MissingBranch::default(),
            context: None,
        }
    }

    /// Create a flow whose first step runs `units` as one fan-out group.
    pub fn from_units<I>(units: I) -> Self
    where
        I: IntoIterator<Item = SharedUnit>,
    {
        Self::new().then_all(units)
    }

    /// Copy the blueprint an engine was built from.
    pub fn from_engine(engine: &FlowEngine) -> Self {
        engine.blueprint().clone()
    }

    /// Set a human-readable name for this flow.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Choose what a switch branch does when its selector picks nothing.
    pub fn with_missing_branch(mut self, policy: MissingBranch) -> Self {
        self.missing_branch = policy;
        self
    }

    /// Share an existing context instead of creating one per engine.
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Returns the flow name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of declared steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// `true` when no step is declared.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Append a single unit as the next step.
    pub fn then<U: Unit + 'static>(self, unit: U) -> Self {
        self.then_all([Arc::new(unit) as SharedUnit])
    }

    /// Append a fan-out group as the next step.
    pub fn then_all<I>(self, units: I) -> Self
    where
        I: IntoIterator<Item = SharedUnit>,
    {
        self.push(StepKind::Units(units.into_iter().collect()))
    }

    /// Append a nested flow that runs as one opaque unit.
    ///
    /// The unit succeeds with the nested engine's [`History`] as payload.
    pub fn then_flow(self, flow: Flow) -> Self {
        self.then(FlowUnit::new(flow))
    }

    /// Append every step of `flow` after the current ones.
    ///
    /// Per-step listeners come along; the spliced flow's lifecycle listeners
    /// and settings do not.
    pub fn splice(mut self, flow: Flow) -> Self {
        self.steps.extend(flow.steps);
        self
    }

    /// Append a step whose units are picked when it starts.
    ///
    /// Each selector fills one branch position and sees the engine with its
    /// history so far. See [`MissingBranch`] for selectors returning `None`.
    pub fn switch<I>(self, selectors: I) -> Self
    where
        I: IntoIterator<Item = Selector>,
    {
        self.push(StepKind::Switch(selectors.into_iter().collect()))
    }

    /// Listen for the completion of the most recently declared step.
    ///
    /// On a flow without steps there is nothing to listen to; the listener
    /// is dropped with a warning.
    pub fn next<F>(mut self, f: F) -> Self
    where
        F: Fn(&FlowEngine, &[Response]) + Send + Sync + 'static,
    {
        match self.steps.last_mut() {
            Some(step) => step.next = Some(Arc::new(f)),
            None => warn!(flow = %self.name, "step listener ignored: flow has no steps"),
        }
        self
    }

    /// Listen for the completion of every step.
    pub fn on_step<F>(mut self, f: F) -> Self
    where
        F: Fn(&FlowEngine, &[Response]) + Send + Sync + 'static,
    {
        self.listeners.step = Some(Arc::new(f));
        self
    }

    /// Called once with the full history when every step succeeded.
    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&FlowEngine, &History) + Send + Sync + 'static,
    {
        self.listeners.success = Some(Arc::new(f));
        self
    }

    /// Called once with the failing response when a step fails.
    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&FlowEngine, &Response) + Send + Sync + 'static,
    {
        self.listeners.failure = Some(Arc::new(f));
        self
    }

    /// Called once when the engine is cancelled.
    pub fn on_cancel<F>(mut self, f: F) -> Self
    where
        F: Fn(&FlowEngine) + Send + Sync + 'static,
    {
        self.listeners.cancel = Some(Arc::new(f));
        self
    }

    /// Called each time the engine is paused.
    pub fn on_pause<F>(mut self, f: F) -> Self
    where
        F: Fn(&FlowEngine) + Send + Sync + 'static,
    {
        self.listeners.pause = Some(Arc::new(f));
        self
    }

    /// Called each time the engine is resumed.
    pub fn on_resume<F>(mut self, f: F) -> Self
    where
        F: Fn(&FlowEngine) + Send + Sync + 'static,
    {
        self.listeners.resume = Some(Arc::new(f));
        self
    }

    /// Build an idle engine for this blueprint.
    pub fn build(&self) -> FlowEngine {
        let context = self.context.clone().unwrap_or_default();
        FlowEngine::new(self.clone(), context)
    }

    /// Build an engine that reports into an enclosing engine's context.
    pub(crate) fn build_within(&self, context: &ExecutionContext) -> FlowEngine {
        FlowEngine::new(self.clone(), context.clone())
    }

    fn push(mut self, kind: StepKind) -> Self {
        self.steps.push(StepDecl { kind, next: None });
        self
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("steps", &self.steps.len())
            .field("missing_branch", &self.missing_branch)
            .finish()
    }
}
