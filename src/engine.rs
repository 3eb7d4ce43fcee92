//! The flow engine state machine.
//!
//! A [`FlowEngine`] executes the steps of a [`Flow`] in order. Every unit of
//! a step gets its own [`Session`]; the step joins once all of them report
//! success, and fails as soon as any of them reports failure.
//!
//! All mutable state lives behind one mutex. Listeners, hooks and unit calls
//! always run with the lock released, so they may freely call back into the
//! engine.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::lock;
use crate::flow::StepKind;
use crate::session::StepScope;
use crate::unit::switch;
use crate::unit::SharedUnit;
use crate::{
    Error, ExecutionContext, Flow, FlowEvent, FlowMetrics, History, Payload, Response,
    ResponseId, Result, Session,
};

/// Lifecycle states of an engine.
///
/// `Done`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowState {
    /// Built but not started.
    Idle,
    /// Executing steps.
    Running,
    /// In-flight units continue; no new step starts until resumed.
    Paused,
    /// Every step succeeded.
    Done,
    /// A unit failed.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl FlowState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, FlowState::Done | FlowState::Failed | FlowState::Cancelled)
    }

    fn is_live(self) -> bool {
        matches!(self, FlowState::Running | FlowState::Paused)
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowState::Idle => "idle",
            FlowState::Running => "running",
            FlowState::Paused => "paused",
            FlowState::Done => "done",
            FlowState::Failed => "failed",
            FlowState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// How an engine ended, as seen by internal watchers.
#[derive(Debug, Clone)]
pub(crate) enum Settled {
    Done(History),
    Failed(Response),
    Cancelled,
}

impl Settled {
    pub(crate) fn into_result(self) -> Result<History> {
        match self {
            Settled::Done(history) => Ok(history),
            Settled::Failed(response) => Err(response
                .error()
                .cloned()
                .unwrap_or_else(|| Error::Execution("flow failed".to_string()))),
            Settled::Cancelled => Err(Error::Cancelled),
        }
    }
}

type Watcher = Box<dyn FnOnce(&Settled) + Send>;

struct ActiveStep {
    scope: Arc<StepScope>,
    slots: Vec<Option<Response>>,
    remaining: usize,
    started: Instant,
}

struct EngineState {
    status: FlowState,
    cursor: usize,
    history: History,
    active: Option<ActiveStep>,
    /// The current step finished while paused; resuming must launch the next.
    parked: bool,
    /// Some call is already looping in `advance`; others hand work to it.
    driving: bool,
    /// A step joined while `driving`; the driver must advance once more.
    rerun: bool,
    /// Branches resolved for the step at the cursor before a pause won.
    prepared: Option<Vec<SharedUnit>>,
    failure: Option<Response>,
    watchers: Vec<Watcher>,
}

impl EngineState {
    fn accepts(&self, scope: &Arc<StepScope>) -> bool {
        self.status.is_live()
            && !scope.is_closed()
            && self
                .active
                .as_ref()
                .is_some_and(|active| Arc::ptr_eq(&active.scope, scope))
    }

    fn settled(&self) -> Option<Settled> {
        match self.status {
            FlowState::Done => Some(Settled::Done(self.history.clone())),
            FlowState::Failed => self.failure.clone().map(Settled::Failed),
            FlowState::Cancelled => Some(Settled::Cancelled),
            _ => None,
        }
    }
}

struct EngineInner {
    flow: Flow,
    context: ExecutionContext,
    state: Mutex<EngineState>,
}

enum Next {
    Launch(usize),
    Finish(History),
    Wait,
}

/// A single run of a [`Flow`].
///
/// `FlowEngine` is a cheap, cloneable handle: units receive it through their
/// session, listeners receive it as an argument, and the host keeps one to
/// drive `pause`, `resume` and `cancel`. An engine runs at most once; use
/// [`rebuild`](Self::rebuild) for a fresh run of the same blueprint.
#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

impl FlowEngine {
    pub(crate) fn new(flow: Flow, context: ExecutionContext) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                flow,
                context,
                state: Mutex::new(EngineState {
                    status: FlowState::Idle,
                    cursor: 0,
                    history: History::new(),
                    active: None,
                    parked: false,
                    driving: false,
                    rerun: false,
                    prepared: None,
                    failure: None,
                    watchers: Vec::new(),
                }),
            }),
        }
    }

    /// Returns the flow name.
    pub fn name(&self) -> &str {
        &self.inner.flow.name
    }

    /// The blueprint this engine was built from.
    pub fn blueprint(&self) -> &Flow {
        &self.inner.flow
    }

    /// The context collecting metrics and traces for this engine.
    pub fn context(&self) -> &ExecutionContext {
        &self.inner.context
    }

    /// A snapshot of the shared metrics.
    pub fn metrics(&self) -> FlowMetrics {
        self.inner.context.snapshot()
    }

    /// A fresh idle engine for the same blueprint.
    pub fn rebuild(&self) -> FlowEngine {
        self.inner.flow.build()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> FlowState {
        lock(&self.inner.state).status
    }

    /// Index of the step currently running, or next to run.
    pub fn cursor(&self) -> usize {
        lock(&self.inner.state).cursor
    }

    /// Start executing the first step.
    ///
    /// Only valid on an idle engine; otherwise nothing happens and
    /// [`Error::InvalidTransition`] is returned.
    pub fn start(&self) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if state.status != FlowState::Idle {
                return Err(Error::InvalidTransition {
                    op: "start",
                    state: state.status,
                });
            }
            state.status = FlowState::Running;
        }
        info!(flow = %self.name(), steps = self.inner.flow.steps.len(), "flow started");
        self.inner.context.emit(FlowEvent::FlowStart {
            flow: self.name().to_string(),
            steps: self.inner.flow.steps.len(),
        });
        self.advance();
        Ok(())
    }

    /// Stop starting new steps. Units already dispatched keep running.
    pub fn pause(&self) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            if state.status != FlowState::Running {
                return Err(Error::InvalidTransition {
                    op: "pause",
                    state: state.status,
                });
            }
            state.status = FlowState::Paused;
        }
        debug!(flow = %self.name(), "flow paused");
        self.inner.context.emit(FlowEvent::Paused {
            flow: self.name().to_string(),
        });
        if let Some(listener) = &self.inner.flow.listeners.pause {
            listener(self);
        }
        Ok(())
    }

    /// Continue after [`pause`](Self::pause).
    ///
    /// If the current step finished while paused, the next step starts
    /// immediately.
    pub fn resume(&self) -> Result<()> {
        let launch = {
            let mut state = lock(&self.inner.state);
            if state.status != FlowState::Paused {
                return Err(Error::InvalidTransition {
                    op: "resume",
                    state: state.status,
                });
            }
            state.status = FlowState::Running;
            std::mem::take(&mut state.parked)
        };
        debug!(flow = %self.name(), launch, "flow resumed");
        self.inner.context.emit(FlowEvent::Resumed {
            flow: self.name().to_string(),
        });
        if let Some(listener) = &self.inner.flow.listeners.resume {
            listener(self);
        }
        if launch {
            self.advance();
        }
        Ok(())
    }

    /// Cancel the flow.
    ///
    /// Sessions of the current step, and of any engines nested in it, become
    /// inert. Responses already in the history stay there.
    pub fn cancel(&self) -> Result<()> {
        let (children, watchers) = {
            let mut state = lock(&self.inner.state);
            if state.status.is_terminal() {
                return Err(Error::InvalidTransition {
                    op: "cancel",
                    state: state.status,
                });
            }
            state.status = FlowState::Cancelled;
            state.parked = false;
            let children = state
                .active
                .take()
                .map(|active| active.scope.close())
                .unwrap_or_default();
            (children, std::mem::take(&mut state.watchers))
        };
        for child in children {
            let _ = child.cancel();
        }
        info!(flow = %self.name(), "flow cancelled");
        self.inner.context.record(FlowMetrics::record_cancel);
        self.inner.context.emit(FlowEvent::Cancelled {
            flow: self.name().to_string(),
        });
        if let Some(listener) = &self.inner.flow.listeners.cancel {
            listener(self);
        }
        Self::notify(watchers, &Settled::Cancelled);
        Ok(())
    }

    /// Start the engine and wait until it settles.
    ///
    /// Resolves to the full history on success, the failing unit's error on
    /// failure, and [`Error::Cancelled`] after cancellation.
    ///
    /// # Example
    ///
    /// ```rust
    /// use reqflow::{Flow, LambdaUnit};
    ///
    /// # tokio_test::block_on(async {
    /// let engine = Flow::new()
    ///     .then(LambdaUnit::new(|_session| async { Ok::<_, reqflow::Error>(6 * 7) }))
    ///     .build();
    ///
    /// let history = engine.run().await.unwrap();
    /// assert_eq!(history.last_data::<i32>(), Some(&42));
    /// # });
    /// ```
    pub async fn run(self) -> Result<History> {
        let (tx, rx) = futures::channel::oneshot::channel();
        self.on_settled(move |settled| {
            let _ = tx.send(settled.clone().into_result());
        });
        self.start()?;
        rx.await.unwrap_or(Err(Error::Cancelled))
    }

    /// A snapshot of the responses of every completed step.
    pub fn history(&self) -> History {
        lock(&self.inner.state).history.clone()
    }

    /// The responses of the most recently completed step.
    pub fn last_step(&self) -> Vec<Response> {
        lock(&self.inner.state).history.last_step().to_vec()
    }

    /// The first `T` delivered by the most recently completed step.
    pub fn last_data<T: Any + Clone>(&self) -> Option<T> {
        lock(&self.inner.state).history.last_data::<T>().cloned()
    }

    /// Every `T` delivered by the most recently completed step.
    pub fn last_data_list<T: Any + Clone>(&self) -> Vec<T> {
        let state = lock(&self.inner.state);
        state.history.last_data_list::<T>().into_iter().cloned().collect()
    }

    /// Every `T` delivered across the whole history.
    pub fn data_list<T: Any + Clone>(&self) -> Vec<T> {
        let state = lock(&self.inner.state);
        state.history.data_list::<T>().into_iter().cloned().collect()
    }

    /// Run `f` once the engine settles, or right away if it already has.
    pub(crate) fn on_settled(&self, f: impl FnOnce(&Settled) + Send + 'static) {
        let settled = {
            let mut state = lock(&self.inner.state);
            match state.settled() {
                Some(settled) => settled,
                None => {
                    state.watchers.push(Box::new(f));
                    return;
                }
            }
        };
        f(&settled);
    }

    fn notify(watchers: Vec<Watcher>, settled: &Settled) {
        for watcher in watchers {
            watcher(settled);
        }
    }

    /// Launch the step at the cursor, park, or finish the flow.
    ///
    /// Units settling inside `on_call` re-enter here through `complete`. Only
    /// the outermost call loops; nested calls set `rerun` and return, so a
    /// long run of synchronous steps uses constant stack.
    fn advance(&self) {
        {
            let mut state = lock(&self.inner.state);
            if state.driving {
                state.rerun = true;
                return;
            }
            state.driving = true;
        }
        loop {
            let next = {
                let mut state = lock(&self.inner.state);
                state.rerun = false;
                let last = state.cursor >= self.inner.flow.steps.len();
                let next = match state.status {
                    FlowState::Running | FlowState::Paused if last => {
                        state.status = FlowState::Done;
                        Next::Finish(state.history.clone())
                    }
                    FlowState::Running => Next::Launch(state.cursor),
                    FlowState::Paused => {
                        state.parked = true;
                        Next::Wait
                    }
                    _ => Next::Wait,
                };
                if !matches!(next, Next::Launch(_)) {
                    state.driving = false;
                }
                next
            };
            match next {
                Next::Launch(index) => self.launch(index),
                Next::Finish(history) => return self.finish(history),
                Next::Wait => return,
            }
            let mut state = lock(&self.inner.state);
            if !state.rerun {
                state.driving = false;
                return;
            }
        }
    }

    fn launch(&self, index: usize) {
        let prepared = {
            let mut state = lock(&self.inner.state);
            match state.status {
                FlowState::Running => {}
                FlowState::Paused => {
                    state.parked = true;
                    return;
                }
                _ => return,
            }
            state.prepared.take()
        };
        let units: Vec<SharedUnit> = match (prepared, &self.inner.flow.steps[index].kind) {
            (Some(units), _) => units,
            (None, StepKind::Units(units)) => units.clone(),
            (None, StepKind::Switch(selectors)) => {
                switch::resolve(selectors, self, self.inner.flow.missing_branch)
            }
        };

        let scope = Arc::new(StepScope::new());
        {
            let mut state = lock(&self.inner.state);
            match state.status {
                FlowState::Running => {}
                FlowState::Paused => {
                    state.parked = true;
                    state.prepared = Some(units);
                    return;
                }
                _ => return,
            }
            state.cursor = index;
            state.active = Some(ActiveStep {
                scope: Arc::clone(&scope),
                slots: vec![None; units.len()],
                remaining: units.len(),
                started: Instant::now(),
            });
        }

        debug!(flow = %self.name(), step = index, units = units.len(), "step started");
        self.inner.context.emit(FlowEvent::StepStart {
            flow: self.name().to_string(),
            step: index,
            units: units.len(),
        });

        if units.is_empty() {
            self.complete(&scope);
            return;
        }
        for (position, unit) in units.into_iter().enumerate() {
            if scope.is_closed() {
                break;
            }
            let session = Session::new(
                self.clone(),
                Arc::clone(&scope),
                index,
                position,
                Arc::clone(&unit),
            );
            unit.on_call(session);
        }
    }

    /// Entry point for every `done`/`fail` reported through a session.
    pub(crate) fn settle(&self, session: &Session, outcome: std::result::Result<Payload, Error>) {
        let unit = Arc::clone(session.own_unit());
        let outcome = outcome.and_then(|payload| match unit.expected_type() {
            Some(expected) if !expected.matches(&payload) => Err(Error::TypeMismatch {
                expected: expected.name(),
                actual: payload.type_name(),
            }),
            _ => Ok(payload),
        });
        let id = ResponseId {
            session: session.id(),
            step: session.step(),
            unit: session.index(),
        };

        let payload = match outcome {
            Ok(payload) => payload,
            Err(error) => return self.fail(session, Response::failure(id, error)),
        };

        {
            let mut state = lock(&self.inner.state);
            if !state.accepts(session.scope()) {
                debug!(flow = %self.name(), session = id.session, "late completion ignored");
                return;
            }
            if let Some(active) = state.active.as_mut() {
                active.slots[id.unit] = Some(Response::success(id, payload.clone()));
            }
        }
        self.inner.context.record(FlowMetrics::record_unit);
        unit.on_next(session, &payload);

        let joined = {
            let mut state = lock(&self.inner.state);
            if !state.accepts(session.scope()) {
                return;
            }
            match state.active.as_mut() {
                Some(active) => {
                    active.remaining -= 1;
                    active.remaining == 0
                }
                None => false,
            }
        };
        if joined {
            self.complete(session.scope());
        }
    }

    /// Commit a joined step to the history and move on.
    fn complete(&self, scope: &Arc<StepScope>) {
        let (index, responses, elapsed) = {
            let mut state = lock(&self.inner.state);
            if !state.accepts(scope) {
                return;
            }
            let Some(active) = state.active.take() else {
                return;
            };
            active.scope.close();
            let responses: Vec<Response> = active.slots.into_iter().flatten().collect();
            let index = state.cursor;
            state.history.push(responses.clone());
            state.cursor += 1;
            (index, responses, active.started.elapsed())
        };

        debug!(flow = %self.name(), step = index, responses = responses.len(), "step completed");
        self.inner.context.record(FlowMetrics::record_step);
        self.inner.context.emit(FlowEvent::StepEnd {
            flow: self.name().to_string(),
            step: index,
            duration_ms: elapsed.as_millis(),
        });

        if let Some(listener) = &self.inner.flow.steps[index].next {
            listener(self, responses.as_slice());
        }
        if let Some(listener) = &self.inner.flow.listeners.step {
            listener(self, responses.as_slice());
        }
        self.advance();
    }

    fn finish(&self, history: History) {
        info!(flow = %self.name(), steps = history.len(), "flow done");
        self.inner.context.emit(FlowEvent::FlowEnd {
            flow: self.name().to_string(),
            success: true,
        });
        if let Some(listener) = &self.inner.flow.listeners.success {
            listener(self, &history);
        }
        let watchers = std::mem::take(&mut lock(&self.inner.state).watchers);
        Self::notify(watchers, &Settled::Done(history));
    }

    fn fail(&self, session: &Session, response: Response) {
        let children = {
            let mut state = lock(&self.inner.state);
            if !state.accepts(session.scope()) {
                debug!(flow = %self.name(), session = session.id(), "late failure ignored");
                return;
            }
            state.status = FlowState::Failed;
            state.failure = Some(response.clone());
            state
                .active
                .take()
                .map(|active| active.scope.close())
                .unwrap_or_default()
        };
        for child in children {
            let _ = child.cancel();
        }

        let message = response
            .error()
            .map(ToString::to_string)
            .unwrap_or_default();
        warn!(
            flow = %self.name(),
            step = session.step(),
            unit = session.index(),
            error = %message,
            "unit failed"
        );
        self.inner
            .context
            .record(|metrics| metrics.record_failure(message.clone()));
        self.inner.context.emit(FlowEvent::UnitFailed {
            flow: self.name().to_string(),
            step: session.step(),
            unit: session.index(),
            message,
        });
        self.inner.context.emit(FlowEvent::FlowEnd {
            flow: self.name().to_string(),
            success: false,
        });

        session.own_unit().on_failure(session, &response);
        if let Some(listener) = &self.inner.flow.listeners.failure {
            listener(self, &response);
        }
        let watchers = std::mem::take(&mut lock(&self.inner.state).watchers);
        Self::notify(watchers, &Settled::Failed(response));
    }
}

impl fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("FlowEngine")
            .field("name", &self.inner.flow.name)
            .field("status", &state.status)
            .field("cursor", &state.cursor)
            .field("completed_steps", &state.history.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FnUnit, LambdaUnit, UnitExt};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Units that park their session so tests decide when they settle.
    #[derive(Clone, Default)]
    struct Parked {
        sessions: Arc<Mutex<HashMap<&'static str, Session>>>,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Parked {
        fn unit(&self, label: &'static str) -> SharedUnit {
            let parked = self.clone();
            FnUnit::new(move |session| {
                parked.calls.lock().unwrap().push(label);
                parked.sessions.lock().unwrap().insert(label, session);
            })
            .named(label)
            .shared()
        }

        fn session(&self, label: &str) -> Session {
            self.sessions.lock().unwrap()[label].clone()
        }

        fn called(&self, label: &str) -> bool {
            self.calls.lock().unwrap().iter().any(|called| *called == label)
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        steps: Arc<Mutex<Vec<usize>>>,
        successes: Arc<AtomicUsize>,
        failures: Arc<Mutex<Vec<Response>>>,
        cancels: Arc<AtomicUsize>,
        pauses: Arc<AtomicUsize>,
        resumes: Arc<AtomicUsize>,
    }

    impl Recorder {
        fn attach(&self, flow: Flow) -> Flow {
            let (steps, successes, failures) = (
                Arc::clone(&self.steps),
                Arc::clone(&self.successes),
                Arc::clone(&self.failures),
            );
            let (cancels, pauses, resumes) = (
                Arc::clone(&self.cancels),
                Arc::clone(&self.pauses),
                Arc::clone(&self.resumes),
            );
            flow.on_step(move |_, responses| steps.lock().unwrap().push(responses.len()))
                .on_success(move |_, _| {
                    successes.fetch_add(1, Ordering::SeqCst);
                })
                .on_failure(move |_, response| failures.lock().unwrap().push(response.clone()))
                .on_cancel(move |_| {
                    cancels.fetch_add(1, Ordering::SeqCst);
                })
                .on_pause(move |_| {
                    pauses.fetch_add(1, Ordering::SeqCst);
                })
                .on_resume(move |_| {
                    resumes.fetch_add(1, Ordering::SeqCst);
                })
        }

        fn failure_count(&self) -> usize {
            self.failures.lock().unwrap().len()
        }
    }

    #[test]
    fn all_steps_succeed_in_declaration_order() {
        let parked = Parked::default();
        let recorder = Recorder::default();
        let engine = recorder
            .attach(
                Flow::new()
                    .then_all([parked.unit("a")])
                    .then_all([parked.unit("b"), parked.unit("c"), parked.unit("d")])
                    .then_all([parked.unit("e")]),
            )
            .build();

        engine.start().unwrap();
        assert_eq!(engine.state(), FlowState::Running);
        parked.session("a").done("a".to_string());
        assert!(parked.called("b") && parked.called("c") && parked.called("d"));

        // Settle the fan-out group in reverse order.
        parked.session("d").done("d".to_string());
        parked.session("c").done("c".to_string());
        assert!(!parked.called("e"));
        parked.session("b").done("b".to_string());
        parked.session("e").done("e".to_string());

        assert_eq!(engine.state(), FlowState::Done);
        assert_eq!(recorder.successes.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.steps.lock().unwrap(), vec![1, 3, 1]);

        let history = engine.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history.data_list::<String>(), vec!["a", "b", "c", "d", "e"]);
        let units: Vec<usize> = history.step(1).unwrap().iter().map(|r| r.id().unit).collect();
        assert_eq!(units, vec![0, 1, 2]);
    }

    #[test]
    fn failing_fan_out_unit_stops_the_flow() {
        let parked = Parked::default();
        let recorder = Recorder::default();
        let engine = recorder
            .attach(
                Flow::new()
                    .then_all([parked.unit("a")])
                    .then_all([parked.unit("b"), parked.unit("c")])
                    .then_all([parked.unit("d")]),
            )
            .build();

        engine.start().unwrap();
        parked.session("a").done(1u8);
        parked.session("b").done(2u8);
        parked.session("c").fail("c broke");

        assert_eq!(engine.state(), FlowState::Failed);
        assert!(!parked.called("d"));
        assert_eq!(engine.history().len(), 1);
        assert_eq!(recorder.failure_count(), 1);
        let failure = recorder.failures.lock().unwrap()[0].clone();
        assert_eq!(failure.error(), Some(&Error::Message("c broke".into())));
        assert_eq!(failure.id().step, 1);
        // Only the first step reached the step listener.
        assert_eq!(*recorder.steps.lock().unwrap(), vec![1]);
        assert_eq!(recorder.successes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn first_failure_wins() {
        let parked = Parked::default();
        let recorder = Recorder::default();
        let engine = recorder
            .attach(Flow::new().then_all([
                parked.unit("x"),
                parked.unit("y"),
                parked.unit("z"),
            ]))
            .build();

        engine.start().unwrap();
        parked.session("y").fail("first");
        parked.session("x").fail("second");
        parked.session("z").done(());

        assert_eq!(engine.state(), FlowState::Failed);
        assert_eq!(recorder.failure_count(), 1);
        let failure = recorder.failures.lock().unwrap()[0].clone();
        assert_eq!(failure.error(), Some(&Error::Message("first".into())));
        assert!(engine.history().is_empty());
        assert!(parked.session("z").is_inert());
    }

    #[test]
    fn terminal_session_calls_are_idempotent() {
        let parked = Parked::default();
        let recorder = Recorder::default();
        let engine = recorder
            .attach(Flow::new().then_all([parked.unit("a"), parked.unit("b")]))
            .build();

        engine.start().unwrap();
        let a = parked.session("a");
        a.done(1u32);
        a.done(2u32);
        a.clone().fail("too late");
        assert_eq!(engine.state(), FlowState::Running);

        parked.session("b").done(3u32);
        parked.session("b").done(4u32);

        assert_eq!(engine.state(), FlowState::Done);
        assert_eq!(engine.last_data_list::<u32>(), vec![1, 3]);
        assert_eq!(recorder.successes.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.steps.lock().unwrap(), vec![2]);
    }

    #[test]
    fn cancelled_sessions_are_inert() {
        let parked = Parked::default();
        let recorder = Recorder::default();
        let engine = recorder
            .attach(
                Flow::new()
                    .then_all([parked.unit("a")])
                    .then_all([parked.unit("b"), parked.unit("c")]),
            )
            .build();

        engine.start().unwrap();
        parked.session("a").done(());
        engine.cancel().unwrap();
        assert!(engine.cancel().is_err());
        assert!(engine.start().is_err());

        parked.session("b").done(());
        parked.session("c").fail("ignored");

        assert_eq!(engine.state(), FlowState::Cancelled);
        assert_eq!(engine.history().len(), 1);
        assert_eq!(recorder.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.failure_count(), 0);
        assert_eq!(recorder.successes.load(Ordering::SeqCst), 0);
        assert_eq!(*recorder.steps.lock().unwrap(), vec![1]);
        assert_eq!(engine.metrics().cancellations, 1);
    }

    #[test]
    fn cancel_from_idle_prevents_start() {
        let recorder = Recorder::default();
        let engine = recorder.attach(Flow::new().then(FnUnit::new(|s| s.done(())))).build();
        engine.cancel().unwrap();
        assert_eq!(
            engine.start(),
            Err(Error::InvalidTransition {
                op: "start",
                state: FlowState::Cancelled,
            })
        );
        assert_eq!(recorder.cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pause_gates_the_next_step() {
        let parked = Parked::default();
        let recorder = Recorder::default();
        let engine = recorder
            .attach(
                Flow::new()
                    .then_all([parked.unit("a"), parked.unit("b")])
                    .then_all([parked.unit("c")]),
            )
            .build();

        engine.start().unwrap();
        engine.pause().unwrap();
        assert!(engine.pause().is_err());
        assert_eq!(recorder.pauses.load(Ordering::SeqCst), 1);

        // In-flight units still complete while paused.
        parked.session("a").done(());
        parked.session("b").done(());
        assert_eq!(engine.history().len(), 1);
        assert!(!parked.called("c"));
        assert_eq!(engine.state(), FlowState::Paused);

        engine.resume().unwrap();
        assert_eq!(recorder.resumes.load(Ordering::SeqCst), 1);
        assert!(parked.called("c"));
        assert_eq!(engine.cursor(), 1);

        parked.session("c").done(());
        assert_eq!(engine.state(), FlowState::Done);
    }

    #[test]
    fn resume_before_step_finishes_just_waits() {
        let parked = Parked::default();
        let engine = Flow::new()
            .then_all([parked.unit("a")])
            .then_all([parked.unit("b")])
            .build();

        engine.start().unwrap();
        engine.pause().unwrap();
        engine.resume().unwrap();
        assert!(!parked.called("b"));
        parked.session("a").done(());
        assert!(parked.called("b"));
    }

    #[test]
    fn last_step_finishing_while_paused_completes_the_flow() {
        let parked = Parked::default();
        let engine = Flow::new().then_all([parked.unit("a")]).build();
        engine.start().unwrap();
        engine.pause().unwrap();
        parked.session("a").done(());
        assert_eq!(engine.state(), FlowState::Done);
        assert!(engine.resume().is_err());
    }

    #[test]
    fn declared_type_mismatch_fails_the_flow() {
        let recorder = Recorder::default();
        let engine = recorder
            .attach(Flow::new().then(FnUnit::new(|session| session.done("oops")).expecting::<i32>()))
            .build();

        engine.start().unwrap();

        assert_eq!(engine.state(), FlowState::Failed);
        let failure = recorder.failures.lock().unwrap()[0].clone();
        assert_eq!(
            failure.error(),
            Some(&Error::TypeMismatch {
                expected: "i32",
                actual: "&str",
            })
        );
    }

    #[test]
    fn hooks_run_before_step_completion_and_propagation() {
        let order: Arc<Mutex<Vec<String>>> = Arc::default();
        let (o1, o2, o3, o4) = (
            Arc::clone(&order),
            Arc::clone(&order),
            Arc::clone(&order),
            Arc::clone(&order),
        );
        let engine = Flow::new()
            .then(
                FnUnit::new(|session| session.done(1u8))
                    .with_on_next(move |_, data| {
                        o1.lock().unwrap().push(format!("next {}", data.type_name()))
                    }),
            )
            .next(move |_, _| o2.lock().unwrap().push("step".to_string()))
            .then(
                FnUnit::new(|session| session.fail("bad"))
                    .with_on_failure(move |_, _| o3.lock().unwrap().push("hook".to_string())),
            )
            .on_failure(move |_, _| o4.lock().unwrap().push("failed".to_string()))
            .build();

        engine.start().unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["next u8", "step", "hook", "failed"]);
    }

    #[test]
    fn empty_steps_and_empty_flows_complete() {
        let engine = Flow::new().build();
        engine.start().unwrap();
        assert_eq!(engine.state(), FlowState::Done);

        let engine = Flow::new().then_all(Vec::new()).build();
        engine.start().unwrap();
        assert_eq!(engine.state(), FlowState::Done);
        assert_eq!(engine.history().len(), 1);
    }

    #[test]
    fn splice_appends_steps_and_rebuild_starts_fresh() {
        let tail = Flow::new()
            .then(FnUnit::new(|session| session.done(2u16)))
            .then(FnUnit::new(|session| session.done(3u16)));
        let flow = Flow::new()
            .then(FnUnit::new(|session| session.done(1u16)))
            .splice(tail);
        assert_eq!(flow.len(), 3);

        let engine = flow.build();
        engine.start().unwrap();
        assert_eq!(engine.data_list::<u16>(), vec![1, 2, 3]);
        assert!(engine.start().is_err());

        let again = engine.rebuild();
        assert_eq!(again.state(), FlowState::Idle);
        assert!(again.history().is_empty());
        again.start().unwrap();
        assert_eq!(again.history().len(), 3);
        assert_eq!(Flow::from_engine(&again).len(), 3);
    }

    #[test]
    fn completion_listener_can_chain_a_new_engine() {
        let second: Arc<Mutex<Option<FlowEngine>>> = Arc::default();
        let slot = Arc::clone(&second);
        let engine = Flow::new()
            .then(FnUnit::new(|session| session.done("flow 1".to_string())))
            .on_success(move |_, _| {
                let next = Flow::new()
                    .with_name("flow 2")
                    .then(FnUnit::new(|session| session.done("flow 2".to_string())))
                    .build();
                next.start().unwrap();
                *slot.lock().unwrap() = Some(next);
            })
            .build();

        engine.start().unwrap();

        let next = second.lock().unwrap().clone().unwrap();
        assert_eq!(next.state(), FlowState::Done);
        assert_eq!(next.last_data::<String>(), Some("flow 2".to_string()));
    }

    #[test]
    fn listener_can_cancel_between_steps() {
        let parked = Parked::default();
        let engine = Flow::new()
            .then(FnUnit::new(|session| session.done(())))
            .next(|engine, _| {
                engine.cancel().unwrap();
            })
            .then_all([parked.unit("never")])
            .build();

        engine.start().unwrap();
        assert_eq!(engine.state(), FlowState::Cancelled);
        assert!(!parked.called("never"));
        assert_eq!(engine.history().len(), 1);
    }

    #[test]
    fn trace_records_lifecycle() {
        let engine = Flow::new()
            .with_name("traced")
            .then(FnUnit::new(|session| session.done(())))
            .build();
        engine.start().unwrap();

        let events: Vec<FlowEvent> = engine
            .context()
            .trace_snapshot()
            .into_iter()
            .map(|entry| entry.event)
            .collect();
        assert!(matches!(events.first(), Some(FlowEvent::FlowStart { steps: 1, .. })));
        assert!(matches!(events.last(), Some(FlowEvent::FlowEnd { success: true, .. })));
        assert_eq!(engine.metrics().steps_completed, 1);
        assert_eq!(engine.metrics().units_completed, 1);
    }

    #[test]
    fn long_synchronous_flows_do_not_grow_the_stack() {
        let flow = (0..10_000).fold(Flow::new(), |flow, _| {
            flow.then(FnUnit::new(|session| session.done(1u8)))
        });
        let engine = flow.build();

        engine.start().unwrap();

        assert_eq!(engine.state(), FlowState::Done);
        assert_eq!(engine.history().len(), 10_000);
        assert_eq!(engine.data_list::<u8>().len(), 10_000);
        assert_eq!(engine.metrics().steps_completed, 10_000);
    }

    #[test]
    fn cancel_while_paused_with_step_in_flight() {
        let parked = Parked::default();
        let recorder = Recorder::default();
        let engine = recorder
            .attach(
                Flow::new()
                    .then_all([parked.unit("a")])
                    .then_all([parked.unit("b")]),
            )
            .build();

        engine.start().unwrap();
        engine.pause().unwrap();
        engine.cancel().unwrap();

        assert_eq!(engine.state(), FlowState::Cancelled);
        assert!(parked.session("a").is_inert());
        parked.session("a").done(());
        assert!(engine.resume().is_err());

        assert!(!parked.called("b"));
        assert!(engine.history().is_empty());
        assert_eq!(recorder.cancels.load(Ordering::SeqCst), 1);
        assert!(recorder.steps.lock().unwrap().is_empty());
    }

    #[test]
    fn cancel_while_paused_after_step_joined() {
        let parked = Parked::default();
        let recorder = Recorder::default();
        let engine = recorder
            .attach(
                Flow::new()
                    .then_all([parked.unit("a")])
                    .then_all([parked.unit("b")]),
            )
            .build();

        engine.start().unwrap();
        engine.pause().unwrap();
        parked.session("a").done(());
        engine.cancel().unwrap();

        assert_eq!(
            engine.resume(),
            Err(Error::InvalidTransition {
                op: "resume",
                state: FlowState::Cancelled,
            })
        );
        assert!(!parked.called("b"));
        assert_eq!(engine.history().len(), 1);
        assert_eq!(recorder.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.successes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn selectors_run_once_when_one_pauses_the_engine() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let engine = Flow::new()
            .switch([crate::select(move |engine| {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    engine.pause().unwrap();
                }
                Some(FnUnit::new(|session| session.done(9u8)).shared())
            })])
            .build();

        engine.start().unwrap();
        assert_eq!(engine.state(), FlowState::Paused);
        assert!(engine.history().is_empty());

        engine.resume().unwrap();

        assert_eq!(engine.state(), FlowState::Done);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.last_data::<u8>(), Some(9));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_fan_out_joins() {
        let units: Vec<SharedUnit> = (0..32u64)
            .map(|i| {
                LambdaUnit::new(move |_session| async move {
                    tokio::time::sleep(Duration::from_millis(32 - i)).await;
                    Ok::<_, Error>(i)
                })
                .shared()
            })
            .collect();
        let engine = Flow::new()
            .then_all(units)
            .then(LambdaUnit::new(|session| async move {
                let total: u64 = session.engine().last_data_list::<u64>().iter().sum();
                Ok::<_, Error>(total)
            }))
            .build();

        let history = engine.run().await.unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(
            history.step(0).unwrap().iter().filter_map(|r| r.data::<u64>()).copied().collect::<Vec<_>>(),
            (0..32).collect::<Vec<u64>>()
        );
        assert_eq!(history.last_data::<u64>(), Some(&(0..32).sum::<u64>()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_fan_out_fails_fast() {
        let recorder = Recorder::default();
        let finished = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let mut units: Vec<SharedUnit> = (0..8u64)
            .map(|i| {
                let finished = Arc::clone(&finished);
                LambdaUnit::new(move |_session| {
                    let finished = Arc::clone(&finished);
                    async move {
                        tokio::time::sleep(Duration::from_millis(20 + i)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, Error>(i)
                    }
                })
                .shared()
            })
            .collect();
        units.insert(
            3,
            LambdaUnit::new(|_session| async {
                Err::<u64, _>(Error::from("shard offline"))
            })
            .shared(),
        );
        let s = Arc::clone(&second);
        let engine = recorder
            .attach(Flow::new().then_all(units).then(FnUnit::new(move |session| {
                s.fetch_add(1, Ordering::SeqCst);
                session.done(());
            })))
            .build();

        let err = engine.clone().run().await.unwrap_err();
        assert_eq!(err, Error::Message("shard offline".into()));

        // Let the slower siblings report after the failure.
        while finished.load(Ordering::SeqCst) < 8 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(engine.state(), FlowState::Failed);
        assert_eq!(recorder.failure_count(), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert!(engine.history().is_empty());
        assert!(recorder.steps.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_reports_cancellation() {
        let engine = Flow::new()
            .then(LambdaUnit::new(|_session| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, Error>(())
            }))
            .build();

        let handle = engine.clone();
        let canceller = tokio::spawn(async move {
            tokio::task::yield_now().await;
            handle.cancel()
        });
        let result = engine.run().await;

        assert_eq!(result.unwrap_err(), Error::Cancelled);
        assert!(canceller.await.unwrap().is_ok());
    }
}
