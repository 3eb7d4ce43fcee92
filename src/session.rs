//! Per-unit completion handles.
//!
//! The engine creates one [`Session`] immediately before invoking a unit.
//! Settling it through [`Session::done`] or [`Session::fail`] is the only way
//! a unit reports its outcome.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::context::lock;
use crate::unit::SharedUnit;
use crate::{Error, FlowEngine, Payload};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// The lifetime of one dispatched step.
///
/// Closed when the step completes, fails or is cancelled. Sessions of a
/// closed scope are inert. Nested engines started inside the step are
/// registered here so closing the scope can cancel them.
pub(crate) struct StepScope {
    closed: AtomicBool,
    children: Mutex<Vec<FlowEngine>>,
}

impl StepScope {
    pub(crate) fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the scope, handing back the nested engines that were adopted.
    pub(crate) fn close(&self) -> Vec<FlowEngine> {
        let mut children = lock(&self.children);
        self.closed.store(true, Ordering::Release);
        std::mem::take(&mut *children)
    }

    /// Register a nested engine. Returns `false` if the scope already closed.
    fn adopt(&self, child: &FlowEngine) -> bool {
        let mut children = lock(&self.children);
        if self.is_closed() {
            return false;
        }
        children.push(child.clone());
        true
    }
}

struct SessionInner {
    id: u64,
    step: usize,
    index: usize,
    unit: SharedUnit,
    engine: FlowEngine,
    scope: Arc<StepScope>,
    settled: AtomicBool,
    retries: Arc<AtomicU32>,
    outer: Option<Session>,
}

/// The handle through which a unit reports its terminal outcome.
///
/// Cloning yields another handle to the same session. Only the first
/// `done`/`fail` across all clones counts; anything reported after the step
/// (or the whole engine) was cancelled or completed is ignored.
///
/// Retry decorators hand their inner unit a forwarding session: it settles
/// into the decorator's private engine, while [`engine`](Self::engine),
/// [`unit`](Self::unit) and [`retry_count`](Self::retry_count) answer for the
/// enclosing session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        engine: FlowEngine,
        scope: Arc<StepScope>,
        step: usize,
        index: usize,
        unit: SharedUnit,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
                step,
                index,
                unit,
                engine,
                scope,
                settled: AtomicBool::new(false),
                retries: Arc::new(AtomicU32::new(0)),
                outer: None,
            }),
        }
    }

    /// Wrap `inner` so its accessors answer for `outer`.
    pub(crate) fn forwarding(inner: &Session, outer: &Session) -> Self {
        let own = &inner.inner;
        Self {
            inner: Arc::new(SessionInner {
                id: own.id,
                step: own.step,
                index: own.index,
                unit: Arc::clone(&own.unit),
                engine: own.engine.clone(),
                scope: Arc::clone(&own.scope),
                settled: AtomicBool::new(false),
                retries: Arc::clone(&outer.inner.retries),
                outer: Some(outer.clone()),
            }),
        }
    }

    /// Unique identifier of this session.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Position of the owning step.
    pub fn step(&self) -> usize {
        self.inner.step
    }

    /// Position of the unit inside its step.
    pub fn index(&self) -> usize {
        self.inner.index
    }

    /// The engine this unit belongs to.
    pub fn engine(&self) -> &FlowEngine {
        match &self.inner.outer {
            Some(outer) => outer.engine(),
            None => &self.inner.engine,
        }
    }

    /// The unit this session wraps.
    pub fn unit(&self) -> &SharedUnit {
        match &self.inner.outer {
            Some(outer) => outer.unit(),
            None => &self.inner.unit,
        }
    }

    /// How many retries preceded the current attempt.
    pub fn retry_count(&self) -> u32 {
        self.inner.retries.load(Ordering::Acquire)
    }

    /// Whether anything reported through this session would be discarded.
    ///
    /// Long-running units can poll this to stop early after cancellation.
    pub fn is_inert(&self) -> bool {
        self.inner.scope.is_closed()
            || self.inner.outer.as_ref().is_some_and(Session::is_inert)
    }

    /// Complete the unit successfully with `data`.
    pub fn done<T: Any + Send + Sync>(&self, data: T) {
        self.settle(Ok(Payload::new(data)));
    }

    /// Complete the unit with an error, failing its step and the flow.
    pub fn fail(&self, error: impl Into<Error>) {
        self.settle(Err(error.into()));
    }

    pub(crate) fn done_payload(&self, payload: Payload) {
        self.settle(Ok(payload));
    }

    pub(crate) fn own_unit(&self) -> &SharedUnit {
        &self.inner.unit
    }

    pub(crate) fn scope(&self) -> &Arc<StepScope> {
        &self.inner.scope
    }

    pub(crate) fn adopt(&self, child: &FlowEngine) -> bool {
        self.inner.scope.adopt(child)
    }

    pub(crate) fn bump_retry(&self) -> u32 {
        self.inner.retries.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn settle(&self, outcome: Result<Payload, Error>) {
        if self.inner.settled.swap(true, Ordering::AcqRel) {
            trace!(session = self.inner.id, "session already settled");
            return;
        }
        self.inner.engine.settle(self, outcome);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("step", &self.inner.step)
            .field("index", &self.inner.index)
            .field("retries", &self.retry_count())
            .field("forwarding", &self.inner.outer.is_some())
            .finish()
    }
}
