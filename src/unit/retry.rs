//! The retry decorator.
//!
//! Every attempt runs in a private single-step engine built for that attempt
//! alone. The private engine is invisible to the enclosing flow, so pausing
//! the enclosing flow does not suspend a retry loop already underway.

use std::sync::{Arc, Mutex};

use tracing::debug;

use super::{ExpectedType, SharedUnit, Unit};
use crate::context::lock;
use crate::engine::Settled;
use crate::{Error, Flow, FlowEvent, FlowMetrics, Payload, Response, Session};

/// Re-runs a unit up to `max_retries` additional times after failure.
///
/// Constructed via [`UnitExt::retry`](crate::UnitExt::retry). The inner
/// unit sees the enclosing session's retry count through its own session,
/// and its `on_failure` hook fires before every retry. Once the budget is
/// spent the enclosing session fails with [`Error::RetryExhausted`] carrying
/// the last attempt's error.
pub struct Retry {
    unit: SharedUnit,
    max_retries: u32,
}

impl Retry {
    /// Wrap `unit` with a retry budget.
    pub fn new<U: Unit + 'static>(unit: U, max_retries: u32) -> Self {
        Self {
            unit: Arc::new(unit),
            max_retries,
        }
    }

    /// The configured retry budget.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

impl Unit for Retry {
    fn on_call(&self, session: Session) {
        let run = Arc::new(RetryRun {
            unit: Arc::clone(&self.unit),
            max_retries: self.max_retries,
            outer: session,
            pump: Mutex::new(Pump::default()),
        });
        run.schedule();
    }

    fn on_next(&self, session: &Session, data: &Payload) {
        self.unit.on_next(session, data);
    }

    fn expected_type(&self) -> Option<ExpectedType> {
        self.unit.expected_type()
    }

    fn name(&self) -> &str {
        self.unit.name()
    }
}

/// Runs the decorated unit inside the private engine, handing it a session
/// that answers for the enclosing one.
struct Attempt {
    unit: SharedUnit,
    outer: Session,
}

impl Unit for Attempt {
    fn on_call(&self, session: Session) {
        self.unit.on_call(Session::forwarding(&session, &self.outer));
    }

    fn expected_type(&self) -> Option<ExpectedType> {
        self.unit.expected_type()
    }

    fn name(&self) -> &str {
        self.unit.name()
    }
}

#[derive(Default)]
struct Pump {
    driving: bool,
    again: bool,
}

/// One retry loop on behalf of one enclosing session.
struct RetryRun {
    unit: SharedUnit,
    max_retries: u32,
    outer: Session,
    pump: Mutex<Pump>,
}

impl RetryRun {
    /// Run the next attempt.
    ///
    /// An attempt failing synchronously lands back here from inside
    /// `attempt`; it only flags `again` so the outer loop starts it.
    fn schedule(self: &Arc<Self>) {
        {
            let mut pump = lock(&self.pump);
            if pump.driving {
                pump.again = true;
                return;
            }
            pump.driving = true;
        }
        loop {
            self.attempt();
            let mut pump = lock(&self.pump);
            if !std::mem::take(&mut pump.again) {
                pump.driving = false;
                return;
            }
        }
    }

    fn attempt(self: &Arc<Self>) {
        if self.outer.is_inert() {
            return;
        }
        // A context of its own, so the enclosing metrics only see the retry.
        let private = Flow::new()
            .with_name(format!("retry:{}", self.unit.name()))
            .then(Attempt {
                unit: Arc::clone(&self.unit),
                outer: self.outer.clone(),
            })
            .build();
        if !self.outer.adopt(&private) {
            return;
        }

        let run = Arc::clone(self);
        private.on_settled(move |settled| match settled {
            Settled::Done(history) => {
                match history.last_step().first().and_then(Response::payload) {
                    Some(payload) => run.outer.done_payload(payload.clone()),
                    None => run.outer.done(()),
                }
            }
            Settled::Failed(response) => run.retry_or_fail(response),
            Settled::Cancelled => {}
        });
        let _ = private.start();
    }

    fn retry_or_fail(self: &Arc<Self>, response: &Response) {
        let outer = &self.outer;
        let retries = outer.retry_count();
        if retries < self.max_retries && !outer.is_inert() {
            let attempt_no = outer.bump_retry();
            debug!(
                unit = %self.unit.name(),
                attempt = attempt_no,
                max_retries = self.max_retries,
                "retrying unit"
            );
            let context = outer.engine().context();
            context.record(FlowMetrics::record_retry);
            context.emit(FlowEvent::Retry {
                unit: self.unit.name().to_string(),
                attempt: attempt_no,
            });
            self.unit.on_failure(outer, response);
            self.schedule();
        } else {
            let last = response
                .error()
                .cloned()
                .unwrap_or_else(|| Error::Execution("attempt failed".to_string()));
            outer.fail(Error::RetryExhausted {
                retries,
                last: Box::new(last),
            });
        }
    }
}
