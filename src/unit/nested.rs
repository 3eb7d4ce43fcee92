//! Nested flows running as a single unit.

use tracing::debug;

use super::Unit;
use crate::engine::Settled;
use crate::{Error, Flow, Session};

/// Runs a whole [`Flow`] as one opaque unit of an enclosing flow.
///
/// Every call builds a fresh engine from the blueprint, sharing the
/// enclosing engine's context. The unit succeeds with the nested
/// [`History`](crate::History) as its payload and fails with the nested
/// failing error. Cancelling the enclosing step cancels the nested engine.
pub struct FlowUnit {
    flow: Flow,
}

impl FlowUnit {
    /// Wrap a flow blueprint.
    pub fn new(flow: Flow) -> Self {
        Self { flow }
    }
}

impl Unit for FlowUnit {
    fn on_call(&self, session: Session) {
        let child = self.flow.build_within(session.engine().context());
        if !session.adopt(&child) {
            return;
        }
        debug!(flow = %self.flow.name(), parent = %session.engine().name(), "nested flow starting");

        let outer = session.clone();
        child.on_settled(move |settled| match settled {
            Settled::Done(history) => outer.done(history.clone()),
            Settled::Failed(response) => outer.fail(
                response
                    .error()
                    .cloned()
                    .unwrap_or_else(|| Error::Execution("nested flow failed".to_string())),
            ),
            Settled::Cancelled => outer.fail(Error::Cancelled),
        });
        if let Err(err) = child.start() {
            session.fail(err);
        }
    }

    fn name(&self) -> &str {
        self.flow.name()
    }
}
